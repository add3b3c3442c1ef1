//! Message normalisation shared by every exact-match check in a turn
//! (confirmation replies, reset commands, precheck rules).

const TRAILING_PUNCTUATION: &[char] = &['.', '!', '?', '\u{2026}'];
const REPLY_PUNCTUATION: &[char] = &['.', '!', '\u{2026}'];

const RESET_COMMANDS: &[&str] =
    &["/reset", "/clear", "reset", "clear context", "limpar contexto", "nova conversa"];

/// Lowercases, trims, collapses internal whitespace and strips trailing
/// sentence punctuation. Accents are preserved.
pub fn normalize_message(text: &str) -> String {
    collapse(text).trim_end_matches(TRAILING_PUNCTUATION).trim_end().to_string()
}

/// Same as [`normalize_message`] but keeps a trailing `?`, so "ok?" never
/// reads as a confirmation.
pub fn normalize_reply(text: &str) -> String {
    collapse(text).trim_end_matches(REPLY_PUNCTUATION).trim_end().to_string()
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

pub fn is_reset_command(text: &str) -> bool {
    let normalized = normalize_message(text);
    RESET_COMMANDS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::{is_reset_command, normalize_message, normalize_reply};

    #[test]
    fn normalization_collapses_whitespace_and_trailing_punctuation() {
        assert_eq!(normalize_message("  Pode   PAGAR!! "), "pode pagar");
        assert_eq!(normalize_message("O que aconteceu hoje?"), "o que aconteceu hoje");
        assert_eq!(normalize_message("Não."), "não");
        assert_eq!(normalize_message("...?"), "");
    }

    #[test]
    fn reply_normalization_keeps_question_marks() {
        assert_eq!(normalize_reply(" OK? "), "ok?");
        assert_eq!(normalize_reply("Sim!!"), "sim");
        assert_eq!(normalize_reply("pode pagar?!"), "pode pagar?");
    }

    #[test]
    fn reset_requires_whole_message() {
        assert!(is_reset_command("/reset"));
        assert!(is_reset_command("Limpar contexto."));
        assert!(!is_reset_command("please reset the filter on the report"));
    }
}
