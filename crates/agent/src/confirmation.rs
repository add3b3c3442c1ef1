use std::collections::{BTreeMap, BTreeSet};

use despacho_core::domain::pending::PendingActionKind;

use crate::conversation::normalize_reply;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationVerdict {
    Confirm,
    Deny,
    Unknown,
}

/// Exact phrases accepted as a confirmation or a denial for one action kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vocabulary {
    confirm: BTreeSet<String>,
    deny: BTreeSet<String>,
}

impl Vocabulary {
    pub fn new<C, D, S>(confirm: C, deny: D) -> Self
    where
        C: IntoIterator<Item = S>,
        D: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            confirm: confirm.into_iter().map(|phrase| normalize_reply(phrase.as_ref())).collect(),
            deny: deny.into_iter().map(|phrase| normalize_reply(phrase.as_ref())).collect(),
        }
    }

    fn classify_normalized(&self, normalized: &str) -> ConfirmationVerdict {
        match (self.confirm.contains(normalized), self.deny.contains(normalized)) {
            (true, false) => ConfirmationVerdict::Confirm,
            (false, true) => ConfirmationVerdict::Deny,
            _ => ConfirmationVerdict::Unknown,
        }
    }
}

/// Classifies a reply against the allowlist of one pending action kind.
///
/// Matching is on the whole normalised message, never on substrings, so
/// "simpático" or "ok, but first show me the invoice" stay `Unknown`.
#[derive(Clone, Debug)]
pub struct ConfirmationMatcher {
    vocabularies: BTreeMap<PendingActionKind, Vocabulary>,
}

impl Default for ConfirmationMatcher {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ConfirmationMatcher {
    pub fn empty() -> Self {
        Self { vocabularies: BTreeMap::new() }
    }

    pub fn builtin() -> Self {
        Self::empty()
            .with_vocabulary(
                PendingActionKind::Payment,
                Vocabulary::new(
                    [
                        "sim", "ok", "okay", "pagar", "pode pagar", "confirmar", "confirmo",
                        "confirmado", "yes", "pay", "confirm",
                    ],
                    [
                        "não", "nao", "cancelar", "cancela", "não pagar", "nao pagar", "no",
                        "cancel", "don't pay",
                    ],
                ),
            )
            .with_vocabulary(
                PendingActionKind::DocumentRegistration,
                Vocabulary::new(
                    [
                        "sim", "ok", "okay", "registrar", "pode registrar", "confirmar", "confirmo",
                        "yes", "register", "confirm",
                    ],
                    ["não", "nao", "cancelar", "cancela", "não registrar", "no", "cancel"],
                ),
            )
            .with_vocabulary(
                PendingActionKind::Communication,
                Vocabulary::new(
                    [
                        "sim", "ok", "okay", "enviar", "pode enviar", "manda", "confirmar", "yes",
                        "send", "confirm",
                    ],
                    [
                        "não", "nao", "cancelar", "cancela", "não enviar", "nao enviar", "no",
                        "cancel", "don't send",
                    ],
                ),
            )
    }

    pub fn with_vocabulary(mut self, kind: PendingActionKind, vocabulary: Vocabulary) -> Self {
        self.vocabularies.insert(kind, vocabulary);
        self
    }

    pub fn classify(&self, message: &str, kind: PendingActionKind) -> ConfirmationVerdict {
        let normalized = normalize_reply(message);
        if normalized.is_empty() {
            return ConfirmationVerdict::Unknown;
        }

        self.vocabularies
            .get(&kind)
            .map(|vocabulary| vocabulary.classify_normalized(&normalized))
            .unwrap_or(ConfirmationVerdict::Unknown)
    }
}
