use regex::Regex;
use tracing::debug;

use despacho_core::domain::tool::ToolCall;

use crate::conversation::normalize_message;

/// A literal request that maps straight to fixed tool calls.
#[derive(Clone, Debug)]
pub struct PrecheckRule {
    name: String,
    pattern: Regex,
    calls: Vec<ToolCall>,
}

impl PrecheckRule {
    /// `pattern` is anchored to the whole normalised message.
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        calls: Vec<ToolCall>,
    ) -> Result<Self, regex::Error> {
        let anchored = format!("^(?:{pattern})$");
        Ok(Self { name: name.into(), pattern: Regex::new(&anchored)?, calls })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PrecheckMatch {
    pub rule: String,
    pub calls: Vec<ToolCall>,
}

/// Ordered rules; the first match wins.
#[derive(Clone, Debug, Default)]
pub struct PrecheckRules {
    rules: Vec<PrecheckRule>,
}

impl PrecheckRules {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Result<Self, regex::Error> {
        Ok(Self::empty()
            .with_rule(PrecheckRule::new(
                "daily_summary",
                r"(what happened today|o que aconteceu hoje|resumo do dia|daily summary)",
                vec![ToolCall::new("daily_summary")],
            )?)
            .with_rule(PrecheckRule::new(
                "list_processes",
                r"(list (my |the |all )?processes|listar (os |meus )?processos|show (my )?processes)",
                vec![ToolCall::new("list_processes")],
            )?))
    }

    pub fn with_rule(mut self, rule: PrecheckRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn match_message(&self, message: &str) -> Option<PrecheckMatch> {
        let normalized = normalize_message(message);
        let rule = self.rules.iter().find(|rule| rule.pattern.is_match(&normalized))?;
        debug!(event_name = "precheck.matched", rule = %rule.name, "precheck rule matched");
        Some(PrecheckMatch { rule: rule.name.clone(), calls: rule.calls.clone() })
    }
}

#[cfg(test)]
mod tests {
    use despacho_core::domain::tool::ToolCall;

    use super::{PrecheckRule, PrecheckRules};

    fn rules() -> PrecheckRules {
        PrecheckRules::builtin().expect("builtin rules compile")
    }

    #[test]
    fn daily_summary_matches_both_languages() {
        for message in ["What happened today?", "  o que   aconteceu hoje ", "Resumo do dia!"] {
            let matched = rules().match_message(message).expect("rule should match");
            assert_eq!(matched.rule, "daily_summary");
            assert_eq!(matched.calls, vec![ToolCall::new("daily_summary")]);
        }
    }

    #[test]
    fn list_processes_matches_variants() {
        for message in ["list processes", "List my processes.", "listar processos"] {
            let matched = rules().match_message(message).expect("rule should match");
            assert_eq!(matched.calls[0].name, "list_processes");
        }
    }

    #[test]
    fn partial_sentences_do_not_match() {
        assert!(rules().match_message("what happened today with invoice 42").is_none());
        assert!(rules().match_message("please list processes for acme").is_none());
        assert!(rules().match_message("ok").is_none());
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = PrecheckRules::empty()
            .with_rule(PrecheckRule::new("first", "ping", vec![ToolCall::new("a")]).expect("rule"))
            .with_rule(PrecheckRule::new("second", "ping|pong", vec![ToolCall::new("b")]).expect("rule"));

        assert_eq!(rules.match_message("ping").map(|m| m.rule), Some("first".to_string()));
        assert_eq!(rules.match_message("pong").map(|m| m.rule), Some("second".to_string()));
        assert_eq!(rules.len(), 2);
    }
}
