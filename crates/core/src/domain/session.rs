use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::reference::{DomainTag, IssuedReport, ReportReference};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
    pub domain: Option<DomainTag>,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self { role: Role::User, text: text.into(), at, domain: None }
    }

    pub fn assistant(
        text: impl Into<String>,
        at: DateTime<Utc>,
        domain: Option<DomainTag>,
    ) -> Self {
        Self { role: Role::Assistant, text: text.into(), at, domain }
    }
}

/// Conversation state of one session. Passed explicitly into every component;
/// `version` is bumped by the repository on each successful save.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub version: u64,
    pub active_references: BTreeMap<DomainTag, ReportReference>,
    pub visible_references: BTreeMap<DomainTag, ReportReference>,
    pub history: Vec<HistoryEntry>,
}

impl SessionState {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            version: 0,
            active_references: BTreeMap::new(),
            visible_references: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    pub fn active_reference(&self, domain: DomainTag) -> Option<&ReportReference> {
        self.active_references.get(&domain)
    }

    pub fn visible_reference(&self, domain: DomainTag) -> Option<&ReportReference> {
        self.visible_references.get(&domain)
    }

    pub fn record_report(&mut self, issued: IssuedReport) {
        let domain = issued.reference.domain;
        if issued.activate {
            self.active_references.insert(domain, issued.reference.clone());
        }
        self.visible_references.insert(domain, issued.reference);
    }

    /// Appends an entry, keeping at most `retention` of the most recent ones.
    pub fn push_history(&mut self, entry: HistoryEntry, retention: usize) {
        self.history.push(entry);
        if self.history.len() > retention {
            let overflow = self.history.len() - retention;
            self.history.drain(..overflow);
        }
    }

    /// Drops references and history; the version is kept so the next save
    /// still goes through the optimistic check.
    pub fn clear(&mut self) {
        self.active_references.clear();
        self.visible_references.clear();
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{HistoryEntry, SessionId, SessionState};
    use crate::domain::reference::{DomainTag, IssuedReport, ReportReference};

    #[test]
    fn inactive_report_only_updates_visible_slot() {
        let mut state = SessionState::new(SessionId::from("s-1"));
        let now = Utc::now();

        state.record_report(IssuedReport {
            reference: ReportReference::new("rpt-1", DomainTag::Logistics, now),
            activate: true,
        });
        state.record_report(IssuedReport {
            reference: ReportReference::new("rpt-2", DomainTag::Logistics, now),
            activate: false,
        });

        assert_eq!(
            state.active_reference(DomainTag::Logistics).map(|r| r.id.0.as_str()),
            Some("rpt-1")
        );
        assert_eq!(
            state.visible_reference(DomainTag::Logistics).map(|r| r.id.0.as_str()),
            Some("rpt-2")
        );
        assert!(state.active_reference(DomainTag::Finance).is_none());
    }

    #[test]
    fn history_retention_drops_oldest_entries() {
        let mut state = SessionState::new(SessionId::from("s-2"));
        let now = Utc::now();
        for index in 0..5 {
            state.push_history(HistoryEntry::user(format!("message {index}"), now), 3);
        }

        let texts = state.history.iter().map(|entry| entry.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["message 2", "message 3", "message 4"]);
    }

    #[test]
    fn clear_keeps_version() {
        let mut state = SessionState::new(SessionId::from("s-3"));
        state.version = 4;
        state.push_history(HistoryEntry::user("hello", Utc::now()), 10);
        state.clear();

        assert_eq!(state.version, 4);
        assert!(state.history.is_empty());
    }
}
