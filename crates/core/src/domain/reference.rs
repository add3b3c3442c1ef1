use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Coarse category used to keep implicit context from leaking across areas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainTag {
    Logistics,
    Finance,
    Documents,
}

impl DomainTag {
    pub const ALL: [DomainTag; 3] = [Self::Logistics, Self::Finance, Self::Documents];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logistics => "logistics",
            Self::Finance => "finance",
            Self::Documents => "documents",
        }
    }

    /// Hint shown to the user when no usable reference exists for this domain.
    pub fn producer_hint(&self) -> &'static str {
        match self {
            Self::Logistics => "list your processes first (for example \"list processes\")",
            Self::Finance => "generate a financial report first (for example \"show payables\")",
            Self::Documents => "search for the document first (for example \"find invoice 123\")",
        }
    }
}

impl std::str::FromStr for DomainTag {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "logistics" | "processes" => Ok(Self::Logistics),
            "finance" => Ok(Self::Finance),
            "documents" => Ok(Self::Documents),
            other => Err(DomainError::UnknownDomainTag(other.to_string())),
        }
    }
}

impl std::fmt::Display for DomainTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReportId(pub String);

impl std::fmt::Display for ReportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token for a data view the user has seen and may refer back to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportReference {
    pub id: ReportId,
    pub domain: DomainTag,
    pub created_at: DateTime<Utc>,
    pub label: Option<String>,
}

impl ReportReference {
    pub fn new(id: impl Into<String>, domain: DomainTag, created_at: DateTime<Utc>) -> Self {
        Self { id: ReportId(id.into()), domain, created_at, label: None }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age_at(now) > max_age
    }

    /// Marker embedded in assistant history so the reference can be rebuilt later.
    pub fn history_marker(&self) -> String {
        format!("[ref:{}]", self.id.0)
    }
}

/// A report a handler produced during the turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedReport {
    pub reference: ReportReference,
    /// Active reports become the default target of follow-up requests;
    /// inactive ones are only recorded as the last visible view.
    pub activate: bool,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{DomainTag, ReportReference};

    #[test]
    fn processes_alias_maps_to_logistics() {
        assert_eq!("processes".parse::<DomainTag>().expect("alias"), DomainTag::Logistics);
        assert_eq!(" Finance ".parse::<DomainTag>().expect("trimmed"), DomainTag::Finance);
        assert!("customs".parse::<DomainTag>().is_err());
    }

    #[test]
    fn staleness_uses_strict_age_comparison() {
        let now = Utc::now();
        let max_age = Duration::minutes(30);
        let fresh = ReportReference::new("rpt-1", DomainTag::Logistics, now - max_age);
        let stale = ReportReference::new(
            "rpt-2",
            DomainTag::Logistics,
            now - max_age - Duration::seconds(1),
        );

        assert!(!fresh.is_stale_at(now, max_age));
        assert!(stale.is_stale_at(now, max_age));
    }

    #[test]
    fn history_marker_wraps_report_id() {
        let reference = ReportReference::new("rpt-77", DomainTag::Finance, Utc::now());
        assert_eq!(reference.history_marker(), "[ref:rpt-77]");
    }
}
