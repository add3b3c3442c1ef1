use serde::Serialize;
use serde_json::{json, Value};

/// How hard the catalog tries to keep a tool when the model's limit is hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogPriority {
    /// Payments and anything that creates or confirms a pending action.
    Critical,
    Standard,
    Optional,
}

/// Model-facing description of one tool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub group: String,
    pub description: String,
    pub parameters: Value,
    pub priority: CatalogPriority,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            description: description.into(),
            parameters: json!({ "type": "object", "properties": {} }),
            priority: CatalogPriority::Standard,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_priority(mut self, priority: CatalogPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn critical(self) -> Self {
        self.with_priority(CatalogPriority::Critical)
    }

    pub fn optional(self) -> Self {
        self.with_priority(CatalogPriority::Optional)
    }
}

/// Registration-ordered set of tool specs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolCatalog {
    specs: Vec<ToolSpec>,
}

impl ToolCatalog {
    pub(crate) fn push(&mut self, spec: ToolSpec) {
        self.specs.push(spec);
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    pub fn all(&self) -> &[ToolSpec] {
        &self.specs
    }

    /// At most `limit` specs, critical ones first. Critical specs are kept even
    /// when they alone exceed the limit; lower tiers fill what remains, each in
    /// registration order.
    pub fn select(&self, limit: usize) -> Vec<ToolSpec> {
        let mut selected: Vec<ToolSpec> = self
            .specs
            .iter()
            .filter(|spec| spec.priority == CatalogPriority::Critical)
            .cloned()
            .collect();

        for tier in [CatalogPriority::Standard, CatalogPriority::Optional] {
            for spec in self.specs.iter().filter(|spec| spec.priority == tier) {
                if selected.len() >= limit {
                    return selected;
                }
                selected.push(spec.clone());
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::{CatalogPriority, ToolCatalog, ToolSpec};

    fn catalog() -> ToolCatalog {
        let mut catalog = ToolCatalog::default();
        catalog.push(ToolSpec::new("list_processes", "logistics", "List open processes"));
        catalog.push(ToolSpec::new("daily_summary", "logistics", "Summarise today").optional());
        catalog.push(ToolSpec::new("pay_invoice", "finance", "Pay an invoice").critical());
        catalog.push(ToolSpec::new("filter_process_report", "logistics", "Filter a report"));
        catalog.push(ToolSpec::new("register_document", "documents", "Register").critical());
        catalog
    }

    fn names(specs: &[ToolSpec]) -> Vec<&str> {
        specs.iter().map(|spec| spec.name.as_str()).collect()
    }

    #[test]
    fn select_orders_by_priority_then_registration() {
        let selected = catalog().select(10);
        assert_eq!(
            names(&selected),
            vec![
                "pay_invoice",
                "register_document",
                "list_processes",
                "filter_process_report",
                "daily_summary"
            ]
        );
    }

    #[test]
    fn select_drops_lowest_priority_first() {
        let selected = catalog().select(3);
        assert_eq!(names(&selected), vec!["pay_invoice", "register_document", "list_processes"]);
        assert!(selected.iter().all(|spec| spec.priority != CatalogPriority::Optional));
    }

    #[test]
    fn critical_entries_survive_a_limit_below_their_count() {
        let selected = catalog().select(1);
        assert_eq!(names(&selected), vec!["pay_invoice", "register_document"]);
    }

    #[test]
    fn lookup_by_name() {
        let catalog = catalog();
        assert_eq!(catalog.len(), 5);
        assert_eq!(catalog.get("pay_invoice").map(|spec| spec.group.as_str()), Some("finance"));
        assert!(catalog.get("unknown").is_none());
    }
}
