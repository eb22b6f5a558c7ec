// 🏷️ Category taxonomy - versioned, read-only reference data
//
// Categories carry a coarse kind (needs / wants / assets / transfers / income).
// Transfers, and anything flagged non_economic, never reach KPI aggregates.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{PipelineError, PipelineResult};

/// Code every unmatched transaction falls back to
pub const UNCATEGORIZED: &str = "uncategorized";

/// Code that is always excluded from KPIs
pub const TRANSFERS: &str = "transfers";

// ============================================================================
// CATEGORY KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    Needs,
    Wants,
    Assets,
    Transfers,
    Income,
}

impl CategoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryKind::Needs => "needs",
            CategoryKind::Wants => "wants",
            CategoryKind::Assets => "assets",
            CategoryKind::Transfers => "transfers",
            CategoryKind::Income => "income",
        }
    }
}

// ============================================================================
// CATEGORY / SUBCATEGORY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subcategory {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub code: String,
    pub name: String,
    pub kind: CategoryKind,
    /// Internal account moves and the like: real rows, but not spend or income
    #[serde(default)]
    pub non_economic: bool,
    #[serde(default)]
    pub subcategories: Vec<Subcategory>,
}

impl Category {
    pub fn new(code: &str, name: &str, kind: CategoryKind) -> Self {
        Category {
            code: code.to_string(),
            name: name.to_string(),
            kind,
            non_economic: false,
            subcategories: Vec::new(),
        }
    }

    pub fn with_subcategories(mut self, subs: &[(&str, &str)]) -> Self {
        self.subcategories = subs
            .iter()
            .map(|(code, name)| Subcategory {
                code: code.to_string(),
                name: name.to_string(),
            })
            .collect();
        self
    }

    pub fn non_economic(mut self) -> Self {
        self.non_economic = true;
        self
    }

    pub fn has_subcategory(&self, code: &str) -> bool {
        self.subcategories.iter().any(|s| s.code == code)
    }

    /// Whether rows of this category may feed spend/income aggregates
    pub fn is_kpi_eligible(&self) -> bool {
        !(self.code == TRANSFERS || self.kind == CategoryKind::Transfers || self.non_economic)
    }
}

// ============================================================================
// TAXONOMY
// ============================================================================

/// One immutable version of the category tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Taxonomy {
    pub version: u32,
    pub categories: Vec<Category>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Taxonomy {
    pub fn new(version: u32, categories: Vec<Category>) -> PipelineResult<Self> {
        let mut taxonomy = Taxonomy {
            version,
            categories,
            index: HashMap::new(),
        };
        taxonomy.rebuild_index()?;
        Ok(taxonomy)
    }

    fn rebuild_index(&mut self) -> PipelineResult<()> {
        self.index.clear();
        for (i, category) in self.categories.iter().enumerate() {
            if self.index.insert(category.code.clone(), i).is_some() {
                return Err(PipelineError::Taxonomy(format!(
                    "duplicate category code: {}",
                    category.code
                )));
            }
        }
        if !self.index.contains_key(UNCATEGORIZED) {
            return Err(PipelineError::Taxonomy(format!(
                "taxonomy v{} has no '{}' category",
                self.version, UNCATEGORIZED
            )));
        }
        Ok(())
    }

    /// Load from a JSON file: `{ "version": 2, "categories": [...] }`
    pub fn from_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read taxonomy file: {:?}", path.as_ref()))
            .map_err(|e| PipelineError::Taxonomy(format!("{:#}", e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> PipelineResult<Self> {
        let mut taxonomy: Taxonomy = serde_json::from_str(content)
            .map_err(|e| PipelineError::Taxonomy(format!("Failed to parse taxonomy JSON: {}", e)))?;
        taxonomy.rebuild_index()?;
        Ok(taxonomy)
    }

    pub fn get(&self, code: &str) -> Option<&Category> {
        self.index.get(code).map(|&i| &self.categories[i])
    }

    /// Unknown codes are treated as economic; classification never emits them
    pub fn is_kpi_eligible(&self, code: &str) -> bool {
        if code == TRANSFERS {
            return false;
        }
        self.get(code).map(Category::is_kpi_eligible).unwrap_or(true)
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    /// Built-in taxonomy
    pub fn with_defaults() -> Self {
        use CategoryKind::*;

        let categories = vec![
            Category::new("income", "Income", Income)
                .with_subcategories(&[("salary", "Salary"), ("refund", "Refunds"), ("interest", "Interest")]),
            Category::new("food_dining", "Food & Dining", Wants)
                .with_subcategories(&[("coffee", "Coffee"), ("restaurants", "Restaurants"), ("delivery", "Food Delivery")]),
            Category::new("groceries", "Groceries", Needs),
            Category::new("shopping", "Shopping", Wants)
                .with_subcategories(&[("online", "Online Shopping"), ("general", "General")]),
            Category::new("transport", "Transportation", Needs)
                .with_subcategories(&[("fuel", "Fuel"), ("rideshare", "Rideshare"), ("transit", "Public Transit")]),
            Category::new("bills_utilities", "Bills & Utilities", Needs)
                .with_subcategories(&[("electricity", "Electricity"), ("mobile", "Mobile & Internet")]),
            Category::new("healthcare", "Healthcare", Needs),
            Category::new("entertainment", "Entertainment", Wants)
                .with_subcategories(&[("streaming", "Streaming")]),
            Category::new("travel", "Travel", Wants),
            Category::new("education", "Education", Needs),
            Category::new("investments", "Investments", Assets)
                .with_subcategories(&[("mutual_funds", "Mutual Funds"), ("stocks", "Stocks")]),
            Category::new(TRANSFERS, "Transfers", Transfers)
                .with_subcategories(&[("self_transfer", "Own Account Transfer"), ("card_payment", "Credit Card Payment")])
                .non_economic(),
            Category::new(UNCATEGORIZED, "Uncategorized", Needs),
        ];

        // Built-in data is known-good: unique codes and an uncategorized entry
        let index = categories
            .iter()
            .enumerate()
            .map(|(i, c)| (c.code.clone(), i))
            .collect();
        Taxonomy {
            version: 1,
            categories,
            index,
        }
    }
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_have_required_codes() {
        let taxonomy = Taxonomy::with_defaults();
        assert!(taxonomy.get(UNCATEGORIZED).is_some());
        assert!(taxonomy.get(TRANSFERS).is_some());
        assert!(taxonomy.get("food_dining").unwrap().has_subcategory("coffee"));
    }

    #[test]
    fn test_transfers_are_never_kpi_eligible() {
        let taxonomy = Taxonomy::with_defaults();
        assert!(!taxonomy.is_kpi_eligible(TRANSFERS));
        assert!(taxonomy.is_kpi_eligible("food_dining"));
        assert!(taxonomy.is_kpi_eligible("income"));
        assert!(taxonomy.is_kpi_eligible(UNCATEGORIZED));
    }

    #[test]
    fn test_transfers_code_excluded_even_if_misconfigured() {
        let taxonomy = Taxonomy::new(
            7,
            vec![
                Category::new(TRANSFERS, "Transfers", CategoryKind::Wants),
                Category::new(UNCATEGORIZED, "Uncategorized", CategoryKind::Needs),
            ],
        )
        .unwrap();
        assert!(!taxonomy.is_kpi_eligible(TRANSFERS));
    }

    #[test]
    fn test_non_economic_flag() {
        let taxonomy = Taxonomy::new(
            2,
            vec![
                Category::new("internal_move", "Internal", CategoryKind::Assets).non_economic(),
                Category::new(UNCATEGORIZED, "Uncategorized", CategoryKind::Needs),
            ],
        )
        .unwrap();
        assert!(!taxonomy.is_kpi_eligible("internal_move"));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "version": 3,
            "categories": [
                {"code": "transfers", "name": "Transfers", "kind": "transfers"},
                {"code": "uncategorized", "name": "Uncategorized", "kind": "needs"},
                {"code": "pets", "name": "Pets", "kind": "wants",
                 "subcategories": [{"code": "vet", "name": "Vet"}]}
            ]
        }"#;
        let taxonomy = Taxonomy::from_json(json).unwrap();
        assert_eq!(taxonomy.version, 3);
        assert_eq!(taxonomy.category_count(), 3);
        assert!(taxonomy.get("pets").unwrap().has_subcategory("vet"));
    }

    #[test]
    fn test_rejects_duplicates_and_missing_fallback() {
        let dup = Taxonomy::new(
            1,
            vec![
                Category::new(UNCATEGORIZED, "A", CategoryKind::Needs),
                Category::new(UNCATEGORIZED, "B", CategoryKind::Needs),
            ],
        );
        assert!(matches!(dup, Err(PipelineError::Taxonomy(_))));

        let missing = Taxonomy::new(1, vec![Category::new("x", "X", CategoryKind::Wants)]);
        assert!(missing.is_err());
    }
}
