// 🏷️ Classification Rules - Rules as Data
// Ordered merchant-text patterns mapping onto taxonomy codes

use serde::{Deserialize, Serialize};
use anyhow::Context as AnyhowContext;
use std::cmp::Reverse;
use std::fs;
use std::path::Path;

use crate::error::{PipelineError, PipelineResult};
use crate::taxonomy::Taxonomy;

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// Rule ID, stamped on every enrichment it produces
    pub id: String,

    /// Pattern to match (supports wildcards with *)
    pub pattern: String,

    /// Taxonomy category code
    pub category: String,

    #[serde(default)]
    pub subcategory: Option<String>,

    /// Normalized merchant name
    #[serde(default)]
    pub merchant: Option<String>,

    /// Higher wins among rules of equal specificity
    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_priority() -> i32 {
    0
}

impl ClassificationRule {
    pub fn new(id: &str, pattern: &str, category: &str) -> Self {
        ClassificationRule {
            id: id.to_string(),
            pattern: pattern.to_string(),
            category: category.to_string(),
            subcategory: None,
            merchant: None,
            priority: 0,
            description: None,
        }
    }

    pub fn subcategory(mut self, code: &str) -> Self {
        self.subcategory = Some(code.to_string());
        self
    }

    pub fn merchant(mut self, name: &str) -> Self {
        self.merchant = Some(name.to_string());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Check if pattern matches the given text (case-insensitive).
    ///
    /// Without `*` the pattern matches anywhere in the text. With `*` the
    /// literal segments must appear in order, anchored at the start and end
    /// unless the pattern begins or ends with `*`.
    pub fn matches(&self, text: &str) -> bool {
        let pattern = self.pattern.to_lowercase();
        let text = text.to_lowercase();

        if !pattern.contains('*') {
            return !pattern.is_empty() && text.contains(&pattern);
        }

        let parts: Vec<&str> = pattern.split('*').collect();
        let first = parts[0];
        let last = parts[parts.len() - 1];

        if !text.starts_with(first) {
            return false;
        }
        let mut pos = first.len();

        for part in &parts[1..parts.len() - 1] {
            if part.is_empty() {
                continue;
            }
            match text[pos..].find(part) {
                Some(found) => pos += found + part.len(),
                None => return false,
            }
        }

        // The tail segment must not overlap what the head already consumed
        text.len() >= pos + last.len() && text.ends_with(last)
    }

    /// Number of literal characters; longer patterns are more specific
    pub fn specificity(&self) -> usize {
        self.pattern.chars().filter(|c| *c != '*').count()
    }
}

// ============================================================================
// RULE ENGINE
// ============================================================================

/// Rules kept in evaluation order: specificity desc, priority desc, then
/// insertion order. The first match wins.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<ClassificationRule>,
}

impl RuleEngine {
    /// Create a new empty rule engine
    pub fn new() -> Self {
        RuleEngine { rules: Vec::new() }
    }

    /// Load rules from a JSON array
    pub fn from_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))
            .map_err(|e| PipelineError::Taxonomy(format!("{:#}", e)))?;

        let rules: Vec<ClassificationRule> = serde_json::from_str(&content)
            .map_err(|e| PipelineError::Taxonomy(format!("Failed to parse rules JSON: {}", e)))?;

        Ok(RuleEngine::from_rules(rules))
    }

    /// Create engine from a list of rules; list position is the insertion order
    pub fn from_rules(rules: Vec<ClassificationRule>) -> Self {
        let mut engine = RuleEngine { rules };
        engine.sort();
        engine
    }

    /// Add a single rule after all existing ones
    pub fn add_rule(&mut self, rule: ClassificationRule) {
        self.rules.push(rule);
        self.sort();
    }

    // Vec::sort_by_key is stable, so equal keys keep insertion order
    fn sort(&mut self) {
        self.rules
            .sort_by_key(|rule| (Reverse(rule.specificity()), Reverse(rule.priority)));
    }

    /// First rule matching the merchant text
    pub fn first_match(&self, text: &str) -> Option<&ClassificationRule> {
        self.rules.iter().find(|rule| rule.matches(text))
    }

    /// Every rule must point at codes that exist in the taxonomy
    pub fn validate_against(&self, taxonomy: &Taxonomy) -> PipelineResult<()> {
        for rule in &self.rules {
            let category = taxonomy.get(&rule.category).ok_or_else(|| {
                PipelineError::Taxonomy(format!(
                    "rule '{}' references unknown category '{}'",
                    rule.id, rule.category
                ))
            })?;

            if let Some(sub) = &rule.subcategory {
                if !category.has_subcategory(sub) {
                    return Err(PipelineError::Taxonomy(format!(
                        "rule '{}' references unknown subcategory '{}/{}'",
                        rule.id, rule.category, sub
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Get number of rules loaded
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Built-in rules that pair with [`Taxonomy::with_defaults`]
    pub fn with_defaults() -> Self {
        let r = ClassificationRule::new;
        RuleEngine::from_rules(vec![
            r("transfer-to", "transfer to", "transfers").subcategory("self_transfer"),
            r("transfer-from", "transfer from", "transfers").subcategory("self_transfer"),
            r("self-transfer", "self transfer", "transfers").subcategory("self_transfer"),
            r("own-account", "own account", "transfers").subcategory("self_transfer"),
            r("card-payment", "credit card payment", "transfers").subcategory("card_payment"),
            r("salary", "salary", "income").subcategory("salary").priority(10),
            r("refund", "refund", "income").subcategory("refund"),
            r("interest", "interest credit", "income").subcategory("interest"),
            r("coffee", "coffee", "food_dining").subcategory("coffee"),
            r("cafe", "cafe", "food_dining").subcategory("coffee"),
            r("starbucks", "starbucks", "food_dining").subcategory("coffee").merchant("Starbucks"),
            r("swiggy", "swiggy", "food_dining").subcategory("delivery").merchant("Swiggy"),
            r("zomato", "zomato", "food_dining").subcategory("delivery").merchant("Zomato"),
            r("restaurant", "restaurant", "food_dining").subcategory("restaurants"),
            r("bigbasket", "bigbasket", "groceries").merchant("BigBasket"),
            r("grocery", "grocery", "groceries"),
            r("supermarket", "supermarket", "groceries"),
            r("amazon", "amazon", "shopping").subcategory("online").merchant("Amazon"),
            r("flipkart", "flipkart", "shopping").subcategory("online").merchant("Flipkart"),
            r("uber", "uber", "transport").subcategory("rideshare").merchant("Uber"),
            r("ola", "ola cabs", "transport").subcategory("rideshare").merchant("Ola"),
            r("fuel", "fuel", "transport").subcategory("fuel"),
            r("petrol", "petrol", "transport").subcategory("fuel"),
            r("metro", "metro", "transport").subcategory("transit"),
            r("electricity", "electricity", "bills_utilities").subcategory("electricity"),
            r("airtel", "airtel", "bills_utilities").subcategory("mobile").merchant("Airtel"),
            r("jio", "jio", "bills_utilities").subcategory("mobile").merchant("Jio"),
            r("pharmacy", "pharmacy", "healthcare"),
            r("hospital", "hospital", "healthcare"),
            r("netflix", "netflix", "entertainment").subcategory("streaming").merchant("Netflix"),
            r("spotify", "spotify", "entertainment").subcategory("streaming").merchant("Spotify"),
            r("airline", "airlines", "travel"),
            r("hotel", "hotel", "travel"),
            r("tuition", "tuition", "education"),
            r("mutual-fund", "mutual fund", "investments").subcategory("mutual_funds"),
            r("sip", "sip*", "investments").subcategory("mutual_funds"),
            r("zerodha", "zerodha", "investments").subcategory("stocks").merchant("Zerodha"),
        ])
    }
}

// ============================================================================
// TESTS
// ============================================================================
