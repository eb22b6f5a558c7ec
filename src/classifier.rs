// 🗂️ Categorization Engine - taxonomy + ordered rules, immutable once built
//
// TaxonomyHandle swaps whole classifiers, so a running batch always sees a
// single taxonomy version.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use crate::config::TaxonomyConfig;
use crate::db::now_rfc3339;
use crate::error::{PipelineError, PipelineResult};
use crate::normalizer::StagingRecord;
use crate::rules::RuleEngine;
use crate::taxonomy::{Taxonomy, UNCATEGORIZED};

/// Derived classification for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category_code: String,
    pub subcategory_code: Option<String>,
    pub normalized_merchant: Option<String>,
    pub kpi_eligible: bool,
    /// No rule matched; a human should look at it
    pub needs_review: bool,
    pub rule_id: Option<String>,
    pub taxonomy_version: u32,
}

impl Classification {
    /// Same outcome ignoring which taxonomy version produced it
    pub fn same_outcome(&self, other: &Classification) -> bool {
        self.category_code == other.category_code
            && self.subcategory_code == other.subcategory_code
            && self.normalized_merchant == other.normalized_merchant
            && self.kpi_eligible == other.kpi_eligible
            && self.needs_review == other.needs_review
            && self.rule_id == other.rule_id
    }
}

pub struct Classifier {
    taxonomy: Taxonomy,
    rules: RuleEngine,
}

impl Classifier {
    /// Fails when a rule points at a code the taxonomy does not define
    pub fn new(taxonomy: Taxonomy, rules: RuleEngine) -> PipelineResult<Self> {
        rules.validate_against(&taxonomy)?;
        Ok(Classifier { taxonomy, rules })
    }

    pub fn with_defaults() -> Self {
        Classifier {
            taxonomy: Taxonomy::with_defaults(),
            rules: RuleEngine::with_defaults(),
        }
    }

    /// Built-in taxonomy/rules unless the config names files
    pub fn from_config(config: &TaxonomyConfig) -> PipelineResult<Self> {
        let taxonomy = match &config.taxonomy_path {
            Some(path) => Taxonomy::from_file(path)?,
            None => Taxonomy::with_defaults(),
        };
        let rules = match &config.rules_path {
            Some(path) => RuleEngine::from_file(path)?,
            None => RuleEngine::with_defaults(),
        };
        Self::new(taxonomy, rules)
    }

    pub fn version(&self) -> u32 {
        self.taxonomy.version
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    /// Pure and deterministic: same text and same snapshot, same answer
    pub fn classify(&self, description: &str, counterparty: Option<&str>) -> Classification {
        let merchant_text = match counterparty.map(str::trim).filter(|c| !c.is_empty()) {
            Some(cp) => format!("{} {}", cp, description.trim()),
            None => description.trim().to_string(),
        };

        let fallback_merchant = || {
            counterparty
                .and_then(normalize_merchant)
                .or_else(|| normalize_merchant(description))
        };

        match self.rules.first_match(&merchant_text) {
            Some(rule) => Classification {
                category_code: rule.category.clone(),
                subcategory_code: rule.subcategory.clone(),
                normalized_merchant: rule.merchant.clone().or_else(fallback_merchant),
                kpi_eligible: self.taxonomy.is_kpi_eligible(&rule.category),
                needs_review: false,
                rule_id: Some(rule.id.clone()),
                taxonomy_version: self.taxonomy.version,
            },
            None => Classification {
                category_code: UNCATEGORIZED.to_string(),
                subcategory_code: None,
                normalized_merchant: fallback_merchant(),
                kpi_eligible: self.taxonomy.is_kpi_eligible(UNCATEGORIZED),
                needs_review: true,
                rule_id: None,
                taxonomy_version: self.taxonomy.version,
            },
        }
    }

    pub fn classify_record(&self, record: &StagingRecord) -> Classification {
        self.classify(&record.description, record.counterparty.as_deref())
    }
}

// ============================================================================
// MERCHANT NORMALIZATION
// ============================================================================

/// Payment-rail prefixes bank narrations start with
const RAIL_PREFIXES: &[&str] = &[
    "REV-UPI-",
    "UPI-",
    "UPI/",
    "ACH D-",
    "ACH CR-",
    "NEFT CR-",
    "NEFT DR-",
    "IMPS-",
    "IB BILLPAY DR-",
    "POS ",
];

/// Clean a raw merchant or narration into a display name.
///
/// `"UPI-COFFEE CO-coffeeco@ybl-4412"` becomes `"Coffee Co"`.
pub fn normalize_merchant(raw: &str) -> Option<String> {
    let trimmed = raw.trim();

    let stripped = RAIL_PREFIXES.iter().find_map(|prefix| {
        trimmed
            .get(..prefix.len())
            .filter(|head| head.eq_ignore_ascii_case(prefix))
            .map(|_| &trimmed[prefix.len()..])
    });

    let name_words: Vec<&str> = match stripped {
        // Rail narrations are dash/slash/@ separated; the first segment with
        // real words is the counterparty
        Some(rest) => rest
            .split(|c| c == '-' || c == '/' || c == '@')
            .map(words_without_references)
            .find(|words| !words.is_empty())
            .unwrap_or_default(),
        None => {
            let mut words: Vec<&str> = trimmed.split_whitespace().collect();
            while words.last().map_or(false, |w| is_reference(w)) {
                words.pop();
            }
            words
        }
    };

    let name = name_words
        .iter()
        .map(|word| title_case(word))
        .collect::<Vec<_>>()
        .join(" ");

    if name.chars().filter(|c| c.is_alphabetic()).count() < 2 {
        None
    } else {
        Some(name)
    }
}

fn words_without_references(segment: &str) -> Vec<&str> {
    segment
        .split_whitespace()
        .filter(|w| !is_reference(w))
        .collect()
}

/// Card numbers, UTRs, "#4521", masked "XXXX1234"
fn is_reference(word: &str) -> bool {
    word.chars().any(|c| c.is_ascii_digit())
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

// ============================================================================
// TAXONOMY HANDLE
// ============================================================================

/// Current classifier snapshot, replaced wholesale on taxonomy install
pub struct TaxonomyHandle {
    current: RwLock<Arc<Classifier>>,
}

impl TaxonomyHandle {
    pub fn new(classifier: Classifier) -> Self {
        TaxonomyHandle {
            current: RwLock::new(Arc::new(classifier)),
        }
    }

    pub fn snapshot(&self) -> PipelineResult<Arc<Classifier>> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| PipelineError::Taxonomy("taxonomy lock poisoned".to_string()))
    }

    /// Existing enrichment rows are left alone until a re-classification pass
    pub fn install(&self, classifier: Classifier) -> PipelineResult<u32> {
        let version = classifier.version();
        let mut guard = self
            .current
            .write()
            .map_err(|_| PipelineError::Taxonomy("taxonomy lock poisoned".to_string()))?;
        *guard = Arc::new(classifier);
        tracing::info!(taxonomy_version = version, "installed taxonomy");
        Ok(version)
    }
}

impl Default for TaxonomyHandle {
    fn default() -> Self {
        Self::new(Classifier::with_defaults())
    }
}

// ============================================================================
// ENRICHMENT PERSISTENCE
// ============================================================================

/// Insert or overwrite the enrichment row. The only writer of
/// `enriched_transactions`.
pub(crate) fn write_enrichment(
    conn: &Connection,
    transaction_id: &str,
    classification: &Classification,
) -> PipelineResult<()> {
    conn.execute(
        "INSERT INTO enriched_transactions (
            transaction_id, category_code, subcategory_code, merchant,
            kpi_eligible, needs_review, rule_id, taxonomy_version, classified_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(transaction_id) DO UPDATE SET
            category_code = excluded.category_code,
            subcategory_code = excluded.subcategory_code,
            merchant = excluded.merchant,
            kpi_eligible = excluded.kpi_eligible,
            needs_review = excluded.needs_review,
            rule_id = excluded.rule_id,
            taxonomy_version = excluded.taxonomy_version,
            classified_at = excluded.classified_at",
        params![
            transaction_id,
            classification.category_code,
            classification.subcategory_code,
            classification.normalized_merchant,
            classification.kpi_eligible,
            classification.needs_review,
            classification.rule_id,
            classification.taxonomy_version,
            now_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Stored enrichment for a transaction, if any
pub fn read_enrichment(
    conn: &Connection,
    transaction_id: &str,
) -> PipelineResult<Option<Classification>> {
    let row = conn
        .query_row(
            "SELECT category_code, subcategory_code, merchant, kpi_eligible,
                    needs_review, rule_id, taxonomy_version
             FROM enriched_transactions WHERE transaction_id = ?1",
            params![transaction_id],
            |row| {
                Ok(Classification {
                    category_code: row.get(0)?,
                    subcategory_code: row.get(1)?,
                    normalized_merchant: row.get(2)?,
                    kpi_eligible: row.get(3)?,
                    needs_review: row.get(4)?,
                    rule_id: row.get(5)?,
                    taxonomy_version: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ClassificationRule;
    use crate::taxonomy::{Category, CategoryKind, TRANSFERS};

    #[test]
    fn test_transfer_is_not_kpi_eligible() {
        let classifier = Classifier::with_defaults();
        let c = classifier.classify("Transfer to Savings", None);

        assert_eq!(c.category_code, TRANSFERS);
        assert!(!c.kpi_eligible);
        assert!(!c.needs_review);
        assert_eq!(c.rule_id.as_deref(), Some("transfer-to"));
    }

    #[test]
    fn test_unmatched_falls_back_to_uncategorized_for_review() {
        let classifier = Classifier::with_defaults();
        let c = classifier.classify("ZXQ HOLDINGS 000123", None);

        assert_eq!(c.category_code, UNCATEGORIZED);
        assert!(c.needs_review);
        assert!(c.kpi_eligible);
        assert_eq!(c.rule_id, None);
        assert_eq!(c.normalized_merchant.as_deref(), Some("Zxq Holdings"));
    }

    #[test]
    fn test_counterparty_takes_part_in_matching() {
        let classifier = Classifier::with_defaults();
        let c = classifier.classify("CARD POS 1234", Some("Coffee Co"));

        assert_eq!(c.category_code, "food_dining");
        assert_eq!(c.subcategory_code.as_deref(), Some("coffee"));
        assert_eq!(c.normalized_merchant.as_deref(), Some("Coffee Co"));
    }

    #[test]
    fn test_rule_merchant_wins() {
        let classifier = Classifier::with_defaults();
        let c = classifier.classify("UPI-STARBUCKS INDIA-sb@hdfc-9981", None);
        assert_eq!(c.normalized_merchant.as_deref(), Some("Starbucks"));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = Classifier::with_defaults();
        let first = classifier.classify("Salary credit ACME", Some("ACME"));
        let second = classifier.classify("Salary credit ACME", Some("ACME"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_new_rejects_rules_with_unknown_codes() {
        let rules = RuleEngine::from_rules(vec![ClassificationRule::new("r", "x", "nope")]);
        let result = Classifier::new(Taxonomy::with_defaults(), rules);
        assert!(matches!(result, Err(PipelineError::Taxonomy(_))));
    }

    #[test]
    fn test_non_economic_category_flag_flows_through() {
        let taxonomy = Taxonomy::new(
            4,
            vec![
                Category::new("wallet_topup", "Wallet", CategoryKind::Assets).non_economic(),
                Category::new(UNCATEGORIZED, "Uncategorized", CategoryKind::Needs),
            ],
        )
        .unwrap();
        let rules =
            RuleEngine::from_rules(vec![ClassificationRule::new("w", "wallet load", "wallet_topup")]);
        let classifier = Classifier::new(taxonomy, rules).unwrap();

        let c = classifier.classify("Paytm WALLET LOAD", None);
        assert_eq!(c.category_code, "wallet_topup");
        assert!(!c.kpi_eligible);
        assert_eq!(c.taxonomy_version, 4);
    }

    #[test]
    fn test_normalize_merchant() {
        assert_eq!(
            normalize_merchant("UPI-COFFEE CO-coffeeco@ybl-4412").as_deref(),
            Some("Coffee Co")
        );
        assert_eq!(
            normalize_merchant("NEFT CR-IDFB0010204-MAGNATEPOINT TECH-VENKATA").as_deref(),
            Some("Magnatepoint Tech")
        );
        assert_eq!(
            normalize_merchant("ACH D- NSECLEARINGLIMITED-3142768919").as_deref(),
            Some("Nseclearinglimited")
        );
        assert_eq!(normalize_merchant("Big   Bazaar #4521").as_deref(), Some("Big Bazaar"));
        assert_eq!(normalize_merchant("Coca-Cola Store").as_deref(), Some("Coca-cola Store"));
        assert_eq!(normalize_merchant("  123456 "), None);
    }

    #[test]
    fn test_handle_install_swaps_snapshot() {
        let handle = TaxonomyHandle::default();
        let before = handle.snapshot().unwrap();
        assert_eq!(before.version(), 1);

        let mut taxonomy = Taxonomy::with_defaults();
        taxonomy.version = 2;
        handle
            .install(Classifier::new(taxonomy, RuleEngine::with_defaults()).unwrap())
            .unwrap();

        assert_eq!(handle.snapshot().unwrap().version(), 2);
        // Old snapshot holders are unaffected
        assert_eq!(before.version(), 1);
    }

    #[test]
    fn test_enrichment_upsert() {
        let db = crate::db::LedgerDb::open_in_memory().unwrap();
        let classifier = Classifier::with_defaults();

        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fact_transactions (transaction_id, fingerprint, amount, direction,
                    currency, txn_date, description, source_kind, batch_id, created_at)
                 VALUES ('t1', 'fp1', '-50', 'debit', 'INR', '2024-01-01', 'Coffee Co', 'csv', 'b1', 'now')",
                [],
            )?;
            write_enrichment(conn, "t1", &classifier.classify("mystery", None))?;
            write_enrichment(conn, "t1", &classifier.classify("Coffee Co", None))?;
            Ok(())
        })
        .unwrap();

        let stored = db.with_conn(|conn| read_enrichment(conn, "t1")).unwrap().unwrap();
        assert_eq!(stored.category_code, "food_dining");
        assert!(!stored.needs_review);

        let missing = db.with_conn(|conn| read_enrichment(conn, "t2")).unwrap();
        assert!(missing.is_none());
    }
}
