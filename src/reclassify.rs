// Re-classification pass: re-derive every enrichment row from its fact row
// with the current taxonomy snapshot. Explicit operator action, never implicit.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::classifier::{read_enrichment, write_enrichment, Classifier};
use crate::db::{insert_event, Event, LedgerDb};
use crate::error::PipelineResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclassifyReport {
    pub taxonomy_version: u32,
    pub scanned: u64,
    /// Rows whose category, merchant or flags actually changed
    pub changed: u64,
}

/// Rows re-derived per transaction, so concurrent batches interleave
const CHUNK: usize = 200;

pub struct Reclassifier {
    db: LedgerDb,
    classifier: Arc<Classifier>,
}

impl Reclassifier {
    pub fn new(db: LedgerDb, classifier: Arc<Classifier>) -> Self {
        Reclassifier { db, classifier }
    }

    /// Deterministic and idempotent: a second run reports `changed == 0`
    #[instrument(skip(self), fields(taxonomy_version = self.classifier.version()))]
    pub fn run(&self) -> PipelineResult<ReclassifyReport> {
        let mut report = ReclassifyReport {
            taxonomy_version: self.classifier.version(),
            ..Default::default()
        };
        let mut after: Option<String> = None;

        loop {
            let facts: Vec<(String, String, Option<String>)> = self.db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT transaction_id, description, counterparty FROM fact_transactions
                     WHERE transaction_id > ?1 ORDER BY transaction_id LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![after.as_deref().unwrap_or(""), CHUNK as i64],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })?;

            let Some(last) = facts.last() else { break };
            after = Some(last.0.clone());

            let changed = self.db.with_tx(|tx| {
                let mut changed = 0;
                for (transaction_id, description, counterparty) in &facts {
                    let fresh = self.classifier.classify(description, counterparty.as_deref());
                    let differs = match read_enrichment(tx, transaction_id)? {
                        Some(existing) => !existing.same_outcome(&fresh),
                        None => true,
                    };
                    write_enrichment(tx, transaction_id, &fresh)?;
                    if differs {
                        changed += 1;
                    }
                }
                Ok(changed)
            })?;

            report.scanned += facts.len() as u64;
            report.changed += changed;
        }

        self.db.with_conn(|conn| {
            insert_event(
                conn,
                &Event::new(
                    "reclassified",
                    "ledger",
                    "enriched_transactions",
                    serde_json::to_value(&report)?,
                    "reclassifier",
                ),
            )
        })?;

        info!(scanned = report.scanned, changed = report.changed, "reclassification finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{ClassificationRule, RuleEngine};
    use crate::taxonomy::Taxonomy;

    fn seed(db: &LedgerDb, classifier: &Classifier) {
        db.with_conn(|conn| {
            for (id, description) in [("t1", "Coffee Co"), ("t2", "Chai Point"), ("t3", "Rent")] {
                conn.execute(
                    "INSERT INTO fact_transactions (transaction_id, fingerprint, amount, direction,
                        currency, txn_date, description, source_kind, batch_id, created_at)
                     VALUES (?1, ?2, '-10', 'debit', 'INR', '2024-01-01', ?3, 'csv', 'b', 'now')",
                    rusqlite::params![id, format!("fp-{}", id), description],
                )?;
                write_enrichment(conn, id, &classifier.classify(description, None))?;
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_reclassify_picks_up_new_rules_and_is_idempotent() {
        let db = LedgerDb::open_in_memory().unwrap();
        seed(&db, &Classifier::with_defaults());

        let mut taxonomy = Taxonomy::with_defaults();
        taxonomy.version = 2;
        let mut rules = RuleEngine::with_defaults();
        rules.add_rule(ClassificationRule::new("chai", "chai", "food_dining").subcategory("coffee"));
        let v2 = Arc::new(Classifier::new(taxonomy, rules).unwrap());

        let first = Reclassifier::new(db.clone(), Arc::clone(&v2)).run().unwrap();
        assert_eq!(first.scanned, 3);
        assert_eq!(first.changed, 1);
        assert_eq!(first.taxonomy_version, 2);

        let second = Reclassifier::new(db.clone(), v2).run().unwrap();
        assert_eq!(second.scanned, 3);
        assert_eq!(second.changed, 0);

        let chai = db
            .with_conn(|c| read_enrichment(c, "t2"))
            .unwrap()
            .unwrap();
        assert_eq!(chai.category_code, "food_dining");
        assert!(!chai.needs_review);
        assert_eq!(chai.taxonomy_version, 2);
    }
}
