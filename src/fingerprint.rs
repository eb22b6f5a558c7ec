// 🔑 Fingerprint Engine - content-addressed identity for deduplication
// The same statement line arriving via CSV, PDF or e-mail must hash to the same key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::normalizer::StagingRecord;

/// SHA-256 hex digest of the economically meaningful fields
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FingerprintKey(String);

impl FingerprintKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for FingerprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Case-fold and collapse whitespace
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compute the dedup key.
///
/// Inputs: signed amount (canonical decimal form), currency, date, account
/// reference and the normalized payee (description when there is none).
/// Batch id, source kind, row reference and ingestion time never enter
/// the hash.
pub fn fingerprint(record: &StagingRecord) -> FingerprintKey {
    let canonical = format!(
        "{}|{}|{}|{}|{}",
        record.amount.normalize(),
        record.currency.trim().to_uppercase(),
        record.date.format("%Y-%m-%d"),
        normalize_text(record.account_ref.as_deref().unwrap_or("")),
        normalize_text(record.narrative()),
    );

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    FingerprintKey(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Direction, SourceKind};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn record(amount: &str, description: &str) -> StagingRecord {
        StagingRecord {
            batch_id: "batch-a".to_string(),
            source_kind: SourceKind::Csv,
            row_ref: "row 2".to_string(),
            amount: Decimal::from_str(amount).unwrap(),
            direction: Direction::Debit,
            currency: "INR".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            description: description.to_string(),
            counterparty: None,
            account_ref: Some("XX1234".to_string()),
        }
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let key = fingerprint(&record("-50", "Coffee Co"));
        assert_eq!(key.as_str().len(), 64);
        assert_eq!(key, fingerprint(&record("-50", "Coffee Co")));
    }

    #[test]
    fn test_provenance_is_ignored() {
        let a = record("-50", "Coffee Co");
        let mut b = a.clone();
        b.batch_id = "batch-b".to_string();
        b.source_kind = SourceKind::Email;
        b.row_ref = "message xyz".to_string();

        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_description_case_and_whitespace_collapse() {
        let a = record("-50", "Coffee Co");
        let b = record("-50", "  COFFEE    co ");
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_amount_scale_does_not_matter() {
        assert_eq!(
            fingerprint(&record("-50", "Coffee Co")),
            fingerprint(&record("-50.00", "Coffee Co"))
        );
    }

    #[test]
    fn test_counterparty_stands_in_for_empty_description() {
        let mut from_email = record("-50", "");
        from_email.counterparty = Some("Coffee Co".to_string());
        let from_csv = record("-50", "COFFEE CO");

        assert_eq!(fingerprint(&from_email), fingerprint(&from_csv));
    }

    #[test]
    fn test_payee_outranks_generic_narration() {
        let mut coffee = record("-50", "CARD POS PURCHASE");
        coffee.counterparty = Some("Coffee Co".to_string());
        let mut books = record("-50", "CARD POS PURCHASE");
        books.counterparty = Some("Book House".to_string());
        assert_ne!(fingerprint(&coffee), fingerprint(&books));

        // Same payee, different bank wording: still one event
        let mut reworded = record("-50", "POS 4521 COFFEE CO");
        reworded.counterparty = Some("coffee co".to_string());
        assert_eq!(fingerprint(&coffee), fingerprint(&reworded));
    }

    #[test]
    fn test_economic_fields_change_the_key() {
        let base = record("-50", "Coffee Co");

        let mut other_amount = base.clone();
        other_amount.amount = Decimal::from(-51);
        let mut other_sign = base.clone();
        other_sign.amount = Decimal::from(50);
        let mut other_date = base.clone();
        other_date.date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let mut other_account = base.clone();
        other_account.account_ref = None;
        let mut other_currency = base.clone();
        other_currency.currency = "USD".to_string();

        for changed in [other_amount, other_sign, other_date, other_account, other_currency] {
            assert_ne!(fingerprint(&base), fingerprint(&changed));
        }
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Transfer\tTO   Savings "), "transfer to savings");
        assert_eq!(normalize_text(""), "");
    }
}
