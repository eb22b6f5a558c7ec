// 🧹 Raw Record Normalizer - any SourceRow into a StagingRecord or a RejectedRow
// Pure: no I/O happens here.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::config::IngestConfig;
use crate::error::RejectReason;
use crate::source::{Direction, SourceKind, SourceRow};

/// A normalized row waiting to be loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRecord {
    pub batch_id: String,
    pub source_kind: SourceKind,
    pub row_ref: String,
    /// Signed: debits negative, credits positive
    pub amount: Decimal,
    pub direction: Direction,
    pub currency: String,
    pub date: NaiveDate,
    pub description: String,
    pub counterparty: Option<String>,
    pub account_ref: Option<String>,
}

impl StagingRecord {
    /// Text that names the other side of the transaction, for the
    /// fingerprint: the payee when the source has one, else the description.
    /// Generic narrations ("CARD POS PURCHASE") never outrank the payee.
    pub fn narrative(&self) -> &str {
        match self.counterparty.as_deref().map(str::trim) {
            Some(payee) if !payee.is_empty() => payee,
            _ => &self.description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub row_ref: String,
    pub reason: RejectReason,
}

/// Fields every variant is flattened into before validation
struct RawFields<'a> {
    amount: Option<&'a str>,
    date: Option<&'a str>,
    description: Option<&'a str>,
    counterparty: Option<&'a str>,
    direction: Option<Direction>,
    currency: Option<&'a str>,
    account: Option<&'a str>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn flatten(row: &SourceRow) -> RawFields<'_> {
    match row {
        SourceRow::Csv(r) | SourceRow::Xlsx(r) => RawFields {
            amount: non_empty(&r.amount),
            date: non_empty(&r.date),
            description: non_empty(&r.description),
            counterparty: non_empty(&r.counterparty),
            direction: non_empty(&r.direction).and_then(Direction::parse_hint),
            currency: non_empty(&r.currency),
            account: non_empty(&r.account),
        },
        SourceRow::Pdf(line) => {
            // Whichever column is filled decides the direction
            let (amount, direction) = match (non_empty(&line.debit), non_empty(&line.credit)) {
                (Some(d), _) => (Some(d), Some(Direction::Debit)),
                (None, Some(c)) => (Some(c), Some(Direction::Credit)),
                (None, None) => (None, None),
            };
            RawFields {
                amount,
                date: non_empty(&line.date),
                description: non_empty(&line.narration),
                counterparty: None,
                direction,
                currency: non_empty(&line.currency),
                account: non_empty(&line.account),
            }
        }
        SourceRow::Email(mail) => RawFields {
            amount: non_empty(&mail.amount),
            date: non_empty(&mail.date),
            // Alert subjects are boilerplate; the merchant carries the identity
            description: None,
            counterparty: non_empty(&mail.merchant),
            direction: non_empty(&mail.direction).and_then(Direction::parse_hint),
            currency: non_empty(&mail.currency),
            account: non_empty(&mail.account_hint),
        },
    }
}

/// Normalize one source row for the given batch
pub fn normalize(
    row: &SourceRow,
    batch_id: &str,
    config: &IngestConfig,
) -> Result<StagingRecord, RejectedRow> {
    let row_ref = row.row_ref();
    let reject = |reason: RejectReason| RejectedRow {
        row_ref: row_ref.clone(),
        reason,
    };

    let fields = flatten(row);

    let amount_text = fields.amount.ok_or_else(|| reject(RejectReason::incomplete("amount")))?;
    let date_text = fields.date.ok_or_else(|| reject(RejectReason::incomplete("date")))?;

    let parsed = parse_amount(amount_text).ok_or_else(|| {
        reject(RejectReason::InvalidAmount {
            value: amount_text.to_string(),
        })
    })?;

    let description = truncate(fields.description.unwrap_or(""), config.max_description_len);
    let counterparty = fields
        .counterparty
        .map(|c| truncate(c, config.max_counterparty_len));

    let direction = match fields.direction.or(parsed.marker) {
        Some(direction) => direction,
        None if parsed.signed => {
            if parsed.negative {
                Direction::Debit
            } else {
                Direction::Credit
            }
        }
        None if config.infer_unsigned_direction => {
            infer_from_text(&description, counterparty.as_deref())
        }
        None => return Err(reject(RejectReason::incomplete("direction"))),
    };

    let date = parse_date(date_text, &config.date_formats).ok_or_else(|| {
        reject(RejectReason::InvalidDate {
            value: date_text.to_string(),
        })
    })?;

    let currency = match fields.currency {
        None => config.base_currency.to_uppercase(),
        Some(code) => {
            let code = code.to_uppercase();
            if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(reject(RejectReason::InvalidCurrency { value: code }));
            }
            code
        }
    };

    let amount = match direction {
        Direction::Debit => -parsed.magnitude,
        Direction::Credit => parsed.magnitude,
    };

    Ok(StagingRecord {
        batch_id: batch_id.to_string(),
        source_kind: row.kind(),
        row_ref,
        amount,
        direction,
        currency,
        date,
        description,
        counterparty,
        account_ref: fields.account.map(str::to_string),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ParsedAmount {
    magnitude: Decimal,
    /// An explicit +/- or parentheses was present
    signed: bool,
    negative: bool,
    /// Trailing CR / DR marker
    marker: Option<Direction>,
}

/// Parse "1,234.50", "-$855.94", "(12.00)", "₹ 500 DR", "Rs.1,200", ...
fn parse_amount(raw: &str) -> Option<ParsedAmount> {
    let mut text = raw.trim();
    let mut marker = None;

    if text.len() >= 2 && text.is_char_boundary(text.len() - 2) {
        let suffix = &text[text.len() - 2..];
        if suffix.eq_ignore_ascii_case("cr") {
            marker = Some(Direction::Credit);
        } else if suffix.eq_ignore_ascii_case("dr") {
            marker = Some(Direction::Debit);
        }
        if marker.is_some() {
            text = text[..text.len() - 2].trim_end();
        }
    }

    let mut signed = false;
    let mut negative = false;

    if text.starts_with('(') && text.ends_with(')') && text.len() >= 2 {
        signed = true;
        negative = true;
        text = text[1..text.len() - 1].trim();
    }

    // Sign may sit on either side of the currency marker
    for _ in 0..2 {
        if let Some(rest) = text.strip_prefix('-') {
            signed = true;
            negative = !negative;
            text = rest.trim_start();
        } else if let Some(rest) = text.strip_prefix('+') {
            signed = true;
            text = rest.trim_start();
        }

        for symbol in ["Rs.", "Rs", "INR", "USD", "EUR", "GBP", "$", "€", "£", "₹"] {
            if let Some(rest) = text.strip_prefix(symbol) {
                text = rest.trim_start();
                break;
            }
        }
    }

    let digits: String = text
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }

    let magnitude = Decimal::from_str(&digits).ok()?;
    if magnitude.is_zero() {
        return None;
    }

    Some(ParsedAmount {
        magnitude,
        signed,
        negative,
        marker,
    })
}

/// Try each configured format, then the RFC forms e-mail headers use
fn parse_date(raw: &str, formats: &[String]) -> Option<NaiveDate> {
    let text = raw.trim();

    for format in formats {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
        if let Ok(datetime) = NaiveDateTime::parse_from_str(text, format) {
            return Some(datetime.date());
        }
    }

    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_rfc2822(text))
        .map(|dt| dt.date_naive())
        .ok()
}

const CREDIT_WORDS: &[&str] = &["salary", "refund", "deposit", "interest", "dividend", "cashback", "credited"];

/// Unsigned amount with no direction: spending is the common case
fn infer_from_text(description: &str, counterparty: Option<&str>) -> Direction {
    let text = format!("{} {}", description, counterparty.unwrap_or("")).to_lowercase();
    if CREDIT_WORDS.iter().any(|w| text.contains(w)) {
        Direction::Credit
    } else {
        Direction::Debit
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.trim().chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{EmailExtract, StatementLine, TabularRow};

    fn csv_row(amount: Option<&str>, date: Option<&str>, merchant: &str) -> SourceRow {
        SourceRow::Csv(TabularRow {
            row_number: 2,
            amount: amount.map(str::to_string),
            date: date.map(str::to_string),
            counterparty: Some(merchant.to_string()),
            ..Default::default()
        })
    }

    fn config() -> IngestConfig {
        IngestConfig::default()
    }

    #[test]
    fn test_parse_amount_formats() {
        let p = parse_amount("1,234.50").unwrap();
        assert_eq!(p.magnitude, Decimal::from_str("1234.50").unwrap());
        assert!(!p.signed);

        let p = parse_amount("-$855.94").unwrap();
        assert!(p.negative && p.signed);
        assert_eq!(p.magnitude, Decimal::from_str("855.94").unwrap());

        let p = parse_amount("(12.00)").unwrap();
        assert!(p.negative);

        let p = parse_amount("₹ 500 DR").unwrap();
        assert_eq!(p.marker, Some(Direction::Debit));
        assert_eq!(p.magnitude, Decimal::from(500));

        let p = parse_amount("Rs.1,200 Cr").unwrap();
        assert_eq!(p.marker, Some(Direction::Credit));

        let p = parse_amount("$-20").unwrap();
        assert!(p.negative);
    }

    #[test]
    fn test_parse_amount_rejects_garbage() {
        assert!(parse_amount("malformed").is_none());
        assert!(parse_amount("12abc").is_none());
        assert!(parse_amount("").is_none());
        assert!(parse_amount("0.00").is_none());
        assert!(parse_amount("1.2.3").is_none());
    }

    #[test]
    fn test_normalize_basic_row() {
        let row = csv_row(Some("-50"), Some("2024-01-01"), "Coffee Co");
        let record = normalize(&row, "b1", &config()).unwrap();

        assert_eq!(record.batch_id, "b1");
        assert_eq!(record.source_kind, SourceKind::Csv);
        assert_eq!(record.amount, Decimal::from(-50));
        assert_eq!(record.direction, Direction::Debit);
        assert_eq!(record.currency, "INR");
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(record.narrative(), "Coffee Co");
    }

    #[test]
    fn test_explicit_direction_wins_over_sign() {
        let row = SourceRow::Csv(TabularRow {
            row_number: 3,
            amount: Some("200".into()),
            date: Some("2024-01-02".into()),
            counterparty: Some("Transfer to Savings".into()),
            direction: Some("debit".into()),
            ..Default::default()
        });
        let record = normalize(&row, "b1", &config()).unwrap();
        assert_eq!(record.amount, Decimal::from(-200));
        assert_eq!(record.direction, Direction::Debit);
    }

    #[test]
    fn test_missing_fields_are_incomplete() {
        let no_amount = normalize(&csv_row(None, Some("2024-01-01"), "x"), "b", &config());
        assert_eq!(no_amount.unwrap_err().reason.code(), "incomplete_record");

        let no_date = normalize(&csv_row(Some("10"), None, "x"), "b", &config());
        assert_eq!(no_date.unwrap_err().reason, RejectReason::incomplete("date"));
    }

    #[test]
    fn test_unsigned_without_direction_when_inference_disabled() {
        let mut cfg = config();
        cfg.infer_unsigned_direction = false;

        let rejected = normalize(&csv_row(Some("10"), Some("2024-01-01"), "x"), "b", &cfg);
        assert_eq!(rejected.unwrap_err().reason, RejectReason::incomplete("direction"));

        let accepted = normalize(&csv_row(Some("-10"), Some("2024-01-01"), "x"), "b", &cfg);
        assert_eq!(accepted.unwrap().direction, Direction::Debit);
    }

    #[test]
    fn test_unsigned_inference_uses_credit_words() {
        let row = SourceRow::Csv(TabularRow {
            row_number: 4,
            amount: Some("5000".into()),
            date: Some("2024-01-31".into()),
            description: Some("SALARY JAN".into()),
            ..Default::default()
        });
        let record = normalize(&row, "b", &config()).unwrap();
        assert_eq!(record.direction, Direction::Credit);
        assert_eq!(record.amount, Decimal::from(5000));
    }

    #[test]
    fn test_malformed_amount_and_date() {
        let bad_amount = normalize(&csv_row(Some("malformed"), Some("2024-01-01"), "x"), "b", &config());
        assert_eq!(bad_amount.unwrap_err().reason.code(), "invalid_amount");

        let bad_date = normalize(&csv_row(Some("10"), Some("31/31/2024"), "x"), "b", &config());
        assert_eq!(bad_date.unwrap_err().reason.code(), "invalid_date");
    }

    #[test]
    fn test_currency_handling() {
        let mut row = TabularRow {
            row_number: 5,
            amount: Some("-10".into()),
            date: Some("2024-01-01".into()),
            currency: Some("usd".into()),
            ..Default::default()
        };
        let record = normalize(&SourceRow::Csv(row.clone()), "b", &config()).unwrap();
        assert_eq!(record.currency, "USD");

        row.currency = Some("dollars".into());
        let rejected = normalize(&SourceRow::Csv(row), "b", &config()).unwrap_err();
        assert_eq!(rejected.reason.code(), "invalid_currency");
    }

    #[test]
    fn test_pdf_debit_credit_columns() {
        let line = SourceRow::Pdf(StatementLine {
            page: 1,
            line: 9,
            date: Some("05/01/2024".into()),
            narration: Some("NEFT CR-ACME PAYROLL".into()),
            credit: Some("45,000.00".into()),
            ..Default::default()
        });
        let record = normalize(&line, "b", &config()).unwrap();
        assert_eq!(record.direction, Direction::Credit);
        assert_eq!(record.amount, Decimal::from(45000));
        // %d/%m/%Y is tried before %m/%d/%Y
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(record.row_ref, "page 1 line 9");
    }

    #[test]
    fn test_email_extract() {
        let mail = SourceRow::Email(EmailExtract {
            message_id: "m-1".into(),
            date: Some("Tue, 2 Jan 2024 10:52:37 +0530".into()),
            amount: Some("Rs. 349.00".into()),
            merchant: Some("Swiggy".into()),
            direction: Some("debited".into()),
            account_hint: Some("XX1234".into()),
            ..Default::default()
        });
        let record = normalize(&mail, "b", &config()).unwrap();
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(record.amount, Decimal::from_str("-349.00").unwrap());
        assert_eq!(record.account_ref.as_deref(), Some("XX1234"));
        assert_eq!(record.narrative(), "Swiggy");
    }

    #[test]
    fn test_description_truncated() {
        let mut cfg = config();
        cfg.max_description_len = 5;
        let row = SourceRow::Csv(TabularRow {
            row_number: 1,
            amount: Some("-1".into()),
            date: Some("2024-01-01".into()),
            description: Some("  abcdefghij ".into()),
            ..Default::default()
        });
        assert_eq!(normalize(&row, "b", &cfg).unwrap().description, "abcde");
    }
}
