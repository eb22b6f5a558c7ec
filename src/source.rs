// Source rows - one tagged variant per ingestion channel
// Adapters emit these; the normalizer turns every variant into one StagingRecord shape.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Which channel a batch came through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Csv,
    Xlsx,
    Pdf,
    Email,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Csv => "csv",
            SourceKind::Xlsx => "xlsx",
            SourceKind::Pdf => "pdf",
            SourceKind::Email => "email",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(SourceKind::Csv),
            "xlsx" | "xls" => Ok(SourceKind::Xlsx),
            "pdf" => Ok(SourceKind::Pdf),
            "email" | "gmail" => Ok(SourceKind::Email),
            other => Err(format!("unknown source kind: {}", other)),
        }
    }
}

/// Money movement relative to the account holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }

    /// Parse free-form direction text from any channel.
    /// Unknown words yield None so the caller can fall back to the sign.
    pub fn parse_hint(text: &str) -> Option<Direction> {
        match text.trim().to_lowercase().as_str() {
            "debit" | "dr" | "d" | "debited" | "withdrawal" | "spent" | "paid" | "sent"
            | "out" | "purchase" => Some(Direction::Debit),
            "credit" | "cr" | "c" | "credited" | "deposit" | "received" | "refund" | "in" => {
                Some(Direction::Credit)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Direction::parse_hint(s).ok_or_else(|| format!("unknown direction: {}", s))
    }
}

/// A spreadsheet-like row (CSV or XLSX), cells already mapped to columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularRow {
    pub row_number: usize,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub counterparty: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
}

/// A line lifted out of a PDF statement.
/// Statements carry the amount in either the debit or the credit column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementLine {
    pub page: u32,
    pub line: u32,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub narration: Option<String>,
    #[serde(default)]
    pub debit: Option<String>,
    #[serde(default)]
    pub credit: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
}

/// Fields extracted from a transaction alert e-mail
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailExtract {
    pub message_id: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub merchant: Option<String>,
    /// Verb the alert used: "debited", "credited", "spent", ...
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub account_hint: Option<String>,
}

/// One raw row as produced by an ingestion adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceRow {
    Csv(TabularRow),
    Xlsx(TabularRow),
    Pdf(StatementLine),
    Email(EmailExtract),
}

impl SourceRow {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceRow::Csv(_) => SourceKind::Csv,
            SourceRow::Xlsx(_) => SourceKind::Xlsx,
            SourceRow::Pdf(_) => SourceKind::Pdf,
            SourceRow::Email(_) => SourceKind::Email,
        }
    }

    /// Human-readable pointer back into the source, used in error summaries
    pub fn row_ref(&self) -> String {
        match self {
            SourceRow::Csv(row) | SourceRow::Xlsx(row) => format!("row {}", row.row_number),
            SourceRow::Pdf(line) => format!("page {} line {}", line.page, line.line),
            SourceRow::Email(mail) => format!("message {}", mail.message_id),
        }
    }
}

// ============================================================================
// ROW PRODUCERS
// ============================================================================

/// RowProducer - what every ingestion adapter implements
pub trait RowProducer: Send + Sync {
    /// Read a file and return raw rows
    fn produce(&self, file_path: &Path) -> Result<Vec<SourceRow>>;

    fn source_kind(&self) -> SourceKind;
}

/// Header aliases, matched case-insensitively
const DATE_HEADERS: &[&str] = &["date", "transaction_date", "txn date", "transaction date", "value date"];
const AMOUNT_HEADERS: &[&str] = &["amount", "amt", "transaction amount"];
const DESCRIPTION_HEADERS: &[&str] = &["description", "narration", "details", "particulars"];
const COUNTERPARTY_HEADERS: &[&str] = &["merchant", "payee", "counterparty"];
const DIRECTION_HEADERS: &[&str] = &["type", "direction", "dr/cr", "transaction_type"];
const CURRENCY_HEADERS: &[&str] = &["currency", "ccy"];
const ACCOUNT_HEADERS: &[&str] = &["account", "account_number", "account number"];

/// CSV adapter with header-name column mapping
pub struct CsvRowProducer;

impl CsvRowProducer {
    pub fn new() -> Self {
        CsvRowProducer
    }

    pub fn from_reader<R: std::io::Read>(&self, reader: R) -> Result<Vec<SourceRow>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: HashMap<String, usize> = reader
            .headers()
            .context("Failed to read CSV header row")?
            .iter()
            .enumerate()
            .map(|(i, h)| (h.to_lowercase(), i))
            .collect();

        let column = |aliases: &[&str]| aliases.iter().find_map(|a| headers.get(*a).copied());
        let date_col = column(DATE_HEADERS);
        let amount_col = column(AMOUNT_HEADERS);
        let description_col = column(DESCRIPTION_HEADERS);
        let counterparty_col = column(COUNTERPARTY_HEADERS);
        let direction_col = column(DIRECTION_HEADERS);
        let currency_col = column(CURRENCY_HEADERS);
        let account_col = column(ACCOUNT_HEADERS);

        let mut rows = Vec::new();
        for (index, result) in reader.records().enumerate() {
            let line_number = index + 2; // 1-indexed + header row
            let record =
                result.with_context(|| format!("Failed to parse CSV line {}", line_number))?;

            let cell = |col: Option<usize>| {
                col.and_then(|i| record.get(i))
                    .map(str::to_string)
                    .filter(|s| !s.is_empty())
            };

            rows.push(SourceRow::Csv(TabularRow {
                row_number: line_number,
                date: cell(date_col),
                amount: cell(amount_col),
                description: cell(description_col),
                counterparty: cell(counterparty_col),
                direction: cell(direction_col),
                currency: cell(currency_col),
                account: cell(account_col),
            }));
        }

        Ok(rows)
    }
}

impl Default for CsvRowProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl RowProducer for CsvRowProducer {
    fn produce(&self, file_path: &Path) -> Result<Vec<SourceRow>> {
        let file = std::fs::File::open(file_path)
            .with_context(|| format!("Failed to open file: {}", file_path.display()))?;
        self.from_reader(file)
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Csv
    }
}
