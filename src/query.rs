// Transaction listing over vw_txn_ledger (fact + enrichment, transfers included)
// Not for aggregates: KPI numbers go through kpi::KpiView.

use chrono::NaiveDate;
use rusqlite::params_from_iter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::db::LedgerDb;
use crate::error::{PipelineError, PipelineResult};
use crate::source::Direction;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Date,
    Amount,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "date" => Ok(SortField::Date),
            "amount" => Ok(SortField::Amount),
            other => Err(format!("unknown sort field: {}", other)),
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionFilter {
    /// Case-insensitive substring over description, counterparty and merchant
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
    #[serde(default)]
    pub sort: SortField,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub transaction_id: String,
    pub fingerprint: String,
    pub amount: Decimal,
    pub direction: Direction,
    pub currency: String,
    pub date: NaiveDate,
    pub description: String,
    pub counterparty: Option<String>,
    pub account_ref: Option<String>,
    pub batch_id: String,
    /// None until enrichment exists
    pub category_code: Option<String>,
    pub subcategory_code: Option<String>,
    pub merchant: Option<String>,
    pub kpi_eligible: Option<bool>,
    pub needs_review: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    /// Matching rows before limit/offset
    pub total: u64,
    pub rows: Vec<LedgerRow>,
}

const DEFAULT_LIMIT: usize = 100;

#[derive(Clone)]
pub struct LedgerQuery {
    db: LedgerDb,
}

impl LedgerQuery {
    pub fn new(db: LedgerDb) -> Self {
        LedgerQuery { db }
    }

    pub fn list(&self, filter: &TransactionFilter) -> PipelineResult<TransactionPage> {
        let mut clauses = String::from(" WHERE 1 = 1");
        let mut args: Vec<String> = Vec::new();

        if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            args.push(format!("%{}%", search.to_lowercase()));
            let n = args.len();
            clauses.push_str(&format!(
                " AND (LOWER(description) LIKE ?{n} OR LOWER(COALESCE(counterparty, '')) LIKE ?{n}
                       OR LOWER(COALESCE(merchant, '')) LIKE ?{n})"
            ));
        }
        if let Some(category) = &filter.category {
            args.push(category.clone());
            clauses.push_str(&format!(" AND category_code = ?{}", args.len()));
        }
        if let Some(from) = filter.from {
            args.push(from.format("%Y-%m-%d").to_string());
            clauses.push_str(&format!(" AND txn_date >= ?{}", args.len()));
        }
        if let Some(to) = filter.to {
            args.push(to.format("%Y-%m-%d").to_string());
            clauses.push_str(&format!(" AND txn_date <= ?{}", args.len()));
        }

        let sort_column = match filter.sort {
            SortField::Date => "txn_date",
            SortField::Amount => "CAST(amount AS REAL)",
        };
        let order = match filter.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };

        let count_sql = format!("SELECT COUNT(*) FROM vw_txn_ledger{}", clauses);
        let list_sql = format!(
            "SELECT transaction_id, fingerprint, amount, direction, currency, txn_date,
                    description, counterparty, account_ref, batch_id, category_code,
                    subcategory_code, merchant, kpi_eligible, needs_review
             FROM vw_txn_ledger{} ORDER BY {} {}, transaction_id {} LIMIT {} OFFSET {}",
            clauses,
            sort_column,
            order,
            order,
            filter.limit.unwrap_or(DEFAULT_LIMIT),
            filter.offset.unwrap_or(0),
        );

        let (total, raw) = self.db.with_conn(|conn| {
            let total: i64 =
                conn.query_row(&count_sql, params_from_iter(args.iter()), |row| row.get(0))?;

            let mut stmt = conn.prepare(&list_sql)?;
            let raw = stmt
                .query_map(params_from_iter(args.iter()), |row| {
                    Ok((
                        (
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, Option<String>>(7)?,
                        ),
                        (
                            row.get::<_, Option<String>>(8)?,
                            row.get::<_, String>(9)?,
                            row.get::<_, Option<String>>(10)?,
                            row.get::<_, Option<String>>(11)?,
                            row.get::<_, Option<String>>(12)?,
                            row.get::<_, Option<bool>>(13)?,
                            row.get::<_, Option<bool>>(14)?,
                        ),
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok((total, raw))
        })?;

        let rows = raw
            .into_iter()
            .map(
                |(
                    (transaction_id, fingerprint, amount, direction, currency, date, description, counterparty),
                    (account_ref, batch_id, category_code, subcategory_code, merchant, kpi_eligible, needs_review),
                )| {
                    let corrupt = |what: &str, value: &str| {
                        PipelineError::StoreUnavailable(format!(
                            "corrupt ledger row {}: bad {} {:?}",
                            transaction_id, what, value
                        ))
                    };
                    let amount = Decimal::from_str(&amount).map_err(|_| corrupt("amount", &amount))?;
                    let direction = direction.parse().map_err(|_| corrupt("direction", &direction))?;
                    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                        .map_err(|_| corrupt("date", &date))?;

                    Ok(LedgerRow {
                        transaction_id,
                        fingerprint,
                        amount,
                        direction,
                        currency,
                        date,
                        description,
                        counterparty,
                        account_ref,
                        batch_id,
                        category_code,
                        subcategory_code,
                        merchant,
                        kpi_eligible,
                        needs_review,
                    })
                },
            )
            .collect::<PipelineResult<Vec<_>>>()?;

        Ok(TransactionPage {
            total: total as u64,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{write_enrichment, Classifier};

    fn ledger() -> LedgerDb {
        let db = LedgerDb::open_in_memory().unwrap();
        let classifier = Classifier::with_defaults();
        let rows = [
            ("t1", "-50", "2024-01-01", "Coffee Co", true),
            ("t2", "-200", "2024-01-02", "Transfer to Savings", true),
            ("t3", "-1500", "2024-01-03", "Amazon order", true),
            ("t4", "-9", "2024-01-04", "unenriched row", false),
        ];
        db.with_conn(|conn| {
            for (id, amount, date, description, enrich) in rows {
                conn.execute(
                    "INSERT INTO fact_transactions (transaction_id, fingerprint, amount, direction,
                        currency, txn_date, description, source_kind, batch_id, created_at)
                     VALUES (?1, ?2, ?3, 'debit', 'INR', ?4, ?5, 'csv', 'b', 'now')",
                    rusqlite::params![id, format!("fp-{}", id), amount, date, description],
                )?;
                if enrich {
                    write_enrichment(conn, id, &classifier.classify(description, None))?;
                }
            }
            Ok(())
        })
        .unwrap();
        db
    }

    #[test]
    fn test_listing_includes_transfers() {
        let page = LedgerQuery::new(ledger()).list(&TransactionFilter::default()).unwrap();
        assert_eq!(page.total, 4);
        // Newest first by default
        assert_eq!(page.rows[0].transaction_id, "t4");
        assert_eq!(page.rows[0].category_code, None);
        assert!(page
            .rows
            .iter()
            .any(|r| r.category_code.as_deref() == Some("transfers")));
    }

    #[test]
    fn test_sort_by_amount_is_numeric() {
        let filter = TransactionFilter {
            sort: SortField::Amount,
            order: SortOrder::Asc,
            ..Default::default()
        };
        let page = LedgerQuery::new(ledger()).list(&filter).unwrap();
        let ids: Vec<&str> = page.rows.iter().map(|r| r.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["t3", "t2", "t1", "t4"]);
    }

    #[test]
    fn test_search_category_and_paging() {
        let query = LedgerQuery::new(ledger());

        let search = TransactionFilter {
            search: Some("COFFEE".to_string()),
            ..Default::default()
        };
        let found = query.list(&search).unwrap();
        assert_eq!(found.total, 1);
        assert_eq!(found.rows[0].kpi_eligible, Some(true));

        let transfers = TransactionFilter {
            category: Some("transfers".to_string()),
            ..Default::default()
        };
        let page = query.list(&transfers).unwrap();
        assert_eq!(page.rows[0].kpi_eligible, Some(false));

        let paged = TransactionFilter {
            limit: Some(2),
            offset: Some(1),
            ..Default::default()
        };
        let page = query.list(&paged).unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[0].transaction_id, "t3");
    }

    #[test]
    fn test_sort_parsing() {
        assert_eq!("Amount".parse::<SortField>().unwrap(), SortField::Amount);
        assert_eq!("asc".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert!("size".parse::<SortField>().is_err());
    }
}
