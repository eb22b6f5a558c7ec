// 📊 KPI Projection - every spend/income number is read through vw_txn_kpi
// Transfers and other non-economic categories never reach this module.

use chrono::NaiveDate;
use rusqlite::params_from_iter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;

use crate::db::LedgerDb;
use crate::error::{PipelineError, PipelineResult};
use crate::source::Direction;

/// Period and optional category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KpiFilter {
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
    #[serde(default)]
    pub category: Option<String>,
}

/// Fact joined with its enrichment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiRow {
    pub transaction_id: String,
    pub amount: Decimal,
    pub direction: Direction,
    pub currency: String,
    pub date: NaiveDate,
    pub description: String,
    pub account_ref: Option<String>,
    pub category_code: String,
    pub subcategory_code: Option<String>,
    pub merchant: Option<String>,
}

/// Lazy, paged iterator over the KPI view ordered by (date, id).
///
/// Pages are fetched with keyset pagination, so rows inserted by a
/// concurrent batch after the cursor position may still be yielded; rows
/// already passed are never repeated.
pub struct KpiCursor {
    db: LedgerDb,
    filter: KpiFilter,
    page_size: usize,
    buffer: VecDeque<KpiRow>,
    last_key: Option<(String, String)>,
    exhausted: bool,
}

impl KpiCursor {
    fn fetch_page(&mut self) -> PipelineResult<()> {
        let mut sql = String::from(
            "SELECT transaction_id, amount, direction, currency, txn_date, description,
                    account_ref, category_code, subcategory_code, merchant
             FROM vw_txn_kpi WHERE 1 = 1",
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(from) = self.filter.from {
            args.push(from.format("%Y-%m-%d").to_string());
            sql.push_str(&format!(" AND txn_date >= ?{}", args.len()));
        }
        if let Some(to) = self.filter.to {
            args.push(to.format("%Y-%m-%d").to_string());
            sql.push_str(&format!(" AND txn_date <= ?{}", args.len()));
        }
        if let Some(category) = &self.filter.category {
            args.push(category.clone());
            sql.push_str(&format!(" AND category_code = ?{}", args.len()));
        }
        if let Some((date, id)) = &self.last_key {
            args.push(date.clone());
            let d = args.len();
            args.push(id.clone());
            let i = args.len();
            sql.push_str(&format!(
                " AND (txn_date > ?{d} OR (txn_date = ?{d} AND transaction_id > ?{i}))"
            ));
        }
        sql.push_str(&format!(
            " ORDER BY txn_date, transaction_id LIMIT {}",
            self.page_size
        ));

        let raw = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), |row| {
                    Ok(RawKpiRow {
                        transaction_id: row.get(0)?,
                        amount: row.get(1)?,
                        direction: row.get(2)?,
                        currency: row.get(3)?,
                        date: row.get(4)?,
                        description: row.get(5)?,
                        account_ref: row.get(6)?,
                        category_code: row.get(7)?,
                        subcategory_code: row.get(8)?,
                        merchant: row.get(9)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        if raw.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = raw.last() {
            self.last_key = Some((last.date.clone(), last.transaction_id.clone()));
        }
        for row in raw {
            self.buffer.push_back(row.into_row()?);
        }
        Ok(())
    }
}

impl Iterator for KpiCursor {
    type Item = PipelineResult<KpiRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

struct RawKpiRow {
    transaction_id: String,
    amount: String,
    direction: String,
    currency: String,
    date: String,
    description: String,
    account_ref: Option<String>,
    category_code: String,
    subcategory_code: Option<String>,
    merchant: Option<String>,
}

impl RawKpiRow {
    fn into_row(self) -> PipelineResult<KpiRow> {
        let corrupt = |what: &str, value: &str| {
            PipelineError::StoreUnavailable(format!(
                "corrupt ledger row {}: bad {} {:?}",
                self.transaction_id, what, value
            ))
        };
        let amount = Decimal::from_str(&self.amount).map_err(|_| corrupt("amount", &self.amount))?;
        let direction = self
            .direction
            .parse()
            .map_err(|_| corrupt("direction", &self.direction))?;
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")
            .map_err(|_| corrupt("date", &self.date))?;

        Ok(KpiRow {
            transaction_id: self.transaction_id,
            amount,
            direction,
            currency: self.currency,
            date,
            description: self.description,
            account_ref: self.account_ref,
            category_code: self.category_code,
            subcategory_code: self.subcategory_code,
            merchant: self.merchant,
        })
    }
}

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonthTotals {
    pub spend: Decimal,
    pub income: Decimal,
}

/// Aggregates for one currency. Amounts are never summed across currencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSummary {
    pub currency: String,
    pub transaction_count: u64,
    /// Sum of debit magnitudes
    pub total_spend: Decimal,
    /// Sum of credits
    pub total_income: Decimal,
    pub net: Decimal,
    /// Spend per category code
    pub by_category: BTreeMap<String, Decimal>,
    /// Keyed "YYYY-MM"
    pub by_month: BTreeMap<String, MonthTotals>,
}

impl KpiSummary {
    fn new(currency: &str) -> Self {
        KpiSummary {
            currency: currency.to_string(),
            transaction_count: 0,
            total_spend: Decimal::ZERO,
            total_income: Decimal::ZERO,
            net: Decimal::ZERO,
            by_category: BTreeMap::new(),
            by_month: BTreeMap::new(),
        }
    }

    fn add(&mut self, row: &KpiRow) {
        let magnitude = row.amount.abs();
        let month = self
            .by_month
            .entry(row.date.format("%Y-%m").to_string())
            .or_default();

        match row.direction {
            Direction::Debit => {
                self.total_spend += magnitude;
                month.spend += magnitude;
                *self
                    .by_category
                    .entry(row.category_code.clone())
                    .or_insert(Decimal::ZERO) += magnitude;
            }
            Direction::Credit => {
                self.total_income += magnitude;
                month.income += magnitude;
            }
        }
        self.transaction_count += 1;
        self.net = self.total_income - self.total_spend;
    }
}

// ============================================================================
// VIEW
// ============================================================================

#[derive(Clone)]
pub struct KpiView {
    db: LedgerDb,
    page_size: usize,
}

impl KpiView {
    pub fn new(db: LedgerDb, page_size: usize) -> Self {
        KpiView {
            db,
            page_size: page_size.max(1),
        }
    }

    /// KPI-eligible transactions, lazily paged
    pub fn for_kpi(&self, filter: KpiFilter) -> KpiCursor {
        KpiCursor {
            db: self.db.clone(),
            filter,
            page_size: self.page_size,
            buffer: VecDeque::new(),
            last_key: None,
            exhausted: false,
        }
    }

    /// Spend, income, category and month breakdowns per currency
    pub fn summary(&self, filter: KpiFilter) -> PipelineResult<Vec<KpiSummary>> {
        let mut per_currency: BTreeMap<String, KpiSummary> = BTreeMap::new();
        for row in self.for_kpi(filter) {
            let row = row?;
            per_currency
                .entry(row.currency.clone())
                .or_insert_with(|| KpiSummary::new(&row.currency))
                .add(&row);
        }
        Ok(per_currency.into_values().collect())
    }
}
