use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use ledger_etl::{
    init_tracing, BatchOrchestrator, BatchStatus, Classifier, CsvRowProducer, KpiFilter, KpiView,
    LedgerDb, LedgerQuery, PipelineConfig, Reclassifier, RowProducer, SortField, SortOrder,
    SourceKind, TaxonomyHandle, TransactionFilter,
};

#[derive(Parser)]
#[command(name = "ledger-etl", version, about = "Transaction ingestion and deduplication pipeline")]
struct Cli {
    /// YAML configuration file (defaults are used when missing)
    #[arg(long, default_value = "ledger.yaml")]
    config: PathBuf,

    /// Override the database path from the config
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a CSV file as one batch
    Import {
        file: PathBuf,
        /// Source kind recorded on the batch
        #[arg(long, default_value = "csv")]
        kind: SourceKind,
    },
    /// Show one batch
    Status { batch_id: String },
    /// List batches, newest first
    Batches,
    /// Retry a failed batch
    Retry { batch_id: String },
    /// KPI summary for a period
    Kpi {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long)]
        category: Option<String>,
    },
    /// List ledger transactions
    List {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long, default_value = "date")]
        sort: SortField,
        #[arg(long, default_value = "desc")]
        order: SortOrder,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Re-derive every enrichment row with the current taxonomy
    Reclassify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    init_tracing(&config.logging.level);

    let db = LedgerDb::open(&config.database)
        .with_context(|| format!("Failed to open database {}", config.database.path.display()))?;
    let classifier =
        Classifier::from_config(&config.taxonomy).context("Failed to load taxonomy/rules")?;
    let taxonomy = Arc::new(TaxonomyHandle::new(classifier));
    let orchestrator = BatchOrchestrator::new(db.clone(), Arc::clone(&taxonomy), &config);

    match cli.command {
        Command::Import { file, kind } => {
            println!("📂 Loading {}...", file.display());
            let rows = CsvRowProducer::new().produce(&file)?;
            println!("✓ Read {} rows", rows.len());

            let result = orchestrator.submit(kind, rows).await?;
            println!("\n📦 Batch {}", result.batch_id);
            println!("   status:            {}", result.status);
            println!("   inserted:          {}", result.inserted);
            println!("   skipped duplicate: {}", result.skipped_duplicate);
            println!("   rejected:          {}", result.rejected);
            if let Some(error) = &result.error {
                println!("   error:             {}", error);
            }

            if result.status != BatchStatus::Completed {
                let snapshot = orchestrator.status(&result.batch_id)?;
                for failure in snapshot.errors.iter().take(20) {
                    println!("   ⚠️  {} [{}] {}", failure.row_ref, failure.code, failure.reason);
                }
            }
        }

        Command::Status { batch_id } => {
            let snapshot = orchestrator.status(&batch_id)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }

        Command::Batches => {
            for batch in orchestrator.list_batches()? {
                println!(
                    "{}  {:<5} {:<22} received={} inserted={} skipped={} rejected={}",
                    batch.batch_id,
                    batch.source_kind,
                    batch.status,
                    batch.counts.received,
                    batch.counts.inserted,
                    batch.counts.skipped_duplicate,
                    batch.counts.rejected,
                );
            }
        }

        Command::Retry { batch_id } => {
            let result = orchestrator.retry(&batch_id)?.wait().await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Command::Kpi { from, to, category } => {
            let view = KpiView::new(db, config.kpi.page_size);
            let summaries = view.summary(KpiFilter { from, to, category })?;
            if summaries.is_empty() {
                println!("No KPI-eligible transactions in range");
            }
            for summary in summaries {
                println!("💰 {}", summary.currency);
                println!("   transactions: {}", summary.transaction_count);
                println!("   spend:        {}", summary.total_spend);
                println!("   income:       {}", summary.total_income);
                println!("   net:          {}", summary.net);
                for (category, spend) in &summary.by_category {
                    println!("   - {:<20} {}", category, spend);
                }
            }
        }

        Command::List {
            search,
            category,
            from,
            to,
            sort,
            order,
            limit,
        } => {
            let filter = TransactionFilter {
                search,
                category,
                from,
                to,
                sort,
                order,
                limit: Some(limit),
                offset: None,
            };
            let page = LedgerQuery::new(db).list(&filter)?;
            println!("{} matching transactions", page.total);
            for row in page.rows {
                println!(
                    "{}  {:>12} {}  {:<18} {}",
                    row.date,
                    row.amount,
                    row.currency,
                    row.category_code.as_deref().unwrap_or("-"),
                    row.description,
                );
            }
        }

        Command::Reclassify => {
            let snapshot = taxonomy.snapshot()?;
            let report = Reclassifier::new(db, snapshot).run()?;
            println!(
                "✓ Reclassified with taxonomy v{}: scanned {}, changed {}",
                report.taxonomy_version, report.scanned, report.changed
            );
        }
    }

    Ok(())
}
