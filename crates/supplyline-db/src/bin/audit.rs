//! # Journal Audit
//!
//! Replays every line's journal from zero and compares the result with the
//! stored stock levels. Exits non-zero when any line drifts.
//!
//! ## Usage
//! ```bash
//! cargo run -p supplyline-db --bin audit -- --db ./data/ledger.db
//! ```

use std::env;
use std::process::ExitCode;

use supplyline_core::mutation::replay;
use supplyline_db::{Database, LedgerConfig};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let mut db_path: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Supplyline Journal Audit");
                println!();
                println!("Usage: audit [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>  Database file (default: from supplyline.toml)");
                println!("  -h, --help       Show this help message");
                return Ok(ExitCode::SUCCESS);
            }
            _ => {}
        }
        i += 1;
    }

    let mut config = LedgerConfig::load_or_default(None);
    if let Some(path) = db_path {
        config.database.path = path.into();
    }
    config.validate()?;

    let db = Database::new(config.db_config()).await?;
    let lines = db.lines();
    let journal = db.journal();

    let ids = lines.all_ids().await?;
    info!(lines = ids.len(), "Auditing journal");

    let mut drifted = 0usize;
    for id in &ids {
        let Some(line) = lines.get(id).await? else {
            continue;
        };
        let entries = journal.replay_order(id).await?;

        match replay(&entries) {
            Ok(replayed) if replayed == line.levels() => {
                debug!(line_id = %id, entries = entries.len(), "Line reconciles");
            }
            Ok(replayed) => {
                drifted += 1;
                error!(
                    line_id = %id,
                    retailer_id = %line.retailer_id,
                    product_id = %line.product_id,
                    stored_current = line.current_stock,
                    stored_committed = line.committed_stock,
                    replayed_current = replayed.current,
                    replayed_committed = replayed.committed,
                    "Stored levels differ from journal"
                );
                println!(
                    "✗ {} ({}/{}): stored {}/{}, journal {}/{}",
                    id,
                    line.retailer_id,
                    line.product_id,
                    line.current_stock,
                    line.committed_stock,
                    replayed.current,
                    replayed.committed
                );
            }
            Err(e) => {
                drifted += 1;
                error!(line_id = %id, error = %e, "Journal does not replay");
                println!("✗ {}: {}", id, e);
            }
        }
    }

    db.close().await;

    if drifted > 0 {
        println!("⚠ {} of {} lines failed the audit", drifted, ids.len());
        return Ok(ExitCode::FAILURE);
    }

    println!("✓ {} lines reconcile with their journals", ids.len());
    Ok(ExitCode::SUCCESS)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,supplyline=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
