//! # Seed Data Generator
//!
//! Populates a ledger with demo retailers for development.
//!
//! ## Usage
//! ```bash
//! # Three retailers (default)
//! cargo run -p supplyline-db --bin seed
//!
//! # More retailers, custom database file
//! cargo run -p supplyline-db --bin seed -- --retailers 10 --db ./data/ledger.db
//! ```
//!
//! ## Generated Data
//! - A central supplier (`HQ`) stocking every product
//! - Retailers `R-001`, `R-002`, ... each carrying every product with
//!   varied initial stock, some of it below the reorder level
//! - Volume discount tiers on half of the catalogue
//! - One pending transfer request per retailer for its low-stock lines

use std::env;
use std::time::Instant;

use supplyline_core::{
    Discount, DiscountRate, ItemQuantity, LineFilter, Money, NewInventoryLine, NewTransferRequest,
    PageRequest, PricingTier, TransferPriority,
};
use supplyline_db::{Ledger, LedgerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SUPPLIER_ID: &str = "HQ";
const SEED_ACTOR: &str = "seed";

/// (product id, selling price in cents)
const CATALOGUE: &[(&str, i64)] = &[
    ("RICE-5KG", 1_250),
    ("FLOUR-2KG", 480),
    ("SUGAR-1KG", 320),
    ("SALT-500G", 95),
    ("OIL-1L", 699),
    ("TEA-100", 875),
    ("COFFEE-250G", 1_199),
    ("MILK-1L", 149),
    ("EGGS-12", 389),
    ("BUTTER-250G", 455),
    ("PASTA-500G", 210),
    ("BEANS-400G", 135),
    ("TOMATO-400G", 120),
    ("SOAP-BAR", 99),
    ("DETERGENT-1KG", 780),
    ("TISSUE-6", 560),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let mut retailers: usize = 3;
    let mut db_path: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--retailers" | "-r" => {
                if i + 1 < args.len() {
                    retailers = args[i + 1].parse().unwrap_or(3);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Supplyline Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -r, --retailers <N>  Number of retailers to create (default: 3)");
                println!("  -d, --db <PATH>      Database file (default: from supplyline.toml)");
                println!("  -h, --help           Show this help message");
                return Ok(());
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

    println!("Supplyline Seed Data Generator");
    println!("==============================");
    println!("Database:  {}", config.database.path.display());
    println!("Retailers: {}", retailers);
    println!();

    let ledger = Ledger::open(config).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = ledger
        .list_lines(SUPPLIER_ID, LineFilter::default(), PageRequest::new(1, 1))
        .await?;
    if existing.total > 0 {
        println!("⚠ Supplier {} already has {} lines", SUPPLIER_ID, existing.total);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let start = Instant::now();
    let mut lines = 0usize;

    for (idx, (product_id, price_cents)) in CATALOGUE.iter().enumerate() {
        ledger
            .onboard_line(&new_line(SUPPLIER_ID, product_id, *price_cents, 5_000, idx), SEED_ACTOR)
            .await?;
        lines += 1;
    }
    println!("✓ Supplier {} stocked with {} products", SUPPLIER_ID, CATALOGUE.len());

    for r in 1..=retailers {
        let retailer_id = format!("R-{:03}", r);
        let mut low_stock = Vec::new();

        for (idx, (product_id, price_cents)) in CATALOGUE.iter().enumerate() {
            let seed = r * 31 + idx * 7;
            // Every fourth product starts below its reorder level
            let initial_stock = if seed % 4 == 0 { (seed % 8) as i64 } else { 20 + (seed % 180) as i64 };

            let line = match ledger
                .onboard_line(
                    &new_line(&retailer_id, product_id, *price_cents, initial_stock, seed),
                    SEED_ACTOR,
                )
                .await
            {
                Ok(line) => line,
                Err(e) => {
                    warn!(%retailer_id, product_id, error = %e, "Failed to onboard line");
                    continue;
                }
            };
            lines += 1;

            if idx % 2 == 0 {
                ledger
                    .configure_pricing(&line.id, true, &volume_tiers(*price_cents))
                    .await?;
            }
            if line.is_low_stock() {
                low_stock.push(ItemQuantity::new(*product_id, line.max_stock_level - line.current_stock));
            }
        }

        if !low_stock.is_empty() {
            let request = ledger
                .transfers()
                .create_request(
                    &NewTransferRequest {
                        retailer_id: retailer_id.clone(),
                        items: low_stock,
                        priority: if r % 2 == 0 {
                            TransferPriority::High
                        } else {
                            TransferPriority::Normal
                        },
                        note: Some("Restock below reorder level".to_string()),
                    },
                    SEED_ACTOR,
                )
                .await?;
            info!(%retailer_id, request_id = %request.id, "Seeded transfer request");
        }

        println!("  Retailer {} seeded", retailer_id);
    }

    let elapsed = start.elapsed();
    println!();
    println!("✓ Onboarded {} lines in {:?}", lines, elapsed);
    println!();
    println!("✓ Seed complete!");

    Ok(())
}

fn new_line(
    retailer_id: &str,
    product_id: &str,
    price_cents: i64,
    initial_stock: i64,
    seed: usize,
) -> NewInventoryLine {
    // Cost 60-80% of price
    let cost_pct = 60 + (seed % 20) as i64;
    NewInventoryLine {
        retailer_id: retailer_id.to_string(),
        product_id: product_id.to_string(),
        initial_stock,
        selling_price: Money::from_cents(price_cents),
        cost_price: Money::from_cents(price_cents * cost_pct / 100),
        min_stock_level: 10,
        max_stock_level: 200,
    }
}

fn volume_tiers(price_cents: i64) -> Vec<PricingTier> {
    vec![
        PricingTier::new(10, 49, Discount::Percent(DiscountRate::from_percent(5))),
        PricingTier::new(50, 99, Discount::Percent(DiscountRate::from_percent(10))),
        PricingTier::new(100, 1_000, Discount::Flat(Money::from_cents(price_cents * 15))),
    ]
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,supplyline=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
