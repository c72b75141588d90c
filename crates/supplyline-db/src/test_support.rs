//! Fixtures shared by the storage tests.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::engine::MutationEngine;
use crate::pool::{Database, DbConfig};
use crate::repository::line;
use crate::retry::RetryPolicy;
use supplyline_core::{
    Clock, InventoryLine, Money, Mutation, MutationContext, ReasonCode, SystemClock,
};

pub(crate) async fn memory_db() -> Database {
    Database::new(DbConfig::in_memory()).await.unwrap()
}

/// A file-backed database with several connections, for concurrency tests.
pub(crate) async fn file_db(dir: &tempfile::TempDir) -> Database {
    let config = DbConfig::new(dir.path().join("ledger.db")).max_connections(8);
    Database::new(config).await.unwrap()
}

pub(crate) fn engine(db: &Database) -> MutationEngine {
    engine_with_clock(db, Arc::new(SystemClock))
}

pub(crate) fn engine_with_clock(db: &Database, clock: Arc<dyn Clock>) -> MutationEngine {
    MutationEngine::new(db.clone(), clock, RetryPolicy::default())
}

/// Inserts an active line for `(retailer, product)` holding `stock` units.
pub(crate) async fn stocked_line(
    engine: &MutationEngine,
    retailer_id: &str,
    product_id: &str,
    stock: i64,
) -> InventoryLine {
    let now = Utc::now();
    let fresh = InventoryLine {
        id: Uuid::new_v4().to_string(),
        retailer_id: retailer_id.to_string(),
        product_id: product_id.to_string(),
        current_stock: 0,
        committed_stock: 0,
        total_sold: 0,
        selling_price: Money::from_cents(10_000),
        cost_price: Money::from_cents(6_000),
        min_stock_level: 10,
        max_stock_level: 1_000,
        quantity_pricing_enabled: false,
        pricing_tiers: vec![],
        is_active: true,
        version: 0,
        created_at: now,
        updated_at: now,
    };
    {
        let mut conn = engine.database().pool().acquire().await.unwrap();
        line::insert(&mut conn, &fresh).await.unwrap();
    }
    if stock == 0 {
        return fresh;
    }
    engine
        .apply(
            &fresh.key(),
            Mutation::StockIn { quantity: stock },
            &MutationContext::manual("fixture", ReasonCode::InitialStock),
        )
        .await
        .unwrap()
        .line
}

pub(crate) async fn levels_of(db: &Database, retailer_id: &str, product_id: &str) -> (i64, i64) {
    let line = db
        .lines()
        .get_by_key(retailer_id, product_id)
        .await
        .unwrap()
        .unwrap();
    (line.current_stock, line.committed_stock)
}
