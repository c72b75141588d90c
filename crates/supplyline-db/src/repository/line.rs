//! # Ledger Line Repository
//!
//! Storage for `inventory_lines` and their `pricing_tiers`.
//!
//! Reads go through [`LineRepository`] on the pool. Writes are crate-internal
//! functions on a `&mut SqliteConnection` so the engine can run them inside
//! its own transaction:
//!
//! ```text
//!   BEGIN
//!   claim_by_key      UPDATE ... SET version = version   (takes the write lock)
//!   fetch_by_key      SELECT row + tiers
//!   ── pure rules ──
//!   cas_update_levels UPDATE ... WHERE id = ? AND version = ?
//!   journal::insert
//!   COMMIT
//! ```

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use supplyline_core::{
    Discount, DiscountRate, InventoryLine, LineFilter, Money, Page, PageRequest, PricingTier,
    StockLevels,
};

const LINE_COLUMNS: &str = "id, retailer_id, product_id, current_stock, committed_stock, \
     total_sold, selling_price_cents, cost_price_cents, min_stock_level, max_stock_level, \
     quantity_pricing_enabled, is_active, version, created_at, updated_at";

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct LineRow {
    id: String,
    retailer_id: String,
    product_id: String,
    current_stock: i64,
    committed_stock: i64,
    total_sold: i64,
    selling_price_cents: i64,
    cost_price_cents: i64,
    min_stock_level: i64,
    max_stock_level: i64,
    quantity_pricing_enabled: bool,
    is_active: bool,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl LineRow {
    fn into_line(self, pricing_tiers: Vec<PricingTier>) -> InventoryLine {
        InventoryLine {
            id: self.id,
            retailer_id: self.retailer_id,
            product_id: self.product_id,
            current_stock: self.current_stock,
            committed_stock: self.committed_stock,
            total_sold: self.total_sold,
            selling_price: Money::from_cents(self.selling_price_cents),
            cost_price: Money::from_cents(self.cost_price_cents),
            min_stock_level: self.min_stock_level,
            max_stock_level: self.max_stock_level,
            quantity_pricing_enabled: self.quantity_pricing_enabled,
            pricing_tiers,
            is_active: self.is_active,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TierRow {
    min_qty: i64,
    max_qty: i64,
    discount_kind: String,
    discount_value: i64,
}

impl TierRow {
    fn into_tier(self) -> DbResult<PricingTier> {
        let discount = match self.discount_kind.as_str() {
            "flat" => Discount::Flat(Money::from_cents(self.discount_value)),
            "percent" => {
                let bps = u32::try_from(self.discount_value).map_err(|_| {
                    DbError::Internal(format!("percent discount out of range: {}", self.discount_value))
                })?;
                Discount::Percent(DiscountRate::from_bps(bps))
            }
            other => return Err(DbError::Internal(format!("unknown discount kind: {other}"))),
        };
        Ok(PricingTier::new(self.min_qty, self.max_qty, discount))
    }
}

fn discount_columns(discount: &Discount) -> (&'static str, i64) {
    match discount {
        Discount::Flat(amount) => ("flat", amount.cents()),
        Discount::Percent(rate) => ("percent", i64::from(rate.bps())),
    }
}

async fn load_tiers<'e, E>(executor: E, line_id: &str) -> DbResult<Vec<PricingTier>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows: Vec<TierRow> = sqlx::query_as(
        "SELECT min_qty, max_qty, discount_kind, discount_value \
         FROM pricing_tiers WHERE line_id = ?1 ORDER BY position",
    )
    .bind(line_id)
    .fetch_all(executor)
    .await?;

    rows.into_iter().map(TierRow::into_tier).collect()
}

// =============================================================================
// Pool Reads
// =============================================================================

/// Read access to ledger lines.
#[derive(Debug, Clone)]
pub struct LineRepository {
    pool: SqlitePool,
}

impl LineRepository {
    pub fn new(pool: SqlitePool) -> Self {
        LineRepository { pool }
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<InventoryLine>> {
        let row: Option<LineRow> =
            sqlx::query_as(&format!("SELECT {LINE_COLUMNS} FROM inventory_lines WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => {
                let tiers = load_tiers(&self.pool, &row.id).await?;
                Ok(Some(row.into_line(tiers)))
            }
            None => Ok(None),
        }
    }

    pub async fn get_by_key(
        &self,
        retailer_id: &str,
        product_id: &str,
    ) -> DbResult<Option<InventoryLine>> {
        let row: Option<LineRow> = sqlx::query_as(&format!(
            "SELECT {LINE_COLUMNS} FROM inventory_lines WHERE retailer_id = ?1 AND product_id = ?2"
        ))
        .bind(retailer_id)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let tiers = load_tiers(&self.pool, &row.id).await?;
                Ok(Some(row.into_line(tiers)))
            }
            None => Ok(None),
        }
    }

    /// One page of a retailer's ledger, ordered by product.
    ///
    /// Low-stock and out-of-stock are computed in SQL from the stored
    /// counters, the same way [`InventoryLine::is_low_stock`] does.
    pub async fn list(
        &self,
        retailer_id: &str,
        filter: LineFilter,
        page: PageRequest,
    ) -> DbResult<Page<InventoryLine>> {
        debug!(retailer_id, ?filter, page = page.page, "Listing ledger lines");

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM inventory_lines");
        push_line_filters(&mut count, retailer_id, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {LINE_COLUMNS} FROM inventory_lines"));
        push_line_filters(&mut select, retailer_id, filter);
        select
            .push(" ORDER BY product_id LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());
        let rows: Vec<LineRow> = select.build_query_as().fetch_all(&self.pool).await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let tiers = load_tiers(&self.pool, &row.id).await?;
            items.push(row.into_line(tiers));
        }

        Ok(Page::new(items, total, page))
    }

    /// Every line id, retired ones included. Used by the audit.
    pub async fn all_ids(&self) -> DbResult<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM inventory_lines ORDER BY retailer_id, product_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

fn push_line_filters(qb: &mut QueryBuilder<'_, Sqlite>, retailer_id: &str, filter: LineFilter) {
    qb.push(" WHERE retailer_id = ").push_bind(retailer_id.to_string());
    if !filter.include_retired {
        qb.push(" AND is_active = 1");
    }
    if filter.low_stock_only {
        qb.push(" AND (current_stock - committed_stock) <= min_stock_level");
    }
    if filter.out_of_stock_only {
        qb.push(" AND (current_stock - committed_stock) = 0");
    }
}

// =============================================================================
// Transactional Writes
// =============================================================================

/// Takes SQLite's write lock with a no-op update so the rest of the
/// transaction reads the latest committed row. `false` if no row matched.
pub(crate) async fn claim_by_key(
    conn: &mut SqliteConnection,
    retailer_id: &str,
    product_id: &str,
) -> DbResult<bool> {
    let result = sqlx::query(
        "UPDATE inventory_lines SET version = version WHERE retailer_id = ?1 AND product_id = ?2",
    )
    .bind(retailer_id)
    .bind(product_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Claims every line of a retailer. Used when the lines a unit of work
/// touches are only known after a read.
///
/// The granularity is the retailer, not the line: order operations on
/// different lines of one retailer wait for each other. On SQLite this
/// costs nothing extra, since the first write of any transaction already
/// takes the database-wide write lock. A store with row locks would want
/// to claim only the order's lines instead.
pub(crate) async fn claim_retailer(conn: &mut SqliteConnection, retailer_id: &str) -> DbResult<u64> {
    let result = sqlx::query("UPDATE inventory_lines SET version = version WHERE retailer_id = ?1")
        .bind(retailer_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn claim_by_id(conn: &mut SqliteConnection, line_id: &str) -> DbResult<bool> {
    let result = sqlx::query("UPDATE inventory_lines SET version = version WHERE id = ?1")
        .bind(line_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn fetch_by_key(
    conn: &mut SqliteConnection,
    retailer_id: &str,
    product_id: &str,
) -> DbResult<Option<InventoryLine>> {
    let row: Option<LineRow> = sqlx::query_as(&format!(
        "SELECT {LINE_COLUMNS} FROM inventory_lines WHERE retailer_id = ?1 AND product_id = ?2"
    ))
    .bind(retailer_id)
    .bind(product_id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            let tiers = load_tiers(&mut *conn, &row.id).await?;
            Ok(Some(row.into_line(tiers)))
        }
        None => Ok(None),
    }
}

pub(crate) async fn fetch_by_id(
    conn: &mut SqliteConnection,
    line_id: &str,
) -> DbResult<Option<InventoryLine>> {
    let row: Option<LineRow> =
        sqlx::query_as(&format!("SELECT {LINE_COLUMNS} FROM inventory_lines WHERE id = ?1"))
            .bind(line_id)
            .fetch_optional(&mut *conn)
            .await?;

    match row {
        Some(row) => {
            let tiers = load_tiers(&mut *conn, &row.id).await?;
            Ok(Some(row.into_line(tiers)))
        }
        None => Ok(None),
    }
}

pub(crate) async fn insert(conn: &mut SqliteConnection, line: &InventoryLine) -> DbResult<()> {
    debug!(line_id = %line.id, key = %line.key(), "Inserting ledger line");

    sqlx::query(
        r#"
        INSERT INTO inventory_lines (
            id, retailer_id, product_id, current_stock, committed_stock, total_sold,
            selling_price_cents, cost_price_cents, min_stock_level, max_stock_level,
            quantity_pricing_enabled, is_active, version, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
    )
    .bind(&line.id)
    .bind(&line.retailer_id)
    .bind(&line.product_id)
    .bind(line.current_stock)
    .bind(line.committed_stock)
    .bind(line.total_sold)
    .bind(line.selling_price.cents())
    .bind(line.cost_price.cents())
    .bind(line.min_stock_level)
    .bind(line.max_stock_level)
    .bind(line.quantity_pricing_enabled)
    .bind(line.is_active)
    .bind(line.version)
    .bind(line.created_at)
    .bind(line.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| match DbError::from(e) {
        DbError::UniqueViolation { field, .. } => DbError::UniqueViolation {
            field,
            value: line.key().to_string(),
        },
        other => other,
    })?;

    Ok(())
}

/// Stores new stock counters and bumps `version` from `expected_version`.
pub(crate) async fn cas_update_levels(
    conn: &mut SqliteConnection,
    line_id: &str,
    expected_version: i64,
    levels: StockLevels,
    total_sold: i64,
    now: DateTime<Utc>,
) -> DbResult<i64> {
    let next_version = expected_version + 1;
    let result = sqlx::query(
        r#"
        UPDATE inventory_lines
        SET current_stock = ?1, committed_stock = ?2, total_sold = ?3,
            version = ?4, updated_at = ?5
        WHERE id = ?6 AND version = ?7
        "#,
    )
    .bind(levels.current)
    .bind(levels.committed)
    .bind(total_sold)
    .bind(next_version)
    .bind(now)
    .bind(line_id)
    .bind(expected_version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::write_conflict("inventory_line", line_id, expected_version));
    }
    Ok(next_version)
}

/// Stores prices, thresholds and flags from `line`, expecting
/// `line.version` to still be current. Returns the new version.
pub(crate) async fn cas_update_metadata(
    conn: &mut SqliteConnection,
    line: &InventoryLine,
    now: DateTime<Utc>,
) -> DbResult<i64> {
    let next_version = line.version + 1;
    let result = sqlx::query(
        r#"
        UPDATE inventory_lines
        SET selling_price_cents = ?1, cost_price_cents = ?2,
            min_stock_level = ?3, max_stock_level = ?4,
            quantity_pricing_enabled = ?5, is_active = ?6,
            version = ?7, updated_at = ?8
        WHERE id = ?9 AND version = ?10
        "#,
    )
    .bind(line.selling_price.cents())
    .bind(line.cost_price.cents())
    .bind(line.min_stock_level)
    .bind(line.max_stock_level)
    .bind(line.quantity_pricing_enabled)
    .bind(line.is_active)
    .bind(next_version)
    .bind(now)
    .bind(&line.id)
    .bind(line.version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::write_conflict("inventory_line", &line.id, line.version));
    }
    Ok(next_version)
}

/// Replaces the whole tier set of a line.
pub(crate) async fn replace_tiers(
    conn: &mut SqliteConnection,
    line_id: &str,
    tiers: &[PricingTier],
) -> DbResult<()> {
    sqlx::query("DELETE FROM pricing_tiers WHERE line_id = ?1")
        .bind(line_id)
        .execute(&mut *conn)
        .await?;

    for (position, tier) in tiers.iter().enumerate() {
        let (kind, value) = discount_columns(&tier.discount);
        sqlx::query(
            "INSERT INTO pricing_tiers (line_id, position, min_qty, max_qty, discount_kind, discount_value) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(line_id)
        .bind(position as i64)
        .bind(tier.min_qty)
        .bind(tier.max_qty)
        .bind(kind)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}
