//! # Journal Repository
//!
//! Append-only history in `journal_entries`. Rows are inserted by the
//! engine inside the mutation's transaction; triggers refuse UPDATE and
//! DELETE at the storage level.

use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use supplyline_core::{JournalEntry, JournalFilter, MutationKind, Page, PageRequest};

const JOURNAL_COLUMNS: &str = "id, line_id, line_version, retailer_id, product_id, kind, \
     quantity, stock_before, stock_after, committed_before, committed_after, reason, \
     reference_kind, reference_id, actor_id, note, created_at";

/// Read access to the journal.
#[derive(Debug, Clone)]
pub struct JournalRepository {
    pool: SqlitePool,
}

impl JournalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        JournalRepository { pool }
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<JournalEntry>> {
        let entry: Option<JournalEntry> = sqlx::query_as(&format!(
            "SELECT {JOURNAL_COLUMNS} FROM journal_entries WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Entries of one line, newest first.
    pub async fn for_line(
        &self,
        line_id: &str,
        filter: &JournalFilter,
        page: PageRequest,
    ) -> DbResult<Page<JournalEntry>> {
        debug!(line_id, ?filter, page = page.page, "Listing journal for line");

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM journal_entries");
        count.push(" WHERE line_id = ").push_bind(line_id.to_string());
        push_journal_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {JOURNAL_COLUMNS} FROM journal_entries"));
        select.push(" WHERE line_id = ").push_bind(line_id.to_string());
        push_journal_filter(&mut select, filter);
        select
            .push(" ORDER BY line_version DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());
        let items: Vec<JournalEntry> = select.build_query_as().fetch_all(&self.pool).await?;

        Ok(Page::new(items, total, page))
    }

    /// Entries tagged with an order or transfer id, oldest first.
    pub async fn for_reference(
        &self,
        reference_id: &str,
        page: PageRequest,
    ) -> DbResult<Page<JournalEntry>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM journal_entries WHERE reference_id = ?1")
                .bind(reference_id)
                .fetch_one(&self.pool)
                .await?;

        let items: Vec<JournalEntry> = sqlx::query_as(&format!(
            "SELECT {JOURNAL_COLUMNS} FROM journal_entries WHERE reference_id = ?1 \
             ORDER BY created_at, line_id, line_version LIMIT ?2 OFFSET ?3"
        ))
        .bind(reference_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(Page::new(items, total, page))
    }

    /// The complete history of a line in replay order.
    pub async fn replay_order(&self, line_id: &str) -> DbResult<Vec<JournalEntry>> {
        let entries: Vec<JournalEntry> = sqlx::query_as(&format!(
            "SELECT {JOURNAL_COLUMNS} FROM journal_entries WHERE line_id = ?1 ORDER BY line_version"
        ))
        .bind(line_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

fn push_journal_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &JournalFilter) {
    if !filter.kinds.is_empty() {
        qb.push(" AND kind IN (");
        let mut kinds = qb.separated(", ");
        for kind in &filter.kinds {
            kinds.push_bind(kind.as_str());
        }
        kinds.push_unseparated(")");
    }
    if let Some(from) = filter.from {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.to {
        qb.push(" AND created_at <= ").push_bind(to);
    }
}

// =============================================================================
// Transactional Access
// =============================================================================

pub(crate) async fn insert(conn: &mut SqliteConnection, entry: &JournalEntry) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO journal_entries (
            id, line_id, line_version, retailer_id, product_id, kind, quantity,
            stock_before, stock_after, committed_before, committed_after, reason,
            reference_kind, reference_id, actor_id, note, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        "#,
    )
    .bind(&entry.id)
    .bind(&entry.line_id)
    .bind(entry.line_version)
    .bind(&entry.retailer_id)
    .bind(&entry.product_id)
    .bind(entry.kind)
    .bind(entry.quantity)
    .bind(entry.stock_before)
    .bind(entry.stock_after)
    .bind(entry.committed_before)
    .bind(entry.committed_after)
    .bind(entry.reason)
    .bind(entry.reference_kind)
    .bind(&entry.reference_id)
    .bind(&entry.actor_id)
    .bind(&entry.note)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;

    debug!(
        entry_id = %entry.id,
        line_id = %entry.line_id,
        version = entry.line_version,
        kind = %entry.kind,
        "Journal entry appended"
    );
    Ok(())
}

/// Net quantity an order still holds per product at a retailer:
/// `Σ reserve − Σ release` over entries tagged with the order.
pub(crate) async fn outstanding_for_order(
    conn: &mut SqliteConnection,
    retailer_id: &str,
    order_id: &str,
) -> DbResult<OrderHoldings> {
    let rows: Vec<(String, i64, i64)> = sqlx::query_as(
        r#"
        SELECT product_id,
               COALESCE(SUM(CASE WHEN kind = ?3 THEN quantity ELSE 0 END), 0) AS reserved,
               COALESCE(SUM(CASE WHEN kind = ?4 THEN quantity ELSE 0 END), 0) AS released
        FROM journal_entries
        WHERE retailer_id = ?1 AND reference_kind = 'order' AND reference_id = ?2
        GROUP BY product_id
        ORDER BY product_id
        "#,
    )
    .bind(retailer_id)
    .bind(order_id)
    .bind(MutationKind::Reserve.as_str())
    .bind(MutationKind::Release.as_str())
    .fetch_all(&mut *conn)
    .await?;

    let outstanding = rows
        .into_iter()
        .filter_map(|(product_id, reserved, released)| {
            let held = reserved - released;
            (held > 0).then_some((product_id, held))
        })
        .collect();

    Ok(OrderHoldings { outstanding })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct OrderHoldings {
    /// `(product_id, quantity)` with quantity > 0, ordered by product.
    pub outstanding: Vec<(String, i64)>,
}
