//! # Transfer Repository
//!
//! Storage for transfer requests, their lines, the idempotent transfer
//! records and the decision log.
//!
//! ```text
//!   transfer_requests ──┬── transfer_request_lines   (product, requested, fulfilled)
//!                       ├── transfer_records         UNIQUE (request_id, idempotency_token)
//!                       │     └── transfer_record_lines ──► journal_entries
//!                       └── transfer_request_log     (append-only)
//! ```

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use supplyline_core::{
    AdvisoryLock, DecisionKind, Page, PageRequest, TransferLine, TransferLogEntry,
    TransferPriority, TransferRecord, TransferRecordLine, TransferRequest, TransferStatus,
};

const REQUEST_COLUMNS: &str = "id, retailer_id, status, priority, lock_holder, lock_expires_at, \
     note, version, created_at, updated_at";

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    id: String,
    retailer_id: String,
    status: TransferStatus,
    priority: TransferPriority,
    lock_holder: Option<String>,
    lock_expires_at: Option<DateTime<Utc>>,
    note: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RequestRow {
    fn into_request(self, lines: Vec<TransferLine>) -> TransferRequest {
        let lock = match (self.lock_holder, self.lock_expires_at) {
            (Some(holder), Some(expires_at)) => Some(AdvisoryLock { holder, expires_at }),
            _ => None,
        };
        TransferRequest {
            id: self.id,
            retailer_id: self.retailer_id,
            status: self.status,
            priority: self.priority,
            lines,
            lock,
            note: self.note,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: String,
    request_id: String,
    idempotency_token: String,
    actor_id: String,
    decision: DecisionKind,
    resulting_status: TransferStatus,
    created_at: DateTime<Utc>,
}

impl RecordRow {
    fn into_record(self, lines: Vec<TransferRecordLine>) -> TransferRecord {
        TransferRecord {
            id: self.id,
            request_id: self.request_id,
            idempotency_token: self.idempotency_token,
            actor_id: self.actor_id,
            decision: self.decision,
            resulting_status: self.resulting_status,
            lines,
            created_at: self.created_at,
        }
    }
}

// =============================================================================
// Pool Reads
// =============================================================================

/// Read access to transfer requests and their history.
#[derive(Debug, Clone)]
pub struct TransferRepository {
    pool: SqlitePool,
}

impl TransferRepository {
    pub fn new(pool: SqlitePool) -> Self {
        TransferRepository { pool }
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<TransferRequest>> {
        let mut conn = self.pool.acquire().await?;
        fetch(&mut conn, id).await
    }

    /// A retailer's requests, newest first.
    ///
    /// `status` filters on the effective status at `now`: a `locked` row
    /// whose lock has expired counts as `pending`.
    pub async fn list(
        &self,
        retailer_id: &str,
        status: Option<TransferStatus>,
        page: PageRequest,
        now: DateTime<Utc>,
    ) -> DbResult<Page<TransferRequest>> {
        debug!(retailer_id, ?status, page = page.page, "Listing transfer requests");

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM transfer_requests");
        push_request_filters(&mut count, retailer_id, status, now);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {REQUEST_COLUMNS} FROM transfer_requests"));
        push_request_filters(&mut select, retailer_id, status, now);
        select
            .push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());
        let rows: Vec<RequestRow> = select.build_query_as().fetch_all(&self.pool).await?;

        let mut conn = self.pool.acquire().await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let lines = fetch_lines(&mut conn, &row.id).await?;
            items.push(row.into_request(lines));
        }

        Ok(Page::new(items, total, page))
    }

    /// Every committed decision on a request, oldest first.
    pub async fn records(&self, request_id: &str) -> DbResult<Vec<TransferRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            "SELECT id, request_id, idempotency_token, actor_id, decision, resulting_status, created_at \
             FROM transfer_records WHERE request_id = ?1 ORDER BY created_at, id",
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        let mut conn = self.pool.acquire().await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let lines = fetch_record_lines(&mut conn, &row.id).await?;
            records.push(row.into_record(lines));
        }
        Ok(records)
    }

    pub async fn find_record(
        &self,
        request_id: &str,
        idempotency_token: &str,
    ) -> DbResult<Option<TransferRecord>> {
        let mut conn = self.pool.acquire().await?;
        find_record(&mut conn, request_id, idempotency_token).await
    }

    /// Decision log of a request, oldest first.
    pub async fn log(&self, request_id: &str) -> DbResult<Vec<TransferLogEntry>> {
        let entries: Vec<TransferLogEntry> = sqlx::query_as(
            "SELECT id, request_id, actor_id, action, note, created_at \
             FROM transfer_request_log WHERE request_id = ?1 ORDER BY id",
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

fn push_request_filters(
    qb: &mut QueryBuilder<'_, Sqlite>,
    retailer_id: &str,
    status: Option<TransferStatus>,
    now: DateTime<Utc>,
) {
    qb.push(" WHERE retailer_id = ").push_bind(retailer_id.to_string());
    match status {
        None => {}
        Some(TransferStatus::Pending) => {
            qb.push(" AND (status = 'pending' OR (status = 'locked' AND lock_expires_at <= ")
                .push_bind(now)
                .push("))");
        }
        Some(TransferStatus::Locked) => {
            qb.push(" AND status = 'locked' AND lock_expires_at > ")
                .push_bind(now);
        }
        Some(other) => {
            qb.push(" AND status = ").push_bind(other.as_str());
        }
    }
}

// =============================================================================
// Transactional Access
// =============================================================================

/// No-op write that takes SQLite's write lock before any read.
/// `false` if the request does not exist.
pub(crate) async fn claim(conn: &mut SqliteConnection, id: &str) -> DbResult<bool> {
    let result = sqlx::query("UPDATE transfer_requests SET version = version WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn fetch(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<TransferRequest>> {
    let row: Option<RequestRow> = sqlx::query_as(&format!(
        "SELECT {REQUEST_COLUMNS} FROM transfer_requests WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            let lines = fetch_lines(conn, &row.id).await?;
            Ok(Some(row.into_request(lines)))
        }
        None => Ok(None),
    }
}

async fn fetch_lines(conn: &mut SqliteConnection, request_id: &str) -> DbResult<Vec<TransferLine>> {
    let rows: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT product_id, requested_qty, fulfilled_qty FROM transfer_request_lines \
         WHERE request_id = ?1 ORDER BY position",
    )
    .bind(request_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(product_id, requested_qty, fulfilled_qty)| TransferLine {
            product_id,
            requested_qty,
            fulfilled_qty,
        })
        .collect())
}

pub(crate) async fn insert_request(
    conn: &mut SqliteConnection,
    request: &TransferRequest,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO transfer_requests (
            id, retailer_id, status, priority, lock_holder, lock_expires_at,
            note, version, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(&request.id)
    .bind(&request.retailer_id)
    .bind(request.status)
    .bind(request.priority)
    .bind(request.lock.as_ref().map(|l| l.holder.as_str()))
    .bind(request.lock.as_ref().map(|l| l.expires_at))
    .bind(&request.note)
    .bind(request.version)
    .bind(request.created_at)
    .bind(request.updated_at)
    .execute(&mut *conn)
    .await?;

    for (position, line) in request.lines.iter().enumerate() {
        sqlx::query(
            "INSERT INTO transfer_request_lines (request_id, position, product_id, requested_qty, fulfilled_qty) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&request.id)
        .bind(position as i64)
        .bind(&line.product_id)
        .bind(line.requested_qty)
        .bind(line.fulfilled_qty)
        .execute(&mut *conn)
        .await?;
    }

    debug!(request_id = %request.id, lines = request.lines.len(), "Transfer request inserted");
    Ok(())
}

/// Writes status, lock and line progress from `next`, expecting the stored
/// row to still be at `expected_version`. Returns the new version.
pub(crate) async fn cas_update(
    conn: &mut SqliteConnection,
    next: &TransferRequest,
    expected_version: i64,
) -> DbResult<i64> {
    let next_version = expected_version + 1;
    let result = sqlx::query(
        r#"
        UPDATE transfer_requests
        SET status = ?1, lock_holder = ?2, lock_expires_at = ?3,
            version = ?4, updated_at = ?5
        WHERE id = ?6 AND version = ?7
        "#,
    )
    .bind(next.status)
    .bind(next.lock.as_ref().map(|l| l.holder.as_str()))
    .bind(next.lock.as_ref().map(|l| l.expires_at))
    .bind(next_version)
    .bind(next.updated_at)
    .bind(&next.id)
    .bind(expected_version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::write_conflict("transfer_request", &next.id, expected_version));
    }

    for line in &next.lines {
        sqlx::query(
            "UPDATE transfer_request_lines SET fulfilled_qty = ?1 \
             WHERE request_id = ?2 AND product_id = ?3 AND fulfilled_qty <= ?1",
        )
        .bind(line.fulfilled_qty)
        .bind(&next.id)
        .bind(&line.product_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok(next_version)
}

pub(crate) async fn find_record(
    conn: &mut SqliteConnection,
    request_id: &str,
    idempotency_token: &str,
) -> DbResult<Option<TransferRecord>> {
    let row: Option<RecordRow> = sqlx::query_as(
        "SELECT id, request_id, idempotency_token, actor_id, decision, resulting_status, created_at \
         FROM transfer_records WHERE request_id = ?1 AND idempotency_token = ?2",
    )
    .bind(request_id)
    .bind(idempotency_token)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            let lines = fetch_record_lines(conn, &row.id).await?;
            Ok(Some(row.into_record(lines)))
        }
        None => Ok(None),
    }
}

async fn fetch_record_lines(
    conn: &mut SqliteConnection,
    record_id: &str,
) -> DbResult<Vec<TransferRecordLine>> {
    let rows: Vec<(String, i64, String)> = sqlx::query_as(
        "SELECT product_id, quantity, journal_entry_id FROM transfer_record_lines \
         WHERE record_id = ?1 ORDER BY product_id",
    )
    .bind(record_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(product_id, quantity, journal_entry_id)| TransferRecordLine {
            product_id,
            quantity,
            journal_entry_id,
        })
        .collect())
}

/// Inserts a record and its lines. A second record for the same
/// `(request_id, idempotency_token)` fails with `UniqueViolation`.
pub(crate) async fn insert_record(
    conn: &mut SqliteConnection,
    record: &TransferRecord,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO transfer_records (
            id, request_id, idempotency_token, actor_id, decision, resulting_status, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&record.id)
    .bind(&record.request_id)
    .bind(&record.idempotency_token)
    .bind(&record.actor_id)
    .bind(record.decision)
    .bind(record.resulting_status)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await?;

    for line in &record.lines {
        sqlx::query(
            "INSERT INTO transfer_record_lines (record_id, product_id, quantity, journal_entry_id) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&record.id)
        .bind(&line.product_id)
        .bind(line.quantity)
        .bind(&line.journal_entry_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

pub(crate) async fn append_log(
    conn: &mut SqliteConnection,
    request_id: &str,
    actor_id: &str,
    action: &str,
    note: Option<&str>,
    at: DateTime<Utc>,
) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO transfer_request_log (request_id, actor_id, action, note, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(request_id)
    .bind(actor_id)
    .bind(action)
    .bind(note)
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
