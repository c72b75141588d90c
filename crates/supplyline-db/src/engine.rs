//! # Stock Mutation Engine
//!
//! The only code path that changes a ledger line's stock counters.
//!
//! ## One Mutation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  RetryPolicy::run("apply_mutation")                                     │
//! │  ┌───────────────────────────────────────────────────────────────────┐  │
//! │  │ BEGIN                                                             │  │
//! │  │   claim line            (write lock; waits on busy_timeout)       │  │
//! │  │   read line @ version v                                           │  │
//! │  │   mutation::apply(levels, m)   ── CoreError ──► rollback, return  │  │
//! │  │   UPDATE line ... version = v+1 WHERE version = v                 │  │
//! │  │   INSERT journal entry (line_version = v+1)                       │  │
//! │  │ COMMIT                                                            │  │
//! │  └───────────────────────────────────────────────────────────────────┘  │
//! │        Busy / WriteConflict ──► backoff, run the whole block again    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Line and journal entry commit together or not at all. Workflows that
//! span several lines call [`apply_in_tx`] repeatedly inside their own
//! transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::pool::Database;
use crate::repository::{journal, line};
use crate::retry::RetryPolicy;
use supplyline_core::mutation::{self, Mutation};
use supplyline_core::validation::{
    validate_id, validate_movement, validate_note, validate_stock_count,
};
use supplyline_core::{Clock, CoreError, InventoryLine, JournalEntry, LineKey, MutationContext};

/// A committed mutation: the line after it and the entry explaining it.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub line: InventoryLine,
    pub entry: JournalEntry,
}

/// Several mutations committed together on one line.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub line: InventoryLine,
    pub entries: Vec<JournalEntry>,
}

/// Applies stock mutations to single lines, atomically with their journal
/// entries, retrying transient storage failures.
#[derive(Clone)]
pub struct MutationEngine {
    db: Database,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for MutationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationEngine")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl MutationEngine {
    pub fn new(db: Database, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        MutationEngine { db, clock, retry }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Applies one mutation to the line at `key`.
    ///
    /// ## Errors
    /// - `LineNotFound` if the line does not exist or is retired
    /// - The rule error of the mutation kind (`InsufficientStock`, ...)
    /// - `StorageUnavailable` once transient failures outlast the retries
    pub async fn apply(
        &self,
        key: &LineKey,
        mutation: Mutation,
        ctx: &MutationContext,
    ) -> LedgerResult<MutationOutcome> {
        validate_request(key, std::slice::from_ref(&mutation), ctx)?;

        let outcome = self
            .retry
            .run("apply_mutation", move || async move {
                let mut tx = self.db.pool().begin().await?;
                let outcome = apply_in_tx(&mut tx, key, mutation, ctx, self.clock.now()).await?;
                tx.commit().await?;
                Ok(outcome)
            })
            .await?;

        info!(
            key = %key,
            kind = %outcome.entry.kind,
            quantity = outcome.entry.quantity,
            current = outcome.line.current_stock,
            committed = outcome.line.committed_stock,
            reason = ?ctx.reason,
            actor = %ctx.actor_id,
            "Mutation committed"
        );
        Ok(outcome)
    }

    /// Applies `mutations` in order to one line as a single unit: all of
    /// them commit or none does.
    pub async fn apply_all(
        &self,
        key: &LineKey,
        mutations: &[Mutation],
        ctx: &MutationContext,
    ) -> LedgerResult<BatchOutcome> {
        validate_request(key, mutations, ctx)?;
        if mutations.is_empty() {
            return Err(supplyline_core::ValidationError::Required {
                field: "mutations".to_string(),
            }
            .into());
        }

        let outcome = self
            .retry
            .run("apply_mutations", move || async move {
                let mut tx = self.db.pool().begin().await?;
                let now = self.clock.now();
                let mut entries = Vec::with_capacity(mutations.len());
                let mut last = None;
                for m in mutations {
                    let step = apply_in_tx(&mut tx, key, *m, ctx, now).await?;
                    entries.push(step.entry);
                    last = Some(step.line);
                }
                tx.commit().await?;
                let line = last.ok_or_else(|| CoreError::LineNotFound {
                    retailer_id: key.retailer_id.clone(),
                    product_id: key.product_id.clone(),
                })?;
                Ok(BatchOutcome { line, entries })
            })
            .await?;

        info!(
            key = %key,
            count = outcome.entries.len(),
            current = outcome.line.current_stock,
            committed = outcome.line.committed_stock,
            "Mutation batch committed"
        );
        Ok(outcome)
    }
}

fn validate_request(
    key: &LineKey,
    mutations: &[Mutation],
    ctx: &MutationContext,
) -> LedgerResult<()> {
    validate_id("retailer_id", &key.retailer_id)?;
    validate_id("product_id", &key.product_id)?;
    validate_id("actor_id", &ctx.actor_id)?;
    validate_note(ctx.note.as_deref())?;
    // Zero is a journaled no-op; workflows require positive quantities themselves
    for m in mutations {
        match m {
            Mutation::Adjust { target } => validate_stock_count("target", *target)?,
            other => validate_movement(other.quantity())?,
        }
    }
    Ok(())
}

/// Applies one mutation inside the caller's transaction.
///
/// Claims the line first, so calling this as the first statement of a
/// transaction is safe under concurrent writers.
pub(crate) async fn apply_in_tx(
    conn: &mut SqliteConnection,
    key: &LineKey,
    mutation: Mutation,
    ctx: &MutationContext,
    now: DateTime<Utc>,
) -> LedgerResult<MutationOutcome> {
    line::claim_by_key(conn, &key.retailer_id, &key.product_id).await?;

    let current = match line::fetch_by_key(conn, &key.retailer_id, &key.product_id).await? {
        Some(l) if l.is_active => l,
        _ => {
            return Err(CoreError::LineNotFound {
                retailer_id: key.retailer_id.clone(),
                product_id: key.product_id.clone(),
            }
            .into())
        }
    };

    let before = current.levels();
    let after = mutation::apply(before, &mutation)?;
    let total_sold = current
        .total_sold
        .checked_add(mutation.sold_delta(ctx.reason))
        .ok_or(CoreError::QuantityOverflow)?;

    let new_version =
        line::cas_update_levels(conn, &current.id, current.version, after, total_sold, now).await?;

    let entry = JournalEntry {
        id: Uuid::new_v4().to_string(),
        line_id: current.id.clone(),
        line_version: new_version,
        retailer_id: current.retailer_id.clone(),
        product_id: current.product_id.clone(),
        kind: mutation.kind(),
        quantity: mutation.quantity(),
        stock_before: before.current,
        stock_after: after.current,
        committed_before: before.committed,
        committed_after: after.committed,
        reason: ctx.reason,
        reference_kind: ctx.reference_kind,
        reference_id: ctx.reference_id.clone(),
        actor_id: ctx.actor_id.clone(),
        note: ctx.note.clone(),
        created_at: now,
    };
    journal::insert(conn, &entry).await?;

    debug!(
        line_id = %current.id,
        version = new_version,
        kind = %entry.kind,
        "Mutation applied in transaction"
    );

    let line = InventoryLine {
        current_stock: after.current,
        committed_stock: after.committed,
        total_sold,
        version: new_version,
        updated_at: now,
        ..current
    };
    Ok(MutationOutcome { line, entry })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::pool::DbConfig;
    use supplyline_core::mutation::replay;
    use supplyline_core::{Money, ReasonCode, SystemClock};

    async fn engine_with_line(current: i64) -> (MutationEngine, LineKey) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let l = InventoryLine {
            id: Uuid::new_v4().to_string(),
            retailer_id: "R1".to_string(),
            product_id: "P1".to_string(),
            current_stock: 0,
            committed_stock: 0,
            total_sold: 0,
            selling_price: Money::from_cents(100),
            cost_price: Money::from_cents(50),
            min_stock_level: 5,
            max_stock_level: 500,
            quantity_pricing_enabled: false,
            pricing_tiers: vec![],
            is_active: true,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        {
            let mut conn = db.pool().acquire().await.unwrap();
            line::insert(&mut conn, &l).await.unwrap();
        }
        let engine = MutationEngine::new(db, Arc::new(SystemClock), RetryPolicy::default());
        let key = l.key();
        if current > 0 {
            engine
                .apply(
                    &key,
                    Mutation::StockIn { quantity: current },
                    &MutationContext::manual("tester", ReasonCode::InitialStock),
                )
                .await
                .unwrap();
        }
        (engine, key)
    }

    fn ctx(reason: ReasonCode) -> MutationContext {
        MutationContext::manual("tester", reason)
    }

    #[tokio::test]
    async fn test_stock_out_sale_counts_total_sold() {
        let (engine, key) = engine_with_line(100).await;

        let out = engine
            .apply(&key, Mutation::StockOut { quantity: 30 }, &ctx(ReasonCode::Sale))
            .await
            .unwrap();
        assert_eq!(out.line.current_stock, 70);
        assert_eq!(out.line.total_sold, 30);
        assert_eq!(out.entry.stock_before, 100);
        assert_eq!(out.entry.stock_after, 70);

        let out = engine
            .apply(&key, Mutation::StockOut { quantity: 5 }, &ctx(ReasonCode::Damage))
            .await
            .unwrap();
        assert_eq!(out.line.total_sold, 30);
    }

    #[tokio::test]
    async fn test_failed_rule_leaves_line_and_journal_untouched() {
        let (engine, key) = engine_with_line(10).await;
        let before = engine.database().lines().get_by_key("R1", "P1").await.unwrap().unwrap();

        let err = engine
            .apply(&key, Mutation::Release { quantity: 1 }, &ctx(ReasonCode::Correction))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::OverRelease { .. })));

        let after = engine.database().lines().get_by_key("R1", "P1").await.unwrap().unwrap();
        assert_eq!(before, after);
        let history = engine.database().journal().replay_order(&after.id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_line_is_line_not_found() {
        let (engine, _) = engine_with_line(0).await;
        let err = engine
            .apply(
                &LineKey::new("R1", "NOPE"),
                Mutation::StockIn { quantity: 1 },
                &ctx(ReasonCode::Purchase),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::LineNotFound { .. })));
    }

    #[tokio::test]
    async fn test_invalid_input_rejected_before_storage() {
        let (engine, key) = engine_with_line(0).await;
        let err = engine
            .apply(
                &key,
                Mutation::StockIn { quantity: supplyline_core::MAX_LINE_QUANTITY + 1 },
                &ctx(ReasonCode::Purchase),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::Validation(_))));

        let err = engine
            .apply(
                &key,
                Mutation::StockIn { quantity: 1 },
                &MutationContext::manual("", ReasonCode::Purchase),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_zero_quantity_is_journaled_no_op() {
        let (engine, key) = engine_with_line(10).await;

        let out = engine
            .apply(&key, Mutation::StockIn { quantity: 0 }, &ctx(ReasonCode::InitialStock))
            .await
            .unwrap();
        assert_eq!(out.line.current_stock, 10);
        assert_eq!(out.entry.quantity, 0);
        assert_eq!(out.entry.stock_before, out.entry.stock_after);

        let history = engine.database().journal().replay_order(&out.line.id).await.unwrap();
        assert_eq!(history.len(), 2);

        for m in [
            Mutation::StockOut { quantity: 0 },
            Mutation::Reserve { quantity: 0 },
            Mutation::Release { quantity: 0 },
        ] {
            let out = engine.apply(&key, m, &ctx(ReasonCode::Correction)).await.unwrap();
            assert_eq!(out.entry.levels_before(), out.entry.levels_after());
        }

        let err = engine
            .apply(&key, Mutation::StockIn { quantity: -1 }, &ctx(ReasonCode::Purchase))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let (engine, key) = engine_with_line(10).await;

        let err = engine
            .apply_all(
                &key,
                &[
                    Mutation::Reserve { quantity: 6 },
                    Mutation::Reserve { quantity: 6 },
                ],
                &ctx(ReasonCode::OrderReserved),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Rule(CoreError::InsufficientAvailableStock { available: 4, .. })
        ));

        let line = engine.database().lines().get_by_key("R1", "P1").await.unwrap().unwrap();
        assert_eq!(line.committed_stock, 0);

        let ok = engine
            .apply_all(
                &key,
                &[
                    Mutation::Reserve { quantity: 6 },
                    Mutation::Release { quantity: 6 },
                    Mutation::Adjust { target: 42 },
                ],
                &ctx(ReasonCode::Correction),
            )
            .await
            .unwrap();
        assert_eq!(ok.entries.len(), 3);
        assert_eq!(ok.line.current_stock, 42);
    }

    #[tokio::test]
    async fn test_journal_replays_to_ledger() {
        let (engine, key) = engine_with_line(100).await;
        for (m, reason) in [
            (Mutation::Reserve { quantity: 40 }, ReasonCode::OrderReserved),
            (Mutation::StockOut { quantity: 60 }, ReasonCode::Sale),
            (Mutation::StockIn { quantity: 15 }, ReasonCode::Purchase),
            (Mutation::Release { quantity: 10 }, ReasonCode::OrderCancelled),
            (Mutation::Adjust { target: 50 }, ReasonCode::Correction),
        ] {
            engine.apply(&key, m, &ctx(reason)).await.unwrap();
        }

        let line = engine.database().lines().get_by_key("R1", "P1").await.unwrap().unwrap();
        let history = engine.database().journal().replay_order(&line.id).await.unwrap();
        assert_eq!(history.len(), 6);
        assert_eq!(replay(&history).unwrap(), line.levels());
        assert!(line.levels().is_consistent());
    }
}
