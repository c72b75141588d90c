//! # Reservation Workflow
//!
//! Holds stock for an order, then either ships it or gives it back.
//!
//! ```text
//!   reserve_for_order ──► {current, committed + q}
//!          │
//!          ├── confirm_delivery ──► RELEASE q, STOCK_OUT q (SALE) ──► {current − q, committed}
//!          │
//!          └── cancel_reservation ──► RELEASE q ──► {current, committed}
//! ```
//!
//! What an order holds is read from the journal: the sum of its RESERVE
//! entries minus the sum of its RELEASE entries, per product. Each call
//! runs in one transaction that starts by claiming every line of the
//! retailer, so two calls for the same retailer never interleave. That
//! serializes a whole retailer rather than single lines; under SQLite's
//! single writer the two are the same.

use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{error, info, warn};

use crate::engine::{apply_in_tx, MutationEngine, MutationOutcome};
use crate::error::{LedgerError, LedgerResult};
use crate::repository::{journal, line};
use supplyline_core::validation::{validate_id, validate_items, validate_note, validate_quantity};
use supplyline_core::{
    CoreError, InventoryLine, ItemQuantity, JournalEntry, LineKey, Mutation, MutationContext,
    ReasonCode,
};

/// Lines and journal entries touched by one order operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderOutcome {
    pub order_id: String,
    pub retailer_id: String,
    /// State of each touched line after the call, ordered by product.
    pub lines: Vec<InventoryLine>,
    pub entries: Vec<JournalEntry>,
}

impl OrderOutcome {
    fn empty(order_id: &str, retailer_id: &str) -> Self {
        OrderOutcome {
            order_id: order_id.to_string(),
            retailer_id: retailer_id.to_string(),
            lines: Vec::new(),
            entries: Vec::new(),
        }
    }

    fn push(&mut self, outcome: MutationOutcome) {
        match self.lines.last_mut() {
            Some(last) if last.id == outcome.line.id => *last = outcome.line,
            _ => self.lines.push(outcome.line),
        }
        self.entries.push(outcome.entry);
    }

    pub fn total_quantity(&self, kind: supplyline_core::MutationKind) -> i64 {
        self.entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.quantity)
            .sum()
    }
}

/// Order-facing stock operations.
#[derive(Debug, Clone)]
pub struct ReservationWorkflow {
    engine: MutationEngine,
}

impl ReservationWorkflow {
    pub fn new(engine: MutationEngine) -> Self {
        ReservationWorkflow { engine }
    }

    /// Reserves every item for `order_id` at `retailer_id`, or nothing.
    ///
    /// Items for the same product are merged. If a line refuses its share,
    /// the lines already reserved in this call are released again with
    /// reason `RESERVATION_ROLLBACK` before the rule error is returned.
    ///
    /// ## Errors
    /// - `ReservationExists` while the order still holds stock here
    /// - `InsufficientAvailableStock` / `LineNotFound` from the failing line
    pub async fn reserve_for_order(
        &self,
        order_id: &str,
        retailer_id: &str,
        items: &[ItemQuantity],
        actor_id: &str,
    ) -> LedgerResult<OrderOutcome> {
        validate_id("order_id", order_id)?;
        validate_id("retailer_id", retailer_id)?;
        validate_id("actor_id", actor_id)?;
        validate_items(items, false)?;
        let merged = merge_items(items)?;

        let ctx = MutationContext::for_order(actor_id, ReasonCode::OrderReserved, order_id);
        let merged = &merged;
        let ctx = &ctx;

        let outcome = self
            .engine
            .retry()
            .run("reserve_for_order", move || async move {
                let mut tx = self.engine.database().pool().begin().await?;
                let now = self.engine.clock().now();
                line::claim_retailer(&mut tx, retailer_id).await?;

                let holdings = journal::outstanding_for_order(&mut tx, retailer_id, order_id).await?;
                if !holdings.outstanding.is_empty() {
                    return Err(CoreError::ReservationExists {
                        order_id: order_id.to_string(),
                    }
                    .into());
                }

                let mut outcome = OrderOutcome::empty(order_id, retailer_id);
                for (product_id, quantity) in merged {
                    let key = LineKey::new(retailer_id, product_id.as_str());
                    let step = apply_in_tx(
                        &mut tx,
                        &key,
                        Mutation::Reserve { quantity: *quantity },
                        ctx,
                        now,
                    )
                    .await;
                    match step {
                        Ok(step) => outcome.push(step),
                        Err(e @ LedgerError::Rule(_)) if !outcome.entries.is_empty() => {
                            if roll_back_reserved(&mut tx, &outcome, ctx, now, &e).await {
                                if let Err(commit_err) = tx.commit().await {
                                    error!(
                                        order_id,
                                        error = %commit_err,
                                        "Compensating release not committed, reservation discarded"
                                    );
                                }
                            }
                            return Err(e);
                        }
                        Err(e) => return Err(e),
                    }
                }

                tx.commit().await?;
                Ok(outcome)
            })
            .await?;

        info!(
            order_id,
            retailer_id,
            lines = outcome.lines.len(),
            units = outcome.total_quantity(supplyline_core::MutationKind::Reserve),
            "Order reserved"
        );
        Ok(outcome)
    }

    /// Ships what the order holds: each outstanding quantity is released
    /// and then sold off the shelf.
    ///
    /// ## Errors
    /// - `NoReservationFound` if the order holds nothing at this retailer
    pub async fn confirm_delivery(
        &self,
        order_id: &str,
        retailer_id: &str,
        actor_id: &str,
    ) -> LedgerResult<OrderOutcome> {
        validate_id("order_id", order_id)?;
        validate_id("retailer_id", retailer_id)?;
        validate_id("actor_id", actor_id)?;

        let release_ctx = MutationContext::for_order(actor_id, ReasonCode::OrderDelivered, order_id);
        let sale_ctx = release_ctx.with_reason(ReasonCode::Sale);
        let (release_ctx, sale_ctx) = (&release_ctx, &sale_ctx);

        let outcome = self
            .engine
            .retry()
            .run("confirm_delivery", move || async move {
                let mut tx = self.engine.database().pool().begin().await?;
                let now = self.engine.clock().now();
                line::claim_retailer(&mut tx, retailer_id).await?;

                let holdings = journal::outstanding_for_order(&mut tx, retailer_id, order_id).await?;
                if holdings.outstanding.is_empty() {
                    return Err(CoreError::NoReservationFound {
                        order_id: order_id.to_string(),
                        retailer_id: retailer_id.to_string(),
                    }
                    .into());
                }

                let mut outcome = OrderOutcome::empty(order_id, retailer_id);
                for (product_id, quantity) in &holdings.outstanding {
                    let key = LineKey::new(retailer_id, product_id.as_str());
                    let quantity = *quantity;
                    outcome.push(
                        apply_in_tx(&mut tx, &key, Mutation::Release { quantity }, release_ctx, now)
                            .await?,
                    );
                    outcome.push(
                        apply_in_tx(&mut tx, &key, Mutation::StockOut { quantity }, sale_ctx, now)
                            .await?,
                    );
                }

                tx.commit().await?;
                Ok(outcome)
            })
            .await?;

        info!(
            order_id,
            retailer_id,
            lines = outcome.lines.len(),
            units = outcome.total_quantity(supplyline_core::MutationKind::StockOut),
            "Order delivered"
        );
        Ok(outcome)
    }

    /// Gives back whatever the order still holds. Physical stock is not
    /// touched. Cancelling an order that holds nothing succeeds with an
    /// empty outcome.
    pub async fn cancel_reservation(
        &self,
        order_id: &str,
        retailer_id: &str,
        reason: Option<&str>,
        actor_id: &str,
    ) -> LedgerResult<OrderOutcome> {
        validate_id("order_id", order_id)?;
        validate_id("retailer_id", retailer_id)?;
        validate_id("actor_id", actor_id)?;
        validate_note(reason)?;

        let mut ctx = MutationContext::for_order(actor_id, ReasonCode::OrderCancelled, order_id);
        if let Some(reason) = reason {
            ctx = ctx.with_note(reason);
        }
        let ctx = &ctx;

        let outcome = self
            .engine
            .retry()
            .run("cancel_reservation", move || async move {
                let mut tx = self.engine.database().pool().begin().await?;
                let now = self.engine.clock().now();
                line::claim_retailer(&mut tx, retailer_id).await?;

                let holdings = journal::outstanding_for_order(&mut tx, retailer_id, order_id).await?;
                let mut outcome = OrderOutcome::empty(order_id, retailer_id);
                if holdings.outstanding.is_empty() {
                    return Ok(outcome);
                }

                for (product_id, quantity) in &holdings.outstanding {
                    let key = LineKey::new(retailer_id, product_id.as_str());
                    outcome.push(
                        apply_in_tx(&mut tx, &key, Mutation::Release { quantity: *quantity }, ctx, now)
                            .await?,
                    );
                }

                tx.commit().await?;
                Ok(outcome)
            })
            .await?;

        if outcome.entries.is_empty() {
            info!(order_id, retailer_id, "Nothing reserved, cancel is a no-op");
        } else {
            info!(
                order_id,
                retailer_id,
                lines = outcome.lines.len(),
                units = outcome.total_quantity(supplyline_core::MutationKind::Release),
                "Reservation cancelled"
            );
        }
        Ok(outcome)
    }
}

/// Sums quantities per product, ordered by product id.
fn merge_items(items: &[ItemQuantity]) -> LedgerResult<Vec<(String, i64)>> {
    let mut merged: BTreeMap<&str, i64> = BTreeMap::new();
    for item in items {
        let total = merged.entry(item.product_id.as_str()).or_insert(0);
        *total = total
            .checked_add(item.quantity)
            .ok_or(CoreError::QuantityOverflow)?;
    }
    merged
        .into_iter()
        .map(|(product_id, quantity)| {
            validate_quantity(quantity)?;
            Ok((product_id.to_string(), quantity))
        })
        .collect()
}

/// Releases what this call reserved so far, inside the same transaction.
/// `false` if a release failed; the caller must then drop the transaction.
async fn roll_back_reserved(
    conn: &mut SqliteConnection,
    reserved: &OrderOutcome,
    ctx: &MutationContext,
    now: chrono::DateTime<chrono::Utc>,
    cause: &LedgerError,
) -> bool {
    let rollback_ctx = ctx.with_reason(ReasonCode::ReservationRollback);
    for entry in reserved.entries.iter().rev() {
        let key = LineKey::new(&entry.retailer_id, &entry.product_id);
        let release = Mutation::Release {
            quantity: entry.quantity,
        };
        if let Err(e) = apply_in_tx(&mut *conn, &key, release, &rollback_ctx, now).await {
            error!(
                order_id = ?ctx.reference_id,
                product_id = %entry.product_id,
                error = %e,
                "Compensating release failed"
            );
            return false;
        }
    }
    warn!(
        order_id = ?ctx.reference_id,
        released = reserved.entries.len(),
        cause = %cause,
        "Partial reservation rolled back"
    );
    true
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{engine, file_db, levels_of, memory_db, stocked_line};
    use supplyline_core::{MutationKind, PageRequest};

    async fn workflow_with(lines: &[(&str, i64)]) -> ReservationWorkflow {
        let db = memory_db().await;
        let engine = engine(&db);
        for (product, stock) in lines {
            stocked_line(&engine, "R1", product, *stock).await;
        }
        ReservationWorkflow::new(engine)
    }

    fn db(workflow: &ReservationWorkflow) -> &crate::pool::Database {
        workflow.engine.database()
    }

    #[tokio::test]
    async fn test_reserve_then_deliver() {
        let wf = workflow_with(&[("P1", 100)]).await;

        wf.reserve_for_order("O1", "R1", &[ItemQuantity::new("P1", 30)], "clerk")
            .await
            .unwrap();
        assert_eq!(levels_of(db(&wf), "R1", "P1").await, (100, 30));

        let delivered = wf.confirm_delivery("O1", "R1", "clerk").await.unwrap();
        assert_eq!(delivered.entries.len(), 2);
        assert_eq!(levels_of(db(&wf), "R1", "P1").await, (70, 0));

        let line = db(&wf).lines().get_by_key("R1", "P1").await.unwrap().unwrap();
        assert_eq!(line.total_sold, 30);
    }

    #[tokio::test]
    async fn test_reserve_then_cancel() {
        let wf = workflow_with(&[("P1", 100)]).await;

        wf.reserve_for_order("O1", "R1", &[ItemQuantity::new("P1", 30)], "clerk")
            .await
            .unwrap();
        let cancelled = wf
            .cancel_reservation("O1", "R1", Some("customer changed mind"), "clerk")
            .await
            .unwrap();
        assert_eq!(cancelled.entries[0].note.as_deref(), Some("customer changed mind"));
        assert_eq!(levels_of(db(&wf), "R1", "P1").await, (100, 0));
    }

    #[tokio::test]
    async fn test_cancel_twice_is_noop() {
        let wf = workflow_with(&[("P1", 100)]).await;
        wf.reserve_for_order("O1", "R1", &[ItemQuantity::new("P1", 30)], "clerk")
            .await
            .unwrap();

        wf.cancel_reservation("O1", "R1", None, "clerk").await.unwrap();
        let second = wf.cancel_reservation("O1", "R1", None, "clerk").await.unwrap();
        assert!(second.entries.is_empty());
        assert_eq!(levels_of(db(&wf), "R1", "P1").await, (100, 0));

        let never = wf.cancel_reservation("O-unknown", "R1", None, "clerk").await.unwrap();
        assert!(never.entries.is_empty());
    }

    #[tokio::test]
    async fn test_reserve_boundary() {
        let wf = workflow_with(&[("P1", 50)]).await;

        let err = wf
            .reserve_for_order("O1", "R1", &[ItemQuantity::new("P1", 51)], "clerk")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Rule(CoreError::InsufficientAvailableStock {
                available: 50,
                requested: 51
            })
        ));

        wf.reserve_for_order("O1", "R1", &[ItemQuantity::new("P1", 50)], "clerk")
            .await
            .unwrap();
        assert_eq!(levels_of(db(&wf), "R1", "P1").await, (50, 50));
    }

    #[tokio::test]
    async fn test_failed_line_rolls_back_whole_order() {
        let wf = workflow_with(&[("P1", 100), ("P2", 5)]).await;

        let err = wf
            .reserve_for_order(
                "O1",
                "R1",
                &[ItemQuantity::new("P1", 10), ItemQuantity::new("P2", 10)],
                "clerk",
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Rule(CoreError::InsufficientAvailableStock { .. })
        ));

        assert_eq!(levels_of(db(&wf), "R1", "P1").await, (100, 0));
        assert_eq!(levels_of(db(&wf), "R1", "P2").await, (5, 0));

        let trail = db(&wf)
            .journal()
            .for_reference("O1", PageRequest::default())
            .await
            .unwrap();
        assert_eq!(trail.items.len(), 2);
        assert_eq!(trail.items[0].kind, MutationKind::Reserve);
        assert_eq!(trail.items[1].kind, MutationKind::Release);
        assert_eq!(trail.items[1].reason, ReasonCode::ReservationRollback);

        // Nothing is held, so the order may try again
        wf.reserve_for_order("O1", "R1", &[ItemQuantity::new("P1", 10)], "clerk")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_product_reserves_nothing() {
        let wf = workflow_with(&[("P1", 100)]).await;

        let err = wf
            .reserve_for_order(
                "O1",
                "R1",
                &[ItemQuantity::new("P1", 10), ItemQuantity::new("P9", 1)],
                "clerk",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::LineNotFound { .. })));
        assert_eq!(levels_of(db(&wf), "R1", "P1").await, (100, 0));
    }

    #[tokio::test]
    async fn test_second_reserve_while_holding_is_refused() {
        let wf = workflow_with(&[("P1", 100)]).await;
        wf.reserve_for_order("O1", "R1", &[ItemQuantity::new("P1", 10)], "clerk")
            .await
            .unwrap();

        let err = wf
            .reserve_for_order("O1", "R1", &[ItemQuantity::new("P1", 10)], "clerk")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::ReservationExists { .. })));
        assert_eq!(levels_of(db(&wf), "R1", "P1").await, (100, 10));
    }

    #[tokio::test]
    async fn test_duplicate_items_are_merged() {
        let wf = workflow_with(&[("P1", 100)]).await;
        let outcome = wf
            .reserve_for_order(
                "O1",
                "R1",
                &[ItemQuantity::new("P1", 5), ItemQuantity::new("P1", 7)],
                "clerk",
            )
            .await
            .unwrap();
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(levels_of(db(&wf), "R1", "P1").await, (100, 12));
    }

    #[tokio::test]
    async fn test_delivery_without_reservation() {
        let wf = workflow_with(&[("P1", 100)]).await;

        let err = wf.confirm_delivery("O1", "R1", "clerk").await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::NoReservationFound { .. })));

        wf.reserve_for_order("O1", "R1", &[ItemQuantity::new("P1", 10)], "clerk")
            .await
            .unwrap();
        wf.confirm_delivery("O1", "R1", "clerk").await.unwrap();
        let err = wf.confirm_delivery("O1", "R1", "clerk").await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::NoReservationFound { .. })));
        assert_eq!(levels_of(db(&wf), "R1", "P1").await, (90, 0));
    }

    #[tokio::test]
    async fn test_delivery_after_cancel_finds_nothing() {
        let wf = workflow_with(&[("P1", 100)]).await;
        wf.reserve_for_order("O1", "R1", &[ItemQuantity::new("P1", 10)], "clerk")
            .await
            .unwrap();
        wf.cancel_reservation("O1", "R1", None, "clerk").await.unwrap();

        let err = wf.confirm_delivery("O1", "R1", "clerk").await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::NoReservationFound { .. })));

        let line = db(&wf).lines().get_by_key("R1", "P1").await.unwrap().unwrap();
        assert_eq!((line.current_stock, line.committed_stock, line.total_sold), (100, 0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_over_commit() {
        let dir = tempfile::tempdir().unwrap();
        let db = file_db(&dir).await;
        let engine = engine(&db);
        stocked_line(&engine, "R1", "P1", 50).await;
        let wf = ReservationWorkflow::new(engine);

        let mut handles = Vec::new();
        for n in 0..10 {
            let wf = wf.clone();
            handles.push(tokio::spawn(async move {
                wf.reserve_for_order(
                    &format!("O{n}"),
                    "R1",
                    &[ItemQuantity::new("P1", 10)],
                    "clerk",
                )
                .await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(LedgerError::Rule(CoreError::InsufficientAvailableStock { .. })) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(succeeded, 5);
        assert_eq!(levels_of(&db, "R1", "P1").await, (50, 50));
    }
}
