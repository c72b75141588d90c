//! # Stock-Transfer Workflow
//!
//! Retailer requests for stock from the central supply authority.
//!
//! ## State Machine
//! ```text
//!                  acquire_lock / override_lock
//!   ┌─────────┐ ─────────────────────────────► ┌────────┐
//!   │ pending │                                │ locked │
//!   └─────────┘ ◄───────────────────────────── └────────┘
//!         release_lock, or the lock expires        │
//!                                                  │ act
//!              ┌───────────────┬───────────────────┼──────────────────┐
//!              ▼               ▼                   ▼                  ▼
//!         fulfilled   partially_fulfilled      rejected           cancelled
//! ```
//!
//! ## Exactly-Once `act`
//! Every committed decision writes one [`TransferRecord`] keyed by
//! `(request_id, idempotency_token)`. `act` looks the key up first, under
//! the request's write lock; a hit returns the stored result without
//! touching the ledger. The UNIQUE constraint on the key only backs that
//! lookup up.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::engine::{apply_in_tx, MutationEngine};
use crate::error::{DbError, LedgerError, LedgerResult};
use crate::events::publish_after_commit;
use crate::repository::{line, transfer};
use supplyline_core::transfer::{
    apply_plan, authorize_act, check_acquire, check_override, check_release, fulfillment_status,
    plan_fulfillment, LockGrant, PlannedLine,
};
use supplyline_core::validation::{validate_id, validate_items, validate_note};
use supplyline_core::{
    ActOutcome, AdvisoryLock, CoreError, Decision, LineKey, Mutation, MutationContext,
    NewTransferRequest, Page, PageRequest, ReasonCode, TransferEvent, TransferEventKind,
    TransferEventSink, TransferLine, TransferLogEntry, TransferRecord, TransferRecordLine,
    TransferRequest, TransferStatus, ValidationError,
};

/// Lock and accounting rules taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPolicy {
    pub lock_ttl: Duration,
    pub supervisor_id: Option<String>,
    /// Retailer whose lines are debited on fulfillment, if any.
    pub supplier_retailer_id: Option<String>,
}

impl TransferPolicy {
    pub fn from_config(config: &LedgerConfig) -> Self {
        TransferPolicy {
            lock_ttl: config.lock_ttl(),
            supervisor_id: config.locks.supervisor_id.clone(),
            supplier_retailer_id: config.supplier_to_debit().map(str::to_string),
        }
    }

    fn is_supervisor(&self, principal: &str) -> bool {
        self.supervisor_id.as_deref() == Some(principal)
    }
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}

/// Transfer request lifecycle, from creation to decision.
#[derive(Clone)]
pub struct TransferWorkflow {
    engine: MutationEngine,
    events: Arc<dyn TransferEventSink>,
    policy: TransferPolicy,
}

impl std::fmt::Debug for TransferWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferWorkflow")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TransferWorkflow {
    pub fn new(
        engine: MutationEngine,
        events: Arc<dyn TransferEventSink>,
        policy: TransferPolicy,
    ) -> Self {
        TransferWorkflow {
            engine,
            events,
            policy,
        }
    }

    pub fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    fn now(&self) -> DateTime<Utc> {
        self.engine.clock().now()
    }

    fn publish(&self, kind: TransferEventKind, request: &TransferRequest, at: DateTime<Utc>) {
        let holder = request.binding_lock(at).map(|l| l.holder.clone());
        publish_after_commit(
            self.events.as_ref(),
            TransferEvent::new(kind, &request.id, request.effective_status(at), holder, at),
        );
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Files a new request. It always starts `pending`.
    ///
    /// When fulfillment debits a supplier, the supplier itself cannot file
    /// requests: crediting and debiting the same line moves nothing.
    pub async fn create_request(
        &self,
        new: &NewTransferRequest,
        actor_id: &str,
    ) -> LedgerResult<TransferRequest> {
        validate_id("retailer_id", &new.retailer_id)?;
        validate_id("actor_id", actor_id)?;
        validate_items(&new.items, true)?;
        validate_note(new.note.as_deref())?;
        if self.policy.supplier_retailer_id.as_deref() == Some(new.retailer_id.as_str()) {
            return Err(ValidationError::InvalidFormat {
                field: "retailer_id".to_string(),
                reason: "the debited supplier cannot request from itself".to_string(),
            }
            .into());
        }

        let now = self.now();
        let request = TransferRequest {
            id: Uuid::new_v4().to_string(),
            retailer_id: new.retailer_id.clone(),
            status: TransferStatus::Pending,
            priority: new.priority,
            lines: new
                .items
                .iter()
                .map(|item| TransferLine {
                    product_id: item.product_id.clone(),
                    requested_qty: item.quantity,
                    fulfilled_qty: 0,
                })
                .collect(),
            lock: None,
            note: new.note.clone(),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let request_ref = &request;

        self.engine
            .retry()
            .run("create_transfer_request", move || async move {
                let mut tx = self.engine.database().pool().begin().await?;
                transfer::insert_request(&mut tx, request_ref).await?;
                transfer::append_log(
                    &mut tx,
                    &request_ref.id,
                    actor_id,
                    "create",
                    request_ref.note.as_deref(),
                    now,
                )
                .await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;

        info!(
            request_id = %request.id,
            retailer_id = %request.retailer_id,
            priority = ?request.priority,
            units = request.total_requested(),
            "Transfer request created"
        );
        self.publish(TransferEventKind::Created, &request, now);
        Ok(request)
    }

    // =========================================================================
    // Advisory Locks
    // =========================================================================

    /// Locks the request for `holder`, or refreshes the holder's own lock.
    ///
    /// An expired lock held by someone else is taken over. `ttl` defaults to
    /// the configured lock lifetime.
    ///
    /// ## Errors
    /// - `LockHeld` if another holder has an unexpired lock
    /// - `InvalidTransition` once the request is decided
    pub async fn acquire_lock(
        &self,
        request_id: &str,
        holder: &str,
        ttl: Option<Duration>,
    ) -> LedgerResult<TransferRequest> {
        validate_id("holder", holder)?;
        let ttl = self.resolve_ttl(ttl)?;

        let (request, grant, now) = self
            .relock(request_id, holder, ttl, "acquire_lock", |req, now| {
                check_acquire(req, holder, now)
            })
            .await?;

        match &grant {
            LockGrant::TakeOverExpired { previous_holder } => info!(
                request_id,
                holder,
                previous_holder = %previous_holder,
                "Expired transfer lock taken over"
            ),
            LockGrant::Refresh => debug!(request_id, holder, "Transfer lock refreshed"),
            _ => info!(request_id, holder, "Transfer request locked"),
        }
        self.publish(TransferEventKind::Locked, &request, now);
        Ok(request)
    }

    /// Supervisory takeover of a lock, even an unexpired one.
    ///
    /// ## Errors
    /// - `LockMismatch` unless `caller` is the configured supervisor
    pub async fn override_lock(
        &self,
        request_id: &str,
        caller: &str,
        ttl: Option<Duration>,
    ) -> LedgerResult<TransferRequest> {
        validate_id("caller", caller)?;
        if !self.policy.is_supervisor(caller) {
            return Err(CoreError::LockMismatch {
                request_id: request_id.to_string(),
                caller: caller.to_string(),
            }
            .into());
        }
        let ttl = self.resolve_ttl(ttl)?;

        let (request, grant, now) = self
            .relock(request_id, caller, ttl, "override_lock", check_override)
            .await?;

        if let LockGrant::Override { previous_holder } = &grant {
            warn!(
                request_id,
                supervisor = caller,
                previous_holder = %previous_holder,
                "Transfer lock overridden"
            );
        }
        self.publish(TransferEventKind::Locked, &request, now);
        Ok(request)
    }

    /// Gives up the lock early. The holder may release its own lock, the
    /// supervisor any lock. Releasing an unlocked request changes nothing.
    ///
    /// ## Errors
    /// - `LockMismatch` if someone else holds an unexpired lock
    pub async fn release_lock(
        &self,
        request_id: &str,
        caller: &str,
    ) -> LedgerResult<TransferRequest> {
        validate_id("caller", caller)?;
        let is_supervisor = self.policy.is_supervisor(caller);

        let (request, released, now) = self
            .engine
            .retry()
            .run("release_lock", move || async move {
                let mut tx = self.engine.database().pool().begin().await?;
                let now = self.now();
                let current = claim_and_fetch(&mut tx, request_id).await?;

                if !check_release(&current, caller, is_supervisor, now)? {
                    return Ok((current, false, now));
                }

                let mut next = TransferRequest {
                    status: TransferStatus::Pending,
                    lock: None,
                    updated_at: now,
                    ..current.clone()
                };
                next.version = transfer::cas_update(&mut tx, &next, current.version).await?;
                transfer::append_log(&mut tx, request_id, caller, "release_lock", None, now).await?;
                tx.commit().await?;
                Ok((next, true, now))
            })
            .await?;

        if released {
            info!(request_id, caller, "Transfer lock released");
            self.publish(TransferEventKind::Released, &request, now);
        }
        Ok(request)
    }

    fn resolve_ttl(&self, ttl: Option<Duration>) -> LedgerResult<Duration> {
        let ttl = ttl.unwrap_or(self.policy.lock_ttl);
        if ttl <= Duration::zero() {
            return Err(ValidationError::MustBePositive {
                field: "ttl".to_string(),
            }
            .into());
        }
        Ok(ttl)
    }

    /// Shared body of acquire and override: decide with `rule`, then write
    /// the new lock with a version check.
    async fn relock<R>(
        &self,
        request_id: &str,
        holder: &str,
        ttl: Duration,
        operation: &'static str,
        rule: R,
    ) -> LedgerResult<(TransferRequest, LockGrant, DateTime<Utc>)>
    where
        R: Fn(&TransferRequest, DateTime<Utc>) -> supplyline_core::CoreResult<LockGrant>,
    {
        let rule = &rule;
        self.engine
            .retry()
            .run(operation, move || async move {
                let mut tx = self.engine.database().pool().begin().await?;
                let now = self.now();
                let current = claim_and_fetch(&mut tx, request_id).await?;
                let grant = rule(&current, now)?;

                let mut next = TransferRequest {
                    status: TransferStatus::Locked,
                    lock: Some(AdvisoryLock::new(holder, now, ttl)),
                    updated_at: now,
                    ..current.clone()
                };
                next.version = transfer::cas_update(&mut tx, &next, current.version).await?;

                let (action, note) = match &grant {
                    LockGrant::Fresh => ("lock", None),
                    LockGrant::Refresh => ("refresh_lock", None),
                    LockGrant::TakeOverExpired { previous_holder } => {
                        ("take_over_expired_lock", Some(previous_holder.as_str()))
                    }
                    LockGrant::Override { previous_holder } => {
                        ("override_lock", Some(previous_holder.as_str()))
                    }
                };
                transfer::append_log(&mut tx, request_id, holder, action, note, now).await?;
                tx.commit().await?;
                Ok((next, grant, now))
            })
            .await
    }

    // =========================================================================
    // Decisions
    // =========================================================================

    /// Decides a locked request.
    ///
    /// `fulfill` credits each line's quantity to the retailer's ledger line
    /// (and debits the supplier's, when configured) in the same transaction
    /// that records the decision. A repeated call with the same
    /// `idempotency_token` returns the first result with `replayed` set.
    /// Without a token a fresh one is generated.
    ///
    /// ## Errors
    /// - `LockMismatch` unless the caller holds the lock or is the supervisor
    /// - `InvalidTransition` if the request is already decided
    /// - `LineNotFound` if the retailer has no line for a product to fulfill
    pub async fn act(
        &self,
        request_id: &str,
        caller: &str,
        decision: Decision,
        idempotency_token: Option<&str>,
    ) -> LedgerResult<ActOutcome> {
        validate_id("request_id", request_id)?;
        validate_id("caller", caller)?;
        validate_note(decision.note())?;
        let token = match idempotency_token {
            Some(token) => {
                validate_id("idempotency_token", token)?;
                token.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };
        let is_supervisor = self.policy.is_supervisor(caller);
        let (token_ref, decision_ref) = (token.as_str(), &decision);

        let result = self
            .engine
            .retry()
            .run("act_on_transfer", move || async move {
                let mut tx = self.engine.database().pool().begin().await?;
                let now = self.now();
                if !transfer::claim(&mut tx, request_id).await? {
                    return Err(CoreError::TransferRequestNotFound(request_id.to_string()).into());
                }

                if let Some(record) = transfer::find_record(&mut tx, request_id, token_ref).await? {
                    let request = fetch_required(&mut tx, request_id).await?;
                    return Ok(ActOutcome {
                        request,
                        record,
                        replayed: true,
                    });
                }

                let current = fetch_required(&mut tx, request_id).await?;
                authorize_act(&current, caller, is_supervisor, now)?;

                let (lines, status, moved) = match decision_ref {
                    Decision::Reject { .. } => {
                        (current.lines.clone(), TransferStatus::Rejected, Vec::new())
                    }
                    Decision::Cancel { .. } => {
                        (current.lines.clone(), TransferStatus::Cancelled, Vec::new())
                    }
                    Decision::Fulfill { lines: overrides } => {
                        let plan = plan_fulfillment(&current, overrides)?;
                        let moved = self
                            .move_stock(&mut tx, &current, &plan, caller, now)
                            .await?;
                        let lines = apply_plan(&current.lines, &plan);
                        let status = fulfillment_status(&lines);
                        (lines, status, moved)
                    }
                };

                let mut next = TransferRequest {
                    status,
                    lines,
                    lock: None,
                    updated_at: now,
                    ..current.clone()
                };
                next.version = transfer::cas_update(&mut tx, &next, current.version).await?;

                let record = TransferRecord {
                    id: Uuid::new_v4().to_string(),
                    request_id: request_id.to_string(),
                    idempotency_token: token_ref.to_string(),
                    actor_id: caller.to_string(),
                    decision: decision_ref.kind(),
                    resulting_status: status,
                    lines: moved,
                    created_at: now,
                };
                match transfer::insert_record(&mut tx, &record).await {
                    Ok(()) => {}
                    Err(e) if e.is_unique_violation() => {
                        return Err(LedgerError::DuplicateTransfer {
                            request_id: request_id.to_string(),
                            idempotency_token: token_ref.to_string(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
                transfer::append_log(
                    &mut tx,
                    request_id,
                    caller,
                    decision_ref.kind().as_str(),
                    decision_ref.note(),
                    now,
                )
                .await?;

                tx.commit().await?;
                Ok(ActOutcome {
                    request: next,
                    record,
                    replayed: false,
                })
            })
            .await;

        let outcome = match result {
            Err(LedgerError::DuplicateTransfer { .. }) => self.replay(request_id, &token).await?,
            other => other?,
        };

        if outcome.replayed {
            info!(
                request_id,
                token = %token,
                status = %outcome.request.status,
                "Transfer decision replayed"
            );
        } else {
            info!(
                request_id,
                caller,
                decision = decision.kind().as_str(),
                status = %outcome.request.status,
                units = outcome.record.total_quantity(),
                "Transfer request decided"
            );
            self.publish(TransferEventKind::Updated, &outcome.request, outcome.record.created_at);
        }
        Ok(outcome)
    }

    /// Credits the retailer (and debits the supplier) for every planned line
    /// with something to move. All target lines are checked before the
    /// first mutation.
    async fn move_stock(
        &self,
        conn: &mut SqliteConnection,
        request: &TransferRequest,
        plan: &[PlannedLine],
        caller: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Vec<TransferRecordLine>> {
        let to_move: Vec<&PlannedLine> = plan.iter().filter(|p| p.to_fulfill > 0).collect();

        for planned in &to_move {
            let found = line::fetch_by_key(&mut *conn, &request.retailer_id, &planned.product_id)
                .await?
                .filter(|l| l.is_active);
            if found.is_none() {
                return Err(CoreError::LineNotFound {
                    retailer_id: request.retailer_id.clone(),
                    product_id: planned.product_id.clone(),
                }
                .into());
            }
        }

        let credit_ctx = MutationContext::for_transfer(caller, ReasonCode::TransferIn, &request.id);
        let debit_ctx = credit_ctx.with_reason(ReasonCode::TransferOut);
        let mut moved = Vec::with_capacity(to_move.len());

        for planned in to_move {
            let quantity = planned.to_fulfill;
            if let Some(supplier) = &self.policy.supplier_retailer_id {
                let supplier_key = LineKey::new(supplier.as_str(), planned.product_id.as_str());
                apply_in_tx(
                    &mut *conn,
                    &supplier_key,
                    Mutation::StockOut { quantity },
                    &debit_ctx,
                    now,
                )
                .await?;
            }

            let key = LineKey::new(request.retailer_id.as_str(), planned.product_id.as_str());
            let credited =
                apply_in_tx(&mut *conn, &key, Mutation::StockIn { quantity }, &credit_ctx, now)
                    .await?;
            moved.push(TransferRecordLine {
                product_id: planned.product_id.clone(),
                quantity,
                journal_entry_id: credited.entry.id,
            });
        }
        Ok(moved)
    }

    async fn replay(&self, request_id: &str, token: &str) -> LedgerResult<ActOutcome> {
        let repo = self.engine.database().transfers();
        let record = repo
            .find_record(request_id, token)
            .await?
            .ok_or_else(|| DbError::not_found("transfer_record", token))?;
        let request = repo
            .get(request_id)
            .await?
            .ok_or_else(|| CoreError::TransferRequestNotFound(request_id.to_string()))?;
        warn!(request_id, token, "Duplicate transfer record caught by constraint");
        Ok(ActOutcome {
            request,
            record,
            replayed: true,
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn request(&self, request_id: &str) -> LedgerResult<TransferRequest> {
        self.engine
            .database()
            .transfers()
            .get(request_id)
            .await?
            .ok_or_else(|| CoreError::TransferRequestNotFound(request_id.to_string()).into())
    }

    /// Requests of a retailer by effective status, newest first.
    pub async fn list_requests(
        &self,
        retailer_id: &str,
        status: Option<TransferStatus>,
        page: PageRequest,
    ) -> LedgerResult<Page<TransferRequest>> {
        Ok(self
            .engine
            .database()
            .transfers()
            .list(retailer_id, status, page, self.now())
            .await?)
    }

    pub async fn records(&self, request_id: &str) -> LedgerResult<Vec<TransferRecord>> {
        Ok(self.engine.database().transfers().records(request_id).await?)
    }

    pub async fn log(&self, request_id: &str) -> LedgerResult<Vec<TransferLogEntry>> {
        Ok(self.engine.database().transfers().log(request_id).await?)
    }
}

async fn fetch_required(conn: &mut SqliteConnection, request_id: &str) -> LedgerResult<TransferRequest> {
    transfer::fetch(conn, request_id)
        .await?
        .ok_or_else(|| CoreError::TransferRequestNotFound(request_id.to_string()).into())
}

async fn claim_and_fetch(conn: &mut SqliteConnection, request_id: &str) -> LedgerResult<TransferRequest> {
    if !transfer::claim(&mut *conn, request_id).await? {
        return Err(CoreError::TransferRequestNotFound(request_id.to_string()).into());
    }
    fetch_required(conn, request_id).await
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventSink;
    use crate::pool::Database;
    use crate::test_support::{engine_with_clock, levels_of, memory_db, stocked_line};
    use supplyline_core::{
        Clock, DecisionKind, ItemQuantity, LineOverride, ManualClock, MutationKind, ReasonCode,
        ReferenceKind, TransferPriority,
    };

    struct Fixture {
        db: Database,
        clock: Arc<ManualClock>,
        events: Arc<BroadcastEventSink>,
        workflow: TransferWorkflow,
    }

    async fn fixture(policy: TransferPolicy) -> Fixture {
        let db = memory_db().await;
        let clock = Arc::new(ManualClock::default());
        let engine = engine_with_clock(&db, clock.clone());
        stocked_line(&engine, "R1", "P1", 0).await;
        stocked_line(&engine, "R1", "P2", 0).await;
        let events = Arc::new(BroadcastEventSink::new(32));
        let workflow = TransferWorkflow::new(engine, events.clone(), policy);
        Fixture {
            db,
            clock,
            events,
            workflow,
        }
    }

    fn supervised() -> TransferPolicy {
        TransferPolicy {
            supervisor_id: Some("boss".to_string()),
            ..TransferPolicy::default()
        }
    }

    fn new_request(items: &[(&str, i64)]) -> NewTransferRequest {
        NewTransferRequest {
            retailer_id: "R1".to_string(),
            items: items
                .iter()
                .map(|(p, q)| ItemQuantity::new(*p, *q))
                .collect(),
            priority: TransferPriority::High,
            note: Some("weekend restock".to_string()),
        }
    }

    fn fulfill(lines: &[(&str, i64)]) -> Decision {
        Decision::Fulfill {
            lines: lines
                .iter()
                .map(|(p, q)| LineOverride::new(*p, *q))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_partial_fulfillment() {
        let f = fixture(supervised()).await;
        let req = f
            .workflow
            .create_request(&new_request(&[("P1", 50)]), "R1-manager")
            .await
            .unwrap();
        assert_eq!(req.status, TransferStatus::Pending);

        f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();
        let out = f
            .workflow
            .act(&req.id, "A", fulfill(&[("P1", 20)]), Some("t1"))
            .await
            .unwrap();

        assert!(!out.replayed);
        assert_eq!(out.request.status, TransferStatus::PartiallyFulfilled);
        assert_eq!(out.request.total_remaining(), 30);
        assert!(out.request.lock.is_none());
        assert_eq!(levels_of(&f.db, "R1", "P1").await, (20, 0));

        assert_eq!(out.record.lines.len(), 1);
        let entry = f
            .db
            .journal()
            .get(&out.record.lines[0].journal_entry_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.kind, MutationKind::StockIn);
        assert_eq!(entry.reason, ReasonCode::TransferIn);
        assert_eq!(entry.reference_kind, ReferenceKind::Transfer);
        assert_eq!(entry.reference_id.as_deref(), Some(req.id.as_str()));
    }

    #[tokio::test]
    async fn test_full_fulfillment_default_quantities() {
        let f = fixture(supervised()).await;
        let req = f
            .workflow
            .create_request(&new_request(&[("P1", 50), ("P2", 5)]), "R1-manager")
            .await
            .unwrap();
        f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();

        let out = f
            .workflow
            .act(&req.id, "A", fulfill(&[]), None)
            .await
            .unwrap();
        assert_eq!(out.request.status, TransferStatus::Fulfilled);
        assert_eq!(out.record.total_quantity(), 55);
        assert_eq!(levels_of(&f.db, "R1", "P2").await, (5, 0));
    }

    #[tokio::test]
    async fn test_act_replays_same_token() {
        let f = fixture(supervised()).await;
        let req = f
            .workflow
            .create_request(&new_request(&[("P1", 50)]), "R1-manager")
            .await
            .unwrap();
        f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();

        let first = f
            .workflow
            .act(&req.id, "A", fulfill(&[("P1", 20)]), Some("t1"))
            .await
            .unwrap();
        let second = f
            .workflow
            .act(&req.id, "A", fulfill(&[("P1", 20)]), Some("t1"))
            .await
            .unwrap();

        assert!(second.replayed);
        assert_eq!(second.record, first.record);
        assert_eq!(second.request.status, first.request.status);
        assert_eq!(levels_of(&f.db, "R1", "P1").await, (20, 0));
        assert_eq!(f.workflow.records(&req.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_held_by_other() {
        let f = fixture(supervised()).await;
        let req = f
            .workflow
            .create_request(&new_request(&[("P1", 10)]), "R1-manager")
            .await
            .unwrap();
        f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();

        let err = f.workflow.acquire_lock(&req.id, "B", None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::LockHeld { ref holder, .. }) if holder == "A"));

        // Re-acquiring one's own lock extends it
        f.clock.advance(Duration::seconds(100));
        let refreshed = f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();
        let lock = refreshed.lock.unwrap();
        assert_eq!(lock.expires_at, f.clock.now() + Duration::seconds(300));
    }

    #[tokio::test]
    async fn test_act_without_lock_is_mismatch() {
        let f = fixture(supervised()).await;
        let req = f
            .workflow
            .create_request(&new_request(&[("P1", 10)]), "R1-manager")
            .await
            .unwrap();

        let err = f
            .workflow
            .act(&req.id, "B", fulfill(&[]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::LockMismatch { .. })));

        f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();
        let err = f
            .workflow
            .act(&req.id, "B", fulfill(&[]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::LockMismatch { .. })));
        assert_eq!(levels_of(&f.db, "R1", "P1").await, (0, 0));
    }

    #[tokio::test]
    async fn test_expired_lock_reads_pending_and_can_be_taken() {
        let f = fixture(supervised()).await;
        let req = f
            .workflow
            .create_request(&new_request(&[("P1", 10)]), "R1-manager")
            .await
            .unwrap();
        f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();

        f.clock.advance(Duration::seconds(301));
        let stale = f.workflow.request(&req.id).await.unwrap();
        assert_eq!(stale.effective_status(f.clock.now()), TransferStatus::Pending);

        let pending = f
            .workflow
            .list_requests("R1", Some(TransferStatus::Pending), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(pending.total, 1);

        // The old holder can no longer act
        let err = f
            .workflow
            .act(&req.id, "A", fulfill(&[]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::LockMismatch { .. })));

        let taken = f.workflow.acquire_lock(&req.id, "B", None).await.unwrap();
        assert_eq!(taken.lock.unwrap().holder, "B");

        let log = f.workflow.log(&req.id).await.unwrap();
        assert_eq!(log.last().unwrap().action, "take_over_expired_lock");
        assert_eq!(log.last().unwrap().note.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_supervisor_override() {
        let f = fixture(supervised()).await;
        let req = f
            .workflow
            .create_request(&new_request(&[("P1", 10)]), "R1-manager")
            .await
            .unwrap();
        f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();

        let err = f.workflow.override_lock(&req.id, "B", None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::LockMismatch { .. })));

        let taken = f.workflow.override_lock(&req.id, "boss", None).await.unwrap();
        assert_eq!(taken.lock.unwrap().holder, "boss");

        let err = f
            .workflow
            .act(&req.id, "A", fulfill(&[]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::LockMismatch { .. })));

        f.workflow
            .act(&req.id, "boss", fulfill(&[]), None)
            .await
            .unwrap();
        assert_eq!(levels_of(&f.db, "R1", "P1").await, (10, 0));
    }

    #[tokio::test]
    async fn test_release_lock() {
        let f = fixture(supervised()).await;
        let req = f
            .workflow
            .create_request(&new_request(&[("P1", 10)]), "R1-manager")
            .await
            .unwrap();
        f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();

        let err = f.workflow.release_lock(&req.id, "B").await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::LockMismatch { .. })));

        let released = f.workflow.release_lock(&req.id, "A").await.unwrap();
        assert_eq!(released.status, TransferStatus::Pending);
        assert!(released.lock.is_none());

        // Nothing left to release
        let again = f.workflow.release_lock(&req.id, "A").await.unwrap();
        assert_eq!(again.version, released.version);

        f.workflow.acquire_lock(&req.id, "B", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_moves_no_stock() {
        let f = fixture(supervised()).await;
        let req = f
            .workflow
            .create_request(&new_request(&[("P1", 10)]), "R1-manager")
            .await
            .unwrap();
        f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();

        let out = f
            .workflow
            .act(
                &req.id,
                "A",
                Decision::Reject {
                    reason: Some("out of season".to_string()),
                },
                Some("r1"),
            )
            .await
            .unwrap();
        assert_eq!(out.request.status, TransferStatus::Rejected);
        assert_eq!(out.record.decision, DecisionKind::Reject);
        assert!(out.record.lines.is_empty());
        assert_eq!(levels_of(&f.db, "R1", "P1").await, (0, 0));

        let log = f.workflow.log(&req.id).await.unwrap();
        let actions: Vec<&str> = log.iter().map(|l| l.action.as_str()).collect();
        assert_eq!(actions, vec!["create", "lock", "reject"]);
        assert_eq!(log[2].note.as_deref(), Some("out of season"));

        // Decided requests cannot be locked again
        let err = f.workflow.acquire_lock(&req.id, "A", None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_fulfill_without_retailer_line() {
        let f = fixture(supervised()).await;
        let req = f
            .workflow
            .create_request(&new_request(&[("P1", 10), ("P9", 4)]), "R1-manager")
            .await
            .unwrap();
        f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();

        let err = f
            .workflow
            .act(&req.id, "A", fulfill(&[]), Some("t1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Rule(CoreError::LineNotFound { ref product_id, .. }) if product_id == "P9"
        ));

        assert_eq!(levels_of(&f.db, "R1", "P1").await, (0, 0));
        assert!(f.workflow.records(&req.id).await.unwrap().is_empty());
        let unchanged = f.workflow.request(&req.id).await.unwrap();
        assert_eq!(unchanged.status, TransferStatus::Locked);
    }

    #[tokio::test]
    async fn test_supplier_debit() {
        let policy = TransferPolicy {
            supplier_retailer_id: Some("HQ".to_string()),
            ..supervised()
        };
        let f = fixture(policy).await;
        stocked_line(&f.workflow.engine, "HQ", "P1", 30).await;

        let req = f
            .workflow
            .create_request(&new_request(&[("P1", 50)]), "R1-manager")
            .await
            .unwrap();
        f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();

        let err = f
            .workflow
            .act(&req.id, "A", fulfill(&[]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::InsufficientStock { .. })));
        assert_eq!(levels_of(&f.db, "HQ", "P1").await, (30, 0));
        assert_eq!(levels_of(&f.db, "R1", "P1").await, (0, 0));

        f.workflow
            .act(&req.id, "A", fulfill(&[("P1", 20)]), None)
            .await
            .unwrap();
        assert_eq!(levels_of(&f.db, "HQ", "P1").await, (10, 0));
        assert_eq!(levels_of(&f.db, "R1", "P1").await, (20, 0));
    }

    #[tokio::test]
    async fn test_supplier_cannot_request_from_itself() {
        let policy = TransferPolicy {
            supplier_retailer_id: Some("R1".to_string()),
            ..supervised()
        };
        let f = fixture(policy).await;

        let err = f
            .workflow
            .create_request(&new_request(&[("P1", 5)]), "R1-manager")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Rule(CoreError::Validation(ValidationError::InvalidFormat { ref field, .. }))
                if field == "retailer_id"
        ));
        let listed = f
            .workflow
            .list_requests("R1", None, PageRequest::default())
            .await
            .unwrap();
        assert!(listed.items.is_empty());
    }

    #[tokio::test]
    async fn test_events_follow_commits() {
        let f = fixture(supervised()).await;
        let mut rx = f.events.subscribe();

        let req = f
            .workflow
            .create_request(&new_request(&[("P1", 10)]), "R1-manager")
            .await
            .unwrap();
        f.workflow.acquire_lock(&req.id, "A", None).await.unwrap();
        let _ = f.workflow.acquire_lock(&req.id, "B", None).await.unwrap_err();
        f.workflow.act(&req.id, "A", fulfill(&[]), None).await.unwrap();

        let kinds: Vec<(TransferEventKind, TransferStatus)> = (0..3)
            .map(|_| {
                let event = rx.try_recv().unwrap();
                (event.kind, event.status)
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                (TransferEventKind::Created, TransferStatus::Pending),
                (TransferEventKind::Locked, TransferStatus::Locked),
                (TransferEventKind::Updated, TransferStatus::Fulfilled),
            ]
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_validates_items() {
        let f = fixture(supervised()).await;
        let err = f
            .workflow
            .create_request(&new_request(&[("P1", 10), ("P1", 5)]), "R1-manager")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::Validation(_))));

        let err = f
            .workflow
            .create_request(&new_request(&[]), "R1-manager")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::Validation(_))));

        let err = f.workflow.request("missing").await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(CoreError::TransferRequestNotFound(_))));
    }
}
