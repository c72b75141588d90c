//! # Transfer Requests
//!
//! State machine, advisory lock and fulfillment planning for stock transfer
//! requests between a retailer and the central supply authority.
//!
//! ## State Machine
//! ```text
//!                 acquire(holder)
//!   ┌─────────┐ ─────────────────► ┌─────────┐
//!   │ pending │                    │ locked  │──┐ acquire (same holder) refreshes
//!   └─────────┘ ◄───────────────── └────┬────┘◄─┘
//!                release / expiry       │ act(holder | supervisor)
//!                                       ▼
//!              ┌───────────┬────────────┴────────┬──────────┐
//!              │ fulfilled │ partially_fulfilled │ rejected │ cancelled
//!              └───────────┴─────────────────────┴──────────┘
//!                          terminal: no further transitions
//! ```
//!
//! A lock is binding only while `now < expires_at`. An expired lock reads
//! as absent, so a `locked` request with a stale lock is effectively
//! `pending`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::ItemQuantity;

// =============================================================================
// Status & Priority
// =============================================================================

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Locked,
    Fulfilled,
    PartiallyFulfilled,
    Rejected,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Fulfilled
                | TransferStatus::PartiallyFulfilled
                | TransferStatus::Rejected
                | TransferStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Locked => "locked",
            TransferStatus::Fulfilled => "fulfilled",
            TransferStatus::PartiallyFulfilled => "partially_fulfilled",
            TransferStatus::Rejected => "rejected",
            TransferStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum TransferPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

// =============================================================================
// Advisory Lock
// =============================================================================

/// Cooperative, time-boxed claim on a transfer request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AdvisoryLock {
    pub holder: String,
    #[ts(as = "String")]
    pub expires_at: DateTime<Utc>,
}

impl AdvisoryLock {
    pub fn new(holder: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            holder: holder.into(),
            expires_at: now + ttl,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    #[inline]
    pub fn is_held_by(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.holder == holder && !self.is_expired(now)
    }
}

// =============================================================================
// Request
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TransferLine {
    pub product_id: String,
    pub requested_qty: i64,
    pub fulfilled_qty: i64,
}

impl TransferLine {
    pub fn remaining(&self) -> i64 {
        (self.requested_qty - self.fulfilled_qty).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TransferRequest {
    pub id: String,
    pub retailer_id: String,
    /// Stored status. See [`TransferRequest::effective_status`].
    pub status: TransferStatus,
    pub priority: TransferPriority,
    pub lines: Vec<TransferLine>,
    pub lock: Option<AdvisoryLock>,
    pub note: Option<String>,
    pub version: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl TransferRequest {
    /// The lock, if present and unexpired.
    pub fn binding_lock(&self, now: DateTime<Utc>) -> Option<&AdvisoryLock> {
        self.lock.as_ref().filter(|lock| !lock.is_expired(now))
    }

    /// Status as callers should see it: a stale lock reads as `pending`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> TransferStatus {
        match self.status {
            TransferStatus::Locked if self.binding_lock(now).is_none() => TransferStatus::Pending,
            status => status,
        }
    }

    pub fn total_requested(&self) -> i64 {
        self.lines.iter().map(|l| l.requested_qty).sum()
    }

    pub fn total_fulfilled(&self) -> i64 {
        self.lines.iter().map(|l| l.fulfilled_qty).sum()
    }

    pub fn total_remaining(&self) -> i64 {
        self.lines.iter().map(TransferLine::remaining).sum()
    }

    fn transition_error(&self, action: &str) -> CoreError {
        CoreError::InvalidTransition {
            request_id: self.id.clone(),
            status: self.status.to_string(),
            action: action.to_string(),
        }
    }
}

/// What a retailer submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NewTransferRequest {
    pub retailer_id: String,
    pub items: Vec<ItemQuantity>,
    #[serde(default)]
    pub priority: TransferPriority,
    pub note: Option<String>,
}

// =============================================================================
// Decisions & Records
// =============================================================================

/// Per-product override of how much to fulfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LineOverride {
    pub product_id: String,
    pub fulfilled_qty: i64,
}

impl LineOverride {
    pub fn new(product_id: impl Into<String>, fulfilled_qty: i64) -> Self {
        Self {
            product_id: product_id.into(),
            fulfilled_qty,
        }
    }
}

/// The supply authority's decision on a locked request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Empty `lines` fulfills everything remaining.
    Fulfill { lines: Vec<LineOverride> },
    Reject { reason: Option<String> },
    Cancel { reason: Option<String> },
}

impl Decision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::Fulfill { .. } => DecisionKind::Fulfill,
            Decision::Reject { .. } => DecisionKind::Reject,
            Decision::Cancel { .. } => DecisionKind::Cancel,
        }
    }

    pub fn note(&self) -> Option<&str> {
        match self {
            Decision::Fulfill { .. } => None,
            Decision::Reject { reason } | Decision::Cancel { reason } => reason.as_deref(),
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Fulfill,
    Reject,
    Cancel,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Fulfill => "fulfill",
            DecisionKind::Reject => "reject",
            DecisionKind::Cancel => "cancel",
        }
    }
}

/// One unit movement inside a [`TransferRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TransferRecordLine {
    pub product_id: String,
    pub quantity: i64,
    /// The retailer-side STOCK_IN entry this movement produced.
    pub journal_entry_id: String,
}

/// Append-only result of one committed `act`, keyed by
/// `(request_id, idempotency_token)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TransferRecord {
    pub id: String,
    pub request_id: String,
    pub idempotency_token: String,
    pub actor_id: String,
    pub decision: DecisionKind,
    pub resulting_status: TransferStatus,
    pub lines: Vec<TransferRecordLine>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn total_quantity(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

/// Audit line for a transfer decision.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TransferLogEntry {
    pub id: i64,
    pub request_id: String,
    pub actor_id: String,
    pub action: String,
    pub note: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

/// What `act` returns, first time or on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ActOutcome {
    pub request: TransferRequest,
    pub record: TransferRecord,
    /// True when the token had already been committed.
    pub replayed: bool,
}

// =============================================================================
// Rules
// =============================================================================

/// How a lock acquisition relates to the lock already on the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockGrant {
    Fresh,
    Refresh,
    /// Someone else's lock had expired.
    TakeOverExpired { previous_holder: String },
    /// Supervisor took over an unexpired lock.
    Override { previous_holder: String },
}

/// Decides whether `holder` may lock `request` now.
pub fn check_acquire(
    request: &TransferRequest,
    holder: &str,
    now: DateTime<Utc>,
) -> CoreResult<LockGrant> {
    if request.status.is_terminal() {
        return Err(request.transition_error("lock"));
    }

    match &request.lock {
        None => Ok(LockGrant::Fresh),
        Some(lock) if lock.holder == holder => Ok(LockGrant::Refresh),
        Some(lock) if lock.is_expired(now) => Ok(LockGrant::TakeOverExpired {
            previous_holder: lock.holder.clone(),
        }),
        Some(lock) => Err(CoreError::LockHeld {
            request_id: request.id.clone(),
            holder: lock.holder.clone(),
            expires_at: lock.expires_at,
        }),
    }
}

/// Supervisory takeover. The caller has already been verified as supervisor.
pub fn check_override(request: &TransferRequest, now: DateTime<Utc>) -> CoreResult<LockGrant> {
    if request.status.is_terminal() {
        return Err(request.transition_error("override lock"));
    }
    Ok(match request.binding_lock(now) {
        Some(lock) => LockGrant::Override {
            previous_holder: lock.holder.clone(),
        },
        None => LockGrant::Fresh,
    })
}

/// Decides whether `caller` may release the lock. `Ok(false)` means there
/// was nothing binding to release.
pub fn check_release(
    request: &TransferRequest,
    caller: &str,
    is_supervisor: bool,
    now: DateTime<Utc>,
) -> CoreResult<bool> {
    if request.status.is_terminal() {
        return Err(request.transition_error("release"));
    }
    match request.binding_lock(now) {
        None => Ok(request.lock.is_some()),
        Some(lock) if lock.holder == caller || is_supervisor => Ok(true),
        Some(_) => Err(CoreError::LockMismatch {
            request_id: request.id.clone(),
            caller: caller.to_string(),
        }),
    }
}

/// Decides whether `caller` may decide `request` now.
pub fn authorize_act(
    request: &TransferRequest,
    caller: &str,
    is_supervisor: bool,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    if request.status.is_terminal() {
        return Err(request.transition_error("act"));
    }
    if is_supervisor {
        return Ok(());
    }
    match request.binding_lock(now) {
        Some(lock) if lock.holder == caller => Ok(()),
        _ => Err(CoreError::LockMismatch {
            request_id: request.id.clone(),
            caller: caller.to_string(),
        }),
    }
}

/// Quantity to move for one request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedLine {
    pub product_id: String,
    pub to_fulfill: i64,
}

/// Computes `min(override ?? remaining, remaining)` for every line.
///
/// Overrides must name products on the request, at most once each, with a
/// non-negative quantity.
pub fn plan_fulfillment(
    request: &TransferRequest,
    overrides: &[LineOverride],
) -> CoreResult<Vec<PlannedLine>> {
    let known: HashSet<&str> = request.lines.iter().map(|l| l.product_id.as_str()).collect();
    let mut by_product: HashMap<&str, i64> = HashMap::new();

    for o in overrides {
        if o.fulfilled_qty < 0 {
            return Err(ValidationError::MustNotBeNegative {
                field: "fulfilled_qty".to_string(),
            }
            .into());
        }
        if !known.contains(o.product_id.as_str()) {
            return Err(ValidationError::InvalidFormat {
                field: "product_id".to_string(),
                reason: format!("{} is not part of request {}", o.product_id, request.id),
            }
            .into());
        }
        if by_product.insert(o.product_id.as_str(), o.fulfilled_qty).is_some() {
            return Err(ValidationError::Duplicate {
                field: "product_id".to_string(),
                value: o.product_id.clone(),
            }
            .into());
        }
    }

    Ok(request
        .lines
        .iter()
        .map(|line| {
            let remaining = line.remaining();
            let wanted = by_product
                .get(line.product_id.as_str())
                .copied()
                .unwrap_or(remaining);
            PlannedLine {
                product_id: line.product_id.clone(),
                to_fulfill: wanted.min(remaining),
            }
        })
        .collect())
}

/// Adds planned quantities to the lines. `fulfilled_qty` never decreases.
pub fn apply_plan(lines: &[TransferLine], plan: &[PlannedLine]) -> Vec<TransferLine> {
    lines
        .iter()
        .map(|line| {
            let extra = plan
                .iter()
                .find(|p| p.product_id == line.product_id)
                .map_or(0, |p| p.to_fulfill.max(0));
            TransferLine {
                fulfilled_qty: (line.fulfilled_qty + extra).min(line.requested_qty),
                ..line.clone()
            }
        })
        .collect()
}

/// Terminal status after a fulfill decision, from the line totals.
pub fn fulfillment_status(lines: &[TransferLine]) -> TransferStatus {
    let requested: i64 = lines.iter().map(|l| l.requested_qty).sum();
    let fulfilled: i64 = lines.iter().map(|l| l.fulfilled_qty).sum();

    if fulfilled == 0 {
        TransferStatus::Rejected
    } else if fulfilled >= requested {
        TransferStatus::Fulfilled
    } else {
        TransferStatus::PartiallyFulfilled
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn request(lines: &[(&str, i64)]) -> TransferRequest {
        let now = Utc::now();
        TransferRequest {
            id: "req-1".to_string(),
            retailer_id: "R1".to_string(),
            status: TransferStatus::Pending,
            priority: TransferPriority::Normal,
            lines: lines
                .iter()
                .map(|(p, q)| TransferLine {
                    product_id: p.to_string(),
                    requested_qty: *q,
                    fulfilled_qty: 0,
                })
                .collect(),
            lock: None,
            note: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn locked_by(mut req: TransferRequest, holder: &str, expires_at: DateTime<Utc>) -> TransferRequest {
        req.status = TransferStatus::Locked;
        req.lock = Some(AdvisoryLock {
            holder: holder.to_string(),
            expires_at,
        });
        req
    }

    #[test]
    fn test_acquire_rules() {
        let now = Utc::now();
        let req = request(&[("P1", 50)]);
        assert_eq!(check_acquire(&req, "alice", now).unwrap(), LockGrant::Fresh);

        let req = locked_by(req, "alice", now + Duration::minutes(5));
        assert_eq!(check_acquire(&req, "alice", now).unwrap(), LockGrant::Refresh);
        assert!(matches!(
            check_acquire(&req, "bob", now),
            Err(CoreError::LockHeld { .. })
        ));

        // once expired anyone may take it
        let later = now + Duration::minutes(6);
        assert_eq!(
            check_acquire(&req, "bob", later).unwrap(),
            LockGrant::TakeOverExpired {
                previous_holder: "alice".to_string()
            }
        );
    }

    #[test]
    fn test_terminal_requests_cannot_be_locked() {
        let mut req = request(&[("P1", 5)]);
        req.status = TransferStatus::Cancelled;
        assert!(matches!(
            check_acquire(&req, "alice", Utc::now()),
            Err(CoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_effective_status_treats_stale_lock_as_pending() {
        let now = Utc::now();
        let req = locked_by(request(&[("P1", 5)]), "alice", now + Duration::seconds(10));
        assert_eq!(req.effective_status(now), TransferStatus::Locked);
        assert_eq!(
            req.effective_status(now + Duration::seconds(10)),
            TransferStatus::Pending
        );
    }

    #[test]
    fn test_authorize_act() {
        let now = Utc::now();
        let req = locked_by(request(&[("P1", 5)]), "alice", now + Duration::minutes(5));

        assert!(authorize_act(&req, "alice", false, now).is_ok());
        assert!(matches!(
            authorize_act(&req, "bob", false, now),
            Err(CoreError::LockMismatch { .. })
        ));
        // supervisor override
        assert!(authorize_act(&req, "boss", true, now).is_ok());
        // expired lock no longer authorizes its holder
        assert!(authorize_act(&req, "alice", false, now + Duration::minutes(5)).is_err());
        // no lock at all
        assert!(authorize_act(&request(&[("P1", 5)]), "alice", false, now).is_err());
    }

    #[test]
    fn test_release_rules() {
        let now = Utc::now();
        let req = locked_by(request(&[("P1", 5)]), "alice", now + Duration::minutes(5));
        assert!(check_release(&req, "alice", false, now).unwrap());
        assert!(check_release(&req, "boss", true, now).unwrap());
        assert!(check_release(&req, "bob", false, now).is_err());
        assert!(!check_release(&request(&[("P1", 5)]), "bob", false, now).unwrap());
    }

    #[test]
    fn test_plan_partial_override() {
        let req = request(&[("P1", 50)]);
        let plan = plan_fulfillment(&req, &[LineOverride::new("P1", 20)]).unwrap();
        assert_eq!(plan[0].to_fulfill, 20);

        let lines = apply_plan(&req.lines, &plan);
        assert_eq!(lines[0].fulfilled_qty, 20);
        assert_eq!(lines[0].remaining(), 30);
        assert_eq!(fulfillment_status(&lines), TransferStatus::PartiallyFulfilled);
    }

    #[test]
    fn test_plan_defaults_and_caps() {
        let req = request(&[("P1", 10), ("P2", 5)]);
        // P1 capped at its remaining quantity, P2 defaults to remaining
        let plan = plan_fulfillment(&req, &[LineOverride::new("P1", 99)]).unwrap();
        assert_eq!(plan[0].to_fulfill, 10);
        assert_eq!(plan[1].to_fulfill, 5);
        assert_eq!(
            fulfillment_status(&apply_plan(&req.lines, &plan)),
            TransferStatus::Fulfilled
        );
    }

    #[test]
    fn test_zero_fulfillment_is_rejection() {
        let req = request(&[("P1", 10)]);
        let plan = plan_fulfillment(&req, &[LineOverride::new("P1", 0)]).unwrap();
        assert_eq!(
            fulfillment_status(&apply_plan(&req.lines, &plan)),
            TransferStatus::Rejected
        );
    }

    #[test]
    fn test_plan_rejects_bad_overrides() {
        let req = request(&[("P1", 10)]);
        assert!(plan_fulfillment(&req, &[LineOverride::new("P9", 1)]).is_err());
        assert!(plan_fulfillment(&req, &[LineOverride::new("P1", -1)]).is_err());
        assert!(plan_fulfillment(
            &req,
            &[LineOverride::new("P1", 1), LineOverride::new("P1", 2)]
        )
        .is_err());
    }
}
