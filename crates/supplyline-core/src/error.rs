//! # Error Types
//!
//! Domain-specific error types for supplyline-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  supplyline-core errors (this file)                                    │
//! │  ├── CoreError        - Business rule violations                       │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  supplyline-db errors (separate crate)                                 │
//! │  ├── DbError          - Storage failures (some transient)              │
//! │  └── LedgerError      - Rule | Db | StorageUnavailable                 │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → LedgerError → caller              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Business errors are terminal: the engine reports them immediately and
//! never retries them.

use chrono::{DateTime, Utc};
use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Business rule violations raised by the pure ledger rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Removing more physical stock than the line can give up.
    ///
    /// `available` is the unreserved on-hand quantity: reserved units can
    /// only leave the shelf through a release first.
    #[error("Insufficient stock: available {available}, requested {requested}")]
    InsufficientStock { available: i64, requested: i64 },

    /// Reserving more than `current - committed`.
    ///
    /// ## User Workflow
    /// ```text
    /// reserveForOrder(O7, [{P1, 12}])
    ///      │
    ///      ▼
    /// P1: current=20 committed=10 → available=10
    ///      │
    ///      ▼
    /// InsufficientAvailableStock { available: 10, requested: 12 }
    /// ```
    #[error("Insufficient available stock: available {available}, requested {requested}")]
    InsufficientAvailableStock { available: i64, requested: i64 },

    /// Releasing more than is committed. Usually a double release.
    #[error("Cannot release {requested}: only {committed} committed")]
    OverRelease { committed: i64, requested: i64 },

    #[error("Stock cannot be adjusted to a negative value ({target})")]
    NegativeAdjustment { target: i64 },

    /// Adjusting physical stock below what open orders already hold.
    #[error("Cannot adjust stock to {target}: {committed} units are committed")]
    AdjustBelowCommitted { target: i64, committed: i64 },

    /// A stock counter would leave the i64 range.
    #[error("Stock quantity overflow")]
    QuantityOverflow,

    /// Another holder owns an unexpired lock on the transfer request.
    #[error("Transfer request {request_id} is locked by {holder} until {expires_at}")]
    LockHeld {
        request_id: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// The caller does not hold a valid lock on the transfer request.
    #[error("{caller} does not hold the lock on transfer request {request_id}")]
    LockMismatch { request_id: String, caller: String },

    /// Delivery or cancellation for an order that never reserved stock here.
    #[error("No reservation found for order {order_id} at retailer {retailer_id}")]
    NoReservationFound {
        order_id: String,
        retailer_id: String,
    },

    /// The order still holds unreleased stock from an earlier reservation.
    #[error("Order {order_id} already holds a reservation")]
    ReservationExists { order_id: String },

    /// The transfer request cannot move from its current state.
    #[error("Transfer request {request_id} is {status}, cannot {action}")]
    InvalidTransition {
        request_id: String,
        status: String,
        action: String,
    },

    /// Retiring a line that still holds stock.
    #[error("Line {line_id} still holds stock (current {current}, committed {committed})")]
    LineNotRetirable {
        line_id: String,
        current: i64,
        committed: i64,
    },

    #[error("Invalid pricing tiers: {reason}")]
    InvalidPricingTiers { reason: String },

    #[error("Transfer request not found: {0}")]
    TransferRequestNotFound(String),

    /// No active line for the (retailer, product) pair.
    #[error("No inventory line for product {product_id} at retailer {retailer_id}")]
    LineNotFound {
        retailer_id: String,
        product_id: String,
    },

    /// The retailer already has a line for the product, active or retired.
    #[error("Retailer {retailer_id} already has a line for product {product_id}")]
    LineExists {
        retailer_id: String,
        product_id: String,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Short machine-readable name, used in structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InsufficientStock { .. } => "insufficient_stock",
            CoreError::InsufficientAvailableStock { .. } => "insufficient_available_stock",
            CoreError::OverRelease { .. } => "over_release",
            CoreError::NegativeAdjustment { .. } => "negative_adjustment",
            CoreError::AdjustBelowCommitted { .. } => "adjust_below_committed",
            CoreError::QuantityOverflow => "quantity_overflow",
            CoreError::LockHeld { .. } => "lock_held",
            CoreError::LockMismatch { .. } => "lock_mismatch",
            CoreError::NoReservationFound { .. } => "no_reservation_found",
            CoreError::ReservationExists { .. } => "reservation_exists",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::LineNotRetirable { .. } => "line_not_retirable",
            CoreError::InvalidPricingTiers { .. } => "invalid_pricing_tiers",
            CoreError::TransferRequestNotFound(_) => "transfer_request_not_found",
            CoreError::LineNotFound { .. } => "line_not_found",
            CoreError::LineExists { .. } => "line_exists",
            CoreError::Validation(_) => "validation",
        }
    }

    /// Contention the caller may resolve by waiting or re-acquiring.
    pub fn is_contention(&self) -> bool {
        matches!(self, CoreError::LockHeld { .. } | CoreError::LockMismatch { .. })
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any rule runs or any row is read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },

    /// Invalid format (e.g., invalid UUID, bad characters).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Collection has too many entries.
    #[error("{field} cannot have more than {max} entries")]
    TooMany { field: String, max: usize },

    /// Duplicate value (e.g., the same product twice in one request).
    #[error("{field} '{value}' appears more than once")]
    Duplicate { field: String, value: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::InsufficientAvailableStock {
            available: 10,
            requested: 12,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient available stock: available 10, requested 12"
        );

        let err = CoreError::OverRelease {
            committed: 3,
            requested: 5,
        };
        assert_eq!(err.to_string(), "Cannot release 5: only 3 committed");

        let err = CoreError::LineExists {
            retailer_id: "R1".to_string(),
            product_id: "P1".to_string(),
        };
        assert_eq!(err.to_string(), "Retailer R1 already has a line for product P1");
        assert_eq!(err.code(), "line_exists");
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "retailer_id".to_string(),
        };
        assert_eq!(err.to_string(), "retailer_id is required");

        let err = ValidationError::Duplicate {
            field: "product_id".to_string(),
            value: "P1".to_string(),
        };
        assert_eq!(err.to_string(), "product_id 'P1' appears more than once");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::MustBePositive {
            field: "quantity".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
        assert_eq!(core_err.code(), "validation");
    }

    #[test]
    fn test_contention_classification() {
        let held = CoreError::LockMismatch {
            request_id: "r1".to_string(),
            caller: "bob".to_string(),
        };
        assert!(held.is_contention());
        assert!(!CoreError::QuantityOverflow.is_contention());
    }
}
