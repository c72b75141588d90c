//! # supplyline-core: Pure Ledger Rules
//!
//! Everything that decides *whether* a stock change is allowed and *what* it
//! produces lives here, as pure functions with zero I/O. `supplyline-db`
//! only loads state, hands it to these functions and persists the result.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Supplyline Architecture                            │
//! │                                                                         │
//! │  Order management ──┐        ┌── Identity (actor / holder)             │
//! │                     ▼        ▼                                          │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  supplyline-db (workflows)                      │   │
//! │  │   ReservationWorkflow   TransferWorkflow   MutationEngine       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ supplyline-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐          │   │
//! │  │   │ mutation │ │ pricing  │ │ transfer │ │validation│          │   │
//! │  │   │ apply    │ │ tiers    │ │ locks    │ │  checks  │          │   │
//! │  │   │ replay   │ │ quotes   │ │ outcome  │ │          │          │   │
//! │  │   └──────────┘ └──────────┘ └──────────┘ └──────────┘          │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Ledger lines, journal entries, pages and filters
//! - [`mutation`] - The closed set of stock mutations and journal replay
//! - [`pricing`] - Quantity tier validation and price quotes
//! - [`transfer`] - Transfer request state machine and advisory locks
//! - [`events`] - Transfer notifications and the sink seam
//! - [`clock`] - Injectable time source
//! - [`money`] - Integer money (no floating point!)
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use supplyline_core::mutation::{apply, Mutation};
//! use supplyline_core::types::StockLevels;
//!
//! let levels = StockLevels::new(100, 0);
//! let reserved = apply(levels, &Mutation::Reserve { quantity: 30 }).unwrap();
//! assert_eq!(reserved.available(), 70);
//!
//! // Reserving more than is available is refused, not clamped
//! assert!(apply(reserved, &Mutation::Reserve { quantity: 71 }).is_err());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod error;
pub mod events;
pub mod money;
pub mod mutation;
pub mod pricing;
pub mod transfer;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult, ValidationError};
pub use events::{EventError, NoopEventSink, TransferEvent, TransferEventKind, TransferEventSink};
pub use money::{DiscountRate, Money};
pub use mutation::{Mutation, MutationKind, ReplayError};
pub use pricing::{Discount, PriceQuote, PricingTier};
pub use transfer::{
    ActOutcome, AdvisoryLock, Decision, DecisionKind, LineOverride, NewTransferRequest,
    TransferLine, TransferLogEntry, TransferPriority, TransferRecord, TransferRecordLine,
    TransferRequest, TransferStatus,
};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default advisory lock lifetime on a transfer request, in seconds.
///
/// ## Business Reason
/// Long enough for an operator to review a request, short enough that an
/// abandoned claim frees itself within a coffee break.
pub const DEFAULT_LOCK_TTL_SECS: i64 = 300;

/// Largest quantity accepted in a single mutation or request line.
///
/// ## Business Reason
/// Catches fat-fingered entries (an extra few zeros) before they reach the
/// ledger. Stock totals themselves may grow past it.
pub const MAX_LINE_QUANTITY: i64 = 1_000_000;

/// Maximum number of lines in a reservation or transfer request.
pub const MAX_REQUEST_LINES: usize = 200;
