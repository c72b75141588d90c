//! # supplyline-db: Storage, Mutation Engine and Workflows
//!
//! Everything that reads or writes the stock ledger. SQLite through sqlx,
//! one transaction per public operation.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Supplyline Data Flow                               │
//! │                                                                         │
//! │  Order service / admin console / transfer desk                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  supplyline-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   Ledger ──► ReservationWorkflow ─┐                             │   │
//! │  │        └───► TransferWorkflow ────┼──► MutationEngine           │   │
//! │  │                                   │        │  RetryPolicy       │   │
//! │  │                                   ▼        ▼                    │   │
//! │  │                          repository::{line, journal, transfer}  │   │
//! │  │                                   │                             │   │
//! │  └───────────────────────────────────┼─────────────────────────────┘   │
//! │                                      ▼                                  │
//! │                          SQLite (WAL, migrations embedded)              │
//! │                                                                         │
//! │  supplyline-core supplies the rules: mutation::apply, transfer checks,  │
//! │  pricing, validation.                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Storage and ledger error types
//! - [`config`] - `supplyline.toml` loading with environment overrides
//! - [`repository`] - SQL for lines, journal and transfers
//! - [`engine`] - Atomic line + journal mutations
//! - [`workflow`] - Reservations and stock transfers
//! - [`ledger`] - The wired-up entry point
//!
//! ## Usage
//!
//! ```rust,ignore
//! use supplyline_db::{Ledger, LedgerConfig};
//!
//! let ledger = Ledger::open(LedgerConfig::load(None)?).await?;
//! let outcome = ledger
//!     .reservations()
//!     .reserve_for_order("O1", "R1", &items, "clerk")
//!     .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod retry;
pub mod workflow;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{ConfigError, LedgerConfig, SupplierAccounting};
pub use engine::{BatchOutcome, MutationEngine, MutationOutcome};
pub use error::{DbError, DbResult, LedgerError, LedgerResult};
pub use events::{BroadcastEventSink, TracingEventSink};
pub use ledger::Ledger;
pub use pool::{Database, DbConfig};
pub use retry::RetryPolicy;
pub use workflow::transfer::TransferPolicy;
pub use workflow::{OrderOutcome, ReservationWorkflow, TransferWorkflow};

// Repository re-exports for convenience
pub use repository::journal::JournalRepository;
pub use repository::line::LineRepository;
pub use repository::transfer::TransferRepository;
