//! # Workflows
//!
//! Multi-step operations composed from the mutation engine.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ReservationWorkflow            TransferWorkflow                        │
//! │  ───────────────────            ────────────────                        │
//! │  reserve_for_order              create_request                          │
//! │  confirm_delivery               acquire_lock / override_lock            │
//! │  cancel_reservation             release_lock                            │
//! │                                 act (fulfill | reject | cancel)         │
//! │          │                              │                               │
//! │          └──────────┬───────────────────┘                               │
//! │                     ▼                                                   │
//! │        engine::apply_in_tx  (one SQLite transaction per call)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod reservation;
pub mod transfer;

pub use reservation::{OrderOutcome, ReservationWorkflow};
pub use transfer::TransferWorkflow;
