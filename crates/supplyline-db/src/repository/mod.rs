//! # Repository Module
//!
//! SQL for each table group lives in one module.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Reads (pool)                        Writes (inside a transaction)      │
//! │  ────────────                        ─────────────────────────────      │
//! │  db.lines().list(..)                 line::claim_by_key(&mut *tx, ..)   │
//! │  db.journal().for_line(..)           line::cas_update_levels(..)        │
//! │  db.transfers().records(..)          journal::insert(..)                │
//! │       │                              transfer::insert_record(..)        │
//! │       ▼                                    │                            │
//! │  SqlitePool ◄──────────────────────────────┘                            │
//! │                                                                         │
//! │  Write functions are crate-private: only the engine and the workflows  │
//! │  compose them, so no caller can update a line without a journal entry. │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`LineRepository`](line::LineRepository) - Ledger lines and pricing tiers
//! - [`JournalRepository`](journal::JournalRepository) - Mutation history
//! - [`TransferRepository`](transfer::TransferRepository) - Requests, records, decision log

pub mod journal;
pub mod line;
pub mod transfer;
