//! # Stock Mutations
//!
//! The closed set of ways a ledger line can change, and the pure rules that
//! decide each one.
//!
//! ```text
//!   kind        current            committed          fails when
//!   ─────────   ────────────────   ────────────────   ─────────────────────────
//!   StockIn     += q                                  never (q ≥ 0)
//!   StockOut    -= q                                  q > current - committed
//!   Adjust      = target                              target < 0, target < committed
//!   Reserve                        += q               q > current - committed
//!   Release                        -= q               q > committed
//! ```
//!
//! The storage layer runs [`apply`] on the row it read, writes the result
//! and a [`JournalEntry`] in one transaction. [`replay`] runs the same rules
//! over the journal, so history and ledger cannot disagree without the
//! audit noticing.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{JournalEntry, ReasonCode, StockLevels};

/// Journal tag for a [`Mutation`].
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    StockIn,
    StockOut,
    Adjust,
    Reserve,
    Release,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::StockIn => "stock_in",
            MutationKind::StockOut => "stock_out",
            MutationKind::Adjust => "adjust",
            MutationKind::Reserve => "reserve",
            MutationKind::Release => "release",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single requested change to a ledger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    StockIn { quantity: i64 },
    StockOut { quantity: i64 },
    /// Set physical stock to an absolute count (stocktake).
    Adjust { target: i64 },
    Reserve { quantity: i64 },
    Release { quantity: i64 },
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::StockIn { .. } => MutationKind::StockIn,
            Mutation::StockOut { .. } => MutationKind::StockOut,
            Mutation::Adjust { .. } => MutationKind::Adjust,
            Mutation::Reserve { .. } => MutationKind::Reserve,
            Mutation::Release { .. } => MutationKind::Release,
        }
    }

    /// The value recorded in `JournalEntry::quantity`.
    pub fn quantity(&self) -> i64 {
        match *self {
            Mutation::StockIn { quantity }
            | Mutation::StockOut { quantity }
            | Mutation::Reserve { quantity }
            | Mutation::Release { quantity } => quantity,
            Mutation::Adjust { target } => target,
        }
    }

    /// Rebuilds the mutation a journal row records.
    pub fn from_journal(kind: MutationKind, quantity: i64) -> Self {
        match kind {
            MutationKind::StockIn => Mutation::StockIn { quantity },
            MutationKind::StockOut => Mutation::StockOut { quantity },
            MutationKind::Adjust => Mutation::Adjust { target: quantity },
            MutationKind::Reserve => Mutation::Reserve { quantity },
            MutationKind::Release => Mutation::Release { quantity },
        }
    }

    /// How much `total_sold` grows when this mutation runs with `reason`.
    pub fn sold_delta(&self, reason: ReasonCode) -> i64 {
        match (self, reason) {
            (Mutation::StockOut { quantity }, ReasonCode::Sale) => *quantity,
            _ => 0,
        }
    }
}

fn non_negative(quantity: i64) -> CoreResult<i64> {
    if quantity < 0 {
        return Err(ValidationError::MustNotBeNegative {
            field: "quantity".to_string(),
        }
        .into());
    }
    Ok(quantity)
}

/// Applies `mutation` to `levels`, returning the new levels.
///
/// Never returns levels that break `0 <= committed <= current`.
pub fn apply(levels: StockLevels, mutation: &Mutation) -> CoreResult<StockLevels> {
    let StockLevels { current, committed } = levels;
    let available = levels.available();

    let next = match *mutation {
        Mutation::StockIn { quantity } => {
            let quantity = non_negative(quantity)?;
            let current = current
                .checked_add(quantity)
                .ok_or(CoreError::QuantityOverflow)?;
            StockLevels::new(current, committed)
        }
        Mutation::StockOut { quantity } => {
            let quantity = non_negative(quantity)?;
            // Reserved units leave through Release, never from under an order
            if quantity > available {
                return Err(CoreError::InsufficientStock {
                    available,
                    requested: quantity,
                });
            }
            StockLevels::new(current - quantity, committed)
        }
        Mutation::Adjust { target } => {
            if target < 0 {
                return Err(CoreError::NegativeAdjustment { target });
            }
            if target < committed {
                return Err(CoreError::AdjustBelowCommitted { target, committed });
            }
            StockLevels::new(target, committed)
        }
        Mutation::Reserve { quantity } => {
            let quantity = non_negative(quantity)?;
            if quantity > available {
                return Err(CoreError::InsufficientAvailableStock {
                    available,
                    requested: quantity,
                });
            }
            StockLevels::new(current, committed + quantity)
        }
        Mutation::Release { quantity } => {
            let quantity = non_negative(quantity)?;
            if quantity > committed {
                return Err(CoreError::OverRelease {
                    committed,
                    requested: quantity,
                });
            }
            StockLevels::new(current, committed - quantity)
        }
    };

    debug_assert!(next.is_consistent());
    Ok(next)
}

/// Applies a sequence of mutations, stopping at the first failure.
pub fn apply_all(levels: StockLevels, mutations: &[Mutation]) -> CoreResult<StockLevels> {
    mutations.iter().try_fold(levels, |acc, m| apply(acc, m))
}

// =============================================================================
// Journal Replay
// =============================================================================

/// Why a journal does not replay to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    /// Entries must be sorted by strictly increasing `line_version`.
    #[error("Journal entry {entry_id} is out of order (version {found} after {previous})")]
    OutOfOrder {
        entry_id: String,
        previous: i64,
        found: i64,
    },

    /// The rules refuse an entry the journal says happened.
    #[error("Journal entry {entry_id} cannot be replayed: {source}")]
    Rejected {
        entry_id: String,
        #[source]
        source: CoreError,
    },

    /// Recorded before/after values do not match the replayed ones.
    #[error(
        "Journal entry {entry_id} diverges: replay gives {expected:?}, recorded {recorded:?}"
    )]
    Diverged {
        entry_id: String,
        expected: (StockLevels, StockLevels),
        recorded: (StockLevels, StockLevels),
    },
}

/// Replays one line's journal from zero.
///
/// Every entry is re-applied with [`apply`], and its recorded
/// before/after levels must equal the replayed ones.
///
/// ```rust
/// use supplyline_core::mutation::replay;
///
/// // An empty journal replays to an empty line
/// let levels = replay(std::iter::empty()).unwrap();
/// assert!(levels.is_empty());
/// ```
pub fn replay<'a, I>(entries: I) -> Result<StockLevels, ReplayError>
where
    I: IntoIterator<Item = &'a JournalEntry>,
{
    let mut levels = StockLevels::default();
    let mut previous_version: Option<i64> = None;

    for entry in entries {
        if let Some(previous) = previous_version {
            if entry.line_version <= previous {
                return Err(ReplayError::OutOfOrder {
                    entry_id: entry.id.clone(),
                    previous,
                    found: entry.line_version,
                });
            }
        }
        previous_version = Some(entry.line_version);

        let mutation = Mutation::from_journal(entry.kind, entry.quantity);
        let after = apply(levels, &mutation).map_err(|source| ReplayError::Rejected {
            entry_id: entry.id.clone(),
            source,
        })?;

        let expected = (levels, after);
        let recorded = (entry.levels_before(), entry.levels_after());
        if expected != recorded {
            return Err(ReplayError::Diverged {
                entry_id: entry.id.clone(),
                expected,
                recorded,
            });
        }
        levels = after;
    }

    Ok(levels)
}

// =============================================================================
// Unit Tests
// =============================================================================
