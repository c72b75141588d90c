//! # Domain Types
//!
//! Ledger lines, journal entries and the query shapes shared by every layer.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Ledger Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  InventoryLine  │   │  JournalEntry   │   │ MutationContext │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  retailer_id    │◄──│  line_id        │   │  actor_id       │       │
//! │  │  product_id     │   │  line_version   │   │  reason         │       │
//! │  │  current_stock  │   │  kind/quantity  │   │  reference      │       │
//! │  │  committed      │   │  before/after   │   │  note           │       │
//! │  │  version        │   │  reason, actor  │   └─────────────────┘       │
//! │  └─────────────────┘   └─────────────────┘                              │
//! │                                                                         │
//! │  Derived on read, never stored:                                         │
//! │    available = current - committed                                      │
//! │    low_stock = available <= min_stock_level                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::money::Money;
use crate::mutation::MutationKind;
use crate::pricing::PricingTier;

// =============================================================================
// Stock Levels
// =============================================================================

/// The two stored counters of a line. `0 <= committed <= current` always.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockLevels {
    pub current: i64,
    pub committed: i64,
}

impl StockLevels {
    pub const fn new(current: i64, committed: i64) -> Self {
        Self { current, committed }
    }

    /// Sellable quantity.
    #[inline]
    pub const fn available(&self) -> i64 {
        self.current - self.committed
    }

    #[inline]
    pub const fn is_consistent(&self) -> bool {
        self.committed >= 0 && self.committed <= self.current
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.current == 0 && self.committed == 0
    }
}

// =============================================================================
// Inventory Line
// =============================================================================

/// Natural key of a ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LineKey {
    pub retailer_id: String,
    pub product_id: String,
}

impl LineKey {
    pub fn new(retailer_id: impl Into<String>, product_id: impl Into<String>) -> Self {
        Self {
            retailer_id: retailer_id.into(),
            product_id: product_id.into(),
        }
    }
}

impl std::fmt::Display for LineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.retailer_id, self.product_id)
    }
}

/// Stock record for one (retailer, product) pair.
///
/// Mutated only by the mutation engine. `version` increases by one for every
/// journal entry and every metadata change, and is what concurrent writers
/// compare-and-swap on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InventoryLine {
    pub id: String,
    pub retailer_id: String,
    pub product_id: String,
    pub current_stock: i64,
    pub committed_stock: i64,
    /// Cumulative units sold (STOCK_OUT with reason SALE).
    pub total_sold: i64,
    pub selling_price: Money,
    pub cost_price: Money,
    pub min_stock_level: i64,
    pub max_stock_level: i64,
    pub quantity_pricing_enabled: bool,
    /// Sorted by `min_qty`, non-overlapping.
    pub pricing_tiers: Vec<PricingTier>,
    pub is_active: bool,
    pub version: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl InventoryLine {
    pub fn key(&self) -> LineKey {
        LineKey::new(&self.retailer_id, &self.product_id)
    }

    pub fn levels(&self) -> StockLevels {
        StockLevels::new(self.current_stock, self.committed_stock)
    }

    pub fn available_stock(&self) -> i64 {
        self.levels().available()
    }

    pub fn is_low_stock(&self) -> bool {
        self.available_stock() <= self.min_stock_level
    }

    pub fn is_out_of_stock(&self) -> bool {
        self.available_stock() == 0
    }
}

/// Read model of a line with the derived flags filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InventoryLineView {
    #[serde(flatten)]
    pub line: InventoryLine,
    pub available_stock: i64,
    pub low_stock: bool,
    pub out_of_stock: bool,
}

impl From<InventoryLine> for InventoryLineView {
    fn from(line: InventoryLine) -> Self {
        Self {
            available_stock: line.available_stock(),
            low_stock: line.is_low_stock(),
            out_of_stock: line.is_out_of_stock(),
            line,
        }
    }
}

/// Fields supplied when a retailer starts stocking a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NewInventoryLine {
    pub retailer_id: String,
    pub product_id: String,
    pub initial_stock: i64,
    pub selling_price: Money,
    pub cost_price: Money,
    pub min_stock_level: i64,
    pub max_stock_level: i64,
}

// =============================================================================
// Journal
// =============================================================================

/// Why a mutation happened.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    InitialStock,
    Purchase,
    Sale,
    Return,
    Damage,
    Correction,
    OrderReserved,
    OrderCancelled,
    OrderDelivered,
    ReservationRollback,
    TransferIn,
    TransferOut,
}

/// What a journal entry's `reference_id` points at.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Order,
    Transfer,
    Manual,
}

/// Who, why and on whose behalf a mutation is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MutationContext {
    pub actor_id: String,
    pub reason: ReasonCode,
    pub reference_kind: ReferenceKind,
    pub reference_id: Option<String>,
    pub note: Option<String>,
}

impl MutationContext {
    /// A manual mutation with no reference.
    pub fn manual(actor_id: impl Into<String>, reason: ReasonCode) -> Self {
        Self {
            actor_id: actor_id.into(),
            reason,
            reference_kind: ReferenceKind::Manual,
            reference_id: None,
            note: None,
        }
    }

    pub fn for_order(actor_id: impl Into<String>, reason: ReasonCode, order_id: &str) -> Self {
        Self {
            actor_id: actor_id.into(),
            reason,
            reference_kind: ReferenceKind::Order,
            reference_id: Some(order_id.to_string()),
            note: None,
        }
    }

    pub fn for_transfer(actor_id: impl Into<String>, reason: ReasonCode, request_id: &str) -> Self {
        Self {
            actor_id: actor_id.into(),
            reason,
            reference_kind: ReferenceKind::Transfer,
            reference_id: Some(request_id.to_string()),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_reason(&self, reason: ReasonCode) -> Self {
        Self {
            reason,
            ..self.clone()
        }
    }
}

/// One immutable row of ledger history.
///
/// `stock_after`/`committed_after` follow from the before-values, `kind`
/// and `quantity` alone (see [`crate::mutation::apply`]). For `Adjust` the
/// quantity is the absolute target.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct JournalEntry {
    pub id: String,
    pub line_id: String,
    /// Line version this entry produced; unique per line.
    pub line_version: i64,
    pub retailer_id: String,
    pub product_id: String,
    pub kind: MutationKind,
    pub quantity: i64,
    pub stock_before: i64,
    pub stock_after: i64,
    pub committed_before: i64,
    pub committed_after: i64,
    pub reason: ReasonCode,
    pub reference_kind: ReferenceKind,
    pub reference_id: Option<String>,
    pub actor_id: String,
    pub note: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn levels_before(&self) -> StockLevels {
        StockLevels::new(self.stock_before, self.committed_before)
    }

    pub fn levels_after(&self) -> StockLevels {
        StockLevels::new(self.stock_after, self.committed_after)
    }
}

/// A `{product, quantity}` pair from an order or request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ItemQuantity {
    pub product_id: String,
    pub quantity: i64,
}

impl ItemQuantity {
    pub fn new(product_id: impl Into<String>, quantity: i64) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

// =============================================================================
// Queries
// =============================================================================

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }

    /// Forces page ≥ 1 and `1 <= page_size <= max`.
    pub fn clamped(self, max_page_size: u32) -> Self {
        Self {
            page: self.page.max(1),
            page_size: self.page_size.clamp(1, max_page_size.max(1)),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) as i64 - 1) * self.page_size as i64
    }

    pub fn limit(&self) -> i64 {
        self.page_size as i64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 50)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, request: PageRequest) -> Self {
        Self {
            items,
            total,
            page: request.page,
            page_size: request.page_size,
        }
    }

    pub fn has_more(&self) -> bool {
        (self.page as i64) * (self.page_size as i64) < self.total
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

/// Filter for a retailer's ledger listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LineFilter {
    pub low_stock_only: bool,
    pub out_of_stock_only: bool,
    pub include_retired: bool,
}

/// Filter for journal listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct JournalFilter {
    /// Empty means every kind.
    pub kinds: Vec<MutationKind>,
    #[ts(as = "Option<String>")]
    pub from: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub to: Option<DateTime<Utc>>,
}

impl JournalFilter {
    pub fn matches(&self, entry: &JournalEntry) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&entry.kind))
            && self.from.map_or(true, |from| entry.created_at >= from)
            && self.to.map_or(true, |to| entry.created_at <= to)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn line(current: i64, committed: i64, min: i64) -> InventoryLine {
        let now = Utc::now();
        InventoryLine {
            id: "line-1".to_string(),
            retailer_id: "R1".to_string(),
            product_id: "P1".to_string(),
            current_stock: current,
            committed_stock: committed,
            total_sold: 0,
            selling_price: Money::from_cents(100),
            cost_price: Money::from_cents(60),
            min_stock_level: min,
            max_stock_level: 500,
            quantity_pricing_enabled: false,
            pricing_tiers: vec![],
            is_active: true,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_derived_flags_use_available_stock() {
        // 25 on hand but 20 reserved: only 5 sellable, below min of 10
        let view = InventoryLineView::from(line(25, 20, 10));
        assert_eq!(view.available_stock, 5);
        assert!(view.low_stock);
        assert!(!view.out_of_stock);

        let view = InventoryLineView::from(line(20, 20, 0));
        assert!(view.out_of_stock);
        assert!(view.low_stock);
    }

    #[test]
    fn test_page_request_clamping() {
        let req = PageRequest::new(0, 10_000).clamped(500);
        assert_eq!(req.page, 1);
        assert_eq!(req.page_size, 500);
        assert_eq!(req.offset(), 0);

        let req = PageRequest::new(3, 20).clamped(500);
        assert_eq!(req.offset(), 40);
        assert_eq!(req.limit(), 20);
    }

    #[test]
    fn test_page_has_more() {
        let page = Page::new(vec![1, 2], 5, PageRequest::new(1, 2));
        assert!(page.has_more());
        let page = Page::new(vec![5], 5, PageRequest::new(3, 2));
        assert!(!page.has_more());
    }

    #[test]
    fn test_context_builders() {
        let ctx = MutationContext::for_order("clerk", ReasonCode::OrderReserved, "O1");
        assert_eq!(ctx.reference_kind, ReferenceKind::Order);
        assert_eq!(ctx.reference_id.as_deref(), Some("O1"));

        let release = ctx.with_reason(ReasonCode::OrderCancelled);
        assert_eq!(release.reason, ReasonCode::OrderCancelled);
        assert_eq!(release.reference_id.as_deref(), Some("O1"));
    }

    #[test]
    fn test_reason_code_serializes_snake_case() {
        let json = serde_json::to_string(&ReasonCode::ReservationRollback).unwrap();
        assert_eq!(json, "\"reservation_rollback\"");
    }
}
