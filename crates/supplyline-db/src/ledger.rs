//! # Ledger
//!
//! Entry point that wires configuration, storage, the engine and both
//! workflows together, and owns the line lifecycle.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Ledger                                                                 │
//! │  ├── onboard_line / retire_line / configure_pricing / update_*          │
//! │  ├── quote, list_lines, journal_for_line, journal_for_reference         │
//! │  ├── engine()        ──► MutationEngine                                 │
//! │  ├── reservations()  ──► ReservationWorkflow                            │
//! │  └── transfers()     ──► TransferWorkflow ──► TransferEventSink         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! let config = LedgerConfig::load(None)?;
//! let ledger = Ledger::open(config).await?;
//! let line = ledger.onboard_line(&new_line, "admin").await?;
//! ledger.reservations().reserve_for_order("O1", "R1", &items, "clerk").await?;
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::engine::{apply_in_tx, MutationEngine};
use crate::error::{DbError, LedgerResult};
use crate::events::TracingEventSink;
use crate::pool::Database;
use crate::repository::line;
use crate::retry::RetryPolicy;
use crate::workflow::transfer::TransferPolicy;
use crate::workflow::{ReservationWorkflow, TransferWorkflow};
use supplyline_core::pricing::{price_for, validate_tiers};
use supplyline_core::validation::{
    validate_id, validate_price, validate_stock_count, validate_stock_levels,
};
use supplyline_core::{
    Clock, CoreError, InventoryLine, InventoryLineView, JournalEntry, JournalFilter, LineFilter,
    LineKey, Money, Mutation, MutationContext, NewInventoryLine, Page, PageRequest, PriceQuote,
    PricingTier, ReasonCode, SystemClock, TransferEventSink, TransferLogEntry, TransferRecord,
    TransferRequest, TransferStatus,
};

#[derive(Clone)]
pub struct Ledger {
    db: Database,
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn TransferEventSink>,
    engine: MutationEngine,
    reservations: ReservationWorkflow,
    transfers: TransferWorkflow,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Builds a ledger on an open database, with the system clock and a
    /// tracing event sink.
    pub fn new(db: Database, config: LedgerConfig) -> Self {
        Self::assemble(db, config, Arc::new(SystemClock), Arc::new(TracingEventSink))
    }

    /// Opens the configured database (running migrations) and builds a ledger.
    pub async fn open(config: LedgerConfig) -> LedgerResult<Self> {
        let db = Database::new(config.db_config()).await?;
        Ok(Self::new(db, config))
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self::assemble(self.db, self.config, clock, self.events)
    }

    pub fn with_event_sink(self, events: Arc<dyn TransferEventSink>) -> Self {
        Self::assemble(self.db, self.config, self.clock, events)
    }

    fn assemble(
        db: Database,
        config: LedgerConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn TransferEventSink>,
    ) -> Self {
        let engine = MutationEngine::new(
            db.clone(),
            clock.clone(),
            RetryPolicy::from_config(&config.retry),
        );
        let reservations = ReservationWorkflow::new(engine.clone());
        let transfers = TransferWorkflow::new(
            engine.clone(),
            events.clone(),
            TransferPolicy::from_config(&config),
        );
        Ledger {
            db,
            config,
            clock,
            events,
            engine,
            reservations,
            transfers,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn engine(&self) -> &MutationEngine {
        &self.engine
    }

    pub fn reservations(&self) -> &ReservationWorkflow {
        &self.reservations
    }

    pub fn transfers(&self) -> &TransferWorkflow {
        &self.transfers
    }

    // =========================================================================
    // Line Lifecycle
    // =========================================================================

    /// Starts stocking a product at a retailer.
    ///
    /// Initial stock is journaled as STOCK_IN with reason INITIAL_STOCK, in
    /// the same transaction that creates the line.
    ///
    /// ## Errors
    /// - `LineExists` if the retailer already has a line for the product,
    ///   including a retired one
    pub async fn onboard_line(
        &self,
        new: &NewInventoryLine,
        actor_id: &str,
    ) -> LedgerResult<InventoryLine> {
        validate_id("retailer_id", &new.retailer_id)?;
        validate_id("product_id", &new.product_id)?;
        validate_id("actor_id", actor_id)?;
        validate_stock_count("initial_stock", new.initial_stock)?;
        validate_price("selling_price", new.selling_price)?;
        validate_price("cost_price", new.cost_price)?;
        validate_stock_levels(new.min_stock_level, new.max_stock_level)?;

        let now = self.clock.now();
        let fresh = InventoryLine {
            id: Uuid::new_v4().to_string(),
            retailer_id: new.retailer_id.clone(),
            product_id: new.product_id.clone(),
            current_stock: 0,
            committed_stock: 0,
            total_sold: 0,
            selling_price: new.selling_price,
            cost_price: new.cost_price,
            min_stock_level: new.min_stock_level,
            max_stock_level: new.max_stock_level,
            quantity_pricing_enabled: false,
            pricing_tiers: Vec::new(),
            is_active: true,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let ctx = MutationContext::manual(actor_id, ReasonCode::InitialStock);
        let (fresh_ref, ctx) = (&fresh, &ctx);
        let initial_stock = new.initial_stock;

        let line = self
            .engine
            .retry()
            .run("onboard_line", move || async move {
                let mut tx = self.db.pool().begin().await?;
                match line::insert(&mut tx, fresh_ref).await {
                    Ok(()) => {}
                    Err(e) if e.is_unique_violation() => {
                        return Err(CoreError::LineExists {
                            retailer_id: fresh_ref.retailer_id.clone(),
                            product_id: fresh_ref.product_id.clone(),
                        }
                        .into());
                    }
                    Err(e) => return Err(e.into()),
                }
                let line = if initial_stock > 0 {
                    let key = fresh_ref.key();
                    let stocked = apply_in_tx(
                        &mut tx,
                        &key,
                        Mutation::StockIn {
                            quantity: initial_stock,
                        },
                        ctx,
                        now,
                    )
                    .await?;
                    stocked.line
                } else {
                    fresh_ref.clone()
                };
                tx.commit().await?;
                Ok(line)
            })
            .await?;

        info!(
            line_id = %line.id,
            key = %line.key(),
            initial_stock,
            actor = actor_id,
            "Line onboarded"
        );
        Ok(line)
    }

    /// Marks a line inactive. Retired lines refuse mutations and drop out
    /// of listings unless asked for.
    ///
    /// ## Errors
    /// - `LineNotRetirable` while the line holds any stock
    pub async fn retire_line(&self, line_id: &str, actor_id: &str) -> LedgerResult<InventoryLine> {
        validate_id("actor_id", actor_id)?;
        let line = self
            .update_line("retire_line", line_id, false, |current| {
                if current.current_stock > 0 || current.committed_stock > 0 {
                    return Err(CoreError::LineNotRetirable {
                        line_id: current.id.clone(),
                        current: current.current_stock,
                        committed: current.committed_stock,
                    });
                }
                Ok(InventoryLine {
                    is_active: false,
                    ..current.clone()
                })
            })
            .await?;
        info!(line_id, actor = actor_id, "Line retired");
        Ok(line)
    }

    /// Turns quantity pricing on or off and replaces the tier set.
    pub async fn configure_pricing(
        &self,
        line_id: &str,
        enabled: bool,
        tiers: &[PricingTier],
    ) -> LedgerResult<InventoryLine> {
        let tiers = validate_tiers(tiers)?;
        let tiers = &tiers;
        let line = self
            .update_line("configure_pricing", line_id, true, move |current| {
                Ok(InventoryLine {
                    quantity_pricing_enabled: enabled,
                    pricing_tiers: tiers.clone(),
                    ..current.clone()
                })
            })
            .await?;
        info!(line_id, enabled, tiers = line.pricing_tiers.len(), "Pricing configured");
        Ok(line)
    }

    pub async fn update_prices(
        &self,
        line_id: &str,
        selling_price: Money,
        cost_price: Money,
    ) -> LedgerResult<InventoryLine> {
        validate_price("selling_price", selling_price)?;
        validate_price("cost_price", cost_price)?;
        let line = self
            .update_line("update_prices", line_id, false, move |current| {
                Ok(InventoryLine {
                    selling_price,
                    cost_price,
                    ..current.clone()
                })
            })
            .await?;
        info!(line_id, %selling_price, %cost_price, "Prices updated");
        Ok(line)
    }

    pub async fn update_stock_levels(
        &self,
        line_id: &str,
        min_stock_level: i64,
        max_stock_level: i64,
    ) -> LedgerResult<InventoryLine> {
        validate_stock_levels(min_stock_level, max_stock_level)?;
        self.update_line("update_stock_levels", line_id, false, move |current| {
            Ok(InventoryLine {
                min_stock_level,
                max_stock_level,
                ..current.clone()
            })
        })
        .await
    }

    /// Read-edit-write of line metadata under the line's write lock.
    /// Stock counters are never touched here.
    async fn update_line<F>(
        &self,
        operation: &'static str,
        line_id: &str,
        write_tiers: bool,
        edit: F,
    ) -> LedgerResult<InventoryLine>
    where
        F: Fn(&InventoryLine) -> Result<InventoryLine, CoreError>,
    {
        validate_id("line_id", line_id)?;
        let edit = &edit;
        self.engine
            .retry()
            .run(operation, move || async move {
                let mut tx = self.db.pool().begin().await?;
                let now: DateTime<Utc> = self.clock.now();
                if !line::claim_by_id(&mut tx, line_id).await? {
                    return Err(DbError::not_found("inventory_line", line_id).into());
                }
                let current = line::fetch_by_id(&mut tx, line_id)
                    .await?
                    .ok_or_else(|| DbError::not_found("inventory_line", line_id))?;

                let mut next = edit(&current)?;
                if write_tiers {
                    line::replace_tiers(&mut tx, line_id, &next.pricing_tiers).await?;
                }
                next.version = line::cas_update_metadata(&mut tx, &next, now).await?;
                next.updated_at = now;
                tx.commit().await?;
                Ok(next)
            })
            .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn line(&self, line_id: &str) -> LedgerResult<InventoryLineView> {
        let line = self
            .db
            .lines()
            .get(line_id)
            .await?
            .ok_or_else(|| DbError::not_found("inventory_line", line_id))?;
        Ok(line.into())
    }

    pub async fn line_by_key(&self, key: &LineKey) -> LedgerResult<InventoryLineView> {
        let line = self
            .db
            .lines()
            .get_by_key(&key.retailer_id, &key.product_id)
            .await?
            .ok_or_else(|| CoreError::LineNotFound {
                retailer_id: key.retailer_id.clone(),
                product_id: key.product_id.clone(),
            })?;
        Ok(line.into())
    }

    /// Prices `quantity` units of a line with its current tiers.
    pub async fn quote(&self, line_id: &str, quantity: i64) -> LedgerResult<PriceQuote> {
        let view = self.line(line_id).await?;
        Ok(price_for(&view.line, quantity)?)
    }

    /// A page of a retailer's ledger with derived stock flags.
    pub async fn list_lines(
        &self,
        retailer_id: &str,
        filter: LineFilter,
        page: PageRequest,
    ) -> LedgerResult<Page<InventoryLineView>> {
        let page = self.config.clamp_page(page);
        Ok(self
            .db
            .lines()
            .list(retailer_id, filter, page)
            .await?
            .map(InventoryLineView::from))
    }

    pub async fn journal_for_line(
        &self,
        line_id: &str,
        filter: &JournalFilter,
        page: PageRequest,
    ) -> LedgerResult<Page<JournalEntry>> {
        let page = self.config.clamp_page(page);
        Ok(self.db.journal().for_line(line_id, filter, page).await?)
    }

    /// Entries tagged with an order or transfer request id.
    pub async fn journal_for_reference(
        &self,
        reference_id: &str,
        page: PageRequest,
    ) -> LedgerResult<Page<JournalEntry>> {
        let page = self.config.clamp_page(page);
        Ok(self.db.journal().for_reference(reference_id, page).await?)
    }

    pub async fn transfer_request(&self, request_id: &str) -> LedgerResult<TransferRequest> {
        self.transfers.request(request_id).await
    }

    pub async fn list_transfer_requests(
        &self,
        retailer_id: &str,
        status: Option<TransferStatus>,
        page: PageRequest,
    ) -> LedgerResult<Page<TransferRequest>> {
        let page = self.config.clamp_page(page);
        self.transfers.list_requests(retailer_id, status, page).await
    }

    pub async fn transfer_records(&self, request_id: &str) -> LedgerResult<Vec<TransferRecord>> {
        self.transfers.records(request_id).await
    }

    pub async fn transfer_log(&self, request_id: &str) -> LedgerResult<Vec<TransferLogEntry>> {
        self.transfers.log(request_id).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
