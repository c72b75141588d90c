//! # Pricing Engine
//!
//! Quantity tier validation and price quotes. Pure: a quote depends only on
//! the line's configuration and the quantity asked for.
//!
//! ```text
//!   tiers (sorted, non-overlapping)        quantity 15
//!   ┌─────────┬─────────┬──────────────┐         │
//!   │ min_qty │ max_qty │ discount     │         ▼
//!   ├─────────┼─────────┼──────────────┤   tier [10, 19] matches
//!   │    5    │    9    │ flat $1.00   │         │
//!   │   10    │   19    │ percent 10%  │◄────────┘
//!   │   20    │   99    │ percent 15%  │   100 × 15 = 1500 → 1350
//!   └─────────┴─────────┴──────────────┘
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::money::{DiscountRate, Money};
use crate::types::InventoryLine;
use crate::validation::validate_quantity;

/// Discount a tier grants on the whole line total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Discount {
    /// Fixed amount off the total, floored at zero.
    Flat(Money),
    /// Percentage off the total.
    Percent(DiscountRate),
}

impl Discount {
    pub fn apply(&self, total: Money) -> Money {
        match *self {
            Discount::Flat(amount) => total.saturating_sub_floor_zero(amount),
            Discount::Percent(rate) => total.apply_discount_rate(rate),
        }
    }
}

/// Inclusive quantity band with its discount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PricingTier {
    pub min_qty: i64,
    pub max_qty: i64,
    pub discount: Discount,
}

impl PricingTier {
    pub fn new(min_qty: i64, max_qty: i64, discount: Discount) -> Self {
        Self {
            min_qty,
            max_qty,
            discount,
        }
    }

    #[inline]
    pub fn contains(&self, quantity: i64) -> bool {
        self.min_qty <= quantity && quantity <= self.max_qty
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PriceQuote {
    pub quantity: i64,
    /// Effective per-unit price after the discount, rounded half-up.
    pub unit_price: Money,
    pub total_price: Money,
    pub applied_tier: Option<PricingTier>,
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidPricingTiers {
        reason: reason.into(),
    }
}

/// Checks a tier set and returns it sorted by `min_qty`.
///
/// Rejects: bounds below 1, `min_qty > max_qty`, overlapping bands,
/// percentages over 100% and negative flat amounts.
pub fn validate_tiers(tiers: &[PricingTier]) -> CoreResult<Vec<PricingTier>> {
    let mut sorted = tiers.to_vec();
    sorted.sort_by_key(|t| (t.min_qty, t.max_qty));

    for tier in &sorted {
        if tier.min_qty < 1 {
            return Err(invalid(format!("min_qty must be at least 1, got {}", tier.min_qty)));
        }
        if tier.min_qty > tier.max_qty {
            return Err(invalid(format!(
                "min_qty {} exceeds max_qty {}",
                tier.min_qty, tier.max_qty
            )));
        }
        match tier.discount {
            Discount::Flat(amount) if amount.is_negative() => {
                return Err(invalid("flat discount must not be negative"));
            }
            Discount::Percent(rate) if !rate.is_valid() => {
                return Err(invalid(format!("percent discount {rate} exceeds 100%")));
            }
            _ => {}
        }
    }

    for pair in sorted.windows(2) {
        if pair[1].min_qty <= pair[0].max_qty {
            return Err(invalid(format!(
                "tier [{}, {}] overlaps tier [{}, {}]",
                pair[0].min_qty, pair[0].max_qty, pair[1].min_qty, pair[1].max_qty
            )));
        }
    }

    Ok(sorted)
}

/// The tier covering `quantity`, if quantity pricing is on.
pub fn matching_tier(line: &InventoryLine, quantity: i64) -> Option<PricingTier> {
    if !line.quantity_pricing_enabled {
        return None;
    }
    line.pricing_tiers.iter().copied().find(|t| t.contains(quantity))
}

/// Quotes `quantity` units of `line`.
///
/// Falls back to the plain selling price when quantity pricing is disabled,
/// no tiers are configured, or no tier covers the quantity.
pub fn price_for(line: &InventoryLine, quantity: i64) -> CoreResult<PriceQuote> {
    validate_quantity(quantity)?;

    let base_total = line
        .selling_price
        .checked_mul_quantity(quantity)
        .ok_or(CoreError::QuantityOverflow)?;

    let applied_tier = matching_tier(line, quantity);
    let total_price = match applied_tier {
        Some(tier) => tier.discount.apply(base_total),
        None => base_total,
    };

    Ok(PriceQuote {
        quantity,
        unit_price: total_price.per_unit(quantity),
        total_price,
        applied_tier,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn line_with(price: i64, enabled: bool, tiers: Vec<PricingTier>) -> InventoryLine {
        let now = Utc::now();
        InventoryLine {
            id: "line-1".to_string(),
            retailer_id: "R1".to_string(),
            product_id: "P1".to_string(),
            current_stock: 100,
            committed_stock: 0,
            total_sold: 0,
            selling_price: Money::from_cents(price),
            cost_price: Money::from_cents(price / 2),
            min_stock_level: 0,
            max_stock_level: 0,
            quantity_pricing_enabled: enabled,
            pricing_tiers: tiers,
            is_active: true,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn percent(min: i64, max: i64, pct: u32) -> PricingTier {
        PricingTier::new(min, max, Discount::Percent(DiscountRate::from_percent(pct)))
    }

    #[test]
    fn test_percent_tier_quote() {
        let line = line_with(100, true, vec![percent(10, 19, 10)]);
        let quote = price_for(&line, 15).unwrap();
        assert_eq!(quote.total_price.cents(), 1350);
        assert_eq!(quote.unit_price.cents(), 90);
        assert_eq!(quote.applied_tier, Some(percent(10, 19, 10)));
    }

    #[test]
    fn test_flat_tier_floors_at_zero() {
        let tier = PricingTier::new(1, 5, Discount::Flat(Money::from_cents(1_000)));
        let line = line_with(100, true, vec![tier]);
        let quote = price_for(&line, 3).unwrap();
        assert_eq!(quote.total_price, Money::zero());
    }

    #[test]
    fn test_falls_back_to_base_price() {
        let tiers = vec![percent(10, 19, 10)];

        // outside every tier
        let line = line_with(100, true, tiers.clone());
        let quote = price_for(&line, 25).unwrap();
        assert_eq!(quote.total_price.cents(), 2500);
        assert!(quote.applied_tier.is_none());

        // quantity pricing switched off
        let line = line_with(100, false, tiers);
        assert_eq!(price_for(&line, 15).unwrap().total_price.cents(), 1500);
    }

    #[test]
    fn test_quote_rejects_non_positive_quantity() {
        let line = line_with(100, false, vec![]);
        assert!(price_for(&line, 0).is_err());
    }

    #[test]
    fn test_validate_tiers_sorts() {
        let sorted = validate_tiers(&[percent(20, 29, 15), percent(10, 19, 10)]).unwrap();
        assert_eq!(sorted[0].min_qty, 10);
        assert_eq!(sorted[1].min_qty, 20);
    }

    #[test]
    fn test_validate_tiers_rejects_bad_sets() {
        assert!(validate_tiers(&[percent(10, 20, 10), percent(20, 30, 15)]).is_err());
        assert!(validate_tiers(&[percent(10, 5, 10)]).is_err());
        assert!(validate_tiers(&[percent(0, 5, 10)]).is_err());
        assert!(validate_tiers(&[percent(1, 5, 101)]).is_err());
        assert!(validate_tiers(&[PricingTier::new(
            1,
            5,
            Discount::Flat(Money::from_cents(-1))
        )])
        .is_err());
        assert!(validate_tiers(&[]).unwrap().is_empty());
    }
}
