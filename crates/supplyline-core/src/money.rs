//! # Money Module
//!
//! Integer money for selling/cost prices and price quotes.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  A 10% tier on 15 units at $1.00                                        │
//! │                                                                         │
//! │  Floating point:  1.00 * 15 * 0.9 = 13.499999999999998  ❌             │
//! │  Integer cents:   100 * 15 = 1500; 1500 - 150 = 1350   ✅              │
//! │                                                                         │
//! │  Percent discounts are basis points (1000 = 10%), rounded half-up      │
//! │  once, at the end.                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use supplyline_core::money::{DiscountRate, Money};
//!
//! let price = Money::from_cents(100);
//! let total = price.checked_mul_quantity(15).unwrap();
//! assert_eq!(total.apply_discount_rate(DiscountRate::from_percent(10)).cents(), 1350);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use ts_rs::TS;

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in the smallest currency unit (cents).
///
/// ## Design Decisions
/// - **i64 (signed)**: intermediate differences may go negative; stored
///   prices are validated to be ≥ 0
/// - **Single field tuple struct**: Zero-cost abstraction over i64
/// - Serialises as a bare integer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, TS,
)]
#[ts(export)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from cents.
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    #[inline]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn dollars(&self) -> i64 {
        self.0 / 100
    }

    /// Cents portion (always 0-99).
    #[inline]
    pub const fn cents_part(&self) -> i64 {
        (self.0 % 100).abs()
    }

    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Unit price times quantity, `None` on overflow.
    ///
    /// A quote for an absurd quantity must fail rather than wrap around
    /// into a tiny price.
    #[inline]
    pub fn checked_mul_quantity(&self, qty: i64) -> Option<Self> {
        self.0.checked_mul(qty).map(Money)
    }

    /// Subtracts `other`, flooring the result at zero.
    #[inline]
    pub fn saturating_sub_floor_zero(&self, other: Money) -> Self {
        Money((self.0 - other.0).max(0))
    }

    /// Applies a percentage discount, rounding the discount half-up.
    ///
    /// ```rust
    /// use supplyline_core::money::{DiscountRate, Money};
    ///
    /// let subtotal = Money::from_cents(999);
    /// // 10% of 999 = 99.9 → 100 off
    /// assert_eq!(subtotal.apply_discount_rate(DiscountRate::from_bps(1000)).cents(), 899);
    /// ```
    pub fn apply_discount_rate(&self, rate: DiscountRate) -> Money {
        // i128 keeps large totals from overflowing mid-calculation
        let discount = (self.0 as i128 * rate.bps() as i128 + 5000) / 10000;
        Money::from_cents(self.0 - discount as i64)
    }

    /// Divides a total back into a per-unit price, rounding half-up.
    ///
    /// Returns zero for a zero quantity.
    pub fn per_unit(&self, qty: i64) -> Money {
        if qty <= 0 {
            return Money::zero();
        }
        let qty = qty as i128;
        let value = self.0 as i128;
        Money::from_cents(((value * 2 + qty) / (qty * 2)) as i64)
    }
}

// =============================================================================
// Discount Rate
// =============================================================================

/// A percentage expressed in basis points (1 bps = 0.01%).
///
/// `DiscountRate::from_percent(10)` is `1000` bps. Values above 10000
/// (100%) are representable but rejected by tier validation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, TS,
)]
#[ts(export)]
pub struct DiscountRate(u32);

impl DiscountRate {
    /// 100% in basis points.
    pub const FULL_BPS: u32 = 10_000;

    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        DiscountRate(bps)
    }

    #[inline]
    pub const fn from_percent(percent: u32) -> Self {
        DiscountRate(percent * 100)
    }

    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0 <= Self::FULL_BPS
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{}${}.{:02}", sign, self.dollars().abs(), self.cents_part())
    }
}

impl fmt::Display for DiscountRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_cents() {
        let money = Money::from_cents(1099);
        assert_eq!(money.cents(), 1099);
        assert_eq!(money.dollars(), 10);
        assert_eq!(money.cents_part(), 99);
        assert_eq!(Money::from_cents(-550).cents_part(), 50);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Money::from_cents(1350)), "$13.50");
        assert_eq!(format!("{}", Money::from_cents(-550)), "-$5.50");
        assert_eq!(format!("{}", Money::zero()), "$0.00");
        assert_eq!(format!("{}", DiscountRate::from_bps(1250)), "12.50%");
    }

    #[test]
    fn test_percent_discount_on_tier_total() {
        let total = Money::from_cents(100).checked_mul_quantity(15).unwrap();
        let discounted = total.apply_discount_rate(DiscountRate::from_percent(10));
        assert_eq!(discounted.cents(), 1350);
    }

    #[test]
    fn test_flat_discount_floors_at_zero() {
        let total = Money::from_cents(300);
        assert_eq!(total.saturating_sub_floor_zero(Money::from_cents(500)), Money::zero());
        assert_eq!(total.saturating_sub_floor_zero(Money::from_cents(50)).cents(), 250);
    }

    #[test]
    fn test_quantity_overflow_is_detected() {
        assert!(Money::from_cents(i64::MAX / 2).checked_mul_quantity(3).is_none());
    }

    #[test]
    fn test_per_unit_rounds_half_up() {
        // 1000 / 3 = 333.33 → 333
        assert_eq!(Money::from_cents(1000).per_unit(3).cents(), 333);
        // 1001 / 2 = 500.5 → 501
        assert_eq!(Money::from_cents(1001).per_unit(2).cents(), 501);
        assert_eq!(Money::from_cents(1000).per_unit(0), Money::zero());
    }

    #[test]
    fn test_discount_rate_bounds() {
        assert!(DiscountRate::from_percent(100).is_valid());
        assert!(!DiscountRate::from_bps(10_001).is_valid());
    }
}
