//! # Validation Module
//!
//! Input checks that run before any rule or query.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: THIS MODULE                                                  │
//! │  ├── identifiers, quantities, prices, item lists                       │
//! │  └── rejects before a transaction is opened                            │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: mutation / transfer rules (business errors)                  │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite                                                       │
//! │  ├── CHECK (committed_stock <= current_stock)                          │
//! │  ├── UNIQUE (retailer_id, product_id)                                  │
//! │  └── UNIQUE (request_id, idempotency_token)                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use supplyline_core::validation::{validate_id, validate_quantity};
//!
//! validate_id("retailer_id", "retailer-042").unwrap();
//! assert!(validate_quantity(0).is_err());
//! ```

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::money::Money;
use crate::types::ItemQuantity;
use crate::{MAX_LINE_QUANTITY, MAX_REQUEST_LINES};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest accepted identifier (retailer, product, order, actor, token).
pub const MAX_ID_LEN: usize = 128;

// =============================================================================
// String Validators
// =============================================================================

/// Validates an externally supplied identifier.
///
/// ## Rules
/// - Must not be empty or blank
/// - At most [`MAX_ID_LEN`] characters
/// - Letters, digits, `-`, `_`, `.`, `:` and `@` only, so surrounding
///   whitespace is refused rather than stored
pub fn validate_id(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_ID_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_ID_LEN,
        });
    }

    if !value
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@'))
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must contain only letters, numbers and - _ . : @".to_string(),
        });
    }

    Ok(())
}

/// Validates a free-text note (optional, at most 1000 characters).
pub fn validate_note(note: Option<&str>) -> ValidationResult<()> {
    match note {
        Some(text) if text.len() > 1000 => Err(ValidationError::TooLong {
            field: "note".to_string(),
            max: 1000,
        }),
        _ => Ok(()),
    }
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a quantity moved by a single operation.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed [`MAX_LINE_QUANTITY`]
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_LINE_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_LINE_QUANTITY,
        });
    }

    Ok(())
}

/// Validates the quantity of a single engine mutation.
///
/// ## Rules
/// - Must not be negative (zero records a no-op)
/// - Must not exceed [`MAX_LINE_QUANTITY`]
pub fn validate_movement(qty: i64) -> ValidationResult<()> {
    if qty < 0 {
        return Err(ValidationError::MustNotBeNegative {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_LINE_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 0,
            max: MAX_LINE_QUANTITY,
        });
    }

    Ok(())
}

/// Validates a stock count (initial stock, adjustment target). Zero allowed.
pub fn validate_stock_count(field: &str, value: i64) -> ValidationResult<()> {
    if value < 0 {
        return Err(ValidationError::MustNotBeNegative {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates a price. Zero is allowed (free samples).
///
/// ```rust
/// use supplyline_core::money::Money;
/// use supplyline_core::validation::validate_price;
///
/// assert!(validate_price("selling_price", Money::from_cents(0)).is_ok());
/// assert!(validate_price("selling_price", Money::from_cents(-1)).is_err());
/// ```
pub fn validate_price(field: &str, price: Money) -> ValidationResult<()> {
    if price.is_negative() {
        return Err(ValidationError::MustNotBeNegative {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates reorder thresholds: both ≥ 0 and `min <= max`.
pub fn validate_stock_levels(min: i64, max: i64) -> ValidationResult<()> {
    validate_stock_count("min_stock_level", min)?;
    validate_stock_count("max_stock_level", max)?;
    if min > max {
        return Err(ValidationError::OutOfRange {
            field: "min_stock_level".to_string(),
            min: 0,
            max,
        });
    }
    Ok(())
}

// =============================================================================
// Collection Validators
// =============================================================================

/// Validates the item list of a reservation or transfer request.
///
/// ## Rules
/// - At least one item, at most [`MAX_REQUEST_LINES`]
/// - Every product id valid and every quantity valid
/// - When `unique` is set, no product may appear twice
pub fn validate_items(items: &[ItemQuantity], unique: bool) -> ValidationResult<()> {
    if items.is_empty() {
        return Err(ValidationError::Required {
            field: "items".to_string(),
        });
    }

    if items.len() > MAX_REQUEST_LINES {
        return Err(ValidationError::TooMany {
            field: "items".to_string(),
            max: MAX_REQUEST_LINES,
        });
    }

    let mut seen = HashSet::new();
    for item in items {
        validate_id("product_id", &item.product_id)?;
        validate_quantity(item.quantity)?;
        if unique && !seen.insert(item.product_id.as_str()) {
            return Err(ValidationError::Duplicate {
                field: "product_id".to_string(),
                value: item.product_id.clone(),
            });
        }
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("retailer_id", "retailer-042").is_ok());
        assert!(validate_id("actor_id", "ops@central").is_ok());

        assert!(validate_id("retailer_id", "").is_err());
        assert!(validate_id("retailer_id", "   ").is_err());
        assert!(validate_id("retailer_id", "has space").is_err());
        assert!(matches!(
            validate_id("retailer_id", "R1 "),
            Err(ValidationError::InvalidFormat { .. })
        ));
        assert!(validate_id("retailer_id", " R1").is_err());
        assert!(validate_id("retailer_id", "R1\n").is_err());
        assert!(validate_id("retailer_id", &"A".repeat(200)).is_err());
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(MAX_LINE_QUANTITY).is_ok());

        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(-1).is_err());
        assert!(validate_quantity(MAX_LINE_QUANTITY + 1).is_err());
    }

    #[test]
    fn test_validate_movement_allows_zero() {
        assert!(validate_movement(0).is_ok());
        assert!(validate_movement(MAX_LINE_QUANTITY).is_ok());

        assert!(validate_movement(-1).is_err());
        assert!(validate_movement(MAX_LINE_QUANTITY + 1).is_err());
    }

    #[test]
    fn test_validate_stock_levels() {
        assert!(validate_stock_levels(0, 0).is_ok());
        assert!(validate_stock_levels(5, 50).is_ok());
        assert!(validate_stock_levels(50, 5).is_err());
        assert!(validate_stock_levels(-1, 5).is_err());
    }

    #[test]
    fn test_validate_items() {
        let items = vec![ItemQuantity::new("P1", 2), ItemQuantity::new("P2", 1)];
        assert!(validate_items(&items, true).is_ok());

        let dup = vec![ItemQuantity::new("P1", 2), ItemQuantity::new("P1", 1)];
        assert!(matches!(
            validate_items(&dup, true),
            Err(ValidationError::Duplicate { .. })
        ));
        assert!(validate_items(&dup, false).is_ok());

        assert!(validate_items(&[], false).is_err());
        assert!(validate_items(&[ItemQuantity::new("P1", 0)], false).is_err());
    }

    #[test]
    fn test_validate_note() {
        assert!(validate_note(None).is_ok());
        assert!(validate_note(Some("short")).is_ok());
        assert!(validate_note(Some(&"x".repeat(1001))).is_err());
    }
}
