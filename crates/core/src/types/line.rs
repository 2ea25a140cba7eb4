//! Cart line type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::id::{LineId, ProductId, VariantId};
use super::price::{CurrencyCode, Price};

/// Errors that can occur when building or changing a [`CartLine`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    /// The variant ID is empty.
    #[error("variant id cannot be empty")]
    EmptyVariantId,
    /// The product ID is empty.
    #[error("product id cannot be empty")]
    EmptyProductId,
    /// The product name is empty.
    #[error("product name cannot be empty")]
    EmptyProductName,
    /// A line must hold at least one unit.
    #[error("quantity must be greater than zero")]
    ZeroQuantity,
    /// The quantity does not fit the line's counter.
    #[error("quantity must be at most {max}")]
    QuantityOverflow {
        /// Maximum allowed quantity.
        max: u32,
    },
    /// Unit prices are never negative.
    #[error("unit price cannot be negative")]
    NegativePrice,
    /// A cart holds a single currency.
    #[error("line is priced in {found:?} but the cart is priced in {expected:?}")]
    CurrencyMismatch {
        /// Currency of the lines already in the cart.
        expected: CurrencyCode,
        /// Currency of the rejected line.
        found: CurrencyCode,
    },
}

/// A single product-variant entry in a cart.
///
/// ## Constraints
///
/// - `variant_id`, `product_id` and `product_name` are non-blank
/// - `quantity` is at least 1; a line at zero is deleted, never stored
/// - `unit_price` is not negative
///
/// Deserialization goes through the same validation as [`CartLine::new`], so
/// a corrupted local snapshot cannot smuggle in a zero-quantity line.
///
/// ## Examples
///
/// ```
/// use naked_pineapple_core::{CartLine, CurrencyCode, Price};
///
/// let line = CartLine::new("v-1", "p-1", "Pineapple Tee", Price::from_minor(2500, CurrencyCode::USD), 2)
///     .unwrap()
///     .with_stock(10);
/// assert_eq!(line.quantity(), 2);
///
/// assert!(CartLine::new("v-1", "p-1", "Pineapple Tee", Price::from_minor(2500, CurrencyCode::USD), 0).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedCartLine")]
pub struct CartLine {
    variant_id: VariantId,
    product_id: ProductId,
    product_name: String,
    unit_price: Price,
    quantity: u32,
    stock: Option<u32>,
    line_id: Option<LineId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
}

/// Wire shape of a [`CartLine`] before validation.
#[derive(Deserialize)]
struct UncheckedCartLine {
    variant_id: VariantId,
    product_id: ProductId,
    product_name: String,
    unit_price: Price,
    quantity: u32,
    #[serde(default)]
    stock: Option<u32>,
    #[serde(default)]
    line_id: Option<LineId>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl TryFrom<UncheckedCartLine> for CartLine {
    type Error = LineError;

    fn try_from(raw: UncheckedCartLine) -> Result<Self, Self::Error> {
        let mut line = Self::new(
            raw.variant_id,
            raw.product_id,
            raw.product_name,
            raw.unit_price,
            raw.quantity,
        )?;
        line.stock = raw.stock;
        line.line_id = raw.line_id;
        line.metadata = raw.metadata;
        Ok(line)
    }
}

impl CartLine {
    /// Build a validated cart line.
    ///
    /// # Errors
    ///
    /// Returns an error if any id or the name is blank, the quantity is zero,
    /// or the price is negative.
    pub fn new(
        variant_id: impl Into<VariantId>,
        product_id: impl Into<ProductId>,
        product_name: impl Into<String>,
        unit_price: Price,
        quantity: u32,
    ) -> Result<Self, LineError> {
        let variant_id = variant_id.into();
        let product_id = product_id.into();
        let product_name = product_name.into();

        if variant_id.is_blank() {
            return Err(LineError::EmptyVariantId);
        }
        if product_id.is_blank() {
            return Err(LineError::EmptyProductId);
        }
        if product_name.trim().is_empty() {
            return Err(LineError::EmptyProductName);
        }
        if quantity == 0 {
            return Err(LineError::ZeroQuantity);
        }
        if unit_price.is_negative() {
            return Err(LineError::NegativePrice);
        }

        Ok(Self {
            variant_id,
            product_id,
            product_name,
            unit_price,
            quantity,
            stock: None,
            line_id: None,
            metadata: BTreeMap::new(),
        })
    }

    /// Set the last known availability.
    #[must_use]
    pub const fn with_stock(mut self, stock: u32) -> Self {
        self.stock = Some(stock);
        self
    }

    /// Set the server-assigned line id.
    #[must_use]
    pub fn with_line_id(mut self, line_id: impl Into<LineId>) -> Self {
        self.line_id = Some(line_id.into());
        self
    }

    /// Attach a metadata entry (engraving text, gift note, ...).
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn variant_id(&self) -> &VariantId {
        &self.variant_id
    }

    #[must_use]
    pub const fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    #[must_use]
    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    #[must_use]
    pub const fn unit_price(&self) -> Price {
        self.unit_price
    }

    #[must_use]
    pub const fn quantity(&self) -> u32 {
        self.quantity
    }

    /// Last known availability, `None` if never fetched.
    #[must_use]
    pub const fn stock(&self) -> Option<u32> {
        self.stock
    }

    /// Server-assigned id, `None` until the remote cart has confirmed the line.
    #[must_use]
    pub const fn line_id(&self) -> Option<&LineId> {
        self.line_id.as_ref()
    }

    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// `unit_price × quantity`.
    #[must_use]
    pub fn line_total(&self) -> Price {
        self.unit_price.times(self.quantity)
    }

    /// Change the quantity.
    ///
    /// # Errors
    ///
    /// Returns [`LineError::ZeroQuantity`] for zero. Callers that want
    /// "zero means delete" go through [`crate::Cart::set_quantity`].
    pub const fn set_quantity(&mut self, quantity: u32) -> Result<(), LineError> {
        if quantity == 0 {
            return Err(LineError::ZeroQuantity);
        }
        self.quantity = quantity;
        Ok(())
    }

    /// Replace the price snapshot with an authoritative one.
    ///
    /// # Errors
    ///
    /// Returns [`LineError::NegativePrice`] for a negative amount.
    pub fn set_unit_price(&mut self, unit_price: Price) -> Result<(), LineError> {
        if unit_price.is_negative() {
            return Err(LineError::NegativePrice);
        }
        self.unit_price = unit_price;
        Ok(())
    }

    pub const fn set_stock(&mut self, stock: u32) {
        self.stock = Some(stock);
    }

    pub fn set_line_id(&mut self, line_id: Option<LineId>) {
        self.line_id = line_id;
    }

    /// Replace the display name, ignoring blank values.
    pub fn set_product_name(&mut self, product_name: impl Into<String>) {
        let name = product_name.into();
        if !name.trim().is_empty() {
            self.product_name = name;
        }
    }

    /// Copy metadata keys this line doesn't already carry.
    pub(crate) fn absorb_metadata(&mut self, other: &BTreeMap<String, String>) {
        for (key, value) in other {
            self.metadata
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::price::CurrencyCode;

    fn price() -> Price {
        Price::from_minor(1000, CurrencyCode::USD)
    }

    #[test]
    fn test_new_valid() {
        let line = CartLine::new("v-1", "p-1", "Tee", price(), 3).unwrap();
        assert_eq!(line.variant_id().as_str(), "v-1");
        assert_eq!(line.quantity(), 3);
        assert_eq!(line.stock(), None);
        assert_eq!(line.line_id(), None);
        assert_eq!(line.line_total(), Price::from_minor(3000, CurrencyCode::USD));
    }

    #[test]
    fn test_new_rejects_invalid() {
        assert_eq!(
            CartLine::new("", "p-1", "Tee", price(), 1),
            Err(LineError::EmptyVariantId)
        );
        assert_eq!(
            CartLine::new("v-1", " ", "Tee", price(), 1),
            Err(LineError::EmptyProductId)
        );
        assert_eq!(
            CartLine::new("v-1", "p-1", "", price(), 1),
            Err(LineError::EmptyProductName)
        );
        assert_eq!(
            CartLine::new("v-1", "p-1", "Tee", price(), 0),
            Err(LineError::ZeroQuantity)
        );
        assert_eq!(
            CartLine::new("v-1", "p-1", "Tee", Price::from_minor(-5, CurrencyCode::USD), 1),
            Err(LineError::NegativePrice)
        );
    }

    #[test]
    fn test_set_quantity_rejects_zero() {
        let mut line = CartLine::new("v-1", "p-1", "Tee", price(), 2).unwrap();
        assert_eq!(line.set_quantity(0), Err(LineError::ZeroQuantity));
        assert_eq!(line.quantity(), 2);
    }

    #[test]
    fn test_deserialize_validates() {
        let json = r#"{
            "variant_id": "v-1",
            "product_id": "p-1",
            "product_name": "Tee",
            "unit_price": {"amount": "10.00", "currency_code": "USD"},
            "quantity": 0
        }"#;
        assert!(serde_json::from_str::<CartLine>(json).is_err());
    }

    #[test]
    fn test_serde_roundtrip_keeps_metadata() {
        let line = CartLine::new("v-1", "p-1", "Tee", price(), 1)
            .unwrap()
            .with_stock(4)
            .with_line_id("l-9")
            .with_metadata("engraving", "NP");
        let json = serde_json::to_string(&line).unwrap();
        let parsed: CartLine = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, line);
    }
}
