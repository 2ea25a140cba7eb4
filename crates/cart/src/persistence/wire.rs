//! JSON shapes exchanged with the cart and catalog services.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use naked_pineapple_core::{
    CartLine, CurrencyCode, LineError, LineId, Price, ProductId, VariantId,
};

/// A line as the remote cart service reports it.
///
/// Prices here are authoritative: the server prices lines from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteLine {
    /// Server-assigned line id.
    pub id: LineId,
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub product_name: String,
    /// Decimal amount (serialized as a string to preserve precision).
    pub unit_price: Decimal,
    #[serde(default)]
    pub currency_code: CurrencyCode,
    pub quantity: u32,
    #[serde(default)]
    pub stock: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl RemoteLine {
    /// The line's authoritative unit price.
    #[must_use]
    pub const fn price(&self) -> Price {
        Price::new(self.unit_price, self.currency_code)
    }

    /// Convert into a validated cart line.
    ///
    /// # Errors
    ///
    /// Returns an error if the server line violates a cart line constraint.
    pub fn into_cart_line(self) -> Result<CartLine, LineError> {
        let price = self.price();
        let mut line = CartLine::new(
            self.variant_id,
            self.product_id,
            self.product_name,
            price,
            self.quantity,
        )?
        .with_line_id(self.id);
        if let Some(stock) = self.stock {
            line = line.with_stock(stock);
        }
        for (key, value) in self.metadata {
            line = line.with_metadata(key, value);
        }
        Ok(line)
    }
}

/// Body of `POST cart` and one entry of `POST cart/sync`.
///
/// Never carries a price: the server prices new lines from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineInput {
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl LineInput {
    /// Full input for adding `quantity` units of a line's variant.
    #[must_use]
    pub fn for_add(line: &CartLine, quantity: u32) -> Self {
        Self {
            product_id: line.product_id().clone(),
            variant_id: line.variant_id().clone(),
            quantity,
            metadata: (!line.metadata().is_empty()).then(|| line.metadata().clone()),
        }
    }

    /// Merge projection: `{productId, variantId, quantity}` only.
    #[must_use]
    pub fn projection(line: &CartLine) -> Self {
        Self {
            product_id: line.product_id().clone(),
            variant_id: line.variant_id().clone(),
            quantity: line.quantity(),
            metadata: None,
        }
    }
}

/// Body of `PATCH cart/{lineId}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuantityPatch {
    pub quantity: u32,
}

/// Body of `POST cart/sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub lines: Vec<LineInput>,
}

/// Body of `POST catalog/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogBatchRequest {
    pub variant_ids: Vec<VariantId>,
}

/// Current catalog state of one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub variant_id: VariantId,
    /// Decimal amount (serialized as a string to preserve precision).
    pub price: Decimal,
    #[serde(default)]
    pub currency_code: CurrencyCode,
    pub stock: u32,
}

impl CatalogEntry {
    /// The variant's live price.
    #[must_use]
    pub const fn current_price(&self) -> Price {
        Price::new(self.price, self.currency_code)
    }
}
