//! The cart aggregate.
//!
//! A [`Cart`] is an ordered set of [`CartLine`]s keyed by variant. All the
//! local invariants live here so that every mutation path (optimistic update,
//! rollback, merge result, reconciliation) shares them:
//!
//! - at most one line per `variant_id`; adding an existing variant sums
//! - no line ever holds quantity zero; setting zero deletes the line
//! - line order is insertion order, and rollbacks restore the original slot
//! - every line is priced in the same currency

use serde::{Deserialize, Serialize};

use super::id::VariantId;
use super::line::{CartLine, LineError};
use super::price::{CurrencyCode, Price};

/// Result of [`Cart::set_quantity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuantityChange {
    /// The line now holds `to` units.
    Updated {
        /// Quantity before the change.
        from: u32,
        /// Quantity after the change.
        to: u32,
    },
    /// The requested quantity was `<= 0`, so the line was deleted.
    Removed {
        /// Position the line occupied.
        index: usize,
        /// The deleted line.
        line: CartLine,
    },
    /// No line for that variant.
    Missing,
}

/// An ordered collection of cart lines, unique by variant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<CartLine>", into = "Vec<CartLine>")]
pub struct Cart {
    lines: Vec<CartLine>,
}

impl TryFrom<Vec<CartLine>> for Cart {
    type Error = LineError;

    fn try_from(lines: Vec<CartLine>) -> Result<Self, Self::Error> {
        Self::from_lines(lines)
    }
}

impl From<Cart> for Vec<CartLine> {
    fn from(cart: Cart) -> Self {
        cart.lines
    }
}

impl Cart {
    /// An empty cart.
    #[must_use]
    pub const fn new() -> Self {
        Self { lines: Vec::new() }
    }

    /// Build a cart from lines, merging duplicate variants by sum.
    ///
    /// # Errors
    ///
    /// Returns [`LineError::QuantityOverflow`] if merged quantities overflow,
    /// or [`LineError::CurrencyMismatch`] if the lines mix currencies.
    pub fn from_lines(lines: impl IntoIterator<Item = CartLine>) -> Result<Self, LineError> {
        let mut cart = Self::new();
        for line in lines {
            cart.add(line)?;
        }
        Ok(cart)
    }

    #[must_use]
    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn iter(&self) -> impl Iterator<Item = &CartLine> {
        self.lines.iter()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Position of the line for `variant_id`.
    #[must_use]
    pub fn position(&self, variant_id: &VariantId) -> Option<usize> {
        self.lines.iter().position(|l| l.variant_id() == variant_id)
    }

    #[must_use]
    pub fn get(&self, variant_id: &VariantId) -> Option<&CartLine> {
        self.lines.iter().find(|l| l.variant_id() == variant_id)
    }

    pub fn get_mut(&mut self, variant_id: &VariantId) -> Option<&mut CartLine> {
        self.lines.iter_mut().find(|l| l.variant_id() == variant_id)
    }

    /// Add a line, summing into an existing line for the same variant.
    ///
    /// The existing line keeps its price snapshot and server id; only the
    /// quantity grows (and missing metadata keys are filled in).
    ///
    /// Returns the variant's quantity after the add.
    ///
    /// # Errors
    ///
    /// Returns [`LineError::QuantityOverflow`] if the sum does not fit, or
    /// [`LineError::CurrencyMismatch`] if the line is priced in a different
    /// currency than the cart.
    pub fn add(&mut self, line: CartLine) -> Result<u32, LineError> {
        if let Some(expected) = self.currency() {
            let found = line.unit_price().currency_code;
            if found != expected {
                return Err(LineError::CurrencyMismatch { expected, found });
            }
        }

        if let Some(existing) = self.get_mut(line.variant_id()) {
            let total = existing
                .quantity()
                .checked_add(line.quantity())
                .ok_or(LineError::QuantityOverflow { max: u32::MAX })?;
            existing.set_quantity(total)?;
            existing.absorb_metadata(line.metadata());
            return Ok(total);
        }

        let quantity = line.quantity();
        self.lines.push(line);
        Ok(quantity)
    }

    /// Remove the line for `variant_id`, returning its position and value.
    pub fn remove(&mut self, variant_id: &VariantId) -> Option<(usize, CartLine)> {
        let index = self.position(variant_id)?;
        Some((index, self.lines.remove(index)))
    }

    /// Set a line's quantity; `<= 0` deletes the line.
    ///
    /// # Errors
    ///
    /// Returns [`LineError::QuantityOverflow`] if `quantity` exceeds `u32::MAX`.
    pub fn set_quantity(
        &mut self,
        variant_id: &VariantId,
        quantity: i64,
    ) -> Result<QuantityChange, LineError> {
        if quantity <= 0 {
            return Ok(self
                .remove(variant_id)
                .map_or(QuantityChange::Missing, |(index, line)| {
                    QuantityChange::Removed { index, line }
                }));
        }

        let to = u32::try_from(quantity).map_err(|_| LineError::QuantityOverflow { max: u32::MAX })?;
        let Some(line) = self.get_mut(variant_id) else {
            return Ok(QuantityChange::Missing);
        };
        let from = line.quantity();
        line.set_quantity(to)?;
        Ok(QuantityChange::Updated { from, to })
    }

    /// Put a previously removed or modified line back.
    ///
    /// Replaces the current line for the same variant if there is one,
    /// otherwise inserts at `index` (clamped to the end of the cart).
    pub fn restore(&mut self, index: usize, line: CartLine) {
        if let Some(existing) = self.get_mut(line.variant_id()) {
            *existing = line;
            return;
        }
        let index = index.min(self.lines.len());
        self.lines.insert(index, line);
    }

    /// Replace every line with a canonical set (e.g. the server's merge result).
    ///
    /// # Errors
    ///
    /// Returns [`LineError::QuantityOverflow`] if merged quantities overflow;
    /// the cart is left untouched in that case.
    pub fn replace_lines(&mut self, lines: impl IntoIterator<Item = CartLine>) -> Result<(), LineError> {
        *self = Self::from_lines(lines)?;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Distinct variant ids, in line order.
    #[must_use]
    pub fn variant_ids(&self) -> Vec<VariantId> {
        self.lines.iter().map(|l| l.variant_id().clone()).collect()
    }

    /// Sum of quantities across all lines.
    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.lines.iter().map(|l| u64::from(l.quantity())).sum()
    }

    /// Currency every line is priced in; `None` for an empty cart.
    #[must_use]
    pub fn currency(&self) -> Option<CurrencyCode> {
        self.lines.first().map(|l| l.unit_price().currency_code)
    }

    /// Sum of `unit_price × quantity` in the cart's currency (the default
    /// currency for an empty cart).
    #[must_use]
    pub fn total_price(&self) -> Price {
        let currency = self.currency().unwrap_or_default();
        let amount = self.lines.iter().map(|l| l.line_total().amount).sum();
        Price::new(amount, currency)
    }
}

impl<'a> IntoIterator for &'a Cart {
    type Item = &'a CartLine;
    type IntoIter = std::slice::Iter<'a, CartLine>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines.iter()
    }
}
