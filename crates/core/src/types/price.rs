//! Type-safe price representation using decimal arithmetic.

use core::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A price with currency information.
///
/// Line prices are snapshots: the engine never trusts a client-held price for
/// anything the server prices authoritatively (merge, checkout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    /// Amount in the currency's standard unit (e.g., dollars, not cents).
    pub amount: Decimal,
    /// ISO 4217 currency code.
    pub currency_code: CurrencyCode,
}

impl Price {
    /// Create a new price.
    #[must_use]
    pub const fn new(amount: Decimal, currency_code: CurrencyCode) -> Self {
        Self {
            amount,
            currency_code,
        }
    }

    /// A zero amount in the given currency.
    #[must_use]
    pub const fn zero(currency_code: CurrencyCode) -> Self {
        Self::new(Decimal::ZERO, currency_code)
    }

    /// Create a price from an amount in minor units (e.g., cents).
    #[must_use]
    pub fn from_minor(minor: i64, currency_code: CurrencyCode) -> Self {
        Self::new(Decimal::new(minor, 2), currency_code)
    }

    /// Price of `quantity` units at this unit price.
    #[must_use]
    pub fn times(self, quantity: u32) -> Self {
        Self::new(self.amount * Decimal::from(quantity), self.currency_code)
    }

    /// Returns true if the amount is below zero.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:.2}",
            self.currency_code.symbol(),
            self.amount.round_dp(2)
        )
    }
}

/// ISO 4217 currency codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CurrencyCode {
    #[default]
    USD,
    EUR,
    GBP,
    CAD,
    AUD,
}

impl CurrencyCode {
    /// Display symbol for the currency.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::USD | Self::CAD | Self::AUD => "$",
            Self::EUR => "€",
            Self::GBP => "£",
        }
    }
}

impl std::str::FromStr for CurrencyCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(Self::USD),
            "EUR" => Ok(Self::EUR),
            "GBP" => Ok(Self::GBP),
            "CAD" => Ok(Self::CAD),
            "AUD" => Ok(Self::AUD),
            _ => Err(format!("unsupported currency code: {s}")),
        }
    }
}
