//! Core types for the cart engine.
//!
//! This module provides type-safe wrappers for cart domain concepts.

pub mod cart;
pub mod id;
pub mod identity;
pub mod line;
pub mod price;

pub use cart::{Cart, QuantityChange};
pub use id::*;
pub use identity::IdentityContext;
pub use line::{CartLine, LineError};
pub use price::{CurrencyCode, Price};
