//! Naked Pineapple Core - Shared cart types.
//!
//! This crate provides the cart data model used across all components:
//! - `cart` - The cart synchronization engine (guest/authenticated stores)
//! - `cli` - Command-line driver for the engine
//!
//! # Architecture
//!
//! The core crate contains only types and invariants - no I/O, no HTTP
//! clients, no async. Every cart rule that can be checked without talking to
//! a backend (merge-by-sum, delete-at-zero, totals) lives here.
//!
//! # Modules
//!
//! - [`types`] - Type-safe IDs, prices, cart lines, the cart aggregate and
//!   identity context

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
