//! Naked Pineapple cart synchronization engine.
//!
//! Keeps one in-memory [`Cart`](naked_pineapple_core::Cart) consistent with
//! whichever store owns it:
//!
//! - guests: a session-scoped local snapshot ([`persistence::LocalStore`])
//! - signed-in customers: the remote cart service
//!   ([`persistence::RemoteCartService`])
//!
//! # Architecture
//!
//! - [`CartContext`] owns the cart; every write goes through it
//! - [`pipeline`] applies mutations optimistically, then commits or rolls back
//! - [`identity`] merges the guest cart at login and clears on logout
//! - [`enrichment`] re-prices and re-stocks every line before checkout
//!
//! # Example
//!
//! ```rust,ignore
//! use naked_pineapple_cart::{CartConfig, CartContext};
//! use naked_pineapple_core::IdentityContext;
//!
//! let config = CartConfig::from_env()?;
//! let cart = CartContext::from_config(&config, "session-abc")?;
//! cart.load(IdentityContext::Guest).await?;
//!
//! cart.add_item(line).await?;
//! cart.transition(IdentityContext::authenticated("customer-42")).await?;
//!
//! let review = cart.prepare_checkout().await?;
//! let lines = review.proceed(user_accepted_diff)?;
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod checkout;
pub mod config;
pub mod context;
pub mod enrichment;
pub mod error;
pub mod identity;
pub mod persistence;
pub mod pipeline;

pub use checkout::CheckoutReview;
pub use config::{CartConfig, ConfigError};
pub use context::CartContext;
pub use enrichment::{Enrichment, EnrichmentService, LineNotice, NoticeKind, Verification};
pub use error::CartError;
pub use identity::TransitionOutcome;
pub use pipeline::{MutationState, PendingMutation};
