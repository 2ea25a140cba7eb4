//! Newtype IDs for type-safe entity references.
//!
//! Use the `define_id!` macro to create type-safe ID wrappers that prevent
//! accidentally passing a product ID where a variant ID is expected. IDs are
//! opaque strings because they are assigned by the remote cart and catalog
//! services (e.g. `gid://shop/ProductVariant/42`).

/// Macro to define a type-safe string ID wrapper.
///
/// Creates a newtype wrapper around `String` with:
/// - `Serialize`/`Deserialize` with `#[serde(transparent)]`
/// - `Debug`, `Clone`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`
/// - Conversion methods: `new()`, `as_str()`, `into_inner()`
/// - `From<String>`, `From<&str>` and `Display` implementations
///
/// # Example
///
/// ```rust
/// # use naked_pineapple_core::define_id;
/// define_id!(OrderId);
/// define_id!(ShipmentId);
///
/// let order = OrderId::new("o-1");
/// let shipment = ShipmentId::new("o-1");
///
/// // These are different types, so this won't compile:
/// // let _: OrderId = shipment;
/// assert_eq!(order.as_str(), shipment.as_str());
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            ::serde::Serialize,
            ::serde::Deserialize
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new ID from any string-like value.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the underlying string value.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the ID and return the underlying string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }

            /// Returns true if the ID is empty or whitespace only.
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Cart entity IDs
define_id!(UserId);
define_id!(ProductId);
define_id!(VariantId);
define_id!(LineId);
