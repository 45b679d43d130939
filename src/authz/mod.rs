//! Repository read-permission resolution.
//!
//! [`provider::PermissionProvider`] answers for one code host, layering the
//! [`cache`] records in front of a [`crate::forge::CodeHostClient`].
//! [`registry::ProviderRegistry`] fans a request out over every configured
//! code host.

pub mod cache;
pub mod provider;
pub mod registry;
pub mod types;

pub use provider::PermissionProvider;
pub use registry::{AuthnRegistry, ProviderRegistry};
