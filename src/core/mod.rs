//! Domain types shared across the crate: configuration, errors, the outbound
//! data model, and the flexible-arity option wrappers borrowed from the
//! path-dependency crate this workspace used to vendor.

pub mod config;
pub mod error;
pub mod model;
pub mod option;

pub use error::{ProviderError, Result};
