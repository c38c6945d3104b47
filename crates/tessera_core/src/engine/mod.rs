//! Engine helpers shared by the event listeners and actions.

pub(crate) mod collections;
pub(crate) mod foreign_keys;
pub(crate) mod hydrate;
pub(crate) mod nullability;
pub mod transient;

pub use foreign_keys::TransientDependency;
pub use transient::{TransientPolicy, UnsavedValuePolicy};
