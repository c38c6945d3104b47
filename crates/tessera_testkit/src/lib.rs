//! # Tessera Testkit
//!
//! Test utilities for Tessera.
//!
//! This crate provides:
//! - An in-memory store with operation logging and failure injection
//! - Entity and collection persisters over that store
//! - A soft-locking second-level cache region
//! - A recording interceptor
//! - The shop schema fixture
//! - Property-based generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessera_testkit::prelude::*;
//!
//! #[test]
//! fn saves_an_order() {
//!     let shop = Shop::new();
//!     let mut session = shop.session();
//!     let order = new_order("NEW", None);
//!     session.save(&order).unwrap();
//!     session.flush().unwrap();
//!     assert_eq!(shop.store.row_count(order::NAME), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod fixtures;
pub mod generators;
pub mod interceptor;
pub mod logging;
pub mod persister;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::interceptor::*;
    pub use crate::logging::*;
    pub use crate::persister::*;
    pub use crate::store::*;
}

pub use cache::*;
pub use fixtures::*;
pub use generators::*;
pub use interceptor::*;
pub use logging::*;
pub use persister::*;
pub use store::*;
