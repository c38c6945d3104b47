//! # Tessera Core
//!
//! Unit-of-work and persistence-context engine for the Tessera ORM.
//!
//! A [`Session`] tracks object instances against the rows they mirror. It
//! keeps an identity map (at most one instance per entity key), records the
//! state each instance was loaded with, dispatches the lifecycle operations
//! (save, persist, merge, delete, refresh, lock, evict, load) through
//! pluggable listeners, and on flush turns the differences it finds into an
//! ordered queue of insert, update, delete and collection actions that run
//! against [`EntityPersister`] and [`CollectionPersister`] implementations.
//!
//! ## Design Principles
//!
//! - The storage layer is behind persister traits; this crate never emits SQL
//! - A session is single-threaded; factories, persisters and cache regions
//!   are `Send + Sync`
//! - Every failure is a [`CoreError`]; nothing panics on bad input
//! - Writes are deferred until flush, except identity inserts
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_core::{EntityRef, SessionFactory, Value};
//!
//! let factory = SessionFactory::builder()
//!     .entity_persister(customers)
//!     .build()?;
//! let mut session = factory.open_session();
//! let ann = EntityRef::new("Customer", vec![Value::from("ann")]);
//! let id = session.save(&ann)?;
//! session.flush()?;
//! assert!(session.contains(&ann));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod action;
pub mod cache;
pub mod cascade;
pub mod collection;
pub mod config;
pub mod context;
pub mod engine;
pub mod entity;
pub mod error;
pub mod event;
pub mod interceptor;
pub mod lock;
pub mod metadata;
pub mod persister;
pub mod session;
pub mod stats;
pub mod types;
pub mod value;
pub mod versioning;

#[cfg(test)]
mod test_support;

pub use action::{ActionQueue, UnresolvedInserts};
pub use cache::{CacheAccessStrategy, CacheEntry, CacheKey, SoftLock};
pub use cascade::{CascadeStyle, CascadingAction};
pub use collection::{CollectionEntry, CollectionRef};
pub use config::{CacheMode, FlushMode, Settings};
pub use context::PersistenceContext;
pub use engine::{TransientDependency, TransientPolicy, UnsavedValuePolicy};
pub use entity::{EntityEntry, EntityHandle, EntityRef, ProxyRef, Status};
pub use error::{CoreError, CoreResult};
pub use event::{EventListeners, FlushReport};
pub use interceptor::{Interceptor, NoopInterceptor};
pub use lock::{LockMode, LockOptions, LockTimeout};
pub use metadata::{EntityMetamodel, IdStrategy, PropertyMetadata, PropertyType, VersionMetadata};
pub use persister::{CollectionMetadata, CollectionPersister, ElementType, EntityPersister};
pub use session::{CancellationHandle, Session, SessionFactory, SessionFactoryBuilder};
pub use stats::{Statistics, StatsSnapshot};
pub use types::{CollectionKey, EntityKey, EntityMode, Identifier, InstanceId, SessionId, Version};
pub use value::{Row, Snapshot, StoredValue, Value};
pub use versioning::VersionType;
