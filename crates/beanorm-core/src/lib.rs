//! Core types and contracts for beanorm.
//!
//! - [`Value`], [`Row`] and [`EntityId`] for data
//! - [`EntityDescriptor`] and [`DescriptorRegistry`] for entity metadata
//! - [`ManagedBean`] / [`BeanRef`] for tracked entity instances
//! - [`Store`] / [`StoreTransaction`] for statement execution
//! - [`ScalarTypeRegistry`], [`ChangeListener`] and [`ServerConfig`] for the
//!   remaining collaborators
//!
//! `Outcome` and `Cx` are re-exported from asupersync; every operation that
//! can reach the store is cancel-aware.
//!
//! # Design
//!
//! - **Metadata, not macros**: entities are described at runtime by
//!   [`EntityDescriptor`] tables; the registry validates association targets
//!   when it is built.
//! - **Dynamic beans**: a [`ManagedBean`] is a value buffer in descriptor
//!   order plus load state, old values and a dirty set.
//! - **Object-safe store**: [`Store`] returns boxed futures so a server can
//!   hold `Arc<dyn Store>`.
//! - **One error type**: [`Error`] covers metadata, store, concurrency and
//!   configuration failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use beanorm_core::{DescriptorRegistry, EntityDescriptor, PropertyDescriptor, SqlType};
//!
//! let registry = DescriptorRegistry::builder()
//!     .register(
//!         EntityDescriptor::builder("customer", "customers")
//!             .property(PropertyDescriptor::id("id", SqlType::BigInt))
//!             .property(PropertyDescriptor::scalar("email", SqlType::Text))
//!             .natural_key("email"),
//!     )
//!     .build()?;
//! let customer = registry.get("customer")?;
//! assert_eq!(customer.natural_key_property().unwrap().name, "email");
//! ```

pub use asupersync::{Cx, Outcome};

pub mod bean;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod id;
pub mod identifiers;
pub mod listener;
pub mod outcome;
pub mod row;
pub mod store;
pub mod types;
pub mod value;

pub use bean::{
    BeanLifecycle, BeanRef, BeanSnapshot, ConcurrencyToken, LoadState, ManagedBean, WeakBeanRef,
};
pub use config::{CachePolicy, ConcurrencyMode, ServerConfig, UpdatePolicy};
pub use descriptor::{
    Cascade, DescriptorRegistry, EntityDescriptor, EntityDescriptorBuilder, GeneratedValue,
    PropertyDescriptor, PropertyKind, RegistryBuilder,
};
pub use error::{
    BatchIntegrityError, ConfigError, ConnectionError, ConnectionErrorKind, Error, MetadataError,
    OptimisticLockError, PropagationError, PropagationErrorKind, QueryError, QueryErrorKind,
    Result, TransactionError, TransactionErrorKind, TypeError,
};
pub use id::{EntityId, EntityKey};
pub use identifiers::{quote_ident, unquote_ident};
pub use listener::{ChangeEvent, ChangeListener, ChangeOp};
pub use row::{ColumnInfo, Row};
pub use store::{Statement, Store, StoreFuture, StoreTransaction};
pub use types::{ScalarTypeRegistry, SqlType, StandardTypes};
pub use value::Value;
