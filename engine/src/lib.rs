//! # Converge Engine
//!
//! Reconciles declared configuration against a remote management API.
//!
//! Given the last observed remote state and a newly declared desired state,
//! the engine works out which creates, updates and deletes are needed, sends
//! them in size-bounded batches, and returns an observed state that matches
//! whatever actually happened remotely, even when the pass fails halfway.
//!
//! ## Design Principles
//!
//! - **No state drift**: every confirmed remote effect is recorded at once
//! - **Transport agnostic**: all IO goes through the [`Transport`] trait
//! - **Capability aware**: bulk requests only where the server supports them
//! - **Sequential passes**: later batches depend on ids from earlier ones
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] holds typed fields as [`Slot`]s, which distinguish a value
//! the user never set from one the server has not reported yet. Observed
//! records additionally carry a confirmed remote id. A [`Shape`] tells the
//! differ how to compare each field.
//!
//! ### Collections
//!
//! Two collection kinds are reconciled:
//! - [`KeyedReconciler`] - independent records keyed by a local name
//! - [`OrderedReconciler`] - an access policy's categories and positional
//!   rules, which the server can only append to or delete from
//!
//! ### Partial failure
//!
//! Every pass returns a [`PassOutcome`] whose observed state must be
//! persisted unconditionally. A failed pass is simply rerun.
//!
//! ## Quick Start
//!
//! ```rust
//! use converge_engine::{plan_keyed, FieldDef, KeyedState, Record, Shape};
//!
//! let shape = Shape::new(vec![FieldDef::plain("value")]);
//!
//! let mut observed = KeyedState::new();
//! observed.insert("A".into(), Record::new().with_field("value", "v1").with_remote_id("1"));
//! observed.insert("C".into(), Record::new().with_field("value", "v3").with_remote_id("3"));
//!
//! let mut desired = KeyedState::new();
//! desired.insert("A".into(), Record::new().with_field("value", "v1").with_remote_id("1"));
//! desired.insert("B".into(), Record::new().with_field("value", "v2"));
//!
//! let plan = plan_keyed(&shape, &desired, &observed);
//! assert_eq!(plan.to_delete.len(), 1);
//! assert_eq!(plan.to_create.len(), 1);
//! assert!(plan.to_update.is_empty());
//! ```
//!
//! ## Persistence
//!
//! [`StateSnapshot`] bundles the observed state of every collection and
//! serializes to JSON with deterministic ordering.

pub mod batch;
pub mod capability;
pub mod error;
pub mod keyed;
pub mod ordered;
pub mod policy;
pub mod record;
pub mod shape;
pub mod slot;
pub mod snapshot;
pub mod tracker;
pub mod transport;

// Re-export main types at crate root
pub use batch::{partition_filter, partition_payloads, FilterBatch, Limits, PayloadBatch};
pub use capability::{select_strategy, BulkSupport, Strategy, Version};
pub use error::Error;
pub use keyed::{
    plan_keyed, prime_keyed_ids, refresh_keyed, KeyedPlan, KeyedReconciler, KeyedState,
    KeyedTarget, KeyedUpdate,
};
pub use ordered::{kept_prefix, KeptPrefix, KeptPrefixMode, OrderedReconciler, Phase, PolicyTarget};
pub use policy::{Category, GroupKey, PolicyRules, Rule};
pub use record::{Fields, Record};
pub use shape::{FieldDef, FieldKind, Shape};
pub use slot::Slot;
pub use snapshot::{SnapshotSummary, StateSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use tracker::{KeyedTracker, OrderedTracker, PassOutcome, PassReport};
pub use transport::{
    find_first, item_path, list_all, response_items, ApiError, Endpoint, Page, Query, Transport,
};

/// Identifier assigned by the server at creation time
pub type RemoteId = String;
