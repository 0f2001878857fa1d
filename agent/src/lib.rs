//! # Converge Agent
//!
//! Applies a declared manifest to a management API using the converge
//! engine. The agent owns all IO: the HTTP transport, capability discovery,
//! the state file, and assignment lists that several passes may share.
//!
//! A pass never loses track of remote state. The observed state it returns
//! through [`StateFile`] is written back even when the pass fails, and a
//! failed pass is simply run again.

pub mod assignment;
pub mod client;
pub mod config;
pub mod error;
pub mod manifest;
pub mod pass;
pub mod retry;
pub mod state;

pub use assignment::{assign, unassign, AssignmentLocks, AssignmentSpec};
pub use client::{HttpTransport, TENANT_HEADER};
pub use config::{Config, ConfigError};
pub use error::{AgentError, Result};
pub use manifest::{CategoryManifest, CollectionManifest, Manifest, PolicyManifest, RuleManifest};
pub use pass::{Pass, PassSettings, PassSummary};
pub use retry::{FixedBackoff, RETRIABLE_STATUS_CODES};
pub use state::StateFile;
