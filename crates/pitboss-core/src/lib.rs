//! # pitboss-core
//!
//! The policy-bound dispatch pipeline of the pitboss Server.
//!
//! This crate provides:
//! - The seam traits (`PermissionPolicy`, `ScopeResolver`, `PayloadVerifier`,
//!   `AuditSink`, `ApprovalStore`, `AgentTransport`)
//! - The `Dispatcher` that wires them together in the correct trust order
//! - The descriptor `FunctionCatalog` and the `IdempotencyCache`
//! - Sensitive-field masking and canonical payload hashing
//! - `relay_frames`, the job stream relay shared by every hop
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pitboss_core::{Dispatcher, DispatcherParts, DispatchCall};
//! ```

pub mod catalog;
pub mod dispatcher;
pub mod idempotency;
pub mod masking;
pub mod relay;
pub mod traits;

pub use catalog::FunctionCatalog;
pub use dispatcher::{
    permissions, Completion, DispatchCall, DispatchOptions, Dispatched, Dispatcher, DispatcherParts,
    JobStarted,
};
pub use idempotency::IdempotencyCache;
pub use relay::relay_frames;
