//! # pitboss-contracts
//!
//! Shared types, wire messages, and error kinds for the pitboss function
//! dispatch control plane.
//!
//! Every crate in the workspace imports from here. No business logic lives
//! in this crate, only data definitions, small helpers, and error types.

pub mod approval;
pub mod audit;
pub mod codec;
pub mod descriptor;
pub mod error;
pub mod session;
pub mod tenant;
pub mod verify;
pub mod wire;
