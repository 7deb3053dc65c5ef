//! # pitboss-verify
//!
//! Payload verification for the pitboss dispatcher.
//!
//! This crate provides [`engine::JsonSchemaVerifier`], which implements the
//! [`pitboss_core::traits::PayloadVerifier`] trait. It validates JSON call
//! payloads against the `params` schema of the function's descriptor and
//! reports each failure with a dotted field path (`$` for the root).
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use pitboss_verify::JsonSchemaVerifier;
//!
//! let verifier = Arc::new(JsonSchemaVerifier::new());
//! let report = verifier.verify(&descriptor, br#"{"player_id":"u-1"}"#)?;
//! assert!(report.passed);
//! ```

pub mod engine;

pub use engine::{dotted_path, JsonSchemaVerifier};
