//! # pitboss-policy
//!
//! A TOML-driven, two-layer RBAC policy and tenant scope directory for the
//! pitboss Server.
//!
//! ## Overview
//!
//! This crate provides [`TomlRbacPolicy`], which implements both
//! [`PermissionPolicy`](pitboss_core::traits::PermissionPolicy) and
//! [`ScopeResolver`](pitboss_core::traits::ScopeResolver). One document
//! declares the role hierarchy, permission grants, HTTP rules, per-user
//! tenant scopes, and the game directory.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::path::Path;
//! use pitboss_policy::TomlRbacPolicy;
//!
//! let policy = TomlRbacPolicy::from_file(Path::new("policies/studio.toml"))?;
//! // Pass `Arc::new(policy)` to the dispatcher as both policy and scopes.
//! ```
//!
//! ## Layers
//!
//! The HTTP layer allows a request when any `http_rules` entry matches the
//! caller, method and path. The permission layer allows an operation when a
//! grant pattern matches its permission code. Both must pass; admin roles
//! bypass both.

pub mod engine;
pub mod rule;

pub use engine::{TomlRbacPolicy, DEFAULT_POLICY};
pub use rule::{key_match, permission_matches, GameEntry, HttpRule, PolicyConfig, RoleDef, UserEntry};

// ── Tests ─────────────────────────────────────────────────────────────────────
