//! Policy configuration schema and matchers.
//!
//! A `PolicyConfig` is deserialized from TOML. It carries both RBAC layers
//! plus the tenant directory:
//!
//! - `grants`: the permissive layer, `subject -> [permission pattern]`
//! - `http_rules`: the path-and-method layer consulted by the HTTP middleware
//! - `roles`: the role hierarchy (`inherits`)
//! - `users` and `games`: tenant scopes and the game name directory
//!
//! Example:
//! ```toml
//! admin_roles = ["admin"]
//!
//! [[roles]]
//! name = "tech_lead"
//! inherits = ["developer", "producer"]
//!
//! [grants]
//! "role:gm" = ["player.*", "jobs:*"]
//! "alice" = ["game:g1:economy.grant"]
//!
//! [[http_rules]]
//! id = "gm-dispatch"
//! subject = "role:gm"
//! path = "/api/invoke"
//! method = "POST"
//!
//! [[users]]
//! name = "alice"
//! roles = ["gm"]
//! [users.scopes]
//! g1 = ["dev", "staging"]
//!
//! [[games]]
//! id = "g1"
//! name = "Galaxy Raiders"
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The top-level structure deserialized from a TOML policy file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Roles that bypass every permission and scope check.
    #[serde(default = "default_admin_roles")]
    pub admin_roles: Vec<String>,

    #[serde(default)]
    pub roles: Vec<RoleDef>,

    /// Subject (`user` or `role:<name>`) to permission patterns.
    #[serde(default)]
    pub grants: HashMap<String, Vec<String>>,

    /// An empty list disables the HTTP layer.
    #[serde(default)]
    pub http_rules: Vec<HttpRule>,

    #[serde(default)]
    pub users: Vec<UserEntry>,

    #[serde(default)]
    pub games: Vec<GameEntry>,
}

fn default_admin_roles() -> Vec<String> {
    vec!["admin".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleDef {
    pub name: String,
    #[serde(default)]
    pub inherits: Vec<String>,
}

/// One allow rule of the HTTP layer. Any matching rule allows the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRule {
    pub id: String,

    /// `role:<name>`, `user:<name>`, a bare user name, or `*`.
    pub subject: String,

    /// Key pattern: a trailing `*` matches any suffix, `:param` segments
    /// match any one non-empty segment.
    pub path: String,

    /// HTTP method, or `*`.
    #[serde(default = "any_method")]
    pub method: String,
}

fn any_method() -> String {
    "*".to_string()
}

impl HttpRule {
    pub fn matches_request(&self, method: &str, path: &str) -> bool {
        (self.method == "*" || self.method.eq_ignore_ascii_case(method)) && key_match(path, &self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,

    /// Roles added to whatever the credential carries.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Game id or name to permitted envs. An empty env list permits every
    /// env of that game; the key `*` permits every game.
    #[serde(default)]
    pub scopes: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Match a permission code against a grant pattern: `*` matches anything,
/// a trailing `*` matches by prefix, anything else must be equal.
pub fn permission_matches(pattern: &str, permission: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => permission.starts_with(prefix),
        None => pattern == permission,
    }
}

/// Match a request path against a key pattern.
///
/// `/api/*` matches everything below `/api/`; `/api/jobs/:handle` matches
/// `/api/jobs/a1:j42` but not `/api/jobs/a1/extra`.
pub fn key_match(path: &str, pattern: &str) -> bool {
    let (pattern, open) = match pattern.strip_suffix('*') {
        Some(prefix) => (prefix, true),
        None => (pattern, false),
    };
    let pat: Vec<&str> = pattern.split('/').collect();
    let segs: Vec<&str> = path.split('/').collect();

    if !open {
        return pat.len() == segs.len() && pat.iter().zip(&segs).all(|(p, s)| segment_matches(p, s));
    }

    let Some((last, head)) = pat.split_last() else {
        return true;
    };
    segs.len() > head.len()
        && head.iter().zip(&segs).all(|(p, s)| segment_matches(p, s))
        && segs[head.len()].starts_with(last)
}

fn segment_matches(pattern: &str, segment: &str) -> bool {
    if pattern.starts_with(':') {
        !segment.is_empty()
    } else {
        pattern == segment
    }
}
