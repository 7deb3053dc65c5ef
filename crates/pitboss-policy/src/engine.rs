//! TOML-driven RBAC implementation.
//!
//! `TomlRbacPolicy` loads a `PolicyConfig` from a TOML string or file and
//! implements `PermissionPolicy` and `ScopeResolver` from pitboss-core.
//!
//! Evaluation algorithm for `is_allowed`:
//!
//! 1. Expand the caller's roles (credential roles plus the user entry's
//!    roles) through the `inherits` hierarchy.
//! 2. Any admin role short-circuits to allow.
//! 3. Collect the patterns granted to the user name and to every
//!    `role:<name>` subject.
//! 4. Allow when a pattern matches the permission, or, for calls scoped to a
//!    game, the per-game form `game:<gid>:<permission>`.
//! 5. Otherwise deny.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::{debug, warn};

use pitboss_contracts::{
    error::{PitbossError, PitbossResult},
    tenant::{Caller, TenantScope},
};
use pitboss_core::traits::{PermissionPolicy, ScopeResolver};

use crate::rule::{permission_matches, PolicyConfig, UserEntry};

/// The policy shipped with the crate.
pub const DEFAULT_POLICY: &str = include_str!("../policies/default.toml");

/// Both RBAC layers and the tenant directory, built from one TOML document.
///
/// ```rust,ignore
/// use pitboss_policy::TomlRbacPolicy;
///
/// let policy = TomlRbacPolicy::from_file(Path::new("policies/studio.toml"))?;
/// ```
#[derive(Debug)]
pub struct TomlRbacPolicy {
    config: PolicyConfig,
    inherits: HashMap<String, Vec<String>>,
    users: HashMap<String, UserEntry>,
}

impl TomlRbacPolicy {
    /// Parse `s` as TOML and build a `TomlRbacPolicy`.
    pub fn from_toml_str(s: &str) -> PitbossResult<Self> {
        let config: PolicyConfig =
            toml::from_str(s).map_err(|e| PitbossError::config(format!("failed to parse policy TOML: {e}")))?;
        Self::from_config(config)
    }

    /// Read the file at `path` and parse it as a policy document.
    pub fn from_file(path: &Path) -> PitbossResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PitbossError::config(format!("failed to read policy file '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// The bundled default policy.
    pub fn bundled() -> PitbossResult<Self> {
        Self::from_toml_str(DEFAULT_POLICY)
    }

    pub fn from_config(config: PolicyConfig) -> PitbossResult<Self> {
        let mut inherits = HashMap::new();
        for role in &config.roles {
            if role.name.is_empty() {
                return Err(PitbossError::config("role definition without a name"));
            }
            inherits.insert(role.name.clone(), role.inherits.clone());
        }
        for rule in &config.http_rules {
            if !rule.path.starts_with('/') && rule.path != "*" {
                return Err(PitbossError::config(format!(
                    "http rule '{}' path must start with '/'",
                    rule.id
                )));
            }
        }
        let users = config.users.iter().map(|u| (u.name.clone(), u.clone())).collect();
        debug!(
            roles = config.roles.len(),
            grants = config.grants.len(),
            http_rules = config.http_rules.len(),
            users = config.users.len(),
            games = config.games.len(),
            "policy loaded"
        );
        Ok(Self { config, inherits, users })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Credential roles plus directory roles, closed over inheritance.
    pub fn effective_roles(&self, caller: &Caller) -> HashSet<String> {
        let mut pending: Vec<String> = caller.roles.clone();
        if let Some(user) = self.users.get(&caller.user) {
            pending.extend(user.roles.iter().cloned());
        }
        let mut out = HashSet::new();
        while let Some(role) = pending.pop() {
            if out.insert(role.clone()) {
                if let Some(parents) = self.inherits.get(&role) {
                    pending.extend(parents.iter().cloned());
                }
            }
        }
        out
    }

    pub fn is_admin(&self, caller: &Caller) -> bool {
        let roles = self.effective_roles(caller);
        self.config.admin_roles.iter().any(|r| roles.contains(r))
    }

    pub(crate) fn user_entry(&self, user: &str) -> Option<&UserEntry> {
        self.users.get(user)
    }

    fn subject_matches(subject: &str, caller: &Caller, roles: &HashSet<String>) -> bool {
        if subject == "*" {
            return true;
        }
        if let Some(role) = subject.strip_prefix("role:") {
            return roles.contains(role);
        }
        subject.strip_prefix("user:").unwrap_or(subject) == caller.user
    }
}

impl PermissionPolicy for TomlRbacPolicy {
    fn is_allowed(&self, caller: &Caller, permission: &str, game_id: Option<&str>) -> bool {
        let roles = self.effective_roles(caller);
        if self.config.admin_roles.iter().any(|r| roles.contains(r)) {
            return true;
        }

        let per_game = game_id.filter(|g| !g.is_empty()).map(|g| format!("game:{g}:{permission}"));
        let allowed = self
            .config
            .grants
            .iter()
            .filter(|(subject, _)| Self::subject_matches(subject, caller, &roles))
            .flat_map(|(_, patterns)| patterns.iter())
            .any(|pattern| {
                permission_matches(pattern, permission)
                    || per_game.as_deref().map_or(false, |p| permission_matches(pattern, p))
            });

        if !allowed {
            debug!(user = %caller.user, permission, game_id = ?game_id, "no grant matched");
        }
        allowed
    }

    fn is_route_allowed(&self, caller: &Caller, method: &str, path: &str) -> bool {
        if self.config.http_rules.is_empty() {
            return true;
        }
        let roles = self.effective_roles(caller);
        if self.config.admin_roles.iter().any(|r| roles.contains(r)) {
            return true;
        }

        match self
            .config
            .http_rules
            .iter()
            .find(|rule| Self::subject_matches(&rule.subject, caller, &roles) && rule.matches_request(method, path))
        {
            Some(rule) => {
                debug!(user = %caller.user, rule_id = %rule.id, method, path, "http rule matched");
                true
            }
            None => {
                warn!(user = %caller.user, method, path, "no http rule matched; denying");
                false
            }
        }
    }
}

impl ScopeResolver for TomlRbacPolicy {
    fn scope_for(&self, caller: &Caller) -> TenantScope {
        if self.is_admin(caller) {
            return TenantScope::unrestricted();
        }
        let mut scope = TenantScope::default();
        let Some(user) = self.user_entry(&caller.user) else {
            return scope;
        };
        for (game, envs) in &user.scopes {
            if game == "*" {
                return TenantScope::unrestricted();
            }
            let game_id = self.resolve_game(game).unwrap_or_else(|| game.clone());
            scope.grant_game(game_id.clone());
            for env in envs {
                scope.grant_env(game_id.clone(), env.clone());
            }
        }
        scope
    }

    /// Ids match exactly; display names match case-insensitively.
    fn resolve_game(&self, id_or_name: &str) -> Option<String> {
        let games = &self.config.games;
        games
            .iter()
            .find(|g| g.id == id_or_name)
            .or_else(|| games.iter().find(|g| !g.name.is_empty() && g.name.eq_ignore_ascii_case(id_or_name)))
            .map(|g| g.id.clone())
    }
}
