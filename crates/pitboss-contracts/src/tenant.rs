//! Caller identity and tenant scope.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{ForbiddenReason, PitbossError, PitbossResult};

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Caller {
    pub fn new(user: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            user: user.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// The `(game, env)` tuples a caller may touch.
///
/// An empty scope grants nothing. A game mapped to an empty env set grants
/// every env of that game.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantScope {
    /// Admin and service identities skip scope checks entirely.
    #[serde(default)]
    pub unrestricted: bool,
    #[serde(default)]
    pub games: HashMap<String, HashSet<String>>,
}

impl TenantScope {
    pub fn unrestricted() -> Self {
        Self { unrestricted: true, games: HashMap::new() }
    }

    pub fn grant_game(&mut self, game_id: impl Into<String>) -> &mut Self {
        self.games.entry(game_id.into()).or_default();
        self
    }

    pub fn grant_env(&mut self, game_id: impl Into<String>, env: impl Into<String>) -> &mut Self {
        self.games.entry(game_id.into()).or_default().insert(env.into());
        self
    }

    pub fn permits_game(&self, game_id: &str) -> bool {
        self.unrestricted || self.games.contains_key(game_id)
    }

    pub fn permits_env(&self, game_id: &str, env: &str) -> bool {
        if self.unrestricted {
            return true;
        }
        match self.games.get(game_id) {
            Some(envs) => envs.is_empty() || envs.contains(env),
            None => false,
        }
    }

    /// The scope guard. An empty scope is refused outright. Otherwise the
    /// game is checked when given, and the env only together with a game,
    /// since env scopes are per game. A call without a game must be narrowed
    /// to permitted tenants by the caller of this check, see
    /// [`TenantScope::permits_env`].
    pub fn check(&self, game_id: Option<&str>, env: Option<&str>) -> PitbossResult<()> {
        if self.unrestricted {
            return Ok(());
        }
        if self.games.is_empty() {
            return Err(PitbossError::forbidden(ForbiddenReason::ScopeGame, "the caller has no tenant scope"));
        }
        let Some(game) = game_id.filter(|g| !g.is_empty()) else {
            return Ok(());
        };
        if !self.permits_game(game) {
            return Err(PitbossError::forbidden(
                ForbiddenReason::ScopeGame,
                format!("game '{game}' is outside the caller's scope"),
            ));
        }
        if let Some(env) = env.filter(|e| !e.is_empty()) {
            if !self.permits_env(game, env) {
                return Err(PitbossError::forbidden(
                    ForbiddenReason::ScopeEnv,
                    format!("env '{env}' of game '{game}' is outside the caller's scope"),
                ));
            }
        }
        Ok(())
    }
}
