//! Two-person-rule approvals.
//!
//! An `Approval` records a gated call exactly as it was requested so the
//! Server can execute it later on behalf of the original actor. State moves
//! once: `pending -> approved` or `pending -> rejected`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::descriptor::Route;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalState {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalState::Pending),
            "approved" => Some(ApprovalState::Approved),
            "rejected" => Some(ApprovalState::Rejected),
            _ => None,
        }
    }
}

/// Which dispatch the approval will run once approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    Invoke,
    StartJob,
}

impl ApprovalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalMode::Invoke => "invoke",
            ApprovalMode::StartJob => "start_job",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invoke" => Some(ApprovalMode::Invoke),
            "start_job" => Some(ApprovalMode::StartJob),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    /// Stamped by the store on `create`.
    pub created_at: DateTime<Utc>,
    /// The user who requested the gated call.
    pub actor: String,
    pub function_id: String,
    /// Raw request payload. Never rendered by the admin API.
    #[serde(skip)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    #[serde(default)]
    pub target_service_id: String,
    #[serde(default)]
    pub hash_key: String,
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub env: String,
    pub state: ApprovalState,
    pub mode: ApprovalMode,
    /// Populated on rejection only.
    #[serde(default)]
    pub reason: String,
}

impl Approval {
    /// A pending approval with a fresh id. `created_at` is provisional until
    /// the store stamps it.
    pub fn pending(actor: impl Into<String>, function_id: impl Into<String>, mode: ApprovalMode) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            actor: actor.into(),
            function_id: function_id.into(),
            payload: Vec::new(),
            idempotency_key: String::new(),
            route: None,
            target_service_id: String::new(),
            hash_key: String::new(),
            game_id: String::new(),
            env: String::new(),
            state: ApprovalState::Pending,
            mode,
            reason: String::new(),
        }
    }
}

/// AND-composed listing filter; `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalFilter {
    pub state: Option<ApprovalState>,
    pub function_id: Option<String>,
    pub game_id: Option<String>,
    pub env: Option<String>,
    pub actor: Option<String>,
    pub mode: Option<ApprovalMode>,
    /// Any-of game restriction derived from the caller's scope. An empty
    /// list matches nothing.
    pub games: Option<Vec<String>>,
}

impl ApprovalFilter {
    pub fn matches(&self, a: &Approval) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }
        self.state.map_or(true, |s| s == a.state)
            && self.mode.map_or(true, |m| m == a.mode)
            && eq(&self.function_id, &a.function_id)
            && eq(&self.game_id, &a.game_id)
            && eq(&self.env, &a.env)
            && eq(&self.actor, &a.actor)
            && self.games.as_ref().map_or(true, |g| g.contains(&a.game_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    CreatedAtDesc,
    CreatedAtAsc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created_at_desc" => Some(SortOrder::CreatedAtDesc),
            "created_at_asc" => Some(SortOrder::CreatedAtAsc),
            _ => None,
        }
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
    pub sort: SortOrder,
}

impl PageRequest {
    pub const DEFAULT_SIZE: u32 = 20;
    pub const MAX_SIZE: u32 = 500;

    /// Clamp out-of-range input: page 0 becomes 1, size 0 becomes the
    /// default, oversize requests are capped.
    pub fn new(page: u32, size: u32, sort: SortOrder) -> Self {
        let page = page.max(1);
        let size = match size {
            0 => Self::DEFAULT_SIZE,
            s => s.min(Self::MAX_SIZE),
        };
        Self { page, size, sort }
    }

    pub fn offset(&self) -> usize {
        (self.page as usize - 1) * self.size as usize
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_SIZE, SortOrder::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_is_and_composed() {
        let mut a = Approval::pending("u1", "player.wipe", ApprovalMode::Invoke);
        a.game_id = "g1".to_string();
        a.env = "prod".to_string();

        assert!(ApprovalFilter::default().matches(&a));

        let f = ApprovalFilter {
            state: Some(ApprovalState::Pending),
            function_id: Some("player.wipe".to_string()),
            game_id: Some("g1".to_string()),
            ..Default::default()
        };
        assert!(f.matches(&a));

        let f = ApprovalFilter { env: Some("dev".to_string()), ..f };
        assert!(!f.matches(&a));

        let f = ApprovalFilter { mode: Some(ApprovalMode::StartJob), ..Default::default() };
        assert!(!f.matches(&a));
    }

    #[test]
    fn game_restriction_is_any_of() {
        let mut a = Approval::pending("u1", "player.wipe", ApprovalMode::Invoke);
        a.game_id = "g1".to_string();

        let f = ApprovalFilter { games: Some(vec!["g0".to_string(), "g1".to_string()]), ..Default::default() };
        assert!(f.matches(&a));
        let f = ApprovalFilter { games: Some(vec![]), ..Default::default() };
        assert!(!f.matches(&a));
    }

    #[test]
    fn page_request_clamps() {
        let p = PageRequest::new(0, 0, SortOrder::CreatedAtAsc);
        assert_eq!(p.page, 1);
        assert_eq!(p.size, PageRequest::DEFAULT_SIZE);
        assert_eq!(p.offset(), 0);

        let p = PageRequest::new(3, 10_000, SortOrder::default());
        assert_eq!(p.size, PageRequest::MAX_SIZE);
        assert_eq!(p.offset(), 1000);
    }

    #[test]
    fn payload_is_never_serialized() {
        let mut a = Approval::pending("u1", "player.wipe", ApprovalMode::Invoke);
        a.payload = b"{\"secret\":1}".to_vec();
        let json = serde_json::to_string(&a).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"state\":\"pending\""));
    }
}
