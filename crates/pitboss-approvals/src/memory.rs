//! In-memory `ApprovalStore`.
//!
//! Every operation takes the one lock for its whole duration, which makes
//! `approve`/`reject` a compare-and-swap with the same guarantee the SQLite
//! store gets from a conditional `UPDATE`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use pitboss_contracts::{
    approval::{Approval, ApprovalFilter, ApprovalState, PageRequest, SortOrder},
    error::{PitbossError, PitbossResult},
};
use pitboss_core::traits::ApprovalStore;

#[derive(Default)]
struct MemoryState {
    /// id -> (insertion sequence, approval)
    by_id: HashMap<String, (u64, Approval)>,
    next_seq: u64,
}

/// Approvals held in process memory. Lost on restart; for development and
/// tests.
#[derive(Default)]
pub struct MemoryApprovalStore {
    state: Mutex<MemoryState>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn transition(&self, id: &str, to: ApprovalState, reason: &str) -> PitbossResult<Approval> {
        let mut state = self.state.lock().await;
        let (_, approval) = state
            .by_id
            .get_mut(id)
            .ok_or_else(|| PitbossError::not_found(format!("approval '{id}'")))?;
        if approval.state != ApprovalState::Pending {
            return Err(PitbossError::NotPending { id: id.to_string() });
        }
        approval.state = to;
        approval.reason = reason.to_string();
        debug!(approval_id = %id, state = to.as_str(), "approval transitioned");
        Ok(approval.clone())
    }
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn create(&self, mut approval: Approval) -> PitbossResult<Approval> {
        let mut state = self.state.lock().await;
        if state.by_id.contains_key(&approval.id) {
            return Err(PitbossError::Conflict { reason: format!("approval '{}' already exists", approval.id) });
        }
        approval.created_at = Utc::now();
        approval.state = ApprovalState::Pending;
        approval.reason.clear();

        let seq = state.next_seq;
        state.next_seq += 1;
        state.by_id.insert(approval.id.clone(), (seq, approval.clone()));
        Ok(approval)
    }

    async fn get(&self, id: &str) -> PitbossResult<Approval> {
        self.state
            .lock()
            .await
            .by_id
            .get(id)
            .map(|(_, a)| a.clone())
            .ok_or_else(|| PitbossError::not_found(format!("approval '{id}'")))
    }

    async fn approve(&self, id: &str) -> PitbossResult<Approval> {
        self.transition(id, ApprovalState::Approved, "").await
    }

    async fn reject(&self, id: &str, reason: &str) -> PitbossResult<Approval> {
        self.transition(id, ApprovalState::Rejected, reason).await
    }

    async fn list(&self, filter: &ApprovalFilter, page: PageRequest) -> PitbossResult<(Vec<Approval>, u64)> {
        let state = self.state.lock().await;
        let mut matches: Vec<&(u64, Approval)> = state.by_id.values().filter(|(_, a)| filter.matches(a)).collect();
        matches.sort_by(|(sa, a), (sb, b)| a.created_at.cmp(&b.created_at).then(sa.cmp(sb)));
        if page.sort == SortOrder::CreatedAtDesc {
            matches.reverse();
        }

        let total = matches.len() as u64;
        let items = matches
            .into_iter()
            .skip(page.offset())
            .take(page.size as usize)
            .map(|(_, a)| a.clone())
            .collect();
        Ok((items, total))
    }
}
