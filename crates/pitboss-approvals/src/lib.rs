//! # pitboss-approvals
//!
//! Durable state machine for two-person-rule actions.
//!
//! Two `ApprovalStore` implementations with identical semantics:
//!
//! - [`MemoryApprovalStore`]: a locked map, for development and tests
//! - [`SqliteApprovalStore`]: a SQLite table with indexes on `state`,
//!   `function_id`, `(game_id, env)`, `actor` and `created_at`
//!
//! State moves once, `pending -> approved` or `pending -> rejected`, and the
//! move is a compare-and-swap: of two concurrent transitions on one id
//! exactly one succeeds and the other fails with `NotPending`.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use pitboss_contracts::error::PitbossResult;
use pitboss_core::traits::ApprovalStore;

pub use memory::MemoryApprovalStore;
pub use sqlite::SqliteApprovalStore;

/// A SQLite store when `url` is given, otherwise an in-memory one.
pub async fn open_store(url: Option<&str>) -> PitbossResult<Arc<dyn ApprovalStore>> {
    match url {
        Some(url) => Ok(Arc::new(SqliteApprovalStore::connect(url).await?)),
        None => {
            tracing::warn!("no approvals database configured; approvals will not survive a restart");
            Ok(Arc::new(MemoryApprovalStore::new()))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pitboss_contracts::{
        approval::{Approval, ApprovalFilter, ApprovalMode, ApprovalState, PageRequest, SortOrder},
        error::PitbossError,
    };
    use pitboss_core::traits::ApprovalStore;

    use super::{MemoryApprovalStore, SqliteApprovalStore};

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn pending(actor: &str, function_id: &str, game: &str, env: &str) -> Approval {
        let mut a = Approval::pending(actor, function_id, ApprovalMode::Invoke);
        a.game_id = game.to_string();
        a.env = env.to_string();
        a.payload = br#"{"player_id":"u-1"}"#.to_vec();
        a
    }

    async fn stores() -> Vec<(&'static str, Arc<dyn ApprovalStore>, Option<tempfile::TempDir>)> {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("approvals.db").display());
        vec![
            ("memory", Arc::new(MemoryApprovalStore::new()) as Arc<dyn ApprovalStore>, None),
            ("sqlite", Arc::new(SqliteApprovalStore::connect(&url).await.unwrap()), Some(dir)),
        ]
    }

    // ── State machine ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_stamps_and_forces_pending() {
        for (name, store, _dir) in stores().await {
            let mut a = pending("alice", "player.wipe", "g1", "prod");
            a.state = ApprovalState::Approved;
            a.reason = "smuggled".to_string();

            let created = store.create(a.clone()).await.unwrap();
            assert_eq!(created.state, ApprovalState::Pending, "{name}");
            assert!(created.reason.is_empty(), "{name}");

            match store.create(a).await {
                Err(PitbossError::Conflict { .. }) => {}
                other => panic!("{name}: expected conflict, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn approve_and_reject_are_single_shot() {
        for (name, store, _dir) in stores().await {
            let a = store.create(pending("alice", "player.wipe", "g1", "prod")).await.unwrap();
            let approved = store.approve(&a.id).await.unwrap();
            assert_eq!(approved.state, ApprovalState::Approved, "{name}");

            match store.reject(&a.id, "too late").await {
                Err(PitbossError::NotPending { id }) => assert_eq!(id, a.id, "{name}"),
                other => panic!("{name}: expected not_pending, got {:?}", other),
            }

            let b = store.create(pending("alice", "player.wipe", "g1", "prod")).await.unwrap();
            let rejected = store.reject(&b.id, "wrong player").await.unwrap();
            assert_eq!(rejected.state, ApprovalState::Rejected, "{name}");
            assert_eq!(rejected.reason, "wrong player", "{name}");
            assert!(matches!(store.approve(&b.id).await, Err(PitbossError::NotPending { .. })), "{name}");
        }
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        for (name, store, _dir) in stores().await {
            assert!(matches!(store.get("nope").await, Err(PitbossError::NotFound { .. })), "{name}");
            assert!(matches!(store.approve("nope").await, Err(PitbossError::NotFound { .. })), "{name}");
            assert!(matches!(store.reject("nope", "x").await, Err(PitbossError::NotFound { .. })), "{name}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transitions_have_one_winner() {
        for (name, store, _dir) in stores().await {
            for _ in 0..10 {
                let a = store.create(pending("alice", "player.wipe", "g1", "prod")).await.unwrap();

                let s1 = Arc::clone(&store);
                let s2 = Arc::clone(&store);
                let (id1, id2) = (a.id.clone(), a.id.clone());
                let approve = tokio::spawn(async move { s1.approve(&id1).await });
                let reject = tokio::spawn(async move { s2.reject(&id2, "no").await });
                let (r1, r2) = (approve.await.unwrap(), reject.await.unwrap());

                assert_eq!(r1.is_ok() as u8 + r2.is_ok() as u8, 1, "{name}: exactly one winner");
                let approved_won = r1.is_ok();
                let loser = if approved_won { r2.map(|_| ()) } else { r1.map(|_| ()) };
                assert!(matches!(loser, Err(PitbossError::NotPending { .. })), "{name}");

                let stored = store.get(&a.id).await.unwrap();
                let expected = if approved_won { ApprovalState::Approved } else { ApprovalState::Rejected };
                assert_eq!(stored.state, expected, "{name}");
            }
        }
    }

    // ── Listing ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn list_filters_are_and_composed() {
        for (name, store, _dir) in stores().await {
            store.create(pending("alice", "player.wipe", "g1", "prod")).await.unwrap();
            store.create(pending("alice", "player.wipe", "g1", "dev")).await.unwrap();
            store.create(pending("bob", "economy.grant", "g2", "prod")).await.unwrap();
            let settled = store.create(pending("bob", "player.wipe", "g1", "prod")).await.unwrap();
            store.approve(&settled.id).await.unwrap();

            let filter = ApprovalFilter {
                state: Some(ApprovalState::Pending),
                function_id: Some("player.wipe".to_string()),
                ..Default::default()
            };
            let (items, total) = store.list(&filter, PageRequest::default()).await.unwrap();
            assert_eq!(total, 2, "{name}");
            assert!(items.iter().all(|a| a.actor == "alice"), "{name}");

            let filter = ApprovalFilter { env: Some("prod".to_string()), actor: Some("bob".to_string()), ..Default::default() };
            assert_eq!(store.list(&filter, PageRequest::default()).await.unwrap().1, 2, "{name}");

            let filter = ApprovalFilter { games: Some(vec!["g2".to_string()]), ..Default::default() };
            let (items, _) = store.list(&filter, PageRequest::default()).await.unwrap();
            assert_eq!(items.len(), 1, "{name}");
            assert_eq!(items[0].function_id, "economy.grant", "{name}");

            let filter = ApprovalFilter { games: Some(vec![]), ..Default::default() };
            assert_eq!(store.list(&filter, PageRequest::default()).await.unwrap().1, 0, "{name}");

            let filter = ApprovalFilter { mode: Some(ApprovalMode::StartJob), ..Default::default() };
            assert_eq!(store.list(&filter, PageRequest::default()).await.unwrap().1, 0, "{name}");
        }
    }

    #[tokio::test]
    async fn list_paginates_and_sorts() {
        for (name, store, _dir) in stores().await {
            let mut ids = Vec::new();
            for i in 0..5 {
                let a = store.create(pending("alice", &format!("fn.{i}"), "g1", "dev")).await.unwrap();
                ids.push(a.id);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }

            let (page1, total) = store
                .list(&ApprovalFilter::default(), PageRequest::new(1, 2, SortOrder::CreatedAtDesc))
                .await
                .unwrap();
            assert_eq!(total, 5, "{name}");
            assert_eq!(page1.iter().map(|a| a.id.clone()).collect::<Vec<_>>(), vec![ids[4].clone(), ids[3].clone()], "{name}");

            let (page3, _) = store
                .list(&ApprovalFilter::default(), PageRequest::new(3, 2, SortOrder::CreatedAtDesc))
                .await
                .unwrap();
            assert_eq!(page3.len(), 1, "{name}");
            assert_eq!(page3[0].id, ids[0], "{name}");

            let (asc, _) = store
                .list(&ApprovalFilter::default(), PageRequest::new(1, 10, SortOrder::CreatedAtAsc))
                .await
                .unwrap();
            assert_eq!(asc.iter().map(|a| a.id.clone()).collect::<Vec<_>>(), ids, "{name}");

            let (beyond, total) = store
                .list(&ApprovalFilter::default(), PageRequest::new(9, 10, SortOrder::CreatedAtAsc))
                .await
                .unwrap();
            assert!(beyond.is_empty(), "{name}");
            assert_eq!(total, 5, "{name}");
        }
    }
}
