//! SQLite-backed `ApprovalStore`.
//!
//! State transitions are a single conditional statement,
//! `UPDATE approvals SET state = ? WHERE id = ? AND state = 'pending'`.
//! SQLite serializes writers, so of any number of concurrent transitions on
//! one id exactly one sees `rows_affected() == 1`.
//!
//! `created_at` is stored as fixed-width RFC 3339 text (microseconds, `Z`),
//! which sorts lexically in time order. `seq` breaks ties.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info};

use pitboss_contracts::{
    approval::{Approval, ApprovalFilter, ApprovalMode, ApprovalState, PageRequest, SortOrder},
    descriptor::Route,
    error::{PitbossError, PitbossResult},
};
use pitboss_core::traits::ApprovalStore;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS approvals (
        seq               INTEGER PRIMARY KEY AUTOINCREMENT,
        id                TEXT NOT NULL UNIQUE,
        created_at        TEXT NOT NULL,
        actor             TEXT NOT NULL,
        function_id       TEXT NOT NULL,
        payload           BLOB NOT NULL,
        idempotency_key   TEXT NOT NULL DEFAULT '',
        route             TEXT,
        target_service_id TEXT NOT NULL DEFAULT '',
        hash_key          TEXT NOT NULL DEFAULT '',
        game_id           TEXT NOT NULL DEFAULT '',
        env               TEXT NOT NULL DEFAULT '',
        state             TEXT NOT NULL,
        mode              TEXT NOT NULL,
        reason            TEXT NOT NULL DEFAULT ''
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_approvals_state ON approvals (state)",
    "CREATE INDEX IF NOT EXISTS idx_approvals_function ON approvals (function_id)",
    "CREATE INDEX IF NOT EXISTS idx_approvals_game_env ON approvals (game_id, env)",
    "CREATE INDEX IF NOT EXISTS idx_approvals_actor ON approvals (actor)",
    "CREATE INDEX IF NOT EXISTS idx_approvals_created ON approvals (created_at, seq)",
];

const COLUMNS: &str = "id, created_at, actor, function_id, payload, idempotency_key, route, \
                       target_service_id, hash_key, game_id, env, state, mode, reason";

fn db_err(context: &'static str) -> impl Fn(sqlx::Error) -> PitbossError {
    move |e| PitbossError::internal(format!("approval store: {context}: {e}"))
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Durable approvals in a SQLite database.
pub struct SqliteApprovalStore {
    pool: SqlitePool,
}

impl SqliteApprovalStore {
    /// Open (creating if needed) the database at `url`, e.g.
    /// `sqlite:///var/lib/pitboss/approvals.db` or `sqlite::memory:`, and
    /// apply the schema.
    pub async fn connect(url: &str) -> PitbossResult<Self> {
        if !url.starts_with("sqlite:") {
            return Err(PitbossError::config(format!("approvals database url '{url}' is not a sqlite: url")));
        }
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| PitbossError::config(format!("invalid approvals database url '{url}': {e}")))?
            .create_if_missing(true);
        // Every connection to `:memory:` is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(db_err("connect"))?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, "approval store ready");
        Ok(store)
    }

    async fn migrate(&self) -> PitbossResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(db_err("migrate"))?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch(&self, id: &str) -> PitbossResult<Option<Approval>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM approvals WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("select"))?;
        row.as_ref().map(decode).transpose()
    }

    async fn transition(&self, id: &str, to: ApprovalState, reason: &str) -> PitbossResult<Approval> {
        let result = sqlx::query("UPDATE approvals SET state = ?, reason = ? WHERE id = ? AND state = 'pending'")
            .bind(to.as_str())
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("update"))?;

        if result.rows_affected() == 0 {
            return match self.fetch(id).await? {
                Some(_) => Err(PitbossError::NotPending { id: id.to_string() }),
                None => Err(PitbossError::not_found(format!("approval '{id}'"))),
            };
        }
        debug!(approval_id = %id, state = to.as_str(), "approval transitioned");
        self.fetch(id)
            .await?
            .ok_or_else(|| PitbossError::internal(format!("approval '{id}' vanished after update")))
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &ApprovalFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(state) = filter.state {
        qb.push(" AND state = ").push_bind(state.as_str());
    }
    if let Some(mode) = filter.mode {
        qb.push(" AND mode = ").push_bind(mode.as_str());
    }
    let columns = [
        ("function_id", &filter.function_id),
        ("game_id", &filter.game_id),
        ("env", &filter.env),
        ("actor", &filter.actor),
    ];
    for (column, value) in columns {
        if let Some(v) = value {
            qb.push(format!(" AND {column} = ")).push_bind(v.clone());
        }
    }
    if let Some(games) = &filter.games {
        if games.is_empty() {
            qb.push(" AND 0 = 1");
        } else {
            qb.push(" AND game_id IN (");
            let mut separated = qb.separated(", ");
            for g in games {
                separated.push_bind(g.clone());
            }
            separated.push_unseparated(")");
        }
    }
}

fn decode(row: &SqliteRow) -> PitbossResult<Approval> {
    let get = |col: &str| -> PitbossResult<String> { row.try_get::<String, _>(col).map_err(db_err("decode")) };

    let created_at = DateTime::parse_from_rfc3339(&get("created_at")?)
        .map_err(|e| PitbossError::internal(format!("approval store: bad created_at: {e}")))?
        .with_timezone(&Utc);
    let state = get("state")?;
    let mode = get("mode")?;
    let route: Option<String> = row.try_get("route").map_err(db_err("decode"))?;

    Ok(Approval {
        id: get("id")?,
        created_at,
        actor: get("actor")?,
        function_id: get("function_id")?,
        payload: row.try_get("payload").map_err(db_err("decode"))?,
        idempotency_key: get("idempotency_key")?,
        route: route.as_deref().and_then(Route::parse),
        target_service_id: get("target_service_id")?,
        hash_key: get("hash_key")?,
        game_id: get("game_id")?,
        env: get("env")?,
        state: ApprovalState::parse(&state)
            .ok_or_else(|| PitbossError::internal(format!("approval store: unknown state '{state}'")))?,
        mode: ApprovalMode::parse(&mode)
            .ok_or_else(|| PitbossError::internal(format!("approval store: unknown mode '{mode}'")))?,
        reason: get("reason")?,
    })
}

#[async_trait]
impl ApprovalStore for SqliteApprovalStore {
    async fn create(&self, approval: Approval) -> PitbossResult<Approval> {
        let result = sqlx::query(&format!(
            "INSERT INTO approvals ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&approval.id)
        .bind(timestamp(Utc::now()))
        .bind(&approval.actor)
        .bind(&approval.function_id)
        .bind(&approval.payload)
        .bind(&approval.idempotency_key)
        .bind(approval.route.map(|r| r.as_str()))
        .bind(&approval.target_service_id)
        .bind(&approval.hash_key)
        .bind(&approval.game_id)
        .bind(&approval.env)
        .bind(ApprovalState::Pending.as_str())
        .bind(approval.mode.as_str())
        .bind("")
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(PitbossError::Conflict { reason: format!("approval '{}' already exists", approval.id) });
            }
            Err(e) => return Err(db_err("insert")(e)),
        }

        self.fetch(&approval.id)
            .await?
            .ok_or_else(|| PitbossError::internal(format!("approval '{}' vanished after insert", approval.id)))
    }

    async fn get(&self, id: &str) -> PitbossResult<Approval> {
        self.fetch(id)
            .await?
            .ok_or_else(|| PitbossError::not_found(format!("approval '{id}'")))
    }

    async fn approve(&self, id: &str) -> PitbossResult<Approval> {
        self.transition(id, ApprovalState::Approved, "").await
    }

    async fn reject(&self, id: &str, reason: &str) -> PitbossResult<Approval> {
        self.transition(id, ApprovalState::Rejected, reason).await
    }

    async fn list(&self, filter: &ApprovalFilter, page: PageRequest) -> PitbossResult<(Vec<Approval>, u64)> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS n FROM approvals");
        push_filter(&mut count, filter);
        let total: i64 = count
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("count"))?
            .try_get("n")
            .map_err(db_err("count"))?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM approvals"));
        push_filter(&mut select, filter);
        select.push(match page.sort {
            SortOrder::CreatedAtDesc => " ORDER BY created_at DESC, seq DESC",
            SortOrder::CreatedAtAsc => " ORDER BY created_at ASC, seq ASC",
        });
        select.push(" LIMIT ").push_bind(page.size as i64);
        select.push(" OFFSET ").push_bind(page.offset() as i64);

        let rows = select.build().fetch_all(&self.pool).await.map_err(db_err("list"))?;
        let items = rows.iter().map(decode).collect::<PitbossResult<Vec<_>>>()?;
        Ok((items, total.max(0) as u64))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use pitboss_contracts::{
        approval::{Approval, ApprovalMode, ApprovalState},
        descriptor::Route,
    };
    use pitboss_core::traits::ApprovalStore;

    use super::SqliteApprovalStore;

    fn db_url(dir: &tempfile::TempDir) -> String {
        format!("sqlite://{}", dir.path().join("approvals.db").display())
    }

    #[tokio::test]
    async fn approvals_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = db_url(&dir);

        let mut a = Approval::pending("alice", "player.wipe", ApprovalMode::Invoke);
        a.payload = br#"{"player_id":"u-9"}"#.to_vec();
        a.route = Some(Route::HashKey);
        a.hash_key = "u-9".to_string();
        a.game_id = "g1".to_string();
        a.env = "prod".to_string();
        let id = a.id.clone();
        {
            let store = SqliteApprovalStore::connect(&url).await.unwrap();
            store.create(a).await.unwrap();
            store.close().await;
        }

        let store = SqliteApprovalStore::connect(&url).await.unwrap();
        let got = store.get(&id).await.unwrap();
        assert_eq!(got.state, ApprovalState::Pending);
        assert_eq!(got.payload, br#"{"player_id":"u-9"}"#.to_vec());
        assert_eq!(got.route, Some(Route::HashKey));
        assert_eq!(got.hash_key, "u-9");

        let approved = store.approve(&id).await.unwrap();
        assert_eq!(approved.state, ApprovalState::Approved);
        assert_eq!(approved.created_at, got.created_at);
    }

    #[tokio::test]
    async fn in_memory_url_works() {
        let store = SqliteApprovalStore::connect("sqlite::memory:").await.unwrap();
        let a = store.create(Approval::pending("bob", "economy.grant", ApprovalMode::StartJob)).await.unwrap();
        assert_eq!(store.get(&a.id).await.unwrap().mode, ApprovalMode::StartJob);
    }

    #[tokio::test]
    async fn bad_url_is_a_configuration_error() {
        match SqliteApprovalStore::connect("postgres://nope").await {
            Err(e) => assert!(e.to_string().contains("approvals database"), "got: {e}"),
            Ok(_) => panic!("expected a configuration error"),
        }
    }
}
