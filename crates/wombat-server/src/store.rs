use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use wombat_contracts::{NewProblem, Phase, Problem, ProblemPatch, UserId};

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("stored record is unreadable: {0}")]
    Corrupt(String),
    #[error("problem {0} does not exist")]
    NotFound(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("{0} is already linked to another partner")]
    AlreadyLinked(UserId),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Result of a revision-checked write.
#[derive(Debug, Clone)]
pub enum WriteResult {
    Committed(Problem),
    /// The record moved on since `expected_revision`; carries the latest copy.
    Conflict(Problem),
}

/// Shared-record store. Every write is a compare-and-swap on `revision`.
#[async_trait]
pub trait ProblemStore: Send + Sync {
    async fn create(&self, new: NewProblem) -> Result<Problem, StoreError>;
    async fn read(&self, id: &str) -> Result<Option<Problem>, StoreError>;
    async fn write(
        &self,
        id: &str,
        expected_revision: u64,
        patch: &ProblemPatch,
    ) -> Result<WriteResult, StoreError>;
    /// Problems the user participates in, newest first.
    async fn list_for(&self, user: &str) -> Result<Vec<Problem>, StoreError>;
    /// Every problem currently in `phase`, oldest first.
    async fn list_in_phase(&self, phase: Phase) -> Result<Vec<Problem>, StoreError>;
    /// Snapshot feed of records involving `participant`, or every record when `None`.
    fn subscribe(&self, participant: Option<UserId>) -> ProblemFeed;
    async fn link_partners(&self, inviter: &str, invitee: &str) -> Result<(), StoreError>;
    async fn partner_of(&self, user: &str) -> Result<Option<UserId>, StoreError>;
}

/// What a subscriber receives from the store.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Snapshot(Problem),
    /// The subscriber fell behind and `skipped` snapshots were dropped.
    Lagged(u64),
}

/// Receiving end of a store subscription. Dropping it unsubscribes.
pub struct ProblemFeed {
    rx: broadcast::Receiver<Problem>,
    participant: Option<UserId>,
}

impl ProblemFeed {
    /// Next event for this subscriber; `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        loop {
            match self.rx.recv().await {
                Ok(problem) => {
                    let wanted = match &self.participant {
                        Some(user) => problem.role_of(user).is_some(),
                        None => true,
                    };
                    if wanted {
                        return Some(FeedEvent::Snapshot(problem));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(FeedEvent::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next snapshot, skipping over lag.
    pub async fn next(&mut self) -> Option<Problem> {
        loop {
            match self.recv().await? {
                FeedEvent::Snapshot(problem) => return Some(problem),
                FeedEvent::Lagged(skipped) => {
                    warn!(skipped, "problem feed lagged; continuing with newer snapshots");
                }
            }
        }
    }
}

#[derive(Default)]
struct MemoryStore {
    problems: HashMap<String, Problem>,
    partners: HashMap<UserId, UserId>,
}

struct SqliteStore {
    conn: Connection,
}

enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

/// [`ProblemStore`] over an in-process backend, fanning committed records
/// out to subscribers.
pub struct BackendStore {
    backend: Mutex<StoreBackend>,
    feed: broadcast::Sender<Problem>,
}

impl BackendStore {
    pub fn memory() -> Self {
        Self::with_backend(StoreBackend::Memory(MemoryStore::default()))
    }

    pub fn sqlite(path: &str) -> Result<Self, StoreError> {
        let backend = StoreBackend::Sqlite(SqliteStore::new(path)?);
        Ok(Self::with_backend(backend))
    }

    pub fn from_config(cfg: &wombat_config::Store) -> Result<Self, StoreError> {
        if cfg.kind == "sqlite" {
            let path = cfg.sqlite_path.as_deref().ok_or_else(|| {
                StoreError::Backend("store.sqlite_path is required for sqlite store".to_string())
            })?;
            Self::sqlite(path)
        } else {
            Ok(Self::memory())
        }
    }

    fn with_backend(backend: StoreBackend) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            backend: Mutex::new(backend),
            feed,
        }
    }

    fn publish(&self, problem: &Problem) {
        // No receivers is not an error; nobody is watching yet.
        let _ = self.feed.send(problem.clone());
    }
}

#[async_trait]
impl ProblemStore for BackendStore {
    async fn create(&self, new: NewProblem) -> Result<Problem, StoreError> {
        if new.participants.role_a == new.participants.role_b {
            return Err(StoreError::InvalidRecord(
                "a problem needs two distinct participants".to_string(),
            ));
        }
        let problem = Problem::new(
            uuid::Uuid::new_v4().to_string(),
            new.participants,
            Utc::now(),
        );
        let mut backend = self.backend.lock().await;
        backend.insert(&problem)?;
        debug!(problem_id = %problem.id, "problem created");
        self.publish(&problem);
        Ok(problem)
    }

    async fn read(&self, id: &str) -> Result<Option<Problem>, StoreError> {
        self.backend.lock().await.get(id)
    }

    async fn write(
        &self,
        id: &str,
        expected_revision: u64,
        patch: &ProblemPatch,
    ) -> Result<WriteResult, StoreError> {
        // Publishing under the lock keeps the feed in commit order.
        let mut backend = self.backend.lock().await;
        let result = backend.compare_and_set(id, expected_revision, patch)?;
        match &result {
            WriteResult::Committed(problem) => {
                debug!(problem_id = %id, revision = problem.revision, "write committed");
                self.publish(problem);
            }
            WriteResult::Conflict(current) => {
                debug!(
                    problem_id = %id,
                    expected_revision,
                    actual_revision = current.revision,
                    "write conflict"
                );
            }
        }
        Ok(result)
    }

    async fn list_for(&self, user: &str) -> Result<Vec<Problem>, StoreError> {
        self.backend.lock().await.list_for(user)
    }

    async fn list_in_phase(&self, phase: Phase) -> Result<Vec<Problem>, StoreError> {
        self.backend.lock().await.list_in_phase(phase)
    }

    fn subscribe(&self, participant: Option<UserId>) -> ProblemFeed {
        ProblemFeed {
            rx: self.feed.subscribe(),
            participant,
        }
    }

    async fn link_partners(&self, inviter: &str, invitee: &str) -> Result<(), StoreError> {
        if inviter == invitee {
            return Err(StoreError::AlreadyLinked(invitee.to_string()));
        }
        let mut backend = self.backend.lock().await;
        for (user, wanted) in [(inviter, invitee), (invitee, inviter)] {
            match backend.partner_of(user)? {
                Some(existing) if existing != wanted => {
                    return Err(StoreError::AlreadyLinked(user.to_string()))
                }
                _ => {}
            }
        }
        backend.link(inviter, invitee)
    }

    async fn partner_of(&self, user: &str) -> Result<Option<UserId>, StoreError> {
        self.backend.lock().await.partner_of(user)
    }
}

impl StoreBackend {
    fn insert(&mut self, problem: &Problem) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                store.problems.insert(problem.id.clone(), problem.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.insert(problem),
        }
    }

    fn get(&self, id: &str) -> Result<Option<Problem>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.problems.get(id).cloned()),
            StoreBackend::Sqlite(store) => store.get(id),
        }
    }

    fn compare_and_set(
        &mut self,
        id: &str,
        expected_revision: u64,
        patch: &ProblemPatch,
    ) -> Result<WriteResult, StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                let current = store
                    .problems
                    .get_mut(id)
                    .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
                if current.revision != expected_revision {
                    return Ok(WriteResult::Conflict(current.clone()));
                }
                patch.apply(current);
                current.revision += 1;
                Ok(WriteResult::Committed(current.clone()))
            }
            StoreBackend::Sqlite(store) => store.compare_and_set(id, expected_revision, patch),
        }
    }

    fn list_for(&self, user: &str) -> Result<Vec<Problem>, StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                let mut mine: Vec<Problem> = store
                    .problems
                    .values()
                    .filter(|p| p.role_of(user).is_some())
                    .cloned()
                    .collect();
                mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(mine)
            }
            StoreBackend::Sqlite(store) => store.list_for(user),
        }
    }

    fn list_in_phase(&self, phase: Phase) -> Result<Vec<Problem>, StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                let mut found: Vec<Problem> = store
                    .problems
                    .values()
                    .filter(|p| p.status == phase)
                    .cloned()
                    .collect();
                found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                Ok(found)
            }
            StoreBackend::Sqlite(store) => store.list_in_phase(phase),
        }
    }

    fn link(&mut self, inviter: &str, invitee: &str) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .partners
                    .insert(inviter.to_string(), invitee.to_string());
                store
                    .partners
                    .insert(invitee.to_string(), inviter.to_string());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.link(inviter, invitee),
        }
    }

    fn partner_of(&self, user: &str) -> Result<Option<UserId>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.partners.get(user).cloned()),
            StoreBackend::Sqlite(store) => store.partner_of(user),
        }
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS problems (
                id TEXT PRIMARY KEY,
                user_a TEXT NOT NULL,
                user_b TEXT NOT NULL,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL,
                revision INTEGER NOT NULL,
                body_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS problems_user_a ON problems(user_a);
            CREATE INDEX IF NOT EXISTS problems_user_b ON problems(user_b);
            CREATE INDEX IF NOT EXISTS problems_status ON problems(status);
            CREATE TABLE IF NOT EXISTS partners (
                user_id TEXT PRIMARY KEY,
                partner_id TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { conn })
    }

    fn insert(&self, problem: &Problem) -> Result<(), StoreError> {
        self.conn.execute(
            "
            INSERT INTO problems (id, user_a, user_b, created_at, status, revision, body_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                problem.id,
                problem.participants.role_a,
                problem.participants.role_b,
                problem
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
                problem.status.as_str(),
                problem.revision as i64,
                encode(problem)?
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Problem>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body_json FROM problems WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|text| decode(&text)).transpose()
    }

    fn compare_and_set(
        &mut self,
        id: &str,
        expected_revision: u64,
        patch: &ProblemPatch,
    ) -> Result<WriteResult, StoreError> {
        let tx = self.conn.transaction()?;
        let body: Option<String> = tx
            .query_row(
                "SELECT body_json FROM problems WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let mut current = match body {
            Some(text) => decode(&text)?,
            None => return Err(StoreError::NotFound(id.to_string())),
        };
        if current.revision != expected_revision {
            return Ok(WriteResult::Conflict(current));
        }
        patch.apply(&mut current);
        current.revision += 1;
        let changed = tx.execute(
            "
            UPDATE problems SET status = ?1, revision = ?2, body_json = ?3
            WHERE id = ?4 AND revision = ?5
            ",
            params![
                current.status.as_str(),
                current.revision as i64,
                encode(&current)?,
                id,
                expected_revision as i64
            ],
        )?;
        if changed != 1 {
            return Err(StoreError::Backend(format!(
                "revision guard rejected update of {id}"
            )));
        }
        tx.commit()?;
        Ok(WriteResult::Committed(current))
    }

    fn list_for(&self, user: &str) -> Result<Vec<Problem>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT body_json FROM problems
            WHERE user_a = ?1 OR user_b = ?1
            ORDER BY created_at DESC
            ",
        )?;
        let rows = stmt.query_map(params![user], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode(&row?)?);
        }
        Ok(out)
    }

    fn list_in_phase(&self, phase: Phase) -> Result<Vec<Problem>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT body_json FROM problems
            WHERE status = ?1
            ORDER BY created_at ASC
            ",
        )?;
        let rows = stmt.query_map(params![phase.as_str()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode(&row?)?);
        }
        Ok(out)
    }

    fn link(&mut self, inviter: &str, invitee: &str) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for (user, partner) in [(inviter, invitee), (invitee, inviter)] {
            tx.execute(
                "INSERT OR REPLACE INTO partners (user_id, partner_id) VALUES (?1, ?2)",
                params![user, partner],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn partner_of(&self, user: &str) -> Result<Option<UserId>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT partner_id FROM partners WHERE user_id = ?1",
                params![user],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn encode(problem: &Problem) -> Result<String, StoreError> {
    serde_json::to_string(problem).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn decode(text: &str) -> Result<Problem, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Corrupt(e.to_string()))
}
