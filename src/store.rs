//! Persistence collaborator: where the registry learns which projects exist.
//!
//! The registry talks to the store through [`ProjectStore`] only, inside a
//! begin / query / commit session. [`SqliteProjectStore`] is the stock
//! implementation over a `stored_project` table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;

/// One known project as stored by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub bug_tracker: Option<String>,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default)]
    pub scm: Option<String>,
}

/// Queries the registry can issue against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreQuery {
    AllProjects,
    Project(i64),
}

/// Session-scoped access to the project list.
///
/// `begin_session` returns `Ok(false)` when no new session can be opened
/// (for instance because one is already active); callers treat that the same
/// as an unreachable store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn begin_session(&self) -> Result<bool, StoreError>;

    async fn query(&self, query: &StoreQuery) -> Result<Vec<ProjectRecord>, StoreError>;

    async fn commit_session(&self) -> Result<(), StoreError>;

    async fn is_session_active(&self) -> bool;
}

type ProjectRow = (i64, String, Option<String>, Option<String>, Option<String>);

const SELECT_ALL_PROJECTS: &str = "SELECT id, name, bts_url, mail_url, scm_url \
     FROM stored_project ORDER BY id";

const SELECT_PROJECT: &str = "SELECT id, name, bts_url, mail_url, scm_url \
     FROM stored_project WHERE id = ?";

fn into_record((id, name, bug_tracker, mail, scm): ProjectRow) -> ProjectRecord {
    ProjectRecord {
        id,
        name,
        bug_tracker,
        mail,
        scm,
    }
}

/// SQLite-backed project store. One session maps to one open transaction.
pub struct SqliteProjectStore {
    pool: SqlitePool,
    session: Mutex<Option<Transaction<'static, Sqlite>>>,
}

impl SqliteProjectStore {
    /// Connect to `url` (e.g. `sqlite://data/tds.db?mode=rwc`) and make sure
    /// the project table exists.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        info!(url = %url, "connected to project store");

        let store = Self::from_pool(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            session: Mutex::new(None),
        }
    }

    /// Create the `stored_project` table if it is missing (idempotent)
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stored_project (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                bts_url TEXT,
                mail_url TEXT,
                scm_url TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or replace a project row outside of any session
    pub async fn upsert_project(&self, record: &ProjectRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO stored_project (id, name, bts_url, mail_url, scm_url) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.bug_tracker)
        .bind(&record.mail)
        .bind(&record.scm)
        .execute(&self.pool)
        .await?;
        debug!(project_id = record.id, name = %record.name, "stored project");
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for SqliteProjectStore {
    async fn begin_session(&self) -> Result<bool, StoreError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(false);
        }
        *session = Some(self.pool.begin().await?);
        Ok(true)
    }

    async fn query(&self, query: &StoreQuery) -> Result<Vec<ProjectRecord>, StoreError> {
        let mut session = self.session.lock().await;
        let tx = session.as_mut().ok_or(StoreError::NoSession)?;

        let rows: Vec<ProjectRow> = match query {
            StoreQuery::AllProjects => {
                sqlx::query_as(SELECT_ALL_PROJECTS)
                    .fetch_all(&mut **tx)
                    .await?
            }
            StoreQuery::Project(id) => {
                sqlx::query_as(SELECT_PROJECT)
                    .bind(*id)
                    .fetch_all(&mut **tx)
                    .await?
            }
        };

        Ok(rows.into_iter().map(into_record).collect())
    }

    async fn commit_session(&self) -> Result<(), StoreError> {
        let tx = self
            .session
            .lock()
            .await
            .take()
            .ok_or(StoreError::NoSession)?;
        tx.commit().await?;
        Ok(())
    }

    async fn is_session_active(&self) -> bool {
        self.session.lock().await.is_some()
    }
}
