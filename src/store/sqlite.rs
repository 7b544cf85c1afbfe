use super::{check_update, DeploymentStore, ExperimentStore, ListFilter, StoreError};
use crate::model::{Deployment, Experiment, Phase};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS experiments (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    phase       TEXT NOT NULL,
    config      TEXT NOT NULL,
    status      TEXT NOT NULL,
    metadata    TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_experiments_phase ON experiments(phase);
CREATE INDEX IF NOT EXISTS idx_experiments_created_at ON experiments(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_experiments_updated_at ON experiments(updated_at DESC);

CREATE TABLE IF NOT EXISTS deployments (
    id            TEXT PRIMARY KEY,
    experiment_id TEXT NOT NULL,
    body          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_deployments_experiment ON deployments(experiment_id);
";

const SELECT_EXPERIMENT: &str = "SELECT id, name, description, phase, config, status, metadata, created_at, updated_at FROM experiments";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// SQLite-backed store
///
/// Blocking database calls run on the tokio blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        configure_connection(&conn)?;
        info!(path = %path.as_ref().display(), "Opened SQLite experiment store");
        Self::with_connection(conn)
    }

    /// Private in-memory database, used by tests and ephemeral runs
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Load, check and update while holding the connection
    async fn write(&self, experiment: &Experiment, from: Option<Phase>) -> Result<(), StoreError> {
        let status = serde_json::to_string(&experiment.status)?;
        let metadata = serde_json::to_string(&experiment.metadata)?;
        let exp = experiment.clone();

        self.run(move |conn| {
            let stored = load_experiment(conn, &exp.id)?;
            check_update(&stored, &exp, from)?;
            conn.execute(
                "UPDATE experiments
                 SET name = ?1, description = ?2, phase = ?3, status = ?4, metadata = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    exp.name,
                    exp.description,
                    exp.phase.as_str(),
                    status,
                    metadata,
                    encode_time(&exp.updated_at),
                    exp.id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

fn encode_time(t: &DateTime<Utc>) -> String {
    // Fixed width so lexical order matches chronological order
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Unavailable(format!("invalid timestamp '{}': {}", s, e)))
}

struct ExperimentRow {
    id: String,
    name: String,
    description: String,
    phase: String,
    config: String,
    status: String,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl ExperimentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ExperimentRow {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            phase: row.get(3)?,
            config: row.get(4)?,
            status: row.get(5)?,
            metadata: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<Experiment, StoreError> {
        let phase: Phase = self
            .phase
            .parse()
            .map_err(StoreError::Unavailable)?;
        Ok(Experiment {
            id: self.id,
            name: self.name,
            description: self.description,
            phase,
            config: serde_json::from_str(&self.config)?,
            status: serde_json::from_str(&self.status)?,
            metadata: serde_json::from_str(&self.metadata)?,
            created_at: decode_time(&self.created_at)?,
            updated_at: decode_time(&self.updated_at)?,
        })
    }
}

fn load_experiment(conn: &Connection, id: &str) -> Result<Experiment, StoreError> {
    let row = conn
        .query_row(
            &format!("{} WHERE id = ?1", SELECT_EXPERIMENT),
            params![id],
            ExperimentRow::from_row,
        )
        .optional()?;
    row.ok_or_else(|| StoreError::experiment_not_found(id))?
        .decode()
}

#[async_trait]
impl ExperimentStore for SqliteStore {
    async fn create(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let config = serde_json::to_string(&experiment.config)?;
        let status = serde_json::to_string(&experiment.status)?;
        let metadata = serde_json::to_string(&experiment.metadata)?;
        let exp = experiment.clone();

        self.run(move |conn| {
            let result = conn.execute(
                "INSERT INTO experiments (id, name, description, phase, config, status, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    exp.id,
                    exp.name,
                    exp.description,
                    exp.phase.as_str(),
                    config,
                    status,
                    metadata,
                    encode_time(&exp.created_at),
                    encode_time(&exp.updated_at),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::AlreadyExists {
                        kind: "experiment",
                        id: exp.id.clone(),
                    })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Experiment, StoreError> {
        let id = id.to_string();
        self.run(move |conn| load_experiment(conn, &id)).await
    }

    async fn update(&self, experiment: &Experiment) -> Result<(), StoreError> {
        self.write(experiment, None).await
    }

    async fn transition(&self, experiment: &Experiment, from: Phase) -> Result<(), StoreError> {
        self.write(experiment, Some(from)).await
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Experiment>, StoreError> {
        let filter = filter.clone();
        self.run(move |conn| {
            let limit = filter.limit as i64;
            let offset = filter.offset as i64;
            let rows: Vec<ExperimentRow> = match filter.phase {
                Some(phase) => {
                    let mut stmt = conn.prepare(&format!(
                        "{} WHERE phase = ?1 ORDER BY created_at DESC, id ASC LIMIT ?2 OFFSET ?3",
                        SELECT_EXPERIMENT
                    ))?;
                    let rows = stmt
                        .query_map(params![phase.as_str(), limit, offset], ExperimentRow::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "{} ORDER BY created_at DESC, id ASC LIMIT ?1 OFFSET ?2",
                        SELECT_EXPERIMENT
                    ))?;
                    let rows = stmt
                        .query_map(params![limit, offset], ExperimentRow::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            rows.into_iter().map(ExperimentRow::decode).collect()
        })
        .await
    }
}

#[async_trait]
impl DeploymentStore for SqliteStore {
    async fn put_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let body = serde_json::to_string(deployment)?;
        let id = deployment.id.clone();
        let experiment_id = deployment.experiment_id.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO deployments (id, experiment_id, body) VALUES (?1, ?2, ?3)",
                params![id, experiment_id, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_deployment(&self, id: &str) -> Result<Deployment, StoreError> {
        let id = id.to_string();
        self.run(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM deployments WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let body = body.ok_or_else(|| StoreError::deployment_not_found(&id))?;
            Ok(serde_json::from_str(&body)?)
        })
        .await
    }

    async fn list_deployments(&self, experiment_id: &str) -> Result<Vec<Deployment>, StoreError> {
        let experiment_id = experiment_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn
                .prepare("SELECT body FROM deployments WHERE experiment_id = ?1 ORDER BY id ASC")?;
            let bodies = stmt
                .query_map(params![experiment_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            bodies
                .iter()
                .map(|b| serde_json::from_str(b).map_err(StoreError::from))
                .collect()
        })
        .await
    }
}
