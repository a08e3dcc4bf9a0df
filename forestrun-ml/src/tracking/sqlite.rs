//! SQLite tracking store.

use super::{
    Experiment, Metric, Param, Run, RunData, RunInfo, RunStatus, RunTag, TrackingStore,
    now_millis,
};
use crate::error::MlError;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS experiments (
    experiment_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    name              TEXT NOT NULL UNIQUE,
    artifact_location TEXT NOT NULL,
    lifecycle_stage   TEXT NOT NULL DEFAULT 'active',
    creation_time     INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS runs (
    run_uuid        TEXT PRIMARY KEY,
    experiment_id   INTEGER NOT NULL REFERENCES experiments(experiment_id),
    name            TEXT NOT NULL,
    status          TEXT NOT NULL,
    start_time      INTEGER NOT NULL,
    end_time        INTEGER,
    artifact_uri    TEXT NOT NULL,
    lifecycle_stage TEXT NOT NULL DEFAULT 'active'
);
CREATE TABLE IF NOT EXISTS params (
    key      TEXT NOT NULL,
    value    TEXT NOT NULL,
    run_uuid TEXT NOT NULL REFERENCES runs(run_uuid),
    PRIMARY KEY (key, run_uuid)
);
CREATE TABLE IF NOT EXISTS metrics (
    key       TEXT NOT NULL,
    value     REAL NOT NULL,
    timestamp INTEGER NOT NULL,
    step      INTEGER NOT NULL DEFAULT 0,
    run_uuid  TEXT NOT NULL REFERENCES runs(run_uuid)
);
CREATE TABLE IF NOT EXISTS tags (
    key      TEXT NOT NULL,
    value    TEXT NOT NULL,
    run_uuid TEXT NOT NULL REFERENCES runs(run_uuid),
    PRIMARY KEY (key, run_uuid)
);
";

/// Tracking store backed by a single SQLite database file.
///
/// Artifacts are not stored in the database; each experiment gets a
/// directory under `artifact_root`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    artifact_root: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path, artifact_root: &Path) -> Result<Self, MlError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(db = %db_path.display(), "Opened SQLite tracking store");
        Ok(Self {
            conn: Mutex::new(conn),
            artifact_root: std::path::absolute(artifact_root)?,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, MlError> {
        self.conn
            .lock()
            .map_err(|_| MlError::tracking("SQLite connection mutex poisoned"))
    }

    fn run_exists(conn: &Connection, run_id: &str) -> Result<(), MlError> {
        let found: Option<String> = conn
            .query_row(
                "SELECT run_uuid FROM runs WHERE run_uuid = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        found
            .map(|_| ())
            .ok_or_else(|| MlError::not_found(format!("run {run_id}")))
    }
}

#[async_trait]
impl TrackingStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>, MlError> {
        let conn = self.conn()?;
        let exp = conn
            .query_row(
                "SELECT experiment_id, name, artifact_location FROM experiments
                 WHERE name = ?1 AND lifecycle_stage = 'active'",
                params![name],
                |row| {
                    Ok(Experiment {
                        experiment_id: row.get::<_, i64>(0)?.to_string(),
                        name: row.get(1)?,
                        artifact_location: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(exp)
    }

    async fn create_experiment(&self, name: &str) -> Result<String, MlError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO experiments (name, artifact_location, creation_time) VALUES (?1, '', ?2)",
            params![name, now_millis()],
        )?;
        let id = tx.last_insert_rowid();
        let location = self.artifact_root.join(id.to_string());
        tx.execute(
            "UPDATE experiments SET artifact_location = ?1 WHERE experiment_id = ?2",
            params![location.to_string_lossy(), id],
        )?;
        tx.commit()?;
        Ok(id.to_string())
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        start_time: i64,
        tags: &[RunTag],
    ) -> Result<RunInfo, MlError> {
        let mut conn = self.conn()?;
        let exp_id: i64 = experiment_id
            .parse()
            .map_err(|_| MlError::invalid_input(format!("bad experiment id '{experiment_id}'")))?;
        let location: Option<String> = conn
            .query_row(
                "SELECT artifact_location FROM experiments WHERE experiment_id = ?1",
                params![exp_id],
                |row| row.get(0),
            )
            .optional()?;
        let location =
            location.ok_or_else(|| MlError::not_found(format!("experiment {experiment_id}")))?;

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let artifact_uri = format!("{location}/{run_id}/artifacts");

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO runs (run_uuid, experiment_id, name, status, start_time, artifact_uri)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                exp_id,
                run_name,
                RunStatus::Running.as_str(),
                start_time,
                artifact_uri
            ],
        )?;
        for tag in tags {
            tx.execute(
                "INSERT OR REPLACE INTO tags (key, value, run_uuid) VALUES (?1, ?2, ?3)",
                params![tag.key, tag.value, run_id],
            )?;
        }
        tx.commit()?;

        Ok(RunInfo {
            run_id,
            experiment_id: experiment_id.to_string(),
            run_name: run_name.to_string(),
            status: RunStatus::Running,
            start_time,
            end_time: None,
            artifact_uri,
        })
    }

    async fn log_param(&self, run_id: &str, param: &Param) -> Result<(), MlError> {
        let conn = self.conn()?;
        Self::run_exists(&conn, run_id)?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT value FROM params WHERE key = ?1 AND run_uuid = ?2",
                params![param.key, run_id],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(old) if old == param.value => Ok(()),
            Some(old) => Err(MlError::invalid_input(format!(
                "param '{}' already logged as '{old}', refusing to change it to '{}'",
                param.key, param.value
            ))),
            None => {
                conn.execute(
                    "INSERT INTO params (key, value, run_uuid) VALUES (?1, ?2, ?3)",
                    params![param.key, param.value, run_id],
                )?;
                Ok(())
            }
        }
    }

    async fn log_metric(&self, run_id: &str, metric: &Metric) -> Result<(), MlError> {
        let conn = self.conn()?;
        Self::run_exists(&conn, run_id)?;
        conn.execute(
            "INSERT INTO metrics (key, value, timestamp, step, run_uuid) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![metric.key, metric.value, metric.timestamp, metric.step, run_id],
        )?;
        Ok(())
    }

    async fn set_tag(&self, run_id: &str, tag: &RunTag) -> Result<(), MlError> {
        let conn = self.conn()?;
        Self::run_exists(&conn, run_id)?;
        conn.execute(
            "INSERT OR REPLACE INTO tags (key, value, run_uuid) VALUES (?1, ?2, ?3)",
            params![tag.key, tag.value, run_id],
        )?;
        Ok(())
    }

    async fn update_run(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<i64>,
    ) -> Result<(), MlError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE runs SET status = ?1, end_time = COALESCE(?2, end_time) WHERE run_uuid = ?3",
            params![status.as_str(), end_time, run_id],
        )?;
        if changed == 0 {
            return Err(MlError::not_found(format!("run {run_id}")));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, MlError> {
        let conn = self.conn()?;
        let info = conn
            .query_row(
                "SELECT run_uuid, experiment_id, name, status, start_time, end_time, artifact_uri
                 FROM runs WHERE run_uuid = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| MlError::not_found(format!("run {run_id}")))?;
        let info = RunInfo {
            run_id: info.0,
            experiment_id: info.1.to_string(),
            run_name: info.2,
            status: info.3.parse()?,
            start_time: info.4,
            end_time: info.5,
            artifact_uri: info.6,
        };

        let mut data = RunData::default();

        let mut stmt = conn.prepare("SELECT key, value FROM params WHERE run_uuid = ?1")?;
        let rows = stmt.query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        for row in rows {
            let (k, v): (String, String) = row?;
            data.params.insert(k, v);
        }

        let mut stmt = conn.prepare("SELECT key, value FROM tags WHERE run_uuid = ?1")?;
        let rows = stmt.query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        for row in rows {
            let (k, v): (String, String) = row?;
            data.tags.insert(k, v);
        }

        // Latest observation wins: ordered so later rows overwrite earlier ones.
        let mut stmt = conn.prepare(
            "SELECT key, value, timestamp, step FROM metrics WHERE run_uuid = ?1
             ORDER BY step, timestamp, rowid",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(Metric {
                key: row.get(0)?,
                value: row.get(1)?,
                timestamp: row.get(2)?,
                step: row.get(3)?,
            })
        })?;
        for row in rows {
            let metric = row?;
            data.metrics.insert(metric.key.clone(), metric);
        }

        Ok(Run { info, data })
    }
}
