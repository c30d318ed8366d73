//! Persistent scheduler store backed by SQLite.

use chrono::{DateTime, SecondsFormat, Utc};

use async_trait::async_trait;

use super::{validate_run_insert, validate_schedule, RunQuery, SchedulerStore};
use crate::types::{
    Field, Run, RunId, RunPatch, RunStatus, Schedule, ScheduleId, SchedulePatch, StoreError,
    Violations, CONVERSATION_KIND_SCHEDULED,
};

const SCHEDULE_COLUMNS: &str = "id, name, agent_ref, model_override, enabled, kind, cron_expr, \
     interval_seconds, timezone, start_at, end_at, timeout_seconds, task_prompt, \
     task_prompt_uri, visibility, created_by_user_id, user_cred_url, next_run_at, \
     last_run_at, last_status, last_error, lease_owner, lease_until, created_at, updated_at";

const RUN_COLUMNS: &str = "id, schedule_id, scheduled_for, status, started_at, completed_at, \
     error_message, conversation_id, conversation_kind, lease_owner, lease_until, \
     created_at, updated_at";

/// SQLite-backed store for schedules and runs.
pub struct SqliteSchedulerStore {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl SqliteSchedulerStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn =
            rusqlite::Connection::open(path).map_err(|e| StoreError::Sqlite(e.to_string()))?;

        // WAL mode for concurrent access.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Open an in-memory store (useful for tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Default database path: `$XDG_DATA_HOME/agently/scheduler.db`
    pub fn default_path() -> std::path::PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        base.join("agently").join("scheduler.db")
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);

            CREATE TABLE IF NOT EXISTS schedules (
                id                 TEXT PRIMARY KEY,
                name               TEXT NOT NULL,
                agent_ref          TEXT NOT NULL,
                model_override     TEXT,
                enabled            INTEGER NOT NULL DEFAULT 1,
                kind               TEXT NOT NULL,
                cron_expr          TEXT,
                interval_seconds   INTEGER,
                timezone           TEXT,
                start_at           TEXT,
                end_at             TEXT,
                timeout_seconds    INTEGER NOT NULL DEFAULT 0,
                task_prompt        TEXT,
                task_prompt_uri    TEXT,
                visibility         TEXT NOT NULL DEFAULT 'public',
                created_by_user_id TEXT,
                user_cred_url      TEXT,
                next_run_at        TEXT,
                last_run_at        TEXT,
                last_status        TEXT,
                last_error         TEXT,
                lease_owner        TEXT,
                lease_until        TEXT,
                created_at         TEXT NOT NULL,
                updated_at         TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                id                TEXT PRIMARY KEY,
                schedule_id       TEXT NOT NULL,
                scheduled_for     TEXT NOT NULL,
                status            TEXT NOT NULL DEFAULT 'pending',
                started_at        TEXT,
                completed_at      TEXT,
                error_message     TEXT,
                conversation_id   TEXT,
                conversation_kind TEXT NOT NULL DEFAULT 'scheduled',
                lease_owner       TEXT,
                lease_until       TEXT,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL,
                FOREIGN KEY (schedule_id) REFERENCES schedules(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_schedules_next_run_at ON schedules(next_run_at);
            CREATE INDEX IF NOT EXISTS idx_runs_schedule_id ON runs(schedule_id);
            CREATE INDEX IF NOT EXISTS idx_runs_schedule_slot ON runs(schedule_id, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_runs_conversation_id ON runs(conversation_id);",
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for SqliteSchedulerStore {
    async fn get_schedule(&self, id: &ScheduleId) -> Result<Option<Schedule>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"
            ))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let result = stmt
            .query_row(rusqlite::params![id.to_string()], row_to_schedule)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        match result {
            Some(Ok(schedule)) => Ok(Some(schedule)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at, id"
            ))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_schedule)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        collect_rows(rows)
    }

    async fn list_schedules_for_user(&self, user_id: &str) -> Result<Vec<Schedule>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules
                 WHERE visibility = 'public' OR created_by_user_id = ?1
                 ORDER BY created_at, id"
            ))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![user_id], row_to_schedule)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        collect_rows(rows)
    }

    async fn put_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let violations = validate_schedule(schedule);
        if !violations.is_empty() {
            return Err(StoreError::Validation(Violations(violations)));
        }
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO schedules ({SCHEDULE_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25)"
            ),
            rusqlite::params![
                schedule.id.to_string(),
                schedule.name,
                schedule.agent_ref,
                schedule.model_override,
                schedule.enabled as i32,
                schedule.kind.to_string(),
                schedule.cron_expr,
                schedule.interval_seconds.map(|v| v as i64),
                schedule.timezone,
                opt_ts(&schedule.start_at),
                opt_ts(&schedule.end_at),
                schedule.timeout_seconds as i64,
                schedule.task_prompt,
                schedule.task_prompt_uri,
                schedule.visibility.to_string(),
                schedule.created_by_user_id,
                schedule.user_cred_url,
                opt_ts(&schedule.next_run_at),
                opt_ts(&schedule.last_run_at),
                schedule.last_status.map(|s| s.to_string()),
                schedule.last_error,
                schedule.lease_owner,
                opt_ts(&schedule.lease_until),
                ts(&schedule.created_at),
                ts(&schedule.updated_at),
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn patch_schedule(&self, patch: &SchedulePatch) -> Result<(), StoreError> {
        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql + Send>> = Vec::new();

        mask_bool(&mut sets, &mut params, "enabled", &patch.enabled);
        mask_ts(&mut sets, &mut params, "next_run_at", &patch.next_run_at);
        mask_ts(&mut sets, &mut params, "last_run_at", &patch.last_run_at);
        mask_text(
            &mut sets,
            &mut params,
            "last_status",
            &status_field(&patch.last_status),
        );
        mask_text(&mut sets, &mut params, "last_error", &patch.last_error);
        mask_text(
            &mut sets,
            &mut params,
            "created_by_user_id",
            &patch.created_by_user_id,
        );

        sets.push("updated_at = ?".to_string());
        params.push(Box::new(ts(&Utc::now())));
        params.push(Box::new(patch.id.to_string()));

        let sql = format!("UPDATE schedules SET {} WHERE id = ?", sets.join(", "));
        let conn = self.conn.lock().await;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref() as &dyn rusqlite::types::ToSql).collect();
        let rows = conn
            .execute(&sql, param_refs.as_slice())
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::ScheduleNotFound(patch.id));
        }
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![id.to_string()], row_to_run)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        match result {
            Some(Ok(run)) => Ok(Some(run)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<Run>, StoreError> {
        let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE schedule_id = ?");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql + Send>> =
            vec![Box::new(query.schedule_id.to_string())];
        if let Some(slot) = query.scheduled_for {
            sql.push_str(" AND scheduled_for = ?");
            params.push(Box::new(ts(&slot)));
        }
        if !query.status_not_in.is_empty() {
            let placeholders = vec!["?"; query.status_not_in.len()].join(",");
            sql.push_str(&format!(" AND status NOT IN ({placeholders})"));
            for status in &query.status_not_in {
                params.push(Box::new(status.to_string()));
            }
        }
        sql.push_str(" ORDER BY created_at, id");

        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref() as &dyn rusqlite::types::ToSql).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), row_to_run)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        collect_rows(rows)
    }

    async fn find_run_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Run>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE conversation_id = ?1
                 ORDER BY created_at DESC, id LIMIT 1"
            ))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![conversation_id], row_to_run)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        match result {
            Some(Ok(run)) => Ok(Some(run)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn patch_run(&self, patch: &RunPatch) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM runs WHERE id = ?1)",
                rusqlite::params![patch.id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        if !exists {
            let violations = validate_run_insert(patch);
            let (schedule_id, scheduled_for) =
                match (patch.schedule_id, patch.scheduled_for.value().copied()) {
                    (Some(sid), Some(slot)) if violations.is_empty() => (sid, slot),
                    _ => return Err(StoreError::Validation(Violations(violations))),
                };
            let status = patch.status.value().copied().unwrap_or_default();
            let kind = patch
                .conversation_kind
                .value()
                .cloned()
                .unwrap_or_else(|| CONVERSATION_KIND_SCHEDULED.to_string());
            let now = ts(&Utc::now());
            conn.execute(
                &format!(
                    "INSERT INTO runs ({RUN_COLUMNS})
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,NULL,NULL,?10,?11)"
                ),
                rusqlite::params![
                    patch.id.to_string(),
                    schedule_id.to_string(),
                    ts(&scheduled_for),
                    status.to_string(),
                    patch.started_at.value().map(ts),
                    patch.completed_at.value().map(ts),
                    patch.error_message.value(),
                    patch.conversation_id.value(),
                    kind,
                    now,
                    now,
                ],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
            return Ok(());
        }

        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql + Send>> = Vec::new();
        mask_text(
            &mut sets,
            &mut params,
            "status",
            &status_field(&patch.status),
        );
        mask_ts(&mut sets, &mut params, "scheduled_for", &patch.scheduled_for);
        mask_ts(&mut sets, &mut params, "started_at", &patch.started_at);
        mask_ts(&mut sets, &mut params, "completed_at", &patch.completed_at);
        mask_text(&mut sets, &mut params, "error_message", &patch.error_message);
        mask_text(
            &mut sets,
            &mut params,
            "conversation_id",
            &patch.conversation_id,
        );
        mask_text(
            &mut sets,
            &mut params,
            "conversation_kind",
            &patch.conversation_kind,
        );
        sets.push("updated_at = ?".to_string());
        params.push(Box::new(ts(&Utc::now())));
        params.push(Box::new(patch.id.to_string()));

        let sql = format!("UPDATE runs SET {} WHERE id = ?", sets.join(", "));
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref() as &dyn rusqlite::types::ToSql).collect();
        let rows = conn
            .execute(&sql, param_refs.as_slice())
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::RunNotFound(patch.id));
        }
        Ok(())
    }

    async fn try_claim_schedule(
        &self,
        id: &ScheduleId,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE schedules SET lease_owner = ?1, lease_until = ?2
                 WHERE id = ?3
                   AND (lease_owner IS NULL OR lease_until < ?4 OR lease_owner = ?1)",
                rusqlite::params![owner, ts(&until), id.to_string(), ts(&Utc::now())],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(rows > 0)
    }

    async fn release_schedule_lease(
        &self,
        id: &ScheduleId,
        owner: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE schedules SET lease_owner = NULL, lease_until = NULL
                 WHERE id = ?1 AND lease_owner = ?2",
                rusqlite::params![id.to_string(), owner],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(rows > 0)
    }

    async fn try_claim_run(
        &self,
        id: &RunId,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE runs SET lease_owner = ?1, lease_until = ?2
                 WHERE id = ?3
                   AND (lease_owner IS NULL OR lease_until < ?4 OR lease_owner = ?1)",
                rusqlite::params![owner, ts(&until), id.to_string(), ts(&Utc::now())],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(rows > 0)
    }

    async fn release_run_lease(&self, id: &RunId, owner: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE runs SET lease_owner = NULL, lease_until = NULL
                 WHERE id = ?1 AND lease_owner = ?2",
                rusqlite::params![id.to_string(), owner],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(rows > 0)
    }
}

// ── Timestamp helpers ─────────────────────────────────────────────────

/// Fixed-precision UTC text so lexicographic order matches time order.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(t: &Option<DateTime<Utc>>) -> Option<String> {
    t.as_ref().map(ts)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| parse_ts(&s)).transpose()
}

// ── Masked-update helpers ─────────────────────────────────────────────

fn mask_text(
    sets: &mut Vec<String>,
    params: &mut Vec<Box<dyn rusqlite::types::ToSql + Send>>,
    column: &str,
    field: &Field<String>,
) {
    match field {
        Field::Keep => {}
        Field::Clear => sets.push(format!("{column} = NULL")),
        Field::Set(v) => {
            sets.push(format!("{column} = ?"));
            params.push(Box::new(v.clone()));
        }
    }
}

fn mask_ts(
    sets: &mut Vec<String>,
    params: &mut Vec<Box<dyn rusqlite::types::ToSql + Send>>,
    column: &str,
    field: &Field<DateTime<Utc>>,
) {
    match field {
        Field::Keep => {}
        Field::Clear => sets.push(format!("{column} = NULL")),
        Field::Set(v) => {
            sets.push(format!("{column} = ?"));
            params.push(Box::new(ts(v)));
        }
    }
}

fn mask_bool(
    sets: &mut Vec<String>,
    params: &mut Vec<Box<dyn rusqlite::types::ToSql + Send>>,
    column: &str,
    field: &Field<bool>,
) {
    match field {
        Field::Keep => {}
        Field::Clear => sets.push(format!("{column} = NULL")),
        Field::Set(v) => {
            sets.push(format!("{column} = ?"));
            params.push(Box::new(*v as i32));
        }
    }
}

fn status_field(field: &Field<RunStatus>) -> Field<String> {
    match field {
        Field::Keep => Field::Keep,
        Field::Clear => Field::Clear,
        Field::Set(s) => Field::Set(s.to_string()),
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Schedule, StoreError>> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let agent_ref: String = row.get(2)?;
    let model_override: Option<String> = row.get(3)?;
    let enabled: i32 = row.get(4)?;
    let kind_str: String = row.get(5)?;
    let cron_expr: Option<String> = row.get(6)?;
    let interval_seconds: Option<i64> = row.get(7)?;
    let timezone: Option<String> = row.get(8)?;
    let start_str: Option<String> = row.get(9)?;
    let end_str: Option<String> = row.get(10)?;
    let timeout_seconds: i64 = row.get(11)?;
    let task_prompt: Option<String> = row.get(12)?;
    let task_prompt_uri: Option<String> = row.get(13)?;
    let visibility_str: String = row.get(14)?;
    let created_by_user_id: Option<String> = row.get(15)?;
    let user_cred_url: Option<String> = row.get(16)?;
    let next_run_str: Option<String> = row.get(17)?;
    let last_run_str: Option<String> = row.get(18)?;
    let last_status_str: Option<String> = row.get(19)?;
    let last_error: Option<String> = row.get(20)?;
    let lease_owner: Option<String> = row.get(21)?;
    let lease_until_str: Option<String> = row.get(22)?;
    let created_str: String = row.get(23)?;
    let updated_str: String = row.get(24)?;

    Ok((|| -> Result<Schedule, StoreError> {
        Ok(Schedule {
            id: id_str
                .parse()
                .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?,
            name,
            agent_ref,
            model_override,
            enabled: enabled != 0,
            kind: kind_str.parse().map_err(StoreError::Serialization)?,
            cron_expr,
            interval_seconds: interval_seconds.map(|v| v as u64),
            timezone,
            start_at: parse_opt_ts(start_str)?,
            end_at: parse_opt_ts(end_str)?,
            timeout_seconds: timeout_seconds as u64,
            task_prompt,
            task_prompt_uri,
            visibility: visibility_str.parse().map_err(StoreError::Serialization)?,
            created_by_user_id,
            user_cred_url,
            next_run_at: parse_opt_ts(next_run_str)?,
            last_run_at: parse_opt_ts(last_run_str)?,
            last_status: last_status_str
                .map(|s| s.parse().map_err(StoreError::Serialization))
                .transpose()?,
            last_error,
            lease_owner,
            lease_until: parse_opt_ts(lease_until_str)?,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
        })
    })())
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Run, StoreError>> {
    let id_str: String = row.get(0)?;
    let schedule_id_str: String = row.get(1)?;
    let scheduled_for_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let started_str: Option<String> = row.get(4)?;
    let completed_str: Option<String> = row.get(5)?;
    let error_message: Option<String> = row.get(6)?;
    let conversation_id: Option<String> = row.get(7)?;
    let conversation_kind: String = row.get(8)?;
    let lease_owner: Option<String> = row.get(9)?;
    let lease_until_str: Option<String> = row.get(10)?;
    let created_str: String = row.get(11)?;
    let updated_str: String = row.get(12)?;

    Ok((|| -> Result<Run, StoreError> {
        Ok(Run {
            id: id_str
                .parse()
                .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?,
            schedule_id: schedule_id_str
                .parse()
                .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?,
            scheduled_for: parse_ts(&scheduled_for_str)?,
            status: status_str.parse().map_err(StoreError::Serialization)?,
            started_at: parse_opt_ts(started_str)?,
            completed_at: parse_opt_ts(completed_str)?,
            error_message,
            conversation_id,
            conversation_kind,
            lease_owner,
            lease_until: parse_opt_ts(lease_until_str)?,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
        })
    })())
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<Result<T, StoreError>>>,
) -> Result<Vec<T>, StoreError> {
    let mut items = Vec::new();
    for row_result in rows {
        let inner = row_result.map_err(|e| StoreError::Sqlite(e.to_string()))?;
        items.push(inner?);
    }
    Ok(items)
}

/// Extension trait so we can use `optional()` on rusqlite queries.
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
