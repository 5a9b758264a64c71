//! `forge-postgres` — the Postgres adapter for `forge_core::store::Store`
//! (C1), over `sqlx::PgPool`. Queries use runtime-checked `sqlx::query`/
//! `query_as` rather than the `query!` macro family, so the crate builds
//! without a live database at compile time — the same pattern the pack
//! uses wherever it needs sqlx without `DATABASE_URL` set at build time.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use forge_core::error::{ForgeError, ForgeResult};
use forge_core::model::{
    PhaseStatus, Priority, Project, ProjectStatus, RegistrationToken, Task, TaskState,
    TransitionRecord, Worker,
};
use forge_core::store::{validate_project_batch, CasOutcome, ProjectBatch, Store};

impl From<sqlx::Error> for ForgeError {
    fn from(err: sqlx::Error) -> Self {
        ForgeError::StoreUnavailable(err.to_string())
    }
}

/// `Store` over a Postgres pool. Connection and serialization failures
/// surface as `ForgeError::StoreUnavailable` via the `From<sqlx::Error>`
/// impl above, per spec §4.1.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> ForgeResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled migrations. Called once at `forge-server` startup.
    pub async fn migrate(&self) -> ForgeResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ForgeError::StoreUnavailable(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_enum<T: FromStr>(raw: &str, kind: &'static str) -> ForgeResult<T> {
    raw.parse()
        .map_err(|_| ForgeError::Other(anyhow::anyhow!("invalid {kind}: {raw}")))
}

impl FromStr for TaskState {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "waiting" => TaskState::Waiting,
            "ready" => TaskState::Ready,
            "queued" => TaskState::Queued,
            "in_progress" => TaskState::InProgress,
            "review" => TaskState::Review,
            "done" => TaskState::Done,
            "rejected" => TaskState::Rejected,
            "blocked" => TaskState::Blocked,
            _ => return Err(()),
        })
    }
}

impl FromStr for Priority {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "low" => Priority::Low,
            "medium" => Priority::Medium,
            "high" => Priority::High,
            "critical" => Priority::Critical,
            _ => return Err(()),
        })
    }
}

impl FromStr for ProjectStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "design" => ProjectStatus::Design,
            "active" => ProjectStatus::Active,
            "paused" => ProjectStatus::Paused,
            "completed" => ProjectStatus::Completed,
            _ => return Err(()),
        })
    }
}

impl FromStr for PhaseStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "pending" => PhaseStatus::Pending,
            "active" => PhaseStatus::Active,
            "completed" => PhaseStatus::Completed,
            _ => return Err(()),
        })
    }
}

#[derive(FromRow)]
struct ProjectRow {
    id: Uuid,
    name: String,
    description: String,
    repo_path: String,
    status: String,
    max_in_flight: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProjectRow {
    fn into_domain(self) -> ForgeResult<Project> {
        Ok(Project {
            id: self.id,
            name: self.name,
            description: self.description,
            repo_path: self.repo_path,
            status: parse_enum(&self.status, "project status")?,
            max_in_flight: self.max_in_flight as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct TaskRow {
    id: Uuid,
    project_id: Uuid,
    phase_id: Uuid,
    title: String,
    description: String,
    priority: String,
    status: String,
    version: i64,
    worker_prompt: serde_json::Value,
    qa_prompt: serde_json::Value,
    assigned_worker_id: Option<Uuid>,
    reviewer_id: Option<Uuid>,
    branch_name: Option<String>,
    commit_hash: Option<String>,
    qa_result: Option<serde_json::Value>,
    output_path: Option<String>,
    error_message: Option<String>,
    assignment_message_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn into_domain(self, depends_on: std::collections::BTreeSet<Uuid>) -> ForgeResult<Task> {
        Ok(Task {
            id: self.id,
            project_id: self.project_id,
            phase_id: self.phase_id,
            title: self.title,
            description: self.description,
            priority: parse_enum(&self.priority, "priority")?,
            status: parse_enum(&self.status, "task status")?,
            version: self.version,
            depends_on,
            worker_prompt: self.worker_prompt,
            qa_prompt: self.qa_prompt,
            assigned_worker_id: self.assigned_worker_id,
            reviewer_id: self.reviewer_id,
            branch_name: self.branch_name,
            commit_hash: self.commit_hash,
            qa_result: self.qa_result,
            output_path: self.output_path,
            error_message: self.error_message,
            assignment_message_id: self.assignment_message_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(FromRow)]
struct WorkerRow {
    id: Uuid,
    display_name: String,
    platform: String,
    executor: String,
    capabilities: serde_json::Value,
    secret_hash: String,
    registered_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    current_task_id: Option<Uuid>,
}

impl From<WorkerRow> for Worker {
    fn from(r: WorkerRow) -> Self {
        Worker {
            id: r.id,
            display_name: r.display_name,
            platform: r.platform,
            executor: r.executor,
            capabilities: r.capabilities,
            secret_hash: r.secret_hash,
            registered_at: r.registered_at,
            last_heartbeat: r.last_heartbeat,
            current_task_id: r.current_task_id,
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_project_batch(&self, batch: ProjectBatch) -> ForgeResult<()> {
        validate_project_batch(&batch)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO projects (id, name, description, repo_path, status, max_in_flight, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(batch.project.id)
        .bind(&batch.project.name)
        .bind(&batch.project.description)
        .bind(&batch.project.repo_path)
        .bind(batch.project.status.to_string())
        .bind(batch.project.max_in_flight as i32)
        .bind(batch.project.created_at)
        .bind(batch.project.updated_at)
        .execute(&mut *tx)
        .await?;

        for phase in &batch.phases {
            sqlx::query(
                "INSERT INTO phases (id, project_id, ordinal, name, description, branch_name, status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(phase.id)
            .bind(phase.project_id)
            .bind(phase.ordinal)
            .bind(&phase.name)
            .bind(&phase.description)
            .bind(&phase.branch_name)
            .bind(match phase.status {
                PhaseStatus::Pending => "pending",
                PhaseStatus::Active => "active",
                PhaseStatus::Completed => "completed",
            })
            .execute(&mut *tx)
            .await?;
        }

        for task in &batch.tasks {
            sqlx::query(
                "INSERT INTO tasks (id, project_id, phase_id, title, description, priority, status,
                                     version, worker_prompt, qa_prompt, assigned_worker_id, reviewer_id,
                                     branch_name, commit_hash, qa_result, output_path, error_message,
                                     assignment_message_id, created_at, updated_at, started_at, completed_at)
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22)",
            )
            .bind(task.id)
            .bind(task.project_id)
            .bind(task.phase_id)
            .bind(&task.title)
            .bind(&task.description)
            .bind(priority_str(task.priority))
            .bind(task.status.to_string())
            .bind(task.version)
            .bind(&task.worker_prompt)
            .bind(&task.qa_prompt)
            .bind(task.assigned_worker_id)
            .bind(task.reviewer_id)
            .bind(&task.branch_name)
            .bind(&task.commit_hash)
            .bind(&task.qa_result)
            .bind(&task.output_path)
            .bind(&task.error_message)
            .bind(&task.assignment_message_id)
            .bind(task.created_at)
            .bind(task.updated_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .execute(&mut *tx)
            .await?;

            for dep in &task.depends_on {
                sqlx::query(
                    "INSERT INTO task_deps (task_id, depends_on_id) VALUES ($1, $2)",
                )
                .bind(task.id)
                .bind(dep)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_project(&self, id: Uuid) -> ForgeResult<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ProjectRow::into_domain).transpose()
    }

    async fn set_project_status(&self, id: Uuid, status: ProjectStatus) -> ForgeResult<()> {
        let result = sqlx::query(
            "UPDATE projects SET status = $1, updated_at = now() WHERE id = $2",
        )
        .bind(status.to_string())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::NotFound { kind: "project", id });
        }
        Ok(())
    }

    async fn list_projects_by_status(&self, status: ProjectStatus) -> ForgeResult<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE status = $1")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ProjectRow::into_domain).collect()
    }

    async fn get_task(&self, id: Uuid) -> ForgeResult<Option<Task>> {
        let Some(row) = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let deps = self.dependency_ids(id).await?;
        Ok(Some(row.into_domain(deps)?))
    }

    async fn list_tasks(&self, project_id: Uuid) -> ForgeResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE project_id = $1")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        self.hydrate_tasks(rows).await
    }

    async fn list_tasks_by_status(
        &self,
        project_id: Uuid,
        statuses: &[TaskState],
    ) -> ForgeResult<Vec<Task>> {
        let status_strs: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE project_id = $1 AND status = ANY($2)",
        )
        .bind(project_id)
        .bind(&status_strs)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_tasks(rows).await
    }

    async fn count_by_status(
        &self,
        project_id: Uuid,
    ) -> ForgeResult<HashMap<TaskState, i64>> {
        let rows = sqlx::query(
            "SELECT status, count(*) AS n FROM tasks WHERE project_id = $1 GROUP BY status",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(parse_enum(&status, "task status")?, n);
        }
        Ok(counts)
    }

    async fn get_dependency_statuses(&self, task_id: Uuid) -> ForgeResult<Vec<(Uuid, TaskState)>> {
        let rows = sqlx::query(
            "SELECT t.id, t.status FROM task_deps d
             JOIN tasks t ON t.id = d.depends_on_id
             WHERE d.task_id = $1",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let id: Uuid = row.try_get("id")?;
                let status: String = row.try_get("status")?;
                Ok((id, parse_enum(&status, "task status")?))
            })
            .collect()
    }

    async fn compare_and_set_task(
        &self,
        mutated_task: &Task,
        record: &TransitionRecord,
        expected_version: i64,
    ) -> ForgeResult<CasOutcome> {
        let mut tx = self.pool.begin().await?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(mutated_task.id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(current_version) = current_version else {
            return Ok(CasOutcome::NotFound);
        };
        if current_version != expected_version {
            return Ok(CasOutcome::VersionMismatch {
                current: current_version,
            });
        }

        sqlx::query(
            "UPDATE tasks SET status = $1, version = $2, assigned_worker_id = $3, reviewer_id = $4,
                               branch_name = $5, commit_hash = $6, qa_result = $7, output_path = $8,
                               error_message = $9, assignment_message_id = $10, updated_at = $11,
                               started_at = $12, completed_at = $13
             WHERE id = $14 AND version = $15",
        )
        .bind(mutated_task.status.to_string())
        .bind(mutated_task.version)
        .bind(mutated_task.assigned_worker_id)
        .bind(mutated_task.reviewer_id)
        .bind(&mutated_task.branch_name)
        .bind(&mutated_task.commit_hash)
        .bind(&mutated_task.qa_result)
        .bind(&mutated_task.output_path)
        .bind(&mutated_task.error_message)
        .bind(&mutated_task.assignment_message_id)
        .bind(mutated_task.updated_at)
        .bind(mutated_task.started_at)
        .bind(mutated_task.completed_at)
        .bind(mutated_task.id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO transitions (id, task_id, from_status, to_status, actor, reason, at, stream_message_id)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(record.id)
        .bind(record.task_id)
        .bind(record.from.to_string())
        .bind(record.to.to_string())
        .bind(record.actor.to_string())
        .bind(&record.reason)
        .bind(record.at)
        .bind(&record.stream_message_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CasOutcome::Applied)
    }

    async fn list_transitions(&self, task_id: Uuid) -> ForgeResult<Vec<TransitionRecord>> {
        let rows = sqlx::query(
            "SELECT id, task_id, from_status, to_status, actor, reason, at, stream_message_id
             FROM transitions WHERE task_id = $1 ORDER BY at ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let from: String = row.try_get("from_status")?;
                let to: String = row.try_get("to_status")?;
                let actor: String = row.try_get("actor")?;
                Ok(TransitionRecord {
                    id: row.try_get("id")?,
                    task_id: row.try_get("task_id")?,
                    from: parse_enum(&from, "task status")?,
                    to: parse_enum(&to, "task status")?,
                    actor: parse_actor(&actor),
                    reason: row.try_get("reason")?,
                    at: row.try_get("at")?,
                    stream_message_id: row.try_get("stream_message_id")?,
                })
            })
            .collect()
    }

    async fn create_registration_token(&self, token: RegistrationToken) -> ForgeResult<()> {
        sqlx::query(
            "INSERT INTO registration_tokens (token, display_name, created_at, expires_at, revoked, consumed_by)
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&token.token)
        .bind(&token.display_name)
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(token.revoked)
        .bind(token.consumed_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_registration_token(&self, token: &str) -> ForgeResult<Option<RegistrationToken>> {
        let row = sqlx::query(
            "SELECT token, display_name, created_at, expires_at, revoked, consumed_by
             FROM registration_tokens WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(RegistrationToken {
                token: row.try_get("token")?,
                display_name: row.try_get("display_name")?,
                created_at: row.try_get("created_at")?,
                expires_at: row.try_get("expires_at")?,
                revoked: row.try_get("revoked")?,
                consumed_by: row.try_get("consumed_by")?,
            })
        })
        .transpose()
    }

    async fn consume_registration_token(&self, token: &str, worker_id: Uuid) -> ForgeResult<bool> {
        let result = sqlx::query(
            "UPDATE registration_tokens SET consumed_by = $1
             WHERE token = $2 AND consumed_by IS NULL AND revoked = false",
        )
        .bind(worker_id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert_worker(&self, worker: Worker) -> ForgeResult<()> {
        sqlx::query(
            "INSERT INTO workers (id, display_name, platform, executor, capabilities, secret_hash,
                                    registered_at, last_heartbeat, current_task_id)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
             ON CONFLICT (id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                platform = EXCLUDED.platform,
                executor = EXCLUDED.executor,
                capabilities = EXCLUDED.capabilities,
                last_heartbeat = EXCLUDED.last_heartbeat,
                current_task_id = EXCLUDED.current_task_id",
        )
        .bind(worker.id)
        .bind(&worker.display_name)
        .bind(&worker.platform)
        .bind(&worker.executor)
        .bind(&worker.capabilities)
        .bind(&worker.secret_hash)
        .bind(worker.registered_at)
        .bind(worker.last_heartbeat)
        .bind(worker.current_task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_worker(&self, id: Uuid) -> ForgeResult<Option<Worker>> {
        let row = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Worker::from))
    }

    async fn list_workers(&self) -> ForgeResult<Vec<Worker>> {
        let rows = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Worker::from).collect())
    }

    async fn touch_worker_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> ForgeResult<()> {
        let result = sqlx::query("UPDATE workers SET last_heartbeat = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::NotFound { kind: "worker", id });
        }
        Ok(())
    }

    async fn set_worker_current_task(&self, id: Uuid, task_id: Option<Uuid>) -> ForgeResult<()> {
        let result = sqlx::query("UPDATE workers SET current_task_id = $1 WHERE id = $2")
            .bind(task_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::NotFound { kind: "worker", id });
        }
        Ok(())
    }
}

impl PgStore {
    async fn dependency_ids(&self, task_id: Uuid) -> ForgeResult<std::collections::BTreeSet<Uuid>> {
        let rows: Vec<Uuid> =
            sqlx::query_scalar("SELECT depends_on_id FROM task_deps WHERE task_id = $1")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn hydrate_tasks(&self, rows: Vec<TaskRow>) -> ForgeResult<Vec<Task>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let dep_rows = sqlx::query(
            "SELECT task_id, depends_on_id FROM task_deps WHERE task_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut deps_by_task: HashMap<Uuid, std::collections::BTreeSet<Uuid>> = HashMap::new();
        for row in dep_rows {
            let task_id: Uuid = row.try_get("task_id")?;
            let dep_id: Uuid = row.try_get("depends_on_id")?;
            deps_by_task.entry(task_id).or_default().insert(dep_id);
        }

        rows.into_iter()
            .map(|row| {
                let deps = deps_by_task.remove(&row.id).unwrap_or_default();
                row.into_domain(deps)
            })
            .collect()
    }
}

fn parse_actor(raw: &str) -> forge_core::model::Actor {
    use forge_core::model::Actor;
    if let Some(id) = raw.strip_prefix("worker:") {
        if let Ok(uuid) = Uuid::parse_str(id) {
            return Actor::Worker(uuid);
        }
    }
    match raw {
        "pm" => Actor::Pm,
        "user" => Actor::User,
        _ => Actor::System,
    }
}

fn priority_str(p: Priority) -> &'static str {
    match p {
        Priority::Low => "low",
        Priority::Medium => "medium",
        Priority::High => "high",
        Priority::Critical => "critical",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_round_trips_through_strings() {
        for state in [
            TaskState::Waiting,
            TaskState::Ready,
            TaskState::Queued,
            TaskState::InProgress,
            TaskState::Review,
            TaskState::Done,
            TaskState::Rejected,
            TaskState::Blocked,
        ] {
            let parsed: TaskState = parse_enum(&state.to_string(), "task status").unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn actor_round_trips() {
        let worker_id = Uuid::new_v4();
        let actor = forge_core::model::Actor::Worker(worker_id);
        let parsed = parse_actor(&actor.to_string());
        assert_eq!(parsed, actor);
    }
}
