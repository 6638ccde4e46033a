//! SQLite job store.

use crate::error::StoreError;
use crate::store::{JobStore, SessionStore, apply_stop};
use async_trait::async_trait;
use jobmon_core::{Job, JobFilter, MetricConfig, MetricSummary, StopJob, Tag};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeSet;
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_metadata (
  id INTEGER PRIMARY KEY,
  user_id INTEGER NOT NULL,
  user_name TEXT NOT NULL,
  group_id INTEGER NOT NULL,
  group_name TEXT NOT NULL,
  cluster_id TEXT NOT NULL,
  num_nodes INTEGER NOT NULL,
  num_tasks INTEGER NOT NULL,
  tasks_per_node INTEGER NOT NULL,
  gpus_per_node INTEGER NOT NULL,
  node_list TEXT NOT NULL,
  start_time INTEGER NOT NULL,
  stop_time INTEGER NOT NULL,
  is_running INTEGER NOT NULL,
  job_name TEXT NOT NULL,
  account TEXT NOT NULL,
  ttl INTEGER NOT NULL,
  partition TEXT NOT NULL,
  job_script TEXT NOT NULL,
  exit_code INTEGER NOT NULL,
  has_summaries INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_job_metadata_user_name ON job_metadata(user_name);
CREATE INDEX IF NOT EXISTS idx_job_metadata_running ON job_metadata(is_running, partition);

CREATE TABLE IF NOT EXISTS job_tags (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  type TEXT NOT NULL,
  created_by TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_to_tags (
  job_id INTEGER NOT NULL REFERENCES job_metadata(id) ON DELETE CASCADE,
  tag_id INTEGER NOT NULL REFERENCES job_tags(id) ON DELETE CASCADE,
  PRIMARY KEY (job_id, tag_id)
);

CREATE TABLE IF NOT EXISTS nodes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  hostname TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS job_to_nodes (
  job_id INTEGER NOT NULL REFERENCES job_metadata(id) ON DELETE CASCADE,
  node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
  position INTEGER NOT NULL,
  PRIMARY KEY (job_id, node_id)
);

CREATE TABLE IF NOT EXISTS metric_configs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  guid TEXT NOT NULL UNIQUE,
  config TEXT NOT NULL -- JSON
);

CREATE TABLE IF NOT EXISTS job_metric_summaries (
  job_id INTEGER NOT NULL REFERENCES job_metadata(id) ON DELETE CASCADE,
  metric_id INTEGER NOT NULL REFERENCES metric_configs(id) ON DELETE CASCADE,
  position INTEGER NOT NULL,
  mean REAL NOT NULL,
  max REAL NOT NULL,
  change_points TEXT NOT NULL, -- JSON
  PRIMARY KEY (job_id, metric_id)
);

CREATE TABLE IF NOT EXISTS user_sessions (
  username TEXT PRIMARY KEY,
  token TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_roles (
  username TEXT PRIMARY KEY,
  roles TEXT NOT NULL -- JSON
);
"#;

const INSERT_JOB: &str = r#"
INSERT INTO job_metadata (
  id, user_id, user_name, group_id, group_name, cluster_id, num_nodes, num_tasks,
  tasks_per_node, gpus_per_node, node_list, start_time, stop_time, is_running,
  job_name, account, ttl, partition, job_script, exit_code, has_summaries
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
"#;

const UPDATE_JOB: &str = r#"
UPDATE job_metadata SET
  user_id = ?2, user_name = ?3, group_id = ?4, group_name = ?5, cluster_id = ?6,
  num_nodes = ?7, num_tasks = ?8, tasks_per_node = ?9, gpus_per_node = ?10,
  node_list = ?11, start_time = ?12, stop_time = ?13, is_running = ?14,
  job_name = ?15, account = ?16, ttl = ?17, partition = ?18, job_script = ?19,
  exit_code = ?20, has_summaries = ?21
WHERE id = ?1
"#;

const TAG_COLUMNS: &str = "t.id, t.name, t.type, t.created_by";

/// Job store in a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a file-backed database; `:memory:` opens a
    /// private in-memory one.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        if path == ":memory:" {
            return Self::open_memory().await;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        tracing::info!(path, "Opened SQLite job store");
        Ok(store)
    }

    pub async fn open_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        // the database lives as long as its only connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        if let Err(e) = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
        {
            tracing::warn!("Failed to enable WAL journal mode: {}", e);
        }
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn hydrate(&self, rows: Vec<SqliteRow>) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = row_to_job(&row)?;
            job.tags = self.tags_of(job.id).await?;
            if row.try_get::<bool, _>("has_summaries")? {
                job.summaries = Some(self.summaries_of(job.id).await?);
            }
            jobs.push(job);
        }
        Ok(jobs)
    }

    async fn tags_of(&self, id: i64) -> Result<Vec<Tag>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TAG_COLUMNS} FROM job_tags t \
             JOIN job_to_tags jt ON jt.tag_id = t.id \
             WHERE jt.job_id = ?1 ORDER BY t.id"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_tag).collect::<Result<_, _>>()?)
    }

    async fn summaries_of(&self, id: i64) -> Result<Vec<MetricSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT m.config, s.mean, s.max, s.change_points
            FROM job_metric_summaries s
            JOIN metric_configs m ON m.id = s.metric_id
            WHERE s.job_id = ?1
            ORDER BY s.position
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let config: String = row.try_get("config")?;
            let change_points: String = row.try_get("change_points")?;
            summaries.push(MetricSummary {
                config: serde_json::from_str::<MetricConfig>(&config)?,
                mean: row.try_get("mean")?,
                max: row.try_get("max")?,
                change_points: serde_json::from_str(&change_points)?,
            });
        }
        Ok(summaries)
    }

    async fn tag_rows(&self, sql: &str, first: &str, user: Option<&str>) -> Result<Vec<Tag>, StoreError> {
        let rows = sqlx::query(sql)
            .bind(first)
            .bind(user)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_tag).collect::<Result<_, _>>()?)
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job, sqlx::Error> {
    Ok(Job {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        user_name: row.try_get("user_name")?,
        group_id: row.try_get("group_id")?,
        group_name: row.try_get("group_name")?,
        cluster_id: row.try_get("cluster_id")?,
        num_nodes: row.try_get("num_nodes")?,
        num_tasks: row.try_get("num_tasks")?,
        tasks_per_node: row.try_get("tasks_per_node")?,
        gpus_per_node: row.try_get("gpus_per_node")?,
        node_list: row.try_get("node_list")?,
        start_time: row.try_get("start_time")?,
        stop_time: row.try_get("stop_time")?,
        is_running: row.try_get("is_running")?,
        job_name: row.try_get("job_name")?,
        account: row.try_get("account")?,
        ttl: row.try_get("ttl")?,
        partition: row.try_get("partition")?,
        job_script: row.try_get("job_script")?,
        exit_code: row.try_get("exit_code")?,
        tags: Vec::new(),
        summaries: None,
    })
}

fn row_to_tag(row: &SqliteRow) -> Result<Tag, sqlx::Error> {
    Ok(Tag {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: row.try_get("type")?,
        created_by: row.try_get("created_by")?,
    })
}

fn bind_job<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    job: &'q Job,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(job.id)
        .bind(job.user_id)
        .bind(&job.user_name)
        .bind(job.group_id)
        .bind(&job.group_name)
        .bind(&job.cluster_id)
        .bind(job.num_nodes)
        .bind(job.num_tasks)
        .bind(job.tasks_per_node)
        .bind(job.gpus_per_node)
        .bind(&job.node_list)
        .bind(job.start_time)
        .bind(job.stop_time)
        .bind(job.is_running)
        .bind(&job.job_name)
        .bind(&job.account)
        .bind(job.ttl)
        .bind(&job.partition)
        .bind(&job.job_script)
        .bind(job.exit_code)
        .bind(job.summaries.is_some())
}

/// Stored tag for `tag`, creating it if needed.
async fn resolve_tag(conn: &mut SqliteConnection, tag: Tag) -> Result<Tag, StoreError> {
    if tag.id == 0 {
        let existing = sqlx::query(
            "SELECT id, name, type, created_by FROM job_tags \
             WHERE name = ?1 AND type = ?2 AND created_by = ?3 ORDER BY id LIMIT 1",
        )
        .bind(&tag.name)
        .bind(&tag.kind)
        .bind(&tag.created_by)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = existing {
            return Ok(row_to_tag(&row)?);
        }
        let row = sqlx::query("INSERT INTO job_tags(name, type, created_by) VALUES (?1, ?2, ?3) RETURNING id")
            .bind(&tag.name)
            .bind(&tag.kind)
            .bind(&tag.created_by)
            .fetch_one(&mut *conn)
            .await?;
        return Ok(Tag {
            id: row.try_get("id")?,
            ..tag
        });
    }

    sqlx::query("INSERT OR IGNORE INTO job_tags(id, name, type, created_by) VALUES (?1, ?2, ?3, ?4)")
        .bind(tag.id)
        .bind(&tag.name)
        .bind(&tag.kind)
        .bind(&tag.created_by)
        .execute(&mut *conn)
        .await?;
    let row = sqlx::query("SELECT id, name, type, created_by FROM job_tags WHERE id = ?1")
        .bind(tag.id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row_to_tag(&row)?)
}

/// Rewrite the node, tag and summary rows of `job`.
async fn write_relations(conn: &mut SqliteConnection, job: &Job) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM job_to_nodes WHERE job_id = ?1")
        .bind(job.id)
        .execute(&mut *conn)
        .await?;
    for (position, node) in job.nodes().enumerate() {
        let row = sqlx::query(
            "INSERT INTO nodes(hostname) VALUES (?1) \
             ON CONFLICT(hostname) DO UPDATE SET hostname = excluded.hostname RETURNING id",
        )
        .bind(node)
        .fetch_one(&mut *conn)
        .await?;
        let node_id: i64 = row.try_get("id")?;
        sqlx::query("INSERT OR IGNORE INTO job_to_nodes(job_id, node_id, position) VALUES (?1, ?2, ?3)")
            .bind(job.id)
            .bind(node_id)
            .bind(position as i64)
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query("DELETE FROM job_to_tags WHERE job_id = ?1")
        .bind(job.id)
        .execute(&mut *conn)
        .await?;
    for tag in &job.tags {
        let tag = resolve_tag(&mut *conn, tag.clone()).await?;
        sqlx::query("INSERT OR IGNORE INTO job_to_tags(job_id, tag_id) VALUES (?1, ?2)")
            .bind(job.id)
            .bind(tag.id)
            .execute(&mut *conn)
            .await?;
    }

    write_summaries(conn, job.id, job.summaries.as_deref()).await
}

/// Rewrite the summary rows of job `id`.
async fn write_summaries(
    conn: &mut SqliteConnection,
    id: i64,
    summaries: Option<&[MetricSummary]>,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM job_metric_summaries WHERE job_id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    for (position, summary) in summaries.into_iter().flatten().enumerate() {
        let row = sqlx::query(
            "INSERT INTO metric_configs(guid, config) VALUES (?1, ?2) \
             ON CONFLICT(guid) DO UPDATE SET config = excluded.config RETURNING id",
        )
        .bind(&summary.config.guid)
        .bind(serde_json::to_string(&summary.config)?)
        .fetch_one(&mut *conn)
        .await?;
        let metric_id: i64 = row.try_get("id")?;
        sqlx::query(
            "INSERT OR REPLACE INTO job_metric_summaries(job_id, metric_id, position, mean, max, change_points) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id)
        .bind(metric_id)
        .bind(position as i64)
        .bind(summary.mean)
        .bind(summary.max)
        .bind(serde_json::to_string(&summary.change_points)?)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

fn push_range(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, range: Option<&jobmon_core::RangeFilter>) {
    let Some(range) = range else {
        return;
    };
    if let Some(from) = range.from {
        qb.push(format!(" AND {column} >= ")).push_bind(from);
    }
    if let Some(to) = range.to {
        qb.push(format!(" AND {column} <= ")).push_bind(to);
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn put_job(&self, job: Job) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM job_metadata WHERE id = ?1")
            .bind(job.id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if exists {
            return Err(StoreError::AlreadyExists(job.id));
        }
        bind_job(sqlx::query(INSERT_JOB), &job)
            .execute(&mut *tx)
            .await?;
        write_relations(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_job(&self, id: i64) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM job_metadata WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        self.hydrate(vec![row])
            .await?
            .pop()
            .ok_or(StoreError::NotFound(id))
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query("SELECT * FROM job_metadata ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        self.hydrate(rows).await
    }

    async fn get_filtered_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM job_metadata WHERE 1 = 1");
        if let Some(v) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(v);
        }
        if let Some(v) = &filter.user_name {
            qb.push(" AND user_name = ").push_bind(v.clone());
        }
        if let Some(v) = filter.group_id {
            qb.push(" AND group_id = ").push_bind(v);
        }
        if let Some(v) = &filter.group_name {
            qb.push(" AND group_name = ").push_bind(v.clone());
        }
        if let Some(v) = filter.is_running {
            qb.push(" AND is_running = ").push_bind(v);
        }
        if let Some(v) = &filter.partition {
            qb.push(" AND partition = ").push_bind(v.clone());
        }
        push_range(&mut qb, "num_nodes", filter.num_nodes.as_ref());
        push_range(&mut qb, "num_tasks", filter.num_tasks.as_ref());
        push_range(&mut qb, "num_nodes * gpus_per_node", filter.num_gpus.as_ref());
        push_range(&mut qb, "start_time", filter.time.as_ref());

        let tag_ids: BTreeSet<i64> = filter.tags.iter().flatten().copied().collect();
        if !tag_ids.is_empty() {
            qb.push(" AND id IN (SELECT job_id FROM job_to_tags WHERE tag_id IN (");
            {
                let mut ids = qb.separated(", ");
                for id in &tag_ids {
                    ids.push_bind(*id);
                }
            }
            qb.push(") GROUP BY job_id HAVING COUNT(DISTINCT tag_id) = ")
                .push_bind(tag_ids.len() as i64)
                .push(")");
        }
        qb.push(" ORDER BY id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        self.hydrate(rows).await
    }

    async fn mark_stopped(&self, id: i64, stop: StopJob) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM job_metadata WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let mut job = row_to_job(&row)?;
        apply_stop(&mut job, stop)?;
        sqlx::query("UPDATE job_metadata SET is_running = 0, stop_time = ?2, exit_code = ?3 WHERE id = ?1")
            .bind(id)
            .bind(job.stop_time)
            .bind(job.exit_code)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.get_job(id).await
    }

    async fn update_job(&self, job: Job) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = bind_job(sqlx::query(UPDATE_JOB), &job)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(job.id));
        }
        write_relations(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_summaries(
        &self,
        id: i64,
        summaries: Option<Vec<MetricSummary>>,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE job_metadata SET has_summaries = ?2 WHERE id = ?1")
            .bind(id)
            .bind(summaries.is_some())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }
        write_summaries(&mut tx, id, summaries.as_deref()).await?;
        tx.commit().await?;
        self.get_job(id).await
    }

    async fn delete_job(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM job_metadata WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_tag(&self, id: i64, tag: Tag) -> Result<Tag, StoreError> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM job_metadata WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(StoreError::NotFound(id));
        }
        let tag = resolve_tag(&mut tx, tag).await?;
        sqlx::query("INSERT OR IGNORE INTO job_to_tags(job_id, tag_id) VALUES (?1, ?2)")
            .bind(id)
            .bind(tag.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(tag)
    }

    async fn remove_tag(&self, id: i64, tag_id: i64) -> Result<(), StoreError> {
        let exists = sqlx::query("SELECT 1 FROM job_metadata WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if !exists {
            return Err(StoreError::NotFound(id));
        }
        sqlx::query("DELETE FROM job_to_tags WHERE job_id = ?1 AND tag_id = ?2")
            .bind(id)
            .bind(tag_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_job_tags(&self, user: Option<&str>) -> Result<Vec<Tag>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT {TAG_COLUMNS} FROM job_tags t \
             JOIN job_to_tags jt ON jt.tag_id = t.id \
             JOIN job_metadata j ON j.id = jt.job_id \
             WHERE ?1 IS NULL OR j.user_name = ?1 \
             ORDER BY t.id"
        ))
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_tag).collect::<Result<_, _>>()?)
    }

    async fn search_tags(&self, term: &str, user: Option<&str>) -> Result<Vec<Tag>, StoreError> {
        let sql = format!(
            "SELECT {TAG_COLUMNS} FROM job_tags t \
             WHERE instr(lower(t.name), lower(?1)) > 0 \
             AND (?2 IS NULL OR t.id IN ( \
               SELECT jt.tag_id FROM job_to_tags jt \
               JOIN job_metadata j ON j.id = jt.job_id \
               WHERE j.user_name = ?2)) \
             ORDER BY t.id"
        );
        self.tag_rows(&sql, term, user).await
    }

    async fn users_with_jobs(&self, term: Option<&str>) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT user_name FROM job_metadata \
             WHERE ?1 IS NULL OR instr(lower(user_name), lower(?1)) > 0 \
             ORDER BY user_name",
        )
        .bind(term)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| r.try_get::<String, _>("user_name"))
            .collect::<Result<_, _>>()?)
    }

    async fn search_jobs(&self, term: &str, user: Option<&str>) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM job_metadata \
             WHERE (instr(CAST(id AS TEXT), ?1) > 0 \
               OR instr(lower(job_name), lower(?1)) > 0 \
               OR instr(lower(account), lower(?1)) > 0) \
             AND (?2 IS NULL OR user_name = ?2) \
             ORDER BY id",
        )
        .bind(term)
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        tracing::info!("Closed SQLite job store");
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get_session_token(&self, user: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT token FROM user_sessions WHERE username = ?1")
            .bind(user)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("token")).transpose()?)
    }

    async fn set_session_token(&self, user: &str, token: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_sessions(username, token) VALUES (?1, ?2) \
             ON CONFLICT(username) DO UPDATE SET token = excluded.token",
        )
        .bind(user)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_session(&self, user: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM user_sessions WHERE username = ?1")
            .bind(user)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_user_roles(&self, user: &str) -> Result<Option<Vec<String>>, StoreError> {
        let row = sqlx::query("SELECT roles FROM user_roles WHERE username = ?1")
            .bind(user)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let roles: String = row.try_get("roles")?;
        Ok(Some(serde_json::from_str(&roles)?))
    }

    async fn set_user_roles(&self, user: &str, roles: &[String]) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_roles(username, roles) VALUES (?1, ?2) \
             ON CONFLICT(username) DO UPDATE SET roles = excluded.roles",
        )
        .bind(user)
        .bind(serde_json::to_string(roles)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use jobmon_core::{NewTag, RangeFilter};
    use tempfile::TempDir;

    fn job(id: i64, user: &str, nodes: &str, num_nodes: u32, gpus_per_node: u32) -> Job {
        Job {
            id,
            user_name: user.to_string(),
            num_nodes,
            gpus_per_node,
            node_list: nodes.to_string(),
            partition: "batch".to_string(),
            start_time: 1000 + id,
            is_running: true,
            job_name: format!("sim-{id}"),
            account: "physics".to_string(),
            ..Default::default()
        }
    }

    fn tag(name: &str) -> Tag {
        NewTag::new(name, "user", "alice").with_id(0)
    }

    fn ids(jobs: &[Job]) -> Vec<i64> {
        jobs.iter().map(|j| j.id).collect()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = SqliteStore::open_memory().await.unwrap();
        let mut j = job(1, "alice", "n01|n02", 2, 4);
        j.tags.push(tag("urgent"));
        store.put_job(j).await.unwrap();

        let loaded = store.get_job(1).await.unwrap();
        assert_eq!(loaded.node_list, "n01|n02");
        assert_eq!(loaded.gpus_per_node, 4);
        assert!(loaded.is_running);
        assert_eq!(loaded.tags.len(), 1);
        assert!(loaded.summaries.is_none());

        assert!(matches!(
            store.put_job(job(1, "bob", "n01", 1, 0)).await,
            Err(StoreError::AlreadyExists(1))
        ));
        assert!(matches!(store.get_job(5).await, Err(StoreError::NotFound(5))));
    }

    #[tokio::test]
    async fn test_stop_and_summaries() {
        let store = SqliteStore::open_memory().await.unwrap();
        store.put_job(job(1, "alice", "n01", 1, 0)).await.unwrap();

        let stop = StopJob {
            exit_code: 2,
            stop_time: 9000,
        };
        let mut stopped = store.mark_stopped(1, stop).await.unwrap();
        assert_eq!((stopped.is_running, stopped.exit_code), (false, 2));
        assert!(matches!(
            store.mark_stopped(1, stop).await,
            Err(StoreError::AlreadyStopped(1))
        ));

        let config = MetricConfig {
            guid: "cpu".to_string(),
            measurement: "cpu_usage".to_string(),
            ..Default::default()
        };
        stopped.summaries = Some(vec![MetricSummary {
            config,
            mean: 12.5,
            max: 99.0,
            change_points: vec![Utc.timestamp_opt(1500, 0).unwrap()],
        }]);
        store.update_job(stopped.clone()).await.unwrap();
        assert_eq!(store.get_job(1).await.unwrap(), stopped);

        assert!(matches!(
            store.update_job(job(3, "x", "n01", 1, 0)).await,
            Err(StoreError::NotFound(3))
        ));
    }

    #[tokio::test]
    async fn test_set_summaries_keeps_tags() {
        let store = SqliteStore::open_memory().await.unwrap();
        store.put_job(job(1, "alice", "n01,n02", 2, 0)).await.unwrap();
        let stale = store.get_job(1).await.unwrap();
        store.add_tag(1, tag("slow")).await.unwrap();

        let summary = MetricSummary {
            config: MetricConfig {
                guid: "mem".to_string(),
                measurement: "mem_used".to_string(),
                ..Default::default()
            },
            mean: 4.0,
            max: 8.0,
            change_points: Vec::new(),
        };
        let job = store.set_summaries(stale.id, Some(vec![summary.clone()])).await.unwrap();
        assert_eq!(job.tags.len(), 1);
        assert_eq!(job.summaries, Some(vec![summary]));
        assert_eq!(job.nodes().count(), 2);

        let cleared = store.set_summaries(1, None).await.unwrap();
        assert!(cleared.summaries.is_none());
        assert_eq!(cleared.tags.len(), 1);
        assert!(matches!(
            store.set_summaries(7, None).await,
            Err(StoreError::NotFound(7))
        ));
    }

    #[tokio::test]
    async fn test_filters() {
        let store = SqliteStore::open_memory().await.unwrap();
        store.put_job(job(1, "alice", "n01", 1, 0)).await.unwrap();
        store.put_job(job(2, "alice", "n01|n02", 2, 2)).await.unwrap();
        store.put_job(job(3, "bob", "n01|n02|n03|n04", 4, 4)).await.unwrap();
        store
            .mark_stopped(3, StopJob { exit_code: 0, stop_time: 5000 })
            .await
            .unwrap();

        let by_user = JobFilter {
            user_name: Some("alice".to_string()),
            ..Default::default()
        };
        assert_eq!(ids(&store.get_filtered_jobs(&by_user).await.unwrap()), vec![1, 2]);

        let gpus = JobFilter {
            num_gpus: Some(RangeFilter::new(Some(4), Some(16))),
            ..Default::default()
        };
        assert_eq!(ids(&store.get_filtered_jobs(&gpus).await.unwrap()), vec![2, 3]);

        let running = JobFilter {
            is_running: Some(true),
            time: Some(RangeFilter::new(None, Some(1001))),
            ..Default::default()
        };
        assert_eq!(ids(&store.get_filtered_jobs(&running).await.unwrap()), vec![1]);

        assert_eq!(ids(&store.get_all_jobs().await.unwrap()), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_tag_intersection() {
        let store = SqliteStore::open_memory().await.unwrap();
        for id in 1..=3 {
            store.put_job(job(id, "alice", "n01", 1, 0)).await.unwrap();
        }
        let a = store.add_tag(1, tag("a")).await.unwrap();
        let b = store.add_tag(1, tag("b")).await.unwrap();
        store.add_tag(2, a.clone()).await.unwrap();
        store.add_tag(3, b.clone()).await.unwrap();

        let both = JobFilter {
            tags: Some(vec![a.id, b.id, a.id]),
            ..Default::default()
        };
        assert_eq!(ids(&store.get_filtered_jobs(&both).await.unwrap()), vec![1]);

        let only_a = JobFilter {
            tags: Some(vec![a.id]),
            ..Default::default()
        };
        assert_eq!(ids(&store.get_filtered_jobs(&only_a).await.unwrap()), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_tags_are_idempotent() {
        let store = SqliteStore::open_memory().await.unwrap();
        store.put_job(job(1, "alice", "n01", 1, 0)).await.unwrap();
        let first = store.add_tag(1, tag("keep")).await.unwrap();
        let second = store.add_tag(1, tag("keep")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.get_job(1).await.unwrap().tags.len(), 1);

        store.remove_tag(1, first.id).await.unwrap();
        store.remove_tag(1, first.id).await.unwrap();
        assert!(store.get_job(1).await.unwrap().tags.is_empty());
        assert!(matches!(
            store.remove_tag(8, first.id).await,
            Err(StoreError::NotFound(8))
        ));
        assert_eq!(store.search_tags("KE", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = SqliteStore::open_memory().await.unwrap();
        store.put_job(job(1, "alice", "n01|n02", 2, 0)).await.unwrap();
        store.add_tag(1, tag("x")).await.unwrap();

        assert!(store.delete_job(1).await.unwrap());
        assert!(!store.delete_job(1).await.unwrap());
        let links: i64 = sqlx::query("SELECT COUNT(*) AS n FROM job_to_tags")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(links, 0);
        let nodes: i64 = sqlx::query("SELECT COUNT(*) AS n FROM job_to_nodes")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(nodes, 0);
    }

    #[tokio::test]
    async fn test_search_and_users() {
        let store = SqliteStore::open_memory().await.unwrap();
        store.put_job(job(101, "alice", "n01", 1, 0)).await.unwrap();
        store.put_job(job(202, "bob", "n01", 1, 0)).await.unwrap();

        assert_eq!(store.users_with_jobs(None).await.unwrap(), vec!["alice", "bob"]);
        assert_eq!(store.users_with_jobs(Some("LI")).await.unwrap(), vec!["alice"]);
        assert_eq!(ids(&store.search_jobs("20", None).await.unwrap()), vec![202]);
        assert!(store.search_jobs("20", Some("alice")).await.unwrap().is_empty());
        assert_eq!(store.search_jobs("PHYS", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sessions() {
        let store = SqliteStore::open_memory().await.unwrap();
        store.set_session_token("alice", "t1").await.unwrap();
        store.set_session_token("alice", "t2").await.unwrap();
        assert_eq!(store.get_session_token("alice").await.unwrap().as_deref(), Some("t2"));
        store.remove_session("alice").await.unwrap();
        assert!(store.get_session_token("alice").await.unwrap().is_none());

        let roles = vec!["admin".to_string(), "user".to_string()];
        store.set_user_roles("alice", &roles).await.unwrap();
        assert_eq!(store.get_user_roles("alice").await.unwrap(), Some(roles));
        assert!(store.get_user_roles("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("jobs.db");
        let path = path.to_str().unwrap();

        let store = SqliteStore::open(path).await.unwrap();
        store.put_job(job(1, "alice", "n01", 1, 0)).await.unwrap();
        store.flush().await.unwrap();

        let reopened = SqliteStore::open(path).await.unwrap();
        assert_eq!(reopened.get_job(1).await.unwrap().user_name, "alice");
    }
}
