// SQLite RequestRepository Implementation

use async_trait::async_trait;
use breakq_core::domain::{BreakRequest, BreakStatus, DomainError, RequestId};
use breakq_core::error::{AppError, Result};
use breakq_core::port::RequestRepository;
use sqlx::SqlitePool;

// Helper to convert sqlx::Error to AppError with structured information
fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: https://www.sqlite.org/rescode.html
            match db_err.code().as_deref() {
                Some(code @ ("2067" | "1555")) => AppError::Database(format!(
                    "Unique constraint violation: {} ({})",
                    db_err.message(),
                    code
                )),
                Some(code @ "275") => AppError::Database(format!(
                    "Check constraint violation: {} ({})",
                    db_err.message(),
                    code
                )),
                Some("5") => AppError::Database(format!(
                    "Database locked (SQLITE_BUSY): {}",
                    db_err.message()
                )),
                Some(code) => AppError::Database(format!(
                    "Database error [{}]: {}",
                    code,
                    db_err.message()
                )),
                None => AppError::Database(format!("Database error: {}", db_err.message())),
            }
        }
        sqlx::Error::RowNotFound => AppError::Database("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            AppError::Database(format!("Column not found: {}", col))
        }
        // Connection, pool, protocol errors
        _ => AppError::Database(err.to_string()),
    }
}

// Insert hit the partial unique index on active (user_id, group_id)
fn is_active_user_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("2067") && db_err.message().contains("user_id")
        }
        _ => false,
    }
}

pub struct SqliteRequestRepository {
    pool: SqlitePool,
}

impl SqliteRequestRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestRepository for SqliteRequestRepository {
    async fn insert(&self, request: &BreakRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO break_requests (
                id, user_id, group_id, status,
                enqueued_at, notified_at, resolved_at, postpone_count, queue_key
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(&request.user_id)
        .bind(&request.group)
        .bind(request.status.as_str())
        .bind(request.enqueued_at)
        .bind(request.notified_at)
        .bind(request.resolved_at)
        .bind(i64::from(request.postpone_count))
        .bind(request.queue_key)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_active_user_conflict(&e) {
                DomainError::DuplicateRequest {
                    user_id: request.user_id.clone(),
                    group: request.group.clone(),
                }
                .into()
            } else {
                map_sqlx_error(e)
            }
        })?;

        Ok(())
    }

    async fn update(&self, request: &BreakRequest) -> Result<()> {
        // Conditional update: a terminal row is never rewritten
        let result = sqlx::query(
            r#"
            UPDATE break_requests
            SET status = ?, notified_at = ?, resolved_at = ?, postpone_count = ?, queue_key = ?
            WHERE id = ?
              AND status NOT IN ('CONFIRMED', 'EXPIRED', 'CANCELLED')
            "#,
        )
        .bind(request.status.as_str())
        .bind(request.notified_at)
        .bind(request.resolved_at)
        .bind(i64::from(request.postpone_count))
        .bind(request.queue_key)
        .bind(&request.id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Either missing or already terminal
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM break_requests WHERE id = ?")
                .bind(&request.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        match current {
            None => Err(AppError::NotFound(format!(
                "Break request {} not found",
                request.id
            ))),
            Some(status) => Err(AppError::Database(format!(
                "Cannot update break request {} from {} to {}",
                request.id, status, request.status
            ))),
        }
    }

    async fn update_queue_keys(&self, keys: &[(RequestId, i64)]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        for (id, key) in keys {
            sqlx::query(
                r#"
                UPDATE break_requests
                SET queue_key = ?
                WHERE id = ?
                  AND status NOT IN ('CONFIRMED', 'EXPIRED', 'CANCELLED')
                "#,
            )
            .bind(*key)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn find_by_id(&self, id: &RequestId) -> Result<Option<BreakRequest>> {
        let row = sqlx::query_as::<_, RequestRow>("SELECT * FROM break_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(RequestRow::into_request).transpose()
    }

    async fn find_active(&self) -> Result<Vec<BreakRequest>> {
        let rows: Vec<RequestRow> = sqlx::query_as(
            r#"
            SELECT * FROM break_requests
            WHERE status IN ('WAITING', 'NOTIFIED')
            ORDER BY enqueued_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(RequestRow::into_request).collect()
    }

    async fn delete_resolved_before(&self, cutoff_millis: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM break_requests
            WHERE resolved_at IS NOT NULL AND resolved_at < ?
            "#,
        )
        .bind(cutoff_millis)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}

/// SQLite row representation
#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    id: String,
    user_id: String,
    group_id: String,
    status: String,
    enqueued_at: i64,
    notified_at: Option<i64>,
    resolved_at: Option<i64>,
    postpone_count: i64,
    queue_key: i64,
}

impl RequestRow {
    fn into_request(self) -> Result<BreakRequest> {
        let status: BreakStatus = self.status.parse()?;
        let postpone_count = u32::try_from(self.postpone_count).map_err(|_| {
            AppError::Database(format!(
                "Invalid postpone_count {} for break request {}",
                self.postpone_count, self.id
            ))
        })?;

        Ok(BreakRequest {
            id: self.id,
            user_id: self.user_id,
            group: self.group_id,
            status,
            enqueued_at: self.enqueued_at,
            notified_at: self.notified_at,
            resolved_at: self.resolved_at,
            postpone_count,
            queue_key: self.queue_key,
        })
    }
}
