use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use super::rows::{
    ATTEMPT_COLUMNS, AttemptRow, DELIVERY_COLUMNS, DeliveryRow, WEBHOOK_COLUMNS, WebhookRow,
    content_type_to_str, delivery_status_to_str, error_kind_to_str, http_method_to_str,
    outcome_to_str, parse_ids, to_i64, to_json, webhook_status_to_str,
};
use super::{
    BlockedWebhooks, DeliveryCursor, DeliveryRepository, ListDeliveriesParams, ListDeliveriesResult,
    OVERDUE_RETRY_GRACE, StatsFilter, StoreError, WebhookRepository,
};
use crate::delivery::CANCELLED_MESSAGE;
use crate::time::{format_utc, millis};
use crate::types::{
    DeliveryAttemptLog, DeliveryOutcome, DeliveryStats, DeliveryStatus, Webhook, WebhookDelivery,
    WebhookStatus,
};

const CANCEL_PENDING_SQL: &str = r#"
    UPDATE webhook_deliveries
    SET status = 'failed',
        error_message = ?,
        next_retry_at = NULL,
        lease_expires_at = NULL,
        leased_by = NULL,
        updated_at = ?
    WHERE webhook_id = ?
      AND status = 'pending'
    RETURNING id
"#;

/// SQLite adapter for both repositories.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_deliveries(
        &self,
        predicate: &str,
        order_by: &str,
        limit: u32,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE {predicate} ORDER BY {order_by} LIMIT ?"
        );
        let rows = sqlx::query_as::<_, DeliveryRow>(&sql)
            .bind(format_utc(cutoff))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(WebhookDelivery::try_from).collect()
    }

    /// Optimistic write shared by `save` and `save_leased`. With a
    /// `lease_holder` the row must still be leased to it and the lease is
    /// cleared; without one the lease columns are left alone.
    async fn write_delivery(
        &self,
        delivery: &WebhookDelivery,
        expected_status: DeliveryStatus,
        expected_attempt_count: u32,
        lease_holder: Option<&str>,
        attempt: Option<&DeliveryAttemptLog>,
    ) -> Result<(), StoreError> {
        let delivery_id = delivery.id.to_string();
        let response_headers = match &delivery.response_headers {
            Some(headers) => Some(to_json("response headers", headers)?),
            None => None,
        };
        let (lease_columns, lease_guard) = match lease_holder {
            Some(_) => (
                ", lease_expires_at = NULL, leased_by = NULL",
                " AND leased_by = ?",
            ),
            None => ("", ""),
        };
        let sql = format!(
            r#"
            UPDATE webhook_deliveries
            SET status = ?,
                attempt_count = ?,
                http_status_code = ?,
                response_body = ?,
                response_headers = ?,
                error_message = ?,
                duration_ms = ?,
                next_retry_at = ?,
                delivered_at = ?,
                metadata = ?,
                updated_at = ?{lease_columns}
            WHERE id = ?
              AND status = ?
              AND attempt_count = ?{lease_guard}
            "#
        );

        let mut tx = self.pool.begin().await?;

        let mut update = sqlx::query(&sql)
            .bind(delivery_status_to_str(delivery.status))
            .bind(delivery.attempt_count)
            .bind(delivery.http_status_code)
            .bind(delivery.response_body.as_deref())
            .bind(response_headers.as_deref())
            .bind(delivery.error_message.as_deref())
            .bind(delivery.duration_ms.map(|ms| ms as i64))
            .bind(delivery.next_retry_at.map(format_utc))
            .bind(delivery.delivered_at.map(format_utc))
            .bind(to_json("metadata", &delivery.metadata)?)
            .bind(format_utc(delivery.updated_at))
            .bind(&delivery_id)
            .bind(delivery_status_to_str(expected_status))
            .bind(expected_attempt_count);
        if let Some(worker_id) = lease_holder {
            update = update.bind(worker_id);
        }
        let result = update.execute(&mut *tx).await?;

        if result.rows_affected() == 0 {
            let exists: Option<String> =
                sqlx::query_scalar("SELECT id FROM webhook_deliveries WHERE id = ?")
                    .bind(&delivery_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match exists {
                Some(_) => StoreError::Conflict(format!("delivery {delivery_id} changed concurrently")),
                None => StoreError::NotFound("delivery not found".to_string()),
            });
        }

        if let Some(attempt) = attempt {
            sqlx::query(
                r#"
                INSERT INTO delivery_attempts (
                    id,
                    delivery_id,
                    webhook_id,
                    attempt_no,
                    started_at,
                    finished_at,
                    success,
                    http_status_code,
                    response_body,
                    error_kind,
                    error_message,
                    duration_ms
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(attempt.id.to_string())
            .bind(&delivery_id)
            .bind(attempt.webhook_id.to_string())
            .bind(attempt.attempt_no)
            .bind(format_utc(attempt.started_at))
            .bind(format_utc(attempt.finished_at))
            .bind(attempt.success)
            .bind(attempt.http_status_code)
            .bind(attempt.response_body.as_deref())
            .bind(attempt.error_kind.map(error_kind_to_str))
            .bind(attempt.error_message.as_deref())
            .bind(attempt.duration_ms as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }
}

#[async_trait]
impl DeliveryRepository for SqliteStore {
    async fn insert(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let response_headers = match &delivery.response_headers {
            Some(headers) => Some(to_json("response headers", headers)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (
                id,
                webhook_id,
                workspace_id,
                event,
                payload,
                status,
                attempt_count,
                max_attempts,
                http_status_code,
                response_body,
                response_headers,
                error_message,
                duration_ms,
                next_retry_at,
                delivered_at,
                metadata,
                created_at,
                updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(delivery.id.to_string())
        .bind(delivery.webhook_id.to_string())
        .bind(delivery.workspace_id.to_string())
        .bind(&delivery.event)
        .bind(&delivery.payload)
        .bind(delivery_status_to_str(delivery.status))
        .bind(delivery.attempt_count)
        .bind(delivery.max_attempts)
        .bind(delivery.http_status_code)
        .bind(delivery.response_body.as_deref())
        .bind(response_headers.as_deref())
        .bind(delivery.error_message.as_deref())
        .bind(delivery.duration_ms.map(|ms| ms as i64))
        .bind(delivery.next_retry_at.map(format_utc))
        .bind(delivery.delivered_at.map(format_utc))
        .bind(to_json("metadata", &delivery.metadata)?)
        .bind(format_utc(delivery.created_at))
        .bind(format_utc(delivery.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WebhookDelivery>, StoreError> {
        let sql = format!("SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = ?");
        sqlx::query_as::<_, DeliveryRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(WebhookDelivery::try_from)
            .transpose()
    }

    async fn claim_due(
        &self,
        limit: u32,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
        blocked: &BlockedWebhooks,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let now_str = format_utc(now);
        let lease_expires_at = format_utc(now + millis(lease));

        let mut claim = QueryBuilder::<Sqlite>::new(
            r#"
            WITH eligible AS (
                SELECT id
                FROM webhook_deliveries
                WHERE status = 'pending'
                    AND attempt_count < max_attempts
                    AND (next_retry_at IS NULL OR next_retry_at <= "#,
        );
        claim.push_bind(now_str.clone());
        claim.push(") AND (lease_expires_at IS NULL OR lease_expires_at <= ");
        claim.push_bind(now_str.clone());
        claim.push(")");
        if !blocked.ids.is_empty() {
            claim.push(" AND (webhook_id NOT IN (");
            let mut blocked_list = claim.separated(", ");
            for id in &blocked.ids {
                blocked_list.push_bind(id.to_string());
            }
            blocked_list.push_unseparated(")");
            if let Some(cutoff) = blocked.starved_before {
                claim.push(" OR COALESCE(next_retry_at, created_at) <= ");
                claim.push_bind(format_utc(cutoff));
            }
            claim.push(")");
        }
        claim.push(
            r#"
                ORDER BY COALESCE(next_retry_at, created_at) ASC, id ASC
                LIMIT "#,
        );
        claim.push_bind(limit);
        claim.push(
            r#"
            )
            UPDATE webhook_deliveries
            SET lease_expires_at = "#,
        );
        claim.push_bind(lease_expires_at);
        claim.push(", leased_by = ");
        claim.push_bind(worker_id);
        claim.push(
            r#"
            WHERE id IN (SELECT id FROM eligible)
                AND status = 'pending'
                AND (lease_expires_at IS NULL OR lease_expires_at <= "#,
        );
        claim.push_bind(now_str);
        claim.push(") RETURNING id");

        let mut tx = self.pool.begin().await?;

        let leased_ids: Vec<String> = claim.build_query_scalar().fetch_all(&mut *tx).await?;

        if leased_ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut fetch = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id IN ("
        ));
        let mut fetch_list = fetch.separated(", ");
        for id in &leased_ids {
            fetch_list.push_bind(id);
        }
        fetch_list.push_unseparated(")");

        let rows: Vec<DeliveryRow> = fetch.build_query_as().fetch_all(&mut *tx).await?;

        tx.commit().await?;

        let mut deliveries = rows
            .into_iter()
            .map(WebhookDelivery::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        deliveries.sort_by_key(|delivery| (delivery.due_at(), delivery.id));
        Ok(deliveries)
    }

    async fn release(&self, id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET lease_expires_at = NULL,
                leased_by = NULL
            WHERE id = ?
              AND leased_by = ?
            "#,
        )
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET lease_expires_at = ?
            WHERE id = ?
              AND status = 'pending'
              AND leased_by = ?
              AND lease_expires_at > ?
            "#,
        )
        .bind(format_utc(now + millis(lease)))
        .bind(id.to_string())
        .bind(worker_id)
        .bind(format_utc(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_pending_deliveries(
        &self,
        limit: u32,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        self.fetch_deliveries(
            "status = 'pending' AND attempt_count = 0 AND created_at <= ?",
            "created_at ASC, id ASC",
            limit,
            older_than,
        )
        .await
    }

    async fn find_ready_for_retry(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        self.fetch_deliveries(
            "status = 'pending' AND attempt_count > 0 AND attempt_count < max_attempts \
             AND next_retry_at IS NOT NULL AND next_retry_at <= ?",
            "next_retry_at ASC, id ASC",
            limit,
            now,
        )
        .await
    }

    async fn find_overdue_retries(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        self.fetch_deliveries(
            "status = 'pending' AND attempt_count > 0 AND attempt_count < max_attempts \
             AND next_retry_at IS NOT NULL AND next_retry_at <= ?",
            "next_retry_at ASC, id ASC",
            limit,
            now - millis(OVERDUE_RETRY_GRACE),
        )
        .await
    }

    async fn save(
        &self,
        delivery: &WebhookDelivery,
        expected_status: DeliveryStatus,
        expected_attempt_count: u32,
        attempt: Option<&DeliveryAttemptLog>,
    ) -> Result<(), StoreError> {
        self.write_delivery(delivery, expected_status, expected_attempt_count, None, attempt)
            .await
    }

    async fn save_leased(
        &self,
        delivery: &WebhookDelivery,
        worker_id: &str,
        expected_status: DeliveryStatus,
        expected_attempt_count: u32,
        attempt: Option<&DeliveryAttemptLog>,
    ) -> Result<(), StoreError> {
        self.write_delivery(
            delivery,
            expected_status,
            expected_attempt_count,
            Some(worker_id),
            attempt,
        )
        .await
    }

    async fn list_attempts(&self, delivery_id: Uuid) -> Result<Vec<DeliveryAttemptLog>, StoreError> {
        let delivery_id = delivery_id.to_string();
        let exists: Option<String> =
            sqlx::query_scalar("SELECT id FROM webhook_deliveries WHERE id = ?")
                .bind(&delivery_id)
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound("delivery not found".to_string()));
        }

        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts WHERE delivery_id = ? \
             ORDER BY started_at ASC, attempt_no ASC"
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(&delivery_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DeliveryAttemptLog::try_from).collect()
    }

    async fn bulk_update_status(
        &self,
        ids: &[Uuid],
        status: DeliveryStatus,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let status_str = delivery_status_to_str(status);
        let now_str = format_utc(now);

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE webhook_deliveries SET status = ");
        query.push_bind(status_str);
        query.push(", updated_at = ");
        query.push_bind(now_str.clone());
        // Keep next_retry_at set iff the row is a pending retry.
        query.push(", next_retry_at = CASE WHEN ");
        query.push_bind(status_str);
        query.push(" = 'pending' AND attempt_count > 0 THEN COALESCE(next_retry_at, ");
        query.push_bind(now_str.clone());
        query.push(") ELSE NULL END");
        query.push(", delivered_at = CASE WHEN ");
        query.push_bind(status_str);
        query.push(" = 'delivered' THEN COALESCE(delivered_at, ");
        query.push_bind(now_str.clone());
        query.push(") ELSE delivered_at END");
        if status == DeliveryStatus::Delivered {
            query.push(", error_message = NULL");
        }
        query.push(" WHERE id IN (");
        let mut list = query.separated(", ");
        for id in ids {
            list.push_bind(id.to_string());
        }
        list.push_unseparated(")");
        // Pending with no attempts left would never be claimed again.
        if status == DeliveryStatus::Pending {
            query.push(" AND attempt_count < max_attempts");
        }

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn cancel_pending_for_webhook(
        &self,
        webhook_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cancelled: Vec<String> = sqlx::query_scalar(CANCEL_PENDING_SQL)
            .bind(CANCELLED_MESSAGE)
            .bind(format_utc(now))
            .bind(webhook_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        parse_ids(&cancelled)
    }

    async fn cleanup_old_deliveries(
        &self,
        older_than: DateTime<Utc>,
        keep_successful: bool,
    ) -> Result<u64, StoreError> {
        let predicate = if keep_successful {
            "created_at < ? AND status = 'failed'"
        } else {
            "created_at < ? AND status IN ('delivered', 'failed')"
        };
        let cutoff = format_utc(older_than);

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "DELETE FROM delivery_attempts WHERE delivery_id IN \
             (SELECT id FROM webhook_deliveries WHERE {predicate})"
        ))
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(&format!("DELETE FROM webhook_deliveries WHERE {predicate}"))
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn list(
        &self,
        params: &ListDeliveriesParams,
    ) -> Result<ListDeliveriesResult, StoreError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE 1 = 1"
        ));

        if let Some(status) = params.status {
            query.push(" AND status = ");
            query.push_bind(delivery_status_to_str(status));
        }

        if let Some(webhook_id) = params.webhook_id {
            query.push(" AND webhook_id = ");
            query.push_bind(webhook_id.to_string());
        }

        if let Some(workspace_id) = params.workspace_id {
            query.push(" AND workspace_id = ");
            query.push_bind(workspace_id.to_string());
        }

        if let Some(cursor) = &params.before {
            let created_at = format_utc(cursor.created_at);
            query.push(" AND (created_at < ");
            query.push_bind(created_at.clone());
            query.push(" OR (created_at = ");
            query.push_bind(created_at);
            query.push(" AND id < ");
            query.push_bind(cursor.id.to_string());
            query.push("))");
        }

        query.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        query.push_bind(params.limit + 1);

        let rows: Vec<DeliveryRow> = query.build_query_as().fetch_all(&self.pool).await?;

        let has_more = rows.len() > params.limit as usize;
        let take_count = if has_more {
            params.limit as usize
        } else {
            rows.len()
        };

        let deliveries = rows
            .into_iter()
            .take(take_count)
            .map(WebhookDelivery::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let next_before = if has_more {
            deliveries.last().map(|last| DeliveryCursor {
                created_at: last.created_at,
                id: last.id,
            })
        } else {
            None
        };

        Ok(ListDeliveriesResult {
            deliveries,
            next_before,
        })
    }

    async fn recent_attempts(
        &self,
        webhook_id: Uuid,
        limit: u32,
    ) -> Result<Vec<DeliveryAttemptLog>, StoreError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts WHERE webhook_id = ? \
             ORDER BY finished_at DESC, id DESC LIMIT ?"
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(webhook_id.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DeliveryAttemptLog::try_from).collect()
    }

    async fn get_stats(&self, filter: &StatsFilter) -> Result<DeliveryStats, StoreError> {
        super::stats::delivery_stats(&self.pool, filter).await
    }
}

#[async_trait]
impl WebhookRepository for SqliteStore {
    async fn insert_webhook(&self, webhook: &Webhook) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO webhooks (
                id,
                workspace_id,
                user_id,
                url,
                secret,
                status,
                events,
                http_method,
                content_type,
                timeout_ms,
                max_retries,
                retry_delay_ms,
                headers,
                signature_header,
                signature_algorithm,
                success_count,
                failure_count,
                last_delivery_at,
                last_delivery_status,
                last_error,
                created_at,
                updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(webhook.id.to_string())
        .bind(webhook.workspace_id.to_string())
        .bind(webhook.user_id.to_string())
        .bind(&webhook.url)
        .bind(webhook.secret.as_deref())
        .bind(webhook_status_to_str(webhook.status))
        .bind(to_json("events", &webhook.events)?)
        .bind(http_method_to_str(webhook.http_method))
        .bind(content_type_to_str(webhook.content_type))
        .bind(to_i64("timeout_ms", webhook.timeout_ms)?)
        .bind(webhook.max_retries)
        .bind(to_i64("retry_delay_ms", webhook.retry_delay_ms)?)
        .bind(to_json("headers", &webhook.headers)?)
        .bind(webhook.signature_header.as_deref())
        .bind(webhook.signature_algorithm.as_deref())
        .bind(webhook.success_count as i64)
        .bind(webhook.failure_count as i64)
        .bind(webhook.last_delivery_at.map(format_utc))
        .bind(webhook.last_delivery_status.map(outcome_to_str))
        .bind(webhook.last_error.as_deref())
        .bind(format_utc(webhook.created_at))
        .bind(format_utc(webhook.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>, StoreError> {
        let sql = format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = ?");
        sqlx::query_as::<_, WebhookRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(Webhook::try_from)
            .transpose()
    }

    async fn find_subscribed(
        &self,
        workspace_id: Uuid,
        event: &str,
    ) -> Result<Vec<Webhook>, StoreError> {
        let sql = format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks \
             WHERE workspace_id = ? AND status = 'active' \
               AND EXISTS (SELECT 1 FROM json_each(webhooks.events) WHERE json_each.value = ?) \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, WebhookRow>(&sql)
            .bind(workspace_id.to_string())
            .bind(event)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Webhook::try_from).collect()
    }

    async fn list_active(&self) -> Result<Vec<Webhook>, StoreError> {
        let sql = format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE status = 'active' \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, WebhookRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Webhook::try_from).collect()
    }

    async fn record_delivery_outcome(
        &self,
        id: Uuid,
        outcome: DeliveryOutcome,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (successes, failures) = match outcome {
            DeliveryOutcome::Success => (1_i64, 0_i64),
            DeliveryOutcome::Failure => (0, 1),
        };
        let at = format_utc(at);

        let result = sqlx::query(
            r#"
            UPDATE webhooks
            SET success_count = success_count + ?,
                failure_count = failure_count + ?,
                last_delivery_at = ?,
                last_delivery_status = ?,
                last_error = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(successes)
        .bind(failures)
        .bind(&at)
        .bind(outcome_to_str(outcome))
        .bind(error)
        .bind(&at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("webhook not found".to_string()));
        }
        Ok(())
    }

    async fn set_webhook_status(
        &self,
        id: Uuid,
        status: WebhookStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE webhooks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(webhook_status_to_str(status))
            .bind(format_utc(now))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("webhook not found".to_string()));
        }
        Ok(())
    }

    async fn delete_webhook(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let webhook_id = id.to_string();
        let mut tx = self.pool.begin().await?;

        let cancelled: Vec<String> = sqlx::query_scalar(CANCEL_PENDING_SQL)
            .bind(CANCELLED_MESSAGE)
            .bind(format_utc(now))
            .bind(&webhook_id)
            .fetch_all(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM webhooks WHERE id = ?")
            .bind(&webhook_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound("webhook not found".to_string()));
        }

        tx.commit().await?;

        parse_ids(&cancelled)
    }
}
