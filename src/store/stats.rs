use std::collections::BTreeMap;

use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::rows::{parse_time, to_status_code};
use super::{StatsFilter, StoreError};
use crate::time::format_utc;
use crate::types::{DeliveryStats, ErrorAnalysis};

const TOP_ERRORS: i64 = 10;

fn push_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &StatsFilter) {
    query.push(" WHERE 1 = 1");
    if let Some(webhook_id) = filter.webhook_id {
        query.push(" AND webhook_id = ");
        query.push_bind(webhook_id.to_string());
    }
    if let Some(workspace_id) = filter.workspace_id {
        query.push(" AND workspace_id = ");
        query.push_bind(workspace_id.to_string());
    }
    if let Some(from) = filter.from {
        query.push(" AND created_at >= ");
        query.push_bind(format_utc(from));
    }
    if let Some(to) = filter.to {
        query.push(" AND created_at <= ");
        query.push_bind(format_utc(to));
    }
}

#[derive(sqlx::FromRow)]
struct TotalsRow {
    total: i64,
    delivered: Option<i64>,
    failed: Option<i64>,
    pending: Option<i64>,
    average_duration_ms: Option<f64>,
}

#[derive(sqlx::FromRow)]
struct ErrorRow {
    message: String,
    count: i64,
    last_seen: String,
    status_codes: Option<String>,
}

pub(super) async fn delivery_stats(
    pool: &SqlitePool,
    filter: &StatsFilter,
) -> Result<DeliveryStats, StoreError> {
    let mut totals_query = QueryBuilder::<Sqlite>::new(
        "SELECT \
            COUNT(*) AS total, \
            SUM(CASE WHEN status = 'delivered' THEN 1 ELSE 0 END) AS delivered, \
            SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed, \
            SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending, \
            AVG(duration_ms) AS average_duration_ms \
        FROM webhook_deliveries",
    );
    push_filter(&mut totals_query, filter);
    let totals: TotalsRow = totals_query.build_query_as().fetch_one(pool).await?;

    let mut event_query =
        QueryBuilder::<Sqlite>::new("SELECT event, COUNT(*) FROM webhook_deliveries");
    push_filter(&mut event_query, filter);
    event_query.push(" GROUP BY event");
    let by_event: Vec<(String, i64)> = event_query.build_query_as().fetch_all(pool).await?;

    let mut code_query =
        QueryBuilder::<Sqlite>::new("SELECT http_status_code, COUNT(*) FROM webhook_deliveries");
    push_filter(&mut code_query, filter);
    code_query.push(" AND http_status_code IS NOT NULL GROUP BY http_status_code");
    let by_code: Vec<(i64, i64)> = code_query.build_query_as().fetch_all(pool).await?;

    let mut error_query = QueryBuilder::<Sqlite>::new(
        "SELECT \
            error_message AS message, \
            COUNT(*) AS count, \
            MAX(updated_at) AS last_seen, \
            GROUP_CONCAT(DISTINCT http_status_code) AS status_codes \
        FROM webhook_deliveries",
    );
    push_filter(&mut error_query, filter);
    error_query.push(
        " AND status != 'delivered' AND error_message IS NOT NULL \
         GROUP BY error_message ORDER BY count DESC, last_seen DESC LIMIT ",
    );
    error_query.push_bind(TOP_ERRORS);
    let error_rows: Vec<ErrorRow> = error_query.build_query_as().fetch_all(pool).await?;

    let total = totals.total.max(0) as u64;
    let delivered = totals.delivered.unwrap_or(0).max(0) as u64;
    let failed = totals.failed.unwrap_or(0).max(0) as u64;
    let pending = totals.pending.unwrap_or(0).max(0) as u64;
    let finished = delivered + failed;
    let success_rate = if finished == 0 {
        0.0
    } else {
        delivered as f64 / finished as f64
    };

    let mut by_status_code = BTreeMap::new();
    for (code, count) in by_code {
        by_status_code.insert(to_status_code(code)?, count.max(0) as u64);
    }

    let mut errors = Vec::with_capacity(error_rows.len());
    for row in error_rows {
        let count = row.count.max(0) as u64;
        let mut status_codes = Vec::new();
        for code in row.status_codes.as_deref().unwrap_or("").split(',') {
            let code = code.trim();
            if code.is_empty() {
                continue;
            }
            let parsed = code
                .parse::<u16>()
                .map_err(|err| StoreError::Parse(format!("invalid status code {code}: {err}")))?;
            status_codes.push(parsed);
        }
        status_codes.sort_unstable();

        errors.push(ErrorAnalysis {
            message: row.message,
            count,
            percentage: if total == 0 {
                0.0
            } else {
                count as f64 * 100.0 / total as f64
            },
            last_seen: parse_time("last_seen", &row.last_seen)?,
            status_codes,
        });
    }

    Ok(DeliveryStats {
        total,
        delivered,
        failed,
        pending,
        success_rate,
        average_duration_ms: totals.average_duration_ms,
        by_event: by_event
            .into_iter()
            .map(|(event, count)| (event, count.max(0) as u64))
            .collect(),
        by_status_code,
        errors,
    })
}
