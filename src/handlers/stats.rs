use axum::{Json, extract::State};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError, extractors::ValidQuery, state::AppState, store::StatsFilter,
    time::parse_utc, types::DeliveryStats,
};

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    webhook_id: Option<Uuid>,
    workspace_id: Option<Uuid>,
    from: Option<String>,
    to: Option<String>,
}

pub async fn stats_handler(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<StatsQuery>,
) -> Result<Json<DeliveryStats>, ApiError> {
    let parse = |field: &str, raw: Option<String>| {
        raw.map(|value| {
            parse_utc(value.trim())
                .map_err(|_| ApiError::validation(format!("{field} must be an RFC 3339 timestamp")))
        })
        .transpose()
    };

    let filter = StatsFilter {
        webhook_id: query.webhook_id,
        workspace_id: query.workspace_id,
        from: parse("from", query.from)?,
        to: parse("to", query.to)?,
    };
    if let (Some(from), Some(to)) = (filter.from, filter.to)
        && from > to
    {
        return Err(ApiError::validation("from must not be after to"));
    }

    Ok(Json(state.dispatcher.deliveries().get_stats(&filter).await?))
}
