//! handlers/change_handler.rs
use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::models::change_model::NewRegulatoryChange;
use crate::models::dispatch_model::{EffectiveRangeQuery, RecentChangesQuery};
use crate::services::newsletter_service::NewsletterService;

/// POST /api/changes
pub async fn create_change_endpoint(
    newsletter_service: web::Data<NewsletterService>,
    body: web::Json<NewRegulatoryChange>,
) -> HttpResponse {
    match newsletter_service.store().add_change(body.into_inner()).await {
        Ok(change) => HttpResponse::Ok().json(change),
        Err(e) => HttpResponse::BadRequest().json(json!({
            "success": false,
            "error": format!("{:#}", e)
        })),
    }
}

/// GET /api/changes/recent?limit=10
pub async fn recent_changes_endpoint(
    newsletter_service: web::Data<NewsletterService>,
    query: web::Query<RecentChangesQuery>,
) -> HttpResponse {
    let limit = query.limit.unwrap_or(10).clamp(1, 500);

    match newsletter_service.store().recent_changes(limit).await {
        Ok(changes) => HttpResponse::Ok().json(changes),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "success": false,
            "error": format!("{:#}", e)
        })),
    }
}

/// GET /api/changes/effective?from=2025-01-01&to=2025-12-31
pub async fn effective_changes_endpoint(
    newsletter_service: web::Data<NewsletterService>,
    query: web::Query<EffectiveRangeQuery>,
) -> HttpResponse {
    match newsletter_service
        .store()
        .changes_effective_between(query.from, query.to)
        .await
    {
        Ok(changes) => HttpResponse::Ok().json(changes),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "success": false,
            "error": format!("{:#}", e)
        })),
    }
}
