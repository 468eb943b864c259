//! handlers/dispatch_handler.rs
//! Historial de envíos, reconciliación y eventos de apertura/click.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::models::dispatch_model::ReconcileResponse;
use crate::services::newsletter_service::NewsletterService;

/// GET /api/dispatches/customer/{customer_id}
pub async fn customer_dispatches_endpoint(
    newsletter_service: web::Data<NewsletterService>,
    path: web::Path<i64>,
) -> HttpResponse {
    let customer_id = path.into_inner();

    match newsletter_service
        .store()
        .dispatches_for_customer(customer_id)
        .await
    {
        Ok(records) => HttpResponse::Ok().json(records),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "success": false,
            "error": format!("{:#}", e)
        })),
    }
}

/// POST /api/dispatches/reconcile
pub async fn reconcile_endpoint(newsletter_service: web::Data<NewsletterService>) -> HttpResponse {
    let threshold = newsletter_service.stale_pending_after();

    match newsletter_service.reconcile_stale_pending(threshold).await {
        Ok(reconciled) => HttpResponse::Ok().json(ReconcileResponse { reconciled }),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "success": false,
            "error": format!("{:#}", e)
        })),
    }
}

/// POST /api/dispatches/{id}/opened
pub async fn mark_opened_endpoint(
    newsletter_service: web::Data<NewsletterService>,
    path: web::Path<String>,
) -> HttpResponse {
    let dispatch_id = path.into_inner();
    engagement_response(
        &dispatch_id,
        newsletter_service.store().mark_opened(&dispatch_id).await,
    )
}

/// POST /api/dispatches/{id}/clicked
pub async fn mark_clicked_endpoint(
    newsletter_service: web::Data<NewsletterService>,
    path: web::Path<String>,
) -> HttpResponse {
    let dispatch_id = path.into_inner();
    engagement_response(
        &dispatch_id,
        newsletter_service.store().mark_clicked(&dispatch_id).await,
    )
}

fn engagement_response(dispatch_id: &str, result: anyhow::Result<bool>) -> HttpResponse {
    match result {
        Ok(true) => HttpResponse::Ok().json(json!({ "success": true })),
        Ok(false) => HttpResponse::NotFound().json(json!({
            "success": false,
            "error": format!("Dispatch {} not found", dispatch_id)
        })),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "success": false,
            "error": format!("{:#}", e)
        })),
    }
}
