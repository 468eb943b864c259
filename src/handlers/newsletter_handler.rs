//! handlers/newsletter_handler.rs
//! Endpoints para despachar newsletters y para el envío de prueba.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::errors::DispatchError;
use crate::models::dispatch_model::{DispatchRequest, TestSendRequest};
use crate::services::newsletter_service::{render_context, NewsletterService, TEST_RECIPIENT};

/// POST /api/newsletters/dispatch
pub async fn dispatch_endpoint(
    newsletter_service: web::Data<NewsletterService>,
    body: web::Json<DispatchRequest>,
) -> HttpResponse {
    match newsletter_service
        .run_dispatch_request(body.into_inner())
        .await
    {
        Ok(report) => HttpResponse::Ok().json(json!({
            "success": true,
            "report": report
        })),
        Err(e) => {
            log::error!("Newsletter dispatch aborted: {}", e);
            let mut response = match e {
                DispatchError::InvalidRequest(_) => HttpResponse::BadRequest(),
                _ => HttpResponse::InternalServerError(),
            };
            response.json(json!({
                "success": false,
                "error": e.to_string()
            }))
        }
    }
}

/// POST /api/newsletters/cancel
pub async fn cancel_endpoint(newsletter_service: web::Data<NewsletterService>) -> HttpResponse {
    let cancelled = newsletter_service.cancel_runs();
    let message = if cancelled > 0 {
        "Dispatch runs cancelled"
    } else {
        "No dispatch run in progress"
    };
    HttpResponse::Ok().json(json!({
        "success": cancelled > 0,
        "cancelled": cancelled,
        "message": message
    }))
}

/// POST /api/newsletters/test
pub async fn send_test_endpoint(
    newsletter_service: web::Data<NewsletterService>,
    body: web::Json<TestSendRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    let recipient = req
        .recipient
        .unwrap_or_else(|| TEST_RECIPIENT.to_string());
    let ctx = render_context(req.quarter, req.year);

    match newsletter_service.send_test(&recipient, &ctx).await {
        Ok(resp) if resp.success => HttpResponse::Ok().json(resp),
        Ok(resp) => HttpResponse::BadGateway().json(resp),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "success": false,
            "error": e.to_string()
        })),
    }
}
