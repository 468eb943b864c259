//! app.rs
use crate::handlers::{change_handler, dispatch_handler, newsletter_handler};
use actix_web::web;

pub fn init_app(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .service(
                web::scope("/newsletters")
                    .route(
                        "/dispatch",
                        web::post().to(newsletter_handler::dispatch_endpoint),
                    )
                    .route(
                        "/cancel",
                        web::post().to(newsletter_handler::cancel_endpoint),
                    )
                    .route(
                        "/test",
                        web::post().to(newsletter_handler::send_test_endpoint),
                    ),
            )
            .service(
                web::scope("/changes")
                    .route(
                        "",
                        web::post().to(change_handler::create_change_endpoint),
                    )
                    .route(
                        "/recent",
                        web::get().to(change_handler::recent_changes_endpoint),
                    )
                    .route(
                        "/effective",
                        web::get().to(change_handler::effective_changes_endpoint),
                    ),
            )
            .service(
                web::scope("/dispatches")
                    .route(
                        "/customer/{customer_id}",
                        web::get().to(dispatch_handler::customer_dispatches_endpoint),
                    )
                    .route(
                        "/reconcile",
                        web::post().to(dispatch_handler::reconcile_endpoint),
                    )
                    .route(
                        "/{id}/opened",
                        web::post().to(dispatch_handler::mark_opened_endpoint),
                    )
                    .route(
                        "/{id}/clicked",
                        web::post().to(dispatch_handler::mark_clicked_endpoint),
                    ),
            ),
    );
}
