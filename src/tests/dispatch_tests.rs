//! tests/dispatch_tests.rs
//! Corridas completas de envío: dedup, fallos, reintentos y cancelación.

use chrono::Utc;
use std::time::Duration;

use super::support::{Behavior, Fixture};
use crate::config::app_config::DispatchConfig;
use crate::errors::{DispatchError, TransportError};
use crate::models::dispatch_model::{change_key, DispatchRequest, DispatchStatus, OutcomeKind};
use crate::models::newsletter_model::RenderContext;
use crate::services::dispatch_service::CancelToken;
use crate::services::newsletter_service::TEST_RECIPIENT;
use crate::services::template_service::TemplateService;

fn q3() -> RenderContext {
    RenderContext::new("Q3 2025", 2025)
}

#[actix_rt::test]
async fn test_single_customer_receives_newsletter() {
    let fx = Fixture::new().await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    let change = fx
        .change("New rule for energy audits", (2025, 7, 1), None)
        .await;

    let report = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.total, 1);
    assert_eq!(report.summary.count(OutcomeKind::Sent), 1);
    assert!(report.summary.follow_up.is_empty());

    let sent = fx.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["test@example.com".to_string()]);
    assert_eq!(sent[0].subject, "ISO 50001 Update Q3 2025");
    assert!(sent[0].body_html.contains("Test GmbH"));
    assert!(sent[0].body_html.contains("New rule for energy audits"));

    let records = fx.store.dispatches_for_customer(customer).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DispatchStatus::Sent);
    assert_eq!(records[0].attempt, 1);
    assert_eq!(records[0].change_ids(), vec![change.id]);
    assert_eq!(records[0].batch_id, report.batch_id);
    assert!(records[0].sent_at.is_some());
    assert_eq!(records[0].body_html.as_deref(), Some(sent[0].body_html.as_str()));
}

#[actix_rt::test]
async fn test_second_run_reports_already_sent() {
    let fx = Fixture::new().await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;

    let first = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();
    let second = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(first.summary.count(OutcomeKind::Sent), 1);
    assert_eq!(second.summary.count(OutcomeKind::AlreadySent), 1);
    assert_eq!(second.summary.count(OutcomeKind::Sent), 0);
    assert_eq!(fx.transport.sent().len(), 1);
    assert_eq!(fx.store.dispatches_for_customer(customer).await.unwrap().len(), 1);
}

#[actix_rt::test]
async fn test_authentication_failure_is_recorded() {
    let fx = Fixture::new().await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;
    fx.transport.fail_all(TransportError::AuthenticationFailed(
        "535 5.7.8 bad credentials".to_string(),
    ));

    let report = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.count(OutcomeKind::Failed), 1);
    assert_eq!(report.summary.follow_up.len(), 1);
    let detail = report.outcomes[0].detail.clone().unwrap();
    assert!(detail.contains("authentication failed"));
    assert!(detail.contains("bad credentials"));

    let records = fx.store.dispatches_for_customer(customer).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DispatchStatus::Failed);
    assert!(records[0].sent_at.is_none());
    assert!(records[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("bad credentials"));
}

#[actix_rt::test]
async fn test_failed_dispatch_is_retried_as_new_attempt() {
    let fx = Fixture::new().await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;
    fx.transport.script(
        "test@example.com",
        Behavior::Fail(TransportError::ConnectionFailed("connection refused".to_string())),
    );

    let first = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(first.summary.count(OutcomeKind::Failed), 1);

    // el servidor vuelve
    fx.transport.script("test@example.com", Behavior::Delay(Duration::ZERO));
    let second = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(second.summary.count(OutcomeKind::Sent), 1);

    let records = fx.store.dispatches_for_customer(customer).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, DispatchStatus::Failed);
    assert_eq!(records[0].attempt, 1);
    assert_eq!(records[1].status, DispatchStatus::Sent);
    assert_eq!(records[1].attempt, 2);
}

#[actix_rt::test]
async fn test_retry_limit_stops_further_attempts() {
    let fx = Fixture::with_config(DispatchConfig {
        max_failed_attempts: 2,
        ..DispatchConfig::default()
    })
    .await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;
    fx.transport
        .fail_all(TransportError::ConnectionFailed("connection refused".to_string()));

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let report = fx
            .service
            .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
            .await
            .unwrap();
        kinds.push(report.outcomes[0].kind);
    }

    assert_eq!(
        kinds,
        vec![
            OutcomeKind::Failed,
            OutcomeKind::Failed,
            OutcomeKind::RetryLimitReached
        ]
    );
    assert_eq!(fx.store.dispatches_for_customer(customer).await.unwrap().len(), 2);
}

#[actix_rt::test]
async fn test_customer_without_addresses_is_reported() {
    let fx = Fixture::new().await;
    let germany = fx.category("Germany").await;
    let customer = fx.customer("Leer AG", &[]).await;
    fx.store.map_interest(customer, germany).await.unwrap();
    let change = fx
        .change("EDL-G audit deadline moved", (2025, 12, 5), Some(germany))
        .await;

    let report = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.count(OutcomeKind::NoRecipients), 1);
    assert_eq!(report.summary.follow_up[0].customer_id, customer);
    assert!(fx.transport.sent().is_empty());

    let records = fx.store.dispatches_for_customer(customer).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DispatchStatus::Failed);
    assert!(records[0]
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("no_recipients"));
}

#[actix_rt::test]
async fn test_partial_delivery_counts_as_sent() {
    let fx = Fixture::new().await;
    let customer = fx
        .customer("Test GmbH", &["energy@test-gmbh.example", "old@test-gmbh.example"])
        .await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;
    fx.transport.script(
        "old@test-gmbh.example",
        Behavior::Fail(TransportError::Rejected {
            address: "old@test-gmbh.example".to_string(),
            reason: "550 mailbox unavailable".to_string(),
        }),
    );

    let report = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.count(OutcomeKind::Sent), 1);
    let detail = report.outcomes[0].detail.clone().unwrap();
    assert!(detail.contains("old@test-gmbh.example"));
    assert!(!detail.contains("energy@test-gmbh.example"));

    let sent = fx.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["energy@test-gmbh.example".to_string()]);

    let records = fx.store.dispatches_for_customer(customer).await.unwrap();
    assert_eq!(records[0].status, DispatchStatus::Sent);
    assert!(records[0].error_message.is_some());
}

#[actix_rt::test]
async fn test_one_customer_failing_does_not_stop_others() {
    let fx = Fixture::new().await;
    let broken = fx.customer("Broken GmbH", &["broken@example.com"]).await;
    let healthy = fx.customer("Healthy AG", &["healthy@example.com"]).await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;
    fx.transport.script(
        "broken@example.com",
        Behavior::Fail(TransportError::ConnectionFailed("reset by peer".to_string())),
    );

    let report = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.total, 2);
    let kind_of = |id| report.outcomes.iter().find(|o| o.customer_id == id).unwrap().kind;
    assert_eq!(kind_of(broken), OutcomeKind::Failed);
    assert_eq!(kind_of(healthy), OutcomeKind::Sent);
}

#[actix_rt::test]
async fn test_template_error_aborts_before_any_send() {
    let renderer = TemplateService::new("Update {{ quarter }}", "<p>{{ no_such_field }}</p>").unwrap();
    let fx = Fixture::build(DispatchConfig::default(), renderer).await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    fx.customer("Other GmbH", &["other@example.com"]).await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;

    let result = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await;

    assert!(matches!(result, Err(DispatchError::Template(_))));
    assert!(fx.transport.sent().is_empty());
    assert!(fx.store.dispatches_for_customer(customer).await.unwrap().is_empty());
}

#[actix_rt::test]
async fn test_concurrent_runs_send_once() {
    let fx = Fixture::new().await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;
    fx.transport
        .script("test@example.com", Behavior::Delay(Duration::from_millis(200)));

    let ctx = q3();
    let ids = [change.id];
    let (first_token, second_token) = (CancelToken::new(), CancelToken::new());
    let (a, b) = futures::join!(
        fx.service.dispatch_changes(&ids, &ctx, &first_token),
        fx.service.dispatch_changes(&ids, &ctx, &second_token)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let sent = a.summary.count(OutcomeKind::Sent) + b.summary.count(OutcomeKind::Sent);
    let skipped =
        a.summary.count(OutcomeKind::AlreadySent) + b.summary.count(OutcomeKind::AlreadySent);
    assert_eq!(sent, 1);
    assert_eq!(skipped, 1);
    assert_eq!(fx.transport.sent().len(), 1);
    assert_eq!(fx.store.dispatches_for_customer(customer).await.unwrap().len(), 1);
}

#[actix_rt::test]
async fn test_cancelled_run_sends_nothing() {
    let fx = Fixture::new().await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &cancel)
        .await
        .unwrap();

    assert_eq!(report.summary.count(OutcomeKind::Cancelled), 1);
    assert!(fx.transport.sent().is_empty());
    assert!(fx.store.dispatches_for_customer(customer).await.unwrap().is_empty());
    assert_eq!(fx.service.cancel_runs(), 0);
}

#[actix_rt::test]
async fn test_slow_server_times_out() {
    let fx = Fixture::with_config(DispatchConfig {
        send_timeout: Duration::from_millis(50),
        ..DispatchConfig::default()
    })
    .await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;
    fx.transport
        .script("test@example.com", Behavior::Delay(Duration::from_secs(5)));

    let report = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.count(OutcomeKind::Failed), 1);
    assert!(report.outcomes[0]
        .detail
        .as_deref()
        .unwrap()
        .contains("timed out after 50ms"));
    let records = fx.store.dispatches_for_customer(customer).await.unwrap();
    assert_eq!(records[0].status, DispatchStatus::Failed);
}

#[actix_rt::test]
async fn test_dispatch_since_only_takes_newer_changes() {
    let fx = Fixture::new().await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    fx.change("Old announcement", (2025, 1, 1), None).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let since = Utc::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fresh = fx.change("New rule for energy audits", (2025, 7, 1), None).await;

    let report = fx
        .service
        .dispatch_since(since, &q3(), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.count(OutcomeKind::Sent), 1);
    assert_eq!(report.outcomes[0].change_ids, vec![fresh.id]);
    let body = &fx.transport.sent()[0].body_html;
    assert!(body.contains("New rule for energy audits"));
    assert!(!body.contains("Old announcement"));
    assert_eq!(fx.store.dispatches_for_customer(customer).await.unwrap().len(), 1);
}

#[actix_rt::test]
async fn test_changes_are_rendered_in_effective_date_order() {
    let fx = Fixture::new().await;
    let germany = fx.category("Germany").await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    fx.store.map_interest(customer, germany).await.unwrap();
    let later = fx.change("Audit deadline in December", (2025, 12, 5), Some(germany)).await;
    let earlier = fx.change("Reporting duty from July", (2025, 7, 1), None).await;

    let report = fx
        .service
        .dispatch_changes(&[later.id, earlier.id], &q3(), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].change_ids, vec![earlier.id, later.id]);
    let body = &fx.transport.sent()[0].body_html;
    let july = body.find("Reporting duty from July").unwrap();
    let december = body.find("Audit deadline in December").unwrap();
    assert!(july < december);
    assert!(body.contains("Germany"));
}

#[actix_rt::test]
async fn test_unknown_change_id_is_rejected() {
    let fx = Fixture::new().await;
    fx.customer("Test GmbH", &["test@example.com"]).await;

    let result = fx
        .service
        .dispatch_changes(&[4242], &q3(), &CancelToken::new())
        .await;

    assert!(matches!(result, Err(DispatchError::Targeting(_))));
    assert!(fx.transport.sent().is_empty());
}

#[actix_rt::test]
async fn test_dispatch_request_requires_exactly_one_selector() {
    let fx = Fixture::new().await;

    let neither = DispatchRequest {
        since: None,
        change_ids: None,
        quarter: None,
        year: None,
    };
    let both = DispatchRequest {
        since: Some(Utc::now()),
        change_ids: Some(vec![1]),
        quarter: None,
        year: None,
    };

    assert!(matches!(
        fx.service.run_dispatch_request(neither).await,
        Err(DispatchError::InvalidRequest(_))
    ));
    assert!(matches!(
        fx.service.run_dispatch_request(both).await,
        Err(DispatchError::InvalidRequest(_))
    ));
}

#[actix_rt::test]
async fn test_send_test_writes_no_history() {
    let fx = Fixture::new().await;

    let response = fx.service.send_test(TEST_RECIPIENT, &q3()).await.unwrap();

    assert!(response.success);
    assert_eq!(response.subject, "Test ISO 50001 Update Q3 2025");
    let sent = fx.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec![TEST_RECIPIENT.to_string()]);
    assert!(sent[0].body_html.contains("Test GmbH"));
    assert!(sent[0].body_html.contains("New rule for energy audits."));
    assert!(sent[0].body_html.contains("Germany"));

    for customer in fx.store.list_customers().await.unwrap() {
        assert!(fx
            .store
            .dispatches_for_customer(customer.id)
            .await
            .unwrap()
            .is_empty());
    }
    let audit = fx.store.recent_audit(1).await.unwrap();
    assert_eq!(audit[0].action, "send_test");
}

#[actix_rt::test]
async fn test_send_test_reports_transport_error() {
    let fx = Fixture::new().await;
    fx.transport.fail_all(TransportError::AuthenticationFailed(
        "535 bad credentials".to_string(),
    ));

    let response = fx.service.send_test("qa@example.com", &q3()).await.unwrap();

    assert!(!response.success);
    assert!(response.error.unwrap().contains("bad credentials"));
    assert_eq!(response.recipient, "qa@example.com");
    assert!(fx.transport.sent().is_empty());
}

#[actix_rt::test]
async fn test_reconcile_marks_stale_pending_failed() {
    let fx = Fixture::new().await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;

    // Simula un proceso que murió después de reclamar el envío
    let pending = crate::models::dispatch_model::PendingDispatch {
        batch_id: "crashed-batch".to_string(),
        customer_id: customer,
        change_key: crate::models::dispatch_model::change_key(&[change.id]),
        attempt: 1,
        subject: "ISO 50001 Update Q3 2025".to_string(),
        body_html: "<p>half sent</p>".to_string(),
    };
    fx.store.insert_pending_dispatch(&pending).await.unwrap();

    // un pending en curso bloquea el reenvío
    let blocked = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(blocked.summary.count(OutcomeKind::AlreadySent), 1);

    // reciente: no se toca
    assert_eq!(
        fx.service
            .reconcile_stale_pending(Duration::from_secs(3600))
            .await
            .unwrap(),
        0
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        fx.service
            .reconcile_stale_pending(Duration::from_millis(1))
            .await
            .unwrap(),
        1
    );
    let records = fx.store.dispatches_for_customer(customer).await.unwrap();
    assert_eq!(records[0].status, DispatchStatus::Failed);
    assert!(records[0].error_message.as_deref().unwrap().contains("unknown"));

    // ahora sí se puede reintentar
    let retried = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(retried.summary.count(OutcomeKind::Sent), 1);
}

#[actix_rt::test]
async fn test_open_and_click_tracking() {
    let fx = Fixture::new().await;
    let customer = fx.customer("Test GmbH", &["test@example.com"]).await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;
    let report = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();
    let dispatch_id = report.outcomes[0].dispatch_id.clone().unwrap();

    assert!(fx.store.mark_clicked(&dispatch_id).await.unwrap());
    let first = fx.store.get_dispatch(&dispatch_id).await.unwrap().unwrap();
    assert!(first.clicked_at.is_some());
    assert_eq!(first.opened_at, first.clicked_at);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(fx.store.mark_opened(&dispatch_id).await.unwrap());
    let second = fx.store.get_dispatch(&dispatch_id).await.unwrap().unwrap();
    assert_eq!(second.opened_at, first.opened_at);

    assert!(!fx.store.mark_opened("no-such-dispatch").await.unwrap());
    assert_eq!(fx.store.dispatches_for_customer(customer).await.unwrap().len(), 1);
}

#[actix_rt::test]
async fn test_no_recipient_runs_do_not_use_up_retries() {
    let fx = Fixture::new().await;
    let germany = fx.category("Germany").await;
    let customer = fx.customer("Leer AG", &[]).await;
    fx.store.map_interest(customer, germany).await.unwrap();
    let change = fx
        .change("EDL-G audit deadline moved", (2025, 12, 5), Some(germany))
        .await;

    for _ in 0..DispatchConfig::default().max_failed_attempts {
        let report = fx
            .service
            .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcomes[0].kind, OutcomeKind::NoRecipients);
    }
    assert_eq!(
        fx.store
            .count_failed_attempts(customer, &change_key(&[change.id]))
            .await
            .unwrap(),
        0
    );

    fx.store.add_recipient(customer, "energy@leer.example").await.unwrap();
    let report = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].kind, OutcomeKind::Sent);
    assert_eq!(fx.transport.sent().len(), 1);
    let records = fx.store.dispatches_for_customer(customer).await.unwrap();
    let sent = records
        .iter()
        .find(|r| r.status == DispatchStatus::Sent)
        .unwrap();
    assert_eq!(sent.attempt, 1);
}

#[actix_rt::test]
async fn test_overlapping_runs_can_each_be_cancelled() {
    let fx = Fixture::new().await;
    let fast_scope = fx.category("Austria").await;
    let slow_scope = fx.category("Germany").await;
    let fast = fx.customer("Fast AG", &["fast@example.com"]).await;
    let slow = fx.customer("Slow GmbH", &["slow@example.com"]).await;
    fx.store.map_interest(fast, fast_scope).await.unwrap();
    fx.store.map_interest(slow, slow_scope).await.unwrap();
    let fast_change = fx.change("Austrian reporting rule", (2025, 7, 1), Some(fast_scope)).await;
    let slow_change = fx.change("German audit rule", (2025, 7, 1), Some(slow_scope)).await;
    fx.transport
        .script("slow@example.com", Behavior::Delay(Duration::from_millis(800)));

    let request = |id| DispatchRequest {
        since: None,
        change_ids: Some(vec![id]),
        quarter: Some("Q3 2025".to_string()),
        year: Some(2025),
    };
    let (fast_run, slow_run, cancelled) = futures::join!(
        fx.service.run_dispatch_request(request(fast_change.id)),
        fx.service.run_dispatch_request(request(slow_change.id)),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            fx.service.cancel_runs()
        }
    );

    // el run rápido ya terminó; el lento sigue registrado y se puede cancelar
    assert!(cancelled >= 1);
    assert_eq!(fast_run.unwrap().outcomes[0].kind, OutcomeKind::Sent);
    // el envío en curso termina normalmente
    assert_eq!(slow_run.unwrap().outcomes[0].kind, OutcomeKind::Sent);
    assert_eq!(fx.service.cancel_runs(), 0);
}

#[actix_rt::test]
async fn test_store_failure_only_affects_that_customer() {
    let fx = Fixture::new().await;
    let broken = fx.customer("Broken GmbH", &["broken@example.com"]).await;
    let healthy = fx.customer("Healthy AG", &["healthy@example.com"]).await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;
    sqlx::query(&format!(
        "CREATE TRIGGER reject_dispatch_for_broken BEFORE INSERT ON newsletter_dispatch \
         WHEN NEW.customer_id = {broken} \
         BEGIN SELECT RAISE(ABORT, 'simulated disk failure'); END;"
    ))
    .execute(fx.store.pool())
    .await
    .unwrap();

    let report = fx
        .service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();

    let outcome_of = |id| report.outcomes.iter().find(|o| o.customer_id == id).unwrap();
    assert_eq!(outcome_of(broken).kind, OutcomeKind::StoreError);
    assert!(outcome_of(broken)
        .detail
        .as_deref()
        .unwrap()
        .contains("Failed to insert pending dispatch"));
    assert_eq!(outcome_of(healthy).kind, OutcomeKind::Sent);
    assert_eq!(report.summary.follow_up.len(), 1);

    let sent = fx.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["healthy@example.com".to_string()]);
    assert!(fx.store.dispatches_for_customer(broken).await.unwrap().is_empty());
}

#[actix_rt::test]
async fn test_each_recipient_sees_own_address() {
    let fx = Fixture::new().await;
    fx.customer("Test GmbH", &["energy@test-gmbh.example", "ceo@test-gmbh.example"])
        .await;
    let change = fx.change("New rule for energy audits", (2025, 7, 1), None).await;

    fx.service
        .dispatch_changes(&[change.id], &q3(), &CancelToken::new())
        .await
        .unwrap();

    let sent = fx.transport.sent();
    assert_eq!(sent.len(), 2);
    for mail in &sent {
        let own = &mail.to[0];
        let other = sent.iter().find(|m| &m.to[0] != own).unwrap();
        assert!(mail.body_html.contains(own.as_str()));
        assert!(!mail.body_html.contains(other.to[0].as_str()));
    }
}
