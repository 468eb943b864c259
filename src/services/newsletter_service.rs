//! services/newsletter_service.rs
//! Punto de entrada para el front-end: despachar newsletters por fecha o por
//! lista de cambios, y el envío de prueba.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::errors::{DispatchError, TransportError};
use crate::models::change_model::{ChangeId, ChangeType, RegulatoryChange};
use crate::models::customer_model::Customer;
use crate::models::dispatch_model::{DispatchReport, DispatchRequest, TestSendResponse};
use crate::models::newsletter_model::RenderContext;
use crate::services::dispatch_service::{CancelToken, DispatchService};
use crate::services::newsletter_store::NewsletterStore;
use crate::services::targeting::TargetingService;

pub const TEST_RECIPIENT: &str = "test@example.com";
const TEST_CUSTOMER_NAME: &str = "Test GmbH";

#[derive(Clone)]
pub struct NewsletterService {
    store: NewsletterStore,
    targeting: TargetingService,
    dispatch: DispatchService,
    // Tokens de las corridas en curso, por id de corrida
    runs: Arc<Mutex<HashMap<u64, CancelToken>>>,
    next_run: Arc<AtomicU64>,
}

impl NewsletterService {
    pub fn new(store: NewsletterStore, dispatch: DispatchService) -> Self {
        Self {
            targeting: TargetingService::new(store.clone()),
            store,
            dispatch,
            runs: Arc::new(Mutex::new(HashMap::new())),
            next_run: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn store(&self) -> &NewsletterStore {
        &self.store
    }

    /// Newsletters for every change recorded after `since`.
    pub async fn dispatch_since(
        &self,
        since: DateTime<Utc>,
        ctx: &RenderContext,
        cancel: &CancelToken,
    ) -> Result<DispatchReport, DispatchError> {
        let changes = self
            .store
            .changes_since(since)
            .await
            .map_err(DispatchError::Targeting)?;
        log::info!(
            "(dispatch_since) {} cambios desde {}",
            changes.len(),
            since.to_rfc3339()
        );
        self.dispatch_changes_list(&changes, ctx, cancel).await
    }

    /// Newsletters for an explicit list of change ids.
    pub async fn dispatch_changes(
        &self,
        change_ids: &[ChangeId],
        ctx: &RenderContext,
        cancel: &CancelToken,
    ) -> Result<DispatchReport, DispatchError> {
        let changes = self
            .store
            .changes_by_ids(change_ids)
            .await
            .map_err(DispatchError::Targeting)?;
        self.dispatch_changes_list(&changes, ctx, cancel).await
    }

    async fn dispatch_changes_list(
        &self,
        changes: &[RegulatoryChange],
        ctx: &RenderContext,
        cancel: &CancelToken,
    ) -> Result<DispatchReport, DispatchError> {
        let targets = self
            .targeting
            .resolve(changes)
            .await
            .map_err(DispatchError::Targeting)?;
        self.dispatch.dispatch_batch(&targets, ctx, cancel).await
    }

    /// Runs a request as an operator run, registered so `cancel_runs` can
    /// stop it. Overlapping runs each keep their own token.
    pub async fn run_dispatch_request(
        &self,
        req: DispatchRequest,
    ) -> Result<DispatchReport, DispatchError> {
        let run_id = self.next_run.fetch_add(1, Ordering::SeqCst);
        let cancel = CancelToken::new();
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id, cancel.clone());
        // se desregistra también si el request HTTP se corta a mitad
        let _registration = RunRegistration {
            runs: self.runs.clone(),
            run_id,
        };

        self.handle_dispatch_request(req, &cancel).await
    }

    /// Cancels every run in progress. Returns how many were cancelled.
    pub fn cancel_runs(&self) -> usize {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        for (run_id, token) in runs.iter() {
            log::warn!("(cancel_runs) corrida {} cancelada por el operador", run_id);
            token.cancel();
        }
        runs.len()
    }

    /// Validates an HTTP dispatch request and runs it.
    pub async fn handle_dispatch_request(
        &self,
        req: DispatchRequest,
        cancel: &CancelToken,
    ) -> Result<DispatchReport, DispatchError> {
        let ctx = render_context(req.quarter, req.year);
        match (req.since, req.change_ids) {
            (Some(since), None) => self.dispatch_since(since, &ctx, cancel).await,
            (None, Some(ids)) => self.dispatch_changes(&ids, &ctx, cancel).await,
            _ => Err(DispatchError::InvalidRequest(
                "exactly one of 'since' or 'change_ids' is required".to_string(),
            )),
        }
    }

    /// Sends the sample newsletter for "Test GmbH" to `recipient`. No
    /// dispatch history is written.
    pub async fn send_test(
        &self,
        recipient: &str,
        ctx: &RenderContext,
    ) -> Result<TestSendResponse, DispatchError> {
        let (customer, changes) = sample_newsletter();
        let document = self
            .dispatch
            .renderer()
            .render(&customer, recipient, &changes, ctx)?;
        let subject = format!("Test {}", document.subject);

        let to = [recipient.to_string()];
        let timeout = self.dispatch.send_timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.dispatch.transport().send(
                self.dispatch.from_address(),
                &to,
                &subject,
                &document.body_html,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        let error = match &result {
            Ok(_) => {
                log::info!("Sent test newsletter to {}", recipient);
                None
            }
            Err(e) => {
                log::error!("Failed to send test newsletter to {}: {}", recipient, e);
                Some(e.to_string())
            }
        };

        let details = format!(
            "recipient={} result={}",
            recipient,
            error.as_deref().unwrap_or("sent")
        );
        if let Err(e) = self
            .store
            .append_audit(None, "send_test", "newsletter_dispatch", "-", Some(&details))
            .await
        {
            log::warn!("(send_test) sin auditoría: {:#}", e);
        }

        Ok(TestSendResponse {
            success: error.is_none(),
            recipient: recipient.to_string(),
            subject,
            error,
        })
    }

    pub fn stale_pending_after(&self) -> Duration {
        self.dispatch.stale_pending_after()
    }

    pub async fn reconcile_stale_pending(&self, older_than: Duration) -> Result<u64> {
        let reconciled = self.store.reconcile_stale_pending(older_than).await?;
        if reconciled > 0 {
            log::warn!(
                "(reconcile_stale_pending) {} envíos pending marcados como failed",
                reconciled
            );
        }
        Ok(reconciled)
    }
}

struct RunRegistration {
    runs: Arc<Mutex<HashMap<u64, CancelToken>>>,
    run_id: u64,
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.run_id);
    }
}

/// Quarter/year from the request, falling back to the current quarter.
pub fn render_context(quarter: Option<String>, year: Option<i32>) -> RenderContext {
    let current = RenderContext::for_date(Utc::now().date_naive());
    RenderContext {
        quarter: quarter.unwrap_or(current.quarter),
        year: year.unwrap_or(current.year),
    }
}

/// Synthetic customer and change used by the test send.
pub fn sample_newsletter() -> (Customer, Vec<RegulatoryChange>) {
    let created = Utc
        .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default();
    let customer = Customer {
        id: 0,
        name: TEST_CUSTOMER_NAME.to_string(),
        active: true,
        created_at: created,
    };
    let change = RegulatoryChange {
        id: 0,
        content: "New rule for energy audits.".to_string(),
        effective_date: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap_or_default(),
        change_type: ChangeType::Change,
        category_id: None,
        category_name: Some("Germany".to_string()),
        added_at: created,
        added_by: "system".to_string(),
    };
    (customer, vec![change])
}
