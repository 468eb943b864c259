//! services/dispatch_service.rs
//! Motor de envíos: por cliente, renderiza, reclama el par (cliente, lote)
//! en la base, envía a cada dirección y deja el resultado registrado.

use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::app_config::DispatchConfig;
use crate::errors::{DispatchError, TransportError};
use crate::models::change_model::{ChangeId, RegulatoryChange};
use crate::models::customer_model::{Customer, CustomerId};
use crate::models::dispatch_model::{
    change_key, DispatchOutcome, DispatchReport, DispatchStatus, DispatchSummary, OutcomeKind,
    PendingDispatch, PendingInsert, NO_RECIPIENTS_REASON,
};
use crate::models::newsletter_model::{RenderContext, RenderedDocument};
use crate::services::mail_transport::MailTransport;
use crate::services::newsletter_store::NewsletterStore;
use crate::services::targeting::Targets;
use crate::services::template_service::TemplateService;

/// Operator abort for a running dispatch. Customers that have not started
/// when it fires are reported as cancelled; in-flight sends finish.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything needed to dispatch one customer, computed before any write.
/// One document per address, since the footer names the recipient.
struct PreparedDispatch {
    customer: Customer,
    deliveries: Vec<(String, RenderedDocument)>,
    change_ids: Vec<ChangeId>,
    // lo que queda archivado en el registro
    archive: RenderedDocument,
}

enum Preparation {
    Ready(PreparedDispatch),
    Done(DispatchOutcome),
}

#[derive(Clone)]
pub struct DispatchService {
    store: NewsletterStore,
    renderer: TemplateService,
    transport: Arc<dyn MailTransport>,
    from_address: String,
    config: DispatchConfig,
}

impl DispatchService {
    pub fn new(
        store: NewsletterStore,
        renderer: TemplateService,
        transport: Arc<dyn MailTransport>,
        from_address: String,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            renderer,
            transport,
            from_address,
            config,
        }
    }

    pub fn renderer(&self) -> &TemplateService {
        &self.renderer
    }

    pub fn transport(&self) -> &Arc<dyn MailTransport> {
        &self.transport
    }

    pub fn from_address(&self) -> &str {
        &self.from_address
    }

    pub fn send_timeout(&self) -> std::time::Duration {
        self.config.send_timeout
    }

    pub fn stale_pending_after(&self) -> std::time::Duration {
        self.config.stale_pending_after
    }

    /// Dispatches one newsletter per targeted customer.
    ///
    /// Every document is rendered before the first write or send, so a
    /// template error aborts the run with nothing sent. After that each
    /// customer is independent: failures are reported per customer and the
    /// run continues. Customers run concurrently, bounded by
    /// `DispatchConfig::workers`.
    pub async fn dispatch_batch(
        &self,
        targets: &Targets,
        ctx: &RenderContext,
        cancel: &CancelToken,
    ) -> Result<DispatchReport, DispatchError> {
        let batch_id = Uuid::new_v4().to_string();
        log::info!(
            "(dispatch_batch) batch={} iniciando para {} clientes",
            batch_id,
            targets.len()
        );

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut ready = Vec::new();
        for (customer_id, changes) in targets {
            match self.prepare(&batch_id, *customer_id, changes, ctx).await? {
                Preparation::Ready(prepared) => ready.push(prepared),
                Preparation::Done(outcome) => outcomes.push(outcome),
            }
        }

        let workers = self.config.workers.max(1);
        let dispatched: Vec<DispatchOutcome> = stream::iter(ready)
            .map(|prepared| self.dispatch_customer(&batch_id, prepared, cancel))
            .buffer_unordered(workers)
            .collect()
            .await;
        outcomes.extend(dispatched);
        outcomes.sort_by_key(|o| o.customer_id);

        let summary = DispatchSummary::from_outcomes(&outcomes);
        log::info!(
            "(dispatch_batch) batch={} finalizado: total={} sent={} already_sent={} failed={} no_recipients={} follow_up={}",
            batch_id,
            summary.total,
            summary.count(OutcomeKind::Sent),
            summary.count(OutcomeKind::AlreadySent),
            summary.count(OutcomeKind::Failed),
            summary.count(OutcomeKind::NoRecipients),
            summary.follow_up.len()
        );

        Ok(DispatchReport {
            batch_id,
            outcomes,
            summary,
        })
    }

    /// Reads the customer and renders its document. Only a template error
    /// escapes as `Err`; store problems become a per-customer outcome.
    async fn prepare(
        &self,
        batch_id: &str,
        customer_id: CustomerId,
        changes: &[RegulatoryChange],
        ctx: &RenderContext,
    ) -> Result<Preparation, DispatchError> {
        let change_ids: Vec<ChangeId> = changes.iter().map(|c| c.id).collect();

        let customer = match self.store.get_customer(customer_id).await {
            Ok(Some(customer)) => customer,
            Ok(None) => {
                return Ok(Preparation::Done(store_error(
                    customer_id,
                    String::new(),
                    change_ids,
                    "customer not found".to_string(),
                )))
            }
            Err(e) => {
                log::error!(
                    "(prepare) customer={} batch={} no se pudo leer el cliente: {:#}",
                    customer_id,
                    batch_id,
                    e
                );
                return Ok(Preparation::Done(store_error(
                    customer_id,
                    String::new(),
                    change_ids,
                    format!("{:#}", e),
                )));
            }
        };

        let recipients = match self.store.active_recipients(customer_id).await {
            Ok(recipients) => recipients,
            Err(e) => {
                log::error!(
                    "(prepare) customer={} batch={} no se pudieron leer direcciones: {:#}",
                    customer_id,
                    batch_id,
                    e
                );
                return Ok(Preparation::Done(store_error(
                    customer_id,
                    customer.name,
                    change_ids,
                    format!("{:#}", e),
                )));
            }
        };

        let render = |address: &str| {
            self.renderer
                .render(&customer, address, changes, ctx)
                .map_err(|e| {
                    log::error!(
                        "(prepare) customer={} batch={} plantilla inválida, abortando corrida: {}",
                        customer_id,
                        batch_id,
                        e
                    );
                    DispatchError::Template(e)
                })
        };

        let mut deliveries = Vec::with_capacity(recipients.len());
        for address in &recipients {
            deliveries.push((address.clone(), render(address)?));
        }
        // Sin direcciones igual se renderiza: un error de plantilla aborta la corrida
        let archive = match deliveries.first() {
            Some((_, document)) => document.clone(),
            None => render("")?,
        };

        Ok(Preparation::Ready(PreparedDispatch {
            customer,
            deliveries,
            change_ids,
            archive,
        }))
    }

    async fn dispatch_customer(
        &self,
        batch_id: &str,
        prepared: PreparedDispatch,
        cancel: &CancelToken,
    ) -> DispatchOutcome {
        let PreparedDispatch {
            customer,
            deliveries,
            change_ids,
            archive,
        } = prepared;
        let key = change_key(&change_ids);
        let outcome = |kind: OutcomeKind, dispatch_id: Option<String>, detail: Option<String>| {
            DispatchOutcome {
                customer_id: customer.id,
                customer_name: customer.name.clone(),
                kind,
                dispatch_id,
                change_ids: change_ids.clone(),
                detail,
            }
        };

        if cancel.is_cancelled() {
            log::warn!(
                "(dispatch_customer) customer={} batch={} cancelado antes de iniciar",
                customer.id,
                batch_id
            );
            return outcome(OutcomeKind::Cancelled, None, None);
        }

        // 1) ya enviado?
        match self.store.find_live_dispatch(customer.id, &key).await {
            Ok(Some(existing)) => {
                log::info!(
                    "(dispatch_customer) customer={} batch={} lote [{}] ya registrado ({}), se omite",
                    customer.id,
                    batch_id,
                    key,
                    existing.status.as_str()
                );
                return outcome(OutcomeKind::AlreadySent, Some(existing.id), None);
            }
            Ok(None) => {}
            Err(e) => return self.log_store_error(batch_id, &customer, e, outcome),
        }

        // 2) límite de reintentos
        let failed_attempts = match self.store.count_failed_attempts(customer.id, &key).await {
            Ok(n) => n,
            Err(e) => return self.log_store_error(batch_id, &customer, e, outcome),
        };
        if failed_attempts >= self.config.max_failed_attempts {
            log::error!(
                "(dispatch_customer) customer={} batch={} lote [{}] con {} intentos fallidos, no se reintenta",
                customer.id,
                batch_id,
                key,
                failed_attempts
            );
            return outcome(
                OutcomeKind::RetryLimitReached,
                None,
                Some(format!("{} failed attempts", failed_attempts)),
            );
        }
        let attempt = failed_attempts + 1;

        // 3) sin direcciones
        if deliveries.is_empty() {
            let reason = NO_RECIPIENTS_REASON;
            log::error!(
                "(dispatch_customer) customer={} batch={} sin direcciones de envío",
                customer.id,
                batch_id
            );
            return match self
                .store
                .insert_failed_dispatch(batch_id, customer.id, &key, attempt, reason)
                .await
            {
                Ok(dispatch_id) => outcome(
                    OutcomeKind::NoRecipients,
                    Some(dispatch_id),
                    Some(reason.to_string()),
                ),
                Err(e) => self.log_store_error(batch_id, &customer, e, outcome),
            };
        }

        // 4) registro pending antes de tocar SMTP
        let pending = PendingDispatch {
            batch_id: batch_id.to_string(),
            customer_id: customer.id,
            change_key: key.clone(),
            attempt,
            subject: archive.subject,
            body_html: archive.body_html,
        };
        let dispatch_id = match self.store.insert_pending_dispatch(&pending).await {
            Ok(PendingInsert::Inserted(id)) => id,
            Ok(PendingInsert::Duplicate) => {
                log::info!(
                    "(dispatch_customer) customer={} batch={} otro envío reclamó el lote [{}]",
                    customer.id,
                    batch_id,
                    key
                );
                return outcome(OutcomeKind::AlreadySent, None, None);
            }
            Err(e) => return self.log_store_error(batch_id, &customer, e, outcome),
        };

        // 5) enviar a cada dirección
        let failures = self
            .send_to_recipients(batch_id, &customer, &deliveries)
            .await;
        let delivered = deliveries.len() - failures.len();

        let (status, kind, detail) = if failures.is_empty() {
            (DispatchStatus::Sent, OutcomeKind::Sent, None)
        } else if delivered > 0 {
            let detail = format!("partial delivery, failed: {}", describe_failures(&failures));
            (DispatchStatus::Sent, OutcomeKind::Sent, Some(detail))
        } else {
            let last = failures
                .last()
                .map(|(_, e)| e.to_string())
                .unwrap_or_default();
            (DispatchStatus::Failed, OutcomeKind::Failed, Some(last))
        };

        // 6) estado final
        if let Err(e) = self
            .store
            .finish_dispatch(&dispatch_id, status, detail.as_deref())
            .await
        {
            log::error!(
                "(dispatch_customer) customer={} batch={} dispatch={} quedó pending: {:#}",
                customer.id,
                batch_id,
                dispatch_id,
                e
            );
            return outcome(
                OutcomeKind::StoreError,
                Some(dispatch_id),
                Some(format!("{:#}", e)),
            );
        }

        let audit_details = format!(
            "batch={} status={} delivered={}/{}",
            batch_id,
            status.as_str(),
            delivered,
            deliveries.len()
        );
        if let Err(e) = self
            .store
            .append_audit(None, "dispatch", "newsletter_dispatch", &dispatch_id, Some(&audit_details))
            .await
        {
            log::warn!("(dispatch_customer) dispatch={} sin auditoría: {:#}", dispatch_id, e);
        }

        match kind {
            OutcomeKind::Sent => log::info!(
                "(dispatch_customer) customer={} batch={} enviado a {}/{} direcciones",
                customer.id,
                batch_id,
                delivered,
                deliveries.len()
            ),
            _ => log::error!(
                "(dispatch_customer) customer={} batch={} falló: {}",
                customer.id,
                batch_id,
                detail.as_deref().unwrap_or_default()
            ),
        }
        outcome(kind, Some(dispatch_id), detail)
    }

    /// One send per address so a bad address does not sink the others.
    /// Returns the failed addresses with their error.
    async fn send_to_recipients(
        &self,
        batch_id: &str,
        customer: &Customer,
        deliveries: &[(String, RenderedDocument)],
    ) -> Vec<(String, TransportError)> {
        let mut failures = Vec::new();
        for (recipient, document) in deliveries {
            let to = [recipient.clone()];
            let send = self.transport.send(
                &self.from_address,
                &to,
                &document.subject,
                &document.body_html,
            );
            let result = match tokio::time::timeout(self.config.send_timeout, send).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.config.send_timeout)),
            };

            if let Err(e) = result {
                log::warn!(
                    "(send_to_recipients) customer={} batch={} recipient={} error: {}",
                    customer.id,
                    batch_id,
                    recipient,
                    e
                );
                failures.push((recipient.clone(), e));
            }
        }
        failures
    }

    fn log_store_error<F>(
        &self,
        batch_id: &str,
        customer: &Customer,
        err: anyhow::Error,
        outcome: F,
    ) -> DispatchOutcome
    where
        F: Fn(OutcomeKind, Option<String>, Option<String>) -> DispatchOutcome,
    {
        log::error!(
            "(dispatch_customer) customer={} batch={} error de base de datos: {:#}",
            customer.id,
            batch_id,
            err
        );
        outcome(OutcomeKind::StoreError, None, Some(format!("{:#}", err)))
    }
}

fn store_error(
    customer_id: CustomerId,
    customer_name: String,
    change_ids: Vec<ChangeId>,
    detail: String,
) -> DispatchOutcome {
    DispatchOutcome {
        customer_id,
        customer_name,
        kind: OutcomeKind::StoreError,
        dispatch_id: None,
        change_ids,
        detail: Some(detail),
    }
}

fn describe_failures(failures: &[(String, TransportError)]) -> String {
    failures
        .iter()
        .map(|(address, e)| format!("{address} ({e})"))
        .collect::<Vec<_>>()
        .join("; ")
}
