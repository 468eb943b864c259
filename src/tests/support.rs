//! tests/support.rs
//! Fixture compartido: base temporal migrada + transporte que graba envíos.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::config::app_config::{DatabaseConfig, DispatchConfig, TemplateConfig};
use crate::errors::TransportError;
use crate::models::change_model::{ChangeType, NewRegulatoryChange, RegulatoryChange};
use crate::models::customer_model::{CategoryId, CustomerId, NewCategoryRequest, NewCustomerRequest};
use crate::services::dispatch_service::DispatchService;
use crate::services::mail_transport::{MailTransport, SendReceipt};
use crate::services::newsletter_service::NewsletterService;
use crate::services::newsletter_store::NewsletterStore;
use crate::services::template_service::TemplateService;

pub const FROM_ADDRESS: &str = "newsletter@iso-consulting.example";

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: Vec<String>,
    pub subject: String,
    pub body_html: String,
}

/// What the transport does for a given address.
#[derive(Debug, Clone)]
pub enum Behavior {
    Fail(TransportError),
    Delay(Duration),
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMail>>,
    script: Mutex<HashMap<String, Behavior>>,
    fail_all: Mutex<Option<TransportError>>,
}

impl RecordingTransport {
    pub fn script(&self, address: &str, behavior: Behavior) {
        self.script
            .lock()
            .unwrap()
            .insert(address.to_string(), behavior);
    }

    pub fn fail_all(&self, error: TransportError) {
        *self.fail_all.lock().unwrap() = Some(error);
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(
        &self,
        _from: &str,
        to: &[String],
        subject: &str,
        body_html: &str,
    ) -> Result<SendReceipt, TransportError> {
        let fail_all = self.fail_all.lock().unwrap().clone();
        if let Some(error) = fail_all {
            return Err(error);
        }

        let behavior = to
            .iter()
            .find_map(|address| self.script.lock().unwrap().get(address).cloned());
        match behavior {
            Some(Behavior::Fail(error)) => return Err(error),
            Some(Behavior::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        self.sent.lock().unwrap().push(SentMail {
            to: to.to_vec(),
            subject: subject.to_string(),
            body_html: body_html.to_string(),
        });
        Ok(SendReceipt {
            accepted: to.to_vec(),
        })
    }
}

pub struct Fixture {
    // Mantener vivo el directorio mientras dure la prueba
    _dir: TempDir,
    pub store: NewsletterStore,
    pub transport: Arc<RecordingTransport>,
    pub service: NewsletterService,
}

impl Fixture {
    pub async fn new() -> Fixture {
        Fixture::with_config(DispatchConfig::default()).await
    }

    pub async fn with_config(config: DispatchConfig) -> Fixture {
        let renderer = TemplateService::from_config(&TemplateConfig::default()).unwrap();
        Fixture::build(config, renderer).await
    }

    pub async fn build(config: DispatchConfig, renderer: TemplateService) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("newsletter_test.db");
        let store = NewsletterStore::connect(&DatabaseConfig {
            url: format!("sqlite:{}", db_path.display()),
            max_connections: 5,
        })
        .await
        .unwrap();
        store.run_migrations().await.unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let dyn_transport: Arc<dyn MailTransport> = transport.clone();
        let dispatch = DispatchService::new(
            store.clone(),
            renderer,
            dyn_transport,
            FROM_ADDRESS.to_string(),
            config,
        );
        let service = NewsletterService::new(store.clone(), dispatch);

        Fixture {
            _dir: dir,
            store,
            transport,
            service,
        }
    }

    pub async fn customer(&self, name: &str, emails: &[&str]) -> CustomerId {
        let id = self
            .store
            .create_customer(NewCustomerRequest {
                name: name.to_string(),
                active: true,
                email: None,
            })
            .await
            .unwrap();
        for email in emails {
            self.store.add_recipient(id, email).await.unwrap();
        }
        id
    }

    pub async fn category(&self, scope: &str) -> CategoryId {
        self.store
            .create_category(NewCategoryRequest {
                scope: scope.to_string(),
                description: format!("{} regulations", scope),
            })
            .await
            .unwrap()
    }

    pub async fn change(
        &self,
        content: &str,
        effective: (i32, u32, u32),
        category_id: Option<CategoryId>,
    ) -> RegulatoryChange {
        self.store
            .add_change(NewRegulatoryChange {
                content: content.to_string(),
                effective_date: NaiveDate::from_ymd_opt(effective.0, effective.1, effective.2)
                    .unwrap(),
                change_type: ChangeType::Change,
                category_id,
                added_by: "admin".to_string(),
            })
            .await
            .unwrap()
    }
}
