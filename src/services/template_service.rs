//! services/template_service.rs
//! Renderiza el newsletter (asunto + HTML) con minijinja.
//!
//! The renderer is a pure function of its inputs: no clock, no I/O after
//! construction. Undefined variables are errors, not empty strings, so a
//! broken template fails the run instead of sending half-empty mails.

use minijinja::{context, Environment, UndefinedBehavior};
use serde::Serialize;

use crate::config::app_config::TemplateConfig;
use crate::errors::TemplateError;
use crate::models::change_model::RegulatoryChange;
use crate::models::customer_model::Customer;
use crate::models::newsletter_model::{RenderContext, RenderedDocument};

/// Built-in body template. Inline CSS only.
pub const DEFAULT_BODY_TEMPLATE: &str = include_str!("../../templates/newsletter.html");

const SUBJECT_NAME: &str = "subject.txt";
// La extensión .html activa el auto-escape de minijinja
const BODY_NAME: &str = "newsletter.html";

/// Markers of resources the archived HTML would need to fetch.
const EXTERNAL_MARKERS: [&str; 5] = ["<link", "<script src", "src=\"http", "src='http", "@import"];

#[derive(Serialize)]
struct ChangeView<'a> {
    #[serde(rename = "type")]
    change_type: &'static str,
    effective_date: String,
    category: Option<&'a str>,
    content: &'a str,
}

#[derive(Clone, Debug)]
pub struct TemplateService {
    subject_source: String,
    body_source: String,
}

impl TemplateService {
    /// Compiles both templates once so syntax errors surface at startup.
    pub fn new(
        subject_source: impl Into<String>,
        body_source: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        let service = TemplateService {
            subject_source: subject_source.into(),
            body_source: body_source.into(),
        };
        service.environment()?;

        let lowered = service.body_source.to_lowercase();
        if let Some(marker) = EXTERNAL_MARKERS.iter().find(|m| lowered.contains(*m)) {
            return Err(TemplateError::Syntax {
                name: BODY_NAME,
                reason: format!("body must be self-contained, found '{}'", marker),
            });
        }
        Ok(service)
    }

    pub fn from_config(config: &TemplateConfig) -> Result<Self, TemplateError> {
        let body = match &config.body_path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| TemplateError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_BODY_TEMPLATE.to_string(),
        };
        log::info!(
            "Plantilla de newsletter cargada ({})",
            config
                .body_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in".to_string())
        );
        TemplateService::new(config.subject.clone(), body)
    }

    fn environment(&self) -> Result<Environment<'_>, TemplateError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_template(SUBJECT_NAME, &self.subject_source)
            .map_err(|e| TemplateError::Syntax {
                name: SUBJECT_NAME,
                reason: e.to_string(),
            })?;
        env.add_template(BODY_NAME, &self.body_source)
            .map_err(|e| TemplateError::Syntax {
                name: BODY_NAME,
                reason: e.to_string(),
            })?;
        Ok(env)
    }

    /// Renders one customer's newsletter. `customer_email` is the address
    /// shown in the footer (the customer's first address).
    pub fn render(
        &self,
        customer: &Customer,
        customer_email: &str,
        changes: &[RegulatoryChange],
        ctx: &RenderContext,
    ) -> Result<RenderedDocument, TemplateError> {
        let env = self.environment()?;

        let change_views: Vec<ChangeView> = changes
            .iter()
            .map(|c| ChangeView {
                change_type: c.change_type.as_str(),
                effective_date: c.effective_date.format("%Y-%m-%d").to_string(),
                category: c.category_name.as_deref(),
                content: &c.content,
            })
            .collect();

        let render_ctx = context! {
            quarter => &ctx.quarter,
            customer_name => &customer.name,
            customer_email => customer_email,
            current_year => ctx.year,
            changes => change_views,
        };

        let subject = render_named(&env, SUBJECT_NAME, &render_ctx)?;
        let body_html = render_named(&env, BODY_NAME, &render_ctx)?;

        Ok(RenderedDocument {
            // una sola línea en el header Subject
            subject: subject.split_whitespace().collect::<Vec<_>>().join(" "),
            body_html,
        })
    }
}

fn render_named(
    env: &Environment<'_>,
    name: &'static str,
    ctx: &minijinja::Value,
) -> Result<String, TemplateError> {
    env.get_template(name)
        .and_then(|tpl| tpl.render(ctx))
        .map_err(|e| TemplateError::Render {
            name,
            reason: format!("{:#}", e),
        })
}
