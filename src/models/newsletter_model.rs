//! models/newsletter_model.rs
//! Entrada y salida del renderizado del newsletter.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Per-run rendering context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderContext {
    pub quarter: String,
    pub year: i32,
}

impl RenderContext {
    pub fn new(quarter: impl Into<String>, year: i32) -> Self {
        Self {
            quarter: quarter.into(),
            year,
        }
    }

    /// "Q3 2025" style context for the quarter containing `date`.
    pub fn for_date(date: NaiveDate) -> Self {
        let quarter = (date.month0() / 3) + 1;
        Self {
            quarter: format!("Q{} {}", quarter, date.year()),
            year: date.year(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedDocument {
    pub subject: String,
    pub body_html: String,
}
