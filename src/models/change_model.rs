//! models/change_model.rs

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::models::customer_model::CategoryId;

pub type ChangeId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ChangeType {
    Change,
    Deadline,
    Note,
    News,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Change => "change",
            ChangeType::Deadline => "deadline",
            ChangeType::Note => "note",
            ChangeType::News => "news",
        }
    }
}

/// Regulatory change. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RegulatoryChange {
    pub id: ChangeId,
    pub content: String,
    pub effective_date: NaiveDate,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub category_id: Option<CategoryId>,
    /// Scope of the category, joined in when read from the store.
    pub category_name: Option<String>,
    pub added_at: DateTime<Utc>,
    pub added_by: String,
}

impl RegulatoryChange {
    /// Sin categoría => se envía a todos los clientes activos.
    pub fn is_broadcast(&self) -> bool {
        self.category_id.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRegulatoryChange {
    pub content: String,
    pub effective_date: NaiveDate,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub category_id: Option<CategoryId>,
    pub added_by: String,
}
