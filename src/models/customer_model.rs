//! models/customer_model.rs
//! Clientes, direcciones de envío y categorías de interés.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub type CustomerId = i64;
pub type CategoryId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub id: CustomerId,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecipientAddress {
    pub id: i64,
    pub customer_id: CustomerId,
    pub email: String,
}

/// Scope + description tag, e.g. ("Germany", "EDL-G energy audits").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Category {
    pub id: CategoryId,
    pub scope: String,
    pub description: String,
}

/// Snapshot of a customer as seen by targeting: addresses and interests
/// read in the same pass.
#[derive(Debug, Clone, Serialize)]
pub struct CustomerProfile {
    pub customer: Customer,
    pub recipients: Vec<String>,
    pub category_ids: Vec<CategoryId>,
}

impl CustomerProfile {
    pub fn has_recipients(&self) -> bool {
        !self.recipients.is_empty()
    }

    pub fn is_interested_in(&self, category_id: CategoryId) -> bool {
        self.category_ids.contains(&category_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCustomerRequest {
    pub name: String,
    pub active: bool,
    /// Primera dirección (opcional)
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCategoryRequest {
    pub scope: String,
    pub description: String,
}

/// One row of the customer x category matrix.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryMatrixRow {
    pub customer_id: CustomerId,
    pub customer_name: String,
    pub category_ids: Vec<CategoryId>,
}
