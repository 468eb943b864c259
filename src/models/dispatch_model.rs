//! models/dispatch_model.rs
//! Registro de envíos por (cliente, lote) y resultados de una corrida.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::models::change_model::ChangeId;
use crate::models::customer_model::CustomerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DispatchStatus {
    Pending,
    Sent,
    Failed,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::Sent => "sent",
            DispatchStatus::Failed => "failed",
        }
    }
}

/// Detail of a `failed` row written without touching the transport. These
/// rows do not count as attempts.
pub const NO_RECIPIENTS_REASON: &str = "no_recipients: customer has no recipient addresses";

/// Canonical de-duplication key for a set of change ids: sorted, unique,
/// comma separated.
pub fn change_key(ids: &[ChangeId]) -> String {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DispatchRecord {
    pub id: String,
    pub batch_id: String,
    pub customer_id: CustomerId,
    pub change_key: String,
    pub status: DispatchStatus,
    pub attempt: i64,
    pub subject: Option<String>,
    pub body_html: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
}

impl DispatchRecord {
    pub fn change_ids(&self) -> Vec<ChangeId> {
        self.change_key
            .split(',')
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

/// Values for a new `pending` row.
#[derive(Debug, Clone)]
pub struct PendingDispatch {
    pub batch_id: String,
    pub customer_id: CustomerId,
    pub change_key: String,
    pub attempt: i64,
    pub subject: String,
    pub body_html: String,
}

/// Result of trying to claim a (customer, change set) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingInsert {
    Inserted(String),
    /// A live (pending or sent) record already holds the pair.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Sent,
    AlreadySent,
    NoRecipients,
    Failed,
    RetryLimitReached,
    StoreError,
    Cancelled,
}

impl OutcomeKind {
    /// Outcomes that an operator has to look at after the run.
    pub fn needs_follow_up(&self) -> bool {
        matches!(
            self,
            OutcomeKind::NoRecipients
                | OutcomeKind::Failed
                | OutcomeKind::RetryLimitReached
                | OutcomeKind::StoreError
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub customer_id: CustomerId,
    pub customer_name: String,
    pub kind: OutcomeKind,
    pub dispatch_id: Option<String>,
    pub change_ids: Vec<ChangeId>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FollowUp {
    pub customer_id: CustomerId,
    pub customer_name: String,
    pub kind: OutcomeKind,
    pub detail: Option<String>,
}

/// Operator-facing summary: counts per outcome kind plus the customers that
/// need manual follow-up.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchSummary {
    pub total: usize,
    pub counts: std::collections::BTreeMap<OutcomeKind, usize>,
    pub follow_up: Vec<FollowUp>,
}

impl DispatchSummary {
    pub fn from_outcomes(outcomes: &[DispatchOutcome]) -> Self {
        let mut summary = DispatchSummary {
            total: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            *summary.counts.entry(outcome.kind).or_insert(0) += 1;
            if outcome.kind.needs_follow_up() {
                summary.follow_up.push(FollowUp {
                    customer_id: outcome.customer_id,
                    customer_name: outcome.customer_name.clone(),
                    kind: outcome.kind,
                    detail: outcome.detail.clone(),
                });
            }
        }
        summary
    }

    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub batch_id: String,
    pub outcomes: Vec<DispatchOutcome>,
    pub summary: DispatchSummary,
}

/// Request para POST /api/newsletters/dispatch
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub since: Option<DateTime<Utc>>,
    pub change_ids: Option<Vec<ChangeId>>,
    pub quarter: Option<String>,
    pub year: Option<i32>,
}

/// Request para POST /api/newsletters/test
#[derive(Debug, Clone, Deserialize)]
pub struct TestSendRequest {
    pub recipient: Option<String>,
    pub quarter: Option<String>,
    pub year: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestSendResponse {
    pub success: bool,
    pub recipient: String,
    pub subject: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResponse {
    pub reconciled: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecentChangesQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EffectiveRangeQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
}
