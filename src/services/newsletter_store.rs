//! services/newsletter_store.rs
//! Acceso a SQLite: clientes, categorías, cambios regulatorios, historial de
//! envíos y auditoría.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::config::app_config::DatabaseConfig;
use crate::models::change_model::{ChangeId, NewRegulatoryChange, RegulatoryChange};
use crate::models::customer_model::{
    Category, CategoryId, CategoryMatrixRow, Customer, CustomerId, CustomerProfile,
    NewCategoryRequest, NewCustomerRequest, RecipientAddress,
};
use crate::models::dispatch_model::{
    DispatchRecord, DispatchStatus, PendingDispatch, PendingInsert, NO_RECIPIENTS_REASON,
};

const CHANGE_COLUMNS: &str = r#"
    SELECT rc.id, rc.content, rc.effective_date, rc.type, rc.category_id,
           c.scope AS category_name, rc.added_at, rc.added_by
    FROM regulatory_changes rc
    LEFT JOIN categories c ON c.id = rc.category_id
"#;

const DISPATCH_COLUMNS: &str = r#"
    SELECT id, batch_id, customer_id, change_key, status, attempt, subject, body_html,
           created_at, sent_at, error_message, opened_at, clicked_at
    FROM newsletter_dispatch
"#;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub actor: Option<String>,
    pub action: String,
    pub table_name: Option<String>,
    pub row_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub details: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewsletterStore {
    db_pool: Pool<Sqlite>,
}

impl NewsletterStore {
    pub fn new(db_pool: Pool<Sqlite>) -> Self {
        NewsletterStore { db_pool }
    }

    /// Abre (o crea) la base SQLite con claves foráneas activas.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("Invalid DATABASE_URL {}", config.url))?
            .create_if_missing(true)
            .foreign_keys(true);

        let parent_dir = sqlite_file_path(&config.url)
            .and_then(|path| path.parent().map(Path::to_path_buf));
        if let Some(parent) = parent_dir {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(&parent)
                    .with_context(|| format!("Could not create directory {:?}", parent))?;
            }
        }

        log::info!("Conectando a SQLite en {}", config.url);

        let db_pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .context("Could not connect to the SQLite database")?;

        Ok(NewsletterStore::new(db_pool))
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.db_pool
    }

    /// Corre migraciones con sqlx
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.db_pool)
            .await
            .context("Failed to run newsletter migrations")?;
        Ok(())
    }

    // ========================================================================
    // Clientes y direcciones
    // ========================================================================

    pub async fn create_customer(&self, req: NewCustomerRequest) -> Result<CustomerId> {
        let name = req.name.trim();
        if name.is_empty() {
            bail!("Customer name is required");
        }
        let now = Utc::now();

        let mut tx = self.db_pool.begin().await?;
        let customer_id = sqlx::query(
            r#"INSERT INTO customers (name, active, created_at) VALUES (?1, ?2, ?3)"#,
        )
        .bind(name)
        .bind(req.active)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to insert customer")?
        .last_insert_rowid();

        if let Some(email) = req.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
            sqlx::query(r#"INSERT INTO customer_emails (customer_id, email) VALUES (?1, ?2)"#)
                .bind(customer_id)
                .bind(email)
                .execute(&mut *tx)
                .await
                .context("Failed to insert initial customer email")?;
        }
        tx.commit().await?;

        self.append_audit(None, "create_customer", "customers", &customer_id.to_string(), Some(name))
            .await?;
        log::info!("Added customer {} (id={})", name, customer_id);
        Ok(customer_id)
    }

    pub async fn get_customer(&self, customer_id: CustomerId) -> Result<Option<Customer>> {
        sqlx::query_as::<_, Customer>(
            r#"SELECT id, name, active, created_at FROM customers WHERE id = ?1"#,
        )
        .bind(customer_id)
        .fetch_optional(&self.db_pool)
        .await
        .context("Failed to load customer")
    }

    pub async fn list_customers(&self) -> Result<Vec<Customer>> {
        sqlx::query_as::<_, Customer>(
            r#"SELECT id, name, active, created_at FROM customers ORDER BY name, id"#,
        )
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to list customers")
    }

    pub async fn set_customer_active(&self, customer_id: CustomerId, active: bool) -> Result<()> {
        let result = sqlx::query(r#"UPDATE customers SET active = ?1 WHERE id = ?2"#)
            .bind(active)
            .bind(customer_id)
            .execute(&self.db_pool)
            .await
            .context("Failed to update customer active flag")?;
        if result.rows_affected() == 0 {
            bail!("Customer {} not found", customer_id);
        }
        Ok(())
    }

    /// Addresses and interests cascade. Customers with dispatch history
    /// cannot be deleted; deactivate them instead.
    pub async fn delete_customer(&self, customer_id: CustomerId) -> Result<()> {
        let (history,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM newsletter_dispatch WHERE customer_id = ?1"#)
                .bind(customer_id)
                .fetch_one(&self.db_pool)
                .await?;
        if history > 0 {
            bail!(
                "Customer {} has {} dispatch records; deactivate instead of deleting",
                customer_id,
                history
            );
        }

        sqlx::query(r#"DELETE FROM customers WHERE id = ?1"#)
            .bind(customer_id)
            .execute(&self.db_pool)
            .await
            .context("Failed to delete customer")?;
        self.append_audit(None, "delete_customer", "customers", &customer_id.to_string(), None)
            .await
    }

    pub async fn add_recipient(&self, customer_id: CustomerId, email: &str) -> Result<i64> {
        let email = email.trim();
        if email.is_empty() {
            bail!("Email address cannot be empty");
        }
        let id = sqlx::query(r#"INSERT INTO customer_emails (customer_id, email) VALUES (?1, ?2)"#)
            .bind(customer_id)
            .bind(email)
            .execute(&self.db_pool)
            .await
            .context("Failed to insert customer email")?
            .last_insert_rowid();
        Ok(id)
    }

    pub async fn remove_recipient(&self, recipient_id: i64) -> Result<()> {
        sqlx::query(r#"DELETE FROM customer_emails WHERE id = ?1"#)
            .bind(recipient_id)
            .execute(&self.db_pool)
            .await
            .context("Failed to delete customer email")?;
        Ok(())
    }

    pub async fn list_recipients(&self, customer_id: CustomerId) -> Result<Vec<RecipientAddress>> {
        sqlx::query_as::<_, RecipientAddress>(
            r#"SELECT id, customer_id, email FROM customer_emails WHERE customer_id = ?1 ORDER BY id"#,
        )
        .bind(customer_id)
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to list customer emails")
    }

    /// Addresses of an active customer, in insertion order. Empty when the
    /// customer is inactive or unknown.
    pub async fn active_recipients(&self, customer_id: CustomerId) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT e.email
            FROM customer_emails e
            JOIN customers c ON c.id = e.customer_id
            WHERE e.customer_id = ?1 AND c.active = 1
            ORDER BY e.id
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to load recipient addresses")?;
        Ok(rows.into_iter().map(|(email,)| email).collect())
    }

    // ========================================================================
    // Categorías e intereses
    // ========================================================================

    pub async fn create_category(&self, req: NewCategoryRequest) -> Result<CategoryId> {
        if req.scope.trim().is_empty() {
            bail!("Category scope is required");
        }
        let id = sqlx::query(r#"INSERT INTO categories (scope, description) VALUES (?1, ?2)"#)
            .bind(req.scope.trim())
            .bind(req.description.trim())
            .execute(&self.db_pool)
            .await
            .context("Failed to insert category")?
            .last_insert_rowid();
        Ok(id)
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        sqlx::query_as::<_, Category>(
            r#"SELECT id, scope, description FROM categories ORDER BY scope, id"#,
        )
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to list categories")
    }

    /// Mappings cascade; rejected while a regulatory change references it.
    pub async fn delete_category(&self, category_id: CategoryId) -> Result<()> {
        let (used,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM regulatory_changes WHERE category_id = ?1"#)
                .bind(category_id)
                .fetch_one(&self.db_pool)
                .await?;
        if used > 0 {
            bail!(
                "Category {} is referenced by {} regulatory changes",
                category_id,
                used
            );
        }
        sqlx::query(r#"DELETE FROM categories WHERE id = ?1"#)
            .bind(category_id)
            .execute(&self.db_pool)
            .await
            .context("Failed to delete category")?;
        Ok(())
    }

    pub async fn map_interest(&self, customer_id: CustomerId, category_id: CategoryId) -> Result<()> {
        sqlx::query(
            r#"INSERT OR IGNORE INTO customer_category_mapping (customer_id, category_id) VALUES (?1, ?2)"#,
        )
        .bind(customer_id)
        .bind(category_id)
        .execute(&self.db_pool)
        .await
        .context("Failed to map customer to category")?;
        Ok(())
    }

    pub async fn unmap_interest(&self, customer_id: CustomerId, category_id: CategoryId) -> Result<()> {
        sqlx::query(
            r#"DELETE FROM customer_category_mapping WHERE customer_id = ?1 AND category_id = ?2"#,
        )
        .bind(customer_id)
        .bind(category_id)
        .execute(&self.db_pool)
        .await
        .context("Failed to unmap customer from category")?;
        Ok(())
    }

    pub async fn category_matrix(&self) -> Result<Vec<CategoryMatrixRow>> {
        let customers = self.list_customers().await?;
        let pairs: Vec<(CustomerId, CategoryId)> = sqlx::query_as(
            r#"SELECT customer_id, category_id FROM customer_category_mapping ORDER BY category_id"#,
        )
        .fetch_all(&self.db_pool)
        .await?;

        let mut by_customer: HashMap<CustomerId, Vec<CategoryId>> = HashMap::new();
        for (customer_id, category_id) in pairs {
            by_customer.entry(customer_id).or_default().push(category_id);
        }

        Ok(customers
            .into_iter()
            .map(|c| CategoryMatrixRow {
                category_ids: by_customer.remove(&c.id).unwrap_or_default(),
                customer_id: c.id,
                customer_name: c.name,
            })
            .collect())
    }

    /// Active customers with addresses and interests, read inside a single
    /// transaction so the three queries see the same snapshot.
    pub async fn active_customer_profiles(&self) -> Result<Vec<CustomerProfile>> {
        let mut tx = self.db_pool.begin().await?;

        let customers = sqlx::query_as::<_, Customer>(
            r#"SELECT id, name, active, created_at FROM customers WHERE active = 1 ORDER BY id"#,
        )
        .fetch_all(&mut *tx)
        .await
        .context("Failed to load active customers")?;

        let emails: Vec<(CustomerId, String)> = sqlx::query_as(
            r#"
            SELECT e.customer_id, e.email
            FROM customer_emails e
            JOIN customers c ON c.id = e.customer_id
            WHERE c.active = 1
            ORDER BY e.id
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .context("Failed to load customer emails")?;

        let interests: Vec<(CustomerId, CategoryId)> = sqlx::query_as(
            r#"
            SELECT m.customer_id, m.category_id
            FROM customer_category_mapping m
            JOIN customers c ON c.id = m.customer_id
            WHERE c.active = 1
            ORDER BY m.category_id
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .context("Failed to load customer interests")?;

        tx.commit().await?;

        let mut recipients: HashMap<CustomerId, Vec<String>> = HashMap::new();
        for (customer_id, email) in emails {
            recipients.entry(customer_id).or_default().push(email);
        }
        let mut categories: HashMap<CustomerId, Vec<CategoryId>> = HashMap::new();
        for (customer_id, category_id) in interests {
            categories.entry(customer_id).or_default().push(category_id);
        }

        Ok(customers
            .into_iter()
            .map(|customer| CustomerProfile {
                recipients: recipients.remove(&customer.id).unwrap_or_default(),
                category_ids: categories.remove(&customer.id).unwrap_or_default(),
                customer,
            })
            .collect())
    }

    // ========================================================================
    // Cambios regulatorios (solo inserción)
    // ========================================================================

    pub async fn add_change(&self, req: NewRegulatoryChange) -> Result<RegulatoryChange> {
        if req.content.trim().is_empty() {
            bail!("Change content cannot be empty");
        }
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO regulatory_changes (
                added_at, added_by, effective_date, type, category_id, content
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(now)
        .bind(&req.added_by)
        .bind(req.effective_date)
        .bind(req.change_type)
        .bind(req.category_id)
        .bind(req.content.trim())
        .execute(&self.db_pool)
        .await
        .context("Failed to insert regulatory change")?
        .last_insert_rowid();

        self.append_audit(
            Some(&req.added_by),
            "create_change",
            "regulatory_changes",
            &id.to_string(),
            Some(req.change_type.as_str()),
        )
        .await?;

        self.get_change(id)
            .await?
            .ok_or_else(|| anyhow!("Regulatory change {} vanished after insert", id))
    }

    pub async fn get_change(&self, change_id: ChangeId) -> Result<Option<RegulatoryChange>> {
        sqlx::query_as::<_, RegulatoryChange>(&format!("{CHANGE_COLUMNS} WHERE rc.id = ?1"))
            .bind(change_id)
            .fetch_optional(&self.db_pool)
            .await
            .context("Failed to load regulatory change")
    }

    /// Changes recorded strictly after `since`. Timestamps are stored as UTC
    /// RFC 3339 text by the same encoder, so text order is time order.
    pub async fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<RegulatoryChange>> {
        sqlx::query_as::<_, RegulatoryChange>(&format!(
            "{CHANGE_COLUMNS} WHERE rc.added_at > ?1 ORDER BY rc.id"
        ))
        .bind(since)
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to load regulatory changes")
    }

    /// Changes whose effective date falls in `[from, to]`.
    pub async fn changes_effective_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RegulatoryChange>> {
        sqlx::query_as::<_, RegulatoryChange>(&format!(
            "{CHANGE_COLUMNS} WHERE rc.effective_date BETWEEN ?1 AND ?2 ORDER BY rc.effective_date, rc.id"
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to load regulatory changes by effective date")
    }

    /// Fails if any id is unknown.
    pub async fn changes_by_ids(&self, ids: &[ChangeId]) -> Result<Vec<RegulatoryChange>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(CHANGE_COLUMNS);
        qb.push(" WHERE rc.id IN (");
        {
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
        }
        qb.push(") ORDER BY rc.id");

        let rows = qb
            .build_query_as::<RegulatoryChange>()
            .fetch_all(&self.db_pool)
            .await
            .context("Failed to load regulatory changes by id")?;

        if let Some(missing) = ids.iter().find(|id| !rows.iter().any(|c| c.id == **id)) {
            bail!("Regulatory change {} not found", missing);
        }
        Ok(rows)
    }

    /// Newest first.
    pub async fn recent_changes(&self, limit: i64) -> Result<Vec<RegulatoryChange>> {
        sqlx::query_as::<_, RegulatoryChange>(&format!(
            "{CHANGE_COLUMNS} ORDER BY rc.added_at DESC, rc.id DESC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to load recent changes")
    }

    // ========================================================================
    // Historial de envíos
    // ========================================================================

    /// The pending or sent record for this customer and change set, if any.
    pub async fn find_live_dispatch(
        &self,
        customer_id: CustomerId,
        change_key: &str,
    ) -> Result<Option<DispatchRecord>> {
        sqlx::query_as::<_, DispatchRecord>(&format!(
            "{DISPATCH_COLUMNS} WHERE customer_id = ?1 AND change_key = ?2 AND status <> 'failed'"
        ))
        .bind(customer_id)
        .bind(change_key)
        .fetch_optional(&self.db_pool)
        .await
        .context("Failed to look up existing dispatch")
    }

    /// Failed rows where the transport was actually tried. Rows written
    /// for a customer without addresses are not attempts.
    pub async fn count_failed_attempts(
        &self,
        customer_id: CustomerId,
        change_key: &str,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM newsletter_dispatch
            WHERE customer_id = ?1 AND change_key = ?2 AND status = 'failed'
              AND (error_message IS NULL OR error_message <> ?3)
            "#,
        )
        .bind(customer_id)
        .bind(change_key)
        .bind(NO_RECIPIENTS_REASON)
        .fetch_one(&self.db_pool)
        .await
        .context("Failed to count failed dispatch attempts")?;
        Ok(count)
    }

    /// Inserts a `pending` row. The partial unique index on
    /// (customer_id, change_key) turns a concurrent duplicate into
    /// `PendingInsert::Duplicate` instead of a second live row.
    pub async fn insert_pending_dispatch(&self, pending: &PendingDispatch) -> Result<PendingInsert> {
        let dispatch_id = Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO newsletter_dispatch (
                id, batch_id, customer_id, change_key, status, attempt,
                subject, body_html, created_at
            )
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&dispatch_id)
        .bind(&pending.batch_id)
        .bind(pending.customer_id)
        .bind(&pending.change_key)
        .bind(pending.attempt)
        .bind(&pending.subject)
        .bind(&pending.body_html)
        .bind(Utc::now())
        .execute(&self.db_pool)
        .await;

        match result {
            Ok(_) => Ok(PendingInsert::Inserted(dispatch_id)),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(PendingInsert::Duplicate)
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to insert pending dispatch")),
        }
    }

    /// Writes a terminal `failed` row directly (no transport attempted).
    pub async fn insert_failed_dispatch(
        &self,
        batch_id: &str,
        customer_id: CustomerId,
        change_key: &str,
        attempt: i64,
        reason: &str,
    ) -> Result<String> {
        let dispatch_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO newsletter_dispatch (
                id, batch_id, customer_id, change_key, status, attempt,
                created_at, error_message
            )
            VALUES (?1, ?2, ?3, ?4, 'failed', ?5, ?6, ?7)
            "#,
        )
        .bind(&dispatch_id)
        .bind(batch_id)
        .bind(customer_id)
        .bind(change_key)
        .bind(attempt)
        .bind(Utc::now())
        .bind(reason)
        .execute(&self.db_pool)
        .await
        .context("Failed to insert failed dispatch")?;
        Ok(dispatch_id)
    }

    /// Moves a `pending` row to its final status in one statement.
    pub async fn finish_dispatch(
        &self,
        dispatch_id: &str,
        status: DispatchStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        if status == DispatchStatus::Pending {
            bail!("finish_dispatch requires a terminal status");
        }
        let sent_at = (status == DispatchStatus::Sent).then(Utc::now);
        let result = sqlx::query(
            r#"
            UPDATE newsletter_dispatch
            SET status = ?1, sent_at = ?2, error_message = ?3
            WHERE id = ?4 AND status = 'pending'
            "#,
        )
        .bind(status)
        .bind(sent_at)
        .bind(error_message)
        .bind(dispatch_id)
        .execute(&self.db_pool)
        .await
        .context("Failed to update dispatch status")?;

        if result.rows_affected() == 0 {
            bail!("Dispatch {} is not pending", dispatch_id);
        }
        Ok(())
    }

    pub async fn get_dispatch(&self, dispatch_id: &str) -> Result<Option<DispatchRecord>> {
        sqlx::query_as::<_, DispatchRecord>(&format!("{DISPATCH_COLUMNS} WHERE id = ?1"))
            .bind(dispatch_id)
            .fetch_optional(&self.db_pool)
            .await
            .context("Failed to load dispatch")
    }

    pub async fn dispatches_for_customer(&self, customer_id: CustomerId) -> Result<Vec<DispatchRecord>> {
        sqlx::query_as::<_, DispatchRecord>(&format!(
            "{DISPATCH_COLUMNS} WHERE customer_id = ?1 ORDER BY created_at, attempt"
        ))
        .bind(customer_id)
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to list dispatches for customer")
    }

    /// First open wins. Returns false if the dispatch does not exist.
    pub async fn mark_opened(&self, dispatch_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE newsletter_dispatch SET opened_at = COALESCE(opened_at, ?1) WHERE id = ?2"#,
        )
        .bind(Utc::now())
        .bind(dispatch_id)
        .execute(&self.db_pool)
        .await
        .context("Failed to record open")?;
        Ok(result.rows_affected() > 0)
    }

    /// A click implies an open.
    pub async fn mark_clicked(&self, dispatch_id: &str) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE newsletter_dispatch
            SET clicked_at = COALESCE(clicked_at, ?1),
                opened_at = COALESCE(opened_at, ?1)
            WHERE id = ?2
            "#,
        )
        .bind(now)
        .bind(dispatch_id)
        .execute(&self.db_pool)
        .await
        .context("Failed to record click")?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks `pending` rows older than `older_than` as failed (unknown
    /// outcome). Returns how many rows were resolved.
    pub async fn reconcile_stale_pending(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).context("Stale threshold out of range")?;

        let reconciled = sqlx::query(
            r#"
            UPDATE newsletter_dispatch
            SET status = 'failed', error_message = 'unknown: stale pending record'
            WHERE status = 'pending' AND created_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&self.db_pool)
        .await
        .context("Failed to reconcile pending dispatches")?
        .rows_affected();

        if reconciled > 0 {
            self.append_audit(
                None,
                "reconcile_pending",
                "newsletter_dispatch",
                "*",
                Some(&format!("{} stale records marked failed", reconciled)),
            )
            .await?;
        }
        Ok(reconciled)
    }

    // ========================================================================
    // Auditoría
    // ========================================================================

    pub async fn append_audit(
        &self,
        actor: Option<&str>,
        action: &str,
        table_name: &str,
        row_id: &str,
        details: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (actor, action, table_name, row_id, timestamp, details)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(actor)
        .bind(action)
        .bind(table_name)
        .bind(row_id)
        .bind(Utc::now())
        .bind(details)
        .execute(&self.db_pool)
        .await
        .context("Failed to append audit entry")?;
        Ok(())
    }

    pub async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT id, actor, action, table_name, row_id, timestamp, details
            FROM audit_log ORDER BY id DESC LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to load audit log")
    }
}

/// File behind a `sqlite:` URL, `None` for in-memory databases.
fn sqlite_file_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Some(PathBuf::from(path))
}
