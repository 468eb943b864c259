//! services/targeting.rs
//! Qué cambios le tocan a cada cliente activo.

use anyhow::Result;
use std::collections::BTreeMap;

use crate::models::change_model::RegulatoryChange;
use crate::models::customer_model::{CustomerId, CustomerProfile};
use crate::services::newsletter_store::NewsletterStore;

/// Customer -> applicable changes. Ordered by customer id so a run walks
/// customers deterministically.
pub type Targets = BTreeMap<CustomerId, Vec<RegulatoryChange>>;

/// Matches changes against a snapshot of customer profiles.
///
/// * inactive customers never appear;
/// * a change without category goes to every customer with at least one
///   address;
/// * a categorized change goes only to customers mapped to that category;
/// * customers left without changes are omitted;
/// * each list is sorted by effective date, then creation order.
pub fn resolve_targets(changes: &[RegulatoryChange], profiles: &[CustomerProfile]) -> Targets {
    let mut targets = Targets::new();

    for profile in profiles.iter().filter(|p| p.customer.active) {
        let mut applicable: Vec<RegulatoryChange> = changes
            .iter()
            .filter(|change| {
                if change.is_broadcast() {
                    profile.has_recipients()
                } else {
                    change
                        .category_id
                        .is_some_and(|category_id| profile.is_interested_in(category_id))
                }
            })
            .cloned()
            .collect();

        if applicable.is_empty() {
            continue;
        }
        applicable.sort_by(|a, b| {
            a.effective_date
                .cmp(&b.effective_date)
                .then(a.added_at.cmp(&b.added_at))
                .then(a.id.cmp(&b.id))
        });
        applicable.dedup_by_key(|change| change.id);
        targets.insert(profile.customer.id, applicable);
    }

    targets
}

#[derive(Clone, Debug)]
pub struct TargetingService {
    store: NewsletterStore,
}

impl TargetingService {
    pub fn new(store: NewsletterStore) -> Self {
        TargetingService { store }
    }

    /// Reads the current mapping state and resolves against it. Nothing is
    /// cached between calls.
    pub async fn resolve(&self, changes: &[RegulatoryChange]) -> Result<Targets> {
        let profiles = self.store.active_customer_profiles().await?;
        let targets = resolve_targets(changes, &profiles);
        log::info!(
            "(resolve) {} changes -> {} of {} active customers targeted",
            changes.len(),
            targets.len(),
            profiles.len()
        );
        Ok(targets)
    }
}
