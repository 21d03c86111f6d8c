//! Per-contact automation bookkeeping.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nudge_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::persistence::FollowUpDb;

/// One row per contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactState {
    pub contact_id: String,
    pub company_id: String,
    pub active_sequence_id: Option<String>,
    /// 0 until the first step has been sent.
    pub current_step_order: u32,
    pub opted_out: bool,
    pub updated_at: DateTime<Utc>,
}

impl ContactState {
    /// Automatic matching must neither target opted-out contacts nor hijack a
    /// contact that is mid-sequence. A missing row is eligible.
    pub fn eligible_for_auto_match(state: Option<&ContactState>) -> bool {
        match state {
            Some(s) => !s.opted_out && s.active_sequence_id.is_none(),
            None => true,
        }
    }
}

/// Contact state store, scoped by company on every call.
#[derive(Clone)]
pub struct ContactStateStore {
    db: Arc<FollowUpDb>,
}

impl ContactStateStore {
    pub fn new(db: Arc<FollowUpDb>) -> Self {
        Self { db }
    }

    pub async fn get(&self, company_id: &str, contact_id: &str) -> Result<Option<ContactState>> {
        let (company_id, contact_id) = (company_id.to_string(), contact_id.to_string());
        self.db
            .call(move |db| db.get_contact_state(&company_id, &contact_id))
            .await
    }

    /// Create or overwrite the sequence binding. Idempotent.
    pub async fn upsert(
        &self,
        company_id: &str,
        contact_id: &str,
        active_sequence_id: Option<&str>,
        current_step_order: u32,
    ) -> Result<()> {
        let (company_id, contact_id) = (company_id.to_string(), contact_id.to_string());
        let active_sequence_id = active_sequence_id.map(str::to_string);
        self.db
            .call(move |db| {
                db.upsert_contact_state(
                    &company_id,
                    &contact_id,
                    active_sequence_id.as_deref(),
                    current_step_order,
                )
            })
            .await
    }

    pub async fn is_eligible_for_auto_match(&self, company_id: &str, contact_id: &str) -> Result<bool> {
        let state = self.get(company_id, contact_id).await?;
        Ok(ContactState::eligible_for_auto_match(state.as_ref()))
    }

    /// Written by the preferences surface. Opting out cancels pending items
    /// and returns how many were cancelled.
    pub async fn set_opted_out(&self, company_id: &str, contact_id: &str, opted_out: bool) -> Result<usize> {
        let (company_id, contact_id) = (company_id.to_string(), contact_id.to_string());
        let cancelled = self
            .db
            .call(move |db| db.set_opted_out(&company_id, &contact_id, opted_out))
            .await?;
        tracing::info!("Contact opt-out set to {opted_out} ({cancelled} pending item(s) cancelled)");
        Ok(cancelled)
    }

    /// Record that `step_order` of `sequence_id` went out. Returns false if
    /// the contact is no longer bound to that sequence.
    pub async fn advance(&self, company_id: &str, contact_id: &str, sequence_id: &str, step_order: u32) -> Result<bool> {
        let (company_id, contact_id, sequence_id) =
            (company_id.to_string(), contact_id.to_string(), sequence_id.to_string());
        self.db
            .call(move |db| db.advance_contact_state(&company_id, &contact_id, &sequence_id, step_order))
            .await
    }

    /// Release a contact that finished `sequence_id` so automatic matching
    /// may pick it up again.
    pub async fn complete(&self, company_id: &str, contact_id: &str, sequence_id: &str) -> Result<bool> {
        let (company_id, contact_id, sequence_id) =
            (company_id.to_string(), contact_id.to_string(), sequence_id.to_string());
        let cleared = self
            .db
            .call(move |db| db.clear_contact_sequence(&company_id, &contact_id, &sequence_id))
            .await?;
        if cleared {
            tracing::debug!("Contact released after completing its sequence");
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ContactStateStore {
        ContactStateStore::new(Arc::new(FollowUpDb::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_missing_row_is_eligible() {
        let store = store();
        assert!(store.get("co", "c-1").await.unwrap().is_none());
        assert!(store.is_eligible_for_auto_match("co", "c-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_blocks_auto_match() {
        let store = store();
        store.upsert("co", "c-1", Some("seq-a"), 0).await.unwrap();
        store.upsert("co", "c-1", Some("seq-a"), 0).await.unwrap();

        let state = store.get("co", "c-1").await.unwrap().unwrap();
        assert_eq!(state.active_sequence_id.as_deref(), Some("seq-a"));
        assert_eq!(state.current_step_order, 0);
        assert!(!store.is_eligible_for_auto_match("co", "c-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_opted_out_is_not_eligible() {
        let store = store();
        store.set_opted_out("co", "c-1", true).await.unwrap();
        assert!(!store.is_eligible_for_auto_match("co", "c-1").await.unwrap());

        store.set_opted_out("co", "c-1", false).await.unwrap();
        assert!(store.is_eligible_for_auto_match("co", "c-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_advance_and_complete() {
        let store = store();
        store.upsert("co", "c-1", Some("seq-a"), 0).await.unwrap();

        assert!(store.advance("co", "c-1", "seq-a", 1).await.unwrap());
        assert!(!store.advance("co", "c-1", "seq-b", 2).await.unwrap());
        assert_eq!(store.get("co", "c-1").await.unwrap().unwrap().current_step_order, 1);

        assert!(!store.complete("co", "c-1", "seq-b").await.unwrap());
        assert!(store.complete("co", "c-1", "seq-a").await.unwrap());
        assert!(store.is_eligible_for_auto_match("co", "c-1").await.unwrap());
    }
}
