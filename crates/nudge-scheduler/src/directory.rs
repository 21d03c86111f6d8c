//! Read side of the CRM: sequence catalog and contact/conversation data.
//!
//! The enqueuer only talks to the CRM through [`CrmDirectory`], so the
//! catalog and contact reads can be backed by the local SQLite store or by a
//! remote service without touching the scheduling logic.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nudge_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::matcher::ContactAttributes;
use crate::persistence::FollowUpDb;
use crate::sequence::Sequence;

/// A conversation as seen by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub company_id: String,
    pub contact_id: String,
    pub connection_id: Option<String>,
    pub crm_stage_id: Option<String>,
    pub last_message_at: DateTime<Utc>,
}

/// Everything the scheduler needs to know about one contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub contact_id: String,
    pub company_id: String,
    pub attributes: ContactAttributes,
    /// Most recent conversation, if any.
    pub conversation_id: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Catalog and contact reads consumed by the enqueuer.
#[async_trait]
pub trait CrmDirectory: Send + Sync {
    /// Active sequences of every company (or one company), steps ordered by
    /// `step_order`, in catalog order.
    async fn active_sequences(&self, company_id: Option<&str>) -> Result<Vec<Sequence>>;

    /// One sequence of a company regardless of status.
    async fn sequence(&self, company_id: &str, sequence_id: &str) -> Result<Option<Sequence>>;

    /// Tags and latest conversation of a contact, `None` if the contact does
    /// not exist in that company.
    async fn contact(&self, company_id: &str, contact_id: &str) -> Result<Option<ContactSnapshot>>;

    /// Latest conversations that have been quiet since before `cutoff`, at
    /// most one per contact, capped at `limit`.
    async fn inactive_conversations(
        &self,
        company_id: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Conversation>>;
}

/// Directory backed by the local follow-up database.
pub struct SqliteDirectory {
    db: Arc<FollowUpDb>,
}

impl SqliteDirectory {
    pub fn new(db: Arc<FollowUpDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CrmDirectory for SqliteDirectory {
    async fn active_sequences(&self, company_id: Option<&str>) -> Result<Vec<Sequence>> {
        let company_id = company_id.map(str::to_string);
        self.db
            .call(move |db| db.load_active_sequences(company_id.as_deref()))
            .await
    }

    async fn sequence(&self, company_id: &str, sequence_id: &str) -> Result<Option<Sequence>> {
        let (company_id, sequence_id) = (company_id.to_string(), sequence_id.to_string());
        self.db
            .call(move |db| db.load_sequence(&company_id, &sequence_id))
            .await
    }

    async fn contact(&self, company_id: &str, contact_id: &str) -> Result<Option<ContactSnapshot>> {
        let (company_id, contact_id) = (company_id.to_string(), contact_id.to_string());
        self.db
            .call(move |db| db.contact_snapshot(&company_id, &contact_id))
            .await
    }

    async fn inactive_conversations(
        &self,
        company_id: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let company_id = company_id.to_string();
        self.db
            .call(move |db| db.inactive_candidates(&company_id, cutoff, limit))
            .await
    }
}
