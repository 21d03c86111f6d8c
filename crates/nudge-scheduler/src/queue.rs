//! Follow-up queue — scheduled, not-yet-executed steps.
//!
//! The scheduler only ever creates `pending` items. Moving an item to
//! `sent`, `failed` or `cancelled` belongs to the dispatcher that polls
//! [`FollowUpQueue::due`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nudge_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::delay;
use crate::persistence::{FollowUpDb, PendingInsert};
use crate::sequence::{Sequence, Step};

/// Queue item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "sent" => QueueStatus::Sent,
            "failed" => QueueStatus::Failed,
            "cancelled" => QueueStatus::Cancelled,
            _ => QueueStatus::Pending,
        }
    }
}

/// A scheduled step for one contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub company_id: String,
    pub contact_id: String,
    pub conversation_id: Option<String>,
    pub sequence_id: String,
    pub current_step_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: QueueStatus,
    /// Last message time when the item was scheduled; the dispatcher compares
    /// against it to detect replies.
    pub reference_message_at: DateTime<Utc>,
}

impl QueueItem {
    /// A new pending item.
    pub fn pending(
        company_id: &str,
        contact_id: &str,
        conversation_id: Option<&str>,
        sequence_id: &str,
        step_id: &str,
        scheduled_at: DateTime<Utc>,
        reference_message_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            company_id: company_id.to_string(),
            contact_id: contact_id.to_string(),
            conversation_id: conversation_id.map(str::to_string),
            sequence_id: sequence_id.to_string(),
            current_step_id: step_id.to_string(),
            scheduled_at,
            status: QueueStatus::Pending,
            reference_message_at,
        }
    }

    /// Pending item for `step`, run time computed from its delay at `now`.
    pub fn for_step(
        sequence: &Sequence,
        step: &Step,
        contact_id: &str,
        conversation_id: Option<&str>,
        reference_message_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self::pending(
            &sequence.company_id,
            contact_id,
            conversation_id,
            &sequence.id,
            &step.id,
            delay::run_at(&step.delay, now)?,
            reference_message_at.unwrap_or(now),
        ))
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }
}

/// Result of [`FollowUpQueue::enqueue`].
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    Inserted(QueueItem),
    /// A pending item for the same contact and sequence already exists.
    Conflict,
    /// The contact opted out before the insert; nothing was written.
    OptedOut,
}

/// Queue operations, scoped by company.
#[derive(Clone)]
pub struct FollowUpQueue {
    db: Arc<FollowUpDb>,
}

impl FollowUpQueue {
    pub fn new(db: Arc<FollowUpDb>) -> Self {
        Self { db }
    }

    pub async fn has_pending(&self, company_id: &str, contact_id: &str, sequence_id: &str) -> Result<bool> {
        let (company_id, contact_id, sequence_id) =
            (company_id.to_string(), contact_id.to_string(), sequence_id.to_string());
        self.db
            .call(move |db| db.has_pending(&company_id, &contact_id, &sequence_id))
            .await
    }

    pub async fn has_any_pending(&self, company_id: &str, contact_id: &str) -> Result<bool> {
        let (company_id, contact_id) = (company_id.to_string(), contact_id.to_string());
        self.db
            .call(move |db| db.has_any_pending(&company_id, &contact_id))
            .await
    }

    /// Insert a pending item and bind the contact to its sequence at step 0.
    /// Losing the race against another enqueuer is a
    /// [`EnqueueResult::Conflict`], never an error; an opt-out that landed
    /// first is [`EnqueueResult::OptedOut`].
    pub async fn enqueue(&self, item: QueueItem) -> Result<EnqueueResult> {
        let (outcome, item) = self
            .db
            .call(move |db| {
                let outcome = db.insert_pending(&item)?;
                Ok((outcome, item))
            })
            .await?;
        match outcome {
            PendingInsert::Inserted => {
                tracing::debug!(
                    "Queued step '{}' of sequence '{}' for {}",
                    item.current_step_id,
                    item.sequence_id,
                    item.scheduled_at
                );
                Ok(EnqueueResult::Inserted(item))
            }
            PendingInsert::Duplicate => Ok(EnqueueResult::Conflict),
            PendingInsert::OptedOut => Ok(EnqueueResult::OptedOut),
        }
    }

    /// Pending items whose run time has elapsed.
    pub async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueItem>> {
        self.db.call(move |db| db.due_items(now, limit)).await
    }

    pub async fn pending_for_company(&self, company_id: &str, limit: usize) -> Result<Vec<QueueItem>> {
        let company_id = company_id.to_string();
        self.db
            .call(move |db| db.pending_items(&company_id, limit))
            .await
    }

    pub async fn items_for_contact(&self, company_id: &str, contact_id: &str) -> Result<Vec<QueueItem>> {
        let (company_id, contact_id) = (company_id.to_string(), contact_id.to_string());
        self.db
            .call(move |db| db.items_for_contact(&company_id, &contact_id))
            .await
    }

    /// Dispatcher transition out of `pending`.
    pub async fn mark(&self, item_id: &str, status: QueueStatus) -> Result<bool> {
        let item_id = item_id.to_string();
        self.db.call(move |db| db.mark_status(&item_id, status)).await
    }
}
