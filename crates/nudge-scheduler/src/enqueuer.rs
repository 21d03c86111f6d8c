//! Enqueuer — decides whether a contact enters a follow-up sequence.
//!
//! ## Flow
//! ```text
//! enqueue_for_contact(contact, company, sequence?)
//!   → ContactState      (opted out? already bound?)
//!   → explicit sequence | SequenceMatcher over the company catalog
//!   → first step        (ScheduleCalculator → scheduled_at)
//!   → FollowUpQueue     (insert pending + bind contact at step 0, one
//!                        transaction; conflict = already scheduled,
//!                        opt-out committed meanwhile = opted out)
//!
//! scan_and_enqueue_inactive_contacts()
//!   → catalog read once, grouped by company
//!   → per company: stale conversations (capped)
//!   → per candidate: same steps, failures isolated and counted
//! ```
//!
//! Every directory and storage call runs under the configured timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use nudge_core::config::SchedulerConfig;
use nudge_core::error::{NudgeError, Result};
use serde::{Deserialize, Serialize};

use crate::directory::{ContactSnapshot, Conversation, CrmDirectory};
use crate::matcher;
use crate::queue::{EnqueueResult, FollowUpQueue, QueueItem};
use crate::sequence::{Sequence, SequenceCatalog};
use crate::state::{ContactState, ContactStateStore};

/// Why a contact was not enqueued. These are steady-state outcomes, not
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    OptedOut,
    AlreadyInSequence,
    SequenceNotFoundOrInactive,
    NoMatchingSequence,
    SequenceHasNoSteps,
    AlreadyScheduled,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::OptedOut => "opted_out",
            SkipReason::AlreadyInSequence => "already_in_sequence",
            SkipReason::SequenceNotFoundOrInactive => "sequence_not_found_or_inactive",
            SkipReason::NoMatchingSequence => "no_matching_sequence",
            SkipReason::SequenceHasNoSteps => "sequence_has_no_steps",
            SkipReason::AlreadyScheduled => "already_scheduled",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            SkipReason::OptedOut => "Contact has opted out of automated follow-ups",
            SkipReason::AlreadyInSequence => "Contact is already in a sequence",
            SkipReason::SequenceNotFoundOrInactive => "Sequence not found or not active",
            SkipReason::NoMatchingSequence => "No matching sequence for this contact",
            SkipReason::SequenceHasNoSteps => "Sequence has no steps",
            SkipReason::AlreadyScheduled => "A follow-up is already scheduled for this sequence",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a scheduling decision for one contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub enqueued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_item_id: Option<String>,
}

impl EnqueueOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            enqueued: false,
            reason: Some(reason),
            sequence_id: None,
            scheduled_at: None,
            queue_item_id: None,
        }
    }

    fn scheduled(item: &QueueItem) -> Self {
        Self {
            enqueued: true,
            reason: None,
            sequence_id: Some(item.sequence_id.clone()),
            scheduled_at: Some(item.scheduled_at),
            queue_item_id: Some(item.id.clone()),
        }
    }

    /// Human-readable summary for trigger responses.
    pub fn message(&self) -> String {
        match (self.reason, self.scheduled_at) {
            (Some(reason), _) => reason.message().to_string(),
            (None, Some(at)) => format!("Follow-up scheduled for {}", at.to_rfc3339()),
            (None, None) => "Follow-up scheduled".to_string(),
        }
    }
}

/// Aggregate of one inactivity scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub companies: usize,
    pub scanned: usize,
    pub enqueued: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ScanSummary {
    fn record(&mut self, outcome: &Result<EnqueueOutcome>) {
        self.scanned += 1;
        match outcome {
            Ok(o) if o.enqueued => self.enqueued += 1,
            Ok(_) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Tunables for the enqueuer.
#[derive(Debug, Clone)]
pub struct EnqueuerSettings {
    pub inactivity: Duration,
    pub batch_limit: usize,
    pub call_timeout: StdDuration,
}

impl EnqueuerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            inactivity: Duration::hours(i64::from(config.inactivity_hours)),
            batch_limit: config.scan_batch_limit,
            call_timeout: StdDuration::from_secs(config.call_timeout_secs.max(1)),
        }
    }
}

impl Default for EnqueuerSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Orchestrates matching, eligibility, timing and queueing.
#[derive(Clone)]
pub struct Enqueuer {
    directory: Arc<dyn CrmDirectory>,
    states: ContactStateStore,
    queue: FollowUpQueue,
    settings: EnqueuerSettings,
}

impl Enqueuer {
    pub fn new(
        directory: Arc<dyn CrmDirectory>,
        states: ContactStateStore,
        queue: FollowUpQueue,
        settings: EnqueuerSettings,
    ) -> Self {
        Self {
            directory,
            states,
            queue,
            settings,
        }
    }

    pub fn queue(&self) -> &FollowUpQueue {
        &self.queue
    }

    /// Enqueue one contact, either into `explicit_sequence_id` or into the
    /// best match from its company's catalog.
    ///
    /// An explicit sequence may rebind a contact that is already in another
    /// sequence; automatic matching never does.
    pub async fn enqueue_for_contact(
        &self,
        contact_id: &str,
        company_id: &str,
        explicit_sequence_id: Option<&str>,
    ) -> Result<EnqueueOutcome> {
        if contact_id.trim().is_empty() || company_id.trim().is_empty() {
            return Err(NudgeError::InvalidInput(
                "contactId and companyId are required".into(),
            ));
        }
        let explicit_sequence_id = explicit_sequence_id.filter(|s| !s.trim().is_empty());

        let state = self
            .timed("load contact state", self.states.get(company_id, contact_id))
            .await?;
        if let Some(state) = &state {
            if state.opted_out {
                return Ok(self.skip(contact_id, SkipReason::OptedOut));
            }
            if state.active_sequence_id.is_some() && explicit_sequence_id.is_none() {
                return Ok(self.skip(contact_id, SkipReason::AlreadyInSequence));
            }
        }

        let snapshot = self
            .timed("load contact", self.directory.contact(company_id, contact_id))
            .await?
            .ok_or_else(|| {
                NudgeError::InvalidInput(format!(
                    "Contact '{contact_id}' not found for company '{company_id}'"
                ))
            })?;

        let sequence = match explicit_sequence_id {
            Some(sequence_id) => {
                let sequence = self
                    .timed("load sequence", self.directory.sequence(company_id, sequence_id))
                    .await?;
                match sequence {
                    Some(s) if s.is_active() => s,
                    _ => return Ok(self.skip(contact_id, SkipReason::SequenceNotFoundOrInactive)),
                }
            }
            None => {
                let catalog = self
                    .timed("load catalog", self.directory.active_sequences(Some(company_id)))
                    .await?;
                match matcher::select_sequence(&catalog, company_id, &snapshot.attributes) {
                    Some(s) => s.clone(),
                    None => return Ok(self.skip(contact_id, SkipReason::NoMatchingSequence)),
                }
            }
        };

        self.schedule(&sequence, &snapshot).await
    }

    /// Sweep every company for conversations gone stale and enqueue the
    /// eligible contacts. One candidate's failure never aborts the batch.
    pub async fn scan_and_enqueue_inactive_contacts(&self) -> Result<ScanSummary> {
        let sequences = self
            .timed("load catalog", self.directory.active_sequences(None))
            .await?;
        let catalog = SequenceCatalog::from_sequences(sequences);
        let cutoff = Utc::now() - self.settings.inactivity;
        let mut summary = ScanSummary::default();

        for company_id in catalog.companies() {
            summary.companies += 1;
            let candidates = match self
                .timed(
                    "load inactive conversations",
                    self.directory
                        .inactive_conversations(company_id, cutoff, self.settings.batch_limit),
                )
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Inactivity scan skipped company '{company_id}': {e}");
                    continue;
                }
            };
            tracing::debug!(
                "Company '{company_id}': {} inactive conversation(s)",
                candidates.len()
            );

            let sequences = catalog.for_company(company_id);
            for candidate in &candidates {
                let outcome = self.process_candidate(sequences, candidate).await;
                if let Err(e) = &outcome {
                    tracing::warn!(
                        "Follow-up scan failed for contact '{}': {e}",
                        candidate.contact_id
                    );
                }
                summary.record(&outcome);
            }
        }

        tracing::info!(
            "Inactivity scan: {} companies, {} scanned, {} enqueued, {} skipped, {} failed",
            summary.companies,
            summary.scanned,
            summary.enqueued,
            summary.skipped,
            summary.failed
        );
        Ok(summary)
    }

    async fn process_candidate(
        &self,
        sequences: &[Sequence],
        candidate: &Conversation,
    ) -> Result<EnqueueOutcome> {
        let company_id = candidate.company_id.as_str();
        let contact_id = candidate.contact_id.as_str();

        let state = self
            .timed("load contact state", self.states.get(company_id, contact_id))
            .await?;
        if !ContactState::eligible_for_auto_match(state.as_ref()) {
            let reason = match state {
                Some(s) if s.opted_out => SkipReason::OptedOut,
                _ => SkipReason::AlreadyInSequence,
            };
            return Ok(self.skip(contact_id, reason));
        }
        let pending = self
            .timed("check pending", self.queue.has_any_pending(company_id, contact_id))
            .await?;
        if pending {
            return Ok(self.skip(contact_id, SkipReason::AlreadyScheduled));
        }

        let snapshot = self
            .timed("load contact", self.directory.contact(company_id, contact_id))
            .await?
            .ok_or_else(|| {
                NudgeError::InvalidInput(format!(
                    "Contact '{contact_id}' not found for company '{company_id}'"
                ))
            })?;

        match matcher::select_sequence(sequences, company_id, &snapshot.attributes) {
            Some(sequence) => self.schedule(sequence, &snapshot).await,
            None => Ok(self.skip(contact_id, SkipReason::NoMatchingSequence)),
        }
    }

    /// Queue the first step of `sequence` and bind the contact to it.
    async fn schedule(&self, sequence: &Sequence, contact: &ContactSnapshot) -> Result<EnqueueOutcome> {
        let company_id = contact.company_id.as_str();
        let contact_id = contact.contact_id.as_str();

        let Some(step) = sequence.first_step() else {
            return Ok(self.skip(contact_id, SkipReason::SequenceHasNoSteps));
        };

        let pending = self
            .timed(
                "check pending",
                self.queue.has_pending(company_id, contact_id, &sequence.id),
            )
            .await?;
        if pending {
            return Ok(self.skip(contact_id, SkipReason::AlreadyScheduled));
        }

        let item = QueueItem::for_step(
            sequence,
            step,
            contact_id,
            contact.conversation_id.as_deref(),
            contact.last_message_at,
            Utc::now(),
        )?;
        // Insert and binding commit together, guarded against a concurrent opt-out.
        let item = match self
            .timed("insert queue item", self.queue.enqueue(item))
            .await?
        {
            EnqueueResult::Inserted(item) => item,
            EnqueueResult::Conflict => return Ok(self.skip(contact_id, SkipReason::AlreadyScheduled)),
            EnqueueResult::OptedOut => return Ok(self.skip(contact_id, SkipReason::OptedOut)),
        };

        tracing::info!(
            "Enqueued contact '{contact_id}' into sequence '{}' at {}",
            sequence.name,
            item.scheduled_at.to_rfc3339()
        );
        Ok(EnqueueOutcome::scheduled(&item))
    }

    fn skip(&self, contact_id: &str, reason: SkipReason) -> EnqueueOutcome {
        tracing::debug!("Contact '{contact_id}' not enqueued: {reason}");
        EnqueueOutcome::skipped(reason)
    }

    /// Bound `fut` by the call timeout.
    ///
    /// Expiry drops the future but not a `spawn_blocking` job it started, so
    /// a timed-out write may still commit. Every write is a single
    /// transaction (item and binding together), so a late commit leaves a
    /// consistent row set that the next invocation sees as already scheduled.
    async fn timed<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.settings.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(NudgeError::Timeout {
                operation: operation.to_string(),
                secs: self.settings.call_timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::StepDelay;
    use crate::directory::SqliteDirectory;
    use crate::persistence::FollowUpDb;
    use crate::queue::QueueStatus;
    use crate::sequence::SequenceFilters;
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct Fixture {
        db: Arc<FollowUpDb>,
        enqueuer: Enqueuer,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(FollowUpDb::open_in_memory().unwrap());
        let enqueuer = build(db.clone(), Arc::new(SqliteDirectory::new(db.clone())), EnqueuerSettings::default());
        Fixture { db, enqueuer }
    }

    fn build(db: Arc<FollowUpDb>, directory: Arc<dyn CrmDirectory>, settings: EnqueuerSettings) -> Enqueuer {
        Enqueuer::new(
            directory,
            ContactStateStore::new(db.clone()),
            FollowUpQueue::new(db),
            settings,
        )
    }

    fn tags(t: &[&str]) -> SequenceFilters {
        SequenceFilters {
            tag_filters: t.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn add_contact(db: &FollowUpDb, company: &str, contact: &str, contact_tags: &[&str], idle_hours: i64) {
        db.save_contact(company, contact, contact, contact_tags).unwrap();
        db.save_conversation(&Conversation {
            id: format!("conv-{contact}"),
            company_id: company.into(),
            contact_id: contact.into(),
            connection_id: Some("wa-main".into()),
            crm_stage_id: None,
            last_message_at: Utc::now() - Duration::hours(idle_hours),
        })
        .unwrap();
    }

    fn re_engage() -> Sequence {
        Sequence::new("Re-engage", "co", "Re-engage", 1)
            .with_filters(tags(&["lead"]))
            .with_step("re-engage-1", StepDelay::new(30, "minutes"))
    }

    /// Directory that fails or stalls `contact()` for chosen contacts.
    struct FlakyDirectory {
        inner: SqliteDirectory,
        failing: HashSet<String>,
        stalling: HashSet<String>,
    }

    #[async_trait]
    impl CrmDirectory for FlakyDirectory {
        async fn active_sequences(&self, company_id: Option<&str>) -> Result<Vec<Sequence>> {
            self.inner.active_sequences(company_id).await
        }

        async fn sequence(&self, company_id: &str, sequence_id: &str) -> Result<Option<Sequence>> {
            self.inner.sequence(company_id, sequence_id).await
        }

        async fn contact(&self, company_id: &str, contact_id: &str) -> Result<Option<ContactSnapshot>> {
            if self.failing.contains(contact_id) {
                return Err(NudgeError::Storage("connection reset".into()));
            }
            if self.stalling.contains(contact_id) {
                tokio::time::sleep(StdDuration::from_secs(30)).await;
            }
            self.inner.contact(company_id, contact_id).await
        }

        async fn inactive_conversations(
            &self,
            company_id: &str,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<Conversation>> {
            self.inner.inactive_conversations(company_id, cutoff, limit).await
        }
    }

    #[tokio::test]
    async fn test_end_to_end_re_engage() {
        let f = fixture();
        f.db.save_sequence(&re_engage()).unwrap();
        add_contact(&f.db, "co", "C1", &["lead"], 1);

        let before = Utc::now();
        let outcome = f.enqueuer.enqueue_for_contact("C1", "co", None).await.unwrap();
        assert!(outcome.enqueued);
        assert_eq!(outcome.sequence_id.as_deref(), Some("Re-engage"));

        let state = f.db.get_contact_state("co", "C1").unwrap().unwrap();
        assert_eq!(state.active_sequence_id.as_deref(), Some("Re-engage"));
        assert_eq!(state.current_step_order, 0);

        let items = f.db.items_for_contact("co", "C1").unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::Pending);
        assert_eq!(items[0].current_step_id, "re-engage-1");
        assert_eq!(items[0].conversation_id.as_deref(), Some("conv-C1"));
        let scheduled = items[0].scheduled_at;
        assert!(scheduled >= before + Duration::minutes(30) - Duration::seconds(1));
        assert!(scheduled <= Utc::now() + Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_second_enqueue_is_already_scheduled() {
        let f = fixture();
        f.db.save_sequence(&re_engage()).unwrap();
        add_contact(&f.db, "co", "C1", &["lead"], 1);

        let first = f.enqueuer.enqueue_for_contact("C1", "co", Some("Re-engage")).await.unwrap();
        assert!(first.enqueued);
        let second = f.enqueuer.enqueue_for_contact("C1", "co", Some("Re-engage")).await.unwrap();
        assert!(!second.enqueued);
        assert_eq!(second.reason, Some(SkipReason::AlreadyScheduled));
        assert_eq!(f.db.items_for_contact("co", "C1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_match_does_not_hijack_bound_contact() {
        let f = fixture();
        f.db.save_sequence(&re_engage()).unwrap();
        add_contact(&f.db, "co", "C1", &["lead"], 1);

        assert!(f.enqueuer.enqueue_for_contact("C1", "co", None).await.unwrap().enqueued);
        let again = f.enqueuer.enqueue_for_contact("C1", "co", None).await.unwrap();
        assert_eq!(again.reason, Some(SkipReason::AlreadyInSequence));
    }

    #[tokio::test]
    async fn test_opted_out_never_enqueued() {
        let f = fixture();
        f.db.save_sequence(&re_engage()).unwrap();
        add_contact(&f.db, "co", "C1", &["lead"], 48);
        f.db.set_opted_out("co", "C1", true).unwrap();

        let auto = f.enqueuer.enqueue_for_contact("C1", "co", None).await.unwrap();
        assert_eq!(auto.reason, Some(SkipReason::OptedOut));
        let explicit = f.enqueuer.enqueue_for_contact("C1", "co", Some("Re-engage")).await.unwrap();
        assert_eq!(explicit.reason, Some(SkipReason::OptedOut));

        let summary = f.enqueuer.scan_and_enqueue_inactive_contacts().await.unwrap();
        assert_eq!(summary.enqueued, 0);
        assert!(f.db.items_for_contact("co", "C1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_sequence_rebinds() {
        let f = fixture();
        f.db.save_sequence(&Sequence::new("X", "co", "X", 5).with_step("x-1", StepDelay::new(1, "hours")))
            .unwrap();
        f.db.save_sequence(&Sequence::new("Y", "co", "Y", 1).with_step("y-1", StepDelay::new(1, "days")))
            .unwrap();
        add_contact(&f.db, "co", "C1", &[], 1);

        let first = f.enqueuer.enqueue_for_contact("C1", "co", None).await.unwrap();
        assert_eq!(first.sequence_id.as_deref(), Some("X"));

        let rebound = f.enqueuer.enqueue_for_contact("C1", "co", Some("Y")).await.unwrap();
        assert!(rebound.enqueued);
        let state = f.db.get_contact_state("co", "C1").unwrap().unwrap();
        assert_eq!(state.active_sequence_id.as_deref(), Some("Y"));
        assert!(f.db.has_pending("co", "C1", "Y").unwrap());
    }

    #[tokio::test]
    async fn test_explicit_sequence_must_be_active_and_owned() {
        let f = fixture();
        let mut paused = Sequence::new("P", "co", "Paused", 1).with_step("p-1", StepDelay::new(1, "hours"));
        paused.status = crate::sequence::SequenceStatus::Paused;
        f.db.save_sequence(&paused).unwrap();
        f.db.save_sequence(&Sequence::new("Other", "co-2", "Other", 1).with_step("o-1", StepDelay::new(1, "hours")))
            .unwrap();
        add_contact(&f.db, "co", "C1", &[], 1);

        for sequence_id in ["P", "Other", "missing"] {
            let outcome = f.enqueuer.enqueue_for_contact("C1", "co", Some(sequence_id)).await.unwrap();
            assert_eq!(outcome.reason, Some(SkipReason::SequenceNotFoundOrInactive));
        }
        assert!(f.db.get_contact_state("co", "C1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_match_and_no_steps() {
        let f = fixture();
        f.db.save_sequence(&Sequence::new("vip", "co", "VIP", 1).with_filters(tags(&["vip"])))
            .unwrap();
        add_contact(&f.db, "co", "C1", &["lead"], 1);
        add_contact(&f.db, "co", "C2", &["vip"], 1);

        let none = f.enqueuer.enqueue_for_contact("C1", "co", None).await.unwrap();
        assert_eq!(none.reason, Some(SkipReason::NoMatchingSequence));
        let empty = f.enqueuer.enqueue_for_contact("C2", "co", None).await.unwrap();
        assert_eq!(empty.reason, Some(SkipReason::SequenceHasNoSteps));
        assert!(f.db.get_contact_state("co", "C2").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_ids_rejected() {
        let f = fixture();
        assert!(matches!(
            f.enqueuer.enqueue_for_contact("", "co", None).await,
            Err(NudgeError::InvalidInput(_))
        ));
        assert!(matches!(
            f.enqueuer.enqueue_for_contact("C1", "  ", None).await,
            Err(NudgeError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_contact_of_other_company_rejected() {
        let f = fixture();
        f.db.save_sequence(&Sequence::new("all", "co", "All", 1).with_step("a-1", StepDelay::new(1, "hours")))
            .unwrap();
        add_contact(&f.db, "co-2", "C9", &[], 1);
        assert!(f.enqueuer.enqueue_for_contact("C9", "co", None).await.is_err());
        assert!(f.db.items_for_contact("co", "C9").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_enqueues_stale_contacts_per_company() {
        let f = fixture();
        f.db.save_sequence(&re_engage()).unwrap();
        f.db.save_sequence(&Sequence::new("b-all", "co-b", "B", 1).with_step("b-1", StepDelay::new(2, "hours")))
            .unwrap();
        add_contact(&f.db, "co", "stale-lead", &["lead"], 30);
        add_contact(&f.db, "co", "stale-other", &["customer"], 30);
        add_contact(&f.db, "co", "fresh-lead", &["lead"], 2);
        add_contact(&f.db, "co-b", "b-stale", &[], 48);
        add_contact(&f.db, "co-c", "c-stale", &[], 48);

        let summary = f.enqueuer.scan_and_enqueue_inactive_contacts().await.unwrap();
        assert_eq!(summary.companies, 2);
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.enqueued, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert!(f.db.has_pending("co", "stale-lead", "Re-engage").unwrap());
        assert!(f.db.has_pending("co-b", "b-stale", "b-all").unwrap());
        assert!(f.db.items_for_contact("co-c", "c-stale").unwrap().is_empty());

        // A second pass finds nothing new to schedule.
        let again = f.enqueuer.scan_and_enqueue_inactive_contacts().await.unwrap();
        assert_eq!(again.enqueued, 0);
    }

    #[tokio::test]
    async fn test_scan_respects_batch_limit() {
        let db = Arc::new(FollowUpDb::open_in_memory().unwrap());
        let settings = EnqueuerSettings {
            batch_limit: 2,
            ..EnqueuerSettings::default()
        };
        let enqueuer = build(db.clone(), Arc::new(SqliteDirectory::new(db.clone())), settings);
        db.save_sequence(&Sequence::new("all", "co", "All", 1).with_step("a-1", StepDelay::new(1, "days")))
            .unwrap();
        for i in 0..5 {
            add_contact(&db, "co", &format!("c-{i}"), &[], 30 + i);
        }

        let first = enqueuer.scan_and_enqueue_inactive_contacts().await.unwrap();
        assert_eq!((first.scanned, first.enqueued), (2, 2));
        let second = enqueuer.scan_and_enqueue_inactive_contacts().await.unwrap();
        assert_eq!((second.scanned, second.enqueued), (2, 2));
        let third = enqueuer.scan_and_enqueue_inactive_contacts().await.unwrap();
        assert_eq!((third.scanned, third.enqueued), (1, 1));
    }

    #[tokio::test]
    async fn test_scan_isolates_candidate_failures() {
        let db = Arc::new(FollowUpDb::open_in_memory().unwrap());
        let directory = FlakyDirectory {
            inner: SqliteDirectory::new(db.clone()),
            failing: HashSet::from(["c-2".to_string()]),
            stalling: HashSet::new(),
        };
        let enqueuer = build(db.clone(), Arc::new(directory), EnqueuerSettings::default());
        db.save_sequence(&Sequence::new("all", "co", "All", 1).with_step("a-1", StepDelay::new(1, "hours")))
            .unwrap();
        add_contact(&db, "co", "c-1", &[], 72);
        add_contact(&db, "co", "c-2", &[], 48);
        add_contact(&db, "co", "c-3", &[], 30);

        let summary = enqueuer.scan_and_enqueue_inactive_contacts().await.unwrap();
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.enqueued, 2);
        assert_eq!(summary.failed, 1);
        assert!(db.get_contact_state("co", "c-2").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_times_out_stalled_candidate() {
        let db = Arc::new(FollowUpDb::open_in_memory().unwrap());
        let directory = FlakyDirectory {
            inner: SqliteDirectory::new(db.clone()),
            failing: HashSet::new(),
            stalling: HashSet::from(["slow".to_string()]),
        };
        let settings = EnqueuerSettings {
            call_timeout: StdDuration::from_millis(200),
            ..EnqueuerSettings::default()
        };
        let enqueuer = build(db.clone(), Arc::new(directory), settings);
        db.save_sequence(&Sequence::new("all", "co", "All", 1).with_step("a-1", StepDelay::new(1, "hours")))
            .unwrap();
        add_contact(&db, "co", "slow", &[], 72);
        add_contact(&db, "co", "quick", &[], 30);

        let summary = enqueuer.scan_and_enqueue_inactive_contacts().await.unwrap();
        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.enqueued, 1);
        assert_eq!(summary.failed, 1);
        assert!(db.has_pending("co", "quick", "all").unwrap());
    }

    /// Directory that opts the contact out while its snapshot is read, i.e.
    /// after the enqueuer already judged it eligible.
    struct OptOutDuringLookup {
        inner: SqliteDirectory,
        db: Arc<FollowUpDb>,
    }

    #[async_trait]
    impl CrmDirectory for OptOutDuringLookup {
        async fn active_sequences(&self, company_id: Option<&str>) -> Result<Vec<Sequence>> {
            self.inner.active_sequences(company_id).await
        }

        async fn sequence(&self, company_id: &str, sequence_id: &str) -> Result<Option<Sequence>> {
            self.inner.sequence(company_id, sequence_id).await
        }

        async fn contact(&self, company_id: &str, contact_id: &str) -> Result<Option<ContactSnapshot>> {
            self.db.set_opted_out(company_id, contact_id, true)?;
            self.inner.contact(company_id, contact_id).await
        }

        async fn inactive_conversations(
            &self,
            company_id: &str,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<Conversation>> {
            self.inner.inactive_conversations(company_id, cutoff, limit).await
        }
    }

    #[tokio::test]
    async fn test_opt_out_racing_enqueue_wins() {
        let db = Arc::new(FollowUpDb::open_in_memory().unwrap());
        let directory = OptOutDuringLookup {
            inner: SqliteDirectory::new(db.clone()),
            db: db.clone(),
        };
        let enqueuer = build(db.clone(), Arc::new(directory), EnqueuerSettings::default());
        db.save_sequence(&re_engage()).unwrap();
        add_contact(&db, "co", "C1", &["lead"], 48);
        add_contact(&db, "co", "C2", &["lead"], 48);

        let outcome = enqueuer.enqueue_for_contact("C1", "co", None).await.unwrap();
        assert_eq!(outcome.reason, Some(SkipReason::OptedOut));

        let summary = enqueuer.scan_and_enqueue_inactive_contacts().await.unwrap();
        assert_eq!(summary.enqueued, 0);

        for contact in ["C1", "C2"] {
            assert!(db.items_for_contact("co", contact).unwrap().is_empty());
            let state = db.get_contact_state("co", contact).unwrap().unwrap();
            assert!(state.opted_out);
            assert!(state.active_sequence_id.is_none());
        }
    }

    #[tokio::test]
    async fn test_out_of_range_delay_fails_only_that_candidate() {
        let f = fixture();
        f.db.save_sequence(
            &Sequence::new("far", "co", "Far", 5)
                .with_filters(tags(&["far"]))
                .with_step("far-1", StepDelay::new(1_000_000_000, "days")),
        )
        .unwrap();
        f.db.save_sequence(&re_engage()).unwrap();
        add_contact(&f.db, "co", "c-far", &["far"], 72);
        add_contact(&f.db, "co", "c-lead", &["lead"], 30);

        assert!(matches!(
            f.enqueuer.enqueue_for_contact("c-far", "co", None).await,
            Err(NudgeError::Schedule(_))
        ));

        let summary = f.enqueuer.scan_and_enqueue_inactive_contacts().await.unwrap();
        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.enqueued, 1);
        assert_eq!(summary.failed, 1);
        assert!(f.db.get_contact_state("co", "c-far").unwrap().is_none());
        assert!(f.db.has_pending("co", "c-lead", "Re-engage").unwrap());
    }

    #[tokio::test]
    async fn test_outcome_serializes_reason_snake_case() {
        let json = serde_json::to_value(EnqueueOutcome::skipped(SkipReason::AlreadyScheduled)).unwrap();
        assert_eq!(json["enqueued"], false);
        assert_eq!(json["reason"], "already_scheduled");
        assert!(json.get("scheduled_at").is_none());
    }
}
