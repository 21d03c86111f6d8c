//! SQLite-backed persistence for the sequence catalog, contact snapshots,
//! contact automation state and the follow-up queue.
//!
//! The "one pending item per (contact, sequence)" rule lives in the schema
//! as a partial unique index, so concurrent enqueuers resolve to exactly one
//! insert and every loser sees a conflict instead of a duplicate row.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use nudge_core::error::{NudgeError, Result};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::delay::StepDelay;
use crate::directory::{ContactSnapshot, Conversation};
use crate::matcher::ContactAttributes;
use crate::queue::{QueueItem, QueueStatus};
use crate::sequence::{Sequence, SequenceFilters, SequenceStatus, Step};
use crate::state::ContactState;

/// Follow-up database — shared by every component of the engine.
pub struct FollowUpDb {
    conn: Mutex<Connection>,
}

/// Result of [`FollowUpDb::insert_pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInsert {
    Inserted,
    /// A pending item for the same contact and sequence already exists.
    Duplicate,
    /// The contact is opted out; nothing was written.
    OptedOut,
}

/// Timestamps are stored as fixed-width UTC RFC 3339 text so that SQL string
/// comparison orders them chronologically.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Read a stored timestamp. A malformed value fails the row.
fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

impl FollowUpDb {
    /// Open or create the follow-up database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| NudgeError::storage("DB open", e))?;

        // WAL for concurrent readers; busy timeout so overlapping writers wait
        // instead of failing straight away.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| NudgeError::storage("Busy timeout", e))?;

        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| NudgeError::storage("Lock", e))
    }

    /// Run a blocking closure against the database on the blocking pool.
    pub async fn call<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&FollowUpDb) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| NudgeError::storage("Blocking task", e))?
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                company_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'active',   -- active, paused, archived
                priority INTEGER NOT NULL DEFAULT 0,
                filters TEXT NOT NULL DEFAULT '{}',       -- JSON: connection_ids, crm_stage_ids, tag_filters
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sequences_company ON sequences(company_id, status);

            CREATE TABLE IF NOT EXISTS sequence_steps (
                id TEXT PRIMARY KEY,
                sequence_id TEXT NOT NULL REFERENCES sequences(id) ON DELETE CASCADE,
                step_order INTEGER NOT NULL,
                delay_value INTEGER,
                delay_unit TEXT,
                content_ref TEXT,
                stop_if_replied INTEGER NOT NULL DEFAULT 1,
                stop_if_opened INTEGER NOT NULL DEFAULT 0,
                UNIQUE (sequence_id, step_order)
            );

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                company_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS contact_tags (
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                tag TEXT NOT NULL,
                PRIMARY KEY (contact_id, tag)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                company_id TEXT NOT NULL,
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                connection_id TEXT,
                crm_stage_id TEXT,
                last_message_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_activity
                ON conversations(company_id, last_message_at);

            -- One row per contact
            CREATE TABLE IF NOT EXISTS contact_states (
                contact_id TEXT PRIMARY KEY,
                company_id TEXT NOT NULL,
                active_sequence_id TEXT,
                current_step_order INTEGER NOT NULL DEFAULT 0,
                opted_out INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS followup_queue (
                id TEXT PRIMARY KEY,
                company_id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                conversation_id TEXT,
                sequence_id TEXT NOT NULL,
                current_step_id TEXT NOT NULL,
                scheduled_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',   -- pending, sent, failed, cancelled
                reference_message_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_followup_one_pending
                ON followup_queue(contact_id, sequence_id) WHERE status = 'pending';
            CREATE INDEX IF NOT EXISTS idx_followup_due
                ON followup_queue(status, scheduled_at);
            ",
        )
        .map_err(|e| NudgeError::storage("Migration", e))?;
        Ok(())
    }

    // ─── Sequence catalog ──────────────────────────────────────

    /// Create or replace a sequence and its steps. Catalog order is creation
    /// order and survives updates.
    pub fn save_sequence(&self, sequence: &Sequence) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| NudgeError::storage("Begin", e))?;
        let filters = serde_json::to_string(&sequence.filters)?;
        tx.execute(
            "INSERT INTO sequences (id, company_id, name, status, priority, filters, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                company_id = excluded.company_id,
                name = excluded.name,
                status = excluded.status,
                priority = excluded.priority,
                filters = excluded.filters",
            params![
                sequence.id,
                sequence.company_id,
                sequence.name,
                sequence.status.as_str(),
                sequence.priority,
                filters,
                ts(Utc::now()),
            ],
        )
        .map_err(|e| NudgeError::storage("Save sequence", e))?;

        tx.execute(
            "DELETE FROM sequence_steps WHERE sequence_id = ?1",
            [&sequence.id],
        )
        .map_err(|e| NudgeError::storage("Clear steps", e))?;
        for step in &sequence.steps {
            tx.execute(
                "INSERT INTO sequence_steps
                 (id, sequence_id, step_order, delay_value, delay_unit, content_ref, stop_if_replied, stop_if_opened)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    step.id,
                    sequence.id,
                    step.step_order,
                    step.delay.value,
                    step.delay.unit,
                    step.content_ref,
                    step.stop_if_replied as i32,
                    step.stop_if_opened as i32,
                ],
            )
            .map_err(|e| NudgeError::storage("Save step", e))?;
        }
        tx.commit().map_err(|e| NudgeError::storage("Commit", e))?;
        Ok(())
    }

    /// Active sequences, optionally for a single company, in catalog order.
    pub fn load_active_sequences(&self, company_id: Option<&str>) -> Result<Vec<Sequence>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, company_id, name, status, priority, filters FROM sequences
                 WHERE status = 'active' AND (?1 IS NULL OR company_id = ?1)
                 ORDER BY rowid",
            )
            .map_err(|e| NudgeError::storage("Prepare sequences", e))?;
        let rows = stmt
            .query_map([company_id], sequence_from_row)
            .map_err(|e| NudgeError::storage("Load sequences", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| NudgeError::storage("Read sequence", e))?;

        let mut sequences = Vec::with_capacity(rows.len());
        for (sequence, filters) in rows {
            let id = sequence.id.clone();
            match with_filters(sequence, &filters) {
                Ok(mut sequence) => {
                    sequence.steps = load_steps(&conn, &sequence.id)?;
                    sequences.push(sequence);
                }
                Err(e) => tracing::warn!("Skipping sequence '{id}' with unreadable filters: {e}"),
            }
        }
        Ok(sequences)
    }

    /// A single sequence of a company, whatever its status.
    pub fn load_sequence(&self, company_id: &str, sequence_id: &str) -> Result<Option<Sequence>> {
        let conn = self.lock()?;
        let sequence = conn
            .query_row(
                "SELECT id, company_id, name, status, priority, filters FROM sequences
                 WHERE id = ?1 AND company_id = ?2",
                params![sequence_id, company_id],
                sequence_from_row,
            )
            .optional()
            .map_err(|e| NudgeError::storage("Load sequence", e))?;
        match sequence {
            Some((sequence, filters)) => {
                let mut sequence = with_filters(sequence, &filters)?;
                sequence.steps = load_steps(&conn, &sequence.id)?;
                Ok(Some(sequence))
            }
            None => Ok(None),
        }
    }

    // ─── Contacts & conversations ──────────────────────────────

    /// Create or update a contact and replace its tag set.
    pub fn save_contact(&self, company_id: &str, contact_id: &str, name: &str, tags: &[&str]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| NudgeError::storage("Begin", e))?;
        let changed = tx
            .execute(
                "INSERT INTO contacts (id, company_id, name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name
                 WHERE contacts.company_id = excluded.company_id",
                params![contact_id, company_id, name],
            )
            .map_err(|e| NudgeError::storage("Save contact", e))?;
        if changed == 0 {
            return Err(tenant_mismatch(contact_id, company_id));
        }
        tx.execute("DELETE FROM contact_tags WHERE contact_id = ?1", [contact_id])
            .map_err(|e| NudgeError::storage("Clear tags", e))?;
        for tag in tags {
            tx.execute(
                "INSERT OR IGNORE INTO contact_tags (contact_id, tag) VALUES (?1, ?2)",
                params![contact_id, tag],
            )
            .map_err(|e| NudgeError::storage("Save tag", e))?;
        }
        tx.commit().map_err(|e| NudgeError::storage("Commit", e))?;
        Ok(())
    }

    /// Create or update a conversation.
    pub fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO conversations (id, company_id, contact_id, connection_id, crm_stage_id, last_message_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                connection_id = excluded.connection_id,
                crm_stage_id = excluded.crm_stage_id,
                last_message_at = excluded.last_message_at
             WHERE conversations.company_id = excluded.company_id",
            params![
                conversation.id,
                conversation.company_id,
                conversation.contact_id,
                conversation.connection_id,
                conversation.crm_stage_id,
                ts(conversation.last_message_at),
            ],
        )
        .map_err(|e| NudgeError::storage("Save conversation", e))?;
        Ok(())
    }

    /// Tags and most recent conversation of a contact within its company.
    pub fn contact_snapshot(&self, company_id: &str, contact_id: &str) -> Result<Option<ContactSnapshot>> {
        let conn = self.lock()?;
        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM contacts WHERE id = ?1 AND company_id = ?2",
                params![contact_id, company_id],
                |r| r.get::<_, i64>(0),
            )
            .map_err(|e| NudgeError::storage("Load contact", e))?
            > 0;
        if !exists {
            return Ok(None);
        }

        let latest = conn
            .query_row(
                "SELECT id, connection_id, crm_stage_id, last_message_at FROM conversations
                 WHERE contact_id = ?1 AND company_id = ?2
                 ORDER BY last_message_at DESC LIMIT 1",
                params![contact_id, company_id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, Option<String>>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        parse_ts(3, &r.get::<_, String>(3)?)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| NudgeError::storage("Load conversation", e))?;

        let tags = load_tags(&conn, contact_id)?;
        let (conversation_id, connection_id, crm_stage_id, last_message_at) = match latest {
            Some((id, conn_id, stage, at)) => (Some(id), conn_id, stage, Some(at)),
            None => (None, None, None, None),
        };

        Ok(Some(ContactSnapshot {
            contact_id: contact_id.to_string(),
            company_id: company_id.to_string(),
            attributes: ContactAttributes {
                tags,
                connection_id,
                crm_stage_id,
            },
            conversation_id,
            last_message_at,
        }))
    }

    /// Latest conversation of every contact that went quiet before `cutoff`,
    /// oldest first, capped at `limit`.
    ///
    /// Contacts that are opted out, bound to a sequence or already holding a
    /// pending item are excluded here so a capped batch always makes progress
    /// on the backlog.
    pub fn inactive_candidates(
        &self,
        company_id: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT c.id, c.contact_id, c.connection_id, c.crm_stage_id, c.last_message_at
                 FROM conversations c
                 WHERE c.company_id = ?1
                   AND c.last_message_at < ?2
                   AND c.last_message_at = (
                        SELECT MAX(c2.last_message_at) FROM conversations c2
                        WHERE c2.contact_id = c.contact_id AND c2.company_id = c.company_id)
                   AND NOT EXISTS (
                        SELECT 1 FROM contact_states s
                        WHERE s.contact_id = c.contact_id
                          AND (s.opted_out = 1 OR s.active_sequence_id IS NOT NULL))
                   AND NOT EXISTS (
                        SELECT 1 FROM followup_queue q
                        WHERE q.contact_id = c.contact_id AND q.status = 'pending')
                 GROUP BY c.contact_id
                 ORDER BY c.last_message_at ASC
                 LIMIT ?3",
            )
            .map_err(|e| NudgeError::storage("Prepare candidates", e))?;
        stmt.query_map(params![company_id, ts(cutoff), limit as i64], |r| {
            let last_message_at: String = r.get(4)?;
            Ok(Conversation {
                id: r.get(0)?,
                company_id: company_id.to_string(),
                contact_id: r.get(1)?,
                connection_id: r.get(2)?,
                crm_stage_id: r.get(3)?,
                last_message_at: parse_ts(4, &last_message_at)?,
            })
        })
        .map_err(|e| NudgeError::storage("Load candidates", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| NudgeError::storage("Read candidate", e))
    }

    // ─── Contact state ─────────────────────────────────────────

    /// State row of a contact. A row owned by another company is an error.
    pub fn get_contact_state(&self, company_id: &str, contact_id: &str) -> Result<Option<ContactState>> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT contact_id, company_id, active_sequence_id, current_step_order, opted_out, updated_at
                 FROM contact_states WHERE contact_id = ?1",
                [contact_id],
                state_from_row,
            )
            .optional()
            .map_err(|e| NudgeError::storage("Load contact state", e))?;
        match state {
            Some(s) if s.company_id != company_id => Err(tenant_mismatch(contact_id, company_id)),
            other => Ok(other),
        }
    }

    /// Bind a contact to a sequence, creating the row if absent. The opt-out
    /// flag is left untouched on existing rows.
    pub fn upsert_contact_state(
        &self,
        company_id: &str,
        contact_id: &str,
        active_sequence_id: Option<&str>,
        current_step_order: u32,
    ) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT INTO contact_states (contact_id, company_id, active_sequence_id, current_step_order, opted_out, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)
                 ON CONFLICT(contact_id) DO UPDATE SET
                    active_sequence_id = excluded.active_sequence_id,
                    current_step_order = excluded.current_step_order,
                    updated_at = excluded.updated_at
                 WHERE contact_states.company_id = excluded.company_id",
                params![contact_id, company_id, active_sequence_id, current_step_order, ts(Utc::now())],
            )
            .map_err(|e| NudgeError::storage("Upsert contact state", e))?;
        if changed == 0 {
            return Err(tenant_mismatch(contact_id, company_id));
        }
        Ok(())
    }

    /// Move a contact bound to `sequence_id` to `step_order`. Returns false
    /// when the contact is not bound to that sequence.
    pub fn advance_contact_state(
        &self,
        company_id: &str,
        contact_id: &str,
        sequence_id: &str,
        step_order: u32,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE contact_states SET current_step_order = ?1, updated_at = ?2
                 WHERE contact_id = ?3 AND company_id = ?4 AND active_sequence_id = ?5",
                params![step_order, ts(Utc::now()), contact_id, company_id, sequence_id],
            )
            .map_err(|e| NudgeError::storage("Advance contact state", e))?;
        Ok(changed > 0)
    }

    /// Clear the binding when the contact finished `sequence_id`.
    pub fn clear_contact_sequence(&self, company_id: &str, contact_id: &str, sequence_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE contact_states SET active_sequence_id = NULL, current_step_order = 0, updated_at = ?1
                 WHERE contact_id = ?2 AND company_id = ?3 AND active_sequence_id = ?4",
                params![ts(Utc::now()), contact_id, company_id, sequence_id],
            )
            .map_err(|e| NudgeError::storage("Clear contact sequence", e))?;
        Ok(changed > 0)
    }

    /// Set the opt-out flag. Opting out also unbinds the contact and cancels
    /// its pending items. Returns the number of cancelled items.
    pub fn set_opted_out(&self, company_id: &str, contact_id: &str, opted_out: bool) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| NudgeError::storage("Begin", e))?;
        let now = ts(Utc::now());
        let written = if opted_out {
            tx.execute(
                "INSERT INTO contact_states (contact_id, company_id, active_sequence_id, current_step_order, opted_out, updated_at)
                 VALUES (?1, ?2, NULL, 0, 1, ?3)
                 ON CONFLICT(contact_id) DO UPDATE SET
                    opted_out = 1, active_sequence_id = NULL, current_step_order = 0,
                    updated_at = excluded.updated_at
                 WHERE contact_states.company_id = excluded.company_id",
                params![contact_id, company_id, now],
            )
        } else {
            tx.execute(
                "INSERT INTO contact_states (contact_id, company_id, active_sequence_id, current_step_order, opted_out, updated_at)
                 VALUES (?1, ?2, NULL, 0, 0, ?3)
                 ON CONFLICT(contact_id) DO UPDATE SET opted_out = 0, updated_at = excluded.updated_at
                 WHERE contact_states.company_id = excluded.company_id",
                params![contact_id, company_id, now],
            )
        };
        let changed = written.map_err(|e| NudgeError::storage("Set opt-out", e))?;
        if changed == 0 {
            return Err(tenant_mismatch(contact_id, company_id));
        }

        let cancelled = if opted_out {
            tx.execute(
                "UPDATE followup_queue SET status = 'cancelled', updated_at = ?1
                 WHERE contact_id = ?2 AND company_id = ?3 AND status = 'pending'",
                params![now, contact_id, company_id],
            )
            .map_err(|e| NudgeError::storage("Cancel pending", e))?
        } else {
            0
        };
        tx.commit().map_err(|e| NudgeError::storage("Commit", e))?;
        Ok(cancelled)
    }

    // ─── Follow-up queue ───────────────────────────────────────

    /// Whether a pending item exists for the pair.
    pub fn has_pending(&self, company_id: &str, contact_id: &str, sequence_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM followup_queue
                 WHERE company_id = ?1 AND contact_id = ?2 AND sequence_id = ?3 AND status = 'pending'",
                params![company_id, contact_id, sequence_id],
                |r| r.get(0),
            )
            .map_err(|e| NudgeError::storage("Check pending", e))?;
        Ok(count > 0)
    }

    /// Whether the contact has a pending item for any sequence.
    pub fn has_any_pending(&self, company_id: &str, contact_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM followup_queue
                 WHERE company_id = ?1 AND contact_id = ?2 AND status = 'pending'",
                params![company_id, contact_id],
                |r| r.get(0),
            )
            .map_err(|e| NudgeError::storage("Check pending", e))?;
        Ok(count > 0)
    }

    /// Insert a pending item and bind its contact to the item's sequence at
    /// step 0, in one transaction.
    ///
    /// The insert itself is conditional: nothing is written when the contact
    /// is opted out or when the unique pending index already holds an item
    /// for the pair. A binding therefore never exists without its item, and
    /// an opt-out committed after the caller's eligibility read still wins.
    pub fn insert_pending(&self, item: &QueueItem) -> Result<PendingInsert> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| NudgeError::storage("Begin", e))?;
        let now = ts(Utc::now());
        let changed = tx
            .execute(
                "INSERT INTO followup_queue
                 (id, company_id, contact_id, conversation_id, sequence_id, current_step_id,
                  scheduled_at, status, reference_message_at, created_at, updated_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?9
                 WHERE NOT EXISTS (
                    SELECT 1 FROM contact_states WHERE contact_id = ?3 AND opted_out = 1)
                 ON CONFLICT DO NOTHING",
                params![
                    item.id,
                    item.company_id,
                    item.contact_id,
                    item.conversation_id,
                    item.sequence_id,
                    item.current_step_id,
                    ts(item.scheduled_at),
                    ts(item.reference_message_at),
                    now,
                ],
            )
            .map_err(|e| NudgeError::storage("Insert queue item", e))?;

        if changed == 0 {
            let opted_out: bool = tx
                .query_row(
                    "SELECT COUNT(*) FROM contact_states WHERE contact_id = ?1 AND opted_out = 1",
                    [&item.contact_id],
                    |r| r.get::<_, i64>(0),
                )
                .map_err(|e| NudgeError::storage("Check opt-out", e))?
                > 0;
            return Ok(if opted_out {
                PendingInsert::OptedOut
            } else {
                PendingInsert::Duplicate
            });
        }

        let bound = tx
            .execute(
                "INSERT INTO contact_states (contact_id, company_id, active_sequence_id, current_step_order, opted_out, updated_at)
                 VALUES (?1, ?2, ?3, 0, 0, ?4)
                 ON CONFLICT(contact_id) DO UPDATE SET
                    active_sequence_id = excluded.active_sequence_id,
                    current_step_order = 0,
                    updated_at = excluded.updated_at
                 WHERE contact_states.company_id = excluded.company_id",
                params![item.contact_id, item.company_id, item.sequence_id, now],
            )
            .map_err(|e| NudgeError::storage("Bind contact state", e))?;
        if bound == 0 {
            return Err(tenant_mismatch(&item.contact_id, &item.company_id));
        }
        tx.commit().map_err(|e| NudgeError::storage("Commit", e))?;
        Ok(PendingInsert::Inserted)
    }

    /// Pending items whose run time has elapsed, earliest first.
    pub fn due_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueItem>> {
        self.query_items(
            "SELECT id, company_id, contact_id, conversation_id, sequence_id, current_step_id,
                    scheduled_at, status, reference_message_at
             FROM followup_queue WHERE status = 'pending' AND scheduled_at <= ?1
             ORDER BY scheduled_at LIMIT ?2",
            params![ts(now), limit as i64],
        )
    }

    /// Pending items of one company, earliest first.
    pub fn pending_items(&self, company_id: &str, limit: usize) -> Result<Vec<QueueItem>> {
        self.query_items(
            "SELECT id, company_id, contact_id, conversation_id, sequence_id, current_step_id,
                    scheduled_at, status, reference_message_at
             FROM followup_queue WHERE status = 'pending' AND company_id = ?1
             ORDER BY scheduled_at LIMIT ?2",
            params![company_id, limit as i64],
        )
    }

    /// Every item of a contact, oldest first.
    pub fn items_for_contact(&self, company_id: &str, contact_id: &str) -> Result<Vec<QueueItem>> {
        self.query_items(
            "SELECT id, company_id, contact_id, conversation_id, sequence_id, current_step_id,
                    scheduled_at, status, reference_message_at
             FROM followup_queue WHERE company_id = ?1 AND contact_id = ?2
             ORDER BY created_at, rowid",
            params![company_id, contact_id],
        )
    }

    /// Transition a pending item. Items that already left `pending` are not
    /// touched; the return value says whether the row changed.
    pub fn mark_status(&self, item_id: &str, status: QueueStatus) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE followup_queue SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![status.as_str(), ts(Utc::now()), item_id],
            )
            .map_err(|e| NudgeError::storage("Mark queue item", e))?;
        Ok(changed > 0)
    }

    fn query_items(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<QueueItem>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| NudgeError::storage("Prepare queue query", e))?;
        stmt.query_map(params, item_from_row)
            .map_err(|e| NudgeError::storage("Load queue items", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| NudgeError::storage("Read queue item", e))
    }
}

fn tenant_mismatch(contact_id: &str, company_id: &str) -> NudgeError {
    NudgeError::TenantMismatch {
        contact_id: contact_id.to_string(),
        company_id: company_id.to_string(),
    }
}

/// Sequence row plus its raw filters column, decoded by [`with_filters`].
fn sequence_from_row(row: &Row<'_>) -> rusqlite::Result<(Sequence, String)> {
    let status: String = row.get(3)?;
    let sequence = Sequence {
        id: row.get(0)?,
        company_id: row.get(1)?,
        name: row.get(2)?,
        status: SequenceStatus::parse(&status),
        priority: row.get(4)?,
        filters: SequenceFilters::default(),
        steps: Vec::new(),
    };
    Ok((sequence, row.get(5)?))
}

/// Empty filter lists are wildcards, so an unreadable filters column must
/// never decode to the default.
fn with_filters(mut sequence: Sequence, raw: &str) -> Result<Sequence> {
    sequence.filters = serde_json::from_str::<SequenceFilters>(raw)?;
    Ok(sequence)
}

fn load_steps(conn: &Connection, sequence_id: &str) -> Result<Vec<Step>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, step_order, delay_value, delay_unit, content_ref, stop_if_replied, stop_if_opened
             FROM sequence_steps WHERE sequence_id = ?1 ORDER BY step_order",
        )
        .map_err(|e| NudgeError::storage("Prepare steps", e))?;
    stmt.query_map([sequence_id], |r| {
        Ok(Step {
            id: r.get(0)?,
            step_order: r.get(1)?,
            delay: StepDelay {
                value: r.get(2)?,
                unit: r.get(3)?,
            },
            content_ref: r.get(4)?,
            stop_if_replied: r.get::<_, i32>(5)? != 0,
            stop_if_opened: r.get::<_, i32>(6)? != 0,
        })
    })
    .map_err(|e| NudgeError::storage("Load steps", e))?
    .collect::<rusqlite::Result<Vec<_>>>()
    .map_err(|e| NudgeError::storage("Read step", e))
}

fn load_tags(conn: &Connection, contact_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT tag FROM contact_tags WHERE contact_id = ?1 ORDER BY tag")
        .map_err(|e| NudgeError::storage("Prepare tags", e))?;
    stmt.query_map([contact_id], |r| r.get::<_, String>(0))
        .map_err(|e| NudgeError::storage("Load tags", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| NudgeError::storage("Read tag", e))
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<ContactState> {
    let updated_at: String = row.get(5)?;
    Ok(ContactState {
        contact_id: row.get(0)?,
        company_id: row.get(1)?,
        active_sequence_id: row.get(2)?,
        current_step_order: row.get(3)?,
        opted_out: row.get::<_, i32>(4)? != 0,
        updated_at: parse_ts(5, &updated_at)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    let scheduled_at: String = row.get(6)?;
    let status: String = row.get(7)?;
    let reference: String = row.get(8)?;
    Ok(QueueItem {
        id: row.get(0)?,
        company_id: row.get(1)?,
        contact_id: row.get(2)?,
        conversation_id: row.get(3)?,
        sequence_id: row.get(4)?,
        current_step_id: row.get(5)?,
        scheduled_at: parse_ts(6, &scheduled_at)?,
        status: QueueStatus::parse(&status),
        reference_message_at: parse_ts(8, &reference)?,
    })
}
