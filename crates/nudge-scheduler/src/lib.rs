//! # Nudge Scheduler
//!
//! Follow-up scheduling engine for a multi-tenant messaging CRM.
//! Decides which contacts enter an automated follow-up sequence, which
//! sequence, and when the first message is due.
//!
//! ## Design Principles
//! - Every read and write is scoped by company
//! - SQLite persistence, with "one pending item per contact and sequence"
//!   enforced by the schema itself
//! - Idempotent: re-triggering an enqueue never duplicates queue items
//! - Tokio timers only, zero overhead when idle
//!
//! ## Architecture
//! ```text
//! Trigger (HTTP / CLI)          Scan loop (tokio interval)
//!        │                               │
//!        └────────────► Enqueuer ◄───────┘
//!                         ├── CrmDirectory    (catalog, contacts, stale conversations)
//!                         ├── ContactStateStore (opt-out, active sequence)
//!                         ├── matcher          (priority-ordered filter match)
//!                         ├── delay            (step delay → scheduled_at)
//!                         └── FollowUpQueue    (pending items → dispatcher)
//! ```

pub mod delay;
pub mod directory;
pub mod engine;
pub mod enqueuer;
pub mod matcher;
pub mod persistence;
pub mod queue;
pub mod sequence;
pub mod state;

pub use directory::{ContactSnapshot, Conversation, CrmDirectory, SqliteDirectory};
pub use engine::spawn_scan_loop;
pub use enqueuer::{EnqueueOutcome, Enqueuer, EnqueuerSettings, ScanSummary, SkipReason};
pub use persistence::FollowUpDb;
pub use queue::{EnqueueResult, FollowUpQueue, QueueItem, QueueStatus};
pub use sequence::{Sequence, SequenceCatalog, SequenceFilters, SequenceStatus, Step};
pub use state::{ContactState, ContactStateStore};
