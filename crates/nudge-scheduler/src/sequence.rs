//! Sequence catalog — the data model for follow-up definitions.
//!
//! Sequences are authored by operators elsewhere; this crate only reads them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::delay::StepDelay;

/// Lifecycle status of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceStatus {
    Active,
    Paused,
    Archived,
}

impl SequenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SequenceStatus::Active => "active",
            SequenceStatus::Paused => "paused",
            SequenceStatus::Archived => "archived",
        }
    }

    /// Unknown statuses are treated as archived so they never match.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "active" => SequenceStatus::Active,
            "paused" => SequenceStatus::Paused,
            _ => SequenceStatus::Archived,
        }
    }
}

/// Matching filters. An empty list is a wildcard for that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFilters {
    #[serde(default)]
    pub connection_ids: Vec<String>,
    #[serde(default)]
    pub crm_stage_ids: Vec<String>,
    #[serde(default)]
    pub tag_filters: Vec<String>,
}

/// One step of a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    /// 1-based, unique within the sequence.
    pub step_order: u32,
    #[serde(default)]
    pub delay: StepDelay,
    /// Opaque reference to the message template.
    #[serde(default)]
    pub content_ref: Option<String>,
    /// Consumed by the dispatcher, not by the scheduler.
    #[serde(default)]
    pub stop_if_replied: bool,
    #[serde(default)]
    pub stop_if_opened: bool,
}

/// A follow-up sequence with its steps ordered by `step_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: String,
    pub company_id: String,
    pub name: String,
    pub status: SequenceStatus,
    /// Higher wins.
    pub priority: i32,
    #[serde(default)]
    pub filters: SequenceFilters,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Sequence {
    /// Create an active sequence without steps.
    pub fn new(id: &str, company_id: &str, name: &str, priority: i32) -> Self {
        Self {
            id: id.to_string(),
            company_id: company_id.to_string(),
            name: name.to_string(),
            status: SequenceStatus::Active,
            priority,
            filters: SequenceFilters::default(),
            steps: Vec::new(),
        }
    }

    pub fn with_filters(mut self, filters: SequenceFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Append a step; its order is the next free position.
    pub fn with_step(mut self, id: &str, delay: StepDelay) -> Self {
        let step_order = self.steps.iter().map(|s| s.step_order).max().unwrap_or(0) + 1;
        self.steps.push(Step {
            id: id.to_string(),
            step_order,
            delay,
            content_ref: None,
            stop_if_replied: true,
            stop_if_opened: false,
        });
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == SequenceStatus::Active
    }

    /// The step with `step_order == 1`, if authored.
    pub fn first_step(&self) -> Option<&Step> {
        self.step(1)
    }

    pub fn step(&self, order: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_order == order)
    }
}

/// Active sequences of every company, read once per scan.
///
/// Each company's list keeps the order in which the catalog returned it.
#[derive(Debug, Clone, Default)]
pub struct SequenceCatalog {
    by_company: HashMap<String, Vec<Sequence>>,
    company_order: Vec<String>,
}

impl SequenceCatalog {
    pub fn from_sequences(sequences: Vec<Sequence>) -> Self {
        let mut catalog = Self::default();
        for sequence in sequences.into_iter().filter(Sequence::is_active) {
            if !catalog.by_company.contains_key(&sequence.company_id) {
                catalog.company_order.push(sequence.company_id.clone());
            }
            catalog
                .by_company
                .entry(sequence.company_id.clone())
                .or_default()
                .push(sequence);
        }
        catalog
    }

    /// Companies with at least one active sequence, in first-seen order.
    pub fn companies(&self) -> impl Iterator<Item = &str> {
        self.company_order.iter().map(String::as_str)
    }

    pub fn for_company(&self, company_id: &str) -> &[Sequence] {
        self.by_company
            .get(company_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
