//! Sequence matcher — priority-ordered rule table.
//!
//! The first active sequence (priority desc, then catalog order) whose
//! filters all accept the contact wins. Specificity plays no part: a
//! higher-priority catch-all beats a lower-priority targeted sequence.

use serde::{Deserialize, Serialize};

use crate::sequence::{Sequence, SequenceFilters};

/// What the matcher knows about a contact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactAttributes {
    #[serde(default)]
    pub tags: Vec<String>,
    /// From the most recent conversation.
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub crm_stage_id: Option<String>,
}

/// Pick the best sequence for a contact of `company_id`.
pub fn select_sequence<'a>(
    catalog: &'a [Sequence],
    company_id: &str,
    contact: &ContactAttributes,
) -> Option<&'a Sequence> {
    let mut candidates: Vec<&Sequence> = catalog
        .iter()
        .filter(|s| s.is_active() && s.company_id == company_id)
        .collect();
    // Stable sort keeps catalog order among equal priorities.
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

    candidates
        .into_iter()
        .find(|s| filters_accept(&s.filters, contact))
}

/// Every dimension must be a wildcard or intersect the contact's attribute.
pub fn filters_accept(filters: &SequenceFilters, contact: &ContactAttributes) -> bool {
    accepts_one(&filters.connection_ids, contact.connection_id.as_deref())
        && accepts_one(&filters.crm_stage_ids, contact.crm_stage_id.as_deref())
        && (filters.tag_filters.is_empty()
            || filters.tag_filters.iter().any(|t| contact.tags.contains(t)))
}

fn accepts_one(allowed: &[String], actual: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match actual {
        Some(value) => allowed.iter().any(|a| a == value),
        None => false,
    }
}
