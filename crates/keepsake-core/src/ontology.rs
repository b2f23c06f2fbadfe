//! Memory type ontology and relationship vocabulary
//!
//! A closed, two-level taxonomy of memory types (base types with subtypes,
//! written as `base` or `base/subtype`) and the closed set of typed
//! relationships used by association edges.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

// ============================================================================
// TAXONOMY
// ============================================================================

/// Base types with their subtypes. The first entry of each tuple is the base
/// type; subtypes are written `base/subtype` in `Memory::memory_type`.
const TAXONOMY: &[(&str, &[&str])] = &[
    // Software development
    (
        "observation",
        &[
            "code_edit",
            "file_access",
            "search",
            "command",
            "conversation",
            "document",
            "note",
            "reference",
        ],
    ),
    (
        "decision",
        &["architecture", "tool_choice", "approach", "configuration"],
    ),
    (
        "learning",
        &["insight", "best_practice", "anti_pattern", "gotcha"],
    ),
    ("error", &["bug", "failure", "exception", "timeout"]),
    (
        "pattern",
        &["recurring_issue", "code_smell", "design_pattern", "workflow"],
    ),
    // Project management
    (
        "planning",
        &[
            "sprint_goal",
            "backlog_item",
            "story_point_estimate",
            "velocity",
            "retrospective",
            "standup_note",
            "acceptance_criteria",
        ],
    ),
    (
        "ceremony",
        &[
            "sprint_review",
            "sprint_planning",
            "daily_standup",
            "retrospective_action",
            "demo_feedback",
        ],
    ),
    (
        "milestone",
        &[
            "deliverable",
            "dependency",
            "risk",
            "constraint",
            "assumption",
            "deadline",
        ],
    ),
    (
        "stakeholder",
        &[
            "requirement",
            "feedback",
            "escalation",
            "approval",
            "change_request",
            "status_update",
        ],
    ),
    // General knowledge work
    (
        "meeting",
        &[
            "action_item",
            "attendee_note",
            "agenda_item",
            "follow_up",
            "minutes",
        ],
    ),
    (
        "research",
        &[
            "finding",
            "comparison",
            "recommendation",
            "source",
            "hypothesis",
        ],
    ),
    (
        "communication",
        &[
            "email_summary",
            "chat_summary",
            "announcement",
            "request",
            "response",
        ],
    ),
];

fn parent_map() -> &'static BTreeMap<&'static str, &'static str> {
    static MAP: OnceLock<BTreeMap<&'static str, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| {
        let mut map = BTreeMap::new();
        for (base, subtypes) in TAXONOMY {
            map.insert(*base, *base);
            for sub in *subtypes {
                map.insert(*sub, *base);
            }
        }
        map
    })
}

/// Whether a memory type is in the ontology.
///
/// Accepts base types, bare subtypes, and the `base/subtype` compound form
/// (which must name a real base and one of its subtypes).
pub fn validate_memory_type(memory_type: &str) -> bool {
    if let Some((base, sub)) = memory_type.split_once('/') {
        return TAXONOMY
            .iter()
            .any(|(b, subs)| *b == base && subs.contains(&sub));
    }
    parent_map().contains_key(memory_type)
}

/// Parent base type for a subtype; a base type maps to itself.
/// Returns `None` for types outside the ontology.
pub fn parent_type(memory_type: &str) -> Option<&'static str> {
    if let Some((base, sub)) = memory_type.split_once('/') {
        return TAXONOMY
            .iter()
            .find(|(b, subs)| *b == base && subs.contains(&sub))
            .map(|(b, _)| *b);
    }
    parent_map().get(memory_type).copied()
}

/// Flattened list of all valid types (base + subtypes)
pub fn all_types() -> Vec<&'static str> {
    let mut out = Vec::new();
    for (base, subtypes) in TAXONOMY {
        out.push(*base);
        out.extend_from_slice(subtypes);
    }
    out
}

// ============================================================================
// RELATIONSHIPS
// ============================================================================

/// Typed relationship between two memories.
///
/// Symmetric variants (`Related`, `Contradicts`) are logically undirected;
/// the rest carry source-to-target direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipType {
    /// A causes B
    Causes,
    /// A fixes B
    Fixes,
    /// A contradicts B (undirected)
    Contradicts,
    /// A supports B
    Supports,
    /// A follows B in time
    Follows,
    /// Generic association (undirected)
    Related,
}

impl RelationshipType {
    /// All relationship types
    pub const ALL: [RelationshipType; 6] = [
        RelationshipType::Causes,
        RelationshipType::Fixes,
        RelationshipType::Contradicts,
        RelationshipType::Supports,
        RelationshipType::Follows,
        RelationshipType::Related,
    ];

    /// String form used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Causes => "causes",
            RelationshipType::Fixes => "fixes",
            RelationshipType::Contradicts => "contradicts",
            RelationshipType::Supports => "supports",
            RelationshipType::Follows => "follows",
            RelationshipType::Related => "related",
        }
    }

    /// Parse a relationship name, rejecting anything outside the vocabulary
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "causes" => Some(RelationshipType::Causes),
            "fixes" => Some(RelationshipType::Fixes),
            "contradicts" => Some(RelationshipType::Contradicts),
            "supports" => Some(RelationshipType::Supports),
            "follows" => Some(RelationshipType::Follows),
            "related" => Some(RelationshipType::Related),
            _ => None,
        }
    }

    /// Whether the relationship reads the same in both directions
    pub fn is_symmetric(&self) -> bool {
        matches!(
            self,
            RelationshipType::Related | RelationshipType::Contradicts
        )
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// TESTS
// ============================================================================
