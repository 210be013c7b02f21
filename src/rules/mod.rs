//! User-defined mail rules: model and evaluation engine.

pub mod engine;

pub use engine::{AppliedAction, apply};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::model::Folder;

/// How clause results combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    All,
    Any,
}

/// The closed set of matchable fields.
///
/// A closed enum rather than a free-form field name: a rule referencing an
/// unsupported field fails deserialization at save time instead of silently
/// never matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleField {
    From,
    To,
    Subject,
    Body,
    HasAttachment,
}

/// Clause comparison operators. String comparisons are case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleOperator {
    Contains,
    Equals,
    StartsWith,
    EndsWith,
    NotContains,
    Exists,
}

impl RuleOperator {
    /// Whether this operator compares against a clause value.
    pub fn takes_value(&self) -> bool {
        !matches!(self, Self::Exists)
    }
}

/// A single field/operator/value condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    pub field: RuleField,
    pub operator: RuleOperator,
    #[serde(default)]
    pub value: String,
}

/// A rule's condition block: clauses plus the combinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConditions {
    pub match_type: MatchType,
    #[serde(default)]
    pub clauses: Vec<Clause>,
}

/// An action applied to a matching email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum RuleAction {
    MoveToFolder(Folder),
    AddLabel(String),
    MarkAsRead,
    MarkAsUnread,
    Star,
    /// Equivalent to `MoveToFolder(Trash)`.
    Delete,
    /// Logged extension point; not wired to delivery.
    Forward(String),
}

impl RuleAction {
    /// Short label for the applied-action log.
    pub fn label(&self) -> String {
        match self {
            Self::MoveToFolder(folder) => format!("moveToFolder({folder})"),
            Self::AddLabel(label) => format!("addLabel({label})"),
            Self::MarkAsRead => "markAsRead".into(),
            Self::MarkAsUnread => "markAsUnread".into(),
            Self::Star => "star".into(),
            Self::Delete => "delete".into(),
            Self::Forward(to) => format!("forward({to})"),
        }
    }
}

/// A user-defined mail rule.
///
/// Rules for one owner are totally ordered by `(priority, id)`, ascending;
/// evaluation is deterministic. Later rules observe and override earlier
/// rules' mutations (last write wins per field).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub is_active: bool,
    pub priority: i32,
    pub conditions: RuleConditions,
    pub actions: Vec<RuleAction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Validate a rule before saving. Runs at save time so a malformed rule
    /// is rejected synchronously instead of silently never matching.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField("name".into()));
        }
        for clause in &self.conditions.clauses {
            if clause.operator.takes_value()
                && clause.field != RuleField::HasAttachment
                && clause.value.is_empty()
            {
                return Err(ValidationError::InvalidRule {
                    name: self.name.clone(),
                    message: format!(
                        "clause on {:?} with operator {:?} requires a value",
                        clause.field, clause.operator
                    ),
                });
            }
        }
        for action in &self.actions {
            match action {
                RuleAction::AddLabel(label) if label.trim().is_empty() => {
                    return Err(ValidationError::InvalidRule {
                        name: self.name.clone(),
                        message: "addLabel requires a non-empty label".into(),
                    });
                }
                RuleAction::Forward(to) if !to.contains('@') => {
                    return Err(ValidationError::InvalidRule {
                        name: self.name.clone(),
                        message: format!("forward target {to} is not an address"),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}
