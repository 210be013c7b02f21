//! Rule evaluation engine.
//!
//! Stateless: given a normalized email and an owner's rule list, returns
//! the mutated email plus an applied-action log. The engine never persists;
//! persistence is the ingestion pipeline's responsibility after both this
//! engine and the auto-responder have run.

use tracing::debug;

use crate::model::{Email, Folder};
use crate::rules::{Clause, MatchType, Rule, RuleAction, RuleConditions, RuleField, RuleOperator};

/// One matched rule/action pair, for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedAction {
    pub rule_id: uuid::Uuid,
    pub rule_name: String,
    pub action: String,
}

/// Apply an owner's rules to an email.
///
/// Rules are filtered to active ones and sorted by `(priority, id)`
/// ascending. Matching rules mutate the email in order, immediately, so a
/// later rule observes an earlier rule's mutation and the last write wins.
pub fn apply(email: Email, rules: &[Rule]) -> (Email, Vec<AppliedAction>) {
    let mut ordered: Vec<&Rule> = rules.iter().filter(|r| r.is_active).collect();
    ordered.sort_by(|a, b| (a.priority, a.id).cmp(&(b.priority, b.id)));

    let mut email = email;
    let mut applied = Vec::new();

    for rule in ordered {
        if !evaluate(&email, &rule.conditions) {
            continue;
        }
        debug!(rule = %rule.name, email = %email.id, "Rule matched");
        for action in &rule.actions {
            apply_action(&mut email, action);
            applied.push(AppliedAction {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                action: action.label(),
            });
        }
    }

    (email, applied)
}

/// Evaluate a condition block against an email.
///
/// `All` is a logical AND, `Any` a logical OR. Zero clauses never match.
pub fn evaluate(email: &Email, conditions: &RuleConditions) -> bool {
    if conditions.clauses.is_empty() {
        return false;
    }
    match conditions.match_type {
        MatchType::All => conditions.clauses.iter().all(|c| clause_matches(email, c)),
        MatchType::Any => conditions.clauses.iter().any(|c| clause_matches(email, c)),
    }
}

fn clause_matches(email: &Email, clause: &Clause) -> bool {
    // Boolean field short-circuits: no text comparison.
    if clause.field == RuleField::HasAttachment {
        return !email.attachments.is_empty();
    }

    let field_value = field_text(email, clause.field);
    let compare = clause.value.to_lowercase();

    match clause.operator {
        RuleOperator::Contains => field_value.contains(&compare),
        RuleOperator::Equals => field_value == compare,
        RuleOperator::StartsWith => field_value.starts_with(&compare),
        RuleOperator::EndsWith => field_value.ends_with(&compare),
        RuleOperator::NotContains => !field_value.contains(&compare),
        RuleOperator::Exists => !field_value.is_empty(),
    }
}

/// Extract the named field as lowercase text.
fn field_text(email: &Email, field: RuleField) -> String {
    match field {
        RuleField::From => email.from.email.to_lowercase(),
        RuleField::To => email.joined_recipients().to_lowercase(),
        RuleField::Subject => email.subject.to_lowercase(),
        RuleField::Body => {
            if email.html_body.is_empty() {
                email.plain_body.to_lowercase()
            } else {
                email.html_body.to_lowercase()
            }
        }
        RuleField::HasAttachment => String::new(),
    }
}

fn apply_action(email: &mut Email, action: &RuleAction) {
    match action {
        RuleAction::MoveToFolder(folder) => email.folder = *folder,
        RuleAction::AddLabel(label) => email.add_label(label),
        RuleAction::MarkAsRead => email.is_read = true,
        RuleAction::MarkAsUnread => email.is_read = false,
        RuleAction::Star => email.is_starred = true,
        RuleAction::Delete => email.folder = Folder::Trash,
        RuleAction::Forward(to) => {
            // Extension point: logged in the action trail, not delivered.
            debug!(to = %to, email = %email.id, "Forward action recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::model::{Address, AttachmentRef};

    fn make_email(from: &str, subject: &str, html: &str) -> Email {
        let id = Uuid::new_v4();
        Email {
            id,
            message_id: format!("<{id}@test>"),
            from: Address::bare(from),
            to: vec![Address::bare("me@local.test")],
            cc: vec![],
            bcc: vec![],
            subject: subject.into(),
            html_body: html.into(),
            plain_body: String::new(),
            attachments: vec![],
            folder: Folder::Inbox,
            is_read: false,
            is_starred: false,
            labels: vec![],
            thread_id: id.to_string(),
            in_reply_to: None,
            references: vec![],
            owner_id: "user-1".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            smtp: None,
        }
    }

    fn make_rule(priority: i32, clauses: Vec<Clause>, actions: Vec<RuleAction>) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            owner_id: "user-1".into(),
            name: format!("rule-{priority}"),
            is_active: true,
            priority,
            conditions: RuleConditions {
                match_type: MatchType::All,
                clauses,
            },
            actions,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn from_contains(value: &str) -> Clause {
        Clause {
            field: RuleField::From,
            operator: RuleOperator::Contains,
            value: value.into(),
        }
    }

    #[test]
    fn matching_rule_moves_folder() {
        let email = make_email("news@newsletter.com", "Weekly digest", "<p>news</p>");
        let rule = make_rule(
            1,
            vec![from_contains("newsletter")],
            vec![RuleAction::MoveToFolder(Folder::Spam)],
        );

        let (mutated, applied) = apply(email, &[rule]);
        assert_eq!(mutated.folder, Folder::Spam);
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].action, "moveToFolder(spam)");
    }

    #[test]
    fn later_rule_overrides_earlier_folder() {
        let email = make_email("news@newsletter.com", "Hi", "");
        let first = make_rule(
            1,
            vec![from_contains("newsletter")],
            vec![RuleAction::MoveToFolder(Folder::Trash)],
        );
        let second = make_rule(
            2,
            vec![from_contains("newsletter")],
            vec![RuleAction::MoveToFolder(Folder::Spam)],
        );

        // Pass rules out of order; the engine sorts by priority.
        let (mutated, applied) = apply(email, &[second.clone(), first.clone()]);
        assert_eq!(mutated.folder, Folder::Spam);
        assert_eq!(applied[0].rule_id, first.id);
        assert_eq!(applied[1].rule_id, second.id);
    }

    #[test]
    fn inactive_rules_are_skipped() {
        let email = make_email("news@newsletter.com", "Hi", "");
        let mut rule = make_rule(
            1,
            vec![from_contains("newsletter")],
            vec![RuleAction::MoveToFolder(Folder::Spam)],
        );
        rule.is_active = false;

        let (mutated, applied) = apply(email, &[rule]);
        assert_eq!(mutated.folder, Folder::Inbox);
        assert!(applied.is_empty());
    }

    #[test]
    fn zero_clauses_never_match() {
        let email = make_email("anyone@example.com", "Hi", "");
        let rule = make_rule(1, vec![], vec![RuleAction::Star]);
        let (mutated, applied) = apply(email, &[rule]);
        assert!(!mutated.is_starred);
        assert!(applied.is_empty());
    }

    #[test]
    fn all_requires_every_clause() {
        let email = make_email("alice@work.com", "invoice attached", "");
        let rule = make_rule(
            1,
            vec![
                from_contains("work.com"),
                Clause {
                    field: RuleField::Subject,
                    operator: RuleOperator::Contains,
                    value: "receipt".into(),
                },
            ],
            vec![RuleAction::Star],
        );
        let (mutated, _) = apply(email, &[rule]);
        assert!(!mutated.is_starred);
    }

    #[test]
    fn any_requires_one_clause() {
        let email = make_email("alice@work.com", "invoice attached", "");
        let mut rule = make_rule(
            1,
            vec![
                from_contains("work.com"),
                Clause {
                    field: RuleField::Subject,
                    operator: RuleOperator::Contains,
                    value: "receipt".into(),
                },
            ],
            vec![RuleAction::Star],
        );
        rule.conditions.match_type = MatchType::Any;
        let (mutated, _) = apply(email, &[rule]);
        assert!(mutated.is_starred);
    }

    #[test]
    fn operators_are_case_insensitive() {
        let email = make_email("Alice@Example.COM", "Quarterly REPORT", "");
        let rule = make_rule(
            1,
            vec![Clause {
                field: RuleField::Subject,
                operator: RuleOperator::EndsWith,
                value: "report".into(),
            }],
            vec![RuleAction::MarkAsRead],
        );
        let (mutated, _) = apply(email, &[rule]);
        assert!(mutated.is_read);
    }

    #[test]
    fn not_contains_matches_absence() {
        let email = make_email("alice@example.com", "Plain update", "");
        let rule = make_rule(
            1,
            vec![Clause {
                field: RuleField::Subject,
                operator: RuleOperator::NotContains,
                value: "unsubscribe".into(),
            }],
            vec![RuleAction::Star],
        );
        let (mutated, _) = apply(email, &[rule]);
        assert!(mutated.is_starred);
    }

    #[test]
    fn has_attachment_short_circuits() {
        let mut email = make_email("alice@example.com", "Files", "");
        email.attachments.push(AttachmentRef {
            id: "a1".into(),
            filename: "report.pdf".into(),
            mime_type: "application/pdf".into(),
            size: 1024,
            url: "file:///blobs/a1".into(),
        });
        let rule = make_rule(
            1,
            vec![Clause {
                field: RuleField::HasAttachment,
                operator: RuleOperator::Exists,
                value: String::new(),
            }],
            vec![RuleAction::AddLabel("has-files".into())],
        );
        let (mutated, _) = apply(email, &[rule]);
        assert_eq!(mutated.labels, vec!["has-files".to_string()]);
    }

    #[test]
    fn body_falls_back_to_plain_text() {
        let mut email = make_email("alice@example.com", "Hi", "");
        email.plain_body = "the secret word".into();
        let rule = make_rule(
            1,
            vec![Clause {
                field: RuleField::Body,
                operator: RuleOperator::Contains,
                value: "secret".into(),
            }],
            vec![RuleAction::Star],
        );
        let (mutated, _) = apply(email, &[rule]);
        assert!(mutated.is_starred);
    }

    #[test]
    fn delete_action_moves_to_trash() {
        let email = make_email("spam@junk.com", "Buy now", "");
        let rule = make_rule(
            1,
            vec![from_contains("junk.com")],
            vec![RuleAction::Delete],
        );
        let (mutated, applied) = apply(email, &[rule]);
        assert_eq!(mutated.folder, Folder::Trash);
        assert_eq!(applied[0].action, "delete");
    }

    #[test]
    fn forward_is_logged_not_applied() {
        let email = make_email("alice@example.com", "Hi", "");
        let rule = make_rule(
            1,
            vec![from_contains("alice")],
            vec![RuleAction::Forward("archive@elsewhere.com".into())],
        );
        let (mutated, applied) = apply(email, &[rule]);
        assert_eq!(mutated.folder, Folder::Inbox);
        assert_eq!(applied[0].action, "forward(archive@elsewhere.com)");
    }

    #[test]
    fn mark_unread_overrides_mark_read() {
        let email = make_email("alice@example.com", "Hi", "");
        let first = make_rule(1, vec![from_contains("alice")], vec![RuleAction::MarkAsRead]);
        let second = make_rule(2, vec![from_contains("alice")], vec![RuleAction::MarkAsUnread]);
        let (mutated, _) = apply(email, &[first, second]);
        assert!(!mutated.is_read);
    }
}
