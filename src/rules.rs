//! Priority-ordered rule enforcement.
//!
//! Rules carry typed conditions over the `(context, score)` namespace
//! and terminal actions. Evaluation short-circuits on the first match
//! in priority order (ties broken by rule id), defaults to deny, and
//! fails closed. Unknown fields resolve to missing and make their
//! condition false instead of raising.

use crate::canonical::{self, canonicalize_str};
use crate::context::{AccessRequest, VerificationReport};
use crate::hasher::{Hash, Hasher};
use crate::trust::TrustScore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("duplicate rule id: {0}")]
    DuplicateId(String),

    #[error("rule not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, RuleError>;

/// Typed condition/field values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
}

impl Value {
    /// Lift a JSON value into the condition domain. Nulls and objects
    /// have no typed counterpart and resolve to missing.
    pub fn from_json(value: &serde_json::Value) -> Option<Value> {
        match value {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number),
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            serde_json::Value::Array(items) => Some(Value::List(
                items.iter().filter_map(Value::from_json).collect(),
            )),
            serde_json::Value::Null | serde_json::Value::Object(_) => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Structural equality; strings compare in canonical form.
    fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => {
                canonicalize_str(a) == canonicalize_str(b)
            }
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (a, b) => a == b,
        }
    }
}

/// Condition operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    NotContains,
}

/// Typed predicate over one field of the namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field_path: String,
    pub operator: Operator,
    pub literal: Value,
}

/// Terminal decision kinds, ordered by strictness
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Allow,
    Monitor,
    Challenge,
    Escalate,
    Deny,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionKind::Allow => "allow",
            ActionKind::Monitor => "monitor",
            ActionKind::Challenge => "challenge",
            ActionKind::Escalate => "escalate",
            ActionKind::Deny => "deny",
        };
        write!(f, "{name}")
    }
}

/// Action attached to a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// One enforcement rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

fn default_enabled() -> bool {
    true
}

/// Rules with unique ids, kept sorted by priority descending then id.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        let mut set = RuleSet { rules: Vec::new() };
        for rule in rules {
            set.insert(rule)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, rule: Rule) -> Result<()> {
        if self.rules.iter().any(|r| r.id == rule.id) {
            return Err(RuleError::DuplicateId(rule.id));
        }
        self.rules.push(rule);
        self.rules
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(())
    }

    pub fn remove(&mut self, rule_id: &str) -> Result<Rule> {
        let index = self
            .rules
            .iter()
            .position(|r| r.id == rule_id)
            .ok_or_else(|| RuleError::NotFound(rule_id.to_string()))?;
        Ok(self.rules.remove(index))
    }

    pub fn get(&self, rule_id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Outcome of rule enforcement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub kind: ActionKind,
    pub rule_id: String,
    pub reason: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub evaluated_at: DateTime<Utc>,
}

impl RuleOutcome {
    pub fn digest(&self, hasher: &Hasher) -> Hash {
        let bytes = canonical::canonical_bytes(self).unwrap_or_default();
        hasher.digest(&bytes)
    }
}

/// Evaluates rules against a request, score and report.
pub struct RuleEngine {
    rules: RuleSet,
}

impl RuleEngine {
    pub fn new(rules: RuleSet) -> Self {
        RuleEngine { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Evaluate rules in priority order; the first enabled rule whose
    /// conditions all hold wins with its first action. No match means
    /// deny.
    pub fn enforce(
        &self,
        request: &AccessRequest,
        score: &TrustScore,
        _report: &VerificationReport,
    ) -> RuleOutcome {
        for rule in self.rules.iter() {
            if !rule.enabled {
                continue;
            }
            let matched = rule
                .conditions
                .iter()
                .all(|condition| evaluate_condition(condition, request, score));
            if !matched {
                continue;
            }

            // First action wins; a rule without actions falls through.
            if let Some(action) = rule.actions.first() {
                let reason = action
                    .parameters
                    .get("reason")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("matched rule")
                    .to_string();
                info!(rule_id = %rule.id, decision = %action.kind, "rule matched");
                return RuleOutcome {
                    kind: action.kind,
                    rule_id: rule.id.clone(),
                    reason,
                    parameters: action.parameters.clone(),
                    evaluated_at: Utc::now(),
                };
            }
            debug!(rule_id = %rule.id, "rule matched but has no actions");
        }

        RuleOutcome {
            kind: ActionKind::Deny,
            rule_id: "default".to_string(),
            reason: "no matching rules found".to_string(),
            parameters: BTreeMap::new(),
            evaluated_at: Utc::now(),
        }
    }
}

/// Resolve a field path in the `(context, score)` namespace. Unknown
/// paths yield `None` (missing).
fn resolve_field(field_path: &str, request: &AccessRequest, score: &TrustScore) -> Option<Value> {
    match field_path {
        "trust_score" => return Some(Value::Number(score.value)),
        "user_id" => return Some(Value::String(canonicalize_str(&request.principal))),
        "resource_path" => return Some(Value::String(canonicalize_str(&request.resource))),
        "action" => return Some(Value::String(canonicalize_str(&request.action))),
        _ => {}
    }

    if let Some(key) = field_path.strip_prefix("context.") {
        return request.context_data.get(key).and_then(Value::from_json);
    }
    if let Some(key) = field_path.strip_prefix("metadata.") {
        return request.metadata.get(key).and_then(Value::from_json);
    }
    None
}

fn evaluate_condition(
    condition: &Condition,
    request: &AccessRequest,
    score: &TrustScore,
) -> bool {
    let Some(field_value) = resolve_field(&condition.field_path, request, score) else {
        return false;
    };
    apply_operator(&field_value, condition.operator, &condition.literal)
}

fn apply_operator(field_value: &Value, operator: Operator, literal: &Value) -> bool {
    match operator {
        Operator::Eq => field_value.equals(literal),
        Operator::Ne => !field_value.equals(literal),
        Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => {
            // Numeric comparisons require both operands numeric.
            let (Some(a), Some(b)) = (field_value.as_number(), literal.as_number()) else {
                return false;
            };
            match operator {
                Operator::Lt => a < b,
                Operator::Le => a <= b,
                Operator::Gt => a > b,
                Operator::Ge => a >= b,
                _ => unreachable!(),
            }
        }
        Operator::Contains => contains(field_value, literal).unwrap_or(false),
        Operator::NotContains => contains(field_value, literal).map(|c| !c).unwrap_or(false),
    }
}

/// `contains` on strings is substring, on lists membership; any other
/// pairing has no defined containment.
fn contains(field_value: &Value, literal: &Value) -> Option<bool> {
    match (field_value, literal) {
        (Value::String(haystack), Value::String(needle)) => {
            Some(canonicalize_str(haystack).contains(&canonicalize_str(needle)))
        }
        (Value::List(items), needle) => Some(items.iter().any(|item| item.equals(needle))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextComponent;
    use crate::trust::{TrustFactors, TrustLevel};
    use serde_json::json;
    use std::collections::BTreeMap as Map;

    fn request() -> AccessRequest {
        AccessRequest::new("alice", "/sensitive/reports", "read")
            .with_context("risk_level", json!("medium"))
            .with_context("department", json!("engineering"))
            .with_metadata("channels", json!(["web", "mobile"]))
    }

    fn score(value: f64) -> TrustScore {
        TrustScore {
            value,
            level: TrustLevel::Medium,
            factors: TrustFactors::default(),
            explanation: String::new(),
            computed_at: Utc::now(),
            error: None,
        }
    }

    fn report() -> VerificationReport {
        VerificationReport {
            request_id: "req-test".to_string(),
            per_component: Map::new(),
            verified: true,
            aggregate_confidence: 0.8,
            completed_at: Utc::now(),
            artifacts: Vec::new(),
        }
    }

    fn rule(id: &str, priority: i64, conditions: Vec<Condition>, kind: ActionKind) -> Rule {
        Rule {
            id: id.to_string(),
            priority,
            enabled: true,
            conditions,
            actions: vec![Action {
                kind,
                parameters: BTreeMap::new(),
            }],
        }
    }

    fn cond(field: &str, operator: Operator, literal: Value) -> Condition {
        Condition {
            field_path: field.to_string(),
            operator,
            literal,
        }
    }

    #[test]
    fn test_no_rules_denies() {
        let engine = RuleEngine::new(RuleSet::default());
        let outcome = engine.enforce(&request(), &score(0.9), &report());
        assert_eq!(outcome.kind, ActionKind::Deny);
        assert_eq!(outcome.rule_id, "default");
    }

    #[test]
    fn test_low_trust_denied_by_rule() {
        let rules = RuleSet::new(vec![rule(
            "R1",
            10,
            vec![cond("trust_score", Operator::Lt, Value::Number(0.5))],
            ActionKind::Deny,
        )])
        .unwrap();
        let engine = RuleEngine::new(rules);

        let outcome = engine.enforce(&request(), &score(0.3), &report());
        assert_eq!(outcome.kind, ActionKind::Deny);
        assert_eq!(outcome.rule_id, "R1");
    }

    #[test]
    fn test_priority_order_wins() {
        let rules = RuleSet::new(vec![
            rule(
                "allow_low_priority",
                1,
                vec![cond("trust_score", Operator::Ge, Value::Number(0.0))],
                ActionKind::Allow,
            ),
            rule(
                "challenge_high_priority",
                10,
                vec![cond("trust_score", Operator::Ge, Value::Number(0.0))],
                ActionKind::Challenge,
            ),
        ])
        .unwrap();
        let engine = RuleEngine::new(rules);

        let outcome = engine.enforce(&request(), &score(0.6), &report());
        assert_eq!(outcome.rule_id, "challenge_high_priority");
        assert_eq!(outcome.kind, ActionKind::Challenge);
    }

    #[test]
    fn test_equal_priority_ties_break_by_id() {
        let rules = RuleSet::new(vec![
            rule(
                "b_rule",
                5,
                vec![cond("trust_score", Operator::Ge, Value::Number(0.0))],
                ActionKind::Monitor,
            ),
            rule(
                "a_rule",
                5,
                vec![cond("trust_score", Operator::Ge, Value::Number(0.0))],
                ActionKind::Allow,
            ),
        ])
        .unwrap();
        let engine = RuleEngine::new(rules);

        let outcome = engine.enforce(&request(), &score(0.6), &report());
        assert_eq!(outcome.rule_id, "a_rule");
    }

    #[test]
    fn test_unknown_field_is_false_not_error() {
        let rules = RuleSet::new(vec![rule(
            "ghost",
            10,
            vec![cond("nonexistent_field", Operator::Eq, Value::Bool(true))],
            ActionKind::Allow,
        )])
        .unwrap();
        let engine = RuleEngine::new(rules);

        let outcome = engine.enforce(&request(), &score(0.9), &report());
        assert_eq!(outcome.rule_id, "default");
        assert_eq!(outcome.kind, ActionKind::Deny);
    }

    #[test]
    fn test_numeric_type_mismatch_is_false() {
        let rules = RuleSet::new(vec![rule(
            "typed",
            10,
            vec![cond("user_id", Operator::Gt, Value::Number(1.0))],
            ActionKind::Allow,
        )])
        .unwrap();
        let engine = RuleEngine::new(rules);
        let outcome = engine.enforce(&request(), &score(0.9), &report());
        assert_eq!(outcome.rule_id, "default");
    }

    #[test]
    fn test_contains_on_string_and_list() {
        let rules = RuleSet::new(vec![
        rule(
            "sensitive",
            20,
            vec![cond(
                "resource_path",
                Operator::Contains,
                Value::String("/sensitive/".to_string()),
            )],
            ActionKind::Challenge,
        )])
        .unwrap();
        let engine = RuleEngine::new(rules);
        let outcome = engine.enforce(&request(), &score(0.9), &report());
        assert_eq!(outcome.kind, ActionKind::Challenge);

        let rules = RuleSet::new(vec![rule(
            "channel",
            20,
            vec![cond(
                "metadata.channels",
                Operator::Contains,
                Value::String("mobile".to_string()),
            )],
            ActionKind::Monitor,
        )])
        .unwrap();
        let engine = RuleEngine::new(rules);
        let outcome = engine.enforce(&request(), &score(0.9), &report());
        assert_eq!(outcome.kind, ActionKind::Monitor);
    }

    #[test]
    fn test_not_contains_requires_valid_types() {
        // not_contains on a number is undefined containment, so false.
        let rules = RuleSet::new(vec![rule(
            "bad_types",
            10,
            vec![cond(
                "trust_score",
                Operator::NotContains,
                Value::String("x".to_string()),
            )],
            ActionKind::Allow,
        )])
        .unwrap();
        let engine = RuleEngine::new(rules);
        assert_eq!(
            engine.enforce(&request(), &score(0.9), &report()).rule_id,
            "default"
        );
    }

    #[test]
    fn test_context_dot_path() {
        let rules = RuleSet::new(vec![rule(
            "dept",
            10,
            vec![cond(
                "context.department",
                Operator::Eq,
                Value::String("engineering".to_string()),
            )],
            ActionKind::Allow,
        )])
        .unwrap();
        let engine = RuleEngine::new(rules);
        assert_eq!(
            engine.enforce(&request(), &score(0.9), &report()).kind,
            ActionKind::Allow
        );
    }

    #[test]
    fn test_string_matching_is_canonical() {
        // NFC-decomposed resource path still matches the composed literal
        let request = AccessRequest::new("alice", "  /cafe\u{301}/menu ", "read");
        let rules = RuleSet::new(vec![rule(
            "unicode",
            10,
            vec![cond(
                "resource_path",
                Operator::Eq,
                Value::String("/caf\u{e9}/menu".to_string()),
            )],
            ActionKind::Allow,
        )])
        .unwrap();
        let engine = RuleEngine::new(rules);
        assert_eq!(
            engine.enforce(&request, &score(0.9), &report()).kind,
            ActionKind::Allow
        );
    }

    #[test]
    fn test_disabled_rule_skipped() {
        let mut deny_rule = rule(
            "disabled",
            10,
            vec![cond("trust_score", Operator::Ge, Value::Number(0.0))],
            ActionKind::Allow,
        );
        deny_rule.enabled = false;
        let engine = RuleEngine::new(RuleSet::new(vec![deny_rule]).unwrap());
        assert_eq!(
            engine.enforce(&request(), &score(0.9), &report()).rule_id,
            "default"
        );
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = RuleSet::new(vec![
            rule("dup", 1, vec![], ActionKind::Allow),
            rule("dup", 2, vec![], ActionKind::Deny),
        ]);
        assert!(matches!(result, Err(RuleError::DuplicateId(_))));
    }

    #[test]
    fn test_rule_without_actions_falls_through() {
        let no_action = Rule {
            id: "empty".to_string(),
            priority: 100,
            enabled: true,
            conditions: vec![],
            actions: vec![],
        };
        let fallback = rule(
            "fallback",
            1,
            vec![cond("trust_score", Operator::Ge, Value::Number(0.0))],
            ActionKind::Allow,
        );
        let engine = RuleEngine::new(RuleSet::new(vec![no_action, fallback]).unwrap());
        assert_eq!(
            engine.enforce(&request(), &score(0.9), &report()).rule_id,
            "fallback"
        );
    }

    #[test]
    fn test_rule_serde_roundtrip() {
        let json = r#"{
            "id": "high_trust_access",
            "priority": 10,
            "conditions": [
                {"field_path": "trust_score", "operator": "gt", "literal": 0.8}
            ],
            "actions": [
                {"kind": "allow", "parameters": {"reason": "High trust user"}}
            ]
        }"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.conditions[0].literal, Value::Number(0.8));
        assert_eq!(rule.actions[0].kind, ActionKind::Allow);

        let back = serde_json::to_string(&rule).unwrap();
        let reparsed: Rule = serde_json::from_str(&back).unwrap();
        assert_eq!(reparsed, rule);
    }
}
