//! JSON pattern-matching authorization

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::debug;

use super::{stringify, Evaluator};
use crate::error::{EvaluatorError, ExtAuthError, Result};
use crate::pipeline::AuthPipeline;
use crate::placeholder::PlaceholderEngine;

/// Comparison applied between the selected value and the rule value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// Selected value equals
    Eq,
    /// Selected value differs
    Neq,
    /// Selected array includes
    Incl,
    /// Selected array excludes
    Excl,
    /// Selected value matches a regular expression
    Matches,
}

/// One rule: `selector <operator> value`
#[derive(Debug, Clone, Deserialize)]
pub struct PatternRule {
    /// Path expression into the evaluation context, e.g. `auth.identity.groups`
    pub selector: String,
    /// Comparison
    pub operator: Operator,
    /// Expected value
    pub value: String,
}

/// Pattern-matching authorization configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PatternMatchingConfig {
    /// All rules must hold
    pub rules: Vec<PatternRule>,
}

struct CompiledRule {
    rule: PatternRule,
    regex: Option<Regex>,
}

impl CompiledRule {
    fn holds(&self, selected: &Value) -> bool {
        let expected = self.rule.value.as_str();
        match self.rule.operator {
            Operator::Eq => stringify(selected) == expected,
            Operator::Neq => stringify(selected) != expected,
            Operator::Incl => includes(selected, expected),
            Operator::Excl => !includes(selected, expected),
            Operator::Matches => self
                .regex
                .as_ref()
                .is_some_and(|re| re.is_match(&stringify(selected))),
        }
    }
}

fn includes(selected: &Value, expected: &str) -> bool {
    match selected {
        Value::Array(items) => items.iter().any(|item| stringify(item) == expected),
        _ => false,
    }
}

/// Authorizes when every rule holds against the evaluation context
pub struct PatternMatching {
    rules: Vec<CompiledRule>,
}

impl PatternMatching {
    /// Build from configuration, compiling `matches` expressions
    pub fn new(config: PatternMatchingConfig) -> Result<Self> {
        let rules = config
            .rules
            .into_iter()
            .map(|rule| {
                let regex = match rule.operator {
                    Operator::Matches => Some(Regex::new(&rule.value).map_err(|e| {
                        ExtAuthError::configuration(format!(
                            "invalid pattern for selector {}: {}",
                            rule.selector, e
                        ))
                    })?),
                    _ => None,
                };
                Ok(CompiledRule { rule, regex })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }
}

#[async_trait]
impl Evaluator for PatternMatching {
    async fn call(
        &self,
        pipeline: &AuthPipeline,
        cancel: &CancellationToken,
    ) -> std::result::Result<Value, EvaluatorError> {
        if cancel.is_cancelled() {
            return Err(EvaluatorError::cancelled());
        }

        let doc = pipeline.authorization_json().to_value();
        let engine = PlaceholderEngine::global();

        for compiled in &self.rules {
            let selected = engine.evaluate(&compiled.rule.selector, &doc)?;
            if !compiled.holds(&selected) {
                debug!(
                    selector = %compiled.rule.selector,
                    operator = ?compiled.rule.operator,
                    "pattern rule not satisfied"
                );
                return Err(EvaluatorError::with_code(Code::PermissionDenied, "Unauthorized"));
            }
        }

        Ok(json!(true))
    }
}
