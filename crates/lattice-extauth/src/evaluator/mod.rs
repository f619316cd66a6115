//! Evaluators
//!
//! An evaluator is one configured check: given the running pipeline and a
//! cancellation scope it produces a JSON value or fails. The pipeline decides
//! where the value lands in the evaluation context and what a failure means
//! for the phase.
//!
//! Variants:
//! - [`GenericHttp`] - external HTTP call (metadata)
//! - [`Anonymous`], [`ApiKey`], [`Oidc`] - identity
//! - [`PatternMatching`] - JSON pattern rules (authorization)
//! - [`DynamicJson`], [`Plain`] - response builders

mod api_key;
mod http;
mod oidc;
mod pattern;
mod response;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::EvaluatorError;
use crate::pipeline::AuthPipeline;

pub use api_key::{Anonymous, ApiKey, ApiKeyConfig};
pub use http::{decode_json_stream, GenericHttp, GenericHttpConfig};
pub use oidc::{Oidc, OidcConfig};
pub use pattern::{Operator, PatternMatching, PatternMatchingConfig, PatternRule};
pub use response::{DynamicJson, DynamicJsonConfig, Plain, PlainConfig};

/// A callable check producing a value or a failure
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Run the check against the pipeline's current evaluation context
    ///
    /// Implementations that block on I/O must stop waiting once `cancel`
    /// fires.
    async fn call(
        &self,
        pipeline: &AuthPipeline,
        cancel: &CancellationToken,
    ) -> Result<Value, EvaluatorError>;
}

/// A named template: `{ name, value }` where `value` may hold placeholders
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JsonProperty {
    /// Property name
    pub name: String,
    /// Value template
    pub value: Value,
}

/// Render a resolved value for use in text (headers, form fields)
///
/// Strings are used as-is; anything else is written as JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stringify() {
        assert_eq!(stringify(&json!("abc")), "abc");
        assert_eq!(stringify(&json!(42)), "42");
        assert_eq!(stringify(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(stringify(&Value::Null), "");
    }
}
