//! Response builders
//!
//! Produce the values the response phase hands to the proxy as headers or
//! dynamic metadata on success.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{Evaluator, JsonProperty};
use crate::error::EvaluatorError;
use crate::pipeline::AuthPipeline;

/// Templated JSON object configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DynamicJsonConfig {
    /// Object properties
    pub properties: Vec<JsonProperty>,
}

/// Builds a JSON object from templated properties
#[derive(Debug)]
pub struct DynamicJson {
    properties: Vec<JsonProperty>,
}

impl DynamicJson {
    pub fn new(config: DynamicJsonConfig) -> Self {
        Self {
            properties: config.properties,
        }
    }
}

#[async_trait]
impl Evaluator for DynamicJson {
    async fn call(
        &self,
        pipeline: &AuthPipeline,
        _cancel: &CancellationToken,
    ) -> Result<Value, EvaluatorError> {
        let auth_json = pipeline.authorization_json();
        let mut object = Map::with_capacity(self.properties.len());
        for property in &self.properties {
            object.insert(property.name.clone(), auth_json.resolve(&property.value)?);
        }
        Ok(Value::Object(object))
    }
}

/// Single templated value configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PlainConfig {
    /// Value template
    pub value: Value,
}

/// Resolves one templated value
#[derive(Debug)]
pub struct Plain {
    value: Value,
}

impl Plain {
    pub fn new(config: PlainConfig) -> Self {
        Self {
            value: config.value,
        }
    }
}

#[async_trait]
impl Evaluator for Plain {
    async fn call(
        &self,
        pipeline: &AuthPipeline,
        _cancel: &CancellationToken,
    ) -> Result<Value, EvaluatorError> {
        Ok(pipeline.authorization_json().resolve(&self.value)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::HostConfiguration;
    use crate::context::{AuthJson, HttpAttributes, Phase, RequestAttributes};

    fn pipeline() -> AuthPipeline {
        let request = RequestAttributes {
            http: HttpAttributes {
                method: "POST".to_string(),
                host: "talker-api".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut auth_json = AuthJson::new(&request).unwrap();
        auth_json.advance(Phase::Identity).unwrap();
        auth_json.set_identity(json!({"name": "friend-1"})).unwrap();
        auth_json.advance(Phase::Response).unwrap();
        AuthPipeline::from_parts(Arc::new(HostConfiguration::default()), request, auth_json)
    }

    #[tokio::test]
    async fn test_dynamic_json() {
        let evaluator = DynamicJson::new(DynamicJsonConfig {
            properties: vec![
                JsonProperty {
                    name: "user".to_string(),
                    value: json!("{{ auth.identity.name }}"),
                },
                JsonProperty {
                    name: "via".to_string(),
                    value: json!("{{ context.request.http.method }} {{ context.request.http.host }}"),
                },
                JsonProperty {
                    name: "static".to_string(),
                    value: json!(7),
                },
            ],
        });
        let value = evaluator
            .call(&pipeline(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            value,
            json!({"user": "friend-1", "via": "POST talker-api", "static": 7})
        );
    }

    #[tokio::test]
    async fn test_plain() {
        let evaluator = Plain::new(PlainConfig {
            value: json!("{{ auth.identity.name }}"),
        });
        let value = evaluator
            .call(&pipeline(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value, json!("friend-1"));
    }
}
