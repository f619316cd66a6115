//! Static identity evaluators: anonymous access and API keys

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::debug;

use super::Evaluator;
use crate::credentials::Credentials;
use crate::error::EvaluatorError;
use crate::pipeline::AuthPipeline;

/// Accepts every request with an empty identity
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

#[async_trait]
impl Evaluator for Anonymous {
    async fn call(
        &self,
        _pipeline: &AuthPipeline,
        _cancel: &CancellationToken,
    ) -> Result<Value, EvaluatorError> {
        Ok(json!({}))
    }
}

/// API key identity configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    /// Key name -> key value
    pub keys: BTreeMap<String, String>,
    /// Where the key is read from
    #[serde(default)]
    pub credentials: Credentials,
}

/// Authenticates requests carrying one of a fixed set of keys
#[derive(Debug)]
pub struct ApiKey {
    /// Key value -> key name
    by_value: BTreeMap<String, String>,
    credentials: Credentials,
}

impl ApiKey {
    /// Build from configuration
    pub fn new(config: ApiKeyConfig) -> Self {
        let by_value = config
            .keys
            .into_iter()
            .map(|(name, value)| (value, name))
            .collect();
        Self {
            by_value,
            credentials: config.credentials,
        }
    }
}

#[async_trait]
impl Evaluator for ApiKey {
    async fn call(
        &self,
        pipeline: &AuthPipeline,
        _cancel: &CancellationToken,
    ) -> Result<Value, EvaluatorError> {
        let key = self
            .credentials
            .extract(pipeline.request())
            .ok_or_else(|| EvaluatorError::with_code(Code::Unauthenticated, "credential not found"))?;

        match self.by_value.get(&key) {
            Some(name) => {
                debug!(key_name = %name, "API key accepted");
                Ok(json!({ "name": name }))
            }
            None => Err(EvaluatorError::with_code(
                Code::Unauthenticated,
                "the API key provided is invalid",
            )),
        }
    }
}
