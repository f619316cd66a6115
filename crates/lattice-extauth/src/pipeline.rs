//! Auth pipeline
//!
//! Runs a host's evaluators phase by phase over one request:
//!
//! 1. Identity - any one evaluator must succeed; the first success wins and
//!    the rest are cancelled
//! 2. Metadata - every evaluator runs; failures are skipped unless the entry
//!    is marked `fatal`
//! 3. Authorization - every evaluator must succeed; a failure cancels the
//!    entries listed after it
//! 4. Response - only on success; builds headers and dynamic metadata
//!
//! Evaluators within a phase run concurrently. When several fail, the one
//! listed first is the one reported.

use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::{debug, info, warn};

use crate::config::{EvaluatorConfig, HostConfiguration, Wrapper};
use crate::context::{AuthJson, Phase, RequestAttributes};
use crate::error::{EvaluatorError, Result};
use crate::evaluator::{stringify, Evaluator};
use crate::result::AuthResult;

const DEADLINE_MESSAGE: &str = "evaluation deadline exceeded";

/// One request's evaluation
pub struct AuthPipeline {
    config: Arc<HostConfiguration>,
    request: RequestAttributes,
    auth_json: AuthJson,
}

impl AuthPipeline {
    /// Bind a host configuration to a request
    pub fn new(config: Arc<HostConfiguration>, request: RequestAttributes) -> Result<Self> {
        let auth_json = AuthJson::new(&request)?;
        Ok(Self {
            config,
            request,
            auth_json,
        })
    }

    /// Build a pipeline around an already-populated context
    #[cfg(test)]
    pub(crate) fn from_parts(
        config: Arc<HostConfiguration>,
        request: RequestAttributes,
        auth_json: AuthJson,
    ) -> Self {
        Self {
            config,
            request,
            auth_json,
        }
    }

    /// Host configuration in effect
    pub fn config(&self) -> &HostConfiguration {
        &self.config
    }

    /// Request attributes
    pub fn request(&self) -> &RequestAttributes {
        &self.request
    }

    /// Evaluation context as of the running phase
    pub fn authorization_json(&self) -> &AuthJson {
        &self.auth_json
    }

    /// Run every phase and produce the verdict
    ///
    /// Never fails: every outcome, including an expired `cancel`, is an
    /// `AuthResult`.
    pub async fn evaluate(mut self, cancel: &CancellationToken) -> AuthResult {
        let config = self.config.clone();

        if let Err(result) = self.run_identity(&config.identity, cancel).await {
            return result;
        }
        if let Err(result) = self.run_metadata(&config.metadata, cancel).await {
            return result;
        }
        if let Err(result) = self.run_authorization(&config.authorization, cancel).await {
            return result;
        }
        match self.run_response(&config, cancel).await {
            Ok(result) | Err(result) => result,
        }
    }

    async fn run_identity(
        &mut self,
        entries: &[EvaluatorConfig],
        cancel: &CancellationToken,
    ) -> std::result::Result<(), AuthResult> {
        self.enter(Phase::Identity)?;

        let scope = cancel.child_token();
        let pipeline: &AuthPipeline = self;
        let phase_scope = &scope;
        let mut pending: FuturesUnordered<_> = entries
            .iter()
            .enumerate()
            .map(move |(index, entry)| async move {
                let result = call_guarded(entry.evaluator.as_ref(), pipeline, phase_scope).await;
                (index, result)
            })
            .collect();

        let mut accepted = None;
        let mut first_failure: Option<(usize, EvaluatorError)> = None;

        while let Some((index, result)) = pending.next().await {
            match result {
                Ok(value) => {
                    accepted = Some((index, value));
                    scope.cancel();
                    break;
                }
                Err(err) => {
                    debug!(evaluator = %entries[index].name, error = %err, "identity evaluator failed");
                    keep_lowest(&mut first_failure, index, err);
                }
            }
        }
        drop(pending);

        if let Some((index, value)) = accepted {
            debug!(evaluator = %entries[index].name, "identity accepted");
            self.auth_json.set_identity(value).map_err(internal_failure)?;
            return Ok(());
        }

        if cancel.is_cancelled() {
            return Err(deadline_exceeded(Phase::Identity));
        }

        let message = first_failure
            .map(|(_, err)| err.message)
            .unwrap_or_else(|| "no identity source configured".to_string());
        info!(config = %self.config.name, reason = %message, "request not authenticated");
        Err(AuthResult::deny(Code::Unauthenticated, message))
    }

    async fn run_metadata(
        &mut self,
        entries: &[EvaluatorConfig],
        cancel: &CancellationToken,
    ) -> std::result::Result<(), AuthResult> {
        self.enter(Phase::Metadata)?;

        let (values, failure) = self.run_all(entries, cancel, |entry| entry.fatal).await;

        if cancel.is_cancelled() {
            return Err(deadline_exceeded(Phase::Metadata));
        }
        if let Some((index, err)) = failure {
            warn!(evaluator = %entries[index].name, error = %err, "fatal metadata evaluator failed");
            return Err(denial(err, Code::PermissionDenied));
        }

        self.store(Phase::Metadata, entries, values)
    }

    async fn run_authorization(
        &mut self,
        entries: &[EvaluatorConfig],
        cancel: &CancellationToken,
    ) -> std::result::Result<(), AuthResult> {
        self.enter(Phase::Authorization)?;

        let (values, failure) = self.run_all(entries, cancel, |_| true).await;

        if cancel.is_cancelled() {
            return Err(deadline_exceeded(Phase::Authorization));
        }
        if let Some((index, err)) = failure {
            info!(
                config = %self.config.name,
                evaluator = %entries[index].name,
                reason = %err,
                "request not authorized"
            );
            return Err(denial(err, Code::PermissionDenied));
        }

        self.store(Phase::Authorization, entries, values)
    }

    async fn run_response(
        &mut self,
        config: &HostConfiguration,
        cancel: &CancellationToken,
    ) -> std::result::Result<AuthResult, AuthResult> {
        self.enter(Phase::Response)?;

        let results = {
            let pipeline = &*self;
            join_all(config.response.iter().map(|entry| {
                call_guarded(entry.evaluator.as_ref(), pipeline, cancel)
            }))
            .await
        };

        if cancel.is_cancelled() {
            return Err(deadline_exceeded(Phase::Response));
        }

        let mut result = AuthResult::allow();
        for (entry, outcome) in config.response.iter().zip(results) {
            let value = match outcome {
                Ok(value) => value,
                Err(err) => {
                    warn!(evaluator = %entry.name, error = %err, "response builder failed");
                    return Err(denial(err, Code::Internal));
                }
            };

            self.auth_json
                .insert(Phase::Response, &entry.name, value.clone())
                .map_err(internal_failure)?;

            match entry.wrapper {
                Wrapper::HttpHeader => result
                    .headers
                    .push((entry.wrapper_key.clone(), stringify(&value))),
                Wrapper::DynamicMetadata => {
                    result.metadata.insert(entry.wrapper_key.clone(), value);
                }
            }
        }

        Ok(result)
    }

    /// Run a phase's evaluators concurrently, each under its own child scope
    ///
    /// A failure for which `stops` holds cancels the entries listed after
    /// it. Returns each entry's value (if it produced one) and the earliest
    /// listed stopping failure.
    async fn run_all(
        &self,
        entries: &[EvaluatorConfig],
        cancel: &CancellationToken,
        stops: impl Fn(&EvaluatorConfig) -> bool,
    ) -> (Vec<Option<Value>>, Option<(usize, EvaluatorError)>) {
        let scopes: Vec<CancellationToken> = entries.iter().map(|_| cancel.child_token()).collect();

        let mut pending: FuturesUnordered<_> = entries
            .iter()
            .zip(&scopes)
            .enumerate()
            .map(move |(index, (entry, scope))| async move {
                (index, call_guarded(entry.evaluator.as_ref(), self, scope).await)
            })
            .collect();

        let mut values = vec![None; entries.len()];
        let mut failure: Option<(usize, EvaluatorError)> = None;

        while let Some((index, result)) = pending.next().await {
            match result {
                Ok(value) => values[index] = Some(value),
                Err(err) => {
                    if !stops(&entries[index]) {
                        warn!(evaluator = %entries[index].name, error = %err, "evaluator failed, skipping");
                        continue;
                    }
                    if failure.as_ref().is_some_and(|(current, _)| *current < index) {
                        continue;
                    }
                    for scope in &scopes[index + 1..] {
                        scope.cancel();
                    }
                    failure = Some((index, err));
                }
            }
        }

        (values, failure)
    }

    fn enter(&mut self, phase: Phase) -> std::result::Result<(), AuthResult> {
        self.auth_json.advance(phase).map_err(internal_failure)
    }

    fn store(
        &mut self,
        phase: Phase,
        entries: &[EvaluatorConfig],
        values: Vec<Option<Value>>,
    ) -> std::result::Result<(), AuthResult> {
        for (entry, value) in entries.iter().zip(values) {
            if let Some(value) = value {
                self.auth_json
                    .insert(phase, &entry.name, value)
                    .map_err(internal_failure)?;
            }
        }
        Ok(())
    }
}

/// Call an evaluator, giving up as soon as `scope` is cancelled
async fn call_guarded(
    evaluator: &dyn Evaluator,
    pipeline: &AuthPipeline,
    scope: &CancellationToken,
) -> std::result::Result<Value, EvaluatorError> {
    tokio::select! {
        biased;
        _ = scope.cancelled() => Err(EvaluatorError::cancelled()),
        result = evaluator.call(pipeline, scope) => result,
    }
}

fn keep_lowest(slot: &mut Option<(usize, EvaluatorError)>, index: usize, err: EvaluatorError) {
    if slot.as_ref().map_or(true, |(current, _)| index < *current) {
        *slot = Some((index, err));
    }
}

fn denial(err: EvaluatorError, default: Code) -> AuthResult {
    if let Some(detail) = &err.detail {
        debug!(reason = %err.message, detail = %detail, "evaluator failure detail");
    }
    AuthResult::deny(err.code.unwrap_or(default), err.message)
}

fn deadline_exceeded(phase: Phase) -> AuthResult {
    warn!(phase = %phase, "evaluation deadline exceeded");
    AuthResult::deny(Code::DeadlineExceeded, DEADLINE_MESSAGE)
}

fn internal_failure(err: crate::error::ExtAuthError) -> AuthResult {
    warn!(error = %err, "pipeline state error");
    AuthResult::deny(Code::Internal, "internal error")
}
