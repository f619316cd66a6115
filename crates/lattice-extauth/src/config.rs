//! Host configuration
//!
//! `AuthConfig` is the authored form read from the configuration file.
//! `HostConfiguration` is the built form the pipeline runs: every evaluator
//! constructed and checked against the phase it is listed under.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::context::Phase;
use crate::error::{ExtAuthError, Result};
use crate::evaluator::{
    Anonymous, ApiKey, ApiKeyConfig, DynamicJson, DynamicJsonConfig, Evaluator, GenericHttp,
    GenericHttpConfig, Oidc, OidcConfig, PatternMatching, PatternMatchingConfig, Plain,
    PlainConfig,
};

/// Authored configuration for a set of hosts
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Unique configuration name
    pub name: String,
    /// Hosts served by this configuration
    pub hosts: Vec<String>,
    /// Identity evaluators (any one must succeed)
    #[serde(default)]
    pub identity: Vec<EvaluatorSpec>,
    /// Metadata evaluators (best-effort unless `fatal`)
    #[serde(default)]
    pub metadata: Vec<EvaluatorSpec>,
    /// Authorization evaluators (all must succeed)
    #[serde(default)]
    pub authorization: Vec<EvaluatorSpec>,
    /// Response builders
    #[serde(default)]
    pub response: Vec<ResponseSpec>,
}

/// One evaluator entry
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatorSpec {
    /// Name the result is stored under
    pub name: String,
    /// A failure denies the request (metadata only)
    #[serde(default)]
    pub fatal: bool,
    /// Evaluator kind and its settings
    #[serde(flatten)]
    pub kind: EvaluatorKind,
}

/// One response entry
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseSpec {
    /// Name the result is stored under
    pub name: String,
    /// Where the value is delivered
    #[serde(default)]
    pub wrapper: Wrapper,
    /// Header name or metadata key; defaults to `name`
    #[serde(default)]
    pub wrapper_key: Option<String>,
    /// Builder kind and its settings
    #[serde(flatten)]
    pub kind: EvaluatorKind,
}

/// Evaluator kinds, tagged by `type`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvaluatorKind {
    Anonymous,
    ApiKey(ApiKeyConfig),
    Oidc(OidcConfig),
    Http(GenericHttpConfig),
    PatternMatching(PatternMatchingConfig),
    Json(DynamicJsonConfig),
    Plain(PlainConfig),
}

impl EvaluatorKind {
    /// Config name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluatorKind::Anonymous => "anonymous",
            EvaluatorKind::ApiKey(_) => "api_key",
            EvaluatorKind::Oidc(_) => "oidc",
            EvaluatorKind::Http(_) => "http",
            EvaluatorKind::PatternMatching(_) => "pattern_matching",
            EvaluatorKind::Json(_) => "json",
            EvaluatorKind::Plain(_) => "plain",
        }
    }

    /// Whether this kind may be listed under `phase`
    pub fn allowed_in(&self, phase: Phase) -> bool {
        matches!(
            (self, phase),
            (
                EvaluatorKind::Anonymous | EvaluatorKind::ApiKey(_) | EvaluatorKind::Oidc(_),
                Phase::Identity
            ) | (EvaluatorKind::Http(_), Phase::Metadata)
                | (EvaluatorKind::PatternMatching(_), Phase::Authorization)
                | (EvaluatorKind::Json(_) | EvaluatorKind::Plain(_), Phase::Response)
        )
    }

    /// Construct the evaluator
    pub fn build(&self, client: &reqwest::Client) -> Result<Arc<dyn Evaluator>> {
        let evaluator: Arc<dyn Evaluator> = match self {
            EvaluatorKind::Anonymous => Arc::new(Anonymous),
            EvaluatorKind::ApiKey(config) => Arc::new(ApiKey::new(config.clone())),
            EvaluatorKind::Oidc(config) => Arc::new(Oidc::new(config.clone(), client.clone())),
            EvaluatorKind::Http(config) => {
                Arc::new(GenericHttp::new(config.clone(), client.clone())?)
            }
            EvaluatorKind::PatternMatching(config) => {
                Arc::new(PatternMatching::new(config.clone())?)
            }
            EvaluatorKind::Json(config) => Arc::new(DynamicJson::new(config.clone())),
            EvaluatorKind::Plain(config) => Arc::new(Plain::new(config.clone())),
        };
        Ok(evaluator)
    }
}

/// Delivery channel of a response value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wrapper {
    /// Added as a header on the upstream request
    #[default]
    HttpHeader,
    /// Emitted as proxy dynamic metadata
    DynamicMetadata,
}

/// A built evaluator with its phase settings
#[derive(Clone)]
pub struct EvaluatorConfig {
    /// Name the result is stored under
    pub name: String,
    /// The evaluator
    pub evaluator: Arc<dyn Evaluator>,
    /// A failure denies the request (metadata only)
    pub fatal: bool,
}

impl fmt::Debug for EvaluatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluatorConfig")
            .field("name", &self.name)
            .field("fatal", &self.fatal)
            .finish_non_exhaustive()
    }
}

/// A built response builder
#[derive(Clone)]
pub struct ResponseConfig {
    /// Name the result is stored under
    pub name: String,
    /// Delivery channel
    pub wrapper: Wrapper,
    /// Header name or metadata key
    pub wrapper_key: String,
    /// The builder
    pub evaluator: Arc<dyn Evaluator>,
}

impl fmt::Debug for ResponseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseConfig")
            .field("name", &self.name)
            .field("wrapper", &self.wrapper)
            .field("wrapper_key", &self.wrapper_key)
            .finish_non_exhaustive()
    }
}

/// Evaluators for one protected host, by phase
#[derive(Debug, Clone, Default)]
pub struct HostConfiguration {
    /// Name of the source configuration
    pub name: String,
    pub identity: Vec<EvaluatorConfig>,
    pub metadata: Vec<EvaluatorConfig>,
    pub authorization: Vec<EvaluatorConfig>,
    pub response: Vec<ResponseConfig>,
}

impl AuthConfig {
    /// Build the runnable configuration
    ///
    /// Any evaluator that cannot be constructed, or that is listed under a
    /// phase it does not serve, rejects the whole configuration.
    pub fn build(&self, client: &reqwest::Client) -> Result<HostConfiguration> {
        if self.name.is_empty() {
            return Err(ExtAuthError::configuration("configuration name is empty"));
        }
        if self.hosts.is_empty() {
            return Err(ExtAuthError::configuration(format!(
                "{}: no hosts configured",
                self.name
            )));
        }

        Ok(HostConfiguration {
            name: self.name.clone(),
            identity: self.build_phase(Phase::Identity, &self.identity, client)?,
            metadata: self.build_phase(Phase::Metadata, &self.metadata, client)?,
            authorization: self.build_phase(Phase::Authorization, &self.authorization, client)?,
            response: self
                .response
                .iter()
                .map(|spec| {
                    self.check_kind(Phase::Response, &spec.name, &spec.kind)?;
                    Ok(ResponseConfig {
                        name: spec.name.clone(),
                        wrapper: spec.wrapper,
                        wrapper_key: spec.wrapper_key.clone().unwrap_or_else(|| spec.name.clone()),
                        evaluator: self.build_kind(&spec.name, &spec.kind, client)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        })
    }

    fn build_phase(
        &self,
        phase: Phase,
        specs: &[EvaluatorSpec],
        client: &reqwest::Client,
    ) -> Result<Vec<EvaluatorConfig>> {
        specs
            .iter()
            .map(|spec| {
                self.check_kind(phase, &spec.name, &spec.kind)?;
                if spec.fatal && phase != Phase::Metadata {
                    return Err(ExtAuthError::configuration(format!(
                        "{}: `fatal` only applies to metadata evaluators ({})",
                        self.name, spec.name
                    )));
                }
                Ok(EvaluatorConfig {
                    name: spec.name.clone(),
                    evaluator: self.build_kind(&spec.name, &spec.kind, client)?,
                    fatal: spec.fatal,
                })
            })
            .collect()
    }

    fn check_kind(&self, phase: Phase, name: &str, kind: &EvaluatorKind) -> Result<()> {
        if kind.allowed_in(phase) {
            return Ok(());
        }
        Err(ExtAuthError::configuration(format!(
            "{}: evaluator {} of type {} cannot be used in the {} phase",
            self.name,
            name,
            kind.as_str(),
            phase
        )))
    }

    fn build_kind(
        &self,
        name: &str,
        kind: &EvaluatorKind,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn Evaluator>> {
        kind.build(client).map_err(|e| {
            ExtAuthError::configuration(format!("{}: evaluator {}: {}", self.name, name, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_configs(yaml: &str) -> Vec<AuthConfig> {
        serde_yaml::from_str(yaml).unwrap()
    }

    const CONFIG: &str = r#"
- name: talker-api
  hosts: ["talker-api", "talker-api.default.svc"]
  identity:
    - name: friends
      type: api_key
      keys:
        friend-1: ndyBzreUzF4zqDQsqSPMHkRhriEOtcRx
      credentials:
        authorization_header:
          prefix: APIKEY
  metadata:
    - name: user-info
      type: http
      endpoint: "http://users.svc/{{ auth.identity.name }}"
      fatal: true
  authorization:
    - name: only-get
      type: pattern_matching
      rules:
        - selector: context.request.http.method
          operator: eq
          value: GET
  response:
    - name: x-user
      type: plain
      value: "{{ auth.identity.name }}"
    - name: ext
      type: json
      wrapper: dynamic_metadata
      wrapper_key: ext_auth_data
      properties:
        - name: user
          value: "{{ auth.identity.name }}"
"#;

    #[test]
    fn test_parse_and_build() {
        let configs = parse_configs(CONFIG);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].hosts.len(), 2);

        let host = configs[0].build(&reqwest::Client::new()).unwrap();
        assert_eq!(host.name, "talker-api");
        assert_eq!(host.identity.len(), 1);
        assert!(host.metadata[0].fatal);
        assert_eq!(host.authorization[0].name, "only-get");

        assert_eq!(host.response[0].wrapper, Wrapper::HttpHeader);
        assert_eq!(host.response[0].wrapper_key, "x-user");
        assert_eq!(host.response[1].wrapper, Wrapper::DynamicMetadata);
        assert_eq!(host.response[1].wrapper_key, "ext_auth_data");
    }

    #[test]
    fn test_evaluator_in_wrong_phase_is_rejected() {
        let yaml = r#"
- name: bad
  hosts: ["a"]
  authorization:
    - name: lookup
      type: http
      endpoint: http://example.com
"#;
        let configs = parse_configs(yaml);
        let err = configs[0].build(&reqwest::Client::new()).unwrap_err();
        assert!(err.to_string().contains("cannot be used in the authorization phase"));
    }

    #[test]
    fn test_unsupported_method_rejected_at_build() {
        let yaml = r#"
- name: bad
  hosts: ["a"]
  metadata:
    - name: lookup
      type: http
      endpoint: http://example.com
      method: DELETE
"#;
        let configs = parse_configs(yaml);
        assert!(configs[0].build(&reqwest::Client::new()).is_err());
    }

    #[test]
    fn test_fatal_outside_metadata_rejected() {
        let yaml = r#"
- name: bad
  hosts: ["a"]
  identity:
    - name: anyone
      type: anonymous
      fatal: true
"#;
        let configs = parse_configs(yaml);
        assert!(configs[0].build(&reqwest::Client::new()).is_err());
    }

    #[test]
    fn test_missing_hosts_rejected() {
        let yaml = "- name: lonely\n  hosts: []\n";
        let configs = parse_configs(yaml);
        assert!(configs[0].build(&reqwest::Client::new()).is_err());
    }
}
