//! Per-request evaluation context ("authorization JSON")
//!
//! ```text
//! { context: { request: <request attributes> },
//!   auth: { identity: <identity phase output>,
//!           metadata: { <name>: <value>, ... },
//!           authorization: { <name>: <value>, ... },
//!           response: { <name>: <value>, ... } } }
//! ```
//!
//! Each phase owns one region. Writes are accepted only for the phase that is
//! currently running; earlier regions are sealed once the pipeline advances,
//! and later regions stay empty until their phase starts.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{ExtAuthError, Result};
use crate::placeholder::PlaceholderEngine;

/// Pipeline phases, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Request attributes only
    Request,
    /// Authentication
    Identity,
    /// External metadata enrichment
    Metadata,
    /// Policy evaluation
    Authorization,
    /// Response shaping
    Response,
}

impl Phase {
    /// Lowercase phase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Request => "request",
            Phase::Identity => "identity",
            Phase::Metadata => "metadata",
            Phase::Authorization => "authorization",
            Phase::Response => "response",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network peer of the checked request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerAttributes {
    /// IP address or hostname
    pub address: String,
    /// Port, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    /// Peer principal (e.g. SPIFFE ID from mTLS)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub principal: String,
}

/// HTTP attributes of the checked request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HttpAttributes {
    /// Request ID assigned by the proxy
    pub id: String,
    /// HTTP method
    pub method: String,
    /// Lowercased request headers
    pub headers: BTreeMap<String, String>,
    /// Path including query string
    pub path: String,
    /// Host (`:authority`)
    pub host: String,
    /// URL scheme
    pub scheme: String,
    /// Query string without `?`
    pub query: String,
    /// HTTP protocol (e.g. `HTTP/1.1`)
    pub protocol: String,
}

/// Proxy-supplied attributes of the checked request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestAttributes {
    /// HTTP request attributes
    pub http: HttpAttributes,
    /// Downstream peer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PeerAttributes>,
    /// Upstream destination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<PeerAttributes>,
    /// Per-route context extensions configured at the proxy
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub context_extensions: HashMap<String, String>,
}

impl RequestAttributes {
    /// Host the request targets
    pub fn host(&self) -> &str {
        &self.http.host
    }

    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.http
            .headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Value of a query string parameter
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = if self.http.query.is_empty() {
            self.http.path.split_once('?').map(|(_, q)| q).unwrap_or("")
        } else {
            self.http.query.as_str()
        };
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Value of a cookie from the `cookie` header
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

/// Phase-scoped evaluation document for one request
#[derive(Debug, Clone)]
pub struct AuthJson {
    request: Value,
    identity: Option<Value>,
    metadata: Map<String, Value>,
    authorization: Map<String, Value>,
    response: Map<String, Value>,
    phase: Phase,
}

impl AuthJson {
    /// Create a context seeded with request attributes
    ///
    /// Fails if the attributes cannot be serialized.
    pub fn new(request: &RequestAttributes) -> Result<Self> {
        let request = serde_json::to_value(request)
            .map_err(|e| ExtAuthError::template(format!("invalid request attributes: {}", e)))?;

        Ok(Self {
            request,
            identity: None,
            metadata: Map::new(),
            authorization: Map::new(),
            response: Map::new(),
            phase: Phase::Request,
        })
    }

    /// The phase currently allowed to write
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to a later phase, sealing the current one
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if next <= self.phase {
            return Err(ExtAuthError::phase_violation(format!(
                "cannot move from {} back to {}",
                self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// Store the identity phase output
    pub fn set_identity(&mut self, value: Value) -> Result<()> {
        self.check_owner(Phase::Identity)?;
        self.identity = Some(value);
        Ok(())
    }

    /// Store an evaluator result under the current phase's region
    pub fn insert(&mut self, phase: Phase, name: &str, value: Value) -> Result<()> {
        self.check_owner(phase)?;
        let region = match phase {
            Phase::Metadata => &mut self.metadata,
            Phase::Authorization => &mut self.authorization,
            Phase::Response => &mut self.response,
            Phase::Request | Phase::Identity => {
                return Err(ExtAuthError::phase_violation(format!(
                    "phase {} has no named region",
                    phase
                )))
            }
        };
        region.insert(name.to_string(), value);
        Ok(())
    }

    /// Identity phase output, if resolved
    pub fn identity(&self) -> Option<&Value> {
        self.identity.as_ref()
    }

    /// Named result from a phase region
    pub fn get(&self, phase: Phase, name: &str) -> Option<&Value> {
        match phase {
            Phase::Metadata => self.metadata.get(name),
            Phase::Authorization => self.authorization.get(name),
            Phase::Response => self.response.get(name),
            Phase::Request | Phase::Identity => None,
        }
    }

    /// Render the whole document
    ///
    /// Only populated regions appear, so a path a later phase owns is simply
    /// absent to earlier readers.
    pub fn to_value(&self) -> Value {
        let mut auth = Map::new();
        if let Some(identity) = &self.identity {
            auth.insert("identity".to_string(), identity.clone());
        }
        if self.phase >= Phase::Metadata {
            auth.insert("metadata".to_string(), Value::Object(self.metadata.clone()));
        }
        if self.phase >= Phase::Authorization {
            auth.insert(
                "authorization".to_string(),
                Value::Object(self.authorization.clone()),
            );
        }
        if self.phase >= Phase::Response {
            auth.insert("response".to_string(), Value::Object(self.response.clone()));
        }

        json!({
            "context": { "request": self.request },
            "auth": auth,
        })
    }

    /// Serialized document, as sent to external evaluators
    pub fn to_json_string(&self) -> String {
        self.to_value().to_string()
    }

    /// Render a `{{ ... }}` template against the document
    pub fn render(&self, template: &str) -> Result<String> {
        PlaceholderEngine::global().render(template, &self.to_value())
    }

    /// Resolve a JSON value template against the document
    pub fn resolve(&self, template: &Value) -> Result<Value> {
        PlaceholderEngine::global().resolve(template, &self.to_value())
    }

    fn check_owner(&self, phase: Phase) -> Result<()> {
        if phase != self.phase {
            return Err(ExtAuthError::phase_violation(format!(
                "{} region is not writable during the {} phase",
                phase, self.phase
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestAttributes {
        let mut headers = BTreeMap::new();
        headers.insert("authorization".to_string(), "Bearer abc".to_string());
        headers.insert("cookie".to_string(), "session=s1; theme=dark".to_string());
        RequestAttributes {
            http: HttpAttributes {
                method: "GET".to_string(),
                path: "/hello?name=world&x=1".to_string(),
                host: "talker-api:8000".to_string(),
                headers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_request_accessors() {
        let req = request();
        assert_eq!(req.host(), "talker-api:8000");
        assert_eq!(req.header("Authorization"), Some("Bearer abc"));
        assert_eq!(req.query_param("name").as_deref(), Some("world"));
        assert_eq!(req.query_param("missing"), None);
        assert_eq!(req.cookie("theme"), Some("dark"));
        assert_eq!(req.cookie("nope"), None);
    }

    #[test]
    fn test_initial_document_has_only_request() {
        let ctx = AuthJson::new(&request()).unwrap();
        let doc = ctx.to_value();
        assert_eq!(doc["context"]["request"]["http"]["method"], "GET");
        assert_eq!(doc["auth"], json!({}));
    }

    #[test]
    fn test_phase_regions_follow_order() {
        let mut ctx = AuthJson::new(&request()).unwrap();

        ctx.advance(Phase::Identity).unwrap();
        ctx.set_identity(json!({"sub": "alice"})).unwrap();

        ctx.advance(Phase::Metadata).unwrap();
        ctx.insert(Phase::Metadata, "user-info", json!({"email": "a@b"}))
            .unwrap();

        let doc = ctx.to_value();
        assert_eq!(doc["auth"]["identity"]["sub"], "alice");
        assert_eq!(doc["auth"]["metadata"]["user-info"]["email"], "a@b");
        assert!(doc["auth"].get("authorization").is_none());
    }

    #[test]
    fn test_sealed_phase_rejects_writes() {
        let mut ctx = AuthJson::new(&request()).unwrap();
        ctx.advance(Phase::Identity).unwrap();
        ctx.advance(Phase::Metadata).unwrap();

        assert!(ctx.set_identity(json!({})).is_err());
        assert!(ctx.insert(Phase::Authorization, "x", json!(1)).is_err());
        assert!(ctx.advance(Phase::Identity).is_err());
    }

    #[test]
    fn test_render_against_document() {
        let mut ctx = AuthJson::new(&request()).unwrap();
        ctx.advance(Phase::Identity).unwrap();
        ctx.set_identity(json!({"sub": "alice"})).unwrap();

        let out = ctx
            .render("{{ context.request.http.method }} by {{ auth.identity.sub }}")
            .unwrap();
        assert_eq!(out, "GET by alice");
    }
}
