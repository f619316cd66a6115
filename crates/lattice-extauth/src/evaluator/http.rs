//! Generic HTTP evaluator
//!
//! Calls an external HTTP endpoint built from templates over the evaluation
//! context and hands the parsed response back to the pipeline.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{stringify, Evaluator, JsonProperty};
use crate::credentials::Credentials;
use crate::error::{EvaluatorError, ExtAuthError, Result};
use crate::pipeline::AuthPipeline;
use crate::placeholder::PlaceholderEngine;

const TEXT_PLAIN: &str = "text/plain";
const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const APPLICATION_JSON: &str = "application/json";

/// Configuration of a generic HTTP evaluator
#[derive(Debug, Clone, Deserialize)]
pub struct GenericHttpConfig {
    /// Endpoint URL template
    pub endpoint: String,
    /// `GET` or `POST`
    #[serde(default = "default_method")]
    pub method: String,
    /// JSON body template (POST only); takes precedence over `parameters`
    #[serde(default)]
    pub body: Option<Value>,
    /// Named parameters encoded as the request body (POST only)
    #[serde(default)]
    pub parameters: Vec<JsonProperty>,
    /// Extra request headers (values are templates)
    #[serde(default)]
    pub headers: Vec<JsonProperty>,
    /// Content type used to encode `parameters`
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Secret injected into the outbound request
    #[serde(default)]
    pub shared_secret: Option<String>,
    /// Where the shared secret goes
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_content_type() -> String {
    FORM_URLENCODED.to_string()
}

/// How named parameters are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParameterEncoding {
    FormUrlEncoded,
    Json,
}

/// Request body plan, fixed at configuration time
#[derive(Debug, Clone)]
enum RequestBody {
    Empty,
    Template(Value),
    Parameters(Vec<JsonProperty>, ParameterEncoding),
}

/// External HTTP evaluator
#[derive(Debug)]
pub struct GenericHttp {
    endpoint: String,
    method: Method,
    body: RequestBody,
    headers: Vec<JsonProperty>,
    content_type: String,
    credentials: Option<(Credentials, String)>,
    client: reqwest::Client,
}

impl GenericHttp {
    /// Build an evaluator from configuration
    ///
    /// Unsupported methods and parameter content types are rejected here so
    /// a bad configuration never reaches the request path.
    pub fn new(config: GenericHttpConfig, client: reqwest::Client) -> Result<Self> {
        let (method, body, content_type) = match config.method.to_ascii_uppercase().as_str() {
            "GET" => (Method::GET, RequestBody::Empty, TEXT_PLAIN.to_string()),
            "POST" => {
                let body = match config.body {
                    Some(template) => RequestBody::Template(template),
                    None => {
                        let encoding = match config.content_type.as_str() {
                            FORM_URLENCODED => ParameterEncoding::FormUrlEncoded,
                            APPLICATION_JSON => ParameterEncoding::Json,
                            other => {
                                return Err(ExtAuthError::configuration(format!(
                                    "unsupported content-type: {}",
                                    other
                                )))
                            }
                        };
                        RequestBody::Parameters(config.parameters, encoding)
                    }
                };
                (Method::POST, body, config.content_type)
            }
            other => {
                return Err(ExtAuthError::configuration(format!(
                    "unsupported method: {}",
                    other
                )))
            }
        };

        let credentials = match (config.shared_secret, config.credentials) {
            (Some(secret), Some(location)) => Some((location, secret)),
            (Some(secret), None) => Some((Credentials::default(), secret)),
            (None, _) => None,
        };

        Ok(Self {
            endpoint: config.endpoint,
            method,
            body,
            headers: config.headers,
            content_type,
            credentials,
            client,
        })
    }

    /// Encode the request body for the current context document
    fn build_request_body(&self, doc: &Value) -> std::result::Result<Option<String>, EvaluatorError> {
        let engine = PlaceholderEngine::global();

        match &self.body {
            RequestBody::Empty => Ok(None),
            RequestBody::Template(template) => {
                let resolved = engine.resolve(template, doc)?;
                serde_json::to_string(&resolved)
                    .map(Some)
                    .map_err(|e| EvaluatorError::new("failed to encode http request").detail(e))
            }
            RequestBody::Parameters(params, encoding) => {
                let mut data = Map::new();
                for param in params {
                    data.insert(param.name.clone(), engine.resolve(&param.value, doc)?);
                }

                match encoding {
                    ParameterEncoding::FormUrlEncoded => {
                        let mut form = url::form_urlencoded::Serializer::new(String::new());
                        for (key, value) in &data {
                            form.append_pair(key, &stringify(value));
                        }
                        Ok(Some(form.finish()))
                    }
                    ParameterEncoding::Json => serde_json::to_string(&Value::Object(data))
                        .map(Some)
                        .map_err(|e| {
                            EvaluatorError::new("failed to encode http request").detail(e)
                        }),
                }
            }
        }
    }

    /// Apply configured headers, then force the computed content type
    fn apply_headers(
        &self,
        headers: &mut HeaderMap,
        doc: &Value,
    ) -> std::result::Result<(), EvaluatorError> {
        let engine = PlaceholderEngine::global();

        for header in &self.headers {
            let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|e| {
                EvaluatorError::configuration(format!("invalid header name: {}", header.name))
                    .detail(e)
            })?;
            let value = stringify(&engine.resolve(&header.value, doc)?);
            let value = HeaderValue::from_str(&value).map_err(|e| {
                EvaluatorError::new(format!("invalid value for header {}", header.name)).detail(e)
            })?;
            headers.insert(name, value);
        }

        let content_type = HeaderValue::from_str(&self.content_type).map_err(|e| {
            EvaluatorError::configuration("invalid content type").detail(e)
        })?;
        headers.insert(CONTENT_TYPE, content_type);
        Ok(())
    }
}

#[async_trait]
impl Evaluator for GenericHttp {
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

        let endpoint = engine.render(&self.endpoint, &doc)?;
        let body = self.build_request_body(&doc)?;

        let mut builder = self.client.request(self.method.clone(), &endpoint);
        if let Some((location, secret)) = &self.credentials {
            builder = location.inject(builder, secret);
        }
        if let Some(body) = &body {
            builder = builder.body(body.clone());
        }

        let mut request = builder
            .build()
            .map_err(|e| EvaluatorError::new("failed to build http request").detail(e))?;
        self.apply_headers(request.headers_mut(), &doc)?;

        debug!(
            target: "lattice_extauth::http",
            method = %self.method,
            url = %request.url(),
            headers = ?request.headers(),
            "sending request"
        );
        if let Some(body) = &body {
            trace!(target: "lattice_extauth::http", body = %body, "request body");
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EvaluatorError::cancelled()),
            response = self.client.execute(request) => response?,
        };

        debug!(
            target: "lattice_extauth::http",
            status = %response.status(),
            url = %endpoint,
            "received response"
        );

        let is_json = response
            .headers()
            .get_all(CONTENT_TYPE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains(APPLICATION_JSON));

        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EvaluatorError::cancelled()),
            bytes = response.bytes() => bytes?,
        };

        if is_json {
            decode_json_stream(&bytes)
        } else {
            Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        }
    }
}

/// Decode a body holding zero or more concatenated JSON values
///
/// No values yields `null`, one value is returned as-is, several come back
/// as an array in body order.
pub fn decode_json_stream(bytes: &[u8]) -> std::result::Result<Value, EvaluatorError> {
    let mut elements = Vec::new();
    for item in serde_json::Deserializer::from_slice(bytes).into_iter::<Value>() {
        let value = item
            .map_err(|e| EvaluatorError::new("failed to decode external response").detail(e))?;
        elements.push(value);
    }

    if elements.len() > 1 {
        Ok(Value::Array(elements))
    } else {
        Ok(elements.pop().unwrap_or(Value::Null))
    }
}
