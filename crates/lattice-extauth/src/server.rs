//! Envoy ext_authz gRPC server
//!
//! Resolves the host configuration for each check request, runs its auth
//! pipeline under a deadline and renders the verdict as an Envoy
//! `CheckResponse`.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use envoy_types::ext_authz::v3::pb::{
    Authorization, AuthorizationServer, CheckRequest, CheckResponse,
};
use envoy_types::ext_authz::v3::CheckResponseExt;
use envoy_types::pb::envoy::config::core::v3::address::Address as AddressKind;
use envoy_types::pb::envoy::config::core::v3::socket_address::PortSpecifier;
use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::r#type::v3::HttpStatus;
use envoy_types::pb::envoy::service::auth::v3::attribute_context::Peer;
use envoy_types::pb::envoy::service::auth::v3::check_response::HttpResponse;
use envoy_types::pb::envoy::service::auth::v3::{DeniedHttpResponse, OkHttpResponse};
use envoy_types::pb::google::protobuf::value::Kind;
use envoy_types::pb::google::protobuf::{ListValue, Struct, Value as ProtoValue};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info, warn};

use crate::cache::HostCache;
use crate::context::{HttpAttributes, PeerAttributes, RequestAttributes};
use crate::error::{ExtAuthError, Result};
use crate::metrics::{ExtAuthMetrics, Timer};
use crate::pipeline::AuthPipeline;
use crate::result::{AuthResult, REASON_HEADER};

/// Reason given when no configuration owns the requested host
pub const SERVICE_NOT_FOUND: &str = "Service not found";
/// Reason given when the check request cannot be processed
pub const INVALID_REQUEST: &str = "Invalid request";

/// ExtAuth gRPC server
pub struct ExtAuthServer {
    service: ExtAuthService,
    addr: SocketAddr,
}

impl ExtAuthServer {
    /// Create a new server over a host cache
    pub fn new(cache: Arc<HostCache>, addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            service: ExtAuthService::new(cache, Arc::new(ExtAuthMetrics::new()), timeout),
            addr,
        }
    }

    /// Get metrics reference
    pub fn metrics(&self) -> Arc<ExtAuthMetrics> {
        self.service.metrics.clone()
    }

    /// Run the gRPC server until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.addr;

        info!(?addr, "Starting ExtAuth gRPC server");

        tonic::transport::Server::builder()
            .add_service(AuthorizationServer::new(self.service))
            .serve_with_shutdown(addr, shutdown)
            .await
            .map_err(|e| ExtAuthError::grpc(format!("server error: {}", e)))
    }
}

/// Check handler
#[derive(Clone)]
pub struct ExtAuthService {
    cache: Arc<HostCache>,
    metrics: Arc<ExtAuthMetrics>,
    /// Evaluation deadline per check
    timeout: Duration,
}

impl ExtAuthService {
    /// Create a check handler
    pub fn new(cache: Arc<HostCache>, metrics: Arc<ExtAuthMetrics>, timeout: Duration) -> Self {
        Self {
            cache,
            metrics,
            timeout,
        }
    }

    /// Handle one check request
    pub async fn process(&self, request: CheckRequest) -> CheckResponse {
        let attributes = request_attributes(&request);

        let request_json = match serde_json::to_string(&attributes) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize check request");
                self.metrics.record_error();
                return denied_response(&AuthResult::deny(Code::FailedPrecondition, INVALID_REQUEST));
            }
        };
        debug!(request = %request_json, "Check()");

        let host = attributes.host().to_string();
        let Some(config) = self.cache.get(&host) else {
            info!(host = %host, "no configuration for host");
            self.metrics.record_not_found();
            return denied_response(&AuthResult::deny(Code::NotFound, SERVICE_NOT_FOUND));
        };

        let pipeline = match AuthPipeline::new(config.clone(), attributes) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                warn!(error = %e, "failed to build evaluation context");
                self.metrics.record_error();
                return denied_response(&AuthResult::deny(Code::FailedPrecondition, INVALID_REQUEST));
            }
        };

        let timer = Timer::start();
        let result = self.evaluate_with_deadline(pipeline).await;
        let elapsed = timer.elapsed();

        info!(
            host = %host,
            config = %config.name,
            code = ?result.code,
            message = %result.message,
            elapsed_us = elapsed.as_micros(),
            "Authorization decision"
        );

        if result.success() {
            self.metrics.record_allowed(elapsed);
            ok_response(&result)
        } else {
            if result.code == Code::DeadlineExceeded {
                self.metrics.record_timeout(elapsed);
            } else {
                self.metrics.record_denied(elapsed);
            }
            denied_response(&result)
        }
    }

    /// Run the pipeline, cancelling its scope once the deadline passes
    async fn evaluate_with_deadline(&self, pipeline: AuthPipeline) -> AuthResult {
        let cancel = CancellationToken::new();
        let deadline = {
            let cancel = cancel.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        };

        let result = pipeline.evaluate(&cancel).await;
        deadline.abort();
        result
    }
}

#[tonic::async_trait]
impl Authorization for ExtAuthService {
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> std::result::Result<Response<CheckResponse>, Status> {
        Ok(Response::new(self.process(request.into_inner()).await))
    }
}

/// Convert Envoy attributes into the request attributes the pipeline sees
pub fn request_attributes(request: &CheckRequest) -> RequestAttributes {
    let Some(attrs) = request.attributes.as_ref() else {
        return RequestAttributes::default();
    };

    let http = attrs
        .request
        .as_ref()
        .and_then(|r| r.http.as_ref())
        .map(|http| HttpAttributes {
            id: http.id.clone(),
            method: http.method.clone(),
            headers: http
                .headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            path: http.path.clone(),
            host: http.host.clone(),
            scheme: http.scheme.clone(),
            query: http.query.clone(),
            protocol: http.protocol.clone(),
        })
        .unwrap_or_default();

    RequestAttributes {
        http,
        source: attrs.source.as_ref().map(peer_attributes),
        destination: attrs.destination.as_ref().map(peer_attributes),
        context_extensions: attrs
            .context_extensions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

fn peer_attributes(peer: &Peer) -> PeerAttributes {
    let (address, port) = match peer.address.as_ref().and_then(|a| a.address.as_ref()) {
        Some(AddressKind::SocketAddress(sa)) => {
            let port = match &sa.port_specifier {
                Some(PortSpecifier::PortValue(port)) => Some(*port),
                _ => None,
            };
            (sa.address.clone(), port)
        }
        _ => (String::new(), None),
    };

    PeerAttributes {
        address,
        port,
        principal: peer.principal.clone(),
    }
}

/// Build an allow response
fn ok_response(result: &AuthResult) -> CheckResponse {
    let mut response = CheckResponse::with_status(Status::ok("OK"));
    response.http_response = Some(HttpResponse::OkResponse(OkHttpResponse {
        headers: header_options(&result.headers),
        ..Default::default()
    }));
    if !result.metadata.is_empty() {
        response.dynamic_metadata = Some(to_struct(&result.metadata));
    }
    response
}

/// Build a deny response carrying the mapped HTTP status and reason header
fn denied_response(result: &AuthResult) -> CheckResponse {
    let mut headers = result.headers.clone();
    headers.push((REASON_HEADER.to_string(), result.message.clone()));

    let mut response = CheckResponse::with_status(Status::new(result.code, result.message.clone()));
    response.http_response = Some(HttpResponse::DeniedResponse(DeniedHttpResponse {
        status: Some(HttpStatus {
            code: result.http_status() as i32,
        }),
        headers: header_options(&headers),
        ..Default::default()
    }));
    response
}

fn header_options(headers: &[(String, String)]) -> Vec<HeaderValueOption> {
    headers
        .iter()
        .map(|(key, value)| HeaderValueOption {
            header: Some(HeaderValue {
                key: key.clone(),
                value: value.clone(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect()
}

fn to_struct(fields: &Map<String, Value>) -> Struct {
    Struct {
        fields: fields
            .iter()
            .map(|(key, value)| (key.clone(), to_proto_value(value)))
            .collect(),
    }
}

fn to_proto_value(value: &Value) -> ProtoValue {
    let kind = match value {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(to_proto_value).collect(),
        }),
        Value::Object(fields) => Kind::StructValue(to_struct(fields)),
    };
    ProtoValue { kind: Some(kind) }
}
