//! External authorization sidecar for Envoy
//!
//! Answers Envoy `ext_authz` check requests by running a per-host auth
//! pipeline of evaluators:
//!
//! - **Identity** - who is calling (API key, OIDC token, anonymous)
//! - **Metadata** - extra data fetched from external HTTP services
//! - **Authorization** - pattern rules over everything gathered so far
//! - **Response** - headers and dynamic metadata handed back to Envoy
//!
//! Host configurations are read from a YAML file and kept current by a
//! polling reconciler.

pub mod cache;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod pipeline;
pub mod placeholder;
pub mod reconcile;
pub mod result;
pub mod server;
pub mod telemetry;

pub use cache::HostCache;
pub use config::{AuthConfig, HostConfiguration};
pub use error::{EvaluatorError, ExtAuthError, Result};
pub use pipeline::AuthPipeline;
pub use reconcile::Reconciler;
pub use result::AuthResult;
pub use server::{ExtAuthServer, ExtAuthService};
