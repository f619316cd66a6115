//! Credential locations
//!
//! Where a credential is read from on inbound requests (API keys, bearer
//! tokens) and where a shared secret is placed on outbound evaluator calls.

use serde::Deserialize;

use crate::context::RequestAttributes;

/// Location of a credential within an HTTP request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Credentials {
    /// `Authorization: <prefix> <value>`
    AuthorizationHeader {
        /// Scheme prefix, e.g. `Bearer`
        #[serde(default = "default_prefix")]
        prefix: String,
    },
    /// A dedicated request header
    CustomHeader {
        /// Header name
        name: String,
    },
    /// A query string parameter
    Query {
        /// Parameter name
        name: String,
    },
    /// A cookie
    Cookie {
        /// Cookie name
        name: String,
    },
}

fn default_prefix() -> String {
    "Bearer".to_string()
}

impl Default for Credentials {
    fn default() -> Self {
        Self::AuthorizationHeader {
            prefix: default_prefix(),
        }
    }
}

impl Credentials {
    /// Read the credential from an inbound request
    pub fn extract(&self, request: &RequestAttributes) -> Option<String> {
        let value = match self {
            Credentials::AuthorizationHeader { prefix } => {
                let header = request.header("authorization")?;
                let (scheme, rest) = header.split_once(' ')?;
                if !scheme.eq_ignore_ascii_case(prefix) {
                    return None;
                }
                rest.trim().to_string()
            }
            Credentials::CustomHeader { name } => request.header(name)?.to_string(),
            Credentials::Query { name } => request.query_param(name)?,
            Credentials::Cookie { name } => request.cookie(name)?.to_string(),
        };

        (!value.is_empty()).then_some(value)
    }

    /// Attach a credential to an outbound request
    pub fn inject(
        &self,
        builder: reqwest::RequestBuilder,
        secret: &str,
    ) -> reqwest::RequestBuilder {
        match self {
            Credentials::AuthorizationHeader { prefix } => {
                builder.header("Authorization", format!("{} {}", prefix, secret))
            }
            Credentials::CustomHeader { name } => builder.header(name.as_str(), secret),
            Credentials::Query { name } => builder.query(&[(name.as_str(), secret)]),
            Credentials::Cookie { name } => builder.header("Cookie", format!("{}={}", name, secret)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::{EvaluatorKind, EvaluatorSpec};
    use crate::context::HttpAttributes;

    fn request(headers: &[(&str, &str)], path: &str) -> RequestAttributes {
        let headers: BTreeMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RequestAttributes {
            http: HttpAttributes {
                headers,
                path: path.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_authorization_header() {
        let req = request(&[("authorization", "APIKEY secret-1")], "/");
        let creds = Credentials::AuthorizationHeader {
            prefix: "APIKEY".to_string(),
        };
        assert_eq!(creds.extract(&req).as_deref(), Some("secret-1"));
        assert_eq!(Credentials::default().extract(&req), None);
    }

    #[test]
    fn test_custom_header_query_cookie() {
        let req = request(
            &[("x-api-key", "k1"), ("cookie", "token=c1; other=2")],
            "/path?api_key=q1",
        );

        let header = Credentials::CustomHeader {
            name: "X-API-Key".to_string(),
        };
        let query = Credentials::Query {
            name: "api_key".to_string(),
        };
        let cookie = Credentials::Cookie {
            name: "token".to_string(),
        };

        assert_eq!(header.extract(&req).as_deref(), Some("k1"));
        assert_eq!(query.extract(&req).as_deref(), Some("q1"));
        assert_eq!(cookie.extract(&req).as_deref(), Some("c1"));
    }

    #[test]
    fn test_empty_credential_is_absent() {
        let req = request(&[("x-api-key", "")], "/");
        let header = Credentials::CustomHeader {
            name: "x-api-key".to_string(),
        };
        assert_eq!(header.extract(&req), None);
    }

    fn credentials_of(yaml: &str) -> Credentials {
        let spec: EvaluatorSpec = serde_yaml::from_str(yaml).unwrap();
        match spec.kind {
            EvaluatorKind::ApiKey(config) => config.credentials,
            other => panic!("expected api_key, got {}", other.as_str()),
        }
    }

    #[test]
    fn test_deserialize_location() {
        let creds = credentials_of(
            "name: keys\ntype: api_key\nkeys: {}\ncredentials:\n  custom_header:\n    name: X-Token\n",
        );
        assert_eq!(
            creds,
            Credentials::CustomHeader {
                name: "X-Token".to_string()
            }
        );

        let creds = credentials_of(
            "name: keys\ntype: api_key\nkeys: {}\ncredentials:\n  authorization_header: {}\n",
        );
        assert_eq!(creds, Credentials::default());

        let creds = credentials_of("name: keys\ntype: api_key\nkeys: {}\n");
        assert_eq!(creds, Credentials::default());
    }
}
