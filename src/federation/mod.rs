// =============================================================================
// Matrixon Bridge - Federation Client Module
// =============================================================================
//
// Project: Matrixon Bridge - Matrix Federation Room Engine
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2025-03-10
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Outbound half of the Matrix Server-Server API: a thin path-based JSON
//   transport with X-Matrix request signatures. Server discovery (SRV,
//   .well-known) is out of scope; destinations resolve to host:8448 unless
//   the server name carries an explicit port. Room actors depend on the
//   trait only, so tests can substitute a scripted transport.
//
// =============================================================================

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use ruma::{CanonicalJsonObject, CanonicalJsonValue, ServerName};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{signing::SigningService, Error, Result};

/// HTTP methods used by the federation endpoints this bridge calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status and decoded JSON body of a federation response.
#[derive(Debug, Clone)]
pub struct FederationResponse {
    pub status: u16,
    pub body: JsonValue,
}

impl FederationResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// The federation transport seam.
///
/// `path` is already percent-encoded (see [`encode_component`]); `query`
/// is appended in order. Implementations sign requests on behalf of our
/// server name.
#[async_trait]
pub trait FederationClient: Send + Sync {
    async fn send_request(
        &self,
        destination: &ServerName,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<JsonValue>,
        timeout: Duration,
    ) -> Result<FederationResponse>;
}

/// Percent-encode one path segment or query value.
pub fn encode_component(component: &str) -> String {
    let mut encoded = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            other => {
                encoded.push_str(&format!("%{other:02X}"));
            }
        }
    }
    encoded
}

fn query_string(query: &[(String, String)]) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut out = String::from("?");
    for (index, (key, value)) in query.iter().enumerate() {
        if index > 0 {
            out.push('&');
        }
        out.push_str(&encode_component(key));
        out.push('=');
        out.push_str(&encode_component(value));
    }
    out
}

/// Production transport over reqwest.
pub struct HttpFederationClient {
    client: reqwest::Client,
    signing: Arc<SigningService>,
}

impl HttpFederationClient {
    pub fn new(signing: Arc<SigningService>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Federation(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, signing })
    }

    /// The Authorization headers carrying our signature over
    /// `{method, uri, origin, destination, content}`.
    fn signature_headers(
        &self,
        destination: &ServerName,
        method: Method,
        uri: &str,
        body: Option<&JsonValue>,
    ) -> Result<Vec<String>> {
        let mut request_map = CanonicalJsonObject::new();
        request_map.insert("method".to_owned(), CanonicalJsonValue::String(method.as_str().to_owned()));
        request_map.insert("uri".to_owned(), CanonicalJsonValue::String(uri.to_owned()));
        request_map.insert(
            "origin".to_owned(),
            CanonicalJsonValue::String(self.signing.server_name().as_str().to_owned()),
        );
        request_map.insert(
            "destination".to_owned(),
            CanonicalJsonValue::String(destination.as_str().to_owned()),
        );
        if let Some(body) = body {
            let content = CanonicalJsonValue::try_from(body.clone())
                .map_err(|e| Error::Signing(format!("request body is not canonical JSON: {e}")))?;
            request_map.insert("content".to_owned(), content);
        }
        self.signing.sign_json(&mut request_map)?;

        let origin = self.signing.server_name().as_str();
        let mut headers = Vec::new();
        if let Some(CanonicalJsonValue::Object(servers)) = request_map.get("signatures") {
            if let Some(CanonicalJsonValue::Object(keys)) = servers.get(origin) {
                for (key_id, signature) in keys {
                    if let CanonicalJsonValue::String(signature) = signature {
                        headers.push(format!(
                            "X-Matrix origin=\"{origin}\",destination=\"{destination}\",key=\"{key_id}\",sig=\"{signature}\"",
                        ));
                    }
                }
            }
        }
        if headers.is_empty() {
            return Err(Error::Signing("request signature missing".to_owned()));
        }
        Ok(headers)
    }
}

#[async_trait]
impl FederationClient for HttpFederationClient {
    async fn send_request(
        &self,
        destination: &ServerName,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<JsonValue>,
        timeout: Duration,
    ) -> Result<FederationResponse> {
        let uri = format!("{path}{}", query_string(query));
        let url = if destination.port().is_some() {
            format!("https://{destination}{uri}")
        } else {
            format!("https://{destination}:8448{uri}")
        };
        debug!(%destination, %method, %path, "sending federation request");

        let mut request = match method {
            Method::Get => self.client.get(&url),
            Method::Put => self.client.put(&url),
            Method::Post => self.client.post(&url),
        }
        .timeout(timeout);

        for header in self.signature_headers(destination, method, &uri, body.as_ref())? {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout
            } else {
                Error::Federation(format!("request to {destination} failed: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .json::<JsonValue>()
            .await
            .unwrap_or_else(|e| {
                warn!(%destination, status, error = %e, "non-JSON federation response body");
                JsonValue::Object(serde_json::Map::new())
            });
        Ok(FederationResponse { status, body })
    }
}
