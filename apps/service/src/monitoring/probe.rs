use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use url::Url;

use super::types::Method;

/// Hard per-request transfer timeout.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// A single outgoing probe exchange, fully described by value.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub url: Url,
    pub method: Method,
    /// Raw headers to attach (the user-agent is carried separately).
    pub headers: Vec<(String, String)>,
    pub user_agent: String,
    /// MIME type for body-bearing methods.
    pub content_type: Option<&'static str>,
    pub body: Option<Vec<u8>>,
}

/// Completed exchange as seen by the monitor state machine.
///
/// An HTTP status of 4xx/5xx still counts as a transport success; only
/// timeouts, connection and TLS failures land in the error arm.
#[derive(Debug, Clone)]
pub struct ProbeReply {
    pub outcome: std::result::Result<Vec<u8>, String>,
    /// Peer certificate `not_after`, Unix seconds, when the reply carried one.
    pub certificate_expiration: Option<u64>,
}

/// Driver for probe exchanges. The production implementation wraps a shared
/// reqwest client; tests substitute scripted drivers.
#[async_trait]
pub trait ProbeDriver: Send + Sync {
    async fn execute(&self, request: ProbeRequest) -> ProbeReply;
}

/// reqwest-backed probe driver shared by every monitor on a worker.
pub struct HttpProbeDriver {
    client: reqwest::Client,
}

impl HttpProbeDriver {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(TRANSFER_TIMEOUT)
            .tls_info(true)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ProbeDriver for HttpProbeDriver {
    async fn execute(&self, request: ProbeRequest) -> ProbeReply {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Options => reqwest::Method::OPTIONS,
            Method::Patch => reqwest::Method::PATCH,
        };

        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = builder.header(reqwest::header::USER_AGENT, request.user_agent);

        if let Some(body) = request.body {
            if let Some(content_type) = request.content_type {
                builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
            }
            builder = builder.header(reqwest::header::CONTENT_LENGTH, body.len());
            builder = builder.body(body);
        } else {
            builder = builder.header(reqwest::header::CONTENT_LENGTH, 0);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(error) => {
                return ProbeReply { outcome: Err(error.to_string()), certificate_expiration: None }
            }
        };

        let certificate_expiration = peer_certificate_expiration(&response);

        match response.bytes().await {
            Ok(body) => ProbeReply { outcome: Ok(body.to_vec()), certificate_expiration },
            Err(error) => ProbeReply { outcome: Err(error.to_string()), certificate_expiration },
        }
    }
}

/// Extract the peer certificate `not_after` timestamp from a TLS response.
fn peer_certificate_expiration(response: &reqwest::Response) -> Option<u64> {
    let tls_info = response.extensions().get::<reqwest::tls::TlsInfo>()?;
    let der = tls_info.peer_certificate()?;
    let (_, certificate) = x509_parser::parse_x509_certificate(der).ok()?;
    let timestamp = certificate.validity().not_after.timestamp();
    u64::try_from(timestamp).ok()
}
