use async_trait::async_trait;
use sifen_core::RemoteOutcome;
use thiserror::Error;

/// A parsed remote response plus the raw SOAP body, which the stages persist
/// verbatim alongside the classified outcome.
#[derive(Debug, Clone)]
pub struct RemoteReply {
    pub outcome: RemoteOutcome,
    pub raw: String,
}

/// Transport-level failure: the request never produced a readable SOAP body.
/// Business-level rejections are `RemoteOutcome` variants, not errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status} without a parseable SOAP body")]
    BadStatus { url: String, status: u16 },
    #[error("client certificate unusable: {0}")]
    Identity(String),
}

/// TLS client-certificate reference for a request, taken from the invoice
/// row. An empty path means no client identity is attached.
#[derive(Debug, Clone, Default)]
pub struct ClientCredential {
    pub cert_path: String,
}

/// Remote SIFEN service boundary shared by the send, query and cancel
/// stages. Implementations build the endpoint framing, send the request and
/// classify the structured response.
#[async_trait]
pub trait SifenClient: Send + Sync {
    /// Submits a packed batch (`recebe-lote`).
    async fn submit_batch(
        &self,
        payload_b64: &str,
        credential: &ClientCredential,
    ) -> Result<RemoteReply, TransportError>;

    /// Polls the processing status of a batch (`consulta-lote`).
    async fn query_batch(
        &self,
        protocol: &str,
        credential: &ClientCredential,
    ) -> Result<RemoteReply, TransportError>;

    /// Submits a signed cancellation event (`evento`).
    async fn submit_event(
        &self,
        event_xml: &str,
        credential: &ClientCredential,
    ) -> Result<RemoteReply, TransportError>;
}

pub mod client;
pub mod envelope;
pub mod mock;
pub mod response;
