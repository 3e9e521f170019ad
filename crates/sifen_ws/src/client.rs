use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::{envelope, response, ClientCredential, RemoteReply, SifenClient, TransportError};

/// The four URL-configured endpoints of the authority. The QR base URL is
/// used only during signing and never called directly.
#[derive(Debug, Clone)]
pub struct SifenEndpoints {
    pub batch_submit_url: String,
    pub batch_query_url: String,
    pub event_url: String,
}

/// SOAP client for the SIFEN web services.
///
/// HTTP clients are cached per certificate path because the TLS identity is
/// bound to the client at construction time and invoices may reference
/// different certificates.
pub struct SoapClient {
    endpoints: SifenEndpoints,
    timeout: Duration,
    http_clients: RwLock<HashMap<String, reqwest::Client>>,
}

impl SoapClient {
    pub fn new(endpoints: SifenEndpoints, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            timeout,
            http_clients: RwLock::new(HashMap::new()),
        })
    }

    async fn http_client(&self, cert_path: &str) -> Result<reqwest::Client, TransportError> {
        {
            let cached = self.http_clients.read().await;
            if let Some(client) = cached.get(cert_path) {
                return Ok(client.clone());
            }
        }

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .tcp_keepalive(Duration::from_secs(60));

        if !cert_path.is_empty() {
            let bundle = tokio::fs::read(cert_path)
                .await
                .map_err(|e| TransportError::Identity(format!("{cert_path}: {e}")))?;
            let identity = reqwest::Identity::from_pem(&bundle)
                .map_err(|e| TransportError::Identity(format!("{cert_path}: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Identity(e.to_string()))?;

        let mut cached = self.http_clients.write().await;
        cached.insert(cert_path.to_string(), client.clone());
        Ok(client)
    }

    async fn post_soap(
        &self,
        url: &str,
        body: String,
        credential: &ClientCredential,
    ) -> Result<String, TransportError> {
        let client = self.http_client(&credential.cert_path).await?;

        tracing::debug!(%url, "sending SOAP request to SIFEN");
        let resp = client
            .post(url)
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(body)
            .send()
            .await
            .map_err(|source| TransportError::Http { url: url.to_string(), source })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|source| TransportError::Http { url: url.to_string(), source })?;

        // The authority returns 400 with a meaningful SOAP body for many
        // business rejections; those must reach the classifier.
        if !status.is_success() {
            if looks_like_xml(&text) {
                tracing::warn!(%url, status = status.as_u16(), "SIFEN returned an error status with a SOAP body, classifying it");
            } else {
                return Err(TransportError::BadStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
        }

        Ok(text)
    }
}

fn looks_like_xml(body: &str) -> bool {
    !body.is_empty()
        && (body.contains("<?xml")
            || body.contains("<env:Envelope")
            || body.contains("<soap:Envelope")
            || body.contains("<Envelope"))
}

#[async_trait]
impl SifenClient for SoapClient {
    async fn submit_batch(
        &self,
        payload_b64: &str,
        credential: &ClientCredential,
    ) -> Result<RemoteReply, TransportError> {
        let body = envelope::batch_envelope(&envelope::request_id(), payload_b64);
        let raw = self
            .post_soap(&self.endpoints.batch_submit_url, body, credential)
            .await?;
        Ok(RemoteReply { outcome: response::classify_batch_receipt(&raw), raw })
    }

    async fn query_batch(
        &self,
        protocol: &str,
        credential: &ClientCredential,
    ) -> Result<RemoteReply, TransportError> {
        let body = envelope::query_envelope(&envelope::request_id(), protocol);
        let raw = self
            .post_soap(&self.endpoints.batch_query_url, body, credential)
            .await?;
        Ok(RemoteReply { outcome: response::classify_query_result(&raw), raw })
    }

    async fn submit_event(
        &self,
        event_xml: &str,
        credential: &ClientCredential,
    ) -> Result<RemoteReply, TransportError> {
        let body = envelope::event_envelope(&envelope::request_id(), event_xml);
        let raw = self
            .post_soap(&self.endpoints.event_url, body, credential)
            .await?;
        Ok(RemoteReply { outcome: response::classify_event_result(&raw), raw })
    }
}
