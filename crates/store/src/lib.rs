//! Persistence boundary for invoice state.
//!
//! The store is the single source of truth: handlers read, decide, and write
//! through this interface without caching rows across work items. Two
//! denormalized records exist per invoice: the emission record carrying the
//! XML bodies and credentials, and a summary record exposing only the status
//! pair. Both are kept in sync on every transition.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invoice {0} not found")]
    NotFound(i64),
}

/// Emission record: one row per issued document, holding the raw and signed
/// XML bodies, the signing credential reference and the remote tracking
/// state. Column names follow the legacy `tb_de_emissao` schema.
#[derive(Debug, Clone, Default)]
pub struct InvoiceRecord {
    pub id: i64,
    /// Raw document body as produced by the issuing system.
    pub xml: String,
    /// Body after signing and QR embedding.
    pub signed_xml: String,
    /// Last response body returned by the authority.
    pub return_xml: String,
    pub cancel_request_xml: String,
    pub cancel_return_xml: String,
    /// Path to the PEM credential bundle used for signing and TLS.
    pub cert_path: String,
    /// Credential secret as stored with the row.
    pub cert_secret: String,
    pub csc_id: String,
    /// Taxpayer security code combined into the QR digest.
    pub csc: String,
    /// Batch tracking token; set once on successful submission.
    pub protocol: String,
    pub status_code: String,
    pub status_desc: String,
    pub document_type: Option<i32>,
}

/// Denormalized status counterpart (`tb_de_documento`).
#[derive(Debug, Clone, Default)]
pub struct SummaryRecord {
    pub id: i64,
    pub status_code: Option<i32>,
    pub status_desc: String,
}

/// Field set written by a stage outcome. Status code and description are
/// mandatory and always written together; the XML bodies and the protocol
/// are written only by the stages that produce them.
#[derive(Debug, Clone, Default)]
pub struct OutcomeUpdate {
    pub status_code: String,
    pub status_desc: String,
    pub signed_xml: Option<String>,
    pub return_xml: Option<String>,
    pub protocol: Option<String>,
    pub cancel_request_xml: Option<String>,
    pub cancel_return_xml: Option<String>,
}

impl OutcomeUpdate {
    pub fn status(code: impl Into<String>, desc: impl Into<String>) -> Self {
        Self { status_code: code.into(), status_desc: desc.into(), ..Self::default() }
    }

    pub fn with_signed_xml(mut self, xml: impl Into<String>) -> Self {
        self.signed_xml = Some(xml.into());
        self
    }

    pub fn with_return_xml(mut self, xml: impl Into<String>) -> Self {
        self.return_xml = Some(xml.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_cancel_request_xml(mut self, xml: impl Into<String>) -> Self {
        self.cancel_request_xml = Some(xml.into());
        self
    }

    pub fn with_cancel_return_xml(mut self, xml: impl Into<String>) -> Self {
        self.cancel_return_xml = Some(xml.into());
        self
    }
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Latest emission record for the invoice, or `None`.
    async fn load_invoice(&self, id: i64) -> Result<Option<InvoiceRecord>, StoreError>;

    /// Summary-status counterpart of the invoice, or `None`.
    async fn load_summary(&self, id: i64) -> Result<Option<SummaryRecord>, StoreError>;

    /// Applies a stage outcome to the emission record. Fields left `None`
    /// keep their current value.
    async fn save_outcome(&self, id: i64, update: OutcomeUpdate) -> Result<(), StoreError>;

    /// Updates the summary record status pair. A `None` code keeps the
    /// current code (the authority occasionally returns non-numeric ones).
    async fn save_summary(
        &self,
        id: i64,
        status_code: Option<i32>,
        status_desc: &str,
    ) -> Result<(), StoreError>;
}
