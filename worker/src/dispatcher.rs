//! Routes claimed jobs to the lifecycle stages.

use std::sync::Arc;

use queue::RetryScheduler;
use sifen_core::{Action, WorkItem};
use sifen_ws::SifenClient;
use store::InvoiceRecord;
use store::InvoiceStore;

/// What to do with the claimed job once a stage has run. Every job gets
/// exactly one disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove from the queue.
    Ack,
    /// Infrastructure hiccup; release the claim for redelivery.
    Requeue,
    /// Unprocessable; dead-letter with the reason.
    Reject(String),
}

pub struct Dispatcher {
    pub(crate) store: Arc<dyn InvoiceStore>,
    pub(crate) client: Arc<dyn SifenClient>,
    pub(crate) scheduler: Arc<dyn RetryScheduler>,
    /// Base URL stamped into the QR payload of signed documents.
    pub(crate) qr_base: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        client: Arc<dyn SifenClient>,
        scheduler: Arc<dyn RetryScheduler>,
        qr_base: String,
    ) -> Self {
        Self {
            store,
            client,
            scheduler,
            qr_base,
        }
    }

    pub async fn dispatch(&self, body: &[u8]) -> Disposition {
        let item = match WorkItem::decode(body) {
            Ok(item) => item,
            Err(err) => {
                tracing::error!(error = %err, "undecodable work item");
                return Disposition::Reject(err.to_string());
            }
        };

        let record = match self.store.load_invoice(item.invoice_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::error!(invoice_id = item.invoice_id, "invoice not found");
                return Disposition::Reject(format!(
                    "invoice {} not found",
                    item.invoice_id
                ));
            }
            Err(err) => {
                tracing::warn!(invoice_id = item.invoice_id, error = %err, "store unavailable");
                return Disposition::Requeue;
            }
        };

        // Both denormalized records must exist before a stage may run; a
        // missing summary row would leave a transition half-applied.
        match self.store.load_summary(item.invoice_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::error!(invoice_id = item.invoice_id, "summary record not found");
                return Disposition::Reject(format!(
                    "invoice {} has no summary record",
                    item.invoice_id
                ));
            }
            Err(err) => {
                tracing::warn!(invoice_id = item.invoice_id, error = %err, "store unavailable");
                return Disposition::Requeue;
            }
        }

        tracing::info!(
            invoice_id = item.invoice_id,
            action = item.action.wire_name(),
            attempt = item.attempt,
            "processing work item"
        );

        match item.action {
            Action::Send => self.send(&item, record).await,
            Action::Query => self.query(&item, record).await,
            Action::Cancel => self.cancel(&item, record).await,
        }
    }
}

/// Summary-table statuses are numeric; non-numeric emission codes leave the
/// previous summary code in place.
pub(crate) fn summary_code(code: &str) -> Option<i32> {
    code.parse().ok()
}

pub(crate) fn credential_for(record: &InvoiceRecord) -> sifen_ws::ClientCredential {
    sifen_ws::ClientCredential {
        cert_path: record.cert_path.clone(),
    }
}
