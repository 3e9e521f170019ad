//! Cancel stage: builds and submits the signed cancellation event for an
//! approved document.

use queue::{write_audit_event, AuditEvent};
use sifen_core::models::STATUS_SUMMARY_CANCELLED;
use sifen_core::sign::{sign_cancellation_event, SigningCredential};
use sifen_core::xml::extract_cdc;
use sifen_core::{RemoteOutcome, WorkItem};
use store::{InvoiceRecord, OutcomeUpdate};

use crate::dispatcher::{credential_for, Dispatcher, Disposition};

impl Dispatcher {
    pub(crate) async fn cancel(&self, item: &WorkItem, record: InvoiceRecord) -> Disposition {
        let id = record.id;

        if record.signed_xml.trim().is_empty() {
            return Disposition::Reject(format!(
                "invoice {id} has no signed document to cancel"
            ));
        }
        let cdc = match extract_cdc(&record.signed_xml) {
            Some(cdc) => cdc,
            None => {
                tracing::error!(invoice_id = id, "CDC not found in signed document");
                return Disposition::Reject(format!("invoice {id} has no CDC"));
            }
        };

        let reason = item
            .reason
            .as_deref()
            .unwrap_or("Solicitud de cancelacion");

        let credential = match SigningCredential::from_pem_file(&record.cert_path) {
            Ok(credential) => credential,
            Err(err) => {
                tracing::error!(invoice_id = id, error = %err, "unusable signing credential");
                return self
                    .persist_cancel_failure(item, id, "ERRO_FIRMA", &err.to_string(), None, None)
                    .await;
            }
        };
        let event_xml = match sign_cancellation_event(&cdc, reason, &credential) {
            Ok(xml) => xml,
            Err(err) => {
                tracing::error!(invoice_id = id, error = %err, "cancellation event signing failed");
                return self
                    .persist_cancel_failure(item, id, "ERRO_FIRMA", &err.to_string(), None, None)
                    .await;
            }
        };

        let reply = match self
            .client
            .submit_event(&event_xml, &credential_for(&record))
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                // The event never reached the authority; redeliver the job
                // rather than recording a rejection that did not happen.
                tracing::warn!(invoice_id = id, error = %err, "event transport error");
                return Disposition::Requeue;
            }
        };

        match reply.outcome {
            RemoteOutcome::CancellationApproved {
                code,
                message,
                protocol,
            } => {
                let desc = format!("Cancelado: {message}");
                let update = OutcomeUpdate::status(&code, &desc)
                    .with_cancel_request_xml(event_xml)
                    .with_cancel_return_xml(reply.raw);
                if self.store.save_outcome(id, update).await.is_err() {
                    return Disposition::Requeue;
                }
                if self
                    .store
                    .save_summary(id, Some(STATUS_SUMMARY_CANCELLED), "Nota Cancelada")
                    .await
                    .is_err()
                {
                    return Disposition::Requeue;
                }
                tracing::info!(invoice_id = id, code = %code, protocol = ?protocol, "cancellation approved");
                let mut event =
                    AuditEvent::new("cancel_approved", id, item.action.wire_name(), &code);
                if let Some(protocol) = protocol {
                    event = event.with_protocol(protocol);
                }
                let _ = write_audit_event(&event);
                Disposition::Ack
            }
            RemoteOutcome::CancellationRejected { code, reason } => {
                tracing::warn!(invoice_id = id, code = %code, reason = %reason, "cancellation rejected");
                self.persist_cancel_failure(
                    item,
                    id,
                    &code,
                    &reason,
                    Some(event_xml),
                    Some(reply.raw),
                )
                .await
            }
            other => {
                tracing::error!(invoice_id = id, ?other, "unexpected event outcome");
                self.persist_cancel_failure(
                    item,
                    id,
                    "ERRO_PARSE",
                    "retorno inesperado",
                    Some(event_xml),
                    Some(reply.raw),
                )
                .await
            }
        }
    }

    /// Failed cancellation: recorded on the emission record only, the
    /// summary keeps its approved status.
    async fn persist_cancel_failure(
        &self,
        item: &WorkItem,
        id: i64,
        code: &str,
        reason: &str,
        event_xml: Option<String>,
        return_xml: Option<String>,
    ) -> Disposition {
        let desc = format!("Erro no cancelamento: {reason}");
        let mut update = OutcomeUpdate::status(code, &desc);
        if let Some(xml) = event_xml {
            update = update.with_cancel_request_xml(xml);
        }
        if let Some(xml) = return_xml {
            update = update.with_cancel_return_xml(xml);
        }
        if self.store.save_outcome(id, update).await.is_err() {
            return Disposition::Requeue;
        }
        let _ = write_audit_event(
            &AuditEvent::new("cancel_rejected", id, item.action.wire_name(), code)
                .with_error(reason.to_string()),
        );
        Disposition::Ack
    }
}
