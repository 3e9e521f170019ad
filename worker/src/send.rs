//! Send stage: sign, pack and submit a batch, then schedule the follow-up
//! status consultation.

use queue::{write_audit_event, AuditEvent};
use sifen_core::models::STATUS_AWAITING_QUERY;
use sifen_core::sign::{sign_document, QrParams, SigningCredential};
use sifen_core::{RemoteOutcome, WorkItem};
use sifen_ws::envelope::pack_batch_payload;
use store::{InvoiceRecord, OutcomeUpdate};

use crate::dispatcher::{credential_for, summary_code, Dispatcher, Disposition};

const AWAITING_DESC: &str = "Lote recebido. Aguardando consulta de status.";

impl Dispatcher {
    pub(crate) async fn send(&self, item: &WorkItem, record: InvoiceRecord) -> Disposition {
        let id = record.id;

        if record.xml.trim().is_empty() {
            return Disposition::Reject(format!("invoice {id} has no source XML"));
        }
        if record.cert_path.trim().is_empty() {
            return Disposition::Reject(format!("invoice {id} has no certificate path"));
        }

        // A protocol on record means an earlier delivery already submitted
        // this batch; resubmitting would duplicate the lote.
        if !record.protocol.trim().is_empty() {
            tracing::info!(
                invoice_id = id,
                protocol = %record.protocol,
                "batch already submitted, scheduling consultation only"
            );
            // The first delivery may have crashed between the emission and
            // summary writes; while the emission still says "awaiting", both
            // records are re-written so the summary catches up. Terminal
            // statuses are left untouched.
            if record.status_code == STATUS_AWAITING_QUERY {
                let update = OutcomeUpdate::status(STATUS_AWAITING_QUERY, AWAITING_DESC);
                if self.store.save_outcome(id, update).await.is_err() {
                    return Disposition::Requeue;
                }
                if self
                    .store
                    .save_summary(id, summary_code(STATUS_AWAITING_QUERY), AWAITING_DESC)
                    .await
                    .is_err()
                {
                    return Disposition::Requeue;
                }
            }
            if self.scheduler.schedule_query(id, 1).await.is_err() {
                return Disposition::Requeue;
            }
            return Disposition::Ack;
        }

        let credential = match SigningCredential::from_pem_file(&record.cert_path) {
            Ok(credential) => credential,
            Err(err) => {
                tracing::error!(invoice_id = id, error = %err, "unusable signing credential");
                return self
                    .persist_send_failure(
                        item,
                        id,
                        "ERRO_FIRMA",
                        &format!("Falha na assinatura: {err}"),
                        None,
                        None,
                    )
                    .await;
            }
        };

        let qr = QrParams {
            base_url: &self.qr_base,
            csc: &record.csc,
            csc_id: &record.csc_id,
        };
        let signed = match sign_document(&record.xml, &credential, &qr) {
            Ok(signed) => signed,
            Err(err) => {
                tracing::error!(invoice_id = id, error = %err, "signing failed");
                return self
                    .persist_send_failure(
                        item,
                        id,
                        "ERRO_FIRMA",
                        &format!("Falha na assinatura: {err}"),
                        None,
                        None,
                    )
                    .await;
            }
        };

        let payload = match pack_batch_payload(&signed) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(invoice_id = id, error = %err, "batch packaging failed");
                return self
                    .persist_send_failure(
                        item,
                        id,
                        "ERRO_LOTE",
                        &format!("Falha ao montar o lote: {err}"),
                        Some(signed),
                        None,
                    )
                    .await;
            }
        };

        let reply = match self
            .client
            .submit_batch(&payload, &credential_for(&record))
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!(invoice_id = id, error = %err, "batch submission failed");
                return self
                    .persist_send_failure(
                        item,
                        id,
                        "999",
                        &format!("Falha no envio: {err}"),
                        Some(signed),
                        None,
                    )
                    .await;
            }
        };

        match reply.outcome {
            RemoteOutcome::Approved(tracking) => {
                let protocol = tracking.protocol.unwrap_or_default();
                let update = OutcomeUpdate::status(STATUS_AWAITING_QUERY, AWAITING_DESC)
                    .with_signed_xml(signed)
                    .with_return_xml(reply.raw)
                    .with_protocol(protocol.clone());
                if self.store.save_outcome(id, update).await.is_err() {
                    return Disposition::Requeue;
                }
                if self
                    .store
                    .save_summary(id, summary_code(STATUS_AWAITING_QUERY), AWAITING_DESC)
                    .await
                    .is_err()
                {
                    return Disposition::Requeue;
                }
                if self.scheduler.schedule_query(id, 1).await.is_err() {
                    return Disposition::Requeue;
                }

                tracing::info!(invoice_id = id, protocol = %protocol, "batch accepted");
                let _ = write_audit_event(
                    &AuditEvent::new("batch_accepted", id, item.action.wire_name(), "900")
                        .with_protocol(protocol),
                );
                Disposition::Ack
            }
            RemoteOutcome::Rejected { code, reason } => {
                tracing::warn!(invoice_id = id, code = %code, reason = %reason, "batch rejected");
                self.persist_send_failure(
                    item,
                    id,
                    &code,
                    &format!("Falha no envio: {reason}"),
                    Some(signed),
                    Some(reply.raw),
                )
                .await
            }
            other => {
                tracing::error!(invoice_id = id, ?other, "unexpected batch receipt outcome");
                self.persist_send_failure(
                    item,
                    id,
                    "999",
                    "Falha no envio: retorno inesperado",
                    Some(signed),
                    Some(reply.raw),
                )
                .await
            }
        }
    }

    /// Terminal send failure: persisted to both records, no retry.
    async fn persist_send_failure(
        &self,
        item: &WorkItem,
        id: i64,
        code: &str,
        desc: &str,
        signed_xml: Option<String>,
        return_xml: Option<String>,
    ) -> Disposition {
        let mut update = OutcomeUpdate::status(code, desc);
        if let Some(xml) = signed_xml {
            update = update.with_signed_xml(xml);
        }
        if let Some(xml) = return_xml {
            update = update.with_return_xml(xml);
        }
        if self.store.save_outcome(id, update).await.is_err() {
            return Disposition::Requeue;
        }
        if self
            .store
            .save_summary(id, summary_code(code), desc)
            .await
            .is_err()
        {
            return Disposition::Requeue;
        }
        let _ = write_audit_event(
            &AuditEvent::new("batch_failed", id, item.action.wire_name(), code)
                .with_error(desc.to_string()),
        );
        Disposition::Ack
    }
}
