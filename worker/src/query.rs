//! Query stage: polls the batch status until a terminal outcome or the
//! attempt bound.

use queue::{write_audit_event, AuditEvent};
use sifen_core::models::{
    MAX_QUERY_ATTEMPTS, STATUS_AWAITING_QUERY, STATUS_RETRIES_EXCEEDED,
};
use sifen_core::{RemoteOutcome, WorkItem};
use store::{InvoiceRecord, OutcomeUpdate};

use crate::dispatcher::{credential_for, summary_code, Dispatcher, Disposition};

const EXCEEDED_DESC: &str = "Excedeu o limite de tentativas de consulta.";
const REPROCESSING_DESC: &str = "Reprocessando consulta";

impl Dispatcher {
    pub(crate) async fn query(&self, item: &WorkItem, record: InvoiceRecord) -> Disposition {
        let id = record.id;

        // Redeliveries of an already-exhausted consultation are a no-op.
        if record.status_code == STATUS_RETRIES_EXCEEDED {
            tracing::info!(invoice_id = id, "already terminal at 998, ignoring redelivery");
            return Disposition::Ack;
        }

        if record.protocol.trim().is_empty() {
            return Disposition::Reject(format!(
                "invoice {id} has no batch protocol to consult"
            ));
        }

        let reply = match self
            .client
            .query_batch(&record.protocol, &credential_for(&record))
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                // Unreachable service reads as "not done yet": retry inside
                // the same attempt budget.
                tracing::warn!(invoice_id = id, error = %err, "consultation transport error");
                return self.reschedule_or_exhaust(item, id, None).await;
            }
        };

        match reply.outcome {
            RemoteOutcome::Approved(tracking) => {
                let desc = "Aprobado exitosamente.";
                let update = OutcomeUpdate::status(&tracking.code, desc)
                    .with_return_xml(reply.raw);
                if self.store.save_outcome(id, update).await.is_err() {
                    return Disposition::Requeue;
                }
                if self
                    .store
                    .save_summary(id, summary_code(&tracking.code), desc)
                    .await
                    .is_err()
                {
                    return Disposition::Requeue;
                }
                tracing::info!(invoice_id = id, code = %tracking.code, "invoice approved");
                let _ = write_audit_event(&AuditEvent::new(
                    "query_approved",
                    id,
                    item.action.wire_name(),
                    &tracking.code,
                ));
                Disposition::Ack
            }
            RemoteOutcome::Rejected { code, reason } => {
                let desc = format!("Rejeitado: {reason}");
                let update = OutcomeUpdate::status(&code, &desc).with_return_xml(reply.raw);
                if self.store.save_outcome(id, update).await.is_err() {
                    return Disposition::Requeue;
                }
                if self
                    .store
                    .save_summary(id, summary_code(&code), &desc)
                    .await
                    .is_err()
                {
                    return Disposition::Requeue;
                }
                tracing::warn!(invoice_id = id, code = %code, reason = %reason, "invoice rejected");
                let _ = write_audit_event(
                    &AuditEvent::new("query_rejected", id, item.action.wire_name(), &code)
                        .with_error(reason),
                );
                Disposition::Ack
            }
            RemoteOutcome::TransientError { code } => {
                // Known remote glitch: the consultation itself failed, not
                // the batch. Retry with the same attempt so the glitch never
                // eats into the budget.
                tracing::warn!(invoice_id = id, code = %code, "transient remote glitch, re-consulting");
                let update = OutcomeUpdate::status(STATUS_AWAITING_QUERY, REPROCESSING_DESC)
                    .with_return_xml(reply.raw);
                if self.store.save_outcome(id, update).await.is_err() {
                    return Disposition::Requeue;
                }
                if self
                    .store
                    .save_summary(id, summary_code(STATUS_AWAITING_QUERY), REPROCESSING_DESC)
                    .await
                    .is_err()
                {
                    return Disposition::Requeue;
                }
                if self
                    .scheduler
                    .schedule_query(id, item.attempt)
                    .await
                    .is_err()
                {
                    return Disposition::Requeue;
                }
                Disposition::Ack
            }
            RemoteOutcome::StillProcessing => {
                self.reschedule_or_exhaust(item, id, Some(reply.raw)).await
            }
            other => {
                tracing::error!(invoice_id = id, ?other, "unexpected consultation outcome");
                self.reschedule_or_exhaust(item, id, Some(reply.raw)).await
            }
        }
    }

    /// Attempt bound bookkeeping for the "not done yet" cases.
    async fn reschedule_or_exhaust(
        &self,
        item: &WorkItem,
        id: i64,
        return_xml: Option<String>,
    ) -> Disposition {
        if item.attempt < MAX_QUERY_ATTEMPTS {
            tracing::info!(
                invoice_id = id,
                attempt = item.attempt,
                "batch still processing, rescheduling"
            );
            if self
                .scheduler
                .schedule_query(id, item.attempt + 1)
                .await
                .is_err()
            {
                return Disposition::Requeue;
            }
            return Disposition::Ack;
        }

        tracing::error!(invoice_id = id, attempts = item.attempt, "consultation budget exhausted");
        let mut update = OutcomeUpdate::status(STATUS_RETRIES_EXCEEDED, EXCEEDED_DESC);
        if let Some(xml) = return_xml {
            update = update.with_return_xml(xml);
        }
        if self.store.save_outcome(id, update).await.is_err() {
            return Disposition::Requeue;
        }
        if self
            .store
            .save_summary(id, summary_code(STATUS_RETRIES_EXCEEDED), EXCEEDED_DESC)
            .await
            .is_err()
        {
            return Disposition::Requeue;
        }
        let _ = write_audit_event(
            &AuditEvent::new(
                "retries_exceeded",
                id,
                item.action.wire_name(),
                STATUS_RETRIES_EXCEEDED,
            )
            .with_attempt(item.attempt),
        );
        Disposition::Ack
    }
}
