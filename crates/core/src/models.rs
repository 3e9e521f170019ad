use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status persisted when the authority approves a document.
pub const STATUS_APPROVED: &str = "0201";
/// Status persisted when the authority rejects a batch.
pub const STATUS_REJECTED: &str = "0300";
/// Batch received, waiting for the status consultation.
pub const STATUS_AWAITING_QUERY: &str = "900";
/// Gave up after the consultation attempt bound.
pub const STATUS_RETRIES_EXCEEDED: &str = "998";
/// Summary-record status for a cancelled document.
pub const STATUS_SUMMARY_CANCELLED: i32 = 600;

/// Response codes the authority uses for an accepted cancellation event.
pub const CANCELLATION_SUCCESS_CODES: [&str; 3] = ["0500", "0501", "0600"];

/// Remote-side glitch code that is always retry-safe when paired with the
/// "XML Mal Formado." message.
pub const TRANSIENT_MALFORMED_CODE: &str = "0160";
pub const TRANSIENT_MALFORMED_MESSAGE: &str = "XML Mal Formado.";

/// Maximum number of consultation cycles before persisting `998`.
pub const MAX_QUERY_ATTEMPTS: u32 = 10;

/// SIFEN format version carried in signed documents and QR payloads.
pub const SIFEN_VERSION: &str = "150";

const MIN_CANCELLATION_REASON_LEN: usize = 5;

/// Lifecycle action carried on the wire as `acao`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Send,
    Query,
    Cancel,
}

impl Action {
    pub fn wire_name(self) -> &'static str {
        match self {
            Action::Send => "enviar",
            Action::Query => "consultar",
            Action::Cancel => "cancelar",
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkItemError {
    #[error("malformed work item: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("work item is missing id_fatura")]
    MissingInvoiceId,
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("cancellation reason is required and must have at least {MIN_CANCELLATION_REASON_LEN} characters")]
    InvalidReason,
}

/// One unit of queue traffic. Exists only between publish and ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub invoice_id: i64,
    pub action: Action,
    /// Consultation cycle counter, meaningful for `Query` only.
    pub attempt: u32,
    /// Cancellation reason, present for `Cancel` only.
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireItem {
    id_fatura: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    acao: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tentativas: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    motivo: Option<String>,
}

impl WorkItem {
    pub fn send(invoice_id: i64) -> Self {
        Self { invoice_id, action: Action::Send, attempt: 1, reason: None }
    }

    pub fn query(invoice_id: i64, attempt: u32) -> Self {
        Self { invoice_id, action: Action::Query, attempt, reason: None }
    }

    pub fn cancel(invoice_id: i64, reason: &str) -> Result<Self, WorkItemError> {
        if reason.trim().len() < MIN_CANCELLATION_REASON_LEN {
            return Err(WorkItemError::InvalidReason);
        }
        Ok(Self {
            invoice_id,
            action: Action::Cancel,
            attempt: 1,
            reason: Some(reason.to_string()),
        })
    }

    /// Decodes the JSON wire form, resolving the action exactly once.
    ///
    /// Absent `acao` defaults to `enviar`; unknown values are rejected here
    /// rather than falling through to a stage handler.
    pub fn decode(body: &[u8]) -> Result<Self, WorkItemError> {
        let wire: WireItem = serde_json::from_slice(body)?;
        let invoice_id = wire.id_fatura.ok_or(WorkItemError::MissingInvoiceId)?;

        let action = match wire.acao.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("enviar") => Action::Send,
            Some("consultar") => Action::Query,
            Some("cancelar") => Action::Cancel,
            Some(other) => return Err(WorkItemError::UnknownAction(other.to_string())),
        };

        let reason = match action {
            Action::Cancel => {
                let motivo = wire.motivo.unwrap_or_default();
                if motivo.trim().len() < MIN_CANCELLATION_REASON_LEN {
                    return Err(WorkItemError::InvalidReason);
                }
                Some(motivo)
            }
            _ => None,
        };

        Ok(Self {
            invoice_id,
            action,
            attempt: wire.tentativas.unwrap_or(1).max(1),
            reason,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, WorkItemError> {
        let wire = WireItem {
            id_fatura: Some(self.invoice_id),
            acao: match self.action {
                Action::Send => None,
                other => Some(other.wire_name().to_string()),
            },
            tentativas: match self.action {
                Action::Query => Some(self.attempt),
                _ => None,
            },
            motivo: self.reason.clone(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }
}

/// Tracking information returned with a positive remote response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingInfo {
    /// Response code, e.g. `0201` on approval.
    pub code: String,
    /// Batch tracking token, present after submission.
    pub protocol: Option<String>,
    pub message: String,
}

/// Classification of a remote response, consumed by exhaustive matching in
/// the stage handlers. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    Approved(TrackingInfo),
    Rejected { code: String, reason: String },
    TransientError { code: String },
    StillProcessing,
    CancellationApproved { code: String, message: String, protocol: Option<String> },
    CancellationRejected { code: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_defaults_to_send() {
        let item = WorkItem::decode(br#"{"id_fatura": 123}"#).unwrap();
        assert_eq!(item.invoice_id, 123);
        assert_eq!(item.action, Action::Send);
        assert_eq!(item.attempt, 1);
    }

    #[test]
    fn decode_normalizes_action_case() {
        let item = WorkItem::decode(br#"{"id_fatura": 1, "acao": "Consultar", "tentativas": 4}"#)
            .unwrap();
        assert_eq!(item.action, Action::Query);
        assert_eq!(item.attempt, 4);
    }

    #[test]
    fn decode_rejects_unknown_action() {
        let err = WorkItem::decode(br#"{"id_fatura": 1, "acao": "reenviar"}"#).unwrap_err();
        assert!(matches!(err, WorkItemError::UnknownAction(a) if a == "reenviar"));
    }

    #[test]
    fn decode_rejects_missing_invoice_id() {
        let err = WorkItem::decode(br#"{"acao": "enviar"}"#).unwrap_err();
        assert!(matches!(err, WorkItemError::MissingInvoiceId));
    }

    #[test]
    fn cancel_requires_reason_of_five_chars() {
        assert!(matches!(
            WorkItem::decode(br#"{"id_fatura": 1, "acao": "cancelar", "motivo": "abc"}"#),
            Err(WorkItemError::InvalidReason)
        ));
        assert!(matches!(WorkItem::cancel(1, "  ab  "), Err(WorkItemError::InvalidReason)));

        let item = WorkItem::cancel(1, "Erro de digita\u{e7}\u{e3}o").unwrap();
        assert_eq!(item.action, Action::Cancel);
    }

    #[test]
    fn query_item_round_trips_with_attempt() {
        let item = WorkItem::query(42, 7);
        let body = item.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["acao"], "consultar");
        assert_eq!(json["tentativas"], 7);
        assert_eq!(WorkItem::decode(&body).unwrap(), item);
    }

    #[test]
    fn send_item_omits_optional_fields() {
        let body = WorkItem::send(9).encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["id_fatura"], 9);
        assert!(json.get("acao").is_none());
        assert!(json.get("tentativas").is_none());
        assert!(json.get("motivo").is_none());
    }
}
