//! Classification of SIFEN SOAP responses into `RemoteOutcome` variants.
//!
//! The authority is inconsistent about field placement (`dCodRes` vs
//! `dCodResLot`, `dMsgRes` vs `dMsgResLot`), so every lookup tries the known
//! layouts in order, mirroring the observed service behavior.

use sifen_core::models::{
    RemoteOutcome, TrackingInfo, CANCELLATION_SUCCESS_CODES, STATUS_APPROVED, STATUS_REJECTED,
    TRANSIENT_MALFORMED_CODE, TRANSIENT_MALFORMED_MESSAGE,
};
use sifen_core::xml::{find_text, find_text_any, strip_declaration};

fn parse(raw: &str) -> Option<roxmltree::Document<'_>> {
    roxmltree::Document::parse(strip_declaration(raw)).ok()
}

/// Classifies the `recebe-lote` receipt. A missing or zero protocol means
/// the batch was not accepted.
pub fn classify_batch_receipt(raw: &str) -> RemoteOutcome {
    let Some(doc) = parse(raw) else {
        return RemoteOutcome::Rejected {
            code: "999".to_string(),
            reason: "Retorno ilegível do SIFEN".to_string(),
        };
    };

    let protocol = find_text(&doc, "dProtConsLote").filter(|p| p != "0");
    match protocol {
        Some(protocol) => RemoteOutcome::Approved(TrackingInfo {
            code: find_text(&doc, "dCodRes").unwrap_or_default(),
            protocol: Some(protocol),
            message: find_text(&doc, "dMsgRes").unwrap_or_default(),
        }),
        None => RemoteOutcome::Rejected {
            code: find_text(&doc, "dCodRes").unwrap_or_else(|| "999".to_string()),
            reason: find_text(&doc, "dMsgRes")
                .unwrap_or_else(|| "Erro não especificado".to_string()),
        },
    }
}

/// Classifies the `consulta-lote` result.
///
/// `0160` + "XML Mal Formado." is a known remote-side glitch, reported as
/// `TransientError` so the caller can retry without consuming the attempt
/// bound. An unreadable body classifies as `StillProcessing`, which keeps
/// the retry path bounded.
pub fn classify_query_result(raw: &str) -> RemoteOutcome {
    let Some(doc) = parse(raw) else {
        return RemoteOutcome::StillProcessing;
    };

    let status = find_text(&doc, "dEstRes").unwrap_or_default();
    let batch_message = find_text_any(&doc, &["dMsgResLot", "dMsgRes"]).unwrap_or_default();
    let code = find_text_any(&doc, &["dCodRes", "dCodResLot"]).unwrap_or_default();

    if code == TRANSIENT_MALFORMED_CODE && batch_message.trim() == TRANSIENT_MALFORMED_MESSAGE {
        return RemoteOutcome::TransientError { code };
    }

    if status == "Aprobado" {
        return RemoteOutcome::Approved(TrackingInfo {
            code: find_text(&doc, "dCodRes").unwrap_or_else(|| STATUS_APPROVED.to_string()),
            protocol: None,
            message: batch_message,
        });
    }

    let rejected = status == "Rechazado"
        || batch_message.contains("Cancelado")
        || batch_message.contains("Rechazado");
    if rejected {
        let code = if code.is_empty() { STATUS_REJECTED.to_string() } else { code };
        let reason = if batch_message.is_empty() {
            "Motivo não especificado.".to_string()
        } else {
            batch_message
        };
        return RemoteOutcome::Rejected { code, reason };
    }

    RemoteOutcome::StillProcessing
}

/// Classifies the `evento` (cancellation) result: success is either a known
/// success code or the textual "Aprobado" status.
pub fn classify_event_result(raw: &str) -> RemoteOutcome {
    let Some(doc) = parse(raw) else {
        return RemoteOutcome::CancellationRejected {
            code: "ERRO_PARSE".to_string(),
            reason: "Erro ao ler XML de retorno".to_string(),
        };
    };

    let code = find_text(&doc, "dCodRes").unwrap_or_default();
    let message = find_text(&doc, "dMsgRes").unwrap_or_else(|| "Sem mensagem".to_string());
    let status = find_text(&doc, "dEstRes").unwrap_or_default();

    if CANCELLATION_SUCCESS_CODES.contains(&code.as_str()) || status == "Aprobado" {
        RemoteOutcome::CancellationApproved {
            code,
            message,
            protocol: find_text(&doc, "dProtAut"),
        }
    } else {
        RemoteOutcome::CancellationRejected {
            code: if code.is_empty() { "999".to_string() } else { code },
            reason: message,
        }
    }
}
