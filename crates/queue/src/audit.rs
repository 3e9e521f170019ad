use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: String,
    pub invoice_id: i64,
    pub action: String,
    pub attempt: Option<u32>,
    pub state: String,
    pub protocol: Option<String>,
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: &str, invoice_id: i64, action: &str, state: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            invoice_id,
            action: action.to_string(),
            attempt: None,
            state: state.to_string(),
            protocol: None,
            error: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_protocol(mut self, protocol: String) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

fn audit_log_path() -> PathBuf {
    PathBuf::from("audit.jsonl")
}

pub fn write_audit_event(event: &AuditEvent) -> Result<()> {
    let path = audit_log_path();
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

    let json = serde_json::to_string(event)?;
    writeln!(file, "{}", json)?;
    tracing::debug!(event_type=%event.event_type, invoice_id=event.invoice_id, "Audit event written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_optional_fields() {
        let event = AuditEvent::new("batch_accepted", 42, "enviar", "900")
            .with_attempt(1)
            .with_protocol("12345".into());
        assert_eq!(event.invoice_id, 42);
        assert_eq!(event.attempt, Some(1));
        assert_eq!(event.protocol.as_deref(), Some("12345"));
        assert!(event.error.is_none());

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"batch_accepted\""));
    }
}
