//! In-memory store used by the dispatcher test suite.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{InvoiceRecord, InvoiceStore, OutcomeUpdate, StoreError, SummaryRecord};

#[derive(Default)]
pub struct MemoryStore {
    invoices: Mutex<HashMap<i64, InvoiceRecord>>,
    summaries: Mutex<HashMap<i64, SummaryRecord>>,
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_invoice(&self, record: InvoiceRecord) {
        self.invoices.lock().unwrap().insert(record.id, record);
    }

    pub fn insert_summary(&self, record: SummaryRecord) {
        self.summaries.lock().unwrap().insert(record.id, record);
    }

    pub fn invoice(&self, id: i64) -> Option<InvoiceRecord> {
        self.invoices.lock().unwrap().get(&id).cloned()
    }

    pub fn summary(&self, id: i64) -> Option<SummaryRecord> {
        self.summaries.lock().unwrap().get(&id).cloned()
    }

    /// Makes every subsequent write fail, simulating a database outage.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if *self.fail_writes.lock().unwrap() {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn load_invoice(&self, id: i64) -> Result<Option<InvoiceRecord>, StoreError> {
        Ok(self.invoices.lock().unwrap().get(&id).cloned())
    }

    async fn load_summary(&self, id: i64) -> Result<Option<SummaryRecord>, StoreError> {
        Ok(self.summaries.lock().unwrap().get(&id).cloned())
    }

    async fn save_outcome(&self, id: i64, update: OutcomeUpdate) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut invoices = self.invoices.lock().unwrap();
        let record = invoices.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.status_code = update.status_code;
        record.status_desc = update.status_desc;
        if let Some(xml) = update.signed_xml {
            record.signed_xml = xml;
        }
        if let Some(xml) = update.return_xml {
            record.return_xml = xml;
        }
        if let Some(protocol) = update.protocol {
            record.protocol = protocol;
        }
        if let Some(xml) = update.cancel_request_xml {
            record.cancel_request_xml = xml;
        }
        if let Some(xml) = update.cancel_return_xml {
            record.cancel_return_xml = xml;
        }
        Ok(())
    }

    async fn save_summary(
        &self,
        id: i64,
        status_code: Option<i32>,
        status_desc: &str,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut summaries = self.summaries.lock().unwrap();
        let record = summaries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if let Some(code) = status_code {
            record.status_code = Some(code);
        }
        record.status_desc = status_desc.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64) -> InvoiceRecord {
        InvoiceRecord {
            id,
            xml: "<DE/>".into(),
            ..InvoiceRecord::default()
        }
    }

    #[tokio::test]
    async fn outcome_merges_only_provided_fields() {
        let store = MemoryStore::new();
        store.insert_invoice(InvoiceRecord {
            protocol: "123".into(),
            ..record(7)
        });

        store
            .save_outcome(7, OutcomeUpdate::status("900", "Aguardando consulta"))
            .await
            .unwrap();

        let saved = store.invoice(7).unwrap();
        assert_eq!(saved.status_code, "900");
        assert_eq!(saved.protocol, "123");
    }

    #[tokio::test]
    async fn injected_failure_surfaces_as_database_error() {
        let store = MemoryStore::new();
        store.insert_invoice(record(1));
        store.fail_writes(true);

        let err = store
            .save_outcome(1, OutcomeUpdate::status("0201", "Aprobado"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[tokio::test]
    async fn missing_row_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .save_summary(42, Some(600), "Cancelado")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(42)));
    }
}
