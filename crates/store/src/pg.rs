//! Postgres implementation over the legacy emission/summary tables.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::{InvoiceRecord, InvoiceStore, OutcomeUpdate, StoreError, SummaryRecord};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvoiceStore for PgStore {
    async fn load_invoice(&self, id: i64) -> Result<Option<InvoiceRecord>, StoreError> {
        // Multiple emission rows can exist per document; the newest wins.
        let row = sqlx::query(
            r#"
            SELECT id_docfis,
                   COALESCE(xml, '')                      AS xml,
                   COALESCE(xml_assinado, '')             AS xml_assinado,
                   COALESCE(xml_retorno, '')              AS xml_retorno,
                   COALESCE(xml_cancelamento_envio, '')   AS xml_cancelamento_envio,
                   COALESCE(xml_cancelamento_retorno, '') AS xml_cancelamento_retorno,
                   COALESCE(caminho_certificado, '')      AS caminho_certificado,
                   COALESCE(senha, '')                    AS senha,
                   COALESCE(id_csc, '')                   AS id_csc,
                   COALESCE(csc, '')                      AS csc,
                   COALESCE(protocolo, '')                AS protocolo,
                   COALESCE(cod_status, '')               AS cod_status,
                   COALESCE(desc_status, '')              AS desc_status,
                   tipo_docto
            FROM tb_de_emissao
            WHERE id_docfis = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| InvoiceRecord {
            id: row.get("id_docfis"),
            xml: row.get("xml"),
            signed_xml: row.get("xml_assinado"),
            return_xml: row.get("xml_retorno"),
            cancel_request_xml: row.get("xml_cancelamento_envio"),
            cancel_return_xml: row.get("xml_cancelamento_retorno"),
            cert_path: row.get("caminho_certificado"),
            cert_secret: row.get("senha"),
            csc_id: row.get("id_csc"),
            csc: row.get("csc"),
            protocol: row.get("protocolo"),
            status_code: row.get("cod_status"),
            status_desc: row.get("desc_status"),
            document_type: row.get("tipo_docto"),
        }))
    }

    async fn load_summary(&self, id: i64) -> Result<Option<SummaryRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id_doc, cod_status, COALESCE(desc_status, '') AS desc_status
            FROM tb_de_documento
            WHERE id_doc = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| SummaryRecord {
            id: row.get("id_doc"),
            status_code: row.get("cod_status"),
            status_desc: row.get("desc_status"),
        }))
    }

    async fn save_outcome(&self, id: i64, update: OutcomeUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tb_de_emissao
            SET cod_status = $2,
                desc_status = $3,
                xml_assinado = COALESCE($4, xml_assinado),
                xml_retorno = COALESCE($5, xml_retorno),
                protocolo = COALESCE($6, protocolo),
                xml_cancelamento_envio = COALESCE($7, xml_cancelamento_envio),
                xml_cancelamento_retorno = COALESCE($8, xml_cancelamento_retorno)
            WHERE id_docfis = $1
            "#,
        )
        .bind(id)
        .bind(&update.status_code)
        .bind(&update.status_desc)
        .bind(&update.signed_xml)
        .bind(&update.return_xml)
        .bind(&update.protocol)
        .bind(&update.cancel_request_xml)
        .bind(&update.cancel_return_xml)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        tracing::debug!(invoice_id = id, status = %update.status_code, "emission record updated");
        Ok(())
    }

    async fn save_summary(
        &self,
        id: i64,
        status_code: Option<i32>,
        status_desc: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tb_de_documento
            SET cod_status = COALESCE($2, cod_status),
                desc_status = $3
            WHERE id_doc = $1
            "#,
        )
        .bind(id)
        .bind(status_code)
        .bind(status_desc)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}
