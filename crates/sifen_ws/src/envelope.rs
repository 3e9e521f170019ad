//! SOAP 1.2 envelope construction and batch payload packaging.
//!
//! The envelope grammar is an external protocol contract (SIFEN v150): the
//! element names, the millisecond `dId` and the `rLoteDE` + ZIP + base64
//! packaging are all fixed by the authority.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::io::{Cursor, Write};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use sifen_core::xml::strip_declaration;

const SOAP_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const SIFEN_NS: &str = "http://ekuatia.set.gov.py/sifen/xsd";

/// Request identifier: millisecond timestamp, as the authority expects.
pub fn request_id() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

/// Wraps a signed document in `rLoteDE`, zips it and encodes it base64,
/// the transport form required by the batch submission endpoint.
pub fn pack_batch_payload(signed_xml: &str) -> Result<String> {
    let batch = format!("<rLoteDE>{}</rLoteDE>", strip_declaration(signed_xml));

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = ZipWriter::new(&mut cursor);
    writer
        .start_file(
            "documento.xml",
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
        )
        .context("failed to open zip entry")?;
    writer
        .write_all(batch.as_bytes())
        .context("failed to write batch into zip")?;
    writer.finish().context("failed to finish zip")?;

    Ok(BASE64.encode(cursor.into_inner()))
}

pub fn batch_envelope(request_id: &str, payload_b64: &str) -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="{SOAP_NS}" xmlns:xsd="{SIFEN_NS}"><soap:Header/><soap:Body><xsd:rEnvioLote><xsd:dId>{request_id}</xsd:dId><xsd:xDE>{payload_b64}</xsd:xDE></xsd:rEnvioLote></soap:Body></soap:Envelope>"#
    )
}

pub fn query_envelope(request_id: &str, protocol: &str) -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="{SOAP_NS}" xmlns:xsd="{SIFEN_NS}"><soap:Header/><soap:Body><xsd:rEnviConsLoteDe><xsd:dId>{request_id}</xsd:dId><xsd:dProtConsLote>{protocol}</xsd:dProtConsLote></xsd:rEnviConsLoteDe></soap:Body></soap:Envelope>"#
    )
}

/// The event envelope declares the SIFEN namespace as default on
/// `rEnviEventoDe`; the signed event XML is embedded without a declaration.
pub fn event_envelope(request_id: &str, signed_event_xml: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><env:Envelope xmlns:env="{SOAP_NS}"><env:Body><rEnviEventoDe xmlns="{SIFEN_NS}" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"><dId>{request_id}</dId><dEvReg>{}</dEvReg></rEnviEventoDe></env:Body></env:Envelope>"#,
        strip_declaration(signed_event_xml)
    )
}
