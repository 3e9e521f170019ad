//! XML signature and QR capability for SIFEN documents.
//!
//! Two placement rules exist: the invoice signature is inserted immediately
//! after the `DE` element (with the QR group right after it), while the
//! cancellation-event signature is a *sibling* of `rEve` inside `rGesEve`.
//! Both sign the referenced element with RSA-PKCS#1 v1.5 over SHA-256.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Local;
use quick_xml::escape::escape;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::SIFEN_VERSION;
use crate::xml;

pub const SIFEN_NS: &str = "http://ekuatia.set.gov.py/sifen/xsd";
pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
const EVENT_SCHEMA_LOCATION: &str =
    "http://ekuatia.set.gov.py/sifen/xsd siRecepEvento_v150.xsd";

#[derive(Debug, Error)]
pub enum SignError {
    #[error("credential unreadable: {0}")]
    CredentialIo(#[from] std::io::Error),
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("document is missing the <DE> element or its Id")]
    MissingDe,
    #[error("malformed document: {0}")]
    MalformedXml(String),
    #[error("signature operation failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("signature verification failed: {0}")]
    Verification(String),
}

/// Key material referenced from the invoice row: a PEM bundle holding the
/// PKCS#8 private key and the signer certificate.
pub struct SigningCredential {
    pub key: RsaPrivateKey,
    pub cert_der: Vec<u8>,
}

impl SigningCredential {
    pub fn from_pem(bundle: &str) -> Result<Self, SignError> {
        let blocks = ::pem::parse_many(bundle)
            .map_err(|e| SignError::InvalidCredential(format!("PEM parse error: {e}")))?;

        let mut key = None;
        let mut cert_der = Vec::new();
        for block in blocks {
            match block.tag() {
                "PRIVATE KEY" => {
                    let parsed = RsaPrivateKey::from_pkcs8_der(block.contents()).map_err(|e| {
                        SignError::InvalidCredential(format!("invalid PKCS#8 key: {e}"))
                    })?;
                    key = Some(parsed);
                }
                "CERTIFICATE" => cert_der = block.into_contents(),
                _ => {}
            }
        }

        let key = key
            .ok_or_else(|| SignError::InvalidCredential("no PRIVATE KEY block found".into()))?;
        Ok(Self { key, cert_der })
    }

    pub fn from_pem_file(path: &str) -> Result<Self, SignError> {
        let bundle = std::fs::read_to_string(path)?;
        Self::from_pem(&bundle)
    }
}

/// QR generation inputs: the configured QR base URL plus the taxpayer
/// security code (CSC) and its identifier from the invoice row.
pub struct QrParams<'a> {
    pub base_url: &'a str,
    pub csc: &'a str,
    pub csc_id: &'a str,
}

fn rsa_sign(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, SignError> {
    let digest = Sha256::digest(data);
    Ok(key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?)
}

fn rsa_verify(key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> bool {
    let digest = Sha256::digest(data);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .is_ok()
}

/// Byte range (start, end-exclusive) of `<name ...>...</name>` in `xml`.
fn element_block(xml: &str, name: &str) -> Option<(usize, usize)> {
    let open = format!("<{name}");
    let close = format!("</{name}>");

    let mut search = 0;
    let start = loop {
        let pos = xml[search..].find(&open)? + search;
        match xml.as_bytes().get(pos + open.len()) {
            Some(b' ' | b'\t' | b'\r' | b'\n' | b'>') => break pos,
            _ => search = pos + open.len(),
        }
    };
    let end = xml[start..].find(&close)? + start + close.len();
    Some((start, end))
}

/// Rewrites the `dFecFirma` text with the actual signing timestamp. A
/// document without the element is passed through untouched.
fn stamp_signing_time(xml: &str, timestamp: &str) -> String {
    let (Some(open), Some(close)) = (xml.find("<dFecFirma>"), xml.find("</dFecFirma>")) else {
        return xml.to_string();
    };
    if close < open {
        return xml.to_string();
    }
    let inner_start = open + "<dFecFirma>".len();
    format!("{}{}{}", &xml[..inner_start], timestamp, &xml[close..])
}

fn build_signature(
    reference_uri: &str,
    digest_b64: &str,
    credential: &SigningCredential,
) -> Result<String, SignError> {
    let signed_info = format!(
        r#"<SignedInfo xmlns="{DSIG_NS}"><CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"></CanonicalizationMethod><SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"></SignatureMethod><Reference URI="{reference_uri}"><Transforms><Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"></Transform><Transform Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"></Transform></Transforms><DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"></DigestMethod><DigestValue>{digest_b64}</DigestValue></Reference></SignedInfo>"#
    );

    let signature_value = BASE64.encode(rsa_sign(&credential.key, signed_info.as_bytes())?);
    let certificate = BASE64.encode(&credential.cert_der);

    Ok(format!(
        r#"<Signature xmlns="{DSIG_NS}">{signed_info}<SignatureValue>{signature_value}</SignatureValue><KeyInfo><X509Data><X509Certificate>{certificate}</X509Certificate></X509Data></KeyInfo></Signature>"#
    ))
}

/// Signs an invoice document and embeds the QR group.
///
/// Stamps `dFecFirma`, digests the `DE` element, inserts the `Signature`
/// right after `</DE>` and the `gCamFuFD` QR group right after the
/// signature, per the SIFEN v150 layout.
pub fn sign_document(
    xml_original: &str,
    credential: &SigningCredential,
    qr: &QrParams<'_>,
) -> Result<String, SignError> {
    let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
    let stamped = stamp_signing_time(xml_original, &timestamp);

    let (de_start, de_end) = element_block(&stamped, "DE").ok_or(SignError::MissingDe)?;
    let de_block = &stamped[de_start..de_end];

    let doc = roxmltree::Document::parse(xml::strip_declaration(&stamped))
        .map_err(|e| SignError::MalformedXml(e.to_string()))?;
    let de_id = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "DE")
        .and_then(|n| n.attribute("Id"))
        .ok_or(SignError::MissingDe)?
        .to_string();

    let digest_b64 = BASE64.encode(Sha256::digest(de_block.as_bytes()));
    let signature = build_signature(&format!("#{de_id}"), &digest_b64, credential)?;
    let qr_block = build_qr_block(&doc, &de_id, &digest_b64, qr);

    Ok(format!(
        "{}{signature}{qr_block}{}",
        &stamped[..de_end],
        &stamped[de_end..]
    ))
}

/// Builds the `gCamFuFD` group holding the QR URL.
///
/// The `DigestValue` QR field is the hex encoding of the *base64 digest
/// text*, not of the raw digest bytes. The authority's validators recompute
/// it this way.
fn build_qr_block(
    doc: &roxmltree::Document,
    de_id: &str,
    digest_b64: &str,
    qr: &QrParams<'_>,
) -> String {
    let text_or_zero =
        |local: &str| xml::find_text(doc, local).unwrap_or_else(|| "0".to_string());

    let emission_date_hex = hex::encode(text_or_zero("dFeEmiDE").as_bytes());
    let receiver_ruc = text_or_zero("dRucRec");
    let total_amount = text_or_zero("dTotGralOpe");
    let total_vat = text_or_zero("dTotIVA");
    let item_count = xml::count_elements(doc, "gCamItem");
    let digest_hex = hex::encode(digest_b64.as_bytes());

    let base = format!(
        "nVersion={SIFEN_VERSION}&Id={de_id}&dFeEmiDE={emission_date_hex}&dRucRec={receiver_ruc}\
         &dTotGralOpe={total_amount}&dTotIVA={total_vat}&cItems={item_count}\
         &DigestValue={digest_hex}&IdCSC={}",
        qr.csc_id
    );
    let hash = xml::compute_sha256_hex(&format!("{base}{}", qr.csc.trim()));
    let url = format!("{}{base}&cHashQR={hash}", qr.base_url);

    format!(
        r#"<gCamFuFD xmlns="{SIFEN_NS}"><dCarQR>{}</dCarQR></gCamFuFD>"#,
        escape(&url)
    )
}

/// Builds and signs the cancellation event for the given CDC.
///
/// The signature is appended as a sibling of `rEve` inside `rGesEve`;
/// enveloping it breaks the authority's reference check (rule 0141: the
/// event Id is the literal "1", the CDC lives inside `rGeVeCan`).
pub fn sign_cancellation_event(
    cdc: &str,
    reason: &str,
    credential: &SigningCredential,
) -> Result<String, SignError> {
    let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();

    let reve = format!(
        r#"<rEve xmlns="{SIFEN_NS}" xmlns:xsi="{XSI_NS}" Id="1"><dFecFirma>{timestamp}</dFecFirma><dVerFor>{SIFEN_VERSION}</dVerFor><gGroupTiEvt><rGeVeCan><Id>{cdc}</Id><mOtEve>{}</mOtEve></rGeVeCan></gGroupTiEvt></rEve>"#,
        escape(reason)
    );

    let digest_b64 = BASE64.encode(Sha256::digest(reve.as_bytes()));
    let signature = build_signature("#1", &digest_b64, credential)?;

    Ok(format!(
        r#"<gGroupGesEve xmlns="{SIFEN_NS}" xmlns:xsi="{XSI_NS}" xsi:schemaLocation="{EVENT_SCHEMA_LOCATION}"><rGesEve xmlns="{SIFEN_NS}" xmlns:xsi="{XSI_NS}" xsi:schemaLocation="{EVENT_SCHEMA_LOCATION}">{reve}{signature}</rGesEve></gGroupGesEve>"#
    ))
}

/// Verifies an embedded signature against the signed payload: recomputes the
/// digest of the referenced element and checks the RSA signature over
/// `SignedInfo`.
pub fn verify_document(signed_xml: &str, public_key: &RsaPublicKey) -> Result<(), SignError> {
    let referenced = element_block(signed_xml, "DE")
        .or_else(|| element_block(signed_xml, "rEve"))
        .ok_or(SignError::MissingDe)?;
    let payload = &signed_xml[referenced.0..referenced.1];

    let (info_start, info_end) = element_block(signed_xml, "SignedInfo")
        .ok_or_else(|| SignError::Verification("no SignedInfo element".into()))?;
    let signed_info = &signed_xml[info_start..info_end];

    let doc = roxmltree::Document::parse(xml::strip_declaration(signed_xml))
        .map_err(|e| SignError::MalformedXml(e.to_string()))?;
    let recorded_digest = xml::find_text(&doc, "DigestValue")
        .ok_or_else(|| SignError::Verification("no DigestValue element".into()))?;
    let signature_value = xml::find_text(&doc, "SignatureValue")
        .ok_or_else(|| SignError::Verification("no SignatureValue element".into()))?;

    let actual_digest = BASE64.encode(Sha256::digest(payload.as_bytes()));
    if actual_digest != recorded_digest {
        return Err(SignError::Verification("payload digest mismatch".into()));
    }

    let signature_bytes = BASE64
        .decode(signature_value.as_bytes())
        .map_err(|e| SignError::Verification(format!("bad SignatureValue base64: {e}")))?;
    if !rsa_verify(public_key, signed_info.as_bytes(), &signature_bytes) {
        return Err(SignError::Verification("SignedInfo signature mismatch".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;

    const CDC: &str = "01444444017001010012345678901234567890123456";

    fn sample_invoice() -> String {
        format!(
            r#"<?xml version='1.0' encoding='utf-8'?><rDE xmlns="{SIFEN_NS}"><dVerFor>150</dVerFor><DE Id="{CDC}"><gOpeDE><dFecFirma>2024-01-01T00:00:00</dFecFirma></gOpeDE><gTimb><dFeEmiDE>2024-03-05T10:15:00</dFeEmiDE></gTimb><gDatGralOpe><dRucRec>80012345</dRucRec></gDatGralOpe><gDtipDE><gCamItem><dDesProSer>Item A</dDesProSer></gCamItem><gCamItem><dDesProSer>Item B</dDesProSer></gCamItem></gDtipDE><gTotSub><dTotGralOpe>150000</dTotGralOpe><dTotIVA>13636</dTotIVA></gTotSub></DE></rDE>"#
        )
    }

    fn test_credential() -> SigningCredential {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("keygen");
        SigningCredential { key, cert_der: vec![0x30, 0x03, 0x02, 0x01, 0x01] }
    }

    fn qr_params() -> QrParams<'static> {
        QrParams {
            base_url: "https://ekuatia.set.gov.py/consultas/qr?",
            csc: "ABCD0000000000000000000000000000",
            csc_id: "0001",
        }
    }

    #[test]
    fn sign_then_verify_round_trip() {
        let cred = test_credential();
        let signed = sign_document(&sample_invoice(), &cred, &qr_params()).unwrap();

        let public_key = RsaPublicKey::from(&cred.key);
        verify_document(&signed, &public_key).unwrap();
    }

    #[test]
    fn verify_detects_payload_tampering() {
        let cred = test_credential();
        let signed = sign_document(&sample_invoice(), &cred, &qr_params()).unwrap();
        let tampered = signed.replace("150000", "999999");

        let public_key = RsaPublicKey::from(&cred.key);
        assert!(matches!(
            verify_document(&tampered, &public_key),
            Err(SignError::Verification(_))
        ));
    }

    #[test]
    fn signature_sits_between_de_and_qr_group() {
        let cred = test_credential();
        let signed = sign_document(&sample_invoice(), &cred, &qr_params()).unwrap();

        let de_close = signed.find("</DE>").unwrap();
        let signature = signed.find("<Signature ").unwrap();
        let qr = signed.find("<gCamFuFD ").unwrap();
        assert!(de_close < signature && signature < qr);
    }

    #[test]
    fn stamps_signing_time() {
        let cred = test_credential();
        let signed = sign_document(&sample_invoice(), &cred, &qr_params()).unwrap();
        assert!(!signed.contains("<dFecFirma>2024-01-01T00:00:00</dFecFirma>"));
    }

    #[test]
    fn qr_hash_recomputes_from_document_and_csc() {
        let cred = test_credential();
        let qr = qr_params();
        let signed = sign_document(&sample_invoice(), &cred, &qr).unwrap();

        let doc = roxmltree::Document::parse(xml::strip_declaration(&signed)).unwrap();
        let url = xml::find_text(&doc, "dCarQR").unwrap();
        let base = url.strip_prefix(qr.base_url).unwrap();
        let (params, hash) = base.split_once("&cHashQR=").unwrap();

        assert_eq!(xml::compute_sha256_hex(&format!("{params}{}", qr.csc)), hash);
        assert!(params.contains(&format!("Id={CDC}")));
        assert!(params.contains("cItems=2"));

        // QR DigestValue is the hex of the base64 digest text.
        let recorded_digest = xml::find_text(&doc, "DigestValue").unwrap();
        assert!(params.contains(&format!("DigestValue={}", hex::encode(recorded_digest.as_bytes()))));
    }

    #[test]
    fn cancellation_event_signature_is_a_sibling() {
        let cred = test_credential();
        let event = sign_cancellation_event(CDC, "Erro de digitacao", &cred).unwrap();

        let reve_close = event.find("</rEve>").unwrap();
        let signature = event.find("<Signature ").unwrap();
        assert!(signature > reve_close, "signature must not be enveloped in rEve");
        assert!(event.contains(&format!("<Id>{CDC}</Id>")));
        assert!(event.contains(r#"<rEve xmlns="http://ekuatia.set.gov.py/sifen/xsd""#));

        let public_key = RsaPublicKey::from(&cred.key);
        verify_document(&event, &public_key).unwrap();
    }

    #[test]
    fn cancellation_reason_is_escaped() {
        let cred = test_credential();
        let event = sign_cancellation_event(CDC, "Monto <> esperado & otros", &cred).unwrap();
        assert!(event.contains("Monto &lt;&gt; esperado &amp; otros"));
    }

    #[test]
    fn credential_loads_from_pem_bundle() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let key_pem = key.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF).unwrap();
        let cert_pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE", vec![1u8, 2, 3]));

        let cred = SigningCredential::from_pem(&format!("{}{}", key_pem.as_str(), cert_pem)).unwrap();
        assert_eq!(cred.cert_der, vec![1, 2, 3]);

        assert!(matches!(
            SigningCredential::from_pem(&cert_pem),
            Err(SignError::InvalidCredential(_))
        ));
    }
}
