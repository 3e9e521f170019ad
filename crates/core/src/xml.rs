use sha2::{Digest, Sha256};

pub fn compute_sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Strips a leading XML declaration, if present.
///
/// The authority rejects batch payloads that carry a declaration inside the
/// `rLoteDE` wrapper, and response snippets frequently arrive with one.
pub fn strip_declaration(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    if let Some(rest) = trimmed.strip_prefix("<?xml") {
        if let Some(end) = rest.find("?>") {
            return rest[end + 2..].trim_start();
        }
    }
    trimmed
}

fn find_by_local_name<'a, 'input: 'a>(
    node: roxmltree::Node<'a, 'input>,
    local: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == local)
}

/// First text value of the element with the given local name, regardless of
/// namespace. SIFEN responses mix default and prefixed namespaces freely.
pub fn find_text(doc: &roxmltree::Document, local: &str) -> Option<String> {
    find_by_local_name(doc.root_element(), local)
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// First non-empty text among several candidate element names, mirroring the
/// multiple response layouts the authority uses for the same field.
pub fn find_text_any(doc: &roxmltree::Document, locals: &[&str]) -> Option<String> {
    locals.iter().find_map(|local| find_text(doc, local))
}

/// Number of elements with the given local name.
pub fn count_elements(doc: &roxmltree::Document, local: &str) -> usize {
    doc.root_element()
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == local)
        .count()
}

/// Extracts the 44-digit CDC from a signed document: the `Id` attribute of
/// the `DE` element. Required for building cancellation events.
pub fn extract_cdc(signed_xml: &str) -> Option<String> {
    let cleaned = strip_declaration(signed_xml);
    let doc = roxmltree::Document::parse(cleaned).ok()?;
    let de = find_by_local_name(doc.root_element(), "DE")?;
    de.attribute("Id").map(str::to_string)
}
