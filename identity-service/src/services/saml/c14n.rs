//! Minimal exclusive XML canonicalization (C14N 1.0, no comments).
//!
//! Covers the profile SAML IdPs emit in practice: elements with namespace
//! declarations and simple attributes, character data, no processing
//! instructions inside signed content. Rules applied:
//!   - comments dropped, self-closing tags expanded to start/end pairs
//!   - namespace declarations before attributes, each group sorted
//!   - attribute values double-quoted with `&<>"` escaped
//!   - text exactly preserved with `&<>` (and CR) escaped

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::services::error::ServiceError;

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\t', "&#x9;")
        .replace('\n', "&#xA;")
        .replace('\r', "&#xD;")
}

fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\r', "&#xD;")
}

fn parse_error(e: quick_xml::Error) -> ServiceError {
    ServiceError::SamlInvalid(format!("XML parse error: {e}"))
}

fn write_tag(out: &mut String, raw: &[u8]) -> Result<(), ServiceError> {
    let tag = std::str::from_utf8(raw)
        .map_err(|e| ServiceError::SamlInvalid(format!("Invalid UTF-8 in tag: {e}")))?;
    let name = tag.split_whitespace().next().unwrap_or("");

    // Collect (key, value) pairs from the raw tag text.
    let mut namespaces: Vec<(String, String)> = Vec::new();
    let mut attributes: Vec<(String, String)> = Vec::new();
    let event = quick_xml::events::BytesStart::from_content(tag, name.len());
    for attr in event.attributes().with_checks(false) {
        let attr = attr.map_err(|e| ServiceError::SamlInvalid(format!("Bad attribute: {e}")))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| ServiceError::SamlInvalid(format!("Invalid UTF-8 in attribute: {e}")))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| ServiceError::SamlInvalid(format!("Bad attribute value: {e}")))?
            .to_string();
        if key == "xmlns" || key.starts_with("xmlns:") {
            namespaces.push((key, value));
        } else {
            attributes.push((key, value));
        }
    }
    namespaces.sort();
    attributes.sort();

    out.push('<');
    out.push_str(name);
    for (key, value) in namespaces.iter().chain(attributes.iter()) {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }
    out.push('>');
    Ok(())
}

/// Canonicalize an XML fragment.
pub fn canonicalize(xml: &str) -> Result<String, ServiceError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut out = String::with_capacity(xml.len());
    let mut depth: i64 = 0;
    loop {
        match reader.read_event().map_err(parse_error)? {
            Event::Start(e) => {
                depth += 1;
                write_tag(&mut out, &e)?;
            }
            Event::Empty(e) => {
                write_tag(&mut out, &e)?;
                let tag = std::str::from_utf8(&e)
                    .map_err(|err| ServiceError::SamlInvalid(format!("Invalid UTF-8: {err}")))?;
                let name = tag.split_whitespace().next().unwrap_or("");
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
            Event::End(e) => {
                depth -= 1;
                let name = std::str::from_utf8(e.name().as_ref())
                    .map_err(|err| ServiceError::SamlInvalid(format!("Invalid UTF-8: {err}")))?
                    .to_string();
                out.push_str("</");
                out.push_str(&name);
                out.push('>');
            }
            Event::Text(e) => {
                // Whitespace outside the root is not part of the canonical form.
                let text = e
                    .unescape()
                    .map_err(|err| ServiceError::SamlInvalid(format!("Bad text node: {err}")))?;
                if depth > 0 || !text.trim().is_empty() {
                    out.push_str(&escape_text(&text));
                }
            }
            Event::CData(e) => {
                let text = String::from_utf8_lossy(&e).to_string();
                if depth > 0 {
                    out.push_str(&escape_text(&text));
                }
            }
            Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_closing_tags_are_expanded() {
        let out = canonicalize(r#"<a><b x="1"/></a>"#).unwrap();
        assert_eq!(out, r#"<a><b x="1"></b></a>"#);
    }

    #[test]
    fn namespaces_sort_before_attributes() {
        let out = canonicalize(
            r#"<a z="2" xmlns:b="urn:b" a="1" xmlns="urn:default">t</a>"#,
        )
        .unwrap();
        assert_eq!(
            out,
            r#"<a xmlns="urn:default" xmlns:b="urn:b" a="1" z="2">t</a>"#
        );
    }

    #[test]
    fn comments_and_declarations_are_dropped() {
        let out = canonicalize("<?xml version=\"1.0\"?><a><!-- hi -->x</a>").unwrap();
        assert_eq!(out, "<a>x</a>");
    }

    #[test]
    fn text_is_escaped_but_preserved() {
        let out = canonicalize("<a>1 &lt; 2 &amp; 3</a>").unwrap();
        assert_eq!(out, "<a>1 &lt; 2 &amp; 3</a>");
    }

    #[test]
    fn canonical_form_is_a_fixed_point() {
        let once = canonicalize(r#"<a b="2" a="1"><c/></a>"#).unwrap();
        let twice = canonicalize(&once).unwrap();
        assert_eq!(once, twice);
    }
}
