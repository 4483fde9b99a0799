//! Minimal XMP packet handling: read `dc:description` / `dc:subject`, and
//! set `dc:description` while leaving the rest of the packet alone.

/// Prefix of a JPEG APP1 segment carrying an XMP packet.
pub(crate) const JPEG_XMP_HEADER: &[u8] = b"http://ns.adobe.com/xap/1.0/\0";

/// PNG chunk type used for XMP.
pub(crate) const PNG_ITXT: [u8; 4] = *b"iTXt";

/// iTXt keyword under which PNG files carry XMP.
const PNG_XMP_KEYWORD: &[u8] = b"XML:com.adobe.xmp";

const DC_NAMESPACE: &str = "xmlns:dc=\"http://purl.org/dc/elements/1.1/\"";

/// First `rdf:li` value of `dc:description`, if non-empty.
pub(crate) fn description(xmp: &str) -> Option<String> {
    let body = element_body(xmp, "dc:description")?;
    list_items(body)
        .into_iter()
        .find(|item| !item.is_empty())
}

/// All non-empty `rdf:li` values of `dc:subject`.
pub(crate) fn subjects(xmp: &str) -> Vec<String> {
    element_body(xmp, "dc:subject")
        .map(list_items)
        .unwrap_or_default()
        .into_iter()
        .filter(|item| !item.is_empty())
        .collect()
}

/// Return an XMP packet whose `dc:description` is `caption`.
///
/// An existing packet keeps all of its other properties; without one a
/// fresh packet is built.
pub(crate) fn with_description(existing: Option<&str>, caption: &str) -> String {
    let element = description_element(caption);

    if let Some(xmp) = existing {
        if let Some(injected) = inject_description(xmp, &element) {
            return injected;
        }
        log::debug!("Existing XMP packet has no rdf:Description, rebuilding");
    }

    let mut xmp = String::new();
    xmp.push_str("<?xpacket begin=\"\u{feff}\" id=\"W5M0MpCehiHzreSzNTczkc9d\"?>\n");
    xmp.push_str("<x:xmpmeta xmlns:x=\"adobe:ns:meta/\">\n");
    xmp.push_str("<rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">\n");
    xmp.push_str("<rdf:Description rdf:about=\"\"\n");
    xmp.push_str(&format!("  {DC_NAMESPACE}>\n"));
    xmp.push_str(&element);
    xmp.push_str("</rdf:Description>\n");
    xmp.push_str("</rdf:RDF>\n");
    xmp.push_str("</x:xmpmeta>\n");
    xmp.push_str("<?xpacket end=\"w\"?>");
    xmp
}

/// The XMP packet held by a PNG chunk, if it is an uncompressed XMP iTXt chunk.
pub(crate) fn from_png_chunk(kind: [u8; 4], contents: &[u8]) -> Option<String> {
    if kind != PNG_ITXT {
        return None;
    }
    let rest = contents.strip_prefix(PNG_XMP_KEYWORD)?.strip_prefix(b"\0")?;
    // Compression flag, compression method
    let (&compressed, rest) = rest.split_first()?;
    if compressed != 0 {
        log::debug!("Compressed XMP iTXt chunk, skipping");
        return None;
    }
    let rest = rest.get(1..)?;
    // Language tag and translated keyword, both NUL-terminated
    let lang_end = rest.iter().position(|b| *b == 0)?;
    let rest = &rest[lang_end + 1..];
    let translated_end = rest.iter().position(|b| *b == 0)?;
    let text = &rest[translated_end + 1..];
    Some(String::from_utf8_lossy(text).to_string())
}

/// Contents of an uncompressed XMP iTXt chunk holding `packet`.
pub(crate) fn png_chunk_contents(packet: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(PNG_XMP_KEYWORD.len() + 5 + packet.len());
    out.extend_from_slice(PNG_XMP_KEYWORD);
    // NUL, uncompressed, method 0, empty language, empty translated keyword
    out.extend_from_slice(&[0, 0, 0, 0, 0]);
    out.extend_from_slice(packet.as_bytes());
    out
}

fn description_element(caption: &str) -> String {
    format!(
        "  <dc:description><rdf:Alt><rdf:li xml:lang=\"x-default\">{}</rdf:li></rdf:Alt></dc:description>\n",
        xml_escape(caption)
    )
}

/// Put `element` inside the packet's `rdf:Description`, replacing any
/// previous `dc:description`. Returns `None` if there is no description node.
fn inject_description(xmp: &str, element: &str) -> Option<String> {
    let mut result = xmp.to_string();
    let desc_start = result.find("<rdf:Description")?;

    // Self-closing <rdf:Description ... /> becomes an open/close pair
    if !result.contains("</rdf:Description>") {
        let close = desc_start + result[desc_start..].find("/>")?;
        result.replace_range(close..close + 2, ">\n</rdf:Description>");
    }

    if !result.contains("xmlns:dc=") {
        let tag_end = desc_start + result[desc_start..].find('>')?;
        result.insert_str(tag_end, &format!("\n  {DC_NAMESPACE}"));
    }

    remove_element(&mut result, "dc:description");

    let pos = result.find("</rdf:Description>")?;
    result.insert_str(pos, element);
    Some(result)
}

/// The text between `<tag ...>` and `</tag>`.
fn element_body<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let start = xml.find(&open)?;
    let body_start = start + xml[start..].find('>')? + 1;
    let body_end = body_start + xml[body_start..].find(&close)?;
    Some(&xml[body_start..body_end])
}

fn list_items(body: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find("<rdf:li") {
        let Some(open_end) = rest[start..].find('>') else {
            break;
        };
        let value_start = start + open_end + 1;
        let Some(len) = rest[value_start..].find("</rdf:li>") else {
            break;
        };
        items.push(xml_unescape(rest[value_start..value_start + len].trim()));
        rest = &rest[value_start + len..];
    }
    items
}

/// Remove an XML element and its contents from a string.
fn remove_element(xml: &mut String, tag: &str) {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    if let Some(start) = xml.find(&open) {
        if let Some(end) = xml[start..].find(&close) {
            let end_abs = start + end + close.len();
            let end_abs = if xml.as_bytes().get(end_abs) == Some(&b'\n') {
                end_abs + 1
            } else {
                end_abs
            };
            xml.replace_range(start..end_abs, "");
        }
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
