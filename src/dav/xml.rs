//! Multi-status and lock-discovery bodies
//!
//! Written by hand: the documents are small and fixed in shape.

use crate::http::message::http_date;
use crate::storage::FileProperties;

/// Namespace of the `b:dt` datatype attribute Windows clients expect
const DATATYPES_NS: &str = "urn:uuid:c2f41010-65b3-11d1-a29f-00aa00c14882/";

/// One resource in a PROPFIND answer
#[derive(Debug, Clone)]
pub struct PropEntry {
    pub href: String,
    pub is_directory: bool,
    pub properties: FileProperties,
    pub lock_token: Option<String>,
}

/// Escape text for element content
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn active_lock(out: &mut String, indent: &str, token: &str) {
    out.push_str(&format!("{indent}<D:activelock>\n"));
    out.push_str(&format!("{indent}  <D:locktype><D:write/></D:locktype>\n"));
    out.push_str(&format!("{indent}  <D:lockscope><D:exclusive/></D:lockscope>\n"));
    out.push_str(&format!("{indent}  <D:depth>0</D:depth>\n"));
    out.push_str(&format!(
        "{indent}  <D:locktoken><D:href>urn:uuid:{}</D:href></D:locktoken>\n",
        escape(token)
    ));
    out.push_str(&format!("{indent}</D:activelock>\n"));
}

/// PROPFIND body for `entries`
pub fn multistatus(entries: &[PropEntry]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(&format!("<D:multistatus xmlns:D=\"DAV:\" xmlns:b=\"{}\">\n", DATATYPES_NS));

    for entry in entries {
        out.push_str("  <D:response>\n");
        out.push_str(&format!("    <D:href>{}</D:href>\n", escape(&entry.href)));
        out.push_str("    <D:propstat>\n");
        out.push_str("      <D:prop>\n");
        out.push_str(&format!(
            "        <D:getlastmodified>{}</D:getlastmodified>\n",
            http_date(&entry.properties.modified)
        ));
        if entry.is_directory {
            out.push_str("        <D:resourcetype><D:collection/></D:resourcetype>\n");
        } else {
            out.push_str(&format!(
                "        <D:getcontentlength b:dt=\"int\">{}</D:getcontentlength>\n",
                entry.properties.size
            ));
            out.push_str("        <D:resourcetype/>\n");
        }
        out.push_str("        <D:supportedlock>\n");
        out.push_str("          <D:lockentry>\n");
        out.push_str("            <D:lockscope><D:exclusive/></D:lockscope>\n");
        out.push_str("            <D:locktype><D:write/></D:locktype>\n");
        out.push_str("          </D:lockentry>\n");
        out.push_str("        </D:supportedlock>\n");
        if let Some(token) = &entry.lock_token {
            out.push_str("        <D:lockdiscovery>\n");
            active_lock(&mut out, "          ", token);
            out.push_str("        </D:lockdiscovery>\n");
        }
        out.push_str("      </D:prop>\n");
        out.push_str("      <D:status>HTTP/1.1 200 OK</D:status>\n");
        out.push_str("    </D:propstat>\n");
        out.push_str("  </D:response>\n");
    }

    out.push_str("</D:multistatus>\n");
    out
}

/// LOCK body announcing `token`
pub fn lock_discovery(token: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<D:prop xmlns:D=\"DAV:\">\n");
    out.push_str("  <D:lockdiscovery>\n");
    active_lock(&mut out, "    ", token);
    out.push_str("  </D:lockdiscovery>\n");
    out.push_str("</D:prop>\n");
    out
}

/// PROPPATCH acknowledgement claiming every named property was set
pub fn proppatch_ack(href: &str, names: &[String]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<D:multistatus xmlns:D=\"DAV:\" xmlns:Z=\"urn:schemas-microsoft-com:\">\n",
    );
    out.push_str("  <D:response>\n");
    out.push_str(&format!("    <D:href>{}</D:href>\n", escape(href)));
    out.push_str("    <D:propstat>\n");
    out.push_str("      <D:status>HTTP/1.1 200 OK</D:status>\n");
    out.push_str("      <D:prop>\n");
    for name in names {
        out.push_str(&format!("        <Z:{}/>\n", name));
    }
    out.push_str("      </D:prop>\n");
    out.push_str("    </D:propstat>\n");
    out.push_str("  </D:response>\n");
    out.push_str("</D:multistatus>\n");
    out
}
