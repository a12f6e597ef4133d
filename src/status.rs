//! Status and maintenance pages
//!
//! Served on the second listener so the card stays reachable over WebDAV
//! while someone is looking at the log. Pages are small and built inline.

use crate::error::{Error, Result};
use crate::http::message::parse_form;
use crate::http::{Handler, Request, Response};
use crate::link::{SystemControl, DISABLE_MARKER, REBOOT_DELAY};
use crate::logging::LogRing;
use crate::maintenance::{bulk_patch, PatchRequest};
use crate::storage::Storage;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Largest accepted form body
pub const MAX_FORM_BODY: u64 = 64 * 1024;

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

const STYLE: &str = "body{font-family:sans-serif;margin:2em;max-width:60em}\
table{border-collapse:collapse}td{padding:2px 12px 2px 0}\
.success{background:#dfd;padding:8px}.error{background:#fdd;padding:8px}\
pre{background:#eee;padding:8px;overflow-x:auto}";

/// Escape text for HTML element content
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{}d {:02}:{:02}:{:02}",
        secs / 86_400,
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60
    )
}

pub struct StatusHandler {
    storage: Arc<Storage>,
    log: LogRing,
    control: Arc<dyn SystemControl>,
    internal_dir: PathBuf,
    dav_url: String,
    network_name: Option<String>,
    started: Instant,
}

impl StatusHandler {
    pub fn new(
        storage: Arc<Storage>,
        log: LogRing,
        control: Arc<dyn SystemControl>,
        internal_dir: &Path,
        dav_url: &str,
    ) -> Self {
        StatusHandler {
            storage,
            log,
            control,
            internal_dir: internal_dir.to_path_buf(),
            dav_url: dav_url.to_string(),
            network_name: None,
            started: Instant::now(),
        }
    }

    /// Network name shown on the status page
    pub fn with_network_name(mut self, name: Option<String>) -> Self {
        self.network_name = name;
        self
    }

    fn page(&self, request: &Request<'_>, title: &str, content: &str) -> String {
        let mut html = String::new();
        html.push_str(&format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title>\
             <style>{STYLE}</style></head><body>"
        ));
        html.push_str(
            "<nav><a href=\"/\">Status</a> | <a href=\"/actions\">Actions</a> | \
             <a href=\"/debugLog\">Log</a></nav>",
        );
        if let Some(message) = request.query_param("success") {
            html.push_str(&format!("<p class=\"success\">{}</p>", escape_html(&message)));
        }
        if let Some(message) = request.query_param("error") {
            html.push_str(&format!("<p class=\"error\">{}</p>", escape_html(&message)));
        }
        html.push_str(&format!("<h1>{}</h1>{}</body></html>", escape_html(title), content));
        html
    }

    fn status_page(&self, request: &Request<'_>, response: &mut Response<'_>) -> Result<()> {
        let stats = self.storage.arbiter().stats();
        let mut rows = String::new();
        let mut row = |name: &str, value: &str| {
            rows.push_str(&format!("<tr><td>{}</td><td>{}</td></tr>", name, escape_html(value)));
        };
        row("Version", env!("CARGO_PKG_VERSION"));
        row("Uptime", &format_uptime(self.started.elapsed()));
        row("Network", self.network_name.as_deref().unwrap_or("(not configured)"));
        row("WebDAV", &self.dav_url);
        row("Bus held", if stats.held { "yes" } else { "no" });
        row("Release pending", if stats.release_pending { "yes" } else { "no" });
        row("Acquisitions", &stats.acquisitions.to_string());
        row("Mounts", &stats.mounts.to_string());
        row("Unmounts", &stats.unmounts.to_string());
        row("Mount failures", &stats.mount_failures.to_string());
        row("Queued writes", &self.storage.queued_writes().to_string());

        let content = format!(
            "<table>{}</table><p>Map <a href=\"{url}\">{url}</a> as a network drive.</p>",
            rows,
            url = escape_html(&self.dav_url)
        );
        let html = self.page(request, "SD Share", &content);
        response.send_typed(200, HTML_CONTENT_TYPE, html);
        Ok(())
    }

    fn actions_page(&self, request: &Request<'_>, response: &mut Response<'_>) -> Result<()> {
        let content = "<h2>Bulk profile edit</h2>\
            <form method=\"post\" action=\"/bulkEdit\">\
            <label>Address <input name=\"address\" placeholder=\"0x200\"></label> \
            <label>Value (hex) <input name=\"value\" placeholder=\"01ff\"></label> \
            <button type=\"submit\">Apply to all records</button></form>\
            <h2>Network</h2>\
            <form method=\"post\" action=\"/disableWifi\">\
            <button type=\"submit\">Disable network and restart</button></form>";
        let html = self.page(request, "Actions", content);
        response.send_typed(200, HTML_CONTENT_TYPE, html);
        Ok(())
    }

    fn debug_log(&self, request: &Request<'_>, response: &mut Response<'_>) -> Result<()> {
        let mut content = String::from("<pre>");
        for line in self.log.snapshot() {
            content.push_str(&escape_html(&line));
            content.push('\n');
        }
        content.push_str("</pre>");
        let html = self.page(request, "Debug log", &content);
        response.send_typed(200, HTML_CONTENT_TYPE, html);
        Ok(())
    }

    fn bulk_edit(&self, request: &mut Request<'_>, response: &mut Response<'_>) -> Result<()> {
        if request.method() != "POST" {
            response.set_header("Allow", "POST");
            response.send_status(405);
            return Ok(());
        }
        let body = request.read_body_limited(MAX_FORM_BODY)?;
        let form = parse_form(&String::from_utf8_lossy(&body));
        let field = |name: &str| {
            form.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .unwrap_or_default()
        };

        let patch = match PatchRequest::parse(field("address"), field("value")) {
            Ok(patch) => patch,
            Err(Error::InvalidArgument(message)) => return flash(response, "error", &message),
            Err(e) => return Err(e),
        };

        match bulk_patch(&self.storage, "/", &patch) {
            Ok(report) if report.failed == 0 => flash(response, "success", &report.summary()),
            Ok(report) => flash(response, "error", &report.summary()),
            Err(e) => {
                error!("Bulk edit failed: {}", e);
                flash(response, "error", &e.to_string())
            }
        }
    }

    fn disable_network(&self, response: &mut Response<'_>) -> Result<()> {
        let marker = self.internal_dir.join(DISABLE_MARKER);
        fs::write(&marker, b"")
            .map_err(|e| Error::from_io("write disable marker", &marker.to_string_lossy(), e))?;
        info!("Network disabled by request");
        self.control.schedule_reboot(REBOOT_DELAY);
        flash(
            response,
            "success",
            "Network disabled. Restarting; remove the marker from internal storage to re-enable.",
        )
    }

    fn not_found(&self, request: &Request<'_>, response: &mut Response<'_>) -> Result<()> {
        let content = format!(
            "<p class=\"error\">404: Not Found</p><p>{}</p>",
            escape_html(request.target())
        );
        let html = self.page(request, "Not found", &content);
        response.send_typed(404, HTML_CONTENT_TYPE, html);
        Ok(())
    }
}

/// 307 back to the actions page with a message
fn flash(response: &mut Response<'_>, kind: &str, message: &str) -> Result<()> {
    let location = format!("/actions?{}={}", kind, urlencoding::encode(message));
    response.redirect(&location);
    Ok(())
}

impl Handler for StatusHandler {
    fn handle<'h>(&'h self, request: &mut Request<'_>, response: &mut Response<'h>) -> Result<()> {
        let path = request.path()?;
        match path.as_str() {
            "/" => self.status_page(request, response),
            "/actions" => self.actions_page(request, response),
            "/debugLog" => self.debug_log(request, response),
            "/bulkEdit" => self.bulk_edit(request, response),
            "/disableWifi" => self.disable_network(response),
            _ => self.not_found(request, response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::hal::{DirectoryMedia, GpioBus, SimulatedSense, SimulatedSwitch};
    use crate::arbiter::Arbiter;
    use crate::config::ArbiterConfig;
    use crate::link::HostControl;
    use crate::record::{Record, RECORD_LEN};
    use crate::http::exchange;
    use tempfile::TempDir;

    struct Rig {
        card: TempDir,
        internal: TempDir,
        control: Arc<HostControl>,
        log: LogRing,
        handler: StatusHandler,
    }

    fn rig() -> Rig {
        let card = TempDir::new().unwrap();
        let internal = TempDir::new().unwrap();
        let hardware = GpioBus::new(
            SimulatedSense::new(true),
            SimulatedSwitch::new(),
            DirectoryMedia::new(card.path()),
        );
        let config = ArbiterConfig {
            debounce_ms: 50,
            poll_interval_ms: 5,
            boot_quiescence_ms: 0,
        };
        let storage = Arc::new(Storage::new(Arc::new(Arbiter::new(Box::new(hardware), config))));
        let control = Arc::new(HostControl::new());
        let log = LogRing::new(10);
        let handler = StatusHandler::new(
            storage,
            log.clone(),
            control.clone(),
            internal.path(),
            "http://10.0.0.7:81",
        )
        .with_network_name(Some("lab".to_string()));
        Rig {
            card,
            internal,
            control,
            log,
            handler,
        }
    }

    fn call(handler: &StatusHandler, raw: &str) -> (u16, String) {
        exchange(handler, raw)
    }

    fn post_form(handler: &StatusHandler, form: &str) -> (u16, String) {
        call(
            handler,
            &format!(
                "POST /bulkEdit HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\
                 Content-Length: {}\r\n\r\n{}",
                form.len(),
                form
            ),
        )
    }

    #[test]
    fn test_status_page() {
        let rig = rig();
        let (status, text) = call(&rig.handler, "GET / HTTP/1.1\r\n\r\n");
        assert_eq!(status, 200);
        assert!(text.contains(env!("CARGO_PKG_VERSION")));
        assert!(text.contains("http://10.0.0.7:81"));
        assert!(text.contains("<td>Network</td><td>lab</td>"));
    }

    #[test]
    fn test_flash_is_escaped() {
        let rig = rig();
        let (_, text) = call(
            &rig.handler,
            "GET /actions?error=%3Cscript%3E HTTP/1.1\r\n\r\n",
        );
        assert!(text.contains("<p class=\"error\">&lt;script&gt;</p>"));
        assert!(!text.contains("<script>"));
    }

    #[test]
    fn test_debug_log_lists_lines() {
        let rig = rig();
        rig.log.push("first <line>".to_string());
        rig.log.push("second".to_string());
        let (status, text) = call(&rig.handler, "GET /debugLog HTTP/1.1\r\n\r\n");
        assert_eq!(status, 200);
        assert!(text.contains("<pre>first &lt;line&gt;\nsecond\n</pre>"));
    }

    #[test]
    fn test_unknown_path() {
        let rig = rig();
        let (status, text) = call(&rig.handler, "GET /nothing HTTP/1.1\r\n\r\n");
        assert_eq!(status, 404);
        assert!(text.contains("404: Not Found"));
    }

    #[test]
    fn test_bulk_edit_rejects_bad_input() {
        let rig = rig();
        let (status, text) = post_form(&rig.handler, "address=zz&value=01");
        assert_eq!(status, 307);
        assert!(text.contains("Location: /actions?error=Invalid%20address"));

        let (status, text) = post_form(&rig.handler, "address=100&value=abc");
        assert_eq!(status, 307);
        assert!(text.contains("Location: /actions?error=Invalid%20value"));

        assert_eq!(call(&rig.handler, "GET /bulkEdit HTTP/1.1\r\n\r\n").0, 405);
    }

    #[test]
    fn test_bulk_edit_patches_records() {
        let rig = rig();
        fs::create_dir(rig.card.path().join("profiles")).unwrap();
        let mut record = Record::from_bytes(vec![0u8; RECORD_LEN]).unwrap();
        fs::write(rig.card.path().join("profiles/a.rt4"), record.save()).unwrap();

        let (status, text) = post_form(&rig.handler, "address=0x200&value=beef");
        assert_eq!(status, 307);
        assert!(text.contains("Location: /actions?success="));

        let bytes = fs::read(rig.card.path().join("profiles/a.rt4")).unwrap();
        assert_eq!(&bytes[0x200..0x202], &[0xBE, 0xEF]);
        assert!(Record::from_bytes(bytes).unwrap().checksum_valid());
    }

    #[test]
    fn test_bulk_edit_body_limit() {
        let rig = rig();
        let (status, _) = call(
            &rig.handler,
            "POST /bulkEdit HTTP/1.1\r\nContent-Length: 100000\r\n\r\n",
        );
        assert_eq!(status, 413);
    }

    #[test]
    fn test_disable_network() {
        let rig = rig();
        let (status, text) = call(&rig.handler, "POST /disableWifi HTTP/1.1\r\n\r\n");
        assert_eq!(status, 307);
        assert!(text.contains("Location: /actions?success="));
        assert!(rig.internal.path().join(DISABLE_MARKER).exists());
        assert_eq!(rig.control.reboot_requests(), 1);
    }

    #[test]
    fn test_uptime_format() {
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 01:01:01");
        assert_eq!(format_uptime(Duration::from_secs(59)), "0d 00:00:59");
    }
}
