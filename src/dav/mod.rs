//! WebDAV handler
//!
//! Implements the subset of RFC 4918 that common desktop clients need on top
//! of [`Storage`]. Apart from the advisory [`LockTable`] every request is
//! handled on its own.

pub mod locks;
pub mod xml;


pub use locks::LockTable;

use crate::error::{Error, Result};
use crate::http::message::{http_date, parse_http_date};
use crate::http::{Handler, Request, Response};
use crate::storage::{paths, ClientStream, Storage};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use xml::PropEntry;

/// Largest in-memory request body (LOCK, PROPPATCH)
pub const MAX_XML_BODY: u64 = 64 * 1024;

/// Methods listed in `Allow`
pub const ALLOWED_METHODS: &str =
    "OPTIONS, GET, HEAD, PUT, LOCK, UNLOCK, PROPFIND, PROPPATCH, DELETE, MKCOL, MOVE";

const XML_CONTENT_TYPE: &str = "text/xml; charset=\"utf-8\"";

/// Percent-encode a client path for an href, leaving `/` alone and dropping a trailing one
pub fn encode_path(path: &str) -> String {
    urlencoding::encode(path)
        .replace('+', "%20")
        .replace("%2F", "/")
        .trim_end_matches('/')
        .to_string()
}

/// Path part of a `Destination` header, decoded and normalized
///
/// Accepts an absolute URL (`http://host:81/a/b`) or a bare path.
pub fn destination_path(header: &str) -> Result<String> {
    let header = header.trim();
    let after_authority = match header.find("://") {
        Some(idx) => {
            let rest = &header[idx + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => header,
    };
    let raw = after_authority
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let decoded = urlencoding::decode(raw)
        .map_err(|_| Error::InvalidArgument(format!("undecodable destination {:?}", header)))?;
    paths::normalize(&decoded)
}

/// Status-only answer
fn reply(response: &mut Response<'_>, status: u16) -> Result<()> {
    response.send_status(status);
    Ok(())
}

/// WebDAV front end for one [`Storage`]
pub struct DavHandler {
    storage: Arc<Storage>,
    locks: LockTable,
    base_url: String,
    property_pattern: Regex,
}

impl DavHandler {
    /// `base_url` prefixes every href, e.g. `http://192.168.1.20:81`
    pub fn new(storage: Arc<Storage>, base_url: &str) -> Result<Self> {
        let property_pattern = Regex::new(r"<Z:(\w+)>")
            .map_err(|e| Error::InvalidArgument(format!("property pattern: {}", e)))?;

        Ok(DavHandler {
            storage,
            locks: LockTable::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            property_pattern,
        })
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    fn href(&self, path: &str, is_directory: bool) -> String {
        let mut href = format!("{}{}", self.base_url, encode_path(path));
        if is_directory {
            href.push('/');
        }
        href
    }

    fn get<'h>(&'h self, request: &Request<'_>, response: &mut Response<'h>, path: &str, head: bool) -> Result<()> {
        let since = request.header("If-Modified-Since").and_then(parse_http_date);
        match self.storage.stream_to_client(path, since, !head)? {
            ClientStream::NotModified(properties) => {
                response.set_header("Last-Modified", http_date(&properties.modified));
                response.send_status(304);
            }
            ClientStream::Content { properties, reader } => {
                response.set_status(200);
                response.set_header("Last-Modified", http_date(&properties.modified));
                response.stream(properties.size, reader);
            }
        }
        Ok(())
    }

    fn put(&self, request: &mut Request<'_>, response: &mut Response<'_>, path: &str) -> Result<()> {
        if request.is_chunked() {
            return reply(response, 411);
        }
        if self.storage.exists_directory(path) {
            return Err(Error::Conflict(format!("{} is a collection", path)));
        }
        if let Some(parent) = self.storage.parent_of(path)? {
            if !self.storage.exists_directory(&parent) {
                return Err(Error::Conflict(format!("parent {} does not exist", parent)));
            }
        }

        // Must be checked before the write creates the file
        let existed = self.storage.exists_file(path);
        let length = request.content_length().unwrap_or(0);
        self.storage
            .stream_from_client(path, request.body(), length)?;

        reply(response, if existed { 204 } else { 201 })
    }

    fn delete(&self, response: &mut Response<'_>, path: &str) -> Result<()> {
        if self.storage.exists_file(path) {
            self.storage.delete_file(path)?;
        } else if self.storage.exists_directory(path) {
            self.storage.delete_directory(path, true)?;
        } else {
            return reply(response, 404);
        }
        reply(response, 204)
    }

    fn mkcol(&self, response: &mut Response<'_>, path: &str) -> Result<()> {
        if self.storage.exists_directory(path) {
            return reply(response, 409);
        }
        self.storage.create_directory(path)?;
        reply(response, 201)
    }

    fn move_entry(&self, request: &Request<'_>, response: &mut Response<'_>, path: &str) -> Result<()> {
        let header = match request.header("Destination") {
            Some(h) if !h.trim().is_empty() => h.to_string(),
            _ => return reply(response, 400),
        };
        let destination = destination_path(&header)?;

        if destination == path || destination == "/" {
            return reply(response, 403);
        }
        match self.storage.parent_of(&destination)? {
            Some(parent) if self.storage.exists_directory(&parent) => {}
            _ => return reply(response, 409),
        }

        let is_file = self.storage.exists_file(path);
        let is_directory = !is_file && self.storage.exists_directory(path);
        if !is_file && !is_directory {
            return reply(response, 404);
        }

        let overwrite = request
            .header("Overwrite")
            .map(|v| !v.trim().eq_ignore_ascii_case("F"))
            .unwrap_or(true);
        if self.storage.exists_file(&destination) {
            if !overwrite {
                return reply(response, 412);
            }
            self.storage.delete_file(&destination)?;
        } else if self.storage.exists_directory(&destination) {
            if !overwrite {
                return reply(response, 412);
            }
            self.storage.delete_directory(&destination, true)?;
        }

        if is_file {
            self.storage.move_file(path, &destination)?;
        } else {
            self.storage.move_directory(path, &destination)?;
        }

        response.set_header("Location", header);
        reply(response, 204)
    }

    fn lock(&self, request: &mut Request<'_>, response: &mut Response<'_>, path: &str) -> Result<()> {
        // Body is read to enforce the limit; its contents are not interpreted
        request.read_body_limited(MAX_XML_BODY)?;

        let token = self.locks.lock(path);
        response.set_header("Lock-Token", format!("<urn:uuid:{}>", token));
        response.send_typed(200, XML_CONTENT_TYPE, xml::lock_discovery(&token));
        Ok(())
    }

    fn unlock(&self, response: &mut Response<'_>, path: &str) -> Result<()> {
        if !self.locks.unlock(path) {
            debug!(path, "UNLOCK without a lock");
        }
        reply(response, 204)
    }

    fn propfind(&self, request: &Request<'_>, response: &mut Response<'_>, path: &str) -> Result<()> {
        let include_children = request
            .header("Depth")
            .map(|d| {
                let d = d.trim();
                d == "1" || d.eq_ignore_ascii_case("infinity")
            })
            .unwrap_or(false);

        let mut entries = Vec::new();
        if self.storage.exists_directory(path) {
            entries.push(self.entry(path, true)?);

            if include_children {
                for dir in self.storage.list_directories(path)? {
                    self.push_child(&mut entries, &dir, true);
                }
                for file in self.storage.list_files(path)? {
                    self.push_child(&mut entries, &file, false);
                }
            }
        } else if self.storage.exists_file(path) {
            entries.push(self.entry(path, false)?);
        } else {
            return reply(response, 404);
        }

        response.send_typed(207, XML_CONTENT_TYPE, xml::multistatus(&entries));
        Ok(())
    }

    fn entry(&self, path: &str, is_directory: bool) -> Result<PropEntry> {
        let properties = if is_directory {
            self.storage.directory_properties(path)?
        } else {
            self.storage.file_properties(path)?
        };
        Ok(PropEntry {
            href: self.href(path, is_directory),
            is_directory,
            properties,
            lock_token: self.locks.token(path),
        })
    }

    /// Children that vanish between listing and stat are skipped
    fn push_child(&self, entries: &mut Vec<PropEntry>, path: &str, is_directory: bool) {
        match self.entry(path, is_directory) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path, "Skipping entry in PROPFIND: {}", e),
        }
    }

    fn proppatch(&self, request: &mut Request<'_>, response: &mut Response<'_>, path: &str) -> Result<()> {
        let body = request.read_body_limited(MAX_XML_BODY)?;
        let text = String::from_utf8_lossy(&body);

        let names: Vec<String> = self
            .property_pattern
            .captures_iter(&text)
            .map(|c| c[1].to_string())
            .collect();
        for name in &names {
            debug!(path, "PROP: {}", name);
        }

        let ack = xml::proppatch_ack(&self.href(path, false), &names);
        response.send_typed(207, XML_CONTENT_TYPE, ack);
        Ok(())
    }

    fn options(&self, response: &mut Response<'_>) -> Result<()> {
        response.set_header("DAV", "1");
        response.set_header("Allow", ALLOWED_METHODS);
        response.set_header("MS-Author-Via", "DAV");
        reply(response, 200)
    }
}

impl Handler for DavHandler {
    fn handle<'h>(&'h self, request: &mut Request<'_>, response: &mut Response<'h>) -> Result<()> {
        for name in ["Depth", "Range", "Destination"] {
            if let Some(value) = request.header(name) {
                debug!("{}: {}", name, value);
            }
        }
        if let Some(length) = request.content_length().filter(|&l| l > 0) {
            debug!("ContentLength: {}", length);
        }

        let path = paths::normalize(&request.path()?)?;
        let method = request.method().to_string();

        match method.as_str() {
            "GET" => self.get(request, response, &path, false),
            "HEAD" => self.get(request, response, &path, true),
            "DELETE" => self.delete(response, &path),
            "PUT" => self.put(request, response, &path),
            "MKCOL" => self.mkcol(response, &path),
            "LOCK" => self.lock(request, response, &path),
            "UNLOCK" => self.unlock(response, &path),
            "PROPFIND" => self.propfind(request, response, &path),
            "PROPPATCH" => self.proppatch(request, response, &path),
            "MOVE" => {
                let result = self.move_entry(request, response, &path);
                if result.is_ok() && response.status() == 204 {
                    info!(from = %path, "MOVE complete");
                }
                result
            }
            "OPTIONS" => self.options(response),
            other => {
                debug!("Unsupported method {}", other);
                response.set_header("Allow", ALLOWED_METHODS);
                reply(response, 405)
            }
        }
    }
}
