//! Request and response types handed to handlers
//!
//! Wire framing belongs to `tiny_http`. A [`Request`] is the head it parsed
//! plus its body reader; a [`Response`] collects status, headers and payload
//! and is converted into a `tiny_http` response once the handler returns.
//! A streamed payload may borrow from the handler (a file read under the bus
//! guard), so the guard is held until the last byte has been written.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::io::{self, Cursor, Read};
use tiny_http::{Header, StatusCode};
use tracing::warn;

/// Format a timestamp as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`)
pub fn http_date(time: &DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an HTTP date header value
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Split `a=1&b=two` into decoded pairs; `+` means space
pub fn parse_form(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_form_component(name), decode_form_component(value))
        })
        .collect()
}

fn decode_form_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Parsed request head plus its body stream
pub struct Request<'a> {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
    content_length: Option<u64>,
    body: &'a mut dyn Read,
}

impl<'a> Request<'a> {
    pub fn new(
        method: impl Into<String>,
        target: impl Into<String>,
        headers: Vec<(String, String)>,
        body: &'a mut dyn Read,
    ) -> Self {
        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse().ok());

        Request {
            method: method.into(),
            target: target.into(),
            headers,
            content_length,
            body,
        }
    }

    /// Copy the head out of a `tiny_http` request and borrow its body
    pub fn from_http(exchange: &'a mut tiny_http::Request) -> Self {
        let method = exchange.method().to_string();
        let target = exchange.url().to_string();
        let headers = exchange
            .headers()
            .iter()
            .map(|h| (h.field.to_string(), h.value.to_string()))
            .collect();
        Request::new(method, target, headers, exchange.as_reader())
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Raw request target, query included
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Percent-decoded path without the query string; `+` is kept literally
    pub fn path(&self) -> Result<String> {
        let raw = self.target.split('?').next().unwrap_or_default();
        urlencoding::decode(raw)
            .map(|p| p.into_owned())
            .map_err(|_| Error::InvalidArgument(format!("undecodable path {:?}", raw)))
    }

    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    /// Decoded query parameter
    pub fn query_param(&self, name: &str) -> Option<String> {
        parse_form(self.query()?)
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Body bytes, already de-chunked by the transport
    pub fn body(&mut self) -> &mut dyn Read {
        &mut *self.body
    }

    /// Read the whole body into memory, refusing anything above `max`
    pub fn read_body_limited(&mut self, max: u64) -> Result<Vec<u8>> {
        if let Some(len) = self.content_length.filter(|&len| len > max) {
            return Err(Error::TooLarge { len, max });
        }

        let mut data = Vec::with_capacity(self.content_length.unwrap_or(0) as usize);
        (&mut *self.body)
            .take(max + 1)
            .read_to_end(&mut data)
            .map_err(|e| Error::from_io("read request body", &self.target, e))?;

        let read = data.len() as u64;
        if read > max {
            return Err(Error::TooLarge { len: read, max });
        }
        if let Some(len) = self.content_length.filter(|&len| read < len) {
            return Err(Error::InvalidArgument(format!(
                "body ended after {} of {} bytes",
                read, len
            )));
        }
        Ok(data)
    }
}

enum Payload<'h> {
    Empty,
    Bytes(Vec<u8>),
    /// `len` is announced even when `reader` yields nothing (HEAD)
    Stream { reader: Box<dyn Read + 'h>, len: u64 },
}

/// Response under construction
///
/// Nothing reaches the client until the worker sends it, so a handler that
/// fails or panics halfway can still be answered with a clean error.
pub struct Response<'h> {
    status: u16,
    headers: Vec<(String, String)>,
    payload: Payload<'h>,
}

impl Default for Response<'_> {
    fn default() -> Self {
        Response::new()
    }
}

impl<'h> Response<'h> {
    pub fn new() -> Self {
        Response {
            status: 200,
            headers: Vec::new(),
            payload: Payload::Empty,
        }
    }

    /// Fresh response carrying only `status`
    pub fn error(status: u16) -> Self {
        let mut response = Response::new();
        response.set_status(status);
        response
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Set a header, replacing an existing one with the same name
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(existing) => existing.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Length announced to the client
    pub fn content_length(&self) -> u64 {
        match &self.payload {
            Payload::Empty => 0,
            Payload::Bytes(bytes) => bytes.len() as u64,
            Payload::Stream { len, .. } => *len,
        }
    }

    /// Complete in-memory body
    pub fn send(&mut self, body: impl Into<Vec<u8>>) {
        self.payload = Payload::Bytes(body.into());
    }

    /// Announce `len` bytes and pull them from `reader` while sending
    pub fn stream(&mut self, len: u64, reader: impl Read + 'h) {
        self.payload = Payload::Stream {
            reader: Box::new(reader),
            len,
        };
    }

    pub fn send_empty(&mut self) {
        self.payload = Payload::Empty;
    }

    /// Set the status and drop any body
    pub fn send_status(&mut self, status: u16) {
        self.set_status(status);
        self.send_empty();
    }

    /// Body with its content type
    pub fn send_typed(&mut self, status: u16, content_type: &str, body: impl Into<Vec<u8>>) {
        self.set_status(status);
        self.set_header("Content-Type", content_type);
        self.send(body);
    }

    /// 307 to `location`
    pub fn redirect(&mut self, location: &str) {
        self.set_header("Location", location);
        self.send_status(307);
    }

    /// Drain the payload into memory
    pub fn into_body(self) -> io::Result<Vec<u8>> {
        match self.payload {
            Payload::Empty => Ok(Vec::new()),
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Stream { mut reader, len } => {
                let mut data = Vec::with_capacity(len.min(64 * 1024) as usize);
                reader.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }

    /// Convert for sending; headers `tiny_http` cannot encode are dropped
    pub fn into_http(self) -> tiny_http::Response<Box<dyn Read + 'h>> {
        let mut headers = Vec::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            match Header::from_bytes(name.as_bytes(), value.as_bytes()) {
                Ok(header) => headers.push(header),
                Err(()) => warn!(header = %name, "Dropping unencodable response header"),
            }
        }

        let (data, len): (Box<dyn Read + 'h>, u64) = match self.payload {
            Payload::Empty => (Box::new(io::empty()), 0),
            Payload::Bytes(bytes) => {
                let len = bytes.len() as u64;
                (Box::new(Cursor::new(bytes)), len)
            }
            Payload::Stream { reader, len } => (reader, len),
        };

        tiny_http::Response::new(
            StatusCode(self.status),
            headers,
            data,
            Some(len as usize),
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request<'a>(target: &str, headers: &[(&str, &str)], body: &'a mut dyn Read) -> Request<'a> {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Request::new("PUT", target, headers, body)
    }

    #[test]
    fn test_request_accessors() {
        let mut body = Cursor::new(b"hello".to_vec());
        let mut request = request(
            "/dir/a%20b+c.txt?x=1&name=a+b",
            &[("Host", "sd"), ("Content-Length", "5")],
            &mut body,
        );

        assert_eq!(request.method(), "PUT");
        assert_eq!(request.path().unwrap(), "/dir/a b+c.txt");
        assert_eq!(request.query(), Some("x=1&name=a+b"));
        assert_eq!(request.query_param("name").as_deref(), Some("a b"));
        assert_eq!(request.header("host"), Some("sd"));
        assert_eq!(request.content_length(), Some(5));
        assert!(!request.is_chunked());

        let mut data = Vec::new();
        request.body().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn test_body_limit_declared() {
        let mut body = io::empty();
        let mut request = request("/", &[("Content-Length", "70000")], &mut body);
        let err = request.read_body_limited(65_536).unwrap_err();
        assert_eq!(err.status_code(), 413);
    }

    #[test]
    fn test_body_limit_without_length() {
        let mut body = Cursor::new(vec![b'x'; 100]);
        let mut request = request("/", &[("Transfer-Encoding", "chunked")], &mut body);
        assert!(request.is_chunked());
        assert_eq!(request.read_body_limited(64).unwrap_err().status_code(), 413);
    }

    #[test]
    fn test_short_body() {
        let mut body = Cursor::new(b"abc".to_vec());
        let mut request = request("/", &[("Content-Length", "10")], &mut body);
        assert_eq!(request.read_body_limited(1024).unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_response_builder() {
        let mut response = Response::new();
        response.set_header("DAV", "1");
        response.set_header("dav", "2");
        response.send_typed(207, "text/xml", "<x/>");

        assert_eq!(response.status(), 207);
        assert_eq!(response.headers().len(), 2);
        assert_eq!(response.header("DAV"), Some("2"));
        assert_eq!(response.content_length(), 4);
        assert_eq!(response.into_body().unwrap(), b"<x/>");
    }

    #[test]
    fn test_streamed_head_announces_length() {
        let mut response = Response::new();
        response.stream(7, io::empty());
        assert_eq!(response.content_length(), 7);
        assert!(response.into_body().unwrap().is_empty());

        let mut response = Response::new();
        response.redirect("/actions");
        assert_eq!(response.status(), 307);
        assert_eq!(response.header("Location"), Some("/actions"));
        assert_eq!(response.content_length(), 0);
    }

    #[test]
    fn test_http_date_round_trip() {
        let time = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(http_date(&time), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"), Some(time));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn test_parse_form() {
        let pairs = parse_form("address=0x20&value=AB%20CD&flag&name=a+b");
        assert_eq!(pairs[0], ("address".to_string(), "0x20".to_string()));
        assert_eq!(pairs[1].1, "AB CD");
        assert_eq!(pairs[2], ("flag".to_string(), String::new()));
        assert_eq!(pairs[3].1, "a b");
    }
}
