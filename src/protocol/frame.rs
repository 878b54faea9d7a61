//! Frame format shared by the frontend and the signing service.
//!
//! A frame consists of a **start line**, zero or more **headers**,
//! an `End:` marker and an optional body.  Requests start with a
//! verb (`PUBLISH`, `FETCH`, `SIGN`, ...); responses start with a
//! numeric status followed by a short reason token, e.g.
//! `200 SIGNED` or `409 CONFLICT`.  Headers are key-value pairs
//! separated by a colon and a space.  All line endings are CRLF.
//!
//! The body is arbitrary text whose byte length travels in the
//! `Content-Length` header, so a reader knows exactly where one
//! frame ends and the next begins on a long lived connection.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Result};

pub const CONTENT_LENGTH: &str = "Content-Length";

/// A parsed frame.  `verb` holds the first token of the start line,
/// `args` the remaining tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub verb: String,
    pub args: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl Frame {
    pub fn new<S: Into<String>>(verb: S) -> Self {
        Frame {
            verb: verb.into(),
            args: vec![],
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// A response frame: `<status> <reason>`.
    pub fn response(status: u16, reason: &str) -> Self {
        Frame::new(status.to_string()).with_arg(reason)
    }

    pub fn with_arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_header<S: Into<String>>(mut self, key: S, value: &str) -> Self {
        self.set_header(key, value);
        self
    }

    pub fn with_body<S: Into<String>>(mut self, body: S) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Parse the head of a frame (start line through `End:`) plus
    /// any body text that follows it in `raw`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (head, body) = match raw.split_once("End:\r\n") {
            Some((head, body)) => (head, body),
            None => (raw, ""),
        };
        let mut lines = head.split("\r\n");
        let start_line = lines.next().ok_or_else(|| anyhow!("missing start line"))?;
        let mut parts = start_line.split_whitespace();
        let verb = parts
            .next()
            .ok_or_else(|| anyhow!("empty start line"))?
            .to_string();
        let args = parts.map(|s| s.to_string()).collect::<Vec<_>>();
        let mut headers = BTreeMap::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (key, val) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed header line {:?}", line))?;
            headers.insert(key.trim().to_string(), val.trim().to_string());
        }
        let body = if body.is_empty() {
            None
        } else {
            Some(body.to_string())
        };
        Ok(Frame {
            verb,
            args,
            headers,
            body,
        })
    }

    /// Header values are stored as given, without case folding.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn set_header<S: Into<String>>(&mut self, key: S, value: &str) {
        self.headers.insert(key.into(), value.to_string());
    }

    /// Numeric status of a response frame.
    pub fn status(&self) -> Option<u16> {
        self.verb.parse().ok()
    }

    /// Declared body length, zero when absent.
    pub fn content_length(&self) -> Result<usize> {
        match self.header(CONTENT_LENGTH) {
            Some(v) => v
                .parse()
                .map_err(|_| anyhow!("invalid {} {:?}", CONTENT_LENGTH, v)),
            None => Ok(0),
        }
    }
}

impl fmt::Display for Frame {
    /// The wire form.  `Content-Length` is always derived from the
    /// body rather than copied from `headers`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verb)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        f.write_str("\r\n")?;
        for (k, v) in self.headers.iter().filter(|(k, _)| k.as_str() != CONTENT_LENGTH) {
            write!(f, "{k}: {v}\r\n")?;
        }
        if let Some(body) = &self.body {
            write!(f, "{CONTENT_LENGTH}: {}\r\n", body.len())?;
        }
        f.write_str("End:\r\n")?;
        if let Some(body) = &self.body {
            f.write_str(body)?;
        }
        Ok(())
    }
}
