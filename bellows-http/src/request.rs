//! Parsed HTTP/1.x request.

use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
}

impl Method {
    pub(crate) fn parse(bytes: &[u8]) -> Option<Method> {
        match bytes {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"HEAD" => Some(Method::Head),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    #[default]
    Unknown,
    Http10,
    Http11,
}

#[derive(Debug, Default)]
pub struct HttpRequest {
    method: Option<Method>,
    version: Version,
    path: String,
    headers: HashMap<String, String>,
    receive_time: Option<Instant>,
}

impl HttpRequest {
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Header lookup by exact name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    /// When the bytes completing the request arrived.
    pub fn receive_time(&self) -> Option<Instant> {
        self.receive_time
    }

    pub(crate) fn set_method(&mut self, bytes: &[u8]) -> bool {
        match Method::parse(bytes) {
            Some(method) => {
                self.method = Some(method);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_path(&mut self, bytes: &[u8]) {
        self.path = String::from_utf8_lossy(bytes).into_owned();
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn set_receive_time(&mut self, at: Instant) {
        self.receive_time = Some(at);
    }

    /// Store a header, trimming optional whitespace around the value.
    pub(crate) fn add_header(&mut self, name: &[u8], value: &[u8]) {
        let name = String::from_utf8_lossy(name).into_owned();
        let value = String::from_utf8_lossy(value).trim().to_string();
        self.headers.insert(name, value);
    }
}
