//! Incremental HTTP/1.x request parser, one instance per connection.
//!
//! Attached to a connection's opaque context slot; feeds on the input
//! buffer across however many message events it takes for a request to
//! arrive. Body bytes are never consumed here: anything after the header
//! terminator stays in the buffer for the application.

use std::mem;
use std::time::Instant;

use bellows::Buffer;

use crate::request::{HttpRequest, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    ExpectRequestLine,
    ExpectHeaders,
    ExpectBody,
    GotAll,
}

pub struct HttpContext {
    state: ParseState,
    request: HttpRequest,
}

impl Default for HttpContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpContext {
    pub fn new() -> HttpContext {
        HttpContext {
            state: ParseState::ExpectRequestLine,
            request: HttpRequest::default(),
        }
    }

    pub fn got_all(&self) -> bool {
        self.state == ParseState::GotAll
    }

    /// Consume as much of `buf` as currently parses. Returns false on a
    /// malformed request; true otherwise (including "need more bytes").
    pub fn parse(&mut self, buf: &mut Buffer, receive_time: Instant) -> bool {
        loop {
            match self.state {
                ParseState::ExpectRequestLine => {
                    let Some(pos) = buf.find_crlf() else {
                        return true;
                    };
                    if !self.process_request_line(&buf.peek()[..pos]) {
                        return false;
                    }
                    self.request.set_receive_time(receive_time);
                    buf.retrieve(pos + 2);
                    self.state = ParseState::ExpectHeaders;
                }
                ParseState::ExpectHeaders => {
                    let Some(pos) = buf.find_crlf() else {
                        return true;
                    };
                    {
                        let line = &buf.peek()[..pos];
                        match line.iter().position(|&b| b == b':') {
                            Some(colon) => {
                                self.request.add_header(&line[..colon], &line[colon + 1..]);
                            }
                            None => {
                                // Empty line: end of headers.
                                self.state = ParseState::GotAll;
                            }
                        }
                    }
                    buf.retrieve(pos + 2);
                }
                // Bodies are the application's concern; whatever follows the
                // headers is left in the buffer.
                ParseState::ExpectBody | ParseState::GotAll => return true,
            }
        }
    }

    /// `METHOD SP PATH SP "HTTP/1." ("0"|"1")`
    fn process_request_line(&mut self, line: &[u8]) -> bool {
        let Some(first_space) = line.iter().position(|&b| b == b' ') else {
            return false;
        };
        if !self.request.set_method(&line[..first_space]) {
            return false;
        }
        let rest = &line[first_space + 1..];
        let Some(second_space) = rest.iter().position(|&b| b == b' ') else {
            return false;
        };
        self.request.set_path(&rest[..second_space]);

        let version = &rest[second_space + 1..];
        if version.len() != 8 || &version[..7] != b"HTTP/1." {
            return false;
        }
        match version[7] {
            b'1' => self.request.set_version(Version::Http11),
            b'0' => self.request.set_version(Version::Http10),
            _ => return false,
        }
        true
    }

    /// Hand the finished request out and reset for the next one on the
    /// same connection.
    pub fn take_request(&mut self) -> HttpRequest {
        debug_assert!(self.got_all());
        self.state = ParseState::ExpectRequestLine;
        mem::take(&mut self.request)
    }

    pub fn reset(&mut self) {
        self.state = ParseState::ExpectRequestLine;
        self.request = HttpRequest::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;

    fn parse_all(input: &[u8]) -> (bool, HttpContext) {
        let mut buf = Buffer::new();
        buf.append(input);
        let mut context = HttpContext::new();
        let ok = context.parse(&mut buf, Instant::now());
        (ok, context)
    }

    #[test]
    fn test_parse_get_request() {
        let (ok, mut context) =
            parse_all(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: t\r\n\r\n");
        assert!(ok);
        assert!(context.got_all());
        let request = context.take_request();
        assert_eq!(request.method(), Some(Method::Get));
        assert_eq!(request.path(), "/index.html");
        assert_eq!(request.version(), Version::Http11);
        assert_eq!(request.header("Host"), Some("example.com"));
        assert_eq!(request.header("User-Agent"), Some("t"));
    }

    #[test]
    fn test_parse_http10() {
        let (ok, context) = parse_all(b"HEAD / HTTP/1.0\r\n\r\n");
        assert!(ok);
        assert!(context.got_all());
    }

    #[test]
    fn test_header_value_whitespace_trimmed() {
        let (ok, mut context) = parse_all(b"GET / HTTP/1.1\r\nHost:   spaced.example   \r\n\r\n");
        assert!(ok);
        let request = context.take_request();
        assert_eq!(request.header("Host"), Some("spaced.example"));
    }

    #[test]
    fn test_incremental_feed() {
        let mut buf = Buffer::new();
        let mut context = HttpContext::new();
        let now = Instant::now();

        buf.append(b"GET /hel");
        assert!(context.parse(&mut buf, now));
        assert!(!context.got_all());

        buf.append(b"lo HTTP/1.1\r\nHo");
        assert!(context.parse(&mut buf, now));
        assert!(!context.got_all());

        buf.append(b"st: x\r\n\r\n");
        assert!(context.parse(&mut buf, now));
        assert!(context.got_all());
        let request = context.take_request();
        assert_eq!(request.path(), "/hello");
        assert_eq!(request.header("Host"), Some("x"));
    }

    #[test]
    fn test_missing_spaces_is_invalid() {
        let (ok, _) = parse_all(b"GET\r\n\r\n");
        assert!(!ok);
    }

    #[test]
    fn test_unknown_method_is_invalid() {
        let (ok, _) = parse_all(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert!(!ok);
    }

    #[test]
    fn test_unsupported_version_is_invalid() {
        let (ok, _) = parse_all(b"GET / HTTP/2.0\r\n\r\n");
        assert!(!ok);
        let (ok, _) = parse_all(b"GET / HTTP/1.2\r\n\r\n");
        assert!(!ok);
    }

    #[test]
    fn test_body_bytes_left_in_buffer() {
        let mut buf = Buffer::new();
        buf.append(b"POST /submit HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd");
        let mut context = HttpContext::new();
        assert!(context.parse(&mut buf, Instant::now()));
        assert!(context.got_all());
        let request = context.take_request();
        assert_eq!(request.header("Content-Length"), Some("4"));
        // The body is the application's to read.
        assert_eq!(buf.peek(), b"abcd");
    }

    #[test]
    fn test_reset_allows_reuse() {
        let (ok, mut context) = parse_all(b"GET /a HTTP/1.1\r\n\r\n");
        assert!(ok);
        let _ = context.take_request();

        let mut buf = Buffer::new();
        buf.append(b"PUT /b HTTP/1.1\r\n\r\n");
        assert!(context.parse(&mut buf, Instant::now()));
        assert!(context.got_all());
        assert_eq!(context.take_request().method(), Some(Method::Put));
    }
}
