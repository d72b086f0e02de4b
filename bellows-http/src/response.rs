//! HTTP/1.x response builder.

use std::collections::HashMap;

use bellows::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 200,
    MovedPermanently = 301,
    BadRequest = 400,
    NotFound = 404,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        *self as u16
    }
}

pub struct HttpResponse {
    status_code: StatusCode,
    status_message: String,
    close_connection: bool,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(close_connection: bool) -> HttpResponse {
        HttpResponse {
            status_code: StatusCode::NotFound,
            status_message: String::new(),
            close_connection,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn set_status_code(&mut self, code: StatusCode) {
        self.status_code = code;
    }

    pub fn set_status_message(&mut self, message: &str) {
        self.status_message = message.to_string();
    }

    pub fn set_close_connection(&mut self, close: bool) {
        self.close_connection = close;
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.add_header("Content-Type", content_type);
    }

    /// Body bytes are sent verbatim.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Encode the response: status line, framing header, user headers, a
    /// blank line, then the body.
    pub fn append_to_buffer(&self, out: &mut Buffer) {
        out.append(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status_code.code(),
                self.status_message
            )
            .as_bytes(),
        );
        if self.close_connection {
            out.append(b"Connection: close\r\n");
        } else {
            out.append(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        for (name, value) in &self.headers {
            out.append(format!("{name}: {value}\r\n").as_bytes());
        }
        out.append(b"\r\n");
        out.append(&self.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_response_bytes() {
        let mut response = HttpResponse::new(false);
        response.set_status_code(StatusCode::Ok);
        response.set_status_message("OK");
        response.set_body("hello");

        let mut buf = Buffer::new();
        response.append_to_buffer(&mut buf);
        assert_eq!(
            buf.retrieve_all_as_string(),
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello"
        );
    }

    #[test]
    fn test_close_response_has_no_content_length() {
        let mut response = HttpResponse::new(true);
        response.set_status_code(StatusCode::NotFound);
        response.set_status_message("Not Found");

        let mut buf = Buffer::new();
        response.append_to_buffer(&mut buf);
        assert_eq!(
            buf.retrieve_all_as_string(),
            "HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n"
        );
    }
}
