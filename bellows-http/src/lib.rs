//! bellows-http - a minimal HTTP/1.x request server on top of the bellows
//! reactor.
//!
//! Covers request-line and header parsing, keep-alive, and response
//! encoding. Bodies are not consumed: a request carrying one leaves its
//! bytes in the connection's input buffer for the application.

pub mod context;
pub mod request;
pub mod response;
pub mod server;

// Public API re-exports
pub use context::HttpContext;
pub use request::{HttpRequest, Method, Version};
pub use response::{HttpResponse, StatusCode};
pub use server::{HttpCallback, HttpServer};
