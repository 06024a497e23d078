//! Protocol module - Defines the text wire format spoken by calculator peers
//!
//! Messages are framed like a stripped-down HTTP/1.1 exchange:
//! - a start line (`POST / HTTP/1.1` or `HTTP/1.1 200 OK`)
//! - `Name: value` header lines
//! - a blank line
//! - an optional body (URL-encoded form data for requests, plain text for responses)
//!
//! The same framing is used verbatim over TCP and UDP.

mod codec;
mod message;

pub use codec::*;
pub use message::*;

/// Protocol version written on every start line
pub const HTTP_VERSION: &str = "HTTP/1.1";

/// Value of the `Server` response header
pub const SERVER_NAME: &str = "calculator/0.1";

/// Value of the `Content-Type` header on both message kinds
pub const CONTENT_TYPE: &str = "text/plain";

/// Form field that carries the expression to evaluate
pub const EXPRESSION_PARAM: &str = "expression";

/// Body sent with every 406 response
pub const REJECTED_BODY: &str = "-1";

/// Default host for both peers
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port the server listens on (TCP and UDP)
pub const DEFAULT_SERVER_PORT: u16 = 50123;

/// Default port the UDP client binds to
pub const DEFAULT_CLIENT_PORT: u16 = 50321;
