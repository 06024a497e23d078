//! Protocol codec for building and parsing frames
//!
//! All functions are pure: they turn structured values into wire bytes and
//! back, with no I/O.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{
    Headers, Method, Params, Request, Response, StatusCode, CONTENT_TYPE, HTTP_VERSION,
    SERVER_NAME,
};

const LINE_END: &[u8] = b"\r\n";

/// Separates the header block from the body
const HEADER_TERMINATOR: &str = "\r\n\r\n";

/// RFC 1123 date, always in GMT
const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Errors raised while reading peer bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Message is empty")]
    Empty,

    #[error("Message is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("Malformed start line: {0:?}")]
    MalformedStartLine(String),

    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Status is not an integer: {0:?}")]
    InvalidStatus(String),

    #[error("Unknown status code: {0}")]
    UnknownStatus(u16),
}

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(Method),

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Build a request frame. Only POST can be built.
pub fn build_request(host: &str, method: Method, path: &str, params: &Params) -> CodecResult<Bytes> {
    if method != Method::Post {
        return Err(CodecError::UnsupportedMethod(method));
    }
    // the start line is split on spaces when read back
    if path.is_empty() || path.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CodecError::InvalidPath(path.to_string()));
    }

    let mut buf = BytesMut::with_capacity(128);
    put_line(&mut buf, &format!("{} {} {}", method, path, HTTP_VERSION));
    put_header(&mut buf, "Host", host);
    put_header(&mut buf, "Content-Type", CONTENT_TYPE);
    put_body(&mut buf, &encode_params(params));

    Ok(buf.freeze())
}

/// Build a response frame stamped with the current time
pub fn build_response(status: StatusCode, data: &str) -> Bytes {
    build_response_at(status, data, Utc::now())
}

/// Build a response frame with an explicit `Date` header
pub fn build_response_at(status: StatusCode, data: &str, date: DateTime<Utc>) -> Bytes {
    let mut buf = BytesMut::with_capacity(160 + data.len());
    put_line(&mut buf, &format!("{} {}", HTTP_VERSION, status));
    put_header(&mut buf, "Date", &date.format(DATE_FORMAT).to_string());
    put_header(&mut buf, "Content-Type", CONTENT_TYPE);
    put_header(&mut buf, "Server", SERVER_NAME);
    put_header(&mut buf, "Connection", "close");
    put_body(&mut buf, data);

    buf.freeze()
}

/// Parse a request frame
pub fn parse_request(bytes: &[u8]) -> Result<Request, ParseError> {
    let raw = split_message(bytes)?;

    let mut tokens = raw.start_line.split(' ');
    let (method, path) = match (tokens.next(), tokens.next()) {
        (Some(method), Some(path)) => (method, path),
        _ => return Err(ParseError::MalformedStartLine(raw.start_line.to_string())),
    };

    Ok(Request {
        method: method.parse()?,
        path: path.to_string(),
        headers: raw.headers,
        params: decode_params(raw.body),
    })
}

/// Parse a response frame
pub fn parse_response(bytes: &[u8]) -> Result<Response, ParseError> {
    let raw = split_message(bytes)?;

    let status = raw
        .start_line
        .split(' ')
        .nth(1)
        .ok_or_else(|| ParseError::MalformedStartLine(raw.start_line.to_string()))?;
    let code: u16 = status
        .parse()
        .map_err(|_| ParseError::InvalidStatus(status.to_string()))?;

    Ok(Response {
        status: StatusCode::try_from(code)?,
        headers: raw.headers,
        data: raw.body.to_string(),
    })
}

/// Frame pieces shared by requests and responses
struct RawMessage<'a> {
    start_line: &'a str,
    headers: Headers,
    body: &'a str,
}

fn split_message(bytes: &[u8]) -> Result<RawMessage<'_>, ParseError> {
    let text = std::str::from_utf8(bytes)?;

    let mut lines = text.lines();
    let start_line = lines.next().ok_or(ParseError::Empty)?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
        headers.insert(name.trim(), value.trim());
    }

    let body = text
        .split_once(HEADER_TERMINATOR)
        .map(|(_, body)| body.trim_end())
        .unwrap_or("");

    Ok(RawMessage {
        start_line,
        headers,
        body,
    })
}

fn encode_params(params: &Params) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, values) in params {
        for value in values {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

fn decode_params(body: &str) -> Params {
    let mut params = Params::new();
    if body.is_empty() {
        return params;
    }

    for (key, value) in form_urlencoded::parse(body.as_bytes()) {
        // blank values are dropped, as browsers and most form parsers do
        if value.is_empty() {
            continue;
        }
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(line.as_bytes());
    buf.put_slice(LINE_END);
}

fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(LINE_END);
}

fn put_body(buf: &mut BytesMut, body: &str) {
    buf.put_slice(LINE_END);
    if !body.is_empty() {
        put_line(buf, body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn expression_params(expression: &str) -> Params {
        let mut params = Params::new();
        params.insert("expression".to_string(), vec![expression.to_string()]);
        params
    }

    #[test]
    fn test_build_request_wire_format() {
        let bytes = build_request("127.0.0.1", Method::Post, "/", &expression_params("+ 1 2")).unwrap();

        assert_eq!(
            &bytes[..],
            b"POST / HTTP/1.1\r\n\
              Host: 127.0.0.1\r\n\
              Content-Type: text/plain\r\n\
              \r\n\
              expression=%2B+1+2\r\n"
        );
    }

    #[test]
    fn test_build_request_without_params() {
        let bytes = build_request("localhost", Method::Post, "/calc", &Params::new()).unwrap();

        assert!(bytes.ends_with(b"Content-Type: text/plain\r\n\r\n"));
        let request = parse_request(&bytes).unwrap();
        assert_eq!(request.path, "/calc");
        assert!(request.params.is_empty());
    }

    #[test]
    fn test_build_get_is_rejected() {
        let result = build_request("127.0.0.1", Method::Get, "/", &Params::new());
        assert_eq!(result, Err(CodecError::UnsupportedMethod(Method::Get)));
    }

    #[test]
    fn test_build_request_rejects_unreadable_paths() {
        for path in ["/a b", "", "/a\tb", "/a\r\n"] {
            let result = build_request("127.0.0.1", Method::Post, path, &Params::new());
            assert_eq!(result, Err(CodecError::InvalidPath(path.to_string())), "{:?}", path);
        }
        assert!(build_request("127.0.0.1", Method::Post, "/a%20b", &Params::new()).is_ok());
    }

    #[test]
    fn test_request_roundtrip() {
        let params = expression_params("* 12 -3");
        let bytes = build_request("127.0.0.1", Method::Post, "/eval", &params).unwrap();

        let request = parse_request(&bytes).unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.path, "/eval");
        assert_eq!(request.params, params);
        assert_eq!(request.headers.get("Host"), Some("127.0.0.1"));
        assert_eq!(request.param("expression"), Some("* 12 -3"));
    }

    #[test]
    fn test_repeated_params_roundtrip() {
        let mut params = Params::new();
        params.insert("a".to_string(), vec!["1".to_string(), "2".to_string()]);
        params.insert("b".to_string(), vec!["x y".to_string()]);

        let bytes = build_request("h", Method::Post, "/", &params).unwrap();
        assert_eq!(parse_request(&bytes).unwrap().params, params);
    }

    #[test]
    fn test_parse_request_trims_headers_and_drops_blank_values() {
        let raw = b"POST / HTTP/1.1\r\nHost:   example  \r\nX-Note: a:b\r\n\r\nexpression=&other=1  \r\n";

        let request = parse_request(raw).unwrap();
        assert_eq!(request.headers.get("Host"), Some("example"));
        assert_eq!(request.headers.get("X-Note"), Some("a:b"));
        assert_eq!(request.param("expression"), None);
        assert_eq!(request.param("other"), Some("1"));
    }

    #[test]
    fn test_blank_value_is_built_but_not_read_back() {
        let mut params = Params::new();
        params.insert("k".to_string(), vec![String::new()]);

        let bytes = build_request("h", Method::Post, "/", &params).unwrap();
        assert!(bytes.ends_with(b"\r\n\r\nk=\r\n"));
        assert!(parse_request(&bytes).unwrap().params.is_empty());
    }

    #[test]
    fn test_parse_request_without_separator_has_empty_body() {
        let request = parse_request(b"GET /index HTTP/1.1\r\nHost: h").unwrap();
        assert_eq!(request.method, Method::Get);
        assert!(request.params.is_empty());
    }

    #[test]
    fn test_parse_request_errors() {
        assert_eq!(parse_request(b""), Err(ParseError::Empty));
        assert_eq!(
            parse_request(b"POST\r\n\r\n"),
            Err(ParseError::MalformedStartLine("POST".to_string()))
        );
        assert_eq!(
            parse_request(b"DELETE / HTTP/1.1\r\n\r\n"),
            Err(ParseError::UnknownMethod("DELETE".to_string()))
        );
        assert_eq!(
            parse_request(b"POST / HTTP/1.1\r\nno colon here\r\n\r\n"),
            Err(ParseError::MalformedHeader("no colon here".to_string()))
        );
        assert!(matches!(
            parse_request(&[0xff, 0xfe, b' ', b'/']),
            Err(ParseError::Encoding(_))
        ));
    }

    #[test]
    fn test_build_response_wire_format() {
        let date = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        let bytes = build_response_at(StatusCode::Ok, "3", date);

        assert_eq!(
            &bytes[..],
            b"HTTP/1.1 200 OK\r\n\
              Date: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
              Content-Type: text/plain\r\n\
              Server: calculator/0.1\r\n\
              Connection: close\r\n\
              \r\n\
              3\r\n"
        );
    }

    #[test]
    fn test_response_roundtrip() {
        for (status, data) in [
            (StatusCode::Ok, "42"),
            (StatusCode::Ok, "3.5"),
            (StatusCode::NotAcceptable, "-1"),
            (StatusCode::Ok, ""),
        ] {
            let response = parse_response(&build_response(status, data)).unwrap();
            assert_eq!(response.status, status);
            assert_eq!(response.data, data);
            assert_eq!(response.headers.get("Server"), Some("calculator/0.1"));
        }
    }

    #[test]
    fn test_parse_response_errors() {
        assert_eq!(
            parse_response(b"HTTP/1.1\r\n\r\n"),
            Err(ParseError::MalformedStartLine("HTTP/1.1".to_string()))
        );
        assert_eq!(
            parse_response(b"HTTP/1.1 OK\r\n\r\n"),
            Err(ParseError::InvalidStatus("OK".to_string()))
        );
        assert_eq!(
            parse_response(b"HTTP/1.1 404 Not Found\r\n\r\n"),
            Err(ParseError::UnknownStatus(404))
        );
    }
}
