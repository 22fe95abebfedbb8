//! Minimal HTTP/1.1: request-header parsing, response-header encoding,
//! status codes and MIME lookup. No I/O happens here.

pub mod mime;
pub mod parser;
pub mod status;

pub use parser::{encode_respond_header, HeaderMap, HeaderParser, ParseStatus, RequestHeader};
pub use status::{Method, StatusCode};
