//! HTTP/1.1 request/response subset: shared types for the connection state
//! machine and the routing table.

pub mod conn;
pub mod route;

/// Only GET and POST are recognized; anything else is a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Master parse state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
}

/// Where one pass over the read buffer ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// More socket data is needed before the request is complete.
    Incomplete,
    /// The request resolved to a mapped file, ready to encode.
    FileReady,
    /// Malformed request line/headers/body, or a directory target.
    BadRequest,
    /// The resolved resource does not exist.
    NoResource,
    /// The resolved resource is not world-readable.
    Forbidden,
    /// The state machine reached an unhandled state.
    Internal,
}

pub(crate) const ERROR_400_BODY: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
pub(crate) const ERROR_403_BODY: &str =
    "You do not have permission to get file from this server.\n";
pub(crate) const ERROR_404_BODY: &str = "The requested file was not found on this server.\n";
pub(crate) const ERROR_500_BODY: &str =
    "There was an unusual problem serving the request file.\n";
/// Body sent for a successful request that mapped to an empty file.
pub(crate) const OK_EMPTY_BODY: &str = "<html><body></body></html>";

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Internal Error",
    }
}
