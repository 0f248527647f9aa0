use bytes::Bytes;

use crate::http::headers::Headers;

/// An HTTP status code.
///
/// Upstream statuses are passed through as-is, so this is an open newtype
/// rather than a closed enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const BAD_GATEWAY: StatusCode = StatusCode(502);

    /// Accepts any three-digit code.
    pub fn from_u16(code: u16) -> Option<Self> {
        (100..=999).contains(&code).then_some(StatusCode(code))
    }

    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use neptune_proxy::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.as_u16(), 200);
    /// assert_eq!(StatusCode::BAD_GATEWAY.as_u16(), 502);
    /// ```
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_error(&self) -> bool {
        self.0 >= 400
    }

    /// Returns the standard reason phrase, or `""` for codes without one.
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            413 => "Payload Too Large",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "",
        }
    }
}

/// An HTTP response, either read from an upstream or produced by the proxy.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    /// Reason phrase as sent by the upstream; the standard phrase otherwise.
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// # Example
///
/// ```ignore
/// let response = ResponseBuilder::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(b"{}".to_vec())
///     .build();
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    reason: Option<String>,
    headers: Headers,
    body: Bytes,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Appends a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Builds the final Response.
    ///
    /// Sets `Content-Length` from the body unless the headers already carry one.
    pub fn build(mut self) -> Response {
        if !self.headers.contains("Content-Length") {
            self.headers.set("Content-Length", self.body.len().to_string());
        }

        Response {
            reason: self
                .reason
                .unwrap_or_else(|| self.status.reason_phrase().to_string()),
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl Response {
    /// `502 Bad Gateway` with an empty body, returned when a request could not
    /// be signed or the upstream could not be reached.
    pub fn bad_gateway() -> Self {
        ResponseBuilder::new(StatusCode::BAD_GATEWAY).build()
    }

    /// `400 Bad Request` with an empty body, for requests that could not be parsed.
    pub fn bad_request() -> Self {
        ResponseBuilder::new(StatusCode::BAD_REQUEST)
            .header("Connection", "close")
            .build()
    }

    pub fn payload_too_large() -> Self {
        ResponseBuilder::new(StatusCode::PAYLOAD_TOO_LARGE)
            .header("Connection", "close")
            .build()
    }
}
