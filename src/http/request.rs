use std::fmt;

use crate::http::body::Body;
use crate::http::headers::Headers;

/// HTTP request methods.
///
/// The proxy forwards any method verbatim, so unknown tokens are kept as
/// [`Method::Extension`] rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// Any other method token, e.g. `PROPFIND`
    Extension(String),
}

impl Method {
    /// Parses an HTTP method token.
    ///
    /// Method names are case-sensitive; anything that is a valid token but not
    /// one of the well-known methods becomes [`Method::Extension`].
    ///
    /// # Example
    ///
    /// ```
    /// # use neptune_proxy::http::request::Method;
    /// assert_eq!(Method::parse("GET"), Some(Method::GET));
    /// assert_eq!(Method::parse("get"), Some(Method::Extension("get".into())));
    /// assert_eq!(Method::parse("G T"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        let method = match s {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "OPTIONS" => Method::OPTIONS,
            "PATCH" => Method::PATCH,
            other if !other.is_empty() && other.bytes().all(is_token_byte) => {
                Method::Extension(other.to_string())
            }
            _ => return None,
        };
        Some(method)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::Extension(m) => m,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Where a request is headed.
///
/// `path` and `query` hold the raw bytes of the request target exactly as
/// they will appear on the wire; nothing here percent-decodes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    /// Authority (`host` or `host:port`). `None` until a destination is set.
    pub host: Option<String>,
    pub path: String,
    pub query: Option<String>,
}

impl Target {
    /// Splits an origin-form target (`/path?query`) into its parts.
    pub fn from_origin_form(target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (target, None),
        };
        Self {
            scheme: Scheme::Http,
            host: None,
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query,
        }
    }

    /// Path plus `?query`, as written on the request line.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// Full URL, for logging.
    pub fn url(&self) -> String {
        format!(
            "{}://{}{}",
            self.scheme.as_str(),
            self.host.as_deref().unwrap_or(""),
            self.path_and_query()
        )
    }
}

/// An HTTP request travelling through the proxy.
#[derive(Debug)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// Destination and raw path/query
    pub target: Target,
    /// HTTP version (typically "HTTP/1.1")
    pub version: String,
    /// Request headers, in arrival order
    pub headers: Headers,
    pub body: Body,
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    target: Option<String>,
    version: Option<String>,
    headers: Headers,
    body: Body,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            target: None,
            version: None,
            headers: Headers::new(),
            body: Body::Empty,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Origin-form request target, e.g. `/gremlin?x=1`.
    pub fn path(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        let target = self.target.ok_or("path missing")?;
        Ok(Request {
            method: self.method.ok_or("method missing")?,
            target: Target::from_origin_form(&target),
            version: self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            headers: self.headers,
            body: self.body,
        })
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    /// Retrieves a header value by name, case-insensitively.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Determines whether the client connection should stay open after the
    /// response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive` is sent.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        if self.version == "HTTP/1.0" {
            return self.headers.has_token("Connection", "keep-alive");
        }
        true
    }
}
