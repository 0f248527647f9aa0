use crate::http::request::Request;
use crate::observe::{ProxyEvent, SharedSink};

/// Points inbound requests at one environment's upstream.
pub struct Director {
    environment: String,
    upstream_host: String,
    sink: SharedSink,
}

impl Director {
    pub fn new(
        environment: impl Into<String>,
        upstream_host: impl Into<String>,
        sink: SharedSink,
    ) -> Self {
        Self {
            environment: environment.into(),
            upstream_host: upstream_host.into(),
            sink,
        }
    }

    pub fn upstream_host(&self) -> &str {
        &self.upstream_host
    }

    /// Rewrites the destination host. Method, path, query, body and every
    /// other header are left alone; the scheme is the signer's business.
    pub fn direct(&self, req: &mut Request) {
        self.sink.record(ProxyEvent::Directed {
            environment: self.environment.clone(),
            method: req.method.to_string(),
            upstream_host: self.upstream_host.clone(),
            path: req.target.path_and_query(),
        });

        req.target.host = Some(self.upstream_host.clone());
        req.headers.set("Host", self.upstream_host.as_str());
    }
}
