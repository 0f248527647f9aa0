//! Message bodies.
//!
//! A body is either absent, fully buffered, or a single-pass stream. Buffered
//! bodies are backed by [`Bytes`], so handing one to the signer and another to
//! the wire is a reference-count bump and both views see the same bytes.

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

pub type BodyStream = Pin<Box<dyn AsyncRead + Send + Sync>>;

pub enum Body {
    /// No body at all. Signed over the empty payload hash.
    Empty,
    /// Buffered bytes; can be read any number of times.
    Full(Bytes),
    /// A single-pass stream. Must be drained with [`Body::collect`] before it
    /// can be hashed or sent.
    Stream(BodyStream),
}

impl Body {
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            Body::Empty
        } else {
            Body::Full(bytes)
        }
    }

    pub fn stream(reader: impl AsyncRead + Send + Sync + 'static) -> Self {
        Body::Stream(Box::pin(reader))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Takes the body out, leaving [`Body::Empty`] behind.
    pub fn take(&mut self) -> Body {
        std::mem::replace(self, Body::Empty)
    }

    /// Returns the buffered bytes, or `None` for streams.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Full(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Reads the whole body into memory.
    pub async fn collect(self) -> std::io::Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Full(bytes) => Ok(bytes),
            Body::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Body::Stream(_) => f.write_str("Body::Stream(..)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::full(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::full(bytes)
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::full(Bytes::from_static(s.as_bytes()))
    }
}
