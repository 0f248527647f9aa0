//! HTTP/1.1 for both sides of the proxy.
//!
//! Client connections are parsed into [`request::Request`]s; the same types
//! are serialized towards the upstream once a request has been directed and
//! signed.
//!
//! - **`connection`**: per-client read/forward/write loop
//! - **`parser`**: requests, response heads, body framing, chunked decoding
//! - **`request`** / **`response`**: message types and builders
//! - **`headers`**: ordered, case-insensitive header list
//! - **`body`**: buffered or streamed bodies
//! - **`writer`**: wire serialization in both directions
//!
//! # Connection lifecycle
//!
//! ```text
//!   Reading ──request──▶ Processing ──response──▶ Writing
//!      ▲                 (ProxyHandler)               │
//!      └──────────────── keep-alive ◀─────────────────┤
//!                                                     └─ close ─▶ Closed
//! ```
//!
//! A request that cannot be parsed is answered with `400 Bad Request` and the
//! connection is closed.

pub mod body;
pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
