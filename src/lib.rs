//! neptune-proxy - IAM-signing reverse proxy for Amazon Neptune
//!
//! One listener per environment. Every request is pointed at that
//! environment's Neptune endpoint, signed with AWS Signature Version 4 and
//! forwarded over TLS.

pub mod config;
pub mod credentials;
pub mod http;
pub mod observe;
pub mod proxy;
pub mod server;
pub mod signer;
