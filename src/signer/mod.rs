//! Request signing.
//!
//! [`Signer::sign`] turns a request that has already been pointed at its
//! upstream into one the upstream's SigV4 verifier will accept. A request
//! that cannot be signed is an error; it is never passed on unsigned.

pub mod sigv4;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::credentials::{CredentialContext, CredentialError};
use crate::http::body::Body;
use crate::http::request::{Request, Scheme};

use self::sigv4::{
    ALGORITHM, CanonicalRequest, EMPTY_PAYLOAD_SHA256, credential_scope, escape_wire_path,
    escape_wire_query, hash_payload, sign_string, signing_key, string_to_sign,
};

/// Format of the `Date` header stamped on every signed request.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const SCOPE_DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Error)]
pub enum SignError {
    #[error("failed to read request body: {0}")]
    ReadBody(#[source] std::io::Error),

    #[error("failed to resolve credentials: {0}")]
    Credentials(#[from] CredentialError),

    #[error("request has no destination host")]
    MissingHost,
}

#[derive(Debug, Clone)]
pub struct Signer {
    context: Arc<CredentialContext>,
}

impl Signer {
    pub fn new(context: Arc<CredentialContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &CredentialContext {
        &self.context
    }

    /// Signs `req` in place as of `now`.
    ///
    /// Forces https, fixes the wire form of the path and query, stamps `Date` and
    /// `X-Amz-Date`, and attaches `Authorization` (plus
    /// `X-Amz-Security-Token` for temporary credentials). A streamed body is
    /// drained to compute the payload hash and replaced with a buffered copy
    /// of the same bytes.
    pub async fn sign(&self, req: &mut Request, now: DateTime<Utc>) -> Result<(), SignError> {
        req.target.scheme = Scheme::Https;
        let wire_path = escape_wire_path(&req.target.path).into_owned();
        req.target.path = wire_path;
        if let Some(query) = req.target.query.take() {
            req.target.query = Some(escape_wire_query(&query).into_owned());
        }

        let host = req.target.host.clone().ok_or(SignError::MissingHost)?;
        req.headers.set("Host", host);

        let amz_date = now.format(AMZ_DATE_FORMAT).to_string();
        req.headers.set("Date", now.format(DATE_FORMAT).to_string());
        req.headers.set("X-Amz-Date", amz_date.as_str());
        req.headers.remove("Authorization");
        req.headers.remove("X-Amz-Security-Token");

        let payload_hash = match req.body.take() {
            Body::Empty => EMPTY_PAYLOAD_SHA256.to_string(),
            body => {
                let bytes = body.collect().await.map_err(SignError::ReadBody)?;
                let hash = hash_payload(&bytes);
                req.body = Body::full(bytes);
                hash
            }
        };

        let credentials = self.context.credentials().await?;
        if let Some(token) = &credentials.session_token {
            req.headers.set("X-Amz-Security-Token", token.as_str());
        }

        let canonical = CanonicalRequest::new(
            req.method.as_str(),
            &req.target.path,
            req.target.query.as_deref(),
            &req.headers,
            &payload_hash,
        );

        let date = now.format(SCOPE_DATE_FORMAT).to_string();
        let scope = credential_scope(&date, self.context.region(), self.context.service());
        let key = signing_key(
            &credentials.secret_access_key,
            &date,
            self.context.region(),
            self.context.service(),
        );
        let signature = sign_string(&key, &string_to_sign(&amz_date, &scope, &canonical.hash()));

        req.headers.set(
            "Authorization",
            format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM, credentials.access_key_id, scope, canonical.signed_headers, signature
            ),
        );
        Ok(())
    }
}
