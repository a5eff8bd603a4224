//! HTTP responses which adhere to RFC 8555
//!
//! [RFC 8555][] does not constrain HTTP responses from the ACME service
//! strongly, except that they should contain a [nonce][super::jose::Nonce].
//!
//! [RFC 8555]: https://datatracker.ietf.org/doc/html/rfc8555

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::de::DeserializeOwned;

use super::jose::Nonce;
use super::AcmeError;
use super::Url;

/// Helper trait for any type which can be decoded from a
/// response from an ACME server.
///
/// This trait is blanket-implemented for [`serde::de::DeserializeOwned`]
/// so most types should implement or derive [`serde::Deserialize`]
/// rather than implementing this type.
pub trait Decode: Sized {
    /// Decode an ACME response from a byte slice.
    fn decode(data: &[u8]) -> Result<Self, AcmeError>;
}

impl<T> Decode for T
where
    T: DeserializeOwned,
{
    fn decode(data: &[u8]) -> Result<Self, AcmeError> {
        serde_json::from_slice(data).map_err(AcmeError::de)
    }
}

/// A HTTP response from an ACME service
#[derive(Debug, Clone)]
pub struct Response<T> {
    url: Url,
    status: http::StatusCode,
    headers: http::HeaderMap,
    payload: T,
}

impl<T> Response<T>
where
    T: Decode,
{
    pub(crate) async fn from_decoded_response(
        response: reqwest::Response,
    ) -> Result<Self, AcmeError> {
        let url = response.url().clone().into();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        #[cfg(feature = "trace-requests")]
        tracing::trace!(%status, "RES: {}", String::from_utf8_lossy(&body));
        let payload: T = T::decode(&body)?;

        Ok(Response {
            url,
            status,
            headers,
            payload,
        })
    }
}

impl<T> Response<T> {
    /// Response [`http::StatusCode`]
    pub fn status(&self) -> http::StatusCode {
        self.status
    }

    /// Destination URL from the original request.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The headers returned with this response
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The time to wait before retrying, from now.
    ///
    /// `Retry-After` may be either a number of seconds or an HTTP date.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        retry_after(&self.headers)
    }

    /// Get the [`Nonce`] from this response.
    ///
    /// Normally, this is unnecessay, as [`super::Client`] will automatically handle
    /// and track [`Nonce`] values.
    pub fn nonce(&self) -> Option<Nonce> {
        super::client::extract_nonce(&self.headers).ok()
    }

    /// The URL from the `Location` HTTP header, if present and valid.
    pub fn location(&self) -> Option<Url> {
        let value = self.headers.get(http::header::LOCATION)?;
        match value.to_str().ok().map(str::parse::<Url>) {
            Some(Ok(url)) => Some(url),
            _ => {
                tracing::warn!(?value, "Invalid {} header", http::header::LOCATION);
                None
            }
        }
    }

    /// The [`mime::Mime`] from the `Content-Type` header.
    pub fn content_type(&self) -> Option<mime::Mime> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// The response payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Extract just the response payload.
    pub fn into_inner(self) -> T {
        self.payload
    }
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<std::time::Duration> {
    headers
        .get(http::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if let Ok(seconds) = v.trim().parse::<u64>() {
                return Some(std::time::Duration::from_secs(seconds));
            }
            DateTime::parse_from_rfc2822(v)
                .map(|ts| ts.with_timezone(&Utc).signed_duration_since(Utc::now()))
                .ok()
                .map(|d| d.to_std().unwrap_or_default())
        })
}
