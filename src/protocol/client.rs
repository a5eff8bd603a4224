//! Client for sending HTTP requests to an ACME server

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::Certificate;
use serde::{Deserialize, Serialize};

use super::errors::{AcmeError, AcmeErrorCode, AcmeErrorDocument};
use super::jose::Nonce;
use super::response::{Decode, Response};
use super::Request;
use super::Url;

pub use AcmeClient as Client;

const NONCE_HEADER: &str = "Replay-Nonce";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounds on how often a single ACME request is retried.
///
/// Transient failures (connection errors, timeouts, HTTP 5xx) are retried with
/// exponential backoff, up to `max_attempts` attempts in total. A `badNonce`
/// rejection is re-signed immediately with the nonce from the rejection, and
/// is bounded separately by `max_bad_nonce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts for a request which fails transiently.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "crate::duration::secs")]
    pub initial_backoff: Duration,

    /// Ceiling for the exponential backoff.
    #[serde(with = "crate::duration::secs")]
    pub max_backoff: Duration,

    /// Re-signing attempts after `badNonce` rejections.
    pub max_bad_nonce: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16),
            max_bad_nonce: 5,
        }
    }
}

/// Exponential backoff state for one request.
struct Backoff<'p> {
    policy: &'p RetryPolicy,
    attempts: u32,
    delay: Duration,
}

impl<'p> Backoff<'p> {
    fn new(policy: &'p RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 1,
            delay: policy.initial_backoff,
        }
    }

    /// Sleep before the next attempt, or hand the error back once the budget is spent.
    async fn wait(&mut self, error: AcmeError) -> Result<(), AcmeError> {
        if self.attempts >= self.policy.max_attempts {
            tracing::warn!(attempts = self.attempts, "Giving up after transient errors: {error}");
            return Err(error);
        }

        tracing::debug!(
            attempt = self.attempts,
            delay = ?self.delay,
            "Retrying after transient error: {error}"
        );
        tokio::time::sleep(self.delay).await;
        self.attempts += 1;
        self.delay = (self.delay * 2).min(self.policy.max_backoff);
        Ok(())
    }
}

/// Builder struct for an ACME HTTP client.
#[derive(Debug)]
pub struct ClientBuilder {
    inner: reqwest::ClientBuilder,
    new_nonce: Option<Url>,
    retry: RetryPolicy,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        let builder = reqwest::Client::builder()
            .user_agent(concat!("dnsacme/", env!("CARGO_PKG_VERSION")))
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT);

        ClientBuilder {
            inner: builder,
            new_nonce: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the URL to use to fetch a new nonce.
    ///
    /// This is used to bootstrap the nonce at the start of an interaction
    /// with an ACME provider. Nonces returned with every response are used
    /// after that.
    pub fn with_nonce_url(mut self, url: Url) -> Self {
        self.new_nonce = Some(url);
        self
    }

    /// Add a custom root certificate to the underlying [`reqwest::Client`].
    ///
    /// This is useful for private ACME CAs or test servers such as Pebble.
    pub fn add_root_certificate(mut self, cert: Certificate) -> Self {
        self.inner = self.inner.add_root_certificate(cert);
        self
    }

    /// Set the per-request timeout on the underlying [`reqwest::Client`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.timeout(timeout);
        self
    }

    /// Set a connect timeout on the underlying [`reqwest::Client`].
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.connect_timeout(timeout);
        self
    }

    /// Set the retry policy for requests sent by this client.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Finalize this and build this client. See [`reqwest::ClientBuilder::build`].
    pub fn build(self) -> Result<AcmeClient, reqwest::Error> {
        Ok(AcmeClient {
            inner: self.inner.build()?,
            nonce: None,
            new_nonce: self.new_nonce,
            retry: self.retry,
        })
    }
}

/// ACME HTTP Client
///
/// The client handles sending ACME HTTP requests, and providing ACME HTTP
/// responses using the [`super::Request`] and [`super::Response`] objects
/// respectively. It holds the single current [`Nonce`]: each signed request
/// takes it, and each response (successful or not) replaces it.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use dnsacme::key::SignatureKind;
/// # use dnsacme::protocol::{AcmeClient, Request, Response};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let key = Arc::new(SignatureKind::default().random()?);
///
/// let mut client = AcmeClient::builder().build()?;
/// client.set_new_nonce_url("https://acme.example.com/new-nonce".parse()?);
///
/// let request = Request::get("https://acme.example.com/account/1".parse()?, key);
/// let response: Response<serde_json::Value> = client.execute(request).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct AcmeClient {
    pub(super) inner: reqwest::Client,
    nonce: Option<Nonce>,
    new_nonce: Option<Url>,
    retry: RetryPolicy,
}

impl AcmeClient {
    /// Create a new client builder to configure a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Set the URL used for fetching a new Nonce from the ACME provider.
    pub fn set_new_nonce_url(&mut self, url: Url) {
        self.new_nonce = Some(url);
    }

    /// The retry policy in use.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

impl AcmeClient {
    /// Run a plain HTTP `GET` request without using the ACME HTTP JWS
    /// protocol. Transient failures are retried.
    pub async fn get<R>(&mut self, url: Url) -> Result<Response<R>, AcmeError>
    where
        R: Decode,
    {
        let retry = self.retry.clone();
        let mut backoff = Backoff::new(&retry);
        loop {
            match self.get_once(&url).await {
                Ok(response) => return Response::from_decoded_response(response).await,
                Err(error) if error.is_transient() => backoff.wait(error).await?,
                Err(error) => return Err(error),
            }
        }
    }

    async fn get_once(&mut self, url: &Url) -> Result<reqwest::Response, AcmeError> {
        let response = self.inner.get(url.as_str()).send().await?;
        self.record_nonce(response.headers());
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(process_error_response(response).await)
        }
    }

    /// Execute an HTTP request using the ACME protocol.
    ///
    /// Request payloads must be serializable, and request responses must implement [`Decode`].
    pub async fn execute<P, R>(&mut self, request: Request<P>) -> Result<Response<R>, AcmeError>
    where
        P: Serialize,
        R: Decode,
    {
        Response::from_decoded_response(self.execute_internal(&request).await?).await
    }

    async fn execute_internal<P>(
        &mut self,
        request: &Request<P>,
    ) -> Result<reqwest::Response, AcmeError>
    where
        P: Serialize,
    {
        let retry = self.retry.clone();
        let mut backoff = Backoff::new(&retry);
        let mut bad_nonces = 0;

        loop {
            match self.attempt(request).await {
                Ok(response) => return Ok(response),
                Err(AcmeError::Acme(document))
                    if matches!(document.code(), AcmeErrorCode::BadNonce) =>
                {
                    bad_nonces += 1;
                    if bad_nonces > retry.max_bad_nonce {
                        tracing::warn!(url = %request.url(), "Too many badNonce rejections");
                        return Err(AcmeError::Acme(document));
                    }
                    tracing::debug!(url = %request.url(), "Retrying request with next nonce");
                }
                Err(error) if error.is_transient() => backoff.wait(error).await?,
                Err(error) => return Err(error),
            }
        }
    }

    /// One signed exchange: take the nonce, sign, send, record the next nonce.
    async fn attempt<P>(&mut self, request: &Request<P>) -> Result<reqwest::Response, AcmeError>
    where
        P: Serialize,
    {
        let nonce = self.get_nonce().await?;
        let signed = request.sign(nonce)?;
        let response = self.inner.execute(signed.into_inner()).await?;
        self.record_nonce(response.headers());
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(process_error_response(response).await)
        }
    }
}

async fn process_error_response(response: reqwest::Response) -> AcmeError {
    debug_assert!(
        !response.status().is_success(),
        "expected to process an error result"
    );
    let status = response.status();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(error) => {
            return AcmeError::HttpRequest(error);
        }
    };

    match serde_json::from_slice::<AcmeErrorDocument>(&body) {
        Ok(document) if !document.kind().is_empty() => {
            let document = match document.status() {
                Some(_) => document,
                None => document.with_status(status),
            };
            tracing::debug!(%status, %document, "ACME error response");
            AcmeError::Acme(document)
        }
        _ => {
            let text = String::from_utf8_lossy(&body).into_owned();
            tracing::debug!(%status, "Unparseable error response: {text}");
            AcmeError::HttpStatus { status, body: text }
        }
    }
}

pub(crate) fn extract_nonce(headers: &HeaderMap) -> Result<Nonce, AcmeError> {
    let value = headers.get(NONCE_HEADER).ok_or(AcmeError::MissingNonce)?;
    Ok(Nonce::from(
        value
            .to_str()
            .map_err(|_| AcmeError::InvalidNonce(Some(value.clone())))?
            .to_owned(),
    ))
}

impl AcmeClient {
    fn record_nonce(&mut self, headers: &HeaderMap) {
        match extract_nonce(headers) {
            Ok(nonce) => self.nonce = Some(nonce),
            Err(AcmeError::MissingNonce) => {}
            Err(error) => tracing::warn!("Ignoring nonce header: {error}"),
        }
    }

    /// Fetch a fresh nonce from the `newNonce` endpoint with a `HEAD` request.
    pub async fn fresh_nonce(&mut self) -> Result<Nonce, AcmeError> {
        let Some(url) = &self.new_nonce else {
            tracing::warn!("No nonce URL provided, unable to fetch new nonce");
            return Err(AcmeError::MissingNonce);
        };

        tracing::debug!("Requesting a new nonce");
        let response = self
            .inner
            .head(url.as_str())
            .send()
            .await
            .map_err(AcmeError::nonce)?;

        response.error_for_status_ref().map_err(AcmeError::nonce)?;
        extract_nonce(response.headers())
    }

    async fn get_nonce(&mut self) -> Result<Nonce, AcmeError> {
        if let Some(value) = self.nonce.take() {
            return Ok(value);
        }
        self.fresh_nonce().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_nonce_from_header() {
        let response = crate::response!("new-nonce.http");
        let nonce = extract_nonce(response.headers()).unwrap();
        assert_eq!(nonce.as_ref(), "oFvnlFP1wIhRlYS2jTaXbA");
    }

    #[test]
    fn missing_nonce_is_reported() {
        let response = crate::response!("directory.http");
        assert!(matches!(
            extract_nonce(response.headers()),
            Err(AcmeError::MissingNonce)
        ));
    }

    #[test]
    fn retry_policy_from_config() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 2, "initial_backoff": 0.5}"#).unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(policy.max_bad_nonce, RetryPolicy::default().max_bad_nonce);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_gives_up() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            max_bad_nonce: 0,
        };
        let mut backoff = Backoff::new(&policy);
        let transient = || AcmeError::HttpStatus {
            status: http::StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };

        let start = tokio::time::Instant::now();
        backoff.wait(transient()).await.unwrap();
        backoff.wait(transient()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert!(backoff.wait(transient()).await.is_err());
    }
}
