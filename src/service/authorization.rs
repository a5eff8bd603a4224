//! # Authorization of identifiers, and the associated challenges
//!
//! Authorizations prove that the ACME account controls the identifier (e.g. domain name) in
//! question, by publishing a DNS TXT record for the `dns-01` challenge.

use crate::protocol::{AcmeError, Request, Response, Url};
use crate::schema;
use crate::schema::{
    authorizations::AuthorizationStatus,
    challenges::{Challenge as ChallengeSchema, ChallengeReadyRequest, Dns01Challenge},
    Identifier,
};

use super::{account::Account, client::Client, PollPolicy};

/// An Authorization is a proof that the account controls the identifier
///
/// Authorizations are attached to [`super::Order`]s, and contain a list of challenges that the account
/// must complete in order to prove control of the identifier.
#[derive(Debug, Clone)]
pub struct Authorization<'a> {
    account: &'a Account,
    data: schema::authorizations::Authorization,
    url: Url,
}

impl<'a> Authorization<'a> {
    pub(crate) fn new(
        account: &'a Account,
        data: schema::authorizations::Authorization,
        url: Url,
    ) -> Self {
        Self { account, data, url }
    }

    #[inline]
    pub(crate) fn client(&self) -> &Client {
        self.account.client()
    }

    /// The underlying data returned from the ACME provider.
    ///
    /// See [`crate::schema::authorizations::Authorization`] for details.
    pub fn data(&self) -> &schema::authorizations::Authorization {
        &self.data
    }

    /// Identifying URL for this authorization
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The identifier for this authorization.
    pub fn identifier(&self) -> &Identifier {
        &self.data.identifier
    }

    /// The name as requested in the order, including any `*.` label.
    pub fn domain(&self) -> String {
        self.data.domain()
    }

    /// The current status.
    pub fn status(&self) -> AuthorizationStatus {
        self.data.status
    }

    /// The `dns-01` challenge, if the provider offered one.
    pub fn dns01(&self) -> Option<Dns01Challenge> {
        self.data.dns01().cloned()
    }

    /// Refresh the authorization data from the ACME provider.
    pub async fn refresh(&mut self) -> Result<(), AcmeError> {
        let response: Response<schema::authorizations::Authorization> = self
            .client()
            .execute(Request::get(
                self.url().clone(),
                self.account.request_key(),
            ))
            .await?;

        self.data = response.into_inner();
        Ok(())
    }

    /// Notify the server that the challenge is ready to be validated.
    pub async fn ready(&self, challenge: &Dns01Challenge) -> Result<(), AcmeError> {
        tracing::trace!(domain = %self.domain(), "POST to notify that dns-01 challenge is ready");

        let request = Request::post(
            ChallengeReadyRequest,
            challenge.url().clone(),
            self.account.request_key(),
        );

        let response = self.client().execute::<_, ChallengeSchema>(request).await?;
        tracing::debug!(
            domain = %self.domain(),
            status = ?response.payload().status(),
            "Notified that dns-01 challenge is ready"
        );

        Ok(())
    }

    /// Poll until the authorization leaves `pending`.
    ///
    /// This never gives up on its own; callers bound it with a timeout.
    pub async fn wait(&mut self, policy: &PollPolicy) -> Result<AuthorizationStatus, AcmeError> {
        tracing::debug!(domain = %self.domain(), "Polling authorization resource to check for status updates");
        let mut delays = policy.delays();

        loop {
            let info: Response<schema::authorizations::Authorization> = self
                .client()
                .execute(Request::get(
                    self.url().clone(),
                    self.account.request_key(),
                ))
                .await?;

            let delay = delays.next(info.retry_after());
            self.data = info.into_inner();
            if self.data.status.is_terminal() {
                tracing::debug!(domain = %self.domain(), status = ?self.data.status, "Authorization is finished");
                return Ok(self.data.status);
            }

            tracing::trace!(status = ?self.data.status, ?delay, "Authorization is not finished");
            tokio::time::sleep(delay).await;
        }
    }
}
