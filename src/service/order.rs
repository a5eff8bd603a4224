//! # Certificate Orders
//!
//! Each order is for a single certificate chain, but that certificate chain
//! may cover multiple DNS identities.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use http::HeaderValue;
use thiserror::Error;

use crate::cert::{CsrError, SignedCertificateRequest};
use crate::protocol::{AcmeError, Request, Response, Url};
use crate::schema;
use crate::schema::{
    authorizations::Authorization as AuthorizationSchema,
    orders::{CertificateChain, FinalizeOrder, NewOrderRequest, OrderStatus},
    Identifier,
};

use super::{account::Account, authorization::Authorization, client::Client, PollPolicy};

const CONTENT_PEM_CHAIN: &str = "application/pem-certificate-chain";

/// Errors from finalizing an order and retrieving its certificate.
#[derive(Debug, Error)]
pub enum FinalizeError {
    /// The CSR does not name exactly the order's identifiers.
    #[error("CSR names {found:?} do not match order identifiers {expected:?}")]
    CsrMismatch {
        /// The order's identifiers.
        expected: BTreeSet<String>,
        /// The names in the CSR.
        found: BTreeSet<String>,
    },

    /// The CSR could not be inspected.
    #[error(transparent)]
    Csr(#[from] CsrError),

    /// The provider moved the order to `invalid`.
    #[error("order is invalid: {detail}")]
    OrderInvalid {
        /// The order's error detail, if any.
        detail: String,
    },

    /// A protocol or transport failure.
    #[error(transparent)]
    Protocol(#[from] AcmeError),
}

/// Order for a certificate for a set of identifiers.
#[derive(Debug)]
pub struct Order<'a> {
    account: &'a Account,
    data: schema::Order,
    url: Url,
}

impl<'a> Order<'a> {
    pub(crate) fn new(account: &'a Account, data: schema::Order, url: Url) -> Self {
        Self { account, data, url }
    }

    #[inline]
    pub(crate) fn client(&self) -> &Client {
        self.account.client()
    }

    /// The account which placed this order.
    pub fn account(&self) -> &'a Account {
        self.account
    }

    /// The get URL for this order, for fetching and uniquely identifying
    /// this order.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The order data, as defined by [`crate::schema::orders::Order`].
    ///
    /// This is useful for accessing the underlying order fields.
    pub fn data(&self) -> &schema::Order {
        &self.data
    }

    /// Get the status of this order.
    ///
    /// This does not refresh the underlying order data.
    pub fn status(&self) -> OrderStatus {
        self.data.status()
    }

    /// The identifier names of this order, as a set.
    pub fn names(&self) -> BTreeSet<String> {
        self.data
            .identifiers()
            .iter()
            .map(|id| id.value().to_owned())
            .collect()
    }

    /// Refresh the order information from the ACME provider.
    pub async fn refresh(&mut self) -> Result<(), AcmeError> {
        let response: Response<schema::Order> = self
            .client()
            .execute(Request::get(
                self.url().clone(),
                self.account.request_key(),
            ))
            .await?;

        self.data = response.into_inner();
        Ok(())
    }

    /// Fetch the authorizations for this order.
    pub async fn authorizations(&self) -> Result<Vec<Authorization<'a>>, AcmeError> {
        let client = self.client();
        let mut authorizations = Vec::new();
        for auth_url in self.data.authorizations() {
            let authz: Response<AuthorizationSchema> = client
                .execute(Request::get(auth_url.clone(), self.account.request_key()))
                .await?;

            authorizations.push(Authorization::new(
                self.account,
                authz.into_inner(),
                auth_url.clone(),
            ));
        }

        Ok(authorizations)
    }

    /// Submit a certificate signing request for this order.
    ///
    /// The CSR must name exactly the order's identifiers; this is checked
    /// before anything is sent.
    pub async fn finalize(&mut self, csr: SignedCertificateRequest) -> Result<(), FinalizeError> {
        let expected = self.names();
        let found = csr.subject_names()?;
        if expected != found {
            return Err(FinalizeError::CsrMismatch { expected, found });
        }

        #[cfg(feature = "trace-requests")]
        if let Ok(pem) = csr.to_pem() {
            tracing::trace!("CSR: \n{pem}");
        }

        let request = Request::post(
            FinalizeOrder::from(csr),
            self.data.finalize().clone(),
            self.account.request_key(),
        );
        tracing::debug!(url = %self.url, "Sending order finalize request");
        let info: Response<schema::Order> = self.client().execute(request).await?;
        self.data = info.into_inner();

        Ok(())
    }

    /// Poll until the order is `valid` or `invalid`.
    ///
    /// This never gives up on its own; callers bound it with a timeout.
    pub async fn wait(&mut self, policy: &PollPolicy) -> Result<(), FinalizeError> {
        self.poll_while(policy, OrderStatus::Processing).await?;
        match self.status() {
            OrderStatus::Valid => {
                tracing::debug!(url = %self.url, "Order is valid");
                Ok(())
            }
            _ => Err(AcmeError::NotReady("Order is not finalized").into()),
        }
    }

    /// Poll a `pending` order until the provider marks it `ready`.
    ///
    /// Providers may take a moment to notice that every authorization is
    /// valid. An order which is already `ready` or `valid` returns at once.
    pub async fn wait_ready(&mut self, policy: &PollPolicy) -> Result<(), FinalizeError> {
        self.poll_while(policy, OrderStatus::Pending).await?;
        match self.status() {
            OrderStatus::Ready | OrderStatus::Valid => Ok(()),
            _ => Err(AcmeError::NotReady("Order is not ready").into()),
        }
    }

    async fn poll_while(
        &mut self,
        policy: &PollPolicy,
        unsettled: OrderStatus,
    ) -> Result<(), FinalizeError> {
        let mut delays = policy.delays();
        let mut retry_after = None;

        loop {
            if self.status() == OrderStatus::Invalid {
                let detail = self
                    .data
                    .error()
                    .map(|error| error.to_string())
                    .unwrap_or_else(|| "no error detail provided".to_owned());
                return Err(FinalizeError::OrderInvalid { detail });
            }
            if self.status() != unsettled {
                return Ok(());
            }

            let delay = delays.next(retry_after);
            tracing::trace!(status = ?self.status(), ?delay, "Order is not settled");
            tokio::time::sleep(delay).await;

            let info: Response<schema::Order> = self
                .client()
                .execute(Request::get(
                    self.url().clone(),
                    self.account.request_key(),
                ))
                .await?;
            retry_after = info.retry_after();
            self.data = info.into_inner();
        }
    }

    /// Download the certificate for this order.
    ///
    /// In order for the certificate to be ready, you must have submitted a certificate signing request
    /// (see [`Order::finalize`]), and the order must have finished processing.
    pub async fn download(&self) -> Result<CertificateChain, AcmeError> {
        let Some(url) = self.data.certificate() else {
            return Err(AcmeError::NotReady("certificate"));
        };

        let mut request = Request::get(url.clone(), self.account.request_key());

        request.headers_mut().insert(
            http::header::ACCEPT,
            HeaderValue::from_static(CONTENT_PEM_CHAIN),
        );
        let certificate: Response<CertificateChain> = self.client().execute(request).await?;

        Ok(certificate.into_inner())
    }

    /// Finalize the order, and download the certificate.
    ///
    /// This submits the certificate signing request, and then waits for the ACME
    /// provider to indicate that the certifiacte is done processing before returning
    /// the certificate chain.
    pub async fn finalize_and_download(
        &mut self,
        csr: SignedCertificateRequest,
        policy: &PollPolicy,
    ) -> Result<CertificateChain, FinalizeError> {
        self.finalize(csr).await?;
        self.wait(policy).await?;
        Ok(self.download().await?)
    }
}

/// Builder to create a new Certificate order.
///
/// To create an [`OrderBuilder`], use [`Account::order`].
#[derive(Debug)]
pub struct OrderBuilder<'a> {
    account: &'a Account,
    identifiers: Vec<Identifier>,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
}

impl<'a> OrderBuilder<'a> {
    pub(crate) fn new(account: &'a Account) -> Self {
        Self {
            account,
            identifiers: Vec::new(),
            not_before: None,
            not_after: None,
        }
    }

    /// Add an identifier to to this order.
    pub fn push(mut self, identifier: Identifier) -> Self {
        self.identifiers.push(identifier);
        self
    }

    /// Add a DNS identifier to this order.
    pub fn dns<S: AsRef<str>>(mut self, identifier: S) -> Self {
        self.identifiers.push(Identifier::dns(identifier));
        self
    }

    /// Set the start time for the certificate.
    ///
    /// This certificate will be considered invalid before this timestamp.
    pub fn start(mut self, when: DateTime<Utc>) -> Self {
        self.not_before = Some(when);
        self
    }

    /// Set the end time for this certificate.
    ///
    /// This certificate will be considered invalid after this timestamp.
    pub fn end(mut self, when: DateTime<Utc>) -> Self {
        self.not_after = Some(when);
        self
    }

    /// Send the request to create an order, returning an [`Order`].
    pub async fn create(self) -> Result<Order<'a>, AcmeError> {
        let account = self.account;
        let payload = NewOrderRequest {
            identifiers: self.identifiers,
            not_before: self.not_before,
            not_after: self.not_after,
        };

        let order: Response<crate::schema::Order> = account
            .client()
            .execute(Request::post(
                payload,
                account.directory().new_order.clone(),
                account.request_key(),
            ))
            .await?;

        let order_url = order
            .location()
            .ok_or(AcmeError::MissingData("order URL"))?;
        tracing::debug!(url = %order_url, status = ?order.payload().status(), "Created order");
        Ok(Order::new(account, order.into_inner(), order_url))
    }

    /// Get an existing order by URL
    pub async fn get(self, url: Url) -> Result<Order<'a>, AcmeError> {
        let order: Response<crate::schema::Order> = self
            .account
            .client()
            .execute(Request::get(url.clone(), self.account.request_key()))
            .await?;
        Ok(Order::new(self.account, order.into_inner(), url))
    }
}
