//! Internal, Send and Sync client wrapper.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::protocol::{response::Decode, AcmeError, Request, Response};

/// Shares one [`crate::protocol::AcmeClient`], and so one nonce, between
/// concurrent tasks. Each exchange holds the lock from taking the nonce
/// until the next one is recorded.
#[derive(Debug, Clone)]
pub(crate) struct Client {
    inner: Arc<Mutex<crate::protocol::AcmeClient>>,
}

impl Client {
    pub(crate) fn new(client: crate::protocol::AcmeClient) -> Self {
        Client {
            inner: Arc::new(Mutex::new(client)),
        }
    }

    pub(crate) async fn execute<T, R>(&self, request: Request<T>) -> Result<Response<R>, AcmeError>
    where
        T: Serialize,
        R: Decode,
    {
        let mut client = self.inner.lock().await;
        client.execute(request).await
    }
}
