use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::{
    challenge_record_fqdn, DnsProvider, ProviderError, ProviderRetry, RecordHandle, CHALLENGE_TTL,
};

/// A challenge TXT record which has been published through a [`DnsProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsChallengeRecord {
    /// The domain being validated, as named in the order (may be a wildcard).
    pub domain: String,

    /// The TXT record name.
    pub fqdn: String,

    /// The TXT record value.
    pub value: String,

    /// Backend handle used to delete the record.
    pub handle: RecordHandle,
}

/// Publishes and withdraws `dns-01` challenge records.
///
/// Every record published is remembered until it is withdrawn, so that
/// [`DnsChallengeFulfiller::withdraw_all`] can clean up after a failed or
/// abandoned order. Provider calls which create records run as tracked
/// tasks: a record is remembered even when the caller of
/// [`DnsChallengeFulfiller::publish`] stops waiting for it.
#[derive(Debug)]
pub struct DnsChallengeFulfiller {
    inner: Arc<Inner>,
    ttl: u32,
    tasks: TaskTracker,
}

#[derive(Debug)]
struct Inner {
    provider: Arc<dyn DnsProvider>,
    retry: ProviderRetry,
    published: Mutex<Vec<DnsChallengeRecord>>,
}

impl DnsChallengeFulfiller {
    /// Create a fulfiller which publishes through `provider`.
    pub fn new(provider: Arc<dyn DnsProvider>, retry: ProviderRetry) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                retry,
                published: Mutex::new(Vec::new()),
            }),
            ttl: CHALLENGE_TTL,
            tasks: TaskTracker::new(),
        }
    }

    /// Use a different TTL for new records.
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Records which are currently published and not yet withdrawn.
    pub async fn published(&self) -> Vec<DnsChallengeRecord> {
        self.inner.published.lock().await.clone()
    }

    /// Publish the TXT `value` for `domain`'s challenge.
    #[tracing::instrument(level = "debug", skip(self, value))]
    pub async fn publish(
        &self,
        domain: &str,
        value: &str,
    ) -> Result<DnsChallengeRecord, ProviderError> {
        let inner = self.inner.clone();
        let ttl = self.ttl;
        let domain = domain.to_owned();
        let value = value.to_owned();

        let task = self.tasks.spawn(
            async move {
                let fqdn = challenge_record_fqdn(&domain);
                let handle = inner
                    .with_retries("add_txt_record", || {
                        inner.provider.add_txt_record(&fqdn, &value, ttl)
                    })
                    .await?;

                let record = DnsChallengeRecord {
                    domain,
                    fqdn,
                    value,
                    handle,
                };
                inner.published.lock().await.push(record.clone());
                tracing::info!(fqdn = %record.fqdn, "Published challenge record");
                Ok(record)
            }
            .in_current_span(),
        );

        task.await
            .map_err(|error| ProviderError::new(format!("publishing task failed: {error}")))?
    }

    /// Delete one published record.
    ///
    /// The record is forgotten even if the provider keeps failing, so it is
    /// not retried again by [`DnsChallengeFulfiller::withdraw_all`].
    pub async fn withdraw(&self, record: &DnsChallengeRecord) -> Result<(), ProviderError> {
        let result = self
            .inner
            .with_retries("delete_record", || {
                self.inner.provider.delete_record(&record.handle)
            })
            .await;

        self.inner
            .published
            .lock()
            .await
            .retain(|published| published.handle != record.handle);

        result?;
        tracing::debug!(fqdn = %record.fqdn, "Withdrew challenge record");
        Ok(())
    }

    /// Delete every record which has not been withdrawn yet.
    ///
    /// Publishes still in flight are awaited first. Failures are logged and
    /// otherwise ignored.
    pub async fn withdraw_all(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();

        let records = std::mem::take(&mut *self.inner.published.lock().await);
        if records.is_empty() {
            return;
        }

        tracing::debug!(count = records.len(), "Withdrawing remaining challenge records");
        let inner = &self.inner;
        let results = futures::future::join_all(records.iter().map(|record| async move {
            let result = inner
                .with_retries("delete_record", || {
                    inner.provider.delete_record(&record.handle)
                })
                .await;
            (record, result)
        }))
        .await;

        for (record, result) in results {
            if let Err(error) = result {
                tracing::warn!(fqdn = %record.fqdn, %error, "Failed to withdraw challenge record");
            }
        }
    }
}

impl Inner {
    async fn with_retries<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < attempts => {
                    tracing::warn!(
                        provider = %self.provider.name(),
                        operation,
                        attempt,
                        %error,
                        "DNS provider call failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug, Default)]
    struct FlakyProvider {
        failures: AtomicU32,
        added: AtomicU32,
        add_delay: Duration,
        deleted: std::sync::Mutex<Vec<RecordHandle>>,
    }

    #[async_trait]
    impl DnsProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn add_txt_record(
            &self,
            fqdn: &str,
            value: &str,
            _ttl: u32,
        ) -> Result<RecordHandle, ProviderError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ProviderError::new("backend unavailable"));
            }
            let id = self.added.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.add_delay).await;
            Ok(RecordHandle {
                fqdn: fqdn.to_owned(),
                value: value.to_owned(),
                id: Some(id.to_string()),
            })
        }

        async fn delete_record(&self, handle: &RecordHandle) -> Result<(), ProviderError> {
            self.deleted.lock().unwrap().push(handle.clone());
            Ok(())
        }
    }

    fn retry() -> ProviderRetry {
        ProviderRetry {
            attempts: 3,
            delay: Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publish_retries_then_succeeds() {
        let provider = Arc::new(FlakyProvider::default());
        provider.failures.store(2, Ordering::SeqCst);
        let fulfiller = DnsChallengeFulfiller::new(provider.clone(), retry());

        let record = fulfiller.publish("*.example.com", "value").await.unwrap();
        assert_eq!(record.fqdn, "_acme-challenge.example.com");
        assert_eq!(record.domain, "*.example.com");
        assert_eq!(fulfiller.published().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_gives_up_after_attempts() {
        let provider = Arc::new(FlakyProvider::default());
        provider.failures.store(3, Ordering::SeqCst);
        let fulfiller = DnsChallengeFulfiller::new(provider.clone(), retry());

        let error = fulfiller.publish("example.com", "value").await.unwrap_err();
        assert_eq!(error.message, "backend unavailable");
        assert!(fulfiller.published().await.is_empty());
    }

    #[tokio::test]
    async fn withdraw_all_removes_remaining_records() {
        let provider = Arc::new(FlakyProvider::default());
        let fulfiller = DnsChallengeFulfiller::new(provider.clone(), retry());

        let first = fulfiller.publish("example.com", "one").await.unwrap();
        fulfiller.publish("*.example.com", "two").await.unwrap();

        fulfiller.withdraw(&first).await.unwrap();
        fulfiller.withdraw_all().await;

        assert!(fulfiller.published().await.is_empty());
        let deleted = provider.deleted.lock().unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(deleted[0].value, "one");
        assert_eq!(deleted[1].value, "two");
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_publish_is_still_withdrawn() {
        let provider = Arc::new(FlakyProvider {
            add_delay: Duration::from_secs(5),
            ..Default::default()
        });
        let fulfiller = DnsChallengeFulfiller::new(provider.clone(), retry());

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            fulfiller.publish("example.com", "value"),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(provider.added.load(Ordering::SeqCst), 1);

        fulfiller.withdraw_all().await;

        assert!(fulfiller.published().await.is_empty());
        let deleted = provider.deleted.lock().unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].value, "value");
    }
}
