//! Issue a certificate from the Let's Encrypt staging environment.
//!
//! This example does not talk to a DNS host. Each challenge record is printed,
//! and you create it yourself before pressing enter.
//!
//! ```text
//! cargo run --example issue -- admin@example.com example.com '*.example.com'
//! ```
//!
//! Set `DNSACME_CONFIG` to a JSON file to load the full configuration instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dnsacme::{DnsProvider, IssueConfig, ProviderError, RecordHandle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Asks the operator to create and delete each record.
#[derive(Debug, Default)]
struct ManualDns {
    next: AtomicU64,
}

impl ManualDns {
    async fn confirm(&self, prompt: String) -> Result<(), ProviderError> {
        println!("{prompt}");
        println!("Press enter to continue.");
        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|error| ProviderError::new(error.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for ManualDns {
    fn name(&self) -> &str {
        "manual"
    }

    async fn add_txt_record(
        &self,
        fqdn: &str,
        value: &str,
        ttl: u32,
    ) -> Result<RecordHandle, ProviderError> {
        self.confirm(format!("Create TXT {fqdn} {ttl} \"{value}\"")).await?;
        Ok(RecordHandle {
            fqdn: fqdn.to_owned(),
            value: value.to_owned(),
            id: Some(self.next.fetch_add(1, Ordering::Relaxed).to_string()),
        })
    }

    async fn delete_record(&self, record: &RecordHandle) -> Result<(), ProviderError> {
        self.confirm(format!("Delete TXT {} \"{}\"", record.fqdn, record.value))
            .await
    }
}

fn load_config() -> Result<IssueConfig, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("DNSACME_CONFIG") {
        let raw = std::fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&raw)?);
    }

    let mut args = std::env::args().skip(1);
    let email = args.next().ok_or("usage: issue EMAIL DOMAIN...")?;
    let domains: Vec<String> = args.collect();
    Ok(IssueConfig::new(domains, &email, "certs", true))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = load_config()?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cleaning up");
            trigger.cancel();
        }
    });

    let bundle = dnsacme::issue_or_renew(&config, Arc::new(ManualDns::default()), cancel).await?;

    println!("Certificate for {}", bundle.domains.join(", "));
    println!("Valid until {}", bundle.not_after);
    if let Some(path) = &bundle.path {
        println!("Stored in {}", path.display());
    }
    Ok(())
}
