//! A mock ACME provider and an in-memory DNS provider for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use dnsacme::dns::{PropagationChecker, PropagationConfig, ProviderRetry, ResolveError, TxtResolver};
use dnsacme::protocol::RetryPolicy;
use dnsacme::service::PollPolicy;
use dnsacme::{DnsProvider, IssueConfig, ProviderError, RecordHandle};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// DNS zone held in memory, which also answers TXT lookups.
#[derive(Debug, Default)]
pub struct FakeDns {
    next_id: AtomicU32,
    fail_adds: AtomicU32,
    live: Mutex<Vec<RecordHandle>>,
    created: Mutex<Vec<RecordHandle>>,
    deleted: Mutex<Vec<RecordHandle>>,
}

impl FakeDns {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` calls to `add_txt_record`.
    pub fn fail_next_adds(&self, count: u32) {
        self.fail_adds.store(count, Ordering::SeqCst);
    }

    pub fn values(&self, fqdn: &str) -> Vec<String> {
        self.live
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.fqdn == fqdn)
            .map(|record| record.value.clone())
            .collect()
    }

    pub fn live(&self) -> Vec<RecordHandle> {
        self.live.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<RecordHandle> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<RecordHandle> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl DnsProvider for FakeDns {
    fn name(&self) -> &str {
        "fake"
    }

    async fn add_txt_record(
        &self,
        fqdn: &str,
        value: &str,
        _ttl: u32,
    ) -> Result<RecordHandle, ProviderError> {
        if self
            .fail_adds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::new("zone is locked"));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = RecordHandle {
            fqdn: fqdn.to_owned(),
            value: value.to_owned(),
            id: Some(format!("rec-{id}")),
        };
        self.live.lock().unwrap().push(handle.clone());
        self.created.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    async fn delete_record(&self, handle: &RecordHandle) -> Result<(), ProviderError> {
        self.live.lock().unwrap().retain(|record| record != handle);
        self.deleted.lock().unwrap().push(handle.clone());
        Ok(())
    }
}

#[async_trait]
impl TxtResolver for FakeDns {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, ResolveError> {
        Ok(self.values(name))
    }
}

/// Creates records in a [`FakeDns`], but answers late for one name.
#[derive(Debug)]
pub struct SlowDns {
    pub zone: Arc<FakeDns>,
    pub slow_fqdn: String,
    pub delay: Duration,
}

#[async_trait]
impl DnsProvider for SlowDns {
    fn name(&self) -> &str {
        "slow"
    }

    async fn add_txt_record(
        &self,
        fqdn: &str,
        value: &str,
        ttl: u32,
    ) -> Result<RecordHandle, ProviderError> {
        let handle = self.zone.add_txt_record(fqdn, value, ttl).await?;
        if fqdn == self.slow_fqdn {
            tokio::time::sleep(self.delay).await;
        }
        Ok(handle)
    }

    async fn delete_record(&self, handle: &RecordHandle) -> Result<(), ProviderError> {
        self.zone.delete_record(handle).await
    }
}

/// How the mock provider misbehaves.
#[derive(Debug, Default, Clone)]
pub struct Scenario {
    /// Answer the first `newOrder` with `badNonce`.
    pub bad_nonce_on_new_order: bool,
    /// Answer this many `newOrder` requests with HTTP 503 first.
    pub unavailable_new_orders: u32,
    /// Reject `newOrder` with a `rateLimited` problem document.
    pub rate_limit_new_order: bool,
    /// Domains whose authorization becomes invalid.
    pub invalid: BTreeSet<String>,
    /// Domains whose authorization only offers `http-01`.
    pub http01_only: BTreeSet<String>,
    /// Domains whose authorization never leaves `pending`.
    pub stuck: BTreeSet<String>,
    /// Order fetches which still report `pending` once every authorization is valid.
    pub ready_after_polls: u32,
    /// Leave this name out of the issued certificate.
    pub omit_from_certificate: Option<String>,
}

#[derive(Debug)]
struct Authz {
    domain: String,
    token: String,
    status: &'static str,
    offered: bool,
    challenge_status: &'static str,
    error: Option<String>,
}

#[derive(Debug, Default)]
struct CaState {
    scenario: Scenario,
    next_nonce: u64,
    issued: HashSet<String>,
    used: HashSet<String>,
    nonce_violations: u32,
    thumbprint: Option<String>,
    identifiers: Vec<String>,
    authorizations: Vec<Authz>,
    order_status: &'static str,
    new_order_requests: u32,
    new_order_nonces: Vec<String>,
    bad_nonce_reply: Option<String>,
    finalize_requests: u32,
    requests: Vec<String>,
    certificate: Option<String>,
    forget_accounts: bool,
}

/// A mock ACME provider backed by `wiremock`.
#[derive(Clone)]
pub struct MockCa {
    base: String,
    state: Arc<Mutex<CaState>>,
    dns: Arc<FakeDns>,
}

pub struct RunningCa {
    pub server: MockServer,
    pub ca: MockCa,
}

impl RunningCa {
    pub async fn start(dns: Arc<FakeDns>, scenario: Scenario) -> Self {
        let server = MockServer::start().await;
        let ca = MockCa {
            base: server.uri(),
            state: Arc::new(Mutex::new(CaState {
                scenario,
                order_status: "pending",
                ..Default::default()
            })),
            dns,
        };
        Mock::given(any())
            .respond_with(ca.clone())
            .mount(&server)
            .await;
        RunningCa { server, ca }
    }

    pub fn directory_url(&self) -> dnsacme::protocol::Url {
        format!("{}/directory", self.ca.base).parse().unwrap()
    }

    /// Configuration with short delays, pointed at this provider.
    pub fn config(&self, dir: &Path, domains: &[&str]) -> IssueConfig {
        let mut config = IssueConfig::new(domains.iter().copied(), "admin@example.com", dir, false);
        config.directory_url = Some(self.directory_url());
        config.retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            max_bad_nonce: 3,
        };
        config.poll = PollPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            authorization_timeout: Duration::from_secs(5),
        };
        config.provider_retry = ProviderRetry {
            attempts: 2,
            delay: Duration::from_millis(10),
        };
        config.propagation = self.propagation_config();
        config.order_timeout = Duration::from_secs(20);
        config.http_timeout = Duration::from_secs(5);
        config
    }

    pub fn propagation_config(&self) -> PropagationConfig {
        PropagationConfig {
            attempts: 3,
            delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// A propagation check which resolves against the fake zone.
    pub fn propagation(&self) -> PropagationChecker {
        PropagationChecker::with_resolvers(
            self.propagation_config(),
            vec![self.ca.dns.clone() as Arc<dyn TxtResolver>],
        )
    }

    pub fn requests(&self) -> Vec<String> {
        self.ca.state.lock().unwrap().requests.clone()
    }

    pub fn count(&self, request: &str) -> usize {
        self.requests().iter().filter(|r| *r == request).count()
    }

    pub fn new_order_requests(&self) -> u32 {
        self.ca.state.lock().unwrap().new_order_requests
    }

    pub fn finalize_requests(&self) -> u32 {
        self.ca.state.lock().unwrap().finalize_requests
    }

    pub fn nonce_violations(&self) -> u32 {
        self.ca.state.lock().unwrap().nonce_violations
    }

    /// Nonces used by each `newOrder` attempt, and the nonce carried by the
    /// `badNonce` rejection.
    pub fn new_order_nonces(&self) -> (Vec<String>, Option<String>) {
        let state = self.ca.state.lock().unwrap();
        (state.new_order_nonces.clone(), state.bad_nonce_reply.clone())
    }

    /// Answer account fetches with `accountDoesNotExist` from now on.
    pub fn forget_accounts(&self) {
        self.ca.state.lock().unwrap().forget_accounts = true;
    }

    pub fn certificate(&self) -> Option<String> {
        self.ca.state.lock().unwrap().certificate.clone()
    }
}

/// The decoded parts of a flattened JWS.
struct Jws {
    header: Value,
    payload: Option<Value>,
}

fn decode_segment(segment: &str) -> Option<Vec<u8>> {
    Base64UrlUnpadded::decode_vec(segment).ok()
}

fn parse_jws(body: &[u8]) -> Option<Jws> {
    let jws: Value = serde_json::from_slice(body).ok()?;
    let header = serde_json::from_slice(&decode_segment(jws["protected"].as_str()?)?).ok()?;
    let payload = jws["payload"].as_str()?;
    let payload = if payload.is_empty() {
        None
    } else {
        serde_json::from_slice(&decode_segment(payload)?).ok()
    };
    Some(Jws { header, payload })
}

fn thumbprint(jwk: &Value) -> String {
    let canonical = match jwk["kty"].as_str() {
        Some("RSA") => format!(
            r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
            jwk["e"].as_str().unwrap_or_default(),
            jwk["n"].as_str().unwrap_or_default()
        ),
        _ => format!(
            r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
            jwk["crv"].as_str().unwrap_or_default(),
            jwk["x"].as_str().unwrap_or_default(),
            jwk["y"].as_str().unwrap_or_default()
        ),
    };
    Base64UrlUnpadded::encode_string(&Sha256::digest(canonical.as_bytes()))
}

fn txt_digest(token: &str, thumbprint: &str) -> String {
    let key_authorization = format!("{token}.{thumbprint}");
    Base64UrlUnpadded::encode_string(&Sha256::digest(key_authorization.as_bytes()))
}

fn problem(status: u16, kind: &str, detail: &str) -> (u16, Value) {
    (
        status,
        json!({
            "type": format!("urn:ietf:params:acme:error:{kind}"),
            "detail": detail,
            "status": status,
        }),
    )
}

/// A three certificate chain (leaf, intermediate, root) for `names`.
pub fn issue_chain(names: &[String]) -> String {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    let root_key = KeyPair::generate().unwrap();
    let mut root = CertificateParams::new(Vec::<String>::new()).unwrap();
    root.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let root = root.self_signed(&root_key).unwrap();

    let intermediate_key = KeyPair::generate().unwrap();
    let mut intermediate = CertificateParams::new(Vec::<String>::new()).unwrap();
    intermediate.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let intermediate = intermediate
        .signed_by(&intermediate_key, &root, &root_key)
        .unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let leaf = CertificateParams::new(names.to_vec())
        .unwrap()
        .signed_by(&leaf_key, &intermediate, &intermediate_key)
        .unwrap();

    format!("{}{}{}", leaf.pem(), intermediate.pem(), root.pem())
}

impl MockCa {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn fresh_nonce(&self, state: &mut CaState) -> String {
        state.next_nonce += 1;
        let nonce = format!("nonce-{:04}", state.next_nonce);
        state.issued.insert(nonce.clone());
        nonce
    }

    fn reply(&self, state: &mut CaState, status: u16, body: Value) -> ResponseTemplate {
        let nonce = self.fresh_nonce(state);
        let template = ResponseTemplate::new(status).insert_header("Replay-Nonce", nonce.as_str());
        if status >= 400 {
            template.set_body_raw(body.to_string(), "application/problem+json")
        } else {
            template.set_body_json(body)
        }
    }

    fn order_json(&self, state: &CaState) -> Value {
        let mut order = json!({
            "status": state.order_status,
            "identifiers": state
                .identifiers
                .iter()
                .map(|value| json!({"type": "dns", "value": value}))
                .collect::<Vec<_>>(),
            "authorizations": (0..state.authorizations.len())
                .map(|n| self.url(&format!("/authz/{n}")))
                .collect::<Vec<_>>(),
            "finalize": self.url("/finalize/1"),
        });
        if state.order_status == "valid" {
            order["certificate"] = json!(self.url("/cert/1"));
        }
        if state.order_status == "invalid" {
            order["error"] = json!({
                "type": "urn:ietf:params:acme:error:unauthorized",
                "detail": "Some authorizations failed",
            });
        }
        order
    }

    fn authz_json(&self, n: usize, authz: &Authz) -> Value {
        let wildcard = authz.domain.starts_with("*.");
        let base = authz.domain.trim_start_matches("*.");
        let mut challenge = json!({
            "type": if authz.offered { "dns-01" } else { "http-01" },
            "url": self.url(&format!("/chall/{n}")),
            "status": authz.challenge_status,
            "token": authz.token,
        });
        if let Some(detail) = &authz.error {
            challenge["error"] = json!({
                "type": "urn:ietf:params:acme:error:dns",
                "detail": detail,
                "status": 400,
            });
        }
        let mut value = json!({
            "identifier": {"type": "dns", "value": base},
            "status": authz.status,
            "challenges": [challenge],
        });
        if wildcard {
            value["wildcard"] = json!(true);
        }
        value
    }

    fn refresh_order(state: &mut CaState) {
        if state.order_status != "pending" {
            return;
        }
        if state.authorizations.iter().any(|a| a.status == "invalid") {
            state.order_status = "invalid";
        } else if state.authorizations.iter().all(|a| a.status == "valid")
            && state.scenario.ready_after_polls == 0
        {
            state.order_status = "ready";
        }
    }

    fn handle_post(&self, state: &mut CaState, path: &str, jws: Jws) -> (u16, Value, Vec<(&'static str, String)>) {
        match path {
            "/new-account" => {
                if let Some(jwk) = jws.header.get("jwk") {
                    state.thumbprint = Some(thumbprint(jwk));
                }
                let contact = jws
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("contact").cloned())
                    .unwrap_or_else(|| json!([]));
                (
                    201,
                    json!({"status": "valid", "contact": contact, "orders": self.url("/acct/1/orders")}),
                    vec![("Location", self.url("/acct/1"))],
                )
            }
            "/acct/1" if state.forget_accounts => {
                let (status, body) = problem(400, "accountDoesNotExist", "no such account");
                (status, body, vec![])
            }
            "/acct/1" => (200, json!({"status": "valid"}), vec![]),
            "/new-order" => {
                state.new_order_requests += 1;
                if state.scenario.rate_limit_new_order {
                    let (status, body) =
                        problem(429, "rateLimited", "too many certificates already issued");
                    return (status, body, vec![]);
                }
                if state.scenario.unavailable_new_orders > 0 {
                    state.scenario.unavailable_new_orders -= 1;
                    return (503, json!({"message": "try again later"}), vec![]);
                }

                let identifiers: Vec<String> = jws
                    .payload
                    .as_ref()
                    .and_then(|p| p["identifiers"].as_array().cloned())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|id| id["value"].as_str().map(str::to_owned))
                    .collect();
                state.authorizations = identifiers
                    .iter()
                    .enumerate()
                    .map(|(n, domain)| Authz {
                        domain: domain.clone(),
                        token: format!("token-{n}-{}", domain.replace('*', "star")),
                        status: "pending",
                        offered: !state.scenario.http01_only.contains(domain),
                        challenge_status: "pending",
                        error: None,
                    })
                    .collect();
                state.identifiers = identifiers;
                state.order_status = "pending";
                (
                    201,
                    self.order_json(state),
                    vec![("Location", self.url("/order/1"))],
                )
            }
            "/order/1" => {
                if state.order_status == "processing" {
                    state.order_status = "valid";
                }
                if state.order_status == "pending"
                    && state.authorizations.iter().all(|a| a.status == "valid")
                    && state.scenario.ready_after_polls > 0
                {
                    state.scenario.ready_after_polls -= 1;
                    Self::refresh_order(state);
                }
                (200, self.order_json(state), vec![])
            }
            "/finalize/1" => {
                state.finalize_requests += 1;
                if state.order_status != "ready" {
                    let (status, body) =
                        problem(403, "orderNotReady", "order is not ready for finalization");
                    return (status, body, vec![]);
                }
                let names: Vec<String> = state
                    .identifiers
                    .iter()
                    .filter(|name| state.scenario.omit_from_certificate.as_ref() != Some(*name))
                    .cloned()
                    .collect();
                state.certificate = Some(issue_chain(&names));
                state.order_status = "processing";
                (
                    200,
                    self.order_json(state),
                    vec![("Retry-After", "0".to_owned())],
                )
            }
            path if path.starts_with("/chall/") => {
                let Some(n) = path["/chall/".len()..].parse::<usize>().ok() else {
                    return (404, json!({}), vec![]);
                };
                let thumbprint = state.thumbprint.clone().unwrap_or_default();
                let scenario = state.scenario.clone();
                let Some(authz) = state.authorizations.get_mut(n) else {
                    return (404, json!({}), vec![]);
                };

                let fqdn = format!("_acme-challenge.{}", authz.domain.trim_start_matches("*."));
                let expected = txt_digest(&authz.token, &thumbprint);
                if scenario.stuck.contains(&authz.domain) {
                    authz.challenge_status = "processing";
                } else if scenario.invalid.contains(&authz.domain)
                    || !self.dns.values(&fqdn).contains(&expected)
                {
                    authz.challenge_status = "invalid";
                    authz.status = "invalid";
                    authz.error = Some(format!("No TXT record found at {fqdn}"));
                } else {
                    authz.challenge_status = "valid";
                    authz.status = "valid";
                }

                let body = json!({
                    "type": "dns-01",
                    "url": self.url(path),
                    "status": authz.challenge_status,
                    "token": authz.token,
                });
                Self::refresh_order(state);
                (200, body, vec![])
            }
            path if path.starts_with("/authz/") => {
                let Some(n) = path["/authz/".len()..].parse::<usize>().ok() else {
                    return (404, json!({}), vec![]);
                };
                match state.authorizations.get(n) {
                    Some(authz) => (200, self.authz_json(n, authz), vec![]),
                    None => (404, json!({}), vec![]),
                }
            }
            _ => (404, json!({}), vec![]),
        }
    }
}

impl Respond for MockCa {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut state = self.state.lock().unwrap();
        let method = request.method.to_string();
        let path = request.url.path().to_owned();
        state.requests.push(format!("{method} {path}"));

        match (method.as_str(), path.as_str()) {
            ("GET", "/directory") => {
                return ResponseTemplate::new(200).set_body_json(json!({
                    "newNonce": self.url("/new-nonce"),
                    "newAccount": self.url("/new-account"),
                    "newOrder": self.url("/new-order"),
                    "revokeCert": self.url("/revoke-cert"),
                    "keyChange": self.url("/key-change"),
                    "meta": {"termsOfService": self.url("/terms")},
                }));
            }
            ("HEAD", "/new-nonce") => {
                let nonce = self.fresh_nonce(&mut state);
                return ResponseTemplate::new(200)
                    .insert_header("Replay-Nonce", nonce.as_str())
                    .insert_header("Cache-Control", "no-store");
            }
            ("POST", _) => {}
            _ => return ResponseTemplate::new(405),
        }

        let Some(jws) = parse_jws(&request.body) else {
            let (status, body) = problem(400, "malformed", "request is not a JWS");
            return self.reply(&mut state, status, body);
        };

        let nonce = jws.header["nonce"].as_str().unwrap_or_default().to_owned();
        if !state.issued.contains(&nonce) || !state.used.insert(nonce.clone()) {
            state.nonce_violations += 1;
            let (status, body) = problem(400, "badNonce", "nonce was not issued or reused");
            return self.reply(&mut state, status, body);
        }

        if path == "/new-order" {
            state.new_order_nonces.push(nonce);
            if state.scenario.bad_nonce_on_new_order {
                state.scenario.bad_nonce_on_new_order = false;
                state.new_order_requests += 1;
                let (status, body) = problem(400, "badNonce", "JWS has an invalid anti-replay nonce");
                let template = self.reply(&mut state, status, body);
                state.bad_nonce_reply = Some(format!("nonce-{:04}", state.next_nonce));
                return template;
            }
        }

        if path == "/cert/1" {
            let certificate = state.certificate.clone().unwrap_or_default();
            let nonce = self.fresh_nonce(&mut state);
            return ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", nonce.as_str())
                .set_body_raw(certificate, "application/pem-certificate-chain");
        }

        let (status, body, headers) = self.handle_post(&mut state, &path, jws);
        let mut template = self.reply(&mut state, status, body);
        for (name, value) in headers {
            template = template.insert_header(name, value.as_str());
        }
        template
    }
}

/// Collect the record values that were ever created, per record name.
pub fn created_by_name(dns: &FakeDns) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for record in dns.created() {
        map.entry(record.fqdn).or_default().push(record.value);
    }
    map
}
