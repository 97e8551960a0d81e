// Copyright 2024-2025 Tree xie.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use async_trait::async_trait;
use certkeeper_acme::{
    AcmeAuthority, AuthorityEvent, CertificateLifecycle, CertificateRequest,
    ChallengeHook, CycleOutcome, Error, IssuedCertificate, RegisteredAccount,
    Result,
};
use certkeeper_certificate::rcgen::{
    BasicConstraints, Certificate, CertificateParams,
    CertificateSigningRequestParams, DistinguishedName, DnType, IsCa, KeyPair,
};
use certkeeper_certificate::KeyMaterial;
use certkeeper_config::AcmeConf;
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;

/// Authority that validates the challenge against the live responder and
/// signs the request with a throwaway CA.
struct MockAuthority {
    ca: Certificate,
    ca_key: KeyPair,
    accounts: AtomicU32,
    certificates: AtomicU32,
    valid_days: AtomicI64,
    issue: AtomicBool,
}

impl MockAuthority {
    fn new(valid_days: i64) -> Arc<Self> {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut name = DistinguishedName::new();
        name.push(DnType::OrganizationName, "certkeeper test");
        name.push(DnType::CommonName, "certkeeper mock CA");
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = params.self_signed(&ca_key).unwrap();
        Arc::new(Self {
            ca,
            ca_key,
            accounts: AtomicU32::new(0),
            certificates: AtomicU32::new(0),
            valid_days: AtomicI64::new(valid_days),
            issue: AtomicBool::new(true),
        })
    }
    fn certificates(&self) -> u32 {
        self.certificates.load(Ordering::SeqCst)
    }
    fn accounts(&self) -> u32 {
        self.accounts.load(Ordering::SeqCst)
    }
}

fn fail(category: &str, message: String) -> Error {
    Error::Fail {
        category: category.to_string(),
        message,
    }
}

#[async_trait]
impl AcmeAuthority for MockAuthority {
    async fn create_account(
        &self,
        _account_key: &KeyMaterial,
        _contacts: &[String],
    ) -> Result<RegisteredAccount> {
        self.accounts.fetch_add(1, Ordering::SeqCst);
        Ok(RegisteredAccount {
            status: "valid".to_string(),
            initial_ip: Some("127.0.0.1".to_string()),
            account_url: "https://acme.test/acct/1".to_string(),
        })
    }

    async fn create_certificate(
        &self,
        request: CertificateRequest<'_>,
        hook: &dyn ChallengeHook,
    ) -> Result<Option<IssuedCertificate>> {
        let count = self.certificates.fetch_add(1, Ordering::SeqCst);
        if request.account.account_url.is_empty() {
            return Err(fail("account", "account url is missing".to_string()));
        }
        let thumbprint = request
            .account_key
            .jwk_thumbprint()
            .map_err(|e| fail("thumbprint", e.to_string()))?;
        let base = format!("http://{}", request.responder_addr);

        let resp = reqwest::get(format!("{base}/favicon.ico"))
            .await
            .map_err(|e| fail("fetch", e.to_string()))?;
        if resp.status().as_u16() != 404 {
            return Err(fail("fetch", format!("unexpected {}", resp.status())));
        }
        hook.notify(AuthorityEvent::Progress {
            stage: "order".to_string(),
            message: "pending".to_string(),
        });

        // one authorization per domain, validated one after another
        for (index, domain) in request.domains.iter().enumerate() {
            let token = format!("token-{count}-{index}");
            let proof = format!("{token}.{thumbprint}");
            // the verification request races ahead of the proof
            let url = format!("{base}/.well-known/acme-challenge/{token}");
            let validation = tokio::spawn(async move {
                let resp = reqwest::get(url).await?;
                let status = resp.status().as_u16();
                Ok::<_, reqwest::Error>((status, resp.text().await?))
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
            for value in [proof.as_str(), "stale.proof", proof.as_str()] {
                hook.notify(AuthorityEvent::Challenge {
                    domain: domain.clone(),
                    token: token.clone(),
                    proof: value.to_string(),
                });
            }
            let (status, body) = validation
                .await
                .map_err(|e| fail("validation", e.to_string()))?
                .map_err(|e| fail("validation", e.to_string()))?;
            if status != 200 || body != proof {
                return Err(fail(
                    "validation",
                    format!("{domain} answered {status}: {body}"),
                ));
            }
        }

        if !self.issue.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let csr_pem = pem::encode(&pem::Pem::new(
            "CERTIFICATE REQUEST",
            request.csr_der.clone(),
        ));
        let mut csr = CertificateSigningRequestParams::from_pem(&csr_pem)
            .map_err(|e| Error::Rcgen {
                category: "parse_csr".to_string(),
                source: e,
            })?;
        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now - time::Duration::days(1);
        csr.params.not_after = now
            + time::Duration::days(self.valid_days.load(Ordering::SeqCst));
        let cert =
            csr.signed_by(&self.ca, &self.ca_key)
                .map_err(|e| Error::Rcgen {
                    category: "sign_csr".to_string(),
                    source: e,
                })?;
        Ok(Some(IssuedCertificate {
            cert: cert.pem(),
            chain: self.ca.pem(),
        }))
    }
}

fn new_conf(dir: &Path, domains: &[&str]) -> Arc<AcmeConf> {
    let file = |name: &str| Some(dir.join(name).to_string_lossy().to_string());
    let mut conf = AcmeConf::new(domains);
    conf.account_path = file("account.json");
    conf.account_key_path = file("account.key");
    conf.server_key_path = file("server.key");
    conf.bundle_path = file("bundle.pem");
    conf.challenge_addr = Some("127.0.0.1:0".to_string());
    conf.subscriber_email = Some("owner@example.com".to_string());
    conf.staging = Some(true);
    conf.issue_timeout = Some(Duration::from_secs(10));
    conf.monitor_interval = Some(Duration::from_millis(200));
    conf.validate().unwrap();
    Arc::new(conf)
}

async fn wait_until(f: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(20), async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_fresh_environment() {
    let dir = tempfile::tempdir().unwrap();
    let authority = MockAuthority::new(90);
    let lifecycle = CertificateLifecycle::new(
        new_conf(&dir.path().join("certs"), &["example.com"]),
        authority.clone(),
    );
    assert_eq!(false, lifecycle.check_certificate().await);
    assert_eq!(4, lifecycle.evaluate().await.errors().len());

    let paths = lifecycle.get_certificate().await.unwrap();
    assert_eq!(dir.path().join("certs/server.key"), paths.key_path);
    assert_eq!(dir.path().join("certs/bundle.pem"), paths.chain_path);
    for name in ["account.key", "server.key", "account.json", "bundle.pem"] {
        assert_eq!(true, dir.path().join("certs").join(name).exists());
    }
    assert_eq!(1, authority.accounts());
    assert_eq!(1, authority.certificates());

    assert_eq!(true, lifecycle.check_certificate().await);
    let verdict = lifecycle.evaluate().await;
    let chain = verdict.chain.as_ref().unwrap();
    assert_eq!(vec!["example.com".to_string()], chain.domains);
    assert_eq!("certkeeper mock CA", chain.issuer_common_name);
    assert_eq!(2, chain.certificates);

    // a valid certificate is kept as is
    let outcome = lifecycle.run_cycle().await.unwrap();
    assert_eq!(true, matches!(outcome, CycleOutcome::Valid { .. }));
    lifecycle.get_certificate().await.unwrap();
    assert_eq!(1, authority.certificates());
    assert_eq!(1, authority.accounts());
}

#[tokio::test]
async fn test_expiring_certificate_is_renewed_once() {
    let dir = tempfile::tempdir().unwrap();
    let authority = MockAuthority::new(1);
    let lifecycle = CertificateLifecycle::new(
        new_conf(dir.path(), &["example.com"]),
        authority.clone(),
    );
    let outcome = lifecycle.run_cycle().await.unwrap();
    let CycleOutcome::Renewed {
        days_remaining: Some(days),
    } = outcome
    else {
        panic!("certificate should be renewed");
    };
    assert_eq!(true, days > 0.9 && days <= 1.0);
    assert_eq!(false, lifecycle.check_certificate().await);
    assert_eq!(1, authority.certificates());
    let server_key =
        std::fs::read_to_string(dir.path().join("server.key")).unwrap();

    authority.valid_days.store(90, Ordering::SeqCst);
    lifecycle.get_certificate().await.unwrap();
    assert_eq!(2, authority.certificates());
    assert_eq!(1, authority.accounts());
    assert_eq!(true, lifecycle.check_certificate().await);
    // keys are loaded, never regenerated
    assert_eq!(
        server_key,
        std::fs::read_to_string(dir.path().join("server.key")).unwrap()
    );
}

#[tokio::test]
async fn test_failed_issuance_keeps_previous_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let authority = MockAuthority::new(1);
    let lifecycle = CertificateLifecycle::new(
        new_conf(dir.path(), &["example.com"]),
        authority.clone(),
    );
    lifecycle.get_certificate().await.unwrap();
    let bundle = std::fs::read_to_string(dir.path().join("bundle.pem")).unwrap();

    authority.issue.store(false, Ordering::SeqCst);
    let err = lifecycle.get_certificate().await.unwrap_err();
    assert_eq!(true, matches!(err, Error::Issuance { .. }));
    assert_eq!(2, authority.certificates());
    assert_eq!(
        bundle,
        std::fs::read_to_string(dir.path().join("bundle.pem")).unwrap()
    );
}

#[tokio::test]
async fn test_concurrent_callers_share_one_issuance() {
    let dir = tempfile::tempdir().unwrap();
    let authority = MockAuthority::new(90);
    let lifecycle = CertificateLifecycle::new(
        new_conf(dir.path(), &["example.com"]),
        authority.clone(),
    );
    let (first, second) =
        tokio::join!(lifecycle.get_certificate(), lifecycle.get_certificate());
    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(1, authority.certificates());
}

#[tokio::test]
async fn test_domain_change_triggers_renewal() {
    let dir = tempfile::tempdir().unwrap();
    let authority = MockAuthority::new(90);
    CertificateLifecycle::new(
        new_conf(dir.path(), &["example.com"]),
        authority.clone(),
    )
    .get_certificate()
    .await
    .unwrap();

    let lifecycle = CertificateLifecycle::new(
        new_conf(dir.path(), &["example.com", "www.example.com"]),
        authority.clone(),
    );
    assert_eq!(false, lifecycle.check_certificate().await);
    lifecycle.get_certificate().await.unwrap();
    assert_eq!(2, authority.certificates());
    assert_eq!(true, lifecycle.check_certificate().await);
    assert_eq!(
        vec!["example.com".to_string(), "www.example.com".to_string()],
        lifecycle.evaluate().await.chain.unwrap().domains
    );

    // the same names written differently are no change
    let lifecycle = CertificateLifecycle::new(
        new_conf(dir.path(), &["WWW.example.com.", "example.com"]),
        authority.clone(),
    );
    assert_eq!(true, lifecycle.check_certificate().await);
    lifecycle.get_certificate().await.unwrap();
    assert_eq!(2, authority.certificates());
}

#[tokio::test]
async fn test_every_domain_is_validated() {
    let dir = tempfile::tempdir().unwrap();
    let authority = MockAuthority::new(90);
    let lifecycle = CertificateLifecycle::new(
        new_conf(
            dir.path(),
            &["example.com", "www.example.com", "api.example.com"],
        ),
        authority.clone(),
    );
    let outcome = lifecycle.run_cycle().await.unwrap();
    assert_eq!(true, matches!(outcome, CycleOutcome::Renewed { .. }));
    assert_eq!(1, authority.certificates());
    assert_eq!(3, lifecycle.evaluate().await.chain.unwrap().domains.len());
}

#[tokio::test]
async fn test_account_bound_to_other_key() {
    let dir = tempfile::tempdir().unwrap();
    let authority = MockAuthority::new(90);
    let lifecycle = CertificateLifecycle::new(
        new_conf(dir.path(), &["example.com"]),
        authority.clone(),
    );
    lifecycle.get_certificate().await.unwrap();
    std::fs::remove_file(dir.path().join("account.key")).unwrap();

    assert_eq!(false, lifecycle.check_certificate().await);
    let err = lifecycle.get_certificate().await.unwrap_err();
    assert_eq!(true, matches!(err, Error::Registration { .. }));
    assert_eq!(1, authority.certificates());
}

#[tokio::test]
async fn test_monitor_retries_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let authority = MockAuthority::new(90);
    authority.issue.store(false, Ordering::SeqCst);
    let lifecycle = Arc::new(CertificateLifecycle::new(
        new_conf(dir.path(), &["example.com"]),
        authority.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = tokio::spawn(lifecycle.clone().monitor(shutdown_rx));

    // a failed cycle does not stop the loop
    wait_until(|| authority.certificates() >= 2).await;
    assert_eq!(false, lifecycle.check_certificate().await);

    authority.issue.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(20), async {
        while !lifecycle.check_certificate().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    let issued = authority.certificates();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(issued, authority.certificates());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), monitor)
        .await
        .unwrap()
        .unwrap();
}
