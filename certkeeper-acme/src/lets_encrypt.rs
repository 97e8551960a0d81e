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

use super::{
    AcmeAuthority, AuthorityEvent, CertificateRequest, ChallengeHook, Error,
    IssuedCertificate, RegisteredAccount, Result, LOG_TARGET,
    WELL_KNOWN_PATH_PREFIX,
};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::Request;
use certkeeper_certificate::{AccountRecord, KeyMaterial};
use instant_acme::{
    Account, AccountBuilder, AuthorizationStatus, BodyWrapper, BytesResponse,
    ChallengeType, HttpClient, Identifier, Key, NewOrder, Order, OrderStatus,
    RetryPolicy,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing::{debug, info};

// Initialize crypto provider once
static INIT: Once = Once::new();

fn ensure_crypto_provider() {
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

fn instant_error(category: &str) -> impl FnOnce(instant_acme::Error) -> Error {
    let category = category.to_string();
    move |source| Error::Instant { category, source }
}

fn registration_error(message: impl ToString) -> Error {
    Error::Registration {
        message: message.to_string(),
    }
}

const MAX_AUTHORIZATION_DELAY: Duration = Duration::from_secs(5);

/// Splits the full chain returned by the authority into the leaf and its
/// issuer chain, `None` if nothing was returned.
fn split_issued(full_chain: &str) -> Result<Option<IssuedCertificate>> {
    if full_chain.trim().is_empty() {
        return Ok(None);
    }
    let items =
        certkeeper_util::split_pem(full_chain).map_err(|e| Error::Fail {
            category: "split_chain".to_string(),
            message: e.to_string(),
        })?;
    let Some((cert, chain)) = items.split_first() else {
        return Ok(None);
    };
    Ok(Some(IssuedCertificate {
        cert: cert.trim().to_string(),
        chain: chain
            .iter()
            .map(|item| item.trim())
            .collect::<Vec<_>>()
            .join("\n"),
    }))
}

/// Signing key of the account in the form the ACME client takes, built from
/// the stored key. Only EC P-256 keys are accepted.
fn signing_key(
    account_key: &KeyMaterial,
) -> Result<(Key, PrivatePkcs8KeyDer<'static>)> {
    account_key.jwk_thumbprint().map_err(registration_error)?;
    let pkcs8 = PrivatePkcs8KeyDer::from(account_key.pkcs8_der()?);
    let key = Key::from_pkcs8_der(pkcs8.clone_key())
        .map_err(instant_error("account_key"))?;
    Ok((key, pkcs8))
}

/// The authority must see the same key that is stored on disk.
fn verify_thumbprint(
    account: &Account,
    account_key: &KeyMaterial,
) -> Result<()> {
    let expected = account_key.jwk_thumbprint().map_err(registration_error)?;
    if account.key_thumbprint() != expected {
        return Err(registration_error(format!(
            "account {} is not signed by the stored account key",
            account.id()
        )));
    }
    Ok(())
}

/// Lets several account builders share one http client.
struct SharedHttpClient(Arc<dyn HttpClient>);

impl HttpClient for SharedHttpClient {
    fn request(
        &self,
        req: Request<BodyWrapper<Bytes>>,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<BytesResponse, instant_acme::Error>>
                + Send,
        >,
    > {
        self.0.request(req)
    }
}

/// Polls the authorization at `url` until the authority has decided on it.
/// The caller bounds the wait with the attempt deadline.
async fn wait_authorization(
    order: &mut Order,
    url: &str,
    domain: &str,
) -> Result<()> {
    let mut delay = Duration::from_millis(250);
    let mut authorizations = order.authorizations();
    while let Some(result) = authorizations.next().await {
        let mut authz = result.map_err(instant_error("authorizations"))?;
        if authz.url() != url {
            continue;
        }
        loop {
            let state = authz
                .refresh()
                .await
                .map_err(instant_error("refresh_authorization"))?;
            match state.status {
                AuthorizationStatus::Pending => {},
                AuthorizationStatus::Valid => {
                    info!(target: LOG_TARGET, domain, "authorization is valid");
                    return Ok(());
                },
                status => {
                    let problem = state
                        .challenges
                        .iter()
                        .find_map(|item| item.error.as_ref())
                        .map(|item| item.to_string())
                        .unwrap_or_default();
                    return Err(Error::Issuance {
                        reason: format!(
                            "authorization of {domain} is {status:?} {problem}"
                        )
                        .trim()
                        .to_string(),
                    });
                },
            }
            debug!(target: LOG_TARGET, domain, "authorization is pending");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_AUTHORIZATION_DELAY);
        }
    }
    Err(Error::Fail {
        category: "authorization".to_string(),
        message: format!("authorization {url} of {domain} not found"),
    })
}

/// Issuance authority speaking ACME (RFC 8555) to a directory such as
/// Let's Encrypt.
pub struct LetsEncryptAuthority {
    directory_url: String,
    http: reqwest::Client,
    acme_http: Option<Arc<dyn HttpClient>>,
}

impl LetsEncryptAuthority {
    pub fn new(directory_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Fail {
                category: "http_client".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            directory_url: directory_url.to_string(),
            http,
            acme_http: None,
        })
    }
    /// Sends the ACME requests through `http` instead of the default https
    /// client.
    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.acme_http = Some(http);
        self
    }
    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }
    fn account_builder(&self) -> Result<AccountBuilder> {
        ensure_crypto_provider();
        match &self.acme_http {
            Some(http) => Ok(Account::builder_with_http(Box::new(
                SharedHttpClient(http.clone()),
            ))),
            None => {
                Account::builder().map_err(instant_error("account_builder"))
            },
        }
    }
    /// Acts as the stored account, signing with the stored key.
    async fn restore_account(
        &self,
        record: &AccountRecord,
        account_key: &KeyMaterial,
    ) -> Result<Account> {
        if record.account_url.is_empty() {
            return Err(registration_error(
                "account url is missing, remove the account file to register again",
            ));
        }
        if record.directory_url != self.directory_url {
            return Err(registration_error(format!(
                "account is registered with {}, not {}",
                record.directory_url, self.directory_url
            )));
        }
        let pkcs8 = PrivatePkcs8KeyDer::from(account_key.pkcs8_der()?);
        let account = self
            .account_builder()?
            .from_parts(
                record.account_url.clone(),
                pkcs8,
                self.directory_url.clone(),
            )
            .await
            .map_err(instant_error("restore_account"))?;
        verify_thumbprint(&account, account_key)?;
        Ok(account)
    }
    /// Fetches the challenge the way the authority will, to fail early when
    /// the responder is not reachable from outside.
    async fn self_check(
        &self,
        domain: &str,
        token: &str,
        proof: &str,
    ) -> Result<()> {
        let url = format!("http://{domain}{WELL_KNOWN_PATH_PREFIX}{token}");
        let fail = |message: String| Error::Fail {
            category: "self_check".to_string(),
            message,
        };
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| fail(e.to_string()))?;
        if !status.is_success() || body.trim() != proof {
            return Err(fail(format!(
                "{url} responded {status} without the expected proof"
            )));
        }
        info!(target: LOG_TARGET, url, "challenge self check success");
        Ok(())
    }
    /// Publishes the proof of the first pending authorization and reports
    /// its challenge ready. Returns its url and domain, `None` when no
    /// authorization is pending.
    async fn ready_next_authorization(
        &self,
        order: &mut Order,
        request: &CertificateRequest<'_>,
        hook: &dyn ChallengeHook,
    ) -> Result<Option<(String, String)>> {
        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(instant_error("authorizations"))?;
            let domain = authz.identifier().to_string();
            match authz.status {
                AuthorizationStatus::Pending => {},
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(Error::Issuance {
                        reason: format!(
                            "authorization of {domain} is {status:?}"
                        ),
                    });
                },
            }
            let url = authz.url().to_string();
            let mut challenge =
                authz.challenge(ChallengeType::Http01).ok_or_else(|| {
                    Error::Fail {
                        category: "http01".to_string(),
                        message: format!(
                            "http-01 challenge of {domain} not found"
                        ),
                    }
                })?;
            let token = challenge.token.clone();
            let proof = challenge.key_authorization().as_str().to_string();
            hook.notify(AuthorityEvent::Challenge {
                domain: domain.clone(),
                token: token.clone(),
                proof: proof.clone(),
            });
            if !request.skip_challenge_verification {
                self.self_check(&domain, &token, &proof).await?;
            }

            info!(target: LOG_TARGET, domain, token, "challenge is ready");
            challenge
                .set_ready()
                .await
                .map_err(instant_error("set_challenge_ready"))?;
            return Ok(Some((url, domain)));
        }
        Ok(None)
    }
}

#[async_trait]
impl AcmeAuthority for LetsEncryptAuthority {
    async fn create_account(
        &self,
        account_key: &KeyMaterial,
        contacts: &[String],
    ) -> Result<RegisteredAccount> {
        let (key, pkcs8) = signing_key(account_key)?;
        let (account, _) = self
            .account_builder()?
            .create_from_key(
                (key, PrivateKeyDer::Pkcs8(pkcs8)),
                self.directory_url.clone(),
            )
            .await
            .map_err(registration_error)?;
        verify_thumbprint(&account, account_key)?;
        if !contacts.is_empty() {
            let contact: Vec<&str> =
                contacts.iter().map(|item| item.as_str()).collect();
            account
                .update_contacts(&contact)
                .await
                .map_err(registration_error)?;
        }
        info!(
            target: LOG_TARGET,
            directory_url = self.directory_url,
            account_url = account.id(),
            thumbprint = account.key_thumbprint(),
            "account is created"
        );
        Ok(RegisteredAccount {
            status: "valid".to_string(),
            initial_ip: None,
            account_url: account.id().to_string(),
        })
    }

    /// The ACME flow:
    /// 1. Restores the account from its url and the stored account key
    /// 2. Creates a new order for the domains
    /// 3. Takes the pending authorizations one at a time: publishes the
    ///    http-01 proof through the hook, reports the challenge ready and
    ///    waits until the authority has validated it
    /// 4. Submits the signing request and retrieves the chain
    async fn create_certificate(
        &self,
        request: CertificateRequest<'_>,
        hook: &dyn ChallengeHook,
    ) -> Result<Option<IssuedCertificate>> {
        let account = self
            .restore_account(request.account, request.account_key)
            .await?;

        let identifiers = request
            .domains
            .iter()
            .map(|item| Identifier::Dns(item.to_owned()))
            .collect::<Vec<Identifier>>();
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(instant_error("new_order"))?;

        let status = order.state().status;
        hook.notify(AuthorityEvent::Progress {
            stage: "order".to_string(),
            message: format!("{status:?}"),
        });
        if !matches!(status, OrderStatus::Pending | OrderStatus::Ready) {
            return Err(Error::Fail {
                message: format!("order is not pending, status: {status:?}"),
                category: "order_status".to_string(),
            });
        }

        // the responder serves one proof at a time
        while let Some((url, domain)) = self
            .ready_next_authorization(&mut order, &request, hook)
            .await?
        {
            wait_authorization(&mut order, &url, &domain).await?;
        }

        let retry = RetryPolicy::default().timeout(Duration::from_secs(60));
        let status = order
            .poll_ready(&retry)
            .await
            .map_err(instant_error("poll_ready"))?;
        hook.notify(AuthorityEvent::Progress {
            stage: "poll_ready".to_string(),
            message: format!("{status:?}"),
        });
        if status != OrderStatus::Ready {
            return Err(Error::Issuance {
                reason: format!("unexpected order status: {status:?}"),
            });
        }

        order
            .finalize_csr(&request.csr_der)
            .await
            .map_err(instant_error("finalize"))?;
        let cert_chain_pem = order
            .poll_certificate(&retry)
            .await
            .map_err(instant_error("poll_certificate"))?;
        hook.notify(AuthorityEvent::Progress {
            stage: "certificate".to_string(),
            message: "downloaded".to_string(),
        });

        split_issued(&cert_chain_pem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Response;
    use certkeeper_certificate::rcgen::generate_simple_self_signed;
    use certkeeper_certificate::KeyKind;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    const DIRECTORY_URL: &str = "https://acme.test/directory";
    const ACCOUNT_URL: &str = "https://acme.test/acct/1";

    /// Answers the directory, nonce and account requests of an ACME server.
    #[derive(Default)]
    struct FakeAcmeServer {
        requests: Mutex<Vec<String>>,
    }

    impl FakeAcmeServer {
        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl HttpClient for FakeAcmeServer {
        fn request(
            &self,
            req: Request<BodyWrapper<Bytes>>,
        ) -> Pin<
            Box<
                dyn Future<
                        Output = Result<BytesResponse, instant_acme::Error>,
                    > + Send,
            >,
        > {
            let path = req.uri().path().to_string();
            self.requests
                .lock()
                .unwrap()
                .push(format!("{} {path}", req.method()));
            let builder = Response::builder().header("replay-nonce", "nonce");
            let resp = match path.as_str() {
                "/directory" => builder.body(Body::from(
                    r#"{
    "newNonce": "https://acme.test/new-nonce",
    "newAccount": "https://acme.test/new-account",
    "newOrder": "https://acme.test/new-order"
}"#,
                )),
                "/new-nonce" => builder.body(Body::empty()),
                "/new-account" => builder
                    .status(201)
                    .header("location", ACCOUNT_URL)
                    .body(Body::from(r#"{"status":"valid"}"#)),
                "/acct/1" => builder.body(Body::from(r#"{"status":"valid"}"#)),
                _ => builder.status(404).body(Body::from(
                    r#"{"type":"urn:ietf:params:acme:error:malformed","status":404}"#,
                )),
            }
            .unwrap();
            Box::pin(async move { Ok(BytesResponse::from(resp)) })
        }
    }

    fn new_record(account_url: &str) -> AccountRecord {
        AccountRecord {
            contact: vec![],
            created_at: Utc::now(),
            status: "valid".to_string(),
            initial_ip: None,
            key_fingerprint: String::new(),
            directory_url: DIRECTORY_URL.to_string(),
            account_url: account_url.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_account_with_stored_key() {
        let server = Arc::new(FakeAcmeServer::default());
        let authority = LetsEncryptAuthority::new(DIRECTORY_URL)
            .unwrap()
            .with_http_client(server.clone());
        let key = KeyMaterial::generate(KeyKind::Account).unwrap();

        let registered = authority
            .create_account(&key, &["mailto:owner@example.com".to_string()])
            .await
            .unwrap();
        assert_eq!(ACCOUNT_URL, registered.account_url);
        assert_eq!("valid", registered.status);
        let requests = server.requests();
        assert_eq!("GET /directory", requests[0]);
        // registration first, then the contacts of the new account
        let position =
            |value: &str| requests.iter().position(|item| item == value);
        let account = position("POST /new-account");
        let contacts = position("POST /acct/1");
        assert_eq!(true, account.is_some());
        assert_eq!(true, account < contacts);

        let account = authority
            .restore_account(&new_record(ACCOUNT_URL), &key)
            .await
            .unwrap();
        assert_eq!(ACCOUNT_URL, account.id());
        assert_eq!(key.jwk_thumbprint().unwrap(), account.key_thumbprint());
    }

    #[tokio::test]
    async fn test_account_key_must_match() {
        let authority = LetsEncryptAuthority::new(DIRECTORY_URL)
            .unwrap()
            .with_http_client(Arc::new(FakeAcmeServer::default()));

        let server_key = KeyMaterial::generate(KeyKind::Server).unwrap();
        let err = authority.create_account(&server_key, &[]).await.unwrap_err();
        assert_eq!(true, matches!(err, Error::Registration { .. }));

        let key = KeyMaterial::generate(KeyKind::Account).unwrap();
        let err = authority
            .restore_account(&new_record(""), &key)
            .await
            .err()
            .unwrap();
        assert_eq!(true, matches!(err, Error::Registration { .. }));

        let mut record = new_record(ACCOUNT_URL);
        record.directory_url = "https://other.test/directory".to_string();
        let err = authority.restore_account(&record, &key).await.err().unwrap();
        assert_eq!(true, err.to_string().contains("other.test"));
    }

    #[test]
    fn test_split_issued() {
        let leaf = generate_simple_self_signed(vec!["example.com".to_string()])
            .unwrap()
            .cert
            .pem();
        let intermediate =
            generate_simple_self_signed(vec!["ca.test".to_string()])
                .unwrap()
                .cert
                .pem();
        let root = generate_simple_self_signed(vec!["root.test".to_string()])
            .unwrap()
            .cert
            .pem();

        let issued = split_issued(&format!("{leaf}\n{intermediate}{root}"))
            .unwrap()
            .unwrap();
        assert_eq!(leaf.trim(), issued.cert);
        assert_eq!(
            format!("{}\n{}", intermediate.trim(), root.trim()),
            issued.chain
        );

        let issued = split_issued(&leaf).unwrap().unwrap();
        assert_eq!("", issued.chain);

        assert_eq!(None, split_issued("").unwrap());
    }

    #[test]
    fn test_new_authority() {
        let authority =
            LetsEncryptAuthority::new("https://acme.test/directory").unwrap();
        assert_eq!("https://acme.test/directory", authority.directory_url());
    }
}
