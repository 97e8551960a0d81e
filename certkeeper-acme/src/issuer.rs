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
    AcmeAuthority, AuthorityEvent, CertificateRequest, ChallengeHook,
    ChallengeResponder, ChallengeSlot, Error, Result, LOG_TARGET,
};
use certkeeper_certificate::rcgen::{CertificateParams, DistinguishedName};
use certkeeper_certificate::{AccountRecord, CertificateBundle, KeyMaterial};
use certkeeper_config::AcmeConf;
use certkeeper_core::duration_to_string;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

/// Publishes the proof of the authority events into the slot.
struct SlotHook {
    slot: Arc<ChallengeSlot>,
}

impl ChallengeHook for SlotHook {
    fn notify(&self, event: AuthorityEvent) {
        match event {
            AuthorityEvent::Progress { stage, message } => {
                debug!(target: LOG_TARGET, stage, message, "authority progress");
            },
            AuthorityEvent::Challenge {
                domain,
                token,
                proof,
            } => {
                if self.slot.publish(&token, &proof) {
                    info!(
                        target: LOG_TARGET,
                        domain, token, "challenge proof is published"
                    );
                } else {
                    debug!(
                        target: LOG_TARGET,
                        domain,
                        token,
                        "challenge proof of the token is already set, ignore"
                    );
                }
            },
        }
    }
}

/// Builds the DER encoded signing request for `domains`.
fn new_csr(domains: &[String], server_key: &KeyMaterial) -> Result<Vec<u8>> {
    let mut params =
        CertificateParams::new(domains.to_vec()).map_err(|e| Error::Rcgen {
            category: "csr_params".to_string(),
            source: e,
        })?;
    params.distinguished_name = DistinguishedName::new();
    let key_pair = server_key.key_pair()?;
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| Error::Rcgen {
            category: "serialize_csr".to_string(),
            source: e,
        })?;
    Ok(csr.der().to_vec())
}

/// Drives one issuance attempt at a time: signing request, challenge
/// responder, authority exchange and bundle persistence.
pub struct CertificateIssuer {
    conf: Arc<AcmeConf>,
    authority: Arc<dyn AcmeAuthority>,
    slot: Arc<ChallengeSlot>,
    attempt: Mutex<()>,
}

impl CertificateIssuer {
    pub fn new(conf: Arc<AcmeConf>, authority: Arc<dyn AcmeAuthority>) -> Self {
        Self {
            conf,
            authority,
            slot: Arc::new(ChallengeSlot::new()),
            attempt: Mutex::new(()),
        }
    }
    /// Issues a certificate and replaces the bundle file.
    ///
    /// The authority exchange and every wait for the proof share one
    /// deadline. The responder is closed before returning and the previous
    /// bundle stays untouched unless both the leaf and the chain arrive.
    pub async fn issue(
        &self,
        domains: &[String],
        account: &AccountRecord,
        account_key: &KeyMaterial,
        server_key: &KeyMaterial,
    ) -> Result<CertificateBundle> {
        let _attempt = self.attempt.lock().await;
        let timeout = self.conf.get_issue_timeout();
        let deadline = Instant::now() + timeout;
        let csr_der = new_csr(domains, server_key)?;
        let addr = self
            .conf
            .get_challenge_addr()
            .map_err(|e| Error::Config { source: e })?;

        self.slot.reset();
        let mut responder = ChallengeResponder::new(self.slot.clone(), deadline);
        let responder_addr = responder.listen(addr).await?;
        info!(
            target: LOG_TARGET,
            domains = domains.join(","),
            timeout = duration_to_string(timeout),
            "issue certificate"
        );

        let hook = SlotHook {
            slot: self.slot.clone(),
        };
        let request = CertificateRequest {
            account,
            account_key,
            csr_der,
            domains: domains.to_vec(),
            skip_challenge_verification: self.conf.is_staging(),
            responder_addr,
        };
        let result = timeout_at(
            deadline,
            self.authority.create_certificate(request, &hook),
        )
        .await;
        responder.close().await;
        self.slot.reset();

        let Some(issued) = result.map_err(|_| Error::Timeout {
            timeout: duration_to_string(timeout),
        })??
        else {
            return Err(Error::Issuance {
                reason: "authority returned no certificate".to_string(),
            });
        };
        let bundle = CertificateBundle::new(&issued.cert, &issued.chain)
            .map_err(|e| Error::Issuance {
                reason: e.to_string(),
            })?;
        let info = bundle.info().map_err(|e| Error::Issuance {
            reason: e.to_string(),
        })?;
        bundle.save(&self.conf.get_bundle_path())?;
        info!(
            target: LOG_TARGET,
            domains = info.domains.join(","),
            issuer = info.get_issuer_common_name(),
            not_after = info.not_after,
            "certificate is issued"
        );
        Ok(bundle)
    }
}
