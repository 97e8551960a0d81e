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

use super::Result;
use async_trait::async_trait;
use certkeeper_certificate::{AccountRecord, KeyMaterial};
use std::net::SocketAddr;

/// Notification emitted by the authority while an order is processed.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthorityEvent {
    /// Informational progress, e.g. `order` / `pending`
    Progress { stage: String, message: String },
    /// Proof of control for `token` is available
    Challenge {
        domain: String,
        token: String,
        proof: String,
    },
}

/// Receives the events of an in-flight order.
///
/// The same event may be delivered more than once, applying it has to be
/// idempotent.
pub trait ChallengeHook: Send + Sync {
    fn notify(&self, event: AuthorityEvent);
}

/// Result of a successful account registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredAccount {
    pub status: String,
    pub initial_ip: Option<String>,
    /// Account url, together with the account key it identifies the
    /// account in later requests
    pub account_url: String,
}

pub struct CertificateRequest<'a> {
    pub account: &'a AccountRecord,
    pub account_key: &'a KeyMaterial,
    /// DER encoded certificate signing request
    pub csr_der: Vec<u8>,
    pub domains: Vec<String>,
    /// Skips the self fetch of the challenge before it is reported ready,
    /// only set in test mode
    pub skip_challenge_verification: bool,
    /// Address the challenge responder is bound to
    pub responder_addr: SocketAddr,
}

/// Leaf certificate and its issuer chain, PEM encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCertificate {
    pub cert: String,
    pub chain: String,
}

/// Client side of the issuance authority.
#[async_trait]
pub trait AcmeAuthority: Send + Sync {
    /// Registers a new account signed by `account_key`, agreeing to the
    /// terms of service.
    async fn create_account(
        &self,
        account_key: &KeyMaterial,
        contacts: &[String],
    ) -> Result<RegisteredAccount>;
    /// Runs the order, challenge and finalize exchange.
    ///
    /// `Ok(None)` means the authority finished without a certificate.
    async fn create_certificate(
        &self,
        request: CertificateRequest<'_>,
        hook: &dyn ChallengeHook,
    ) -> Result<Option<IssuedCertificate>>;
}
