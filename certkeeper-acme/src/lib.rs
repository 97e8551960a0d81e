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

use certkeeper_certificate::rcgen;
use snafu::Snafu;

/// Target name for ACME-related logging
pub static LOG_TARGET: &str = "certkeeper::acme";

/// Path prefix of the http-01 challenge requests
pub static WELL_KNOWN_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// Errors that can occur during ACME operations
#[derive(Debug, Snafu)]
pub enum Error {
    /// Error from the instant-acme library
    #[snafu(display("ACME instant error: {source}, category: {category}"))]
    Instant {
        category: String,
        source: instant_acme::Error,
    },

    /// Error from certificate signing request generation
    #[snafu(display(
        "Certificate generation error: {source}, category: {category}"
    ))]
    Rcgen {
        category: String,
        source: rcgen::Error,
    },

    /// The authority rejected the account or could not be reached
    #[snafu(display("Account registration failed: {message}"))]
    Registration { message: String },

    /// The authority did not return a certificate
    #[snafu(display("Certificate issuance failed: {reason}"))]
    Issuance { reason: String },

    /// The challenge responder could not bind its address
    #[snafu(display("Challenge responder bind {addr} fail: {source}"))]
    ResponderBind {
        addr: String,
        source: std::io::Error,
    },

    /// The issuance attempt did not finish before its deadline
    #[snafu(display("Issuance attempt timed out after {timeout}"))]
    Timeout { timeout: String },

    #[snafu(display("{source}"))]
    Certificate {
        source: certkeeper_certificate::Error,
    },

    #[snafu(display("{source}"))]
    Config { source: certkeeper_config::Error },

    /// General ACME operation failure
    #[snafu(display(
        "ACME operation failed: {message}, category: {category}"
    ))]
    Fail { category: String, message: String },
}

/// Convenience type alias for Results with our Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<certkeeper_certificate::Error> for Error {
    fn from(source: certkeeper_certificate::Error) -> Self {
        Error::Certificate { source }
    }
}

mod authority;
mod challenge;
mod issuer;
mod lets_encrypt;
mod lifecycle;
mod registrar;

pub use authority::{
    AcmeAuthority, AuthorityEvent, CertificateRequest, ChallengeHook,
    IssuedCertificate, RegisteredAccount,
};
pub use challenge::{ChallengeResponder, ChallengeSlot, ResponderState};
pub use issuer::CertificateIssuer;
pub use lets_encrypt::LetsEncryptAuthority;
pub use lifecycle::{CertificateLifecycle, CertificatePaths, CycleOutcome};
pub use registrar::AccountRegistrar;
