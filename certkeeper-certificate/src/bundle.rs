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

use super::{Error, Result, LOG_TARGET};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::LazyLock;
use tracing::info;
use x509_parser::pem::Pem;

const SECONDS_PER_DAY: f64 = 24.0 * 3600.0;
const PEM_LABEL_CERTIFICATE: &str = "CERTIFICATE";

/// Parses a byte slice into an IP address (IPv4 or IPv6)
fn parse_ip_addr(data: &[u8]) -> Result<IpAddr> {
    match data.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(data);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        },
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(data);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        },
        len => Err(Error::Invalid {
            category: "ip_parse".to_string(),
            message: format!("invalid ip address length: {len}"),
        }),
    }
}

/// Leaf certificate followed by the issuer chain, as issued.
///
/// A bundle is replaced as a whole on each issuance.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateBundle {
    pub cert: String,
    pub chain: String,
}

impl CertificateBundle {
    /// Both the leaf and the chain are required, a partial result is
    /// rejected.
    pub fn new(cert: &str, chain: &str) -> Result<Self> {
        if cert.trim().is_empty() || chain.trim().is_empty() {
            return Err(Error::Invalid {
                category: "bundle".to_string(),
                message: "certificate and chain are both required"
                    .to_string(),
            });
        }
        Ok(Self {
            cert: cert.trim().to_string(),
            chain: chain.trim().to_string(),
        })
    }
    /// Leaf and chain, newline separated.
    pub fn to_pem(&self) -> String {
        format!("{}\n{}\n", self.cert, self.chain)
    }
    /// Parses the leaf of the bundle.
    pub fn info(&self) -> Result<CertificateInfo> {
        parse_bundle(&self.to_pem())
    }
    /// Replaces the bundle file atomically, readers never see a partial file.
    pub fn save(&self, path: &Path) -> Result<()> {
        certkeeper_util::write_atomic(path, self.to_pem().as_bytes(), None)
            .map_err(|e| Error::Invalid {
                category: "save_bundle".to_string(),
                message: e.to_string(),
            })?;
        info!(
            target: LOG_TARGET,
            file = path.to_string_lossy().to_string(),
            "save certificate bundle"
        );
        Ok(())
    }
}

/// Attributes of the leaf certificate of a bundle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateInfo {
    /// Distinguished name of the subject
    pub subject: String,
    /// Distinguished name of the issuer
    pub issuer: String,
    /// DNS names and ip addresses of the subject alternative names, sorted
    pub domains: Vec<String>,
    /// Unix timestamp when the certificate becomes valid
    pub not_before: i64,
    /// Unix timestamp when the certificate expires
    pub not_after: i64,
    /// Number of certificates in the bundle, leaf included
    pub certificates: usize,
}

impl CertificateInfo {
    /// Extracts the Common Name (CN) from the certificate issuer field
    pub fn get_issuer_common_name(&self) -> String {
        static CN_REGEX: LazyLock<Option<regex::Regex>> = LazyLock::new(|| {
            regex::Regex::new(r"CN=(?P<CN>[\S ]+?)($|,)").ok()
        });
        let Some(regex) = CN_REGEX.as_ref() else {
            return "".to_string();
        };

        regex
            .captures(&self.issuer)
            .and_then(|caps| caps.name("CN"))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }
    /// Whether `now` lies within `[not_before, not_after]`.
    pub fn in_window(&self, now: i64) -> bool {
        self.not_before <= now && now <= self.not_after
    }
    /// Days until expiry, fractional and negative once expired.
    pub fn days_remaining(&self, now: i64) -> f64 {
        (self.not_after - now) as f64 / SECONDS_PER_DAY
    }
}

/// Parses the leaf certificate of a PEM bundle (leaf first, then chain).
pub fn parse_bundle(pem: &str) -> Result<CertificateInfo> {
    let mut blocks = vec![];
    for item in Pem::iter_from_buffer(pem.as_bytes()) {
        let block = item.map_err(|e| Error::X509 {
            category: "parse_pem".to_string(),
            message: e.to_string(),
        })?;
        if block.label == PEM_LABEL_CERTIFICATE {
            blocks.push(block);
        }
    }
    let Some(leaf) = blocks.first() else {
        return Err(Error::Invalid {
            category: "certificate".to_string(),
            message: "no certificate found".to_string(),
        });
    };
    // every certificate of the chain has to be well formed
    for block in blocks.iter().skip(1) {
        block.parse_x509().map_err(|e| Error::X509 {
            category: "parse_chain".to_string(),
            message: e.to_string(),
        })?;
    }

    let x509 = leaf.parse_x509().map_err(|e| Error::X509 {
        category: "parse_x509".to_string(),
        message: e.to_string(),
    })?;
    let mut dns_names = vec![];
    if let Ok(Some(subject_alternative_name)) = x509.subject_alternative_name()
    {
        for item in subject_alternative_name.value.general_names.iter() {
            match item {
                x509_parser::prelude::GeneralName::DNSName(name) => {
                    dns_names.push(name.to_string());
                },
                x509_parser::prelude::GeneralName::IPAddress(data) => {
                    if let Ok(addr) = parse_ip_addr(data) {
                        dns_names.push(addr.to_string());
                    }
                },
                _ => {},
            };
        }
    };
    dns_names.sort();
    let validity = x509.validity();

    Ok(CertificateInfo {
        subject: x509.subject().to_string(),
        issuer: x509.issuer().to_string(),
        domains: dns_names,
        not_before: validity.not_before.timestamp(),
        not_after: validity.not_after.timestamp(),
        certificates: blocks.len(),
    })
}

/// Reads and parses a bundle file.
pub fn load_bundle(path: &Path) -> Result<CertificateInfo> {
    let pem = std::fs::read_to_string(path).map_err(|e| Error::Io {
        source: e,
        file: path.to_string_lossy().to_string(),
    })?;
    parse_bundle(&pem)
}
