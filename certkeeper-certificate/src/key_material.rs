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
use rcgen::{
    KeyPair, RsaKeySize, SignatureAlgorithm, PKCS_ECDSA_P256_SHA256,
    PKCS_ECDSA_P384_SHA384, PKCS_ED25519, PKCS_RSA_SHA256,
};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::info;

const KEY_FILE_MODE: u32 = 0o600;

/// Role of a key, which decides the algorithm of a newly generated key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Signs the requests to the authority, EC P-256
    Account,
    /// Key of the issued certificate, RSA 2048
    Server,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Account => write!(f, "account"),
            KeyKind::Server => write!(f, "server"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyAlgorithm {
    EcdsaP256,
    EcdsaP384,
    Ed25519,
    Rsa,
}

impl KeyAlgorithm {
    fn from_signature(alg: &SignatureAlgorithm) -> Option<Self> {
        if alg == &PKCS_ECDSA_P256_SHA256 {
            Some(KeyAlgorithm::EcdsaP256)
        } else if alg == &PKCS_ECDSA_P384_SHA384 {
            Some(KeyAlgorithm::EcdsaP384)
        } else if alg == &PKCS_ED25519 {
            Some(KeyAlgorithm::Ed25519)
        } else if alg == &PKCS_RSA_SHA256 {
            Some(KeyAlgorithm::Rsa)
        } else {
            None
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyAlgorithm::EcdsaP256 => "ECDSA P-256",
            KeyAlgorithm::EcdsaP384 => "ECDSA P-384",
            KeyAlgorithm::Ed25519 => "Ed25519",
            KeyAlgorithm::Rsa => "RSA",
        };
        write!(f, "{name}")
    }
}

/// An asymmetric key pair with its PEM encoded form.
///
/// Created once and then loaded for the rest of the process lifetime,
/// nothing mutates it.
#[derive(Clone)]
pub struct KeyMaterial {
    kind: KeyKind,
    algorithm: KeyAlgorithm,
    pem: String,
    public_key_der: Vec<u8>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("kind", &self.kind)
            .field("algorithm", &self.algorithm)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.pem == other.pem
    }
}

impl KeyMaterial {
    /// Generates a new key of the algorithm family of `kind`.
    pub fn generate(kind: KeyKind) -> Result<Self> {
        let key_pair = match kind {
            KeyKind::Account => KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256),
            KeyKind::Server => {
                KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048)
            },
        }
        .map_err(|e| Error::KeyMaterial {
            file: String::new(),
            message: format!("generate {kind} key fail, {e}"),
        })?;
        Self::from_key_pair(kind, &key_pair)
    }
    /// Decodes PEM (PKCS#8) text.
    pub fn from_pem(kind: KeyKind, pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(pem).map_err(|e| Error::KeyMaterial {
            file: String::new(),
            message: format!("decode {kind} key fail, {e}"),
        })?;
        Self::from_key_pair(kind, &key_pair)
    }
    fn from_key_pair(kind: KeyKind, key_pair: &KeyPair) -> Result<Self> {
        let algorithm = KeyAlgorithm::from_signature(key_pair.algorithm())
            .ok_or_else(|| Error::KeyMaterial {
                file: String::new(),
                message: format!("{kind} key algorithm is not supported"),
            })?;
        Ok(Self {
            kind,
            algorithm,
            pem: key_pair.serialize_pem(),
            public_key_der: key_pair.public_key_der(),
        })
    }
    pub fn kind(&self) -> KeyKind {
        self.kind
    }
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }
    pub fn pem(&self) -> &str {
        &self.pem
    }
    /// Re-imports the key for signing.
    pub fn key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.pem).map_err(|e| Error::KeyMaterial {
            file: String::new(),
            message: e.to_string(),
        })
    }
    /// SHA-256 of the DER encoded public key, hex encoded.
    pub fn fingerprint(&self) -> String {
        certkeeper_util::sha256_hex(&self.public_key_der)
    }
    /// PKCS#8 DER encoding of the private key.
    pub fn pkcs8_der(&self) -> Result<Vec<u8>> {
        Ok(self.key_pair()?.serialize_der())
    }
    /// RFC 7638 thumbprint of the public key as the authority computes it
    /// for the account JWK. Only EC P-256 keys can sign account requests.
    pub fn jwk_thumbprint(&self) -> Result<String> {
        if self.algorithm != KeyAlgorithm::EcdsaP256 {
            return Err(Error::KeyMaterial {
                file: String::new(),
                message: format!(
                    "{} key cannot be an account key",
                    self.algorithm
                ),
            });
        }
        let point = self.key_pair()?.public_key_raw().to_vec();
        // uncompressed point: 0x04 || x || y
        if point.len() != 65 || point[0] != 0x04 {
            return Err(Error::KeyMaterial {
                file: String::new(),
                message: "invalid P-256 public key".to_string(),
            });
        }
        let jwk = format!(
            r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
            certkeeper_util::base64_url_encode(&point[1..33]),
            certkeeper_util::base64_url_encode(&point[33..]),
        );
        Ok(certkeeper_util::sha256_base64_url(jwk))
    }
}

fn with_file(err: Error, file: &Path) -> Error {
    match err {
        Error::KeyMaterial { message, .. } => Error::KeyMaterial {
            file: file.to_string_lossy().to_string(),
            message,
        },
        err => err,
    }
}

/// Reads and decodes the key stored at `path`.
pub fn load_key(kind: KeyKind, path: &Path) -> Result<KeyMaterial> {
    let pem = std::fs::read_to_string(path).map_err(|e| Error::Io {
        source: e,
        file: path.to_string_lossy().to_string(),
    })?;
    KeyMaterial::from_pem(kind, &pem).map_err(|e| with_file(e, path))
}

/// Loads the key at `path`, or generates and persists a new one when the
/// file does not exist.
///
/// An existing file is always loaded and never regenerated, a file that
/// cannot be decoded is an error.
pub fn load_or_create_key(kind: KeyKind, path: &Path) -> Result<KeyMaterial> {
    if path.exists() {
        let key = load_key(kind, path)?;
        info!(
            target: LOG_TARGET,
            kind = kind.to_string(),
            algorithm = key.algorithm().to_string(),
            file = path.to_string_lossy().to_string(),
            "load key"
        );
        return Ok(key);
    }
    let key = KeyMaterial::generate(kind).map_err(|e| with_file(e, path))?;
    certkeeper_util::write_atomic(
        path,
        key.pem().as_bytes(),
        Some(KEY_FILE_MODE),
    )
    .map_err(|e| Error::KeyMaterial {
        file: path.to_string_lossy().to_string(),
        message: e.to_string(),
    })?;
    info!(
        target: LOG_TARGET,
        kind = kind.to_string(),
        algorithm = key.algorithm().to_string(),
        file = path.to_string_lossy().to_string(),
        "generate key"
    );
    Ok(key)
}
