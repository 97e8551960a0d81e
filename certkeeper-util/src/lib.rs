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

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use path_absolutize::*;
use sha2::{Digest, Sha256};
use snafu::Snafu;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use substring::Substring;

/// Error enum for various error types in the utility module
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid {message}"))]
    Invalid { message: String },
    #[snafu(display("Io error {source}, {file}"))]
    Io {
        source: std::io::Error,
        file: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Gets the package version.
pub fn get_pkg_version() -> &'static str {
    VERSION
}

/// Seconds since the unix epoch (UTC).
pub fn now_sec() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Resolves a path string to its absolute form.
/// If the path starts with '~', it will be expanded to the user's home directory.
/// Returns an empty string if the input path is empty.
///
/// # Arguments
/// * `path` - The path string to resolve
///
/// # Returns
/// The absolute path as a String
pub fn resolve_path(path: &str) -> String {
    if path.is_empty() {
        return "".to_string();
    }
    let mut p = path.to_string();
    if p.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            p = home.to_string_lossy().to_string() + p.substring(1, p.len());
        };
    }
    if let Ok(p) = Path::new(&p).absolutize() {
        p.to_string_lossy().to_string()
    } else {
        p
    }
}

/// Canonical form of a DNS name: trimmed, lowercase, no trailing dot.
pub fn normalize_domain(value: &str) -> String {
    value.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Splits PEM text into its blocks, each re-encoded as standalone PEM
/// with `\n` line endings.
///
/// # Returns
/// An error if the text holds no PEM block or a block is malformed.
pub fn split_pem(value: &str) -> Result<Vec<String>> {
    let pems = pem::parse_many(value.as_bytes()).map_err(|e| {
        Error::Invalid {
            message: e.to_string(),
        }
    })?;
    if pems.is_empty() {
        return Err(Error::Invalid {
            message: "pem data is empty".to_string(),
        });
    }
    Ok(pems
        .iter()
        .map(|item| {
            pem::encode_config(
                item,
                pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
            )
        })
        .collect())
}

/// Hex encoded SHA-256 digest of the data.
pub fn sha256_hex<T: AsRef<[u8]>>(data: T) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Unpadded base64url encoding of the data.
pub fn base64_url_encode<T: AsRef<[u8]>>(data: T) -> String {
    URL_SAFE_NO_PAD.encode(data.as_ref())
}

/// Unpadded base64url encoded SHA-256 digest of the data.
pub fn sha256_base64_url<T: AsRef<[u8]>>(data: T) -> String {
    base64_url_encode(Sha256::digest(data.as_ref()))
}

/// Replaces `file` with `data` without ever exposing a partially written file.
///
/// The content goes to a temporary file in the same directory which is then
/// renamed over the target, so readers see either the old or the new file.
/// `mode` sets the unix permission bits of the new file.
pub fn write_atomic(file: &Path, data: &[u8], mode: Option<u32>) -> Result<()> {
    let name = file.to_string_lossy().to_string();
    let dir = match file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| Error::Io {
        source: e,
        file: dir.to_string_lossy().to_string(),
    })?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(&dir).map_err(|e| Error::Io {
            source: e,
            file: name.clone(),
        })?;
    tmp.write_all(data)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::Io {
            source: e,
            file: name.clone(),
        })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = mode {
            std::fs::set_permissions(
                tmp.path(),
                std::fs::Permissions::from_mode(mode),
            )
            .map_err(|e| Error::Io {
                source: e,
                file: name.clone(),
            })?;
        }
    }
    #[cfg(not(unix))]
    let _ = mode;
    tmp.persist(file).map_err(|e| Error::Io {
        source: e.error,
        file: name,
    })?;
    Ok(())
}
