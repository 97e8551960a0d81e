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

use snafu::Snafu;

mod account;
mod bundle;
mod key_material;
mod validity;

#[cfg(test)]
mod test_util;

pub static LOG_TARGET: &str = "certkeeper::certificate";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Key material error, file: {file}, {message}"))]
    KeyMaterial { file: String, message: String },
    #[snafu(display("Io error {source}, file: {file}"))]
    Io {
        source: std::io::Error,
        file: String,
    },
    #[snafu(display("X509 error, category: {category}, {message}"))]
    X509 { category: String, message: String },
    #[snafu(display("Invalid error, category: {category}, {message}"))]
    Invalid { category: String, message: String },
    #[snafu(display("Json error {source}, file: {file}"))]
    Json {
        source: serde_json::Error,
        file: String,
    },
    #[snafu(display("Parse {field} fail, {message}"))]
    ValidityParse { field: String, message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub use account::AccountRecord;
pub use bundle::{load_bundle, parse_bundle, CertificateBundle, CertificateInfo};
pub use key_material::{
    load_key, load_or_create_key, KeyAlgorithm, KeyKind, KeyMaterial,
};
pub use rcgen;
pub use validity::{
    evaluate, format_days, AccountInfo, BundlePaths, ChainInfo, KeyInfo,
    ValidityVerdict,
};

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_display() {
        let err = Error::ValidityParse {
            field: "chain".to_string(),
            message: "no certificate found".to_string(),
        };
        assert_eq!("Parse chain fail, no certificate found", err.to_string());

        let err = Error::KeyMaterial {
            file: "/tmp/account.key".to_string(),
            message: "decode account key fail".to_string(),
        };
        assert_eq!(
            "Key material error, file: /tmp/account.key, decode account key fail",
            err.to_string()
        );
    }
}
