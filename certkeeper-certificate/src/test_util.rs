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

use crate::CertificateBundle;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa,
    KeyPair,
};
use time::OffsetDateTime;

/// Issues a leaf for `domains` from a throwaway CA, the CA is the chain.
pub fn new_test_bundle(
    domains: &[&str],
    not_before: i64,
    not_after: i64,
) -> CertificateBundle {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    let mut ca_name = DistinguishedName::new();
    ca_name.push(DnType::OrganizationName, "certkeeper test");
    ca_name.push(DnType::CommonName, "certkeeper test CA");
    ca_params.distinguished_name = ca_name;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(
        domains.iter().map(|item| item.to_string()).collect::<Vec<_>>(),
    )
    .unwrap();
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, domains[0]);
    params.distinguished_name = name;
    params.not_before = OffsetDateTime::from_unix_timestamp(not_before).unwrap();
    params.not_after = OffsetDateTime::from_unix_timestamp(not_after).unwrap();
    let leaf = params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

    CertificateBundle::new(&leaf.pem(), &ca.pem()).unwrap()
}
