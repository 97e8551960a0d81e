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
    AccountRegistrar, AcmeAuthority, CertificateIssuer, Error, Result,
    LOG_TARGET,
};
use async_trait::async_trait;
use certkeeper_certificate::{
    evaluate, format_days, load_or_create_key, BundlePaths, KeyKind,
    KeyMaterial, ValidityVerdict,
};
use certkeeper_config::AcmeConf;
use certkeeper_core::{BackgroundTask, BackgroundTaskService, ShutdownWatch};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Files a TLS server loads.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificatePaths {
    pub key_path: PathBuf,
    pub chain_path: PathBuf,
}

/// Result of one lifecycle cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The stored certificate is fine, nothing was done
    Valid { days_remaining: f64 },
    /// A new certificate was issued
    Renewed { days_remaining: Option<f64> },
}

/// Keeps the certificate of the configured domains valid: evaluates the
/// stored bundle and renews it when it is broken, expiring or issued for
/// other names.
pub struct CertificateLifecycle {
    conf: Arc<AcmeConf>,
    registrar: AccountRegistrar,
    issuer: CertificateIssuer,
    cycle: Mutex<()>,
    summarized: AtomicBool,
}

impl CertificateLifecycle {
    pub fn new(conf: Arc<AcmeConf>, authority: Arc<dyn AcmeAuthority>) -> Self {
        Self {
            registrar: AccountRegistrar::new(
                authority.clone(),
                &conf.get_directory_url(),
            ),
            issuer: CertificateIssuer::new(conf.clone(), authority),
            conf,
            cycle: Mutex::new(()),
            summarized: AtomicBool::new(false),
        }
    }
    pub fn bundle_paths(&self) -> BundlePaths {
        BundlePaths {
            account_path: self.conf.get_account_path(),
            account_key_path: self.conf.get_account_key_path(),
            server_key_path: self.conf.get_server_key_path(),
            bundle_path: self.conf.get_bundle_path(),
        }
    }
    pub fn certificate_paths(&self) -> CertificatePaths {
        CertificatePaths {
            key_path: self.conf.get_server_key_path(),
            chain_path: self.conf.get_bundle_path(),
        }
    }
    /// Evaluates the stored files now.
    ///
    /// The files are read and parsed on the blocking pool so a monitor
    /// sharing the runtime with a server does not stall it.
    pub async fn evaluate(&self) -> ValidityVerdict {
        let paths = self.bundle_paths();
        let fallback = paths.clone();
        match tokio::task::spawn_blocking(move || {
            evaluate(&paths, certkeeper_util::now_sec())
        })
        .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(
                    target: LOG_TARGET,
                    error = %e,
                    "evaluate task failed, evaluate inline"
                );
                evaluate(&fallback, certkeeper_util::now_sec())
            },
        }
    }
    fn is_ok(&self, verdict: &ValidityVerdict) -> bool {
        verdict.is_ok(self.conf.get_renew_days())
            && verdict.matches_domains(&self.conf.get_domains())
    }
    /// Whether the stored certificate can be used as is.
    pub async fn check_certificate(&self) -> bool {
        let verdict = self.evaluate().await;
        let ok = self.is_ok(&verdict);
        if !ok {
            self.warn_renewal(&verdict, false);
        }
        ok
    }
    fn warn_renewal(&self, verdict: &ValidityVerdict, renewing: bool) {
        let errors = verdict
            .errors()
            .iter()
            .map(|(field, reason)| format!("{field}: {reason}"))
            .collect::<Vec<_>>();
        warn!(
            target: LOG_TARGET,
            domains = self.conf.domains.join(","),
            days_remaining = verdict
                .days_remaining
                .map(format_days)
                .unwrap_or_default(),
            renew_days = self.conf.get_renew_days(),
            domains_match = verdict.matches_domains(&self.conf.get_domains()),
            errors = errors.join("; "),
            renewing,
            "certificate is not valid"
        );
    }
    /// Logs the full summary once per process and after every renewal.
    fn report(&self, verdict: &ValidityVerdict, renewed: bool) {
        if !verdict.is_error_free() {
            return;
        }
        let first = !self.summarized.swap(true, Ordering::AcqRel);
        if !first && !renewed {
            return;
        }
        info!(
            target: LOG_TARGET,
            app = self.conf.get_app(),
            maintainer = self.conf.maintainer_email.clone().unwrap_or_default(),
            renewed,
            "certificate summary\n{}",
            verdict.summary()
        );
        if first {
            let days = verdict
                .days_remaining
                .map(format_days)
                .unwrap_or_default();
            warn!(
                target: LOG_TARGET,
                days_remaining = days,
                renewing = false,
                "certificate expires in {days} days"
            );
        }
    }
    async fn load_key(
        &self,
        kind: KeyKind,
        file: PathBuf,
    ) -> Result<KeyMaterial> {
        let key =
            tokio::task::spawn_blocking(move || load_or_create_key(kind, &file))
                .await
            .map_err(|e| Error::Fail {
                category: "load_key".to_string(),
                message: e.to_string(),
            })??;
        Ok(key)
    }
    async fn renew(&self) -> Result<()> {
        let account_key = self
            .load_key(KeyKind::Account, self.conf.get_account_key_path())
            .await?;
        let server_key = self
            .load_key(KeyKind::Server, self.conf.get_server_key_path())
            .await?;
        let account_path = self.conf.get_account_path();
        let account = self
            .registrar
            .load_or_create(&account_path, &account_key, &self.conf.contacts())
            .await?;
        if account.key_fingerprint != account_key.fingerprint() {
            return Err(Error::Registration {
                message: format!(
                    "{} is bound to another account key, remove it to register again",
                    account_path.to_string_lossy()
                ),
            });
        }
        self.issuer
            .issue(&self.conf.get_domains(), &account, &account_key, &server_key)
            .await?;
        Ok(())
    }
    /// One pass: evaluate, renew if needed, report.
    ///
    /// Cycles never overlap, a caller waits for the running one and then
    /// evaluates the files it left behind.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let _cycle = self.cycle.lock().await;
        let verdict = self.evaluate().await;
        if self.is_ok(&verdict) {
            self.report(&verdict, false);
            return Ok(CycleOutcome::Valid {
                days_remaining: verdict.days_remaining.unwrap_or_default(),
            });
        }
        self.warn_renewal(&verdict, true);
        self.renew().await?;

        let verdict = self.evaluate().await;
        self.report(&verdict, true);
        Ok(CycleOutcome::Renewed {
            days_remaining: verdict.days_remaining,
        })
    }
    /// Makes sure a valid certificate exists and returns its files.
    pub async fn get_certificate(&self) -> Result<CertificatePaths> {
        self.run_cycle().await?;
        Ok(self.certificate_paths())
    }
    /// Runs a cycle now and then every monitor interval until `shutdown`
    /// fires. A failed cycle is logged and retried at the next interval.
    pub async fn monitor(self: Arc<Self>, shutdown: ShutdownWatch) {
        let interval = self.conf.get_monitor_interval();
        let mut service = BackgroundTaskService::new(
            "certificate_lifecycle",
            interval,
            "lifecycle",
            Box::new(LifecycleTask { lifecycle: self }),
        );
        service.set_immediately(true);
        service.run(shutdown).await;
    }
}

struct LifecycleTask {
    lifecycle: Arc<CertificateLifecycle>,
}

#[async_trait]
impl BackgroundTask for LifecycleTask {
    async fn execute(&self, _count: u32) -> Result<bool, certkeeper_core::Error> {
        match self.lifecycle.run_cycle().await {
            Ok(CycleOutcome::Valid { .. }) => Ok(false),
            Ok(CycleOutcome::Renewed { .. }) => Ok(true),
            Err(e) => {
                error!(
                    target: LOG_TARGET,
                    error = %e,
                    domains = self.lifecycle.conf.domains.join(","),
                    "certificate renewal failed, will retry later"
                );
                Err(certkeeper_core::Error::Task {
                    category: "lifecycle".to_string(),
                    message: e.to_string(),
                })
            },
        }
    }
}
