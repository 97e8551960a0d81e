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

use certkeeper_acme::{CertificateLifecycle, LetsEncryptAuthority};
use certkeeper_certificate::format_days;
use certkeeper_config::{load_config, AcmeConf};
use clap::{Parser, Subcommand};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Keeps the TLS certificate of a server valid with ACME http-01.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The toml config file
    #[arg(short, long, default_value = "~/.certkeeper/certkeeper.toml")]
    conf: String,
    /// Log file path, overrides the config
    #[arg(long)]
    log: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq)]
enum Command {
    /// Make sure a valid certificate exists, renew it if needed
    Get,
    /// Print the state of the stored certificate, exit 1 if it should be renewed
    Check,
    /// Keep the certificate valid until the process is stopped
    Monitor,
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            },
            Err(e) => {
                error!(error = %e, "listen terminate signal fail");
                let _ = tokio::signal::ctrl_c().await;
            },
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run(args: Args, conf: AcmeConf) -> Result<bool, Box<dyn Error>> {
    let conf = Arc::new(conf);
    let authority = LetsEncryptAuthority::new(&conf.get_directory_url())?;
    let lifecycle = Arc::new(CertificateLifecycle::new(
        conf.clone(),
        Arc::new(authority),
    ));
    match args.command {
        Command::Get => {
            let paths = lifecycle.get_certificate().await?;
            let verdict = lifecycle.evaluate().await;
            println!("key: {}", paths.key_path.to_string_lossy());
            println!("chain: {}", paths.chain_path.to_string_lossy());
            if let Some(days) = verdict.days_remaining {
                println!("days remaining: {}", format_days(days));
            }
            Ok(true)
        },
        Command::Check => {
            let verdict = lifecycle.evaluate().await;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            Ok(lifecycle.check_certificate().await)
        },
        Command::Monitor => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let monitor = tokio::spawn(lifecycle.monitor(shutdown_rx));
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown_tx.send_replace(true);
            monitor.await?;
            Ok(true)
        },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let conf = load_config(&args.conf).await?;

    let guard = certkeeper_logger::logger_try_init(
        certkeeper_logger::LoggerParams {
            file: args
                .log
                .clone()
                .or_else(|| conf.log_file.clone())
                .unwrap_or_default(),
            level: conf.get_log_level(),
            json: conf.log_json.unwrap_or_default(),
            ..Default::default()
        },
    )?;
    info!(
        app = conf.get_app(),
        domains = conf.domains.join(","),
        directory_url = conf.get_directory_url(),
        command = ?args.command,
        "certkeeper start"
    );

    let ok = match run(args, conf).await {
        Ok(ok) => ok,
        Err(e) => {
            error!(error = %e, "certkeeper fail");
            drop(guard);
            return Err(e);
        },
    };
    drop(guard);
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
