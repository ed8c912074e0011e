// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::process::ExitCode;
use std::sync::Arc;

use dmtpd::config::Config;
use dmtpd::listener::{Listener, ShutdownMode};
use dmtpd::store::memstore::{MemAccountStore, MemDeviceStore, MemEventStore, MemTemplateStore};
use tokio_util::sync::CancellationToken;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let Some(config_path) = std::env::args().nth(1) else {
        eprintln!("usage: dmtpd <config-file>");
        return ExitCode::FAILURE;
    };

    let config = match Config::from_path(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let account_store = Arc::new(MemAccountStore::new());
    let device_store = Arc::new(MemDeviceStore::new());
    let event_store = Arc::new(MemEventStore::new(None));
    let template_store = Arc::new(MemTemplateStore::new());

    let listener = Listener::new(config, account_store, device_store, event_store, template_store);
    let cancel = CancellationToken::new();
    let shutdown_signal = cancel.clone();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.cancel();
    });

    match listener.serve(cancel, ShutdownMode::Drain).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "listener exited with an error");
            ExitCode::FAILURE
        }
    }
}
