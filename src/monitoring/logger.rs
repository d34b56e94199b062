use serde::Serialize;
use tracing::info;

use crate::types::AppConfig;

#[derive(Serialize)]
struct StartupLog<'a> {
    event: &'a str,
    frontend: &'a str,
    backend: &'a str,
    num_of_workers: usize,
    brokers: Vec<&'a str>,
}

pub fn log_startup(cfg: &AppConfig) {
    let brokers = cfg.brokers.iter().map(|b| b.name.as_str()).collect();
    let payload = StartupLog {
        event: "startup",
        frontend: &cfg.messaging.frontend,
        backend: &cfg.messaging.backend,
        num_of_workers: cfg.messaging.num_of_workers,
        brokers,
    };
    info!(target: "oms", startup = serde_json::to_string(&payload).unwrap_or_default().as_str());
}
