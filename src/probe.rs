//! Liveness checks for remote services and local executables.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    Http { url: String },
    Executable { name: String },
}

impl ProbeTarget {
    pub fn http(url: impl Into<String>) -> Self {
        ProbeTarget::Http { url: url.into() }
    }

    pub fn executable(name: impl Into<String>) -> Self {
        ProbeTarget::Executable { name: name.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
}

impl Liveness {
    pub fn is_alive(self) -> bool {
        self == Liveness::Alive
    }
}

/// Never errors: a dead service is an ordinary answer.
pub async fn probe(client: &reqwest::Client, target: &ProbeTarget, timeout: Duration) -> Liveness {
    match target {
        ProbeTarget::Http { url } => {
            let alive = match client.get(url).timeout(timeout).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    debug!("probe {} failed: {}", url, e);
                    false
                }
            };
            if alive { Liveness::Alive } else { Liveness::Dead }
        }
        ProbeTarget::Executable { name } => {
            if which::which(name).is_ok() {
                Liveness::Alive
            } else {
                Liveness::Dead
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceStatus {
    pub name: String,
    pub url: Option<String>,
    pub status: String,
}

impl ServiceStatus {
    fn new(name: &str, url: Option<String>, liveness: Liveness) -> Self {
        Self {
            name: name.to_string(),
            url,
            status: if liveness.is_alive() { "online" } else { "offline" }.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub services: Vec<ServiceStatus>,
    pub all_online: bool,
}

/// Probes the story model, the diffusion server and the encoder.
pub async fn service_status(
    client: &reqwest::Client,
    ollama_url: Option<&str>,
    a1111_host: &str,
    timeout: Duration,
) -> StatusReport {
    let mut services = Vec::with_capacity(3);

    let ollama = match ollama_url {
        Some(url) => {
            let target = ProbeTarget::http(format!("{}/api/version", url.trim_end_matches('/')));
            ServiceStatus::new("Ollama", Some(url.to_string()), probe(client, &target, timeout).await)
        }
        None => ServiceStatus::new(
            "Ollama",
            None,
            probe(client, &ProbeTarget::executable("ollama"), timeout).await,
        ),
    };
    services.push(ollama);

    let target = ProbeTarget::http(format!("{}/sdapi/v1/version", a1111_host.trim_end_matches('/')));
    services.push(ServiceStatus::new(
        "A1111",
        Some(a1111_host.to_string()),
        probe(client, &target, timeout).await,
    ));

    services.push(ServiceStatus::new(
        "FFmpeg",
        None,
        probe(client, &ProbeTarget::executable("ffmpeg"), timeout).await,
    ));

    let all_online = services.iter().all(|s| s.status == "online");
    StatusReport {
        services,
        all_online,
    }
}
