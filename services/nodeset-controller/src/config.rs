use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::api::ObjectKey;

/// One slurmrestd endpoint, keyed by the controller it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlurmCluster {
    pub controller: ObjectKey,
    pub url: String,
    pub token_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub log_level: String,
    pub resync_interval: Duration,
    pub poll_interval: Duration,
    pub expectations_ttl: Duration,
    pub backoff_gc_interval: Duration,
    pub kube_api_url: String,
    pub kube_token_file: Option<PathBuf>,
    pub kube_ca_file: Option<PathBuf>,
    /// Empty watches all namespaces.
    pub namespace: String,
    pub slurm_clusters: Vec<SlurmCluster>,
}

fn env_secs(name: &str, default: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => Ok(Duration::from_secs(
            v.parse().with_context(|| format!("{name} must be seconds"))?,
        )),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let workers = std::env::var("NODESET_WORKERS")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .context("NODESET_WORKERS must be a number")?;

        let log_level = std::env::var("NODESET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let kube_api_url = std::env::var("KUBE_API_URL")
            .unwrap_or_else(|_| "https://kubernetes.default.svc".to_string());

        let slurm_clusters = match std::env::var("SLURM_CLUSTERS") {
            Ok(v) => parse_clusters(&v)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            workers,
            log_level,
            resync_interval: env_secs("NODESET_RESYNC_SECS", 30)?,
            poll_interval: env_secs("NODESET_POLL_SECS", 2)?,
            expectations_ttl: env_secs("NODESET_EXPECTATIONS_TTL_SECS", 300)?,
            backoff_gc_interval: env_secs("NODESET_BACKOFF_GC_SECS", 60)?,
            kube_api_url,
            kube_token_file: std::env::var("KUBE_TOKEN_FILE").ok().map(PathBuf::from),
            kube_ca_file: std::env::var("KUBE_CA_FILE").ok().map(PathBuf::from),
            namespace: std::env::var("NODESET_NAMESPACE").unwrap_or_default(),
            slurm_clusters,
        })
    }
}

/// Parse `ns/controller=url|tokenfile,...`. The token file is optional.
pub fn parse_clusters(raw: &str) -> Result<Vec<SlurmCluster>> {
    let mut clusters = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((controller, target)) = entry.split_once('=') else {
            bail!("slurm cluster entry {entry:?} is missing '='");
        };
        let Some((namespace, name)) = controller.trim().split_once('/') else {
            bail!("slurm cluster {controller:?} must be namespace/name");
        };
        let (url, token_file) = match target.split_once('|') {
            Some((url, file)) => (url, Some(PathBuf::from(file.trim()))),
            None => (target, None),
        };
        let url = url.trim();
        if url.is_empty() {
            bail!("slurm cluster {controller:?} has no URL");
        }
        clusters.push(SlurmCluster {
            controller: ObjectKey::new(namespace, name),
            url: url.to_string(),
            token_file,
        });
    }
    Ok(clusters)
}
