//! Mirror probing: latency scoring and IP-family reachability.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use crate::config::MirrorsAutoConfig;
use crate::storage::MetadataDb;

/// Builds the HTTP client used for probes, optionally bound to a local
/// address so probes go out over a specific IP family.
pub(crate) fn probe_client(
    timeout: Duration,
    local_address: Option<IpAddr>,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("cpcache/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .connect_timeout(timeout);
    if let Some(address) = local_address {
        builder = builder.local_address(address);
    }
    builder.build()
}

/// Scores each candidate by HEAD-probe latency, drops mirrors above
/// `max_score` (or violating the https requirement), and returns the
/// survivors best first.
pub(crate) async fn rank_mirrors(
    client: &reqwest::Client,
    candidates: &[String],
    options: &MirrorsAutoConfig,
) -> Vec<(String, f64)> {
    let mut scored = Vec::new();

    for mirror in candidates {
        if options.https_required && !mirror.starts_with("https://") {
            tracing::debug!(%mirror, "skipped: https required");
            continue;
        }
        match probe_latency(client, mirror).await {
            Some(score) if score <= options.max_score => {
                tracing::debug!(%mirror, score, "mirror scored");
                scored.push((mirror.clone(), score));
            }
            Some(score) => {
                tracing::debug!(%mirror, score, max_score = options.max_score, "mirror too slow");
            }
            None => tracing::debug!(%mirror, "mirror unreachable"),
        }
    }

    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

async fn probe_latency(client: &reqwest::Client, url: &str) -> Option<f64> {
    let started = Instant::now();
    match client.head(url).send().await {
        Ok(response)
            if response.status().is_success() || response.status().is_redirection() =>
        {
            Some(started.elapsed().as_secs_f64())
        }
        _ => None,
    }
}

/// Probes reachability of each configured IP family and records the
/// outcome. A family the operator enabled but that cannot reach any
/// mirror is worth a warning: downloads will silently prefer the other
/// family.
pub(crate) async fn update_ip_support(
    db: &MetadataDb,
    candidates: &[String],
    options: &MirrorsAutoConfig,
) {
    let families: [(&str, bool, IpAddr); 2] = [
        ("ipv4", options.ipv4, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        ("ipv6", options.ipv6, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
    ];

    for (family, enabled, bind_address) in families {
        if !enabled {
            continue;
        }
        let supported =
            probe_family(candidates, bind_address, options.probe_timeout()).await;
        if !supported {
            tracing::warn!(family, "configured IP family could not reach any mirror");
        }
        if let Err(error) = db.record_ip_support(family, supported).await {
            tracing::warn!(family, %error, "failed to record IP support probe");
        }
    }
}

async fn probe_family(candidates: &[String], bind_address: IpAddr, timeout: Duration) -> bool {
    let Ok(client) = probe_client(timeout, Some(bind_address)) else {
        return false;
    };
    for mirror in candidates {
        if probe_latency(&client, mirror).await.is_some() {
            return true;
        }
    }
    false
}
