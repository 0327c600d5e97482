use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, warn};

const SEED_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve DNS seeds into candidate IPs.
///
/// Entries that already are IP literals are taken as-is.
pub async fn resolve_seeds(seeds: Vec<String>, port: u16) -> Vec<IpAddr> {
    info!("Starting DNS discovery for {} seeds", seeds.len());
    let mut discovered = Vec::new();

    for seed in seeds {
        if let Ok(ip) = seed.parse::<IpAddr>() {
            discovered.push(ip);
            continue;
        }

        match tokio::time::timeout(SEED_LOOKUP_TIMEOUT, resolve_dns_seed(seed.clone(), port)).await
        {
            Ok(Ok(addrs)) => {
                debug!("Resolved {} addresses from {}", addrs.len(), seed);
                discovered.extend(addrs.into_iter().map(|a| a.ip()));
            }
            Ok(Err(e)) => warn!("Failed to resolve DNS seed {}: {:#}", seed, e),
            Err(_) => warn!("Timeout resolving DNS seed {}", seed),
        }
    }

    discovered.sort();
    discovered.dedup();
    info!("Discovered {} peers via DNS", discovered.len());
    discovered
}

async fn resolve_dns_seed(seed: String, port: u16) -> Result<Vec<SocketAddr>> {
    let lookup = if seed.contains(':') {
        seed
    } else {
        format!("{}:{}", seed, port)
    };

    tokio::task::spawn_blocking(move || {
        lookup
            .to_socket_addrs()
            .map(|addrs| addrs.collect::<Vec<_>>())
            .with_context(|| format!("DNS lookup failed for {}", lookup))
    })
    .await
    .context("DNS lookup task failed")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ip_literals_skip_dns() {
        let ips = resolve_seeds(
            vec!["127.0.0.2".to_string(), "127.0.0.1".to_string(), "127.0.0.2".to_string()],
            18444,
        )
        .await;
        assert_eq!(
            ips,
            vec![
                "127.0.0.1".parse::<IpAddr>().unwrap(),
                "127.0.0.2".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_localhost_resolves() {
        let ips = resolve_seeds(vec!["localhost".to_string()], 18444).await;
        assert!(ips.iter().all(|ip| ip.is_loopback()));
    }
}
