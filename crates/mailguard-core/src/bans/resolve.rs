//! Resolution of whitelist and blacklist entries

use async_trait::async_trait;
use ipnet::IpNet;
use mailguard_common::types::{host_network, parse_network};
use mailguard_common::{Error, Result};
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};
use trust_dns_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use trust_dns_resolver::system_conf::read_system_conf;
use trust_dns_resolver::TokioAsyncResolver;

/// Hostname lookup
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Addresses of `host`; failures yield an empty list
    async fn lookup(&self, host: &str) -> Vec<IpAddr>;
}

/// DNS resolver with a bounded lookup time
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl DnsResolver {
    /// Create a resolver from the system configuration
    pub fn new(timeout: Duration) -> Self {
        let (config, mut opts) = read_system_conf().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read system resolver config, using defaults");
            (ResolverConfig::default(), ResolverOpts::default())
        });
        opts.timeout = timeout;
        opts.attempts = 1;
        opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            timeout,
        }
    }

    /// A and AAAA records of `host`
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = tokio::time::timeout(self.timeout, self.resolver.lookup_ip(host))
            .await
            .map_err(|_| Error::Resolve(format!("{}: timed out after {:?}", host, self.timeout)))?
            .map_err(|e| Error::Resolve(format!("{}: {}", host, e)))?;
        Ok(lookup.iter().collect())
    }
}

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn lookup(&self, host: &str) -> Vec<IpAddr> {
        match self.resolve(host).await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(host = %host, error = %e, "DNS lookup failed");
                Vec::new()
            }
        }
    }
}

/// Resolve literal, CIDR and hostname entries into a set of networks
pub async fn resolve_entries<I, S>(resolver: &dyn AddressResolver, entries: I) -> HashSet<IpNet>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut networks = HashSet::new();

    for entry in entries {
        let entry = entry.as_ref().trim();
        if entry.is_empty() {
            continue;
        }
        if let Some(net) = parse_network(entry) {
            networks.insert(net);
            continue;
        }

        let addresses = resolver.lookup(entry).await;
        debug!(host = %entry, count = addresses.len(), "Resolved list entry");
        networks.extend(addresses.into_iter().map(host_network));
    }

    networks
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct StaticResolver {
        answers: HashMap<&'static str, Vec<IpAddr>>,
    }

    #[async_trait]
    impl AddressResolver for StaticResolver {
        async fn lookup(&self, host: &str) -> Vec<IpAddr> {
            self.answers.get(host).cloned().unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn test_resolve_entries() {
        let resolver = StaticResolver {
            answers: HashMap::from([(
                "mx.example.org",
                vec!["192.0.2.25".parse().unwrap(), "2001:db8::25".parse().unwrap()],
            )]),
        };

        let resolved = resolve_entries(
            &resolver,
            ["198.51.100.7/24", "203.0.113.7", "mx.example.org", "unknown.example.org", ""],
        )
        .await;

        let mut resolved: Vec<String> = resolved.iter().map(ToString::to_string).collect();
        resolved.sort();
        assert_eq!(
            resolved,
            vec![
                "192.0.2.25/32",
                "198.51.100.0/24",
                "2001:db8::25/128",
                "203.0.113.7/32",
            ]
        );
    }

    #[tokio::test]
    async fn test_resolve_entries_empty() {
        let resolver = StaticResolver { answers: HashMap::new() };
        let entries: Vec<String> = Vec::new();
        assert!(resolve_entries(&resolver, entries).await.is_empty());
    }

    #[tokio::test]
    async fn test_dns_resolver_failure_is_empty() {
        let resolver = DnsResolver::new(Duration::ZERO);
        let err = resolver.resolve("mailguard.invalid").await.unwrap_err();
        assert_eq!(err.code(), "RESOLVE_ERROR");
        assert!(resolver.lookup("mailguard.invalid").await.is_empty());
    }
}
