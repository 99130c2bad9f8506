//! Ban coordination across both address families

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use mailguard_common::config::{Config, IsolationConfig};
use mailguard_common::types::{bannable_ip, host_network, parse_network};
use mailguard_common::{Family, Result};
use mailguard_storage::{KeyValueStore, ACTIVE_BANS, BLACKLIST, PERM_BANS, QUEUE_UNBAN, WHITELIST};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::ledger::{AttemptOutcome, BanLedger, BanRecord};
use super::resolve::{resolve_entries, AddressResolver};
use crate::netfilter::{ChainTracker, NftBackend, NftClient, SnatOutcome};

/// Result of handling one offending address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanOutcome {
    /// Not a bannable address
    Ignored,
    /// Suppressed by a whitelist entry
    Whitelisted { rule: IpNet },
    /// Failure recorded, below the threshold
    Counted { network: IpNet, remaining: u32 },
    /// The network is banned already
    AlreadyBanned { network: IpNet },
    /// A drop rule was installed
    Banned { network: IpNet, duration: chrono::Duration },
}

/// Chain trackers of both families
pub struct Firewall {
    ipv4: ChainTracker,
    ipv6: ChainTracker,
}

impl Firewall {
    pub fn new(ipv4: ChainTracker, ipv6: ChainTracker) -> Self {
        Self { ipv4, ipv6 }
    }

    pub fn tracker(&self, family: Family) -> &ChainTracker {
        match family {
            Family::Ip => &self.ipv4,
            Family::Ip6 => &self.ipv6,
        }
    }

    fn trackers(&self) -> [&ChainTracker; 2] {
        [&self.ipv4, &self.ipv6]
    }

    fn trackers_mut(&mut self) -> [&mut ChainTracker; 2] {
        [&mut self.ipv4, &mut self.ipv6]
    }
}

/// Owner of the ban ledger and the kernel firewall state.
///
/// The ledger and the firewall sit behind separate locks that are always
/// taken in that order.
pub struct BanCoordinator {
    manage_external: bool,
    store: Arc<dyn KeyValueStore>,
    resolver: Arc<dyn AddressResolver>,
    ledger: Mutex<BanLedger>,
    firewall: Mutex<Firewall>,
}

impl BanCoordinator {
    pub fn new(
        config: &Config,
        backend: Arc<dyn NftBackend>,
        store: Arc<dyn KeyValueStore>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        let netfilter = &config.netfilter;
        let tracker = |family| {
            ChainTracker::new(
                netfilter.chain_name.clone(),
                netfilter.chain_comment.clone(),
                NftClient::new(family, backend.clone()),
            )
        };

        Self {
            manage_external: netfilter.manage_external,
            store,
            resolver,
            ledger: Mutex::new(BanLedger::new(config.bans.clone())),
            firewall: Mutex::new(Firewall::new(tracker(Family::Ip), tracker(Family::Ip6))),
        }
    }

    /// Whether this process mutates the kernel ruleset
    pub fn manages_firewall(&self) -> bool {
        !self.manage_external
    }

    /// Discover the base chains of both families
    pub async fn discover(&self) -> Result<()> {
        let mut firewall = self.firewall.lock().await;
        for tracker in firewall.trackers_mut() {
            tracker.discover().await?;
        }
        Ok(())
    }

    /// Create the managed chains and jumps, then install the isolation rule
    pub async fn provision(&self, isolation: &IsolationConfig) -> Result<()> {
        if self.manage_external {
            info!("Firewall is managed externally, skipping provisioning");
            return Ok(());
        }

        let firewall = self.firewall.lock().await;
        for tracker in firewall.trackers() {
            tracker.ensure_managed_chain_and_jumps().await?;
        }
        if isolation.enabled {
            firewall
                .tracker(Family::Ip)
                .install_isolation_rule(&isolation.interface, &isolation.ports)
                .await?;
        }
        Ok(())
    }

    /// Record a failure of `address` and ban its network past the threshold
    pub async fn ban(&self, address: &str) -> Result<BanOutcome> {
        self.ban_at(address, Utc::now()).await
    }

    pub(crate) async fn ban_at(&self, address: &str, now: DateTime<Utc>) -> Result<BanOutcome> {
        let Some(ip) = bannable_ip(address) else {
            debug!(address = %address, "Ignoring non-bannable address");
            return Ok(BanOutcome::Ignored);
        };

        let mut ledger = self.ledger.lock().await;

        if let Some(rule) = ledger.whitelisted_by(&host_network(ip)) {
            info!(address = %ip, rule = %rule, "Address is whitelisted");
            return Ok(BanOutcome::Whitelisted { rule });
        }

        let network = ledger.widen(ip)?;
        match ledger.record_attempt(network, now) {
            AttemptOutcome::Counting { remaining, .. } => {
                warn!(
                    network = %network,
                    remaining,
                    window_secs = ledger.config().retry_window,
                    "{} more attempts in the next {} seconds until {} is banned",
                    remaining,
                    ledger.config().retry_window,
                    network
                );
                Ok(BanOutcome::Counted { network, remaining })
            }
            AttemptOutcome::AlreadyBanned => {
                debug!(network = %network, "Network is already banned");
                Ok(BanOutcome::AlreadyBanned { network })
            }
            AttemptOutcome::ThresholdReached { ban_counter } => {
                let duration = ledger.calc_net_ban_time(ban_counter);
                error!(
                    network = %network,
                    minutes = duration.num_minutes(),
                    "Banning {} for {} minutes",
                    network,
                    duration.num_minutes()
                );

                if !self.manage_external {
                    let firewall = self.firewall.lock().await;
                    firewall.tracker(Family::of_net(&network)).ban(&network).await?;
                }

                let deadline = (now + duration).timestamp();
                self.store
                    .hset(ACTIVE_BANS, &network.to_string(), &deadline.to_string())
                    .await?;

                Ok(BanOutcome::Banned { network, duration })
            }
        }
    }

    /// Lift the ban of `network`; returns false when it was never banned
    pub async fn unban(&self, network: &IpNet) -> Result<bool> {
        let mut ledger = self.ledger.lock().await;
        self.unban_locked(&mut ledger, network, None).await
    }

    /// `queued` is the unban queue field as stored, when it differs from the
    /// canonical network text
    async fn unban_locked(
        &self,
        ledger: &mut BanLedger,
        network: &IpNet,
        queued: Option<&str>,
    ) -> Result<bool> {
        let key = network.to_string();
        let queued = queued.unwrap_or(&key);

        if !ledger.contains(network) {
            info!(network = %network, "Network is not banned, removing it from the unban queue");
            self.store.hdel(QUEUE_UNBAN, queued).await?;
            return Ok(false);
        }

        info!(network = %network, "Unbanning network");
        if !self.manage_external {
            let firewall = self.firewall.lock().await;
            firewall.tracker(Family::of_net(network)).unban(network).await?;
        }

        self.store.hdel(ACTIVE_BANS, &key).await?;
        self.store.hdel(QUEUE_UNBAN, queued).await?;
        ledger.release(network);
        Ok(true)
    }

    /// Ban or unban a network regardless of its failure count
    pub async fn perm_ban(&self, network: &IpNet, unban: bool) -> Result<()> {
        let key = network.to_string();
        let family = Family::of_net(network);

        if unban {
            let removed = if self.manage_external {
                true
            } else {
                let firewall = self.firewall.lock().await;
                firewall.tracker(family).unban(network).await?
            };
            if removed {
                self.store.hdel(PERM_BANS, &key).await?;
                error!(network = %network, "Removed host/network {} from blacklist", network);
            }
        } else {
            if !self.manage_external {
                let firewall = self.firewall.lock().await;
                firewall.tracker(family).ban(network).await?;
            }
            self.store
                .hset(PERM_BANS, &key, &Utc::now().timestamp().to_string())
                .await?;
            error!(network = %network, "Added host/network {} to blacklist", network);
        }

        Ok(())
    }

    /// Process the unban queue and lift expired bans
    pub async fn autopurge(&self) -> Result<()> {
        self.autopurge_at(Utc::now()).await
    }

    pub(crate) async fn autopurge_at(&self, now: DateTime<Utc>) -> Result<()> {
        let queued = self.store.hkeys(QUEUE_UNBAN).await?;
        let mut ledger = self.ledger.lock().await;

        for entry in queued {
            match parse_network(&entry) {
                Some(network) => {
                    self.unban_locked(&mut ledger, &network, Some(&entry)).await?;
                }
                None => {
                    warn!(entry = %entry, "Dropping invalid unban request");
                    self.store.hdel(QUEUE_UNBAN, &entry).await?;
                }
            }
        }

        for network in ledger.expired(now) {
            self.unban_locked(&mut ledger, &network, None).await?;
        }

        Ok(())
    }

    /// Fail unless the managed jump is first in every tracked base chain
    pub async fn chain_order(&self) -> Result<()> {
        if self.manage_external {
            return Ok(());
        }
        let firewall = self.firewall.lock().await;
        for tracker in firewall.trackers() {
            tracker.check_chain_order().await?;
        }
        Ok(())
    }

    /// Reconcile the SNAT rule of one family
    pub async fn reconcile_snat(&self, family: Family, target: IpAddr, source: IpNet) -> Result<SnatOutcome> {
        if self.manage_external {
            return Ok(SnatOutcome::Unchanged);
        }
        let firewall = self.firewall.lock().await;
        firewall.tracker(family).reconcile_snat(target, source).await
    }

    /// Re-resolve the blacklist and apply additions and removals
    pub async fn update_blacklist(&self) -> Result<()> {
        let entries = self.store.hkeys(BLACKLIST).await?;
        let resolved = resolve_entries(self.resolver.as_ref(), entries).await;

        let diff = {
            let mut ledger = self.ledger.lock().await;
            match ledger.replace_blacklist(resolved) {
                Some(diff) => {
                    error!(entries = ledger.blacklist_len(), "Blacklist was changed, it has {} entries", ledger.blacklist_len());
                    diff
                }
                None => return Ok(()),
            }
        };

        for network in &diff.added {
            self.perm_ban(network, false).await?;
        }
        for network in &diff.removed {
            self.perm_ban(network, true).await?;
        }
        Ok(())
    }

    /// Re-resolve the whitelist
    pub async fn update_whitelist(&self) -> Result<()> {
        let entries = self.store.hkeys(WHITELIST).await?;
        let resolved = resolve_entries(self.resolver.as_ref(), entries).await;

        let mut ledger = self.ledger.lock().await;
        if ledger.set_whitelist(resolved) {
            error!(entries = ledger.whitelist_len(), "Whitelist was changed, it has {} entries", ledger.whitelist_len());
        }
        Ok(())
    }

    /// Lift every ban, remove the managed chains and drop the persisted bans
    pub async fn clear(&self) -> Result<()> {
        info!("Clearing all bans");
        let mut ledger = self.ledger.lock().await;
        for network in ledger.networks() {
            self.unban_locked(&mut ledger, &network, None).await?;
        }

        if !self.manage_external {
            let firewall = self.firewall.lock().await;
            for tracker in firewall.trackers() {
                tracker.clear().await?;
            }
        }

        for key in [ACTIVE_BANS, PERM_BANS] {
            if let Err(e) = self.store.delete(key).await {
                error!(key = %key, error = %e, "Failed to clear persisted bans");
            }
        }
        Ok(())
    }

    /// Snapshot of the record of a network
    pub async fn record(&self, network: &IpNet) -> Option<BanRecord> {
        self.ledger.lock().await.record(network).cloned()
    }
}
