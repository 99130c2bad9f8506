//! Ban bookkeeping and escalation

use chrono::{DateTime, Duration, Utc};
use ipnet::IpNet;
use mailguard_common::config::BanConfig;
use mailguard_common::types::overlaps;
use mailguard_common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// Failure history of one network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BanRecord {
    /// Failures in the current retry window
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Completed ban/unban cycles
    pub ban_counter: u32,
}

/// Outcome of recording one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Below the threshold
    Counting { attempts: u32, remaining: u32 },
    /// Threshold reached by this failure, the network must be banned
    ThresholdReached { ban_counter: u32 },
    /// The network is already banned
    AlreadyBanned,
}

/// Change of a resolved list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListDiff {
    pub added: Vec<IpNet>,
    pub removed: Vec<IpNet>,
}

/// In-memory ban state.
///
/// Records are created on the first failure and never removed, only reset,
/// so the escalation counter survives an unban.
#[derive(Debug)]
pub struct BanLedger {
    config: BanConfig,
    records: HashMap<IpNet, BanRecord>,
    whitelist: HashSet<IpNet>,
    blacklist: HashSet<IpNet>,
}

impl BanLedger {
    pub fn new(config: BanConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            whitelist: HashSet::new(),
            blacklist: HashSet::new(),
        }
    }

    pub fn config(&self) -> &BanConfig {
        &self.config
    }

    /// Ban duration after `ban_counter` prior bans:
    /// `clamp(ban_time * 2^ban_counter, ban_time, max_ban_time)`
    pub fn calc_net_ban_time(&self, ban_counter: u32) -> Duration {
        let base = self.config.ban_time;
        let escalated = if self.config.ban_time_increment {
            base.saturating_mul(2_u64.saturating_pow(ban_counter))
        } else {
            base
        };
        seconds(std::cmp::max(base, std::cmp::min(escalated, self.config.max_ban_time)))
    }

    /// Widen an address to the configured per-family ban prefix
    pub fn widen(&self, ip: IpAddr) -> Result<IpNet> {
        let prefix = match ip {
            IpAddr::V4(_) => self.config.netban_ipv4,
            IpAddr::V6(_) => self.config.netban_ipv6,
        };
        IpNet::new(ip, prefix)
            .map(|net| net.trunc())
            .map_err(|e| Error::InvalidAddress(format!("{}/{}: {}", ip, prefix, e)))
    }

    /// Record one failure of `net` at `now`
    pub fn record_attempt(&mut self, net: IpNet, now: DateTime<Utc>) -> AttemptOutcome {
        let max_attempts = self.config.max_attempts;
        let retry_window = seconds(self.config.retry_window);
        let record = self.records.entry(net).or_default();

        if record.attempts >= max_attempts {
            return AttemptOutcome::AlreadyBanned;
        }

        let window_elapsed = match record.last_attempt {
            Some(last) => now - last > retry_window,
            None => true,
        };
        if window_elapsed {
            record.attempts = 0;
        }

        record.attempts += 1;
        record.last_attempt = Some(now);

        if record.attempts >= max_attempts {
            AttemptOutcome::ThresholdReached {
                ban_counter: record.ban_counter,
            }
        } else {
            AttemptOutcome::Counting {
                attempts: record.attempts,
                remaining: max_attempts - record.attempts,
            }
        }
    }

    /// Reset a record after an unban; returns false for unknown networks
    pub fn release(&mut self, net: &IpNet) -> bool {
        match self.records.get_mut(net) {
            Some(record) => {
                record.attempts = 0;
                record.ban_counter += 1;
                true
            }
            None => false,
        }
    }

    pub fn record(&self, net: &IpNet) -> Option<&BanRecord> {
        self.records.get(net)
    }

    pub fn contains(&self, net: &IpNet) -> bool {
        self.records.contains_key(net)
    }

    /// All tracked networks
    pub fn networks(&self) -> Vec<IpNet> {
        self.records.keys().copied().collect()
    }

    /// Banned networks whose escalation window has elapsed since their last
    /// failure
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<IpNet> {
        self.records
            .iter()
            .filter(|(_, record)| record.attempts >= self.config.max_attempts)
            .filter(|(_, record)| match record.last_attempt {
                Some(last) => now - last > self.calc_net_ban_time(record.ban_counter),
                None => true,
            })
            .map(|(net, _)| *net)
            .collect()
    }

    /// Replace the whitelist; returns whether it changed
    pub fn set_whitelist(&mut self, whitelist: HashSet<IpNet>) -> bool {
        if whitelist == self.whitelist {
            return false;
        }
        self.whitelist = whitelist;
        true
    }

    pub fn whitelist_len(&self) -> usize {
        self.whitelist.len()
    }

    /// Whitelist entry overlapping `net`, if any
    pub fn whitelisted_by(&self, net: &IpNet) -> Option<IpNet> {
        self.whitelist.iter().find(|w| overlaps(w, net)).copied()
    }

    pub fn is_whitelisted(&self, net: &IpNet) -> bool {
        self.whitelisted_by(net).is_some()
    }

    /// Replace the blacklist; `None` when unchanged
    pub fn replace_blacklist(&mut self, blacklist: HashSet<IpNet>) -> Option<ListDiff> {
        if blacklist == self.blacklist {
            return None;
        }
        let mut diff = ListDiff {
            added: blacklist.difference(&self.blacklist).copied().collect(),
            removed: self.blacklist.difference(&blacklist).copied().collect(),
        };
        diff.added.sort();
        diff.removed.sort();
        self.blacklist = blacklist;
        Some(diff)
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}
