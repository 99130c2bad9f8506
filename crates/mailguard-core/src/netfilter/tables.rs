//! Per-family chain tracking
//!
//! A [`ChainTracker`] owns the managed chain of one address family: it
//! discovers the base chains attached to the input, forward and postrouting
//! hooks, keeps a tagged jump into the managed chain at the head of the
//! filter base chains, and maintains the drop, isolation and SNAT rules.
//! Rules are re-located by their comment tag since kernel handles do not
//! survive a restart.

use ipnet::IpNet;
use mailguard_common::{Error, Family, Result};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, error, info, warn};

use super::expr;
use super::nft::{NftClient, RuleInfo};

pub const FILTER_TABLE: &str = "filter";
pub const NAT_TABLE: &str = "nat";

/// Hook points with a tracked base chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hook {
    Input,
    Forward,
    Postrouting,
}

impl Hook {
    pub const ALL: [Hook; 3] = [Hook::Input, Hook::Forward, Hook::Postrouting];

    /// Table the hook's base chain is looked up in
    pub fn table(&self) -> &'static str {
        match self {
            Hook::Input | Hook::Forward => FILTER_TABLE,
            Hook::Postrouting => NAT_TABLE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::Input => "input",
            Hook::Forward => "forward",
            Hook::Postrouting => "postrouting",
        }
    }

    fn from_chain(table: &str, hook: &str) -> Option<Self> {
        Hook::ALL
            .into_iter()
            .find(|h| h.table() == table && h.as_str() == hook)
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BaseChain {
    name: String,
    prio: i64,
}

/// Discovered base chains by hook
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainRefs {
    chains: BTreeMap<Hook, BaseChain>,
}

impl ChainRefs {
    /// Name of the base chain attached to a hook
    pub fn get(&self, hook: Hook) -> Option<&str> {
        self.chains.get(&hook).map(|c| c.name.as_str())
    }
}

/// Position of the tagged jump rule in one base chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderCheck {
    pub hook: Hook,
    pub chain: String,
    /// Zero-based position among the chain's rules, `None` when absent
    pub position: Option<usize>,
}

impl OrderCheck {
    pub fn is_compliant(&self) -> bool {
        self.position == Some(0)
    }
}

/// Result of one SNAT reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnatOutcome {
    /// No postrouting chain for the family
    NoChain,
    /// The tagged rule is first and correct
    Unchanged,
    /// No tagged rule existed and one was inserted
    Inserted,
    /// A mismatched or misplaced rule was deleted; it is recreated next pass
    Removed { position: usize },
}

/// Chain tracker for one address family
pub struct ChainTracker {
    name: String,
    comment: String,
    client: NftClient,
    chains: ChainRefs,
}

impl ChainTracker {
    pub fn new(name: impl Into<String>, comment: impl Into<String>, client: NftClient) -> Self {
        Self {
            name: name.into(),
            comment: comment.into(),
            client,
            chains: ChainRefs::default(),
        }
    }

    pub fn family(&self) -> Family {
        self.client.family()
    }

    /// Name of the managed chain
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chains(&self) -> &ChainRefs {
        &self.chains
    }

    fn isolation_comment(&self) -> String {
        format!("{} isolation", self.comment)
    }

    /// Enumerate chains and keep the lowest-priority chain per tracked hook
    pub async fn discover(&mut self) -> Result<()> {
        let ruleset = self.client.list_chains().await?;
        let mut chains: BTreeMap<Hook, BaseChain> = BTreeMap::new();

        for chain in ruleset.chains() {
            let (Some(hook), Some(prio)) = (chain.hook.as_deref(), chain.priority()) else {
                continue;
            };
            let Some(hook) = Hook::from_chain(&chain.table, hook) else {
                continue;
            };
            match chains.get(&hook) {
                Some(current) if current.prio <= prio => {}
                _ => {
                    chains.insert(
                        hook,
                        BaseChain {
                            name: chain.name.clone(),
                            prio,
                        },
                    );
                }
            }
        }

        for (hook, chain) in &chains {
            debug!(family = %self.family(), hook = %hook, chain = %chain.name, prio = chain.prio, "Discovered base chain");
        }

        self.chains = ChainRefs { chains };
        Ok(())
    }

    /// Create the managed chain if absent and jump to it from each filter
    /// base chain that lacks a tagged jump
    pub async fn ensure_managed_chain_and_jumps(&self) -> Result<()> {
        let ruleset = self.client.list_table(FILTER_TABLE).await?;

        if !ruleset.chains().any(|c| c.name == self.name) {
            self.client.add_chain(FILTER_TABLE, &self.name).await?;
            info!(family = %self.family(), chain = %self.name, "Created managed chain");
        }

        for hook in [Hook::Input, Hook::Forward] {
            let Some(base) = self.chains.get(hook) else {
                continue;
            };
            let has_jump = ruleset
                .rules()
                .any(|r| r.chain == base && r.is_tagged(&self.comment));
            if !has_jump {
                self.client
                    .insert_rule(
                        FILTER_TABLE,
                        base,
                        vec![expr::counter(), expr::jump(&self.name)],
                        Some(&self.comment),
                    )
                    .await?;
                info!(family = %self.family(), chain = %base, target = %self.name, "Inserted jump rule");
            }
        }

        Ok(())
    }

    /// Position of the first tagged rule in each tracked filter base chain
    pub async fn verify_order(&self) -> Result<Vec<OrderCheck>> {
        let mut checks = Vec::new();

        for hook in [Hook::Input, Hook::Forward] {
            let Some(base) = self.chains.get(hook) else {
                continue;
            };
            let ruleset = self.client.list_chain(FILTER_TABLE, base).await?;
            let position = ruleset.rules().position(|r| r.is_tagged(&self.comment));
            checks.push(OrderCheck {
                hook,
                chain: base.to_string(),
                position,
            });
        }

        Ok(checks)
    }

    /// Fail with [`Error::ChainOrder`] unless every tagged jump is first
    pub async fn check_chain_order(&self) -> Result<()> {
        let mut problems = Vec::new();

        for check in self.verify_order().await? {
            match check.position {
                Some(0) => {}
                Some(position) => {
                    error!(
                        family = %self.family(),
                        chain = %check.chain,
                        position,
                        "Managed jump rule is not first, bans may not be enforced"
                    );
                    problems.push(format!(
                        "{} jump rule in {} at position {}",
                        self.family(),
                        check.chain,
                        position
                    ));
                }
                None => {
                    error!(
                        family = %self.family(),
                        chain = %check.chain,
                        "Managed jump rule is missing, bans are not enforced"
                    );
                    problems.push(format!(
                        "{} jump rule missing in {}",
                        self.family(),
                        check.chain
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::ChainOrder(problems.join(", ")))
        }
    }

    /// Insert a tagged drop rule for traffic from `net`
    pub async fn ban(&self, net: &IpNet) -> Result<()> {
        self.client
            .insert_rule(
                FILTER_TABLE,
                &self.name,
                vec![
                    expr::prefix_match(self.family(), "saddr", "==", net),
                    expr::counter(),
                    expr::drop(),
                ],
                Some(&self.comment),
            )
            .await
    }

    /// Remove the drop rule for `net`; returns whether one was found
    pub async fn unban(&self, net: &IpNet) -> Result<bool> {
        let ruleset = self.client.list_chain(FILTER_TABLE, &self.name).await?;
        let rule = ruleset
            .rules()
            .find(|r| expr::matched_prefix(r, self.family(), "saddr").as_ref() == Some(net));

        match rule {
            Some(rule) => {
                self.client
                    .delete_rule(FILTER_TABLE, &self.name, rule.handle)
                    .await?;
                Ok(true)
            }
            None => {
                debug!(family = %self.family(), network = %net, "No drop rule to remove");
                Ok(false)
            }
        }
    }

    /// Replace the rule dropping forwarded traffic to `ports` that does not
    /// arrive through `interface`
    pub async fn install_isolation_rule(&self, interface: &str, ports: &[u16]) -> Result<()> {
        let comment = self.isolation_comment();
        for handle in self.rule_handles(FILTER_TABLE, &self.name, &comment).await? {
            self.client.delete_rule(FILTER_TABLE, &self.name, handle).await?;
        }

        self.client
            .insert_rule(
                FILTER_TABLE,
                &self.name,
                vec![
                    expr::meta_match("iifname", "!=", interface),
                    expr::meta_match("oifname", "==", interface),
                    expr::tcp_dport_set(ports),
                    expr::counter(),
                    expr::drop(),
                ],
                Some(&comment),
            )
            .await?;

        info!(family = %self.family(), interface = %interface, ?ports, "Installed isolation rule");
        Ok(())
    }

    /// Keep exactly one tagged SNAT rule `source -> target` first in the
    /// postrouting chain
    pub async fn reconcile_snat(&self, target: IpAddr, source: IpNet) -> Result<SnatOutcome> {
        let Some(chain) = self.chains.get(Hook::Postrouting) else {
            debug!(family = %self.family(), "No postrouting chain, skipping SNAT");
            return Ok(SnatOutcome::NoChain);
        };
        let source = source.trunc();

        let ruleset = self.client.list_chain(NAT_TABLE, chain).await?;
        let found = ruleset
            .rules()
            .enumerate()
            .find(|(_, r)| r.is_tagged(&self.comment));

        let Some((position, rule)) = found else {
            self.client
                .insert_rule(
                    NAT_TABLE,
                    chain,
                    vec![
                        expr::prefix_match(self.family(), "saddr", "==", &source),
                        expr::prefix_match(self.family(), "daddr", "!=", &source),
                        expr::counter(),
                        expr::snat(target),
                    ],
                    Some(&self.comment),
                )
                .await?;
            info!(family = %self.family(), source = %source, target = %target, "Added SNAT rule");
            return Ok(SnatOutcome::Inserted);
        };

        let mismatch = self.snat_mismatch(rule, target, source);
        if position == 0 && mismatch.is_none() {
            return Ok(SnatOutcome::Unchanged);
        }

        match mismatch {
            Some(reason) => warn!(family = %self.family(), chain = %chain, reason = %reason, "Removing mismatched SNAT rule"),
            None => warn!(family = %self.family(), chain = %chain, position, "Removing misplaced SNAT rule"),
        }
        self.client.delete_rule(NAT_TABLE, chain, rule.handle).await?;
        Ok(SnatOutcome::Removed { position })
    }

    fn snat_mismatch(&self, rule: &RuleInfo, target: IpAddr, source: IpNet) -> Option<String> {
        let saddr = expr::matched_prefix(rule, self.family(), "saddr");
        let daddr = expr::matched_prefix(rule, self.family(), "daddr");
        let current = expr::snat_target(rule);

        if saddr != Some(source) {
            return Some(format!("source {:?} != {}", saddr, source));
        }
        if daddr != Some(source) {
            return Some(format!("destination {:?} != {}", daddr, source));
        }
        if current != Some(target) {
            return Some(format!("target {:?} != {}", current, target));
        }
        None
    }

    /// Handle of a chain, if it exists
    pub async fn chain_handle(&self, table: &str, name: &str) -> Result<Option<u64>> {
        let ruleset = self.client.list_chains().await?;
        let handle = ruleset
            .chains()
            .find(|c| c.table == table && c.name == name)
            .map(|c| c.handle);
        Ok(handle)
    }

    /// Handles of rules carrying `comment`
    pub async fn rule_handles(&self, table: &str, chain: &str, comment: &str) -> Result<Vec<u64>> {
        let ruleset = self.client.list_chain(table, chain).await?;
        Ok(ruleset
            .rules()
            .filter(|r| r.is_tagged(comment))
            .map(|r| r.handle)
            .collect())
    }

    /// Flush the managed chain, remove the tagged jumps and delete the chain
    pub async fn clear(&self) -> Result<()> {
        let handle = self.chain_handle(FILTER_TABLE, &self.name).await?;
        if handle.is_some() {
            self.client.flush_chain(FILTER_TABLE, &self.name).await?;
        }

        for hook in [Hook::Input, Hook::Forward] {
            let Some(base) = self.chains.get(hook) else {
                continue;
            };
            for rule in self.rule_handles(FILTER_TABLE, base, &self.comment).await? {
                self.client.delete_rule(FILTER_TABLE, base, rule).await?;
            }
        }

        if let Some(handle) = handle {
            self.client
                .delete_chain(FILTER_TABLE, &self.name, handle)
                .await?;
            info!(family = %self.family(), chain = %self.name, "Removed managed chain");
        }

        Ok(())
    }
}
