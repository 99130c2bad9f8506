//! nftables JSON command client
//!
//! Every command is wrapped in the `{"nftables": [...]}` envelope with a
//! leading schema-version metainfo object, executed through an
//! [`NftBackend`], and its listing output parsed into typed objects.

use async_trait::async_trait;
use mailguard_common::{Error, Family, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

/// JSON schema version sent with every command
pub const JSON_SCHEMA_VERSION: u32 = 1;

/// Raw result of one command batch
#[derive(Debug, Clone, PartialEq)]
pub struct NftOutput {
    /// Return code, non-zero on failure
    pub rc: i32,
    /// Parsed JSON output (`Null` when the command printed nothing)
    pub output: Value,
    /// Error text reported by the packet filter
    pub error: String,
}

/// Executes JSON command batches against the packet filter
#[async_trait]
pub trait NftBackend: Send + Sync {
    async fn json_cmd(&self, cmd: &Value) -> Result<NftOutput>;
}

/// Backend running the `nft` binary in JSON mode
pub struct NftProcess {
    program: PathBuf,
}

impl NftProcess {
    /// Use `nft` from `PATH`
    pub fn new() -> Self {
        Self::with_program("nft")
    }

    /// Use a specific `nft` binary
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for NftProcess {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NftBackend for NftProcess {
    async fn json_cmd(&self, cmd: &Value) -> Result<NftOutput> {
        let input = cmd.to_string();
        let spawn_error = |e: std::io::Error| Error::Firewall {
            command: input.clone(),
            message: format!("Failed to run {}: {}", self.program.display(), e),
        };

        let mut child = Command::new(&self.program)
            .args(["--json", "--handle", "--file", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await.map_err(spawn_error)?;
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        let rc = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);

        let parsed = if rc == 0 && !stdout.trim().is_empty() {
            serde_json::from_str(&stdout).map_err(|e| Error::Firewall {
                command: input.clone(),
                message: format!("Unparseable nft output: {}", e),
            })?
        } else {
            Value::Null
        };

        Ok(NftOutput {
            rc,
            output: parsed,
            error: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Parsed listing output
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ruleset {
    #[serde(default)]
    pub nftables: Vec<NftObject>,
}

impl Ruleset {
    /// Chains in listing order
    pub fn chains(&self) -> impl Iterator<Item = &ChainInfo> {
        self.nftables.iter().filter_map(|obj| obj.chain.as_ref())
    }

    /// Rules in listing order
    pub fn rules(&self) -> impl Iterator<Item = &RuleInfo> {
        self.nftables.iter().filter_map(|obj| obj.rule.as_ref())
    }
}

/// One listing entry; kinds other than chains and rules are ignored
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NftObject {
    #[serde(default)]
    pub chain: Option<ChainInfo>,
    #[serde(default)]
    pub rule: Option<RuleInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainInfo {
    pub family: String,
    pub table: String,
    pub name: String,
    #[serde(default)]
    pub handle: u64,
    #[serde(default)]
    pub hook: Option<String>,
    #[serde(default)]
    pub prio: Option<Value>,
}

impl ChainInfo {
    /// Numeric priority of a base chain
    pub fn priority(&self) -> Option<i64> {
        self.prio.as_ref().and_then(Value::as_i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleInfo {
    pub family: String,
    pub table: String,
    pub chain: String,
    #[serde(default)]
    pub handle: u64,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub expr: Vec<Value>,
}

impl RuleInfo {
    /// Whether the rule carries the given comment tag
    pub fn is_tagged(&self, comment: &str) -> bool {
        self.comment.as_deref() == Some(comment)
    }
}

/// Wrap operations in the command envelope
pub fn envelope(ops: Vec<Value>) -> Value {
    let mut commands = Vec::with_capacity(ops.len() + 1);
    commands.push(json!({ "metainfo": { "json_schema_version": JSON_SCHEMA_VERSION } }));
    commands.extend(ops);
    json!({ "nftables": commands })
}

/// Family-scoped command client
#[derive(Clone)]
pub struct NftClient {
    family: Family,
    backend: Arc<dyn NftBackend>,
}

impl NftClient {
    pub fn new(family: Family, backend: Arc<dyn NftBackend>) -> Self {
        Self { family, backend }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Run a batch of operations; a non-zero return code is an error
    pub async fn run_cmd(&self, ops: Vec<Value>) -> Result<Value> {
        let cmd = envelope(ops);
        debug!(family = %self.family, command = %cmd, "Running nft command");

        let result = self.backend.json_cmd(&cmd).await.map_err(|e| {
            error!(command = %cmd, error = %e, "Nftables backend failure");
            e
        })?;

        if result.rc != 0 {
            error!(command = %cmd, rc = result.rc, error = %result.error, "Nftables error");
            return Err(Error::Firewall {
                command: cmd.to_string(),
                message: result.error,
            });
        }

        Ok(result.output)
    }

    async fn run_listing(&self, op: Value) -> Result<Ruleset> {
        let output = self.run_cmd(vec![op]).await?;
        if output.is_null() {
            return Ok(Ruleset::default());
        }
        serde_json::from_value(output).map_err(|e| Error::Firewall {
            command: format!("list ({})", self.family),
            message: format!("Unexpected listing format: {}", e),
        })
    }

    pub async fn add_chain(&self, table: &str, name: &str) -> Result<()> {
        self.run_cmd(vec![json!({
            "add": { "chain": { "family": self.family.as_str(), "table": table, "name": name } }
        })])
        .await
        .map(|_| ())
    }

    pub async fn flush_chain(&self, table: &str, name: &str) -> Result<()> {
        self.run_cmd(vec![json!({
            "flush": { "chain": { "family": self.family.as_str(), "table": table, "name": name } }
        })])
        .await
        .map(|_| ())
    }

    pub async fn delete_chain(&self, table: &str, name: &str, handle: u64) -> Result<()> {
        self.run_cmd(vec![json!({
            "delete": {
                "chain": {
                    "family": self.family.as_str(),
                    "table": table,
                    "name": name,
                    "handle": handle,
                }
            }
        })])
        .await
        .map(|_| ())
    }

    /// Insert a rule at the head of a chain
    pub async fn insert_rule(
        &self,
        table: &str,
        chain: &str,
        expr: Vec<Value>,
        comment: Option<&str>,
    ) -> Result<()> {
        let mut rule = json!({
            "family": self.family.as_str(),
            "table": table,
            "chain": chain,
            "expr": expr,
        });
        if let Some(comment) = comment {
            rule["comment"] = json!(comment);
        }
        self.run_cmd(vec![json!({ "insert": { "rule": rule } })])
            .await
            .map(|_| ())
    }

    pub async fn delete_rule(&self, table: &str, chain: &str, handle: u64) -> Result<()> {
        self.run_cmd(vec![json!({
            "delete": {
                "rule": {
                    "family": self.family.as_str(),
                    "table": table,
                    "chain": chain,
                    "handle": handle,
                }
            }
        })])
        .await
        .map(|_| ())
    }

    pub async fn list_chain(&self, table: &str, name: &str) -> Result<Ruleset> {
        self.run_listing(json!({
            "list": { "chain": { "family": self.family.as_str(), "table": table, "name": name } }
        }))
        .await
    }

    pub async fn list_chains(&self) -> Result<Ruleset> {
        self.run_listing(json!({
            "list": { "chains": { "family": self.family.as_str() } }
        }))
        .await
    }

    pub async fn list_table(&self, name: &str) -> Result<Ruleset> {
        self.run_listing(json!({
            "list": { "table": { "family": self.family.as_str(), "name": name } }
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::fake::FakeNft;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_envelope_carries_schema_version() {
        let cmd = envelope(vec![]);
        assert_eq!(
            cmd,
            json!({ "nftables": [{ "metainfo": { "json_schema_version": 1 } }] })
        );
    }

    #[tokio::test]
    async fn test_flush_chain_command() {
        let nft = Arc::new(FakeNft::new().with_base_chain(Family::Ip, "filter", "INPUT", "input", 0));
        let client = NftClient::new(Family::Ip, nft.clone());

        client.flush_chain("filter", "INPUT").await.unwrap();

        assert_eq!(
            nft.commands().last().cloned().unwrap(),
            json!({
                "nftables": [
                    { "metainfo": { "json_schema_version": 1 } },
                    { "flush": { "chain": { "family": "ip", "table": "filter", "name": "INPUT" } } },
                ]
            })
        );
    }

    #[tokio::test]
    async fn test_delete_rule_command() {
        let nft = Arc::new(FakeNft::new().with_base_chain(Family::Ip6, "filter", "INPUT", "input", 0));
        let handle = nft.append_rule(Family::Ip6, "filter", "INPUT", None, vec![json!({"accept": null})]);
        let client = NftClient::new(Family::Ip6, nft.clone());

        client.delete_rule("filter", "INPUT", handle).await.unwrap();

        assert_eq!(
            nft.commands().last().cloned().unwrap()["nftables"][1],
            json!({
                "delete": {
                    "rule": { "family": "ip6", "table": "filter", "chain": "INPUT", "handle": handle }
                }
            })
        );
        assert!(nft.rules(Family::Ip6, "filter", "INPUT").is_empty());
    }

    #[tokio::test]
    async fn test_list_chains_parses_objects() {
        let nft = Arc::new(
            FakeNft::new()
                .with_base_chain(Family::Ip, "filter", "a", "input", 2)
                .with_base_chain(Family::Ip, "filter", "b", "input", 1)
                .with_base_chain(Family::Ip6, "filter", "c", "input", 0),
        );
        let client = NftClient::new(Family::Ip, nft);

        let ruleset = client.list_chains().await.unwrap();
        let names: Vec<&str> = ruleset.chains().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(ruleset.chains().next().unwrap().priority(), Some(2));
    }

    #[tokio::test]
    async fn test_non_zero_return_is_error() {
        let nft = Arc::new(FakeNft::new());
        nft.fail_next("Operation not permitted");
        let client = NftClient::new(Family::Ip, nft);

        let err = client.list_chains().await.unwrap_err();
        match err {
            Error::Firewall { command, message } => {
                assert_eq!(message, "Operation not permitted");
                assert!(command.contains("json_schema_version"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_listing_missing_chain_is_error() {
        let client = NftClient::new(Family::Ip, Arc::new(FakeNft::new()));
        assert!(client.list_chain("filter", "MAIL").await.is_err());
    }

    #[test]
    fn test_ruleset_ignores_other_objects() {
        let ruleset: Ruleset = serde_json::from_value(json!({
            "nftables": [
                { "metainfo": { "version": "1.0.6", "json_schema_version": 1 } },
                { "table": { "family": "ip", "name": "filter", "handle": 1 } },
                { "chain": { "family": "ip", "table": "filter", "name": "INPUT", "handle": 1,
                             "type": "filter", "hook": "input", "prio": 0, "policy": "accept" } },
                { "rule": { "family": "ip", "table": "filter", "chain": "INPUT", "handle": 4,
                            "comment": "mail", "expr": [{ "jump": { "target": "MAIL" } }] } },
            ]
        }))
        .unwrap();

        assert_eq!(ruleset.chains().count(), 1);
        let rule = ruleset.rules().next().unwrap();
        assert!(rule.is_tagged("mail"));
        assert_eq!(rule.handle, 4);
    }
}
