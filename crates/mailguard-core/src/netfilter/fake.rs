//! In-memory nftables model for tests
//!
//! Executes the JSON command protocol against an in-memory ruleset with
//! kernel-style handles. A batch that fails leaves the ruleset untouched.

use async_trait::async_trait;
use mailguard_common::{Family, Result};
use serde_json::{json, Map, Value};
use std::sync::Mutex;

use super::nft::{NftBackend, NftOutput, RuleInfo, JSON_SCHEMA_VERSION};

#[derive(Debug, Clone)]
struct FakeChain {
    family: String,
    table: String,
    name: String,
    handle: u64,
    hook: Option<String>,
    prio: Option<i64>,
    rules: Vec<FakeRule>,
}

#[derive(Debug, Clone)]
struct FakeRule {
    handle: u64,
    comment: Option<String>,
    expr: Vec<Value>,
}

#[derive(Debug, Default)]
struct FakeState {
    next_handle: u64,
    chains: Vec<FakeChain>,
    commands: Vec<Value>,
    fail_next: Option<String>,
}

impl FakeState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn chain_mut(&mut self, family: &str, table: &str, name: &str) -> Option<&mut FakeChain> {
        self.chains
            .iter_mut()
            .find(|c| c.family == family && c.table == table && c.name == name)
    }
}

#[derive(Debug, Default)]
pub struct FakeNft {
    state: Mutex<FakeState>,
}

impl FakeNft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a base chain attached to a hook
    pub fn with_base_chain(self, family: Family, table: &str, name: &str, hook: &str, prio: i64) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let handle = state.handle();
            state.chains.push(FakeChain {
                family: family.as_str().to_string(),
                table: table.to_string(),
                name: name.to_string(),
                handle,
                hook: Some(hook.to_string()),
                prio: Some(prio),
                rules: Vec::new(),
            });
        }
        self
    }

    /// The usual filter input/forward and nat postrouting chains of a family
    pub fn with_default_chains(self, family: Family) -> Self {
        self.with_base_chain(family, "filter", "INPUT", "input", 0)
            .with_base_chain(family, "filter", "FORWARD", "forward", 0)
            .with_base_chain(family, "nat", "POSTROUTING", "postrouting", 100)
    }

    /// Append a rule behind the back of the service
    pub fn append_rule(&self, family: Family, table: &str, chain: &str, comment: Option<&str>, expr: Vec<Value>) -> u64 {
        self.place_rule(family, table, chain, comment, expr, false)
    }

    /// Insert a rule at the head of a chain behind the back of the service
    pub fn prepend_rule(&self, family: Family, table: &str, chain: &str, comment: Option<&str>, expr: Vec<Value>) -> u64 {
        self.place_rule(family, table, chain, comment, expr, true)
    }

    fn place_rule(
        &self,
        family: Family,
        table: &str,
        chain: &str,
        comment: Option<&str>,
        expr: Vec<Value>,
        head: bool,
    ) -> u64 {
        let mut state = self.state.lock().unwrap();
        let handle = state.handle();
        let rule = FakeRule {
            handle,
            comment: comment.map(str::to_string),
            expr,
        };
        let chain = state
            .chain_mut(family.as_str(), table, chain)
            .expect("chain exists");
        if head {
            chain.rules.insert(0, rule);
        } else {
            chain.rules.push(rule);
        }
        handle
    }

    /// Remove a rule behind the back of the service
    pub fn remove_rule(&self, family: Family, table: &str, chain: &str, handle: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(chain) = state.chain_mut(family.as_str(), table, chain) {
            chain.rules.retain(|r| r.handle != handle);
        }
    }

    pub fn rules(&self, family: Family, table: &str, chain: &str) -> Vec<RuleInfo> {
        let state = self.state.lock().unwrap();
        state
            .chains
            .iter()
            .find(|c| c.family == family.as_str() && c.table == table && c.name == chain)
            .map(|c| {
                c.rules
                    .iter()
                    .map(|r| RuleInfo {
                        family: c.family.clone(),
                        table: c.table.clone(),
                        chain: c.name.clone(),
                        handle: r.handle,
                        comment: r.comment.clone(),
                        expr: r.expr.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_chain(&self, family: Family, table: &str, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .chains
            .iter()
            .any(|c| c.family == family.as_str() && c.table == table && c.name == name)
    }

    /// Every command batch received so far
    pub fn commands(&self) -> Vec<Value> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Number of batches that were not pure listings
    pub fn mutation_count(&self) -> usize {
        self.commands()
            .iter()
            .filter(|cmd| {
                cmd["nftables"]
                    .as_array()
                    .map(|ops| ops.iter().skip(1).any(|op| op.get("list").is_none()))
                    .unwrap_or(false)
            })
            .count()
    }

    /// Make the next batch fail with the given error text
    pub fn fail_next(&self, message: &str) {
        self.state.lock().unwrap().fail_next = Some(message.to_string());
    }

    fn execute(&self, cmd: &Value) -> NftOutput {
        let mut state = self.state.lock().unwrap();
        state.commands.push(cmd.clone());

        if let Some(message) = state.fail_next.take() {
            return failure(message);
        }

        let Some(ops) = cmd.get("nftables").and_then(Value::as_array) else {
            return failure("missing nftables envelope");
        };
        let version = ops
            .first()
            .and_then(|op| op.get("metainfo"))
            .and_then(|m| m.get("json_schema_version"))
            .and_then(Value::as_u64);
        if version != Some(u64::from(JSON_SCHEMA_VERSION)) {
            return failure("missing schema version");
        }

        let snapshot = (state.next_handle, state.chains.clone());
        let mut output = vec![json!({ "metainfo": { "json_schema_version": JSON_SCHEMA_VERSION } })];

        for op in &ops[1..] {
            if let Err(message) = apply(&mut state, op, &mut output) {
                state.next_handle = snapshot.0;
                state.chains = snapshot.1;
                return failure(message);
            }
        }

        NftOutput {
            rc: 0,
            output: json!({ "nftables": output }),
            error: String::new(),
        }
    }
}

#[async_trait]
impl NftBackend for FakeNft {
    async fn json_cmd(&self, cmd: &Value) -> Result<NftOutput> {
        Ok(self.execute(cmd))
    }
}

fn failure(message: impl Into<String>) -> NftOutput {
    NftOutput {
        rc: 1,
        output: Value::Null,
        error: message.into(),
    }
}

fn single(value: &Value) -> std::result::Result<(&str, &Value), String> {
    value
        .as_object()
        .and_then(|o| o.iter().next())
        .map(|(k, v)| (k.as_str(), v))
        .ok_or_else(|| format!("malformed command object: {}", value))
}

fn field<'a>(args: &'a Value, key: &str) -> std::result::Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing {}", key))
}

fn chain_json(chain: &FakeChain) -> Value {
    let mut obj = Map::new();
    obj.insert("family".into(), json!(chain.family));
    obj.insert("table".into(), json!(chain.table));
    obj.insert("name".into(), json!(chain.name));
    obj.insert("handle".into(), json!(chain.handle));
    if let (Some(hook), Some(prio)) = (&chain.hook, chain.prio) {
        let kind = if chain.table == "nat" { "nat" } else { "filter" };
        obj.insert("type".into(), json!(kind));
        obj.insert("hook".into(), json!(hook));
        obj.insert("prio".into(), json!(prio));
        obj.insert("policy".into(), json!("accept"));
    }
    json!({ "chain": obj })
}

fn rule_json(chain: &FakeChain, rule: &FakeRule) -> Value {
    let mut obj = Map::new();
    obj.insert("family".into(), json!(chain.family));
    obj.insert("table".into(), json!(chain.table));
    obj.insert("chain".into(), json!(chain.name));
    obj.insert("handle".into(), json!(rule.handle));
    if let Some(comment) = &rule.comment {
        obj.insert("comment".into(), json!(comment));
    }
    obj.insert("expr".into(), json!(rule.expr));
    json!({ "rule": obj })
}

fn jumps_to(rule: &FakeRule, target: &str) -> bool {
    rule.expr.iter().any(|e| {
        e.get("jump")
            .and_then(|j| j.get("target"))
            .and_then(Value::as_str)
            == Some(target)
    })
}

fn apply(state: &mut FakeState, op: &Value, output: &mut Vec<Value>) -> std::result::Result<(), String> {
    let (verb, object) = single(op)?;
    let (kind, args) = single(object)?;
    let family = field(args, "family")?.to_string();

    match (verb, kind) {
        ("list", "chains") => {
            for chain in state.chains.iter().filter(|c| c.family == family) {
                output.push(chain_json(chain));
            }
        }
        ("list", "table") => {
            let table = field(args, "name")?;
            let chains: Vec<&FakeChain> = state
                .chains
                .iter()
                .filter(|c| c.family == family && c.table == table)
                .collect();
            if chains.is_empty() {
                return Err("No such file or directory".to_string());
            }
            output.push(json!({ "table": { "family": family, "name": table } }));
            for chain in &chains {
                output.push(chain_json(chain));
            }
            for chain in chains {
                output.extend(chain.rules.iter().map(|r| rule_json(chain, r)));
            }
        }
        ("list", "chain") => {
            let table = field(args, "table")?;
            let name = field(args, "name")?;
            let chain = state
                .chains
                .iter()
                .find(|c| c.family == family && c.table == table && c.name == name)
                .ok_or_else(|| "No such file or directory".to_string())?;
            output.push(chain_json(chain));
            output.extend(chain.rules.iter().map(|r| rule_json(chain, r)));
        }
        ("add", "chain") => {
            let table = field(args, "table")?.to_string();
            let name = field(args, "name")?.to_string();
            if state.chain_mut(&family, &table, &name).is_none() {
                let handle = state.handle();
                state.chains.push(FakeChain {
                    family,
                    table,
                    name,
                    handle,
                    hook: None,
                    prio: None,
                    rules: Vec::new(),
                });
            }
        }
        ("insert", "rule") | ("add", "rule") => {
            let table = field(args, "table")?.to_string();
            let name = field(args, "chain")?.to_string();
            let expr = args
                .get("expr")
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| "missing expr".to_string())?;
            if let Some(target) = expr.iter().find_map(|e| e.get("jump")?.get("target")?.as_str()) {
                if !state.chains.iter().any(|c| c.family == family && c.table == table && c.name == target) {
                    return Err(format!("Could not process rule: No such file or directory ({})", target));
                }
            }
            let handle = state.handle();
            let rule = FakeRule {
                handle,
                comment: args.get("comment").and_then(Value::as_str).map(str::to_string),
                expr,
            };
            let chain = state
                .chain_mut(&family, &table, &name)
                .ok_or_else(|| "No such file or directory".to_string())?;
            if verb == "insert" {
                chain.rules.insert(0, rule);
            } else {
                chain.rules.push(rule);
            }
        }
        ("delete", "rule") => {
            let table = field(args, "table")?.to_string();
            let name = field(args, "chain")?.to_string();
            let handle = args
                .get("handle")
                .and_then(Value::as_u64)
                .ok_or_else(|| "missing handle".to_string())?;
            let chain = state
                .chain_mut(&family, &table, &name)
                .ok_or_else(|| "No such file or directory".to_string())?;
            let before = chain.rules.len();
            chain.rules.retain(|r| r.handle != handle);
            if chain.rules.len() == before {
                return Err("Could not process rule: No such file or directory".to_string());
            }
        }
        ("flush", "chain") => {
            let table = field(args, "table")?.to_string();
            let name = field(args, "name")?.to_string();
            state
                .chain_mut(&family, &table, &name)
                .ok_or_else(|| "No such file or directory".to_string())?
                .rules
                .clear();
        }
        ("delete", "chain") => {
            let table = field(args, "table")?.to_string();
            let name = field(args, "name")?.to_string();
            let position = state
                .chains
                .iter()
                .position(|c| c.family == family && c.table == table && c.name == name)
                .ok_or_else(|| "No such file or directory".to_string())?;
            let referenced = state
                .chains
                .iter()
                .filter(|c| c.family == family && c.table == table)
                .any(|c| c.rules.iter().any(|r| jumps_to(r, &name)));
            if referenced || !state.chains[position].rules.is_empty() {
                return Err("Could not process rule: Device or resource busy".to_string());
            }
            state.chains.remove(position);
        }
        _ => return Err(format!("unsupported command: {} {}", verb, kind)),
    }

    Ok(())
}
