//! Rule expression builders and parsers

use ipnet::IpNet;
use mailguard_common::types::parse_network;
use mailguard_common::Family;
use serde_json::{json, Value};
use std::net::IpAddr;

use super::nft::RuleInfo;

/// Match an address field of the network header against a prefix
pub fn prefix_match(family: Family, field: &str, op: &str, net: &IpNet) -> Value {
    json!({
        "match": {
            "op": op,
            "left": { "payload": { "protocol": family.as_str(), "field": field } },
            "right": { "prefix": { "addr": net.network().to_string(), "len": net.prefix_len() } },
        }
    })
}

/// Match a meta key (e.g. `iifname`) against a value
pub fn meta_match(key: &str, op: &str, value: &str) -> Value {
    json!({
        "match": {
            "op": op,
            "left": { "meta": { "key": key } },
            "right": value,
        }
    })
}

/// Match the TCP destination port against a set
pub fn tcp_dport_set(ports: &[u16]) -> Value {
    json!({
        "match": {
            "op": "==",
            "left": { "payload": { "protocol": "tcp", "field": "dport" } },
            "right": { "set": ports },
        }
    })
}

pub fn counter() -> Value {
    json!({ "counter": { "packets": 0, "bytes": 0 } })
}

pub fn drop() -> Value {
    json!({ "drop": null })
}

pub fn jump(target: &str) -> Value {
    json!({ "jump": { "target": target } })
}

pub fn snat(addr: IpAddr) -> Value {
    json!({ "snat": { "addr": addr.to_string() } })
}

/// First prefix matched against the given header field of a rule.
///
/// The kernel lists a full-length prefix as a bare address, so both the
/// `{"prefix": {...}}` form and a plain address are accepted.
pub fn matched_prefix(rule: &RuleInfo, family: Family, field: &str) -> Option<IpNet> {
    rule.expr
        .iter()
        .filter_map(|e| e.get("match"))
        .find_map(|m| {
            let payload = m.get("left")?.get("payload")?;
            if payload.get("protocol")?.as_str()? != family.as_str()
                || payload.get("field")?.as_str()? != field
            {
                return None;
            }
            parse_right(m.get("right")?)
        })
}

fn parse_right(right: &Value) -> Option<IpNet> {
    match right {
        Value::String(addr) => parse_network(addr),
        Value::Object(_) => {
            let prefix = right.get("prefix")?;
            let addr: IpAddr = prefix.get("addr")?.as_str()?.parse().ok()?;
            let len = u8::try_from(prefix.get("len")?.as_u64()?).ok()?;
            IpNet::new(addr, len).ok().map(|n| n.trunc())
        }
        _ => None,
    }
}

/// Translation target of a SNAT rule
pub fn snat_target(rule: &RuleInfo) -> Option<IpAddr> {
    rule.expr
        .iter()
        .find_map(|e| e.get("snat")?.get("addr")?.as_str()?.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rule(expr: Vec<Value>) -> RuleInfo {
        RuleInfo {
            family: "ip".to_string(),
            table: "filter".to_string(),
            chain: "MAIL".to_string(),
            handle: 1,
            comment: Some("mail".to_string()),
            expr,
        }
    }

    #[test]
    fn test_prefix_match_shape() {
        let net: IpNet = "198.51.100.0/24".parse().unwrap();
        assert_eq!(
            prefix_match(Family::Ip, "saddr", "==", &net),
            json!({
                "match": {
                    "op": "==",
                    "left": { "payload": { "protocol": "ip", "field": "saddr" } },
                    "right": { "prefix": { "addr": "198.51.100.0", "len": 24 } },
                }
            })
        );
    }

    #[test]
    fn test_drop_is_null_statement() {
        assert_eq!(drop().to_string(), r#"{"drop":null}"#);
    }

    #[test]
    fn test_matched_prefix_forms() {
        let net: IpNet = "198.51.100.0/24".parse().unwrap();
        let listed = rule(vec![prefix_match(Family::Ip, "saddr", "==", &net), drop()]);
        assert_eq!(matched_prefix(&listed, Family::Ip, "saddr"), Some(net));
        assert_eq!(matched_prefix(&listed, Family::Ip, "daddr"), None);
        assert_eq!(matched_prefix(&listed, Family::Ip6, "saddr"), None);

        let bare = rule(vec![json!({
            "match": {
                "op": "==",
                "left": { "payload": { "protocol": "ip", "field": "saddr" } },
                "right": "203.0.113.7",
            }
        })]);
        assert_eq!(
            matched_prefix(&bare, Family::Ip, "saddr"),
            Some("203.0.113.7/32".parse().unwrap())
        );
    }

    #[test]
    fn test_snat_target_found_anywhere() {
        let net: IpNet = "172.22.1.0/24".parse().unwrap();
        let target: IpAddr = "192.0.2.10".parse().unwrap();
        let listed = rule(vec![
            prefix_match(Family::Ip, "saddr", "==", &net),
            prefix_match(Family::Ip, "daddr", "!=", &net),
            snat(target),
        ]);
        assert_eq!(snat_target(&listed), Some(target));
        assert_eq!(snat_target(&rule(vec![drop()])), None);
    }
}
