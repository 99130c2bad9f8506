//! Authentication failure patterns
//!
//! Ordered table of log line shapes emitted by the upstream services on a
//! failed login. Each pattern captures the offending address in group 1 and
//! the first match wins.

use mailguard_common::types::bannable_ip;
use mailguard_common::{Error, Result};
use regex::Regex;
use std::net::IpAddr;

struct PatternDef {
    id: u8,
    service: &'static str,
    pattern: &'static str,
    exclude: Option<&'static str>,
}

const PATTERNS: &[PatternDef] = &[
    PatternDef {
        id: 1,
        service: "admin-ui",
        pattern: r"mail UI: Invalid password for .+ by ([0-9a-f\.:]+)",
        exclude: None,
    },
    PatternDef {
        id: 2,
        service: "rspamd-ui",
        pattern: r"Rspamd UI: Invalid password by ([0-9a-f\.:]+)",
        exclude: None,
    },
    PatternDef {
        id: 3,
        service: "postfix",
        pattern: r"warning: .*\[([0-9a-f\.:]+)\]: SASL .+ authentication failed: .+",
        exclude: Some(r"authentication failed: .*Connection lost to authentication server"),
    },
    PatternDef {
        id: 4,
        service: "postfix",
        pattern: r"warning: non-SMTP command from .*\[([0-9a-f\.:]+)\]:.+",
        exclude: None,
    },
    PatternDef {
        id: 5,
        service: "postfix",
        pattern: r"NOQUEUE: reject: RCPT from \[([0-9a-f\.:]+)\].+Protocol error.+",
        exclude: None,
    },
    PatternDef {
        id: 6,
        service: "dovecot",
        pattern: r"-login: Disconnected.+ \(auth failed, .+\): user=.*, method=.+, rip=([0-9a-f\.:]+),",
        exclude: None,
    },
    PatternDef {
        id: 7,
        service: "dovecot",
        pattern: r"-login: Aborted login.+ \(auth failed .+\): user=.+, rip=([0-9a-f\.:]+), lip.+",
        exclude: None,
    },
    PatternDef {
        id: 8,
        service: "dovecot",
        pattern: r"-login: Aborted login.+ \(tried to use disallowed .+\): user=.+, rip=([0-9a-f\.:]+), lip.+",
        exclude: None,
    },
    PatternDef {
        id: 9,
        service: "sogo",
        pattern: r"SOGo.+ Login from '([0-9a-f\.:]+)' for user .+ might not have worked",
        exclude: None,
    },
    PatternDef {
        id: 10,
        service: "sogo-nginx",
        pattern: r#"([0-9a-f\.:]+) "GET /SOGo/.* HTTP.+" 403 .+"#,
        exclude: None,
    },
];

struct FailurePattern {
    id: u8,
    service: &'static str,
    regex: Regex,
    exclude: Option<Regex>,
}

/// A log line attributed to an offending address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureMatch {
    pub rule_id: u8,
    pub service: &'static str,
    pub address: IpAddr,
}

/// Compiled failure pattern table
pub struct FailurePatterns {
    patterns: Vec<FailurePattern>,
}

impl FailurePatterns {
    pub fn new() -> Result<Self> {
        let compile = |id: u8, pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| Error::Internal(format!("Invalid failure pattern {}: {}", id, e)))
        };

        let patterns = PATTERNS
            .iter()
            .map(|def| {
                Ok(FailurePattern {
                    id: def.id,
                    service: def.service,
                    regex: compile(def.id, def.pattern)?,
                    exclude: def.exclude.map(|p| compile(def.id, p)).transpose()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// First pattern matching `line` with a bannable captured address
    pub fn match_line(&self, line: &str) -> Option<FailureMatch> {
        self.patterns.iter().find_map(|pattern| {
            let captures = pattern.regex.captures(line)?;
            if pattern.exclude.as_ref().is_some_and(|re| re.is_match(line)) {
                return None;
            }
            let address = bannable_ip(captures.get(1)?.as_str())?;
            Some(FailureMatch {
                rule_id: pattern.id,
                service: pattern.service,
                address,
            })
        })
    }
}
