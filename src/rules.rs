//! Rule model and first-match-wins lookup.
//!
//! A [`RuleSet`] is an ordered list of [`Rule`]s plus the process ports.
//! Insertion order is the priority order: the first rule whose pattern
//! matches the query name decides the strategy, and a query that matches
//! nothing falls through to a synthesized Forward rule. Listeners read
//! the set through an immutable snapshot, so a `RuleSet` is never mutated
//! while a query is being matched against it.

use std::net::Ipv4Addr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default DNS listen port.
pub const DEFAULT_DNS_PORT: u16 = 53;
/// Default port for the external administration layer.
pub const DEFAULT_ADMIN_PORT: u16 = 8080;

/// Errors from rule construction and set mutation.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule pattern '{pattern}': {source}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("respond rule '{0}' has no answer address")]
    MissingAnswer(String),

    #[error("rule index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid dns port {0}")]
    BadPort(u16),
}

/// Severity at which a rule reports its activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

/// Action taken for a matched query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Drop the query; the client gets no reply at all.
    Block,
    /// Resolve upstream and relay the answers.
    Forward,
    /// Answer with a fixed A record, no upstream contact.
    Respond,
}

/// One pattern-to-strategy binding.
///
/// The pattern is matched unanchored against the full query name, so
/// `ads\.` matches any name containing that substring. Validation
/// happens here and only here: a `Rule` that exists is usable.
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: String,
    regex: Regex,
    strategy: Strategy,
    answer: Option<Ipv4Addr>,
    min_log_level: LogLevel,
}

impl Rule {
    pub fn new(
        pattern: &str,
        strategy: Strategy,
        answer: Option<Ipv4Addr>,
        min_log_level: LogLevel,
    ) -> Result<Self, RuleError> {
        let regex = Regex::new(pattern).map_err(|source| RuleError::BadPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        if strategy == Strategy::Respond && answer.is_none() {
            return Err(RuleError::MissingAnswer(pattern.to_string()));
        }
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            strategy,
            answer,
            min_log_level,
        })
    }

    /// The default rule for names no configured rule matches: forward,
    /// pattern equal to the query name itself.
    pub fn fallback_forward(name: &str) -> Self {
        // An escaped literal always compiles.
        let regex = Regex::new(&regex::escape(name)).expect("escaped pattern is valid");
        Self {
            pattern: name.to_string(),
            regex,
            strategy: Strategy::Forward,
            answer: None,
            min_log_level: LogLevel::default(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn answer(&self) -> Option<Ipv4Addr> {
        self.answer
    }

    pub fn min_log_level(&self) -> LogLevel {
        self.min_log_level
    }
}

/// Ordered rule list plus process ports.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
    dns_port: u16,
    admin_port: u16,
}

impl RuleSet {
    pub fn new(dns_port: u16, admin_port: u16) -> Self {
        Self {
            rules: Vec::new(),
            dns_port,
            admin_port,
        }
    }

    /// First rule whose pattern matches `name`, or the synthesized
    /// Forward fallback. Total: every query gets exactly one rule.
    pub fn find_rule(&self, name: &str) -> Rule {
        self.rules
            .iter()
            .find(|rule| rule.matches(name))
            .cloned()
            .unwrap_or_else(|| Rule::fallback_forward(name))
    }

    /// Appends a rule at the lowest priority position.
    pub fn push_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Removes the rule at `index`. An out-of-range index fails without
    /// touching the sequence.
    pub fn remove_rule(&mut self, index: usize) -> Result<Rule, RuleError> {
        if index >= self.rules.len() {
            return Err(RuleError::IndexOutOfRange {
                index,
                len: self.rules.len(),
            });
        }
        Ok(self.rules.remove(index))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn dns_port(&self) -> u16 {
        self.dns_port
    }

    pub fn admin_port(&self) -> u16 {
        self.admin_port
    }

    pub fn set_dns_port(&mut self, port: u16) -> Result<(), RuleError> {
        if port == 0 {
            return Err(RuleError::BadPort(port));
        }
        self.dns_port = port;
        Ok(())
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new(DEFAULT_DNS_PORT, DEFAULT_ADMIN_PORT)
    }
}
