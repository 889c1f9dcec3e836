//! JSON configuration persistence.
//!
//! The file round-trips both ports and every rule field. Loading is
//! forgiving the way the original deployment expects: a missing,
//! unreadable, or invalid file yields the default configuration instead
//! of a startup failure. Saving happens after every successful admin
//! mutation, so the file always mirrors the published ruleset.

use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::rules::{LogLevel, Rule, RuleError, RuleSet, Strategy};

/// Default configuration file path, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "waypoint.config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// Serialized form of one rule.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEntry {
    pub pattern: String,
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Ipv4Addr>,
    #[serde(default)]
    pub min_log_level: LogLevel,
}

impl RuleEntry {
    fn into_rule(self) -> Result<Rule, RuleError> {
        Rule::new(&self.pattern, self.strategy, self.answer, self.min_log_level)
    }
}

impl From<&Rule> for RuleEntry {
    fn from(rule: &Rule) -> Self {
        Self {
            pattern: rule.pattern().to_string(),
            strategy: rule.strategy(),
            answer: rule.answer(),
            min_log_level: rule.min_log_level(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    dns_port: u16,
    admin_port: u16,
    rules: Vec<RuleEntry>,
}

/// Loads the ruleset from `path`, falling back to defaults on any error.
///
/// A rule entry that fails validation discards the whole file: a
/// half-loaded rule list would silently reorder matching.
pub fn load(path: &Path) -> RuleSet {
    match read(path) {
        Ok(set) => set,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "using default configuration");
            RuleSet::default()
        }
    }
}

fn read(path: &Path) -> Result<RuleSet, ConfigError> {
    let text = fs::read_to_string(path)?;
    let file: ConfigFile = serde_json::from_str(&text)?;

    let mut set = RuleSet::new(file.dns_port, file.admin_port);
    for entry in file.rules {
        set.push_rule(entry.into_rule()?);
    }
    Ok(set)
}

/// Writes the ruleset to `path` as pretty-printed JSON.
pub fn save(path: &Path, set: &RuleSet) -> Result<(), ConfigError> {
    let file = ConfigFile {
        dns_port: set.dns_port(),
        admin_port: set.admin_port(),
        rules: set.rules().iter().map(RuleEntry::from).collect(),
    };
    fs::write(path, serde_json::to_string_pretty(&file)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{DEFAULT_ADMIN_PORT, DEFAULT_DNS_PORT};

    fn sample_set() -> RuleSet {
        let mut set = RuleSet::new(5353, 8081);
        set.push_rule(
            Rule::new("ads\\.", Strategy::Block, None, LogLevel::Info).unwrap(),
        );
        set.push_rule(
            Rule::new(
                "local\\.test$",
                Strategy::Respond,
                Some(Ipv4Addr::new(192, 168, 1, 50)),
                LogLevel::default(),
            )
            .unwrap(),
        );
        set
    }

    #[test]
    fn save_then_load_round_trips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waypoint.config.json");

        save(&path, &sample_set()).unwrap();
        let loaded = load(&path);

        assert_eq!(loaded.dns_port(), 5353);
        assert_eq!(loaded.admin_port(), 8081);
        assert_eq!(loaded.rules().len(), 2);

        let blocked = &loaded.rules()[0];
        assert_eq!(blocked.pattern(), "ads\\.");
        assert_eq!(blocked.strategy(), Strategy::Block);
        assert_eq!(blocked.answer(), None);
        assert_eq!(blocked.min_log_level(), LogLevel::Info);

        let respond = &loaded.rules()[1];
        assert_eq!(respond.strategy(), Strategy::Respond);
        assert_eq!(respond.answer(), Some(Ipv4Addr::new(192, 168, 1, 50)));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let loaded = load(&dir.path().join("nonexistent.json"));

        assert_eq!(loaded.dns_port(), DEFAULT_DNS_PORT);
        assert_eq!(loaded.admin_port(), DEFAULT_ADMIN_PORT);
        assert!(loaded.rules().is_empty());
    }

    #[test]
    fn corrupt_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waypoint.config.json");
        fs::write(&path, "{ this is not json").unwrap();

        let loaded = load(&path);

        assert_eq!(loaded.dns_port(), DEFAULT_DNS_PORT);
        assert!(loaded.rules().is_empty());
    }

    #[test]
    fn invalid_rule_pattern_discards_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waypoint.config.json");
        fs::write(
            &path,
            r#"{
                "dnsPort": 5353,
                "adminPort": 8081,
                "rules": [
                    {"pattern": "ok\\.test", "strategy": "block"},
                    {"pattern": "broken[", "strategy": "forward"}
                ]
            }"#,
        )
        .unwrap();

        let loaded = load(&path);

        assert_eq!(loaded.dns_port(), DEFAULT_DNS_PORT);
        assert!(loaded.rules().is_empty());
    }

    #[test]
    fn answer_less_rule_omits_answer_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waypoint.config.json");
        let mut set = RuleSet::default();
        set.push_rule(Rule::new("a", Strategy::Forward, None, LogLevel::default()).unwrap());

        save(&path, &set).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("answer"));
        assert!(text.contains("minLogLevel"));
    }
}
