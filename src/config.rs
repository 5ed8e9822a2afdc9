//! Rule configuration and its JSON representation

use crate::domain::ValueKind;
use crate::error::{Result, SorterError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_TEMPLATE_DEPTH: usize = 4;
pub const DEFAULT_UNIQUE_ATTEMPTS: usize = 1000;

fn default_template_depth() -> usize {
    DEFAULT_TEMPLATE_DEPTH
}

fn default_unique_attempts() -> usize {
    DEFAULT_UNIQUE_ATTEMPTS
}

/// An ordered rule list plus the policies that apply to a whole pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Stop evaluating further rules for a file once one rule has matched
    #[serde(default)]
    pub first_match_only: bool,
    /// Deepest allowed placeholder nesting in templates
    #[serde(default = "default_template_depth")]
    pub max_template_depth: usize,
    /// Upper bound on disambiguated names tried for one destination
    #[serde(default = "default_unique_attempts")]
    pub max_unique_attempts: usize,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            first_match_only: false,
            max_template_depth: DEFAULT_TEMPLATE_DEPTH,
            max_unique_attempts: DEFAULT_UNIQUE_ATTEMPTS,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub name: String,
    /// Missing means the rule matches every file
    #[serde(default, rename = "match")]
    pub condition: MatchSpec,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

/// Condition tree as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchSpec {
    All { all: Vec<MatchSpec> },
    Any { any: Vec<MatchSpec> },
    Not { not: Box<MatchSpec> },
    Leaf(ConditionSpec),
}

impl Default for MatchSpec {
    fn default() -> Self {
        MatchSpec::All { all: Vec::new() }
    }
}

/// One leaf condition before operator and operand validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub subject: String,
    pub operator: String,
    #[serde(default)]
    pub operand: serde_json::Value,
    pub kind: ValueKind,
}

/// One action with its named parameters. Path and name parameters are templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionSpec {
    Rename {
        to: String,
    },
    Prepend {
        text: String,
    },
    Append {
        text: String,
    },
    Move {
        to: String,
    },
    Copy {
        to: String,
        /// Continue the rule with the copy instead of the original
        #[serde(default)]
        follow: bool,
    },
    ChangeExtension {
        to: String,
    },
    AddTag {
        tag: String,
    },
    RemoveTag {
        tag: String,
    },
    UpdateTags {
        tags: Vec<String>,
    },
    CreateAlias {
        at: String,
    },
    MoveToTrash,
    RunCommand {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// Abort the remaining actions of the rule when the command fails
        #[serde(default)]
        fatal: bool,
    },
}

impl Configuration {
    /// Get the config file path (~/.config/sorter/rules.json)
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sorter").join("rules.json"))
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| {
            SorterError::ConfigError(format!("Failed to parse config file: {}", e))
        })
    }

    /// Load the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            SorterError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_json(&contents)
    }

    /// Load the default configuration, or an empty one if none exists yet
    pub fn load_default() -> Result<Self> {
        let path = Self::config_path().ok_or_else(|| {
            SorterError::ConfigError("Could not determine config directory".to_string())
        })?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load(&path)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SorterError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let contents = serde_json::to_string_pretty(self).map_err(|e| {
            SorterError::ConfigError(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(path, contents).map_err(|e| {
            SorterError::ConfigError(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Configuration::default();
        assert!(!config.first_match_only);
        assert_eq!(config.max_template_depth, DEFAULT_TEMPLATE_DEPTH);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_parse_full_rule() {
        let json = r#"{
            "first_match_only": true,
            "rules": [{
                "name": "PDFs",
                "match": {"all": [
                    {"subject": "extension", "operator": "equals", "operand": "pdf", "kind": "string"},
                    {"not": {"subject": "tags", "operator": "contains", "operand": ["keep"], "kind": "array"}}
                ]},
                "actions": [
                    {"action": "move", "to": "~/Documents/PDFs/{year}"},
                    {"action": "add_tag", "tag": "filed"},
                    {"action": "move_to_trash"},
                    {"action": "run_command", "program": "echo"}
                ]
            }]
        }"#;

        let config = Configuration::from_json(json).unwrap();
        assert!(config.first_match_only);
        assert_eq!(config.max_unique_attempts, DEFAULT_UNIQUE_ATTEMPTS);

        let rule = &config.rules[0];
        assert_eq!(rule.name, "PDFs");
        match &rule.condition {
            MatchSpec::All { all } => {
                assert_eq!(all.len(), 2);
                assert!(matches!(all[0], MatchSpec::Leaf(_)));
                assert!(matches!(all[1], MatchSpec::Not { .. }));
            }
            other => panic!("unexpected tree {:?}", other),
        }
        assert_eq!(
            rule.actions[0],
            ActionSpec::Move {
                to: "~/Documents/PDFs/{year}".to_string()
            }
        );
        assert_eq!(rule.actions[2], ActionSpec::MoveToTrash);
        assert_eq!(
            rule.actions[3],
            ActionSpec::RunCommand {
                program: "echo".to_string(),
                args: vec![],
                fatal: false,
            }
        );
    }

    #[test]
    fn test_missing_match_is_unconditional() {
        let json = r#"{"rules": [{"actions": [{"action": "add_tag", "tag": "seen"}]}]}"#;
        let config = Configuration::from_json(json).unwrap();
        assert_eq!(config.rules[0].condition, MatchSpec::All { all: vec![] });
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let json = r#"{"rules": [{"actions": [{"action": "shred"}]}]}"#;
        let result = Configuration::from_json(json);
        assert!(matches!(result, Err(SorterError::ConfigError(_))));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("rules.json");

        let config = Configuration {
            rules: vec![Rule {
                name: "copy".to_string(),
                condition: MatchSpec::default(),
                actions: vec![ActionSpec::Copy {
                    to: "backup".to_string(),
                    follow: true,
                }],
            }],
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = Configuration::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Configuration::load(Path::new("/nonexistent/rules.json"));
        assert!(matches!(result, Err(SorterError::ConfigError(_))));
    }
}
