//! # kv
//!
//! why: give committed commands somewhere to land so replication has a visible effect
//! relations: fed by node.rs as lastApplied advances
//! what: Command parsing, StateMachine applying SET/DEL to a key/value map

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A parsed state machine command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown verb: {0}")]
    UnknownVerb(String),
    #[error("malformed {verb} arguments: {args:?}")]
    Malformed { verb: String, args: String },
}

impl std::str::FromStr for Command {
    type Err = CommandError;

    /// Accepts `SET key=value` and `DEL key`, verbs case-insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (verb, args) = s.split_once(char::is_whitespace).unwrap_or((s, ""));
        let args = args.trim();
        if verb.is_empty() {
            return Err(CommandError::Empty);
        }
        match verb.to_ascii_uppercase().as_str() {
            "SET" => match args.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => Ok(Command::Set {
                    key: key.trim().to_string(),
                    value: value.trim().to_string(),
                }),
                _ => Err(CommandError::Malformed {
                    verb: "SET".into(),
                    args: args.into(),
                }),
            },
            "DEL" if !args.is_empty() && !args.contains(char::is_whitespace) => {
                Ok(Command::Delete { key: args.to_string() })
            }
            "DEL" => Err(CommandError::Malformed {
                verb: "DEL".into(),
                args: args.into(),
            }),
            other => Err(CommandError::UnknownVerb(other.to_string())),
        }
    }
}

/// What applying one log entry did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Set { key: String, previous: Option<String> },
    Deleted { key: String, existed: bool },
    /// Opaque or unparseable payloads still advance lastApplied
    Ignored(String),
}

/// Per-node key/value store built from applied entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachine {
    data: BTreeMap<String, String>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn apply(&mut self, command: &str) -> Applied {
        match command.parse::<Command>() {
            Ok(Command::Set { key, value }) => {
                let previous = self.data.insert(key.clone(), value);
                Applied::Set { key, previous }
            }
            Ok(Command::Delete { key }) => {
                let existed = self.data.remove(&key).is_some();
                Applied::Deleted { key, existed }
            }
            Err(e) => Applied::Ignored(e.to_string()),
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_and_del() {
        assert_eq!(
            "SET x=1".parse::<Command>(),
            Ok(Command::Set { key: "x".into(), value: "1".into() })
        );
        assert_eq!(
            "set  name = raft ".parse::<Command>(),
            Ok(Command::Set { key: "name".into(), value: "raft".into() })
        );
        assert_eq!("del x".parse::<Command>(), Ok(Command::Delete { key: "x".into() }));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!("".parse::<Command>(), Err(CommandError::Empty));
        assert!(matches!("SET novalue".parse::<Command>(), Err(CommandError::Malformed { .. })));
        assert!(matches!("DEL".parse::<Command>(), Err(CommandError::Malformed { .. })));
        assert_eq!(
            "PUT a=b".parse::<Command>(),
            Err(CommandError::UnknownVerb("PUT".into()))
        );
    }

    #[test]
    fn apply_updates_map() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.apply("SET x=1"), Applied::Set { key: "x".into(), previous: None });
        assert_eq!(
            sm.apply("SET x=2"),
            Applied::Set { key: "x".into(), previous: Some("1".into()) }
        );
        assert_eq!(sm.get("x"), Some("2"));
        assert_eq!(sm.apply("DEL x"), Applied::Deleted { key: "x".into(), existed: true });
        assert!(sm.is_empty());
        assert!(matches!(sm.apply("hello"), Applied::Ignored(_)));
    }
}
