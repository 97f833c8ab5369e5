//! Worker process settings

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Role of a worker process in the system under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Member,
    Client,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Member => "member",
            WorkerKind::Client => "client",
        }
    }
}

impl Default for WorkerKind {
    fn default() -> Self {
        WorkerKind::Member
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown worker kind '{0}'")]
pub struct ParseWorkerKindError(String);

impl FromStr for WorkerKind {
    type Err = ParseWorkerKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(WorkerKind::Member),
            "client" => Ok(WorkerKind::Client),
            other => Err(ParseWorkerKindError(other.to_string())),
        }
    }
}

/// Launch-time settings for one worker process. The parameter map is opaque
/// to the orchestration layer and reaches the worker unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProcessSettings {
    pub kind: WorkerKind,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl WorkerProcessSettings {
    pub fn member() -> WorkerProcessSettings {
        WorkerProcessSettings {
            kind: WorkerKind::Member,
            parameters: BTreeMap::new(),
        }
    }

    pub fn client() -> WorkerProcessSettings {
        WorkerProcessSettings {
            kind: WorkerKind::Client,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> WorkerProcessSettings {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        assert_eq!("member".parse::<WorkerKind>().unwrap(), WorkerKind::Member);
        assert_eq!("client".parse::<WorkerKind>().unwrap(), WorkerKind::Client);
        assert!("driver".parse::<WorkerKind>().is_err());
    }

    #[test]
    fn test_settings_parameters_are_ordered() {
        let settings = WorkerProcessSettings::member()
            .with_parameter("b", "2")
            .with_parameter("a", "1");
        let json = serde_json::to_string(&settings).unwrap();
        // BTreeMap keys serialize in sorted order, keeping wire bytes stable.
        assert!(json.find("\"a\"").unwrap() < json.find("\"b\"").unwrap());
    }
}
