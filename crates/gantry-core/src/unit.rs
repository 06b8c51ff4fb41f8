//! Test unit descriptors

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Scheduling priority of a test unit. Variants are ordered, LOW < CRITICAL.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Returns the string representation of the priority
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// How a unit is invoked inside a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Invocation {
    /// Shell command, run with `sh -c`
    Shell { command: String },
    /// Program with explicit arguments
    Program {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Opaque executable reference supplied by discovery.
///
/// The engine never looks inside it beyond launching it; exit status zero is a
/// pass, anything else a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executable {
    #[serde(flatten)]
    pub invocation: Invocation,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Working directory (defaults to the worker's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl Executable {
    /// A shell command
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            invocation: Invocation::Shell {
                command: command.into(),
            },
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// A program with arguments
    pub fn program<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            invocation: Invocation::Program {
                program: program.into(),
                args: args.into_iter().map(Into::into).collect(),
            },
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Short human-readable form, used in logs and plans
    pub fn describe(&self) -> String {
        match &self.invocation {
            Invocation::Shell { command } => command.clone(),
            Invocation::Program { program, args } if args.is_empty() => program.clone(),
            Invocation::Program { program, args } => format!("{} {}", program, args.join(" ")),
        }
    }
}

/// Immutable descriptor of one discovered test unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestUnit {
    /// Unique identifier
    pub id: String,

    /// Free-form tags used for selection
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,

    /// Units that must complete before this one starts
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Isolation group (usually the service under test)
    pub partition_key: String,

    /// What to run
    pub executable: Executable,
}

impl TestUnit {
    /// Create a new unit with medium priority, no tags and no dependencies
    pub fn new(
        id: impl Into<String>,
        partition_key: impl Into<String>,
        executable: Executable,
    ) -> Self {
        Self {
            id: id.into(),
            tags: BTreeSet::new(),
            priority: Priority::default(),
            depends_on: BTreeSet::new(),
            partition_key: partition_key.into(),
            executable,
        }
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a dependency
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Check whether the unit carries a tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_unit_builder() {
        let unit = TestUnit::new("users::create", "users", Executable::shell("true"))
            .with_tag("smoke")
            .with_priority(Priority::Critical)
            .depends_on("auth::login");

        assert_eq!(unit.partition_key, "users");
        assert!(unit.has_tag("smoke"));
        assert!(unit.depends_on.contains("auth::login"));
        assert_eq!(unit.priority, Priority::Critical);
    }

    #[test]
    fn test_executable_describe() {
        assert_eq!(Executable::shell("make test").describe(), "make test");
        assert_eq!(
            Executable::program("cargo", ["test", "--lib"]).describe(),
            "cargo test --lib"
        );
        assert_eq!(Executable::program("pytest", Vec::<String>::new()).describe(), "pytest");
    }

    #[test]
    fn test_unit_deserialize_defaults() {
        let json = r#"{
            "id": "auth::login",
            "partition_key": "auth",
            "executable": { "kind": "shell", "command": "exit 0" }
        }"#;
        let unit: TestUnit = serde_json::from_str(json).unwrap();
        assert_eq!(unit.priority, Priority::Medium);
        assert!(unit.tags.is_empty());
        assert!(unit.depends_on.is_empty());
        assert_eq!(unit.executable, Executable::shell("exit 0"));
    }

    #[test]
    fn test_program_executable_with_env() {
        let json = r#"{
            "kind": "program",
            "program": "pytest",
            "args": ["-k", "login"],
            "env": { "API_URL": "http://localhost" }
        }"#;
        let exe: Executable = serde_json::from_str(json).unwrap();
        assert_eq!(
            exe.invocation,
            Invocation::Program {
                program: "pytest".to_string(),
                args: vec!["-k".to_string(), "login".to_string()],
            }
        );
        assert_eq!(exe.env.get("API_URL").map(String::as_str), Some("http://localhost"));
    }
}
