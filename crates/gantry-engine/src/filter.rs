//! Unit selection by tags and service

use std::collections::{BTreeSet, HashSet};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, info};

use gantry_core::{ExecutionConfig, TestUnit};

use crate::error::EngineError;

/// Why a unit was filtered out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterReason {
    /// Carries an excluded tag
    ExcludedTag(String),
    /// Carries none of the included tags
    MissingIncludedTag,
    /// Partition key matched no service pattern
    ServiceNotSelected,
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExcludedTag(tag) => write!(f, "tag '{}' is excluded", tag),
            Self::MissingIncludedTag => write!(f, "no included tag"),
            Self::ServiceNotSelected => write!(f, "service not selected"),
        }
    }
}

/// Result of applying a filter
#[derive(Debug, Default)]
pub struct FilterOutcome {
    /// Units that stay, in discovery order
    pub retained: Vec<TestUnit>,
    /// Ids of removed units
    pub removed: HashSet<String>,
}

/// Tag and service filter applied before graph construction
#[derive(Debug, Clone, Default)]
pub struct UnitFilter {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
    services: Option<GlobSet>,
}

impl UnitFilter {
    /// A filter that keeps everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from execution settings
    pub fn from_config(config: &ExecutionConfig) -> Result<Self, EngineError> {
        let mut filter = Self::new();
        filter.include = config.tag_include.clone();
        filter.exclude = config.tag_exclude.clone();
        if !config.services.is_empty() {
            filter = filter.with_services(&config.services)?;
        }
        Ok(filter)
    }

    /// Only keep units with at least one of these tags
    pub fn include_tag(mut self, tag: impl Into<String>) -> Self {
        self.include.insert(tag.into());
        self
    }

    /// Drop units with this tag
    pub fn exclude_tag(mut self, tag: impl Into<String>) -> Self {
        self.exclude.insert(tag.into());
        self
    }

    /// Only keep units whose partition key matches one of the glob patterns
    pub fn with_services(mut self, patterns: &[String]) -> Result<Self, EngineError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| EngineError::Filter {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| EngineError::Filter {
            pattern: patterns.join(","),
            message: e.to_string(),
        })?;
        self.services = Some(set);
        Ok(self)
    }

    /// Check a single unit; `None` means it is kept
    pub fn check(&self, unit: &TestUnit) -> Option<FilterReason> {
        if let Some(tag) = unit.tags.iter().find(|t| self.exclude.contains(*t)) {
            return Some(FilterReason::ExcludedTag(tag.clone()));
        }

        if !self.include.is_empty() && !unit.tags.iter().any(|t| self.include.contains(t)) {
            return Some(FilterReason::MissingIncludedTag);
        }

        if let Some(services) = &self.services {
            if !services.is_match(&unit.partition_key) {
                return Some(FilterReason::ServiceNotSelected);
            }
        }

        None
    }

    /// Split units into retained and removed, keeping discovery order
    pub fn apply(&self, units: Vec<TestUnit>) -> FilterOutcome {
        let total = units.len();
        let mut outcome = FilterOutcome::default();

        for unit in units {
            match self.check(&unit) {
                Some(reason) => {
                    debug!(unit = %unit.id, %reason, "unit filtered out");
                    outcome.removed.insert(unit.id);
                }
                None => outcome.retained.push(unit),
            }
        }

        info!(
            total,
            retained = outcome.retained.len(),
            removed = outcome.removed.len(),
            "units filtered"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::Executable;

    fn unit(id: &str, partition: &str, tags: &[&str]) -> TestUnit {
        tags.iter().fold(
            TestUnit::new(id, partition, Executable::shell("true")),
            |u, t| u.with_tag(*t),
        )
    }

    fn units() -> Vec<TestUnit> {
        vec![
            unit("auth::login", "auth", &["smoke"]),
            unit("auth::load", "auth", &["slow"]),
            unit("users::create", "users", &["smoke", "slow"]),
            unit("orders::list", "orders", &[]),
        ]
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        let outcome = UnitFilter::new().apply(units());
        assert_eq!(outcome.retained.len(), 4);
        assert!(outcome.removed.is_empty());
    }

    #[test]
    fn test_exclude_tag() {
        let outcome = UnitFilter::new().exclude_tag("slow").apply(units());
        let ids: Vec<_> = outcome.retained.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["auth::login", "orders::list"]);
        assert!(outcome.removed.contains("auth::load"));
        assert!(outcome.removed.contains("users::create"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = UnitFilter::new().include_tag("smoke").exclude_tag("slow");
        let outcome = filter.apply(units());
        let ids: Vec<_> = outcome.retained.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["auth::login"]);
    }

    #[test]
    fn test_include_requires_a_tag() {
        let filter = UnitFilter::new().include_tag("smoke");
        assert_eq!(
            filter.check(&unit("orders::list", "orders", &[])),
            Some(FilterReason::MissingIncludedTag)
        );
    }

    #[test]
    fn test_service_selection_globs() {
        let filter = UnitFilter::new()
            .with_services(&["auth".to_string(), "ord*".to_string()])
            .unwrap();
        let outcome = filter.apply(units());
        let ids: Vec<_> = outcome.retained.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["auth::login", "auth::load", "orders::list"]);
    }

    #[test]
    fn test_invalid_service_pattern() {
        assert!(UnitFilter::new().with_services(&["[".to_string()]).is_err());
    }

    #[test]
    fn test_from_config() {
        let mut config = ExecutionConfig::default();
        config.tag_exclude.insert("slow".to_string());
        config.services.push("users".to_string());
        let filter = UnitFilter::from_config(&config).unwrap();
        let outcome = filter.apply(units());
        assert!(outcome.retained.is_empty());
        assert_eq!(outcome.removed.len(), 4);
    }
}
