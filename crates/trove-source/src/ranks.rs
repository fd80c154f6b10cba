//! Source rank overrides.
//!
//! Ranks come from the `[ranks]` config table and from the
//! `TROVE_PLUGIN_RANKS` environment variable (`"id:rank,pattern*:rank"`).
//! Exact ids win over glob patterns; among patterns, the first inserted
//! match wins.

use std::collections::{BTreeMap, HashMap};

use glob::Pattern;
use trove_core::{Error, Result};

/// Environment variable holding rank overrides.
pub const RANKS_ENV: &str = "TROVE_PLUGIN_RANKS";

#[derive(Debug, Clone, Default)]
pub struct RankTable {
    exact: HashMap<String, i32>,
    patterns: Vec<(Pattern, i32)>,
}

impl RankTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an override. Names containing glob metacharacters are patterns.
    pub fn insert(&mut self, name: &str, rank: i32) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::config("empty source name in rank table"));
        }
        if name.contains(['*', '?', '[']) {
            let pattern = Pattern::new(name)
                .map_err(|e| Error::config(format!("bad rank pattern '{name}': {e}")))?;
            self.patterns.retain(|(p, _)| p.as_str() != name);
            self.patterns.push((pattern, rank));
        } else {
            self.exact.insert(name.to_string(), rank);
        }
        Ok(())
    }

    /// Build from the `[ranks]` config table.
    pub fn from_map(ranks: &BTreeMap<String, i32>) -> Result<Self> {
        let mut table = Self::new();
        for (name, rank) in ranks {
            table.insert(name, *rank)?;
        }
        Ok(table)
    }

    /// Parse `"id:rank,id:rank"`. Malformed entries are skipped and returned
    /// as warnings.
    pub fn parse_spec(spec: &str) -> (Self, Vec<String>) {
        let mut table = Self::new();
        let mut warnings = Vec::new();

        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((name, rank)) = entry.split_once(':') else {
                warnings.push(format!("rank entry '{entry}' has no ':'"));
                continue;
            };
            let rank = match rank.trim().parse::<i32>() {
                Ok(rank) => rank,
                Err(_) => {
                    warnings.push(format!("rank entry '{entry}' has a non-numeric rank"));
                    continue;
                }
            };
            if let Err(e) = table.insert(name, rank) {
                warnings.push(e.to_string());
            }
        }

        (table, warnings)
    }

    /// Read overrides from [`RANKS_ENV`], logging malformed entries.
    pub fn from_env() -> Self {
        let Ok(spec) = std::env::var(RANKS_ENV) else {
            return Self::new();
        };
        let (table, warnings) = Self::parse_spec(&spec);
        for warning in warnings {
            tracing::warn!(variable = RANKS_ENV, "{warning}");
        }
        table
    }

    /// Apply every entry of `other` on top of this table.
    pub fn merge(&mut self, other: RankTable) {
        self.exact.extend(other.exact);
        for (pattern, rank) in other.patterns {
            self.patterns.retain(|(p, _)| p.as_str() != pattern.as_str());
            self.patterns.push((pattern, rank));
        }
    }

    /// Configured rank for `source_id`, if any.
    pub fn rank_for(&self, source_id: &str) -> Option<i32> {
        self.exact.get(source_id).copied().or_else(|| {
            self.patterns
                .iter()
                .find(|(pattern, _)| pattern.matches(source_id))
                .map(|(_, rank)| *rank)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }
}
