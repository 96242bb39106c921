//! Path pattern compiler
//!
//! Patterns are dotted paths where `*` matches exactly one segment, which is
//! how a rule addresses every block of a repeated layer list
//! (`llama.layers.*.self_attn.q_proj`). Patterns are compiled once into
//! segment matchers and evaluated against structural paths during planning.

use super::plan::{ParallelizePlan, PlanEntry};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// Compiled single-level glob over dotted paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    source: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn compile(pattern: &str) -> Self {
        let segments = if pattern.is_empty() {
            Vec::new()
        } else {
            pattern
                .split('.')
                .map(|s| {
                    if s == "*" {
                        Segment::Wildcard
                    } else {
                        Segment::Literal(s.to_string())
                    }
                })
                .collect()
        };
        Self {
            source: pattern.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// No wildcard segments
    pub fn is_exact(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = if path.is_empty() {
            Vec::new()
        } else {
            path.split('.').collect()
        };
        if parts.len() != self.segments.len() {
            return false;
        }
        parts.iter().zip(&self.segments).all(|(part, segment)| match segment {
            Segment::Wildcard => !part.is_empty(),
            Segment::Literal(literal) => literal.as_str() == *part,
        })
    }
}

/// Plan entries compiled for lookup: exact patterns in a map, wildcard
/// patterns in declaration order
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    entries: Vec<PlanEntry>,
    exact: HashMap<String, usize>,
    wildcards: Vec<(PathPattern, usize)>,
}

impl CompiledPlan {
    pub fn compile(plan: &ParallelizePlan) -> Self {
        let entries = plan.entries().to_vec();
        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            let pattern = PathPattern::compile(&entry.pattern);
            if pattern.is_exact() {
                exact.entry(entry.pattern.clone()).or_insert(index);
            } else {
                wildcards.push((pattern, index));
            }
        }
        Self {
            entries,
            exact,
            wildcards,
        }
    }

    /// Entry governing `path`: an exact pattern wins over any wildcard,
    /// otherwise the first matching wildcard in declaration order
    pub fn lookup(&self, path: &str) -> Option<&PlanEntry> {
        self.lookup_index(path).map(|index| &self.entries[index])
    }

    pub fn lookup_index(&self, path: &str) -> Option<usize> {
        if let Some(index) = self.exact.get(path) {
            return Some(*index);
        }
        self.wildcards
            .iter()
            .find(|(pattern, _)| pattern.matches(path))
            .map(|(_, index)| *index)
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
