//! Namespace path parsing.
//!
//! A namespace path is a `/` separated topic string such as
//! `site/area/line/tag`. Each segment names one node of the namespace tree and
//! the full string is the node's identity key. [`PathParser`] validates a raw
//! topic and turns it into a [`NamespacePath`], which hands out the ancestor
//! prefixes the mutation builder needs.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use crate::error::SyncError;

/// Reserved segment separator.
pub const PATH_SEPARATOR: char = '/';
/// MQTT single level wildcard. Only valid in subscription filters.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
/// MQTT multi level wildcard. Only valid as the last level of a filter.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

pub const DEFAULT_MAX_DEPTH: usize = 32;

/// An ordered, non-empty list of segments. Construct through [`PathParser`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacePath {
    full: String,
    segments: Vec<String>,
}

impl NamespacePath {
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// The last segment, i.e. the node name of the path itself.
    pub fn name(&self) -> &str {
        // segments is never empty
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The path made of the first `depth` segments. `depth` is clamped to
    /// `1..=self.depth()`.
    pub fn prefix(&self, depth: usize) -> String {
        let depth = depth.clamp(1, self.depth());
        self.segments[..depth].join(&PATH_SEPARATOR.to_string())
    }

    /// Proper prefixes of this path, root first.
    pub fn ancestors(&self) -> Vec<String> {
        (1..self.depth()).map(|depth| self.prefix(depth)).collect()
    }

    pub fn parent(&self) -> Option<String> {
        match self.depth() {
            1 => None,
            depth => Some(self.prefix(depth - 1)),
        }
    }

    pub fn is_root(&self) -> bool {
        self.depth() == 1
    }
}

impl Display for NamespacePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full)
    }
}

impl AsRef<str> for NamespacePath {
    fn as_ref(&self) -> &str {
        &self.full
    }
}

impl FromStr for NamespacePath {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PathParser::new(usize::MAX).parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathParser {
    max_depth: usize,
}

impl Default for PathParser {
    fn default() -> Self {
        PathParser::new(DEFAULT_MAX_DEPTH)
    }
}

impl PathParser {
    pub fn new(max_depth: usize) -> PathParser {
        PathParser { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Split `raw` into its segments.
    ///
    /// Fails with [`SyncError::MalformedPath`] when the path is empty, has an
    /// empty segment (including leading or trailing separators), contains a
    /// wildcard, or is deeper than the configured maximum.
    pub fn parse(&self, raw: &str) -> Result<NamespacePath, SyncError> {
        if raw.is_empty() {
            return Err(SyncError::MalformedPath("path is empty".to_string()));
        }
        let segments = raw
            .split(PATH_SEPARATOR)
            .map(str::to_string)
            .collect::<Vec<String>>();

        if segments.len() > self.max_depth {
            return Err(SyncError::MalformedPath(format!(
                "'{raw}' has {} segments, maximum depth is {}",
                segments.len(),
                self.max_depth
            )));
        }
        if let Some(idx) = segments.iter().position(|s| s.is_empty()) {
            return Err(SyncError::MalformedPath(format!(
                "'{raw}' has an empty segment at position {idx}"
            )));
        }
        if let Some(wildcard) = segments
            .iter()
            .find(|s| s.contains(SINGLE_LEVEL_WILDCARD) || s.contains(MULTI_LEVEL_WILDCARD))
        {
            return Err(SyncError::MalformedPath(format!(
                "'{raw}' contains wildcard segment '{wildcard}'"
            )));
        }

        Ok(NamespacePath {
            full: raw.to_string(),
            segments,
        })
    }
}

/// MQTT subscription filter matching. `+` matches exactly one level, `#`
/// matches the remaining levels (including none) and must be last.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split(PATH_SEPARATOR);
    let mut topic_levels = topic.split(PATH_SEPARATOR);
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return filter_levels.next().is_none(),
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
