//! Request path exclusion filter for the middleware.

use std::collections::HashSet;

use regex::Regex;

use crate::errors::Error;

/// Immutable set of path exclusion rules.
///
/// Built once when the middleware is constructed, then read concurrently by
/// every request. A path is excluded when it matches the exact set, starts
/// with any configured prefix, or matches any compiled pattern.
#[derive(Clone, Debug, Default)]
pub struct PathFilter {
    exact: HashSet<String>,
    prefixes: Vec<String>,
    patterns: Vec<Regex>,
}

impl PathFilter {
    /// Compile a filter from exact paths, prefixes and regex patterns.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any pattern fails to compile.
    pub fn new(
        exact: Vec<String>,
        prefixes: Vec<String>,
        patterns: &[String],
    ) -> Result<Self, Error> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            compiled.push(Regex::new(pattern).map_err(|err| Error::InvalidConfig {
                reason: format!("invalid exclude pattern {pattern:?}: {err}"),
            })?);
        }
        Ok(Self {
            exact: exact.into_iter().collect(),
            prefixes,
            patterns: compiled,
        })
    }

    /// Returns `true` if measurements for `path` are suppressed.
    #[must_use]
    pub fn should_exclude(&self, path: &str) -> bool {
        self.exact.contains(path)
            || self.prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
            || self.patterns.iter().any(|pattern| pattern.is_match(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> PathFilter {
        PathFilter::new(
            vec!["/health".into()],
            vec!["/debug/".into()],
            &["^/v[0-9]+/internal/.*".into()],
        )
        .unwrap()
    }

    #[test]
    fn exact_match_excludes() {
        assert!(filter().should_exclude("/health"));
        assert!(!filter().should_exclude("/healthz"));
    }

    #[test]
    fn prefix_match_excludes() {
        let filter = filter();
        assert!(filter.should_exclude("/debug/pprof"));
        assert!(filter.should_exclude("/debug/"));
        assert!(!filter.should_exclude("/debug"));
    }

    #[test]
    fn pattern_match_excludes() {
        let filter = filter();
        assert!(filter.should_exclude("/v3/internal/x"));
        assert!(filter.should_exclude("/v12/internal/deep/er"));
        assert!(!filter.should_exclude("/vx/internal/x"));
    }

    #[test]
    fn unrelated_path_passes() {
        assert!(!filter().should_exclude("/api/users"));
    }

    #[test]
    fn empty_filter_excludes_nothing() {
        let filter = PathFilter::default();
        assert!(!filter.should_exclude("/"));
        assert!(!filter.should_exclude("/health"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let result = PathFilter::new(Vec::new(), Vec::new(), &["([".into()]);
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
