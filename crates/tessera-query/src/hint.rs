//! Adapter for the legacy string hint syntax.
//!
//! `"name, status +query(10) +cache"` becomes an [`OrmQueryProperties`] with
//! an explicit property list and a structured [`FetchConfig`]. The query core
//! only ever sees the structured form.

use crate::detail::{FetchConfig, OrmQueryDetail, OrmQueryProperties};
use regex::Regex;
use std::sync::OnceLock;
use tessera_core::{ConfigError, Error, Result};

const HINT_PATTERN: &str = r"\+(query|lazy|cache|readonly)(?:\(\s*(\d+)\s*\))?";

fn hint_regex() -> Result<&'static Regex> {
    static HINTS: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    HINTS
        .get_or_init(|| Regex::new(HINT_PATTERN))
        .as_ref()
        .map_err(|e| {
            tracing::warn!(pattern = HINT_PATTERN, error = %e, "Invalid hint pattern");
            Error::Config(ConfigError {
                message: format!("invalid hint pattern: {}", e),
                source: None,
            })
        })
}

/// Parse a hinted property string for `path`.
pub fn parse_properties(path: &str, text: &str) -> Result<OrmQueryProperties> {
    let regex = hint_regex()?;
    let mut props = OrmQueryProperties::all(path);
    for caps in regex.captures_iter(text) {
        let batch = match caps.get(2) {
            Some(m) => m.as_str().parse::<i32>().map_err(|e| {
                Error::Config(ConfigError {
                    message: format!("invalid batch size in hint '{}'", text),
                    source: Some(Box::new(e)),
                })
            })?,
            None => 0,
        };
        match &caps[1] {
            "query" => props.set_fetch(FetchConfig::query(batch)),
            "lazy" => props.set_fetch(FetchConfig::lazy(batch)),
            "cache" => props.set_cache(true),
            _ => props.set_read_only(true),
        }
    }

    let remainder = regex.replace_all(text, "");
    if remainder.contains('+') {
        return Err(Error::Config(ConfigError {
            message: format!("unknown hint in '{}'", text),
            source: None,
        }));
    }
    let names: Vec<&str> = remainder
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    props.set_properties(&names);
    tracing::trace!(path, hint = text, fetch = ?props.fetch(), "Parsed query hint");
    Ok(props)
}

impl OrmQueryDetail {
    /// Add a join (or the root selection for `""`) from a hinted string.
    pub fn fetch_hinted(&mut self, path: &str, text: &str) -> Result<()> {
        let props = parse_properties(path, text)?;
        if path.is_empty() {
            self.put(props);
            return Ok(());
        }
        let names: Vec<&str> = props
            .properties()
            .map(|p| p.iter().map(String::as_str).collect())
            .unwrap_or_default();
        self.fetch(path, &names, props.fetch());
        if let Some(added) = self.get_mut(path) {
            added.set_cache(props.use_cache());
            added.set_read_only(props.is_read_only());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detail::FetchMode;

    #[test]
    fn test_parse_query_hint() {
        let props = parse_properties("customer", "name, status +query(10) +cache").unwrap();
        assert_eq!(props.fetch(), FetchConfig::query(10));
        assert!(props.use_cache());
        assert!(!props.is_read_only());
        assert_eq!(
            props.properties().unwrap(),
            &["name".to_string(), "status".to_string()]
        );
    }

    #[test]
    fn test_lazy_without_batch_and_all_properties() {
        let props = parse_properties("lines", "+lazy +readonly").unwrap();
        assert_eq!(props.fetch().mode, FetchMode::Lazy);
        assert_eq!(props.fetch().batch_size, 0);
        assert!(props.is_read_only());
        assert!(props.properties().is_none());
    }

    #[test]
    fn test_unknown_hint_rejected() {
        let err = parse_properties("x", "name +eager").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_detail_fetch_hinted() {
        let mut detail = OrmQueryDetail::new();
        detail.fetch_hinted("", "status").unwrap();
        detail.fetch_hinted("customer", "name +lazy(5)").unwrap();
        assert!(detail.root().includes("status"));
        assert!(!detail.root().includes("id"));
        assert_eq!(detail.get("customer").unwrap().fetch(), FetchConfig::lazy(5));
    }
}
