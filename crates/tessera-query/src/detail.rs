//! Declarative query shape: which properties and associations, fetched how.
//!
//! An [`OrmQueryDetail`] is a tree keyed by dotted association path. The root
//! entry (path `""`) describes the queried type itself. Every other entry is a
//! join request whose [`FetchConfig`] decides whether it becomes part of the
//! main SQL statement (fetch join) or a separate, batched secondary statement
//! (query join or lazy join).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_core::{BeanDescriptor, BeanProperty, DescriptorMap, Error, PropertyKind, Result};

/// Batch size value meaning "not set".
pub const BATCH_UNSET: i32 = -1;

/// How an association path is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Joined into the main statement.
    #[default]
    Join,
    /// Loaded by a secondary statement issued right after the main query.
    Query,
    /// Loaded by a secondary statement on first access, batched with siblings.
    Lazy,
}

/// Fetch mode plus batch size (`-1` unset, `0` default, `>0` explicit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchConfig {
    pub mode: FetchMode,
    pub batch_size: i32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::join()
    }
}

impl FetchConfig {
    pub const fn join() -> Self {
        Self {
            mode: FetchMode::Join,
            batch_size: BATCH_UNSET,
        }
    }

    pub const fn query(batch_size: i32) -> Self {
        Self {
            mode: FetchMode::Query,
            batch_size,
        }
    }

    pub const fn lazy(batch_size: i32) -> Self {
        Self {
            mode: FetchMode::Lazy,
            batch_size,
        }
    }

    /// Whether the path is loaded outside the main statement.
    pub fn is_secondary(&self) -> bool {
        self.mode != FetchMode::Join
    }

    /// Effective batch size, falling back to `default` when unset or zero.
    pub fn batch_size_or(&self, default: usize) -> usize {
        if self.batch_size > 0 {
            self.batch_size as usize
        } else {
            default.max(1)
        }
    }
}

/// Selection and hints for one query path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrmQueryProperties {
    path: String,
    properties: Option<Vec<String>>,
    fetch: FetchConfig,
    read_only: bool,
    cache: bool,
}

impl OrmQueryProperties {
    /// Every property of the path's type.
    pub fn all(path: &str) -> Self {
        Self {
            path: path.to_string(),
            properties: None,
            fetch: FetchConfig::join(),
            read_only: false,
            cache: false,
        }
    }

    /// An explicit property list.
    pub fn with_properties(path: &str, properties: &[&str]) -> Self {
        let mut props = Self::all(path);
        props.set_properties(properties);
        props
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Explicit selection, `None` meaning all properties.
    pub fn properties(&self) -> Option<&[String]> {
        self.properties.as_deref()
    }

    pub fn set_properties(&mut self, properties: &[&str]) {
        if properties.is_empty() || properties == ["*"] {
            self.properties = None;
        } else {
            self.properties = Some(properties.iter().map(|p| (*p).to_string()).collect());
        }
    }

    /// Whether a property is part of the selection.
    pub fn includes(&self, name: &str) -> bool {
        self.properties
            .as_ref()
            .is_none_or(|props| props.iter().any(|p| p == name))
    }

    /// Add a property to an explicit selection (no-op when selecting all).
    pub fn add_property(&mut self, name: &str) {
        if let Some(props) = &mut self.properties {
            if !props.iter().any(|p| p == name) {
                props.push(name.to_string());
            }
        }
    }

    pub fn fetch(&self) -> FetchConfig {
        self.fetch
    }

    pub fn set_fetch(&mut self, fetch: FetchConfig) {
        self.fetch = fetch;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn use_cache(&self) -> bool {
        self.cache
    }

    pub fn set_cache(&mut self, cache: bool) {
        self.cache = cache;
    }
}

/// A join pulled out of the main statement into its own query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryJoin {
    /// Path of the association relative to the detail it was removed from
    pub path: String,
    pub fetch: FetchConfig,
    /// Detail rooted at the association's target type
    pub detail: OrmQueryDetail,
}

/// The per-path query shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrmQueryDetail {
    root: OrmQueryProperties,
    joins: BTreeMap<String, OrmQueryProperties>,
}

impl Default for OrmQueryDetail {
    fn default() -> Self {
        Self::new()
    }
}

impl OrmQueryDetail {
    /// Select every root property, no joins.
    pub fn new() -> Self {
        Self {
            root: OrmQueryProperties::all(""),
            joins: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &OrmQueryProperties {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut OrmQueryProperties {
        &mut self.root
    }

    /// Restrict the root selection.
    pub fn select(&mut self, properties: &[&str]) {
        self.root.set_properties(properties);
    }

    /// Add (or replace) a join request. Missing ancestor paths are added as
    /// fetch joins of every property.
    pub fn fetch(&mut self, path: &str, properties: &[&str], fetch: FetchConfig) {
        let mut prefix = String::new();
        let segments: Vec<&str> = path.split('.').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(segment);
            self.joins
                .entry(prefix.clone())
                .or_insert_with(|| OrmQueryProperties::all(&prefix));
        }
        let mut props = OrmQueryProperties::with_properties(path, properties);
        props.set_fetch(fetch);
        self.joins.insert(path.to_string(), props);
    }

    /// Add a join from already built properties.
    pub fn put(&mut self, props: OrmQueryProperties) {
        if props.path.is_empty() {
            self.root = props;
        } else {
            self.joins.insert(props.path.clone(), props);
        }
    }

    /// Properties of a path (`""` for the root).
    pub fn get(&self, path: &str) -> Option<&OrmQueryProperties> {
        if path.is_empty() {
            Some(&self.root)
        } else {
            self.joins.get(path)
        }
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut OrmQueryProperties> {
        if path.is_empty() {
            Some(&mut self.root)
        } else {
            self.joins.get_mut(path)
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.joins.contains_key(path)
    }

    /// Join requests, parents before children.
    pub fn joins(&self) -> impl Iterator<Item = &OrmQueryProperties> {
        self.joins.values()
    }

    pub fn has_joins(&self) -> bool {
        !self.joins.is_empty()
    }

    /// Mark every query/lazy path read-only (and the root) when `read_only`.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.root.read_only = read_only;
        for props in self.joins.values_mut() {
            props.read_only = read_only;
        }
    }

    fn has_secondary_ancestor(&self, path: &str) -> bool {
        let mut current = path;
        while let Some(idx) = current.rfind('.') {
            current = &current[..idx];
            if self
                .joins
                .get(current)
                .is_some_and(|p| p.fetch.is_secondary())
            {
                return true;
            }
        }
        false
    }

    /// Convert to-many fetch joins the main statement cannot carry into query
    /// joins: every to-many after the first, and any to-many when the query
    /// limits its rows.
    pub fn convert_many_fetch_joins(
        &mut self,
        map: &DescriptorMap,
        root: &Arc<BeanDescriptor>,
        has_max_rows: bool,
    ) -> Result<Vec<String>> {
        let mut many_fetched = false;
        let mut converted = Vec::new();
        let paths: Vec<String> = self.joins.keys().cloned().collect();
        for path in paths {
            if self.has_secondary_ancestor(&path) {
                continue;
            }
            let is_join = self
                .joins
                .get(&path)
                .is_some_and(|p| !p.fetch.is_secondary());
            if !is_join {
                continue;
            }
            let resolved = resolve_path(map, root, &path)?;
            if !resolved.property().is_assoc_many() {
                continue;
            }
            if many_fetched || has_max_rows {
                if let Some(props) = self.joins.get_mut(&path) {
                    props.fetch = FetchConfig::query(0);
                }
                tracing::debug!(path = %path, "Converted to-many fetch join into query join");
                converted.push(path);
            } else {
                many_fetched = true;
            }
        }
        Ok(converted)
    }

    /// Remove query and lazy joins from this detail.
    ///
    /// Each removed join takes every nested path with it (re-parented onto
    /// its own detail), and its parent keeps the association property
    /// selected so the foreign key is still read by the main statement.
    pub fn remove_secondary_joins(&mut self) -> Vec<SecondaryJoin> {
        let secondary: Vec<String> = self
            .joins
            .iter()
            .filter(|(path, props)| props.fetch.is_secondary() && !self.has_secondary_ancestor(path))
            .map(|(path, _)| path.clone())
            .collect();

        let mut removed = Vec::with_capacity(secondary.len());
        for path in secondary {
            let Some(props) = self.joins.remove(&path) else {
                continue;
            };
            let mut sub = OrmQueryDetail::new();
            sub.root.properties = props.properties.clone();
            sub.root.read_only = props.read_only;
            sub.root.cache = props.cache;

            let prefix = format!("{}.", path);
            let nested: Vec<String> = self
                .joins
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            for key in nested {
                if let Some(mut child) = self.joins.remove(&key) {
                    child.path = key[prefix.len()..].to_string();
                    sub.joins.insert(child.path.clone(), child);
                }
            }

            let (parent, name) = split_path(&path);
            if let Some(parent_props) = self.get_mut(parent) {
                parent_props.add_property(name);
            }
            removed.push(SecondaryJoin {
                path,
                fetch: props.fetch,
                detail: sub,
            });
        }
        removed
    }
}

/// Split `a.b.c` into (`a.b`, `c`); a single segment has parent `""`.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('.') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// A property reached by walking a dotted path from a root type.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// Type declaring the final property
    pub owner: Arc<BeanDescriptor>,
    pub position: usize,
}

impl ResolvedPath {
    pub fn property(&self) -> &BeanProperty {
        &self.owner.properties()[self.position]
    }
}

/// Find a property on `desc` or, for hierarchies, on one of its subtypes.
pub fn find_property(
    map: &DescriptorMap,
    desc: &Arc<BeanDescriptor>,
    name: &str,
) -> Result<ResolvedPath> {
    if let Some(position) = desc.property_index(name) {
        return Ok(ResolvedPath {
            owner: Arc::clone(desc),
            position,
        });
    }
    if let Some(inherit) = desc.inheritance() {
        for sub in &inherit.descendants {
            let sub = map.get(sub)?;
            if let Some(position) = sub.property_index(name) {
                return Ok(ResolvedPath {
                    owner: Arc::clone(sub),
                    position,
                });
            }
        }
    }
    Err(Error::mapping_property(
        desc.name(),
        name,
        "unknown property",
    ))
}

/// Type reached through an association or embedded property.
pub fn target_of(map: &DescriptorMap, property: &BeanProperty) -> Result<Arc<BeanDescriptor>> {
    match &property.kind {
        PropertyKind::Embedded(info) => info
            .descriptor
            .clone()
            .ok_or_else(|| Error::mapping(&info.target, "embeddable not resolved")),
        PropertyKind::AssocOne(one) => map.get(&one.target).cloned(),
        PropertyKind::AssocMany(many) => map.get(&many.target).cloned(),
        PropertyKind::Scalar => Err(Error::mapping_property(
            "path",
            &property.name,
            "scalar property has no target type",
        )),
    }
}

/// Walk a dotted path from `root`.
pub fn resolve_path(
    map: &DescriptorMap,
    root: &Arc<BeanDescriptor>,
    path: &str,
) -> Result<ResolvedPath> {
    let mut desc = Arc::clone(root);
    let mut segments = path.split('.').peekable();
    loop {
        let segment = segments
            .next()
            .ok_or_else(|| Error::mapping(root.name(), "empty property path"))?;
        let resolved = find_property(map, &desc, segment)?;
        if segments.peek().is_none() {
            return Ok(resolved);
        }
        desc = target_of(map, resolved.property())?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::SqlType;

    fn map() -> DescriptorMap {
        DescriptorMap::build(vec![
            BeanDescriptor::builder("Customer")
                .table("customer")
                .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
                .property(BeanProperty::scalar("name", "name", SqlType::VarChar(40)))
                .property(BeanProperty::many("orders", "Order", "customer")),
            BeanDescriptor::builder("Order")
                .table("orders")
                .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
                .property(BeanProperty::scalar("status", "status", SqlType::VarChar(10)))
                .property(BeanProperty::one("customer", "Customer"))
                .property(BeanProperty::many("lines", "Line", "order"))
                .property(BeanProperty::many("notes", "Note", "order")),
            BeanDescriptor::builder("Line")
                .table("line")
                .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
                .property(BeanProperty::one("order", "Order"))
                .property(BeanProperty::one("product", "Product")),
            BeanDescriptor::builder("Note")
                .table("note")
                .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
                .property(BeanProperty::one("order", "Order")),
            BeanDescriptor::builder("Product")
                .table("product")
                .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id()),
        ])
        .unwrap()
    }

    #[test]
    fn test_fetch_adds_ancestors() {
        let mut detail = OrmQueryDetail::new();
        detail.fetch("lines.product", &["id"], FetchConfig::join());
        assert!(detail.contains("lines"));
        assert!(detail.get("lines").unwrap().properties().is_none());
        assert!(detail.get("lines.product").unwrap().includes("id"));
        assert!(!detail.get("lines.product").unwrap().includes("name"));
    }

    #[test]
    fn test_remove_secondary_reparents_children() {
        let mut detail = OrmQueryDetail::new();
        detail.select(&["status"]);
        detail.fetch("customer", &["name"], FetchConfig::lazy(10));
        detail.fetch("lines", &[], FetchConfig::query(50));
        detail.fetch("lines.product", &[], FetchConfig::join());

        let removed = detail.remove_secondary_joins();
        assert_eq!(removed.len(), 2);
        assert!(!detail.has_joins());
        // association kept selected on the parent
        assert!(detail.root().includes("customer"));
        assert!(detail.root().includes("lines"));

        let lines = removed.iter().find(|s| s.path == "lines").unwrap();
        assert_eq!(lines.fetch, FetchConfig::query(50));
        assert!(lines.detail.contains("product"));
        let customer = removed.iter().find(|s| s.path == "customer").unwrap();
        assert!(customer.detail.root().includes("name"));
    }

    #[test]
    fn test_second_many_fetch_becomes_query() {
        let map = map();
        let order = map.get("Order").unwrap();
        let mut detail = OrmQueryDetail::new();
        detail.fetch("lines", &[], FetchConfig::join());
        detail.fetch("notes", &[], FetchConfig::join());
        detail.fetch("customer", &[], FetchConfig::join());
        let converted = detail.convert_many_fetch_joins(&map, order, false).unwrap();
        assert_eq!(converted, vec!["notes".to_string()]);
        assert_eq!(detail.get("customer").unwrap().fetch(), FetchConfig::join());

        let mut limited = OrmQueryDetail::new();
        limited.fetch("lines", &[], FetchConfig::join());
        let converted = limited.convert_many_fetch_joins(&map, order, true).unwrap();
        assert_eq!(converted, vec!["lines".to_string()]);
    }

    #[test]
    fn test_resolve_path() {
        let map = map();
        let order = map.get("Order").unwrap();
        let resolved = resolve_path(&map, order, "lines.product.id").unwrap();
        assert_eq!(resolved.owner.name(), "Product");
        assert!(resolve_path(&map, order, "customer.nope").is_err());
    }

    #[test]
    fn test_batch_size_fallback() {
        assert_eq!(FetchConfig::lazy(0).batch_size_or(10), 10);
        assert_eq!(FetchConfig::lazy(BATCH_UNSET).batch_size_or(10), 10);
        assert_eq!(FetchConfig::query(25).batch_size_or(10), 25);
    }
}
