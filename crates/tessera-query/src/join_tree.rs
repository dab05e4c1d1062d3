//! Join tree of a root type.
//!
//! The tree is expanded once per root type over every association reachable
//! without repeating a type on the ancestor chain, then cloned per query and
//! marked with the nodes the query actually needs. Each table node owns a
//! unique alias derived from its parent's alias. The flattened
//! [`PropertyDeployMap`] translates dotted property paths into alias qualified
//! columns for predicates and ordering.

use crate::alias;
use crate::detail::{find_property, split_path, target_of};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tessera_core::deploy::TableJoin;
use tessera_core::{
    BeanDescriptor, BeanProperty, DescriptorMap, Error, IdKind, MaxJoinDepthError, PropertyKind,
    Result, SqlType,
};

/// Depth limits applied while building join trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLimits {
    pub max_depth: usize,
    /// Return [`Error::MaxJoinDepth`] instead of warning and truncating
    pub fail_on_max_depth: bool,
}

impl Default for TreeLimits {
    fn default() -> Self {
        Self {
            max_depth: 8,
            fail_on_max_depth: false,
        }
    }
}

/// Node variants of a join tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Root,
    /// To-one association
    Bean,
    /// To-many association
    List,
    /// Embedded bean; shares its parent's table
    Embedded,
}

/// One node of a [`JoinTree`].
#[derive(Debug, Clone)]
pub struct JoinNode {
    pub kind: NodeKind,
    /// Dotted path from the root, `""` for the root
    pub path: String,
    /// Type declaring the association property (a subtype for subtype-only properties)
    pub owner: Option<Arc<BeanDescriptor>>,
    pub position: Option<usize>,
    pub descriptor: Arc<BeanDescriptor>,
    pub alias: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Number of table joins from the root
    pub join_depth: usize,
    /// Nesting from the root, counting embedded beans
    pub object_depth: usize,
    pub outer: bool,
    /// Whether the associations below this node were added
    pub expanded: bool,
    /// Selected by the query
    pub fetched: bool,
    /// Joined only to restrict or order rows
    pub where_joined: bool,
}

impl JoinNode {
    /// The association or embedded property this node stands for.
    pub fn property(&self) -> Option<&BeanProperty> {
        match (&self.owner, self.position) {
            (Some(owner), Some(position)) => owner.property_at(position),
            _ => None,
        }
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        split_path(&self.path).1
    }

    /// Whether this node takes part in the generated statement.
    pub fn is_included(&self) -> bool {
        self.fetched || self.where_joined
    }
}

/// A property path resolved to a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElProperty {
    /// Alias qualified column
    pub column: String,
    pub sql_type: SqlType,
    /// Node whose table holds the column
    pub node: usize,
}

/// Flattened `path -> column` map of a join tree.
///
/// Foreign key id paths (`customer.id`) are kept apart and consulted first so
/// they resolve to the owner's foreign key column without joining the target.
#[derive(Debug, Clone, Default)]
pub struct PropertyDeployMap {
    properties: HashMap<String, ElProperty>,
    foreign_keys: HashMap<String, ElProperty>,
}

impl PropertyDeployMap {
    pub fn get(&self, path: &str) -> Option<&ElProperty> {
        self.foreign_keys
            .get(path)
            .or_else(|| self.properties.get(path))
    }

    pub fn len(&self) -> usize {
        self.properties.len() + self.foreign_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Properties of a type followed by those only its subtypes declare,
/// shallower subtypes first.
pub(crate) fn hierarchy_properties(
    map: &DescriptorMap,
    desc: &Arc<BeanDescriptor>,
) -> Result<Vec<(Arc<BeanDescriptor>, usize)>> {
    let mut out: Vec<(Arc<BeanDescriptor>, usize)> = (0..desc.properties().len())
        .map(|i| (Arc::clone(desc), i))
        .collect();
    let Some(inherit) = desc.inheritance() else {
        return Ok(out);
    };
    let mut subs = Vec::with_capacity(inherit.descendants.len());
    for name in &inherit.descendants {
        let sub = map.get(name)?;
        let mut depth = 0;
        let mut parent = sub.inheritance().and_then(|i| i.parent.clone());
        while let Some(name) = parent {
            depth += 1;
            parent = map.get(&name)?.inheritance().and_then(|i| i.parent.clone());
        }
        subs.push((depth, sub));
    }
    subs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name().cmp(b.1.name())));

    let mut seen: HashSet<String> = desc.properties().iter().map(|p| p.name.clone()).collect();
    for (_, sub) in subs {
        for prop in sub.properties() {
            if seen.insert(prop.name.clone()) {
                out.push((Arc::clone(sub), prop.position()));
            }
        }
    }
    Ok(out)
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

fn local_aliases_for(props: &[(Arc<BeanDescriptor>, usize)]) -> HashMap<String, String> {
    alias::local_aliases(
        props
            .iter()
            .map(|(owner, pos)| &owner.properties()[*pos])
            .filter(|p| !p.is_scalar())
            .map(|p| p.name.as_str()),
    )
}

/// Compiled join structure of one root type.
#[derive(Debug, Clone)]
pub struct JoinTree {
    root_type: String,
    nodes: Vec<JoinNode>,
    by_path: HashMap<String, usize>,
    deploy: PropertyDeployMap,
    limits: TreeLimits,
    depth_exceeded: bool,
}

impl JoinTree {
    /// Expand the tree of `root`.
    #[tracing::instrument(level = "debug", skip(map, root), fields(root = root.name()))]
    pub fn build(map: &DescriptorMap, root: &Arc<BeanDescriptor>, limits: TreeLimits) -> Result<Self> {
        root.table()?;
        let mut tree = Self {
            root_type: root.name().to_string(),
            nodes: vec![JoinNode {
                kind: NodeKind::Root,
                path: String::new(),
                owner: None,
                position: None,
                descriptor: Arc::clone(root),
                alias: root.alias().to_string(),
                parent: None,
                children: Vec::new(),
                join_depth: 0,
                object_depth: 0,
                outer: false,
                expanded: false,
                fetched: true,
                where_joined: false,
            }],
            by_path: HashMap::from([(String::new(), 0)]),
            deploy: PropertyDeployMap::default(),
            limits,
            depth_exceeded: false,
        };
        let mut chain = vec![root.root_name().to_string()];
        tree.expand(map, 0, &mut chain)?;
        tree.check_aliases()?;
        for idx in 0..tree.nodes.len() {
            tree.index_node(map, idx)?;
        }
        tracing::debug!(
            nodes = tree.nodes.len(),
            depth_exceeded = tree.depth_exceeded,
            "Join tree built"
        );
        Ok(tree)
    }

    fn expand(&mut self, map: &DescriptorMap, idx: usize, chain: &mut Vec<String>) -> Result<()> {
        self.nodes[idx].expanded = true;
        let desc = Arc::clone(&self.nodes[idx].descriptor);
        let props = hierarchy_properties(map, &desc)?;
        let locals = local_aliases_for(&props);
        for (owner, position) in &props {
            if owner.properties()[*position].is_scalar() {
                continue;
            }
            let Some(child) = self.add_child(map, idx, owner, *position, &locals)? else {
                continue;
            };
            if self.nodes[child].kind == NodeKind::Embedded {
                continue;
            }
            let target = self.nodes[child].descriptor.root_name().to_string();
            if chain.contains(&target) {
                tracing::trace!(path = %self.nodes[child].path, "Type repeats on ancestor chain, not expanding");
                continue;
            }
            chain.push(target);
            self.expand(map, child, chain)?;
            chain.pop();
        }
        Ok(())
    }

    fn add_child(
        &mut self,
        map: &DescriptorMap,
        parent: usize,
        owner: &Arc<BeanDescriptor>,
        position: usize,
        locals: &HashMap<String, String>,
    ) -> Result<Option<usize>> {
        let prop = &owner.properties()[position];
        let (kind, optional) = match &prop.kind {
            PropertyKind::Scalar => {
                return Err(Error::mapping_property(
                    owner.name(),
                    &prop.name,
                    "scalar property cannot be joined",
                ));
            }
            PropertyKind::AssocOne(one) => (NodeKind::Bean, one.optional),
            PropertyKind::AssocMany(_) => (NodeKind::List, true),
            PropertyKind::Embedded(_) => (NodeKind::Embedded, true),
        };
        let target = target_of(map, prop)?;

        let parent_node = &self.nodes[parent];
        let path = join_path(&parent_node.path, &prop.name);
        if let Some(&existing) = self.by_path.get(&path) {
            return Ok(Some(existing));
        }
        let join_depth = parent_node.join_depth + usize::from(kind != NodeKind::Embedded);
        let object_depth = parent_node.object_depth + 1;
        let alias = if kind == NodeKind::Embedded {
            parent_node.alias.clone()
        } else {
            let local = locals.get(&prop.name).map_or("x", String::as_str);
            alias::child_alias(&parent_node.alias, local)
        };
        let declared_on_subtype = owner.name() != parent_node.descriptor.name();
        let outer = match kind {
            NodeKind::List => true,
            NodeKind::Embedded => parent_node.outer,
            _ => optional || parent_node.outer || declared_on_subtype,
        };
        if join_depth > self.limits.max_depth {
            self.depth_limit_reached(&path)?;
            return Ok(None);
        }
        let node = JoinNode {
            kind,
            path: path.clone(),
            owner: Some(Arc::clone(owner)),
            position: Some(position),
            descriptor: target,
            alias,
            parent: Some(parent),
            children: Vec::new(),
            join_depth,
            object_depth,
            outer,
            expanded: false,
            fetched: false,
            where_joined: false,
        };
        let idx = self.nodes.len();
        self.nodes.push(node);
        self.nodes[parent].children.push(idx);
        self.by_path.insert(path, idx);
        Ok(Some(idx))
    }

    fn depth_error(&self, path: &str) -> Error {
        Error::MaxJoinDepth(MaxJoinDepthError {
            root: self.root_type.clone(),
            path: path.to_string(),
            max_depth: self.limits.max_depth,
            tree_dump: self.dump(),
        })
    }

    fn depth_limit_reached(&mut self, path: &str) -> Result<()> {
        if self.limits.fail_on_max_depth {
            return Err(self.depth_error(path));
        }
        tracing::warn!(
            root = %self.root_type,
            path,
            max_depth = self.limits.max_depth,
            tree = %self.dump(),
            "Max join depth reached; join tree truncated (check for an unintended association cycle)"
        );
        self.depth_exceeded = true;
        Ok(())
    }

    fn check_aliases(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in self.nodes.iter().filter(|n| n.kind != NodeKind::Embedded) {
            let joins = (0..node.descriptor.table_joins().len()).map(|i| TableJoin::alias(&node.alias, i));
            for alias in std::iter::once(node.alias.clone()).chain(joins) {
                if !seen.insert(alias.clone()) {
                    return Err(Error::mapping(
                        &self.root_type,
                        format!("table alias '{}' assigned twice (at '{}')", alias, node.path),
                    ));
                }
            }
        }
        Ok(())
    }

    fn index_node(&mut self, map: &DescriptorMap, idx: usize) -> Result<()> {
        let node = &self.nodes[idx];
        let path = node.path.clone();
        let alias = node.alias.clone();
        let desc = Arc::clone(&node.descriptor);

        if node.kind == NodeKind::Embedded {
            let prefix = node
                .property()
                .and_then(BeanProperty::embedded_info)
                .map(|info| info.column_prefix.clone())
                .unwrap_or_default();
            for prop in desc.properties() {
                self.deploy.properties.insert(
                    join_path(&path, &prop.name),
                    ElProperty {
                        column: format!("{}.{}{}", alias, prefix, prop.db_column),
                        sql_type: prop.sql_type.clone(),
                        node: idx,
                    },
                );
            }
            return Ok(());
        }

        for (owner, position) in hierarchy_properties(map, &desc)? {
            let prop = &owner.properties()[position];
            let prop_path = join_path(&path, &prop.name);
            match &prop.kind {
                PropertyKind::Scalar => {
                    let table_alias = prop
                        .table_join
                        .map_or_else(|| alias.clone(), |j| TableJoin::alias(&alias, j));
                    self.deploy.properties.insert(
                        prop_path,
                        ElProperty {
                            column: format!("{}.{}", table_alias, prop.db_column),
                            sql_type: prop.sql_type.clone(),
                            node: idx,
                        },
                    );
                }
                PropertyKind::AssocOne(one) => {
                    let target = map.get(&one.target)?;
                    let id_prefix = match target.id_binder().kind() {
                        IdKind::Embedded { property, .. } => format!("{}.{}", prop_path, property),
                        _ => prop_path.clone(),
                    };
                    for column in &one.imported {
                        self.deploy.foreign_keys.insert(
                            format!("{}.{}", id_prefix, column.target_property),
                            ElProperty {
                                column: format!("{}.{}", alias, column.fk_column),
                                sql_type: column.sql_type.clone(),
                                node: idx,
                            },
                        );
                    }
                    if let [single] = one.imported.as_slice() {
                        self.deploy.properties.insert(
                            prop_path,
                            ElProperty {
                                column: format!("{}.{}", alias, single.fk_column),
                                sql_type: single.sql_type.clone(),
                                node: idx,
                            },
                        );
                    }
                }
                PropertyKind::AssocMany(_) | PropertyKind::Embedded(_) => {}
            }
        }
        Ok(())
    }

    /// Node of `path`, adding nodes below the expanded tree when needed.
    ///
    /// Paths the automatic expansion stopped short of (type cycles) are added
    /// on demand; a path deeper than the maximum join depth is an error.
    pub fn ensure_path(&mut self, map: &DescriptorMap, path: &str) -> Result<usize> {
        if let Some(&idx) = self.by_path.get(path) {
            return Ok(idx);
        }
        let (parent_path, name) = split_path(path);
        let parent = self.ensure_path(map, parent_path)?;
        if self.nodes[parent].kind == NodeKind::Embedded {
            return Err(Error::mapping_property(
                &self.root_type,
                path,
                "embedded beans have no associations",
            ));
        }
        let desc = Arc::clone(&self.nodes[parent].descriptor);
        let resolved = find_property(map, &desc, name)?;
        let props = hierarchy_properties(map, &desc)?;
        let locals = local_aliases_for(&props);
        match self.add_child(map, parent, &resolved.owner, resolved.position, &locals)? {
            Some(idx) => {
                self.check_aliases()?;
                self.index_node(map, idx)?;
                Ok(idx)
            }
            None => Err(self.depth_error(path)),
        }
    }

    /// Resolve a property path to its column, extending the tree if needed.
    pub fn resolve_property(&mut self, map: &DescriptorMap, path: &str) -> Result<ElProperty> {
        if let Some(prop) = self.deploy.get(path) {
            return Ok(prop.clone());
        }
        let (parent, _) = split_path(path);
        if !parent.is_empty() {
            self.ensure_path(map, parent)?;
            if let Some(prop) = self.deploy.get(path) {
                return Ok(prop.clone());
            }
        }
        Err(Error::mapping_property(
            &self.root_type,
            path,
            "property path does not resolve to a column",
        ))
    }

    /// Mark a node, and every ancestor, as fetched.
    pub fn mark_fetched(&mut self, idx: usize) {
        let mut current = Some(idx);
        while let Some(i) = current {
            self.nodes[i].fetched = true;
            current = self.nodes[i].parent;
        }
    }

    /// Mark a node, and every ancestor, as joined for restriction or ordering.
    pub fn mark_where_joined(&mut self, idx: usize) {
        let mut current = Some(idx);
        while let Some(i) = current {
            self.nodes[i].where_joined = true;
            current = self.nodes[i].parent;
        }
    }

    /// Whether reaching `idx` crosses a to-many association that is not fetched.
    pub fn crosses_unfetched_many(&self, idx: usize) -> bool {
        let mut current = Some(idx);
        while let Some(i) = current {
            let node = &self.nodes[i];
            if node.kind == NodeKind::List && !node.fetched {
                return true;
            }
            current = node.parent;
        }
        false
    }

    pub fn root_type(&self) -> &str {
        &self.root_type
    }

    pub fn root(&self) -> &JoinNode {
        &self.nodes[0]
    }

    pub fn node(&self, idx: usize) -> &JoinNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[JoinNode] {
        &self.nodes
    }

    pub fn find(&self, path: &str) -> Option<usize> {
        self.by_path.get(path).copied()
    }

    pub fn deploy_map(&self) -> &PropertyDeployMap {
        &self.deploy
    }

    pub fn limits(&self) -> TreeLimits {
        self.limits
    }

    /// Whether expansion stopped at the maximum depth somewhere.
    pub fn depth_exceeded(&self) -> bool {
        self.depth_exceeded
    }

    /// `from` clause over the included nodes, pre-order.
    pub fn from_clause(&self) -> Result<String> {
        let root = &self.nodes[0];
        let mut sql = format!("from {} {}", root.descriptor.table()?, root.alias);
        append_table_joins(root, &mut sql);
        for &child in &root.children {
            self.append_join(child, &mut sql)?;
        }
        Ok(sql)
    }

    fn append_join(&self, idx: usize, sql: &mut String) -> Result<()> {
        let node = &self.nodes[idx];
        if !node.is_included() {
            return Ok(());
        }
        if let (Some(parent), true) = (node.parent, node.kind != NodeKind::Embedded) {
            let parent = &self.nodes[parent];
            let mut on = join_columns(node, parent);
            if let Some(extra) = node.property().and_then(association_extra_where) {
                on.push(extra.replace("${ta}", &node.alias));
            }
            if node.outer {
                on.extend(type_restrictions(node));
            }
            let _ = write!(
                sql,
                " {} {} {} on {}",
                if node.outer { "left join" } else { "join" },
                node.descriptor.table()?,
                node.alias,
                on.join(" and ")
            );
            append_table_joins(node, sql);
        }
        for &child in &node.children {
            self.append_join(child, sql)?;
        }
        Ok(())
    }

    /// Type restrictions of inner joined nodes: discriminator below the
    /// hierarchy root, then descriptor extra where, root first.
    pub fn where_fragments(&self) -> Vec<String> {
        let mut parts = Vec::new();
        self.collect_where(0, &mut parts);
        parts
    }

    fn collect_where(&self, idx: usize, parts: &mut Vec<String>) {
        let node = &self.nodes[idx];
        if !node.is_included() {
            return;
        }
        if node.kind != NodeKind::Embedded && !node.outer {
            parts.extend(type_restrictions(node));
        }
        for &child in &node.children {
            self.collect_where(child, parts);
        }
    }

    /// Readable rendering of the tree for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_node(0, 0, &mut out);
        out
    }

    fn dump_node(&self, idx: usize, indent: usize, out: &mut String) {
        let node = &self.nodes[idx];
        let _ = writeln!(
            out,
            "{:width$}{:?} {} {} as {} (join depth {})",
            "",
            node.kind,
            if node.path.is_empty() { "<root>" } else { &node.path },
            node.descriptor.name(),
            node.alias,
            node.join_depth,
            width = indent * 2
        );
        for &child in &node.children {
            self.dump_node(child, indent + 1, out);
        }
    }
}

fn association_extra_where(prop: &BeanProperty) -> Option<&str> {
    match &prop.kind {
        PropertyKind::AssocOne(one) => one.extra_where.as_deref(),
        PropertyKind::AssocMany(many) => many.extra_where.as_deref(),
        _ => None,
    }
}

fn join_columns(node: &JoinNode, parent: &JoinNode) -> Vec<String> {
    let Some(prop) = node.property() else {
        return Vec::new();
    };
    match &prop.kind {
        PropertyKind::AssocOne(one) => one
            .imported
            .iter()
            .map(|c| {
                format!(
                    "{}.{}={}.{}",
                    node.alias, c.target_column, parent.alias, c.fk_column
                )
            })
            .collect(),
        PropertyKind::AssocMany(many) => many
            .fk_columns
            .iter()
            .zip(parent.descriptor.id_binder().columns())
            .map(|(fk, id)| format!("{}.{}={}.{}", node.alias, fk, parent.alias, id.column))
            .collect(),
        _ => Vec::new(),
    }
}

fn append_table_joins(node: &JoinNode, sql: &mut String) {
    for (i, join) in node.descriptor.table_joins().iter().enumerate() {
        let alias = TableJoin::alias(&node.alias, i);
        let _ = write!(
            sql,
            " {} {} {} on {}.{}={}.{}",
            if join.outer { "left join" } else { "join" },
            join.table,
            alias,
            alias,
            join.foreign_column,
            node.alias,
            join.local_column
        );
    }
}

fn type_restrictions(node: &JoinNode) -> Vec<String> {
    let mut out = Vec::new();
    let desc = &node.descriptor;
    if let Some(inherit) = desc.inheritance() {
        if inherit.parent.is_some() {
            let values: Vec<String> = inherit
                .hierarchy_values
                .iter()
                .map(|v| format!("'{}'", v.replace('\'', "''")))
                .collect();
            out.push(format!(
                "{}.{} in ({})",
                node.alias,
                inherit.discriminator_column,
                values.join(",")
            ));
        }
    }
    if let Some(extra) = desc.extra_where() {
        out.push(extra.replace("${ta}", &node.alias));
    }
    out
}
