//! Query compilation: detail + join tree -> SQL text and row reader.

use crate::detail::{FetchMode, OrmQueryDetail, SecondaryJoin, find_property, split_path};
use crate::join_tree::{JoinTree, NodeKind};
use crate::plan::QueryPlan;
use crate::predicate::PathResolver;
use crate::query::Query;
use crate::sql_tree::SqlTree;
use std::sync::Arc;
use tessera_core::{ConfigError, DescriptorMap, Dialect, Error, PropertyKind, Result};

/// Resolves predicate and ordering paths against a per-query join tree,
/// marking every node it touches as joined.
struct TreeResolver<'a> {
    map: &'a DescriptorMap,
    tree: &'a mut JoinTree,
    root_alias: String,
}

impl TreeResolver<'_> {
    fn join_node(&mut self, idx: usize, path: &str) -> Result<()> {
        if self.tree.crosses_unfetched_many(idx) {
            return Err(Error::mapping_property(
                self.tree.root_type(),
                path,
                "restriction crosses a to-many association that is not fetch joined",
            ));
        }
        self.tree.mark_where_joined(idx);
        Ok(())
    }
}

impl PathResolver for TreeResolver<'_> {
    fn column(&mut self, path: &str) -> Result<String> {
        let prop = self.tree.resolve_property(self.map, path)?;
        self.join_node(prop.node, path)?;
        Ok(prop.column)
    }

    fn id_columns(&mut self, path: &str) -> Result<Vec<String>> {
        if path.is_empty() {
            let root = self.tree.root();
            return Ok(root
                .descriptor
                .id_binder()
                .columns()
                .iter()
                .map(|c| format!("{}.{}", root.alias, c.column))
                .collect());
        }
        let (parent_path, name) = split_path(path);
        let parent = self.tree.ensure_path(self.map, parent_path)?;
        self.join_node(parent, path)?;
        let node = self.tree.node(parent);
        let resolved = find_property(self.map, &node.descriptor, name)?;
        match &resolved.property().kind {
            PropertyKind::AssocOne(one) => Ok(one
                .imported
                .iter()
                .map(|c| format!("{}.{}", node.alias, c.fk_column))
                .collect()),
            _ => Err(Error::mapping_property(
                self.tree.root_type(),
                path,
                "id restriction needs a to-one association",
            )),
        }
    }

    fn root_alias(&self) -> &str {
        &self.root_alias
    }
}

fn parse_order_by(
    resolver: &mut TreeResolver<'_>,
    prefix: &str,
    clause: &str,
    out: &mut Vec<String>,
) -> Result<()> {
    for term in clause.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let mut parts = term.split_whitespace();
        let path = parts.next().unwrap_or_default();
        let direction = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            None | Some("asc") => "",
            Some("desc") => " desc",
            Some(other) => {
                return Err(Error::Config(ConfigError {
                    message: format!("invalid order direction '{}' in '{}'", other, clause),
                    source: None,
                }));
            }
        };
        let full = if prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}.{}", prefix, path)
        };
        let column = resolver.column(&full)?;
        let rendered = format!("{}{}", column, direction);
        if !out.iter().any(|o| o == &rendered) {
            out.push(rendered);
        }
    }
    Ok(())
}

/// Compile `query` against a clone of the root type's deploy tree.
#[tracing::instrument(level = "debug", skip_all, fields(entity = %query.entity()))]
pub(crate) fn compile(
    map: &DescriptorMap,
    deploy: &JoinTree,
    query: &Query,
    dialect: Dialect,
    key: u64,
) -> Result<QueryPlan> {
    let root = Arc::clone(map.get(query.entity())?);
    let mut detail: OrmQueryDetail = query.detail().clone();
    detail.convert_many_fetch_joins(map, &root, query.max_rows().is_some())?;
    let secondary: Vec<SecondaryJoin> = detail.remove_secondary_joins();

    let mut tree = deploy.clone();
    let mut depth_exceeded = tree.depth_exceeded();
    let joins: Vec<String> = detail
        .joins()
        .filter(|j| j.fetch().mode == FetchMode::Join)
        .map(|j| j.path().to_string())
        .collect();
    for path in joins {
        match tree.ensure_path(map, &path) {
            Ok(idx) => tree.mark_fetched(idx),
            Err(Error::MaxJoinDepth(e)) if !tree.limits().fail_on_max_depth => {
                tracing::warn!(
                    root = %e.root,
                    path = %e.path,
                    max_depth = e.max_depth,
                    "Fetch join beyond maximum join depth dropped"
                );
                depth_exceeded = true;
            }
            Err(e) => return Err(e),
        }
    }

    let root_alias = tree.root().alias.clone();
    let mut resolver = TreeResolver {
        map,
        tree: &mut tree,
        root_alias: root_alias.clone(),
    };

    let mut where_sql = String::new();
    let mut bind_count = 0;
    if let Some(predicate) = query.predicate() {
        bind_count = predicate.append_sql(&mut resolver, &mut where_sql)?;
    }

    let mut order = Vec::new();
    if let Some(clause) = query.order_by_clause() {
        parse_order_by(&mut resolver, "", clause, &mut order)?;
    }
    let fetched_list = resolver
        .tree
        .nodes()
        .iter()
        .find(|n| n.kind == NodeKind::List && n.fetched)
        .map(|n| (n.path.clone(), n.property().and_then(|p| p.assoc_many()).and_then(|m| m.order_by.clone())));
    if let Some((list_path, list_order)) = fetched_list {
        // rows of one root must stay adjacent
        if let Some(id_order) = root.id_binder().default_order_by(&root_alias) {
            for column in id_order.split(", ") {
                if !order.iter().any(|o| o.split_whitespace().next() == Some(column)) {
                    order.push(column.to_string());
                }
            }
        }
        if let Some(list_order) = list_order {
            parse_order_by(&mut resolver, &list_path, &list_order, &mut order)?;
        }
    }

    let sql_tree = SqlTree::build(map, &tree, &detail)?;
    let mut fragments = Vec::new();
    if !where_sql.is_empty() {
        fragments.push(where_sql);
    }
    fragments.extend(tree.where_fragments());

    let mut sql = String::from("select ");
    if query.is_distinct() {
        sql.push_str("distinct ");
    }
    sql.push_str(&sql_tree.select_columns().join(", "));
    sql.push(' ');
    sql.push_str(&tree.from_clause()?);
    if !fragments.is_empty() {
        sql.push_str(" where ");
        sql.push_str(&fragments.join(" and "));
    }
    if !order.is_empty() {
        sql.push_str(" order by ");
        sql.push_str(&order.join(", "));
    }
    dialect.append_limit(&mut sql, query.max_rows(), query.first_row());

    tracing::debug!(sql = %sql, secondary = secondary.len(), "Compiled query plan");
    Ok(QueryPlan {
        key,
        entity: query.entity().to_string(),
        sql,
        tree: sql_tree,
        secondary,
        bind_count,
        depth_exceeded: depth_exceeded || tree.depth_exceeded(),
    })
}
