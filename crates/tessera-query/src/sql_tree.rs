//! Read-time mirror of a join tree.
//!
//! A [`SqlTree`] owns, per fetched node, the properties read at that node and
//! its fetched children, in exactly the order their columns were appended to
//! the select list: discriminator, id, base columns, secondary table columns,
//! then each child. Rows are consumed positionally; no column is ever looked
//! up by name.

use crate::detail::OrmQueryDetail;
use crate::join_tree::{JoinTree, NodeKind, hierarchy_properties};
use std::collections::HashSet;
use std::sync::Arc;
use tessera_core::deploy::TableJoin;
use tessera_core::{
    Bean, BeanDescriptor, BeanList, BeanRef, BeanState, DataReader, DescriptorMap, Error, IdValue,
    PropertyKind, PropertyValue, Result, Row, RowReader, SqlType, read_bean, write_bean,
};

/// Callbacks through which rows become beans.
///
/// Implemented by the unit of work: it decides identity (one instance per
/// type and id), how foreign keys become reference beans and how unloaded
/// to-many properties are deferred.
pub trait RowLoadContext {
    fn descriptors(&self) -> &DescriptorMap;

    /// Instance for a row of `desc` with key `id` (`None` for types without id).
    fn bean_for_row(
        &mut self,
        desc: &Arc<BeanDescriptor>,
        id: Option<IdValue>,
        path: &str,
    ) -> Result<BeanRef>;

    /// Instance standing for a foreign key value read at `path`.
    fn reference(&mut self, desc: &Arc<BeanDescriptor>, id: IdValue, path: &str) -> Result<BeanRef>;

    /// Value of an unloaded to-many property at `path` of `owner`.
    fn defer_many(&mut self, owner: &BeanRef, path: &str, position: usize) -> Result<BeanList>;
}

/// One property read at a node.
#[derive(Debug, Clone)]
pub enum ReadProperty {
    Scalar {
        owner: Arc<BeanDescriptor>,
        position: usize,
        column: String,
        sql_type: SqlType,
    },
    /// Foreign key columns of an unfetched to-one.
    ForeignKey {
        owner: Arc<BeanDescriptor>,
        position: usize,
        columns: Vec<String>,
        target: Arc<BeanDescriptor>,
        path: String,
    },
    /// Unfetched to-many; reads no column.
    Many {
        owner: Arc<BeanDescriptor>,
        position: usize,
        path: String,
    },
}

impl ReadProperty {
    pub fn column_count(&self) -> usize {
        match self {
            ReadProperty::Scalar { .. } => 1,
            ReadProperty::ForeignKey { columns, .. } => columns.len(),
            ReadProperty::Many { .. } => 0,
        }
    }

    fn append_select(&self, out: &mut Vec<String>) {
        match self {
            ReadProperty::Scalar { column, .. } => out.push(column.clone()),
            ReadProperty::ForeignKey { columns, .. } => out.extend(columns.iter().cloned()),
            ReadProperty::Many { .. } => {}
        }
    }
}

#[derive(Debug, Default)]
struct ReadState {
    /// (bean, position) lists seen in this result set
    initialized: HashSet<(usize, usize)>,
    /// lists this result set populates
    collecting: HashSet<(usize, usize)>,
}

fn bean_key(bean: &BeanRef) -> usize {
    Arc::as_ptr(bean) as usize
}

fn applies(owner: &BeanDescriptor, concrete: &BeanDescriptor) -> bool {
    owner.is_assignable_from(concrete.name())
}

/// One fetched node.
#[derive(Debug, Clone)]
pub struct SqlTreeNode {
    kind: NodeKind,
    path: String,
    owner: Option<Arc<BeanDescriptor>>,
    position: Option<usize>,
    descriptor: Arc<BeanDescriptor>,
    alias: String,
    discriminator: Option<String>,
    properties: Vec<ReadProperty>,
    children: Vec<SqlTreeNode>,
    read_only: bool,
}

impl SqlTreeNode {
    fn build(
        map: &DescriptorMap,
        tree: &JoinTree,
        idx: usize,
        detail: &OrmQueryDetail,
    ) -> Result<Self> {
        let node = tree.node(idx);
        let desc = &node.descriptor;
        let selection = detail.get(&node.path);
        let includes = |name: &str| selection.is_none_or(|s| s.includes(name));

        let mut base = Vec::new();
        let mut joined = Vec::new();
        let mut children = Vec::new();
        for (owner, position) in hierarchy_properties(map, desc)? {
            let prop = &owner.properties()[position];
            if prop.id {
                continue;
            }
            let child_path = if node.path.is_empty() {
                prop.name.clone()
            } else {
                format!("{}.{}", node.path, prop.name)
            };
            let fetched_child = tree.find(&child_path).filter(|&c| tree.node(c).fetched);
            if !(prop.version || fetched_child.is_some() || includes(&prop.name)) {
                continue;
            }
            match &prop.kind {
                PropertyKind::Scalar => {
                    let table_alias = prop
                        .table_join
                        .map_or_else(|| node.alias.clone(), |j| TableJoin::alias(&node.alias, j));
                    let read = ReadProperty::Scalar {
                        owner: Arc::clone(&owner),
                        position,
                        column: format!("{}.{}", table_alias, prop.db_column),
                        sql_type: prop.sql_type.clone(),
                    };
                    if prop.table_join.is_some() {
                        joined.push(read);
                    } else {
                        base.push(read);
                    }
                }
                PropertyKind::AssocOne(one) => match fetched_child {
                    Some(child) => children.push(Self::build(map, tree, child, detail)?),
                    None => base.push(ReadProperty::ForeignKey {
                        owner: Arc::clone(&owner),
                        position,
                        columns: one
                            .imported
                            .iter()
                            .map(|c| format!("{}.{}", node.alias, c.fk_column))
                            .collect(),
                        target: Arc::clone(map.get(&one.target)?),
                        path: child_path,
                    }),
                },
                PropertyKind::AssocMany(_) => match fetched_child {
                    Some(child) => children.push(Self::build(map, tree, child, detail)?),
                    None => base.push(ReadProperty::Many {
                        owner: Arc::clone(&owner),
                        position,
                        path: child_path,
                    }),
                },
                PropertyKind::Embedded(info) => {
                    let embeddable = info.descriptor.clone().ok_or_else(|| {
                        Error::mapping_property(owner.name(), &prop.name, "embeddable not resolved")
                    })?;
                    let properties = embeddable
                        .properties()
                        .iter()
                        .map(|p| ReadProperty::Scalar {
                            owner: Arc::clone(&embeddable),
                            position: p.position(),
                            column: format!("{}.{}{}", node.alias, info.column_prefix, p.db_column),
                            sql_type: p.sql_type.clone(),
                        })
                        .collect();
                    children.push(Self {
                        kind: NodeKind::Embedded,
                        path: child_path,
                        owner: Some(Arc::clone(&owner)),
                        position: Some(position),
                        descriptor: embeddable,
                        alias: node.alias.clone(),
                        discriminator: None,
                        properties,
                        children: Vec::new(),
                        read_only: false,
                    });
                }
            }
        }
        base.extend(joined);

        Ok(Self {
            kind: node.kind,
            path: node.path.clone(),
            owner: node.owner.clone(),
            position: node.position,
            descriptor: Arc::clone(desc),
            alias: node.alias.clone(),
            discriminator: desc
                .inheritance()
                .map(|i| format!("{}.{}", node.alias, i.discriminator_column)),
            properties: base,
            children,
            read_only: selection.is_some_and(|s| s.is_read_only()),
        })
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn descriptor(&self) -> &Arc<BeanDescriptor> {
        &self.descriptor
    }

    pub fn properties(&self) -> &[ReadProperty] {
        &self.properties
    }

    pub fn children(&self) -> &[SqlTreeNode] {
        &self.children
    }

    fn append_select(&self, out: &mut Vec<String>) {
        if let Some(column) = &self.discriminator {
            out.push(column.clone());
        }
        if self.kind != NodeKind::Embedded {
            self.descriptor.id_binder().append_select(&self.alias, out);
        }
        for prop in &self.properties {
            prop.append_select(out);
        }
        for child in &self.children {
            child.append_select(out);
        }
    }

    fn id_column_count(&self) -> usize {
        if self.kind == NodeKind::Embedded {
            0
        } else {
            self.descriptor.id_binder().columns().len()
        }
    }

    fn columns_after_id(&self) -> usize {
        self.properties
            .iter()
            .map(ReadProperty::column_count)
            .sum::<usize>()
            + self.children.iter().map(Self::total_columns).sum::<usize>()
    }

    /// Columns this node and its children occupy in a row.
    pub fn total_columns(&self) -> usize {
        usize::from(self.discriminator.is_some()) + self.id_column_count() + self.columns_after_id()
    }

    fn read_embedded(&self, reader: &mut dyn DataReader) -> Result<PropertyValue> {
        let mut bean = Bean::for_load(Arc::clone(&self.descriptor));
        let mut present = false;
        for prop in &self.properties {
            if let ReadProperty::Scalar {
                position, sql_type, ..
            } = prop
            {
                let value = reader.get_value()?.coerce_to(sql_type)?;
                present |= !value.is_null();
                bean.load_value(*position, PropertyValue::Scalar(value));
            }
        }
        Ok(PropertyValue::Embedded(present.then(|| Box::new(bean))))
    }

    fn read_bean(
        &self,
        reader: &mut dyn DataReader,
        ctx: &mut dyn RowLoadContext,
        state: &mut ReadState,
    ) -> Result<Option<BeanRef>> {
        let binder = self.descriptor.id_binder();
        let concrete = match &self.discriminator {
            Some(_) => match reader.get_string()? {
                Some(value) => Arc::clone(ctx.descriptors().concrete(&self.descriptor, &value)?),
                None => {
                    reader.skip(self.id_column_count() + self.columns_after_id())?;
                    return Ok(None);
                }
            },
            None => Arc::clone(&self.descriptor),
        };
        let id = binder.read(reader)?;
        if id.is_none() && !binder.is_empty() {
            // outer join found no row
            reader.skip(self.columns_after_id())?;
            return Ok(None);
        }

        let bean = ctx.bean_for_row(&concrete, id.clone(), &self.path)?;
        let (loaded, fresh) = {
            let b = read_bean(&bean);
            let loaded = b.intercept().loaded().clone();
            let fresh = b.state() == BeanState::Reference || loaded.count() == 0;
            (loaded, fresh)
        };

        let mut updates: Vec<(usize, PropertyValue)> = Vec::new();
        for prop in &self.properties {
            match prop {
                ReadProperty::Scalar {
                    owner,
                    position,
                    sql_type,
                    ..
                } => {
                    let value = reader.get_value()?.coerce_to(sql_type)?;
                    if applies(owner, &concrete) && !loaded.is_set(*position) {
                        updates.push((*position, PropertyValue::Scalar(value)));
                    }
                }
                ReadProperty::ForeignKey {
                    owner,
                    position,
                    target,
                    path,
                    ..
                } => {
                    let target_id = target.id_binder().read(reader)?;
                    if applies(owner, &concrete) && !loaded.is_set(*position) {
                        let value = match target_id {
                            Some(target_id) => Some(ctx.reference(target, target_id, path)?),
                            None => None,
                        };
                        updates.push((*position, PropertyValue::One(value)));
                    }
                }
                ReadProperty::Many {
                    owner,
                    position,
                    path,
                } => {
                    if applies(owner, &concrete) && !loaded.is_set(*position) {
                        let deferred = ctx.defer_many(&bean, path, *position)?;
                        updates.push((*position, PropertyValue::Many(deferred)));
                    }
                }
            }
        }

        let mut members: Vec<(usize, Option<BeanRef>)> = Vec::new();
        for child in &self.children {
            let applicable = child.owner.as_ref().is_none_or(|o| applies(o, &concrete));
            let Some(position) = child.position else {
                continue;
            };
            match child.kind {
                NodeKind::Embedded => {
                    let value = child.read_embedded(reader)?;
                    if applicable && !loaded.is_set(position) {
                        updates.push((position, value));
                    }
                }
                NodeKind::Bean => {
                    let value = child.read_bean(reader, ctx, state)?;
                    if applicable && !loaded.is_set(position) {
                        updates.push((position, PropertyValue::One(value)));
                    }
                }
                NodeKind::List => {
                    let member = child.read_bean(reader, ctx, state)?;
                    if applicable {
                        members.push((position, member));
                    }
                }
                NodeKind::Root => {}
            }
        }

        {
            let mut b = write_bean(&bean);
            if let Some(id) = &id {
                if b.id().is_none() {
                    binder.convert_set_id(id, Some(&mut *b))?;
                }
            }
            for (position, value) in updates {
                b.load_value(position, value);
            }
            for (position, member) in members {
                let key = (bean_key(&bean), position);
                if state.initialized.insert(key) {
                    let replace = !b.is_loaded(position)
                        || matches!(
                            b.value_at(position),
                            Some(PropertyValue::Many(BeanList::Deferred(_)))
                        );
                    if replace {
                        b.load_value(position, PropertyValue::Many(BeanList::Loaded(Vec::new())));
                        state.collecting.insert(key);
                    }
                }
                if let (true, Some(member)) = (state.collecting.contains(&key), member) {
                    b.append_loaded(position, member);
                }
            }
            if b.state() == BeanState::Reference {
                b.mark_loaded();
            }
            if self.read_only && fresh {
                b.set_read_only(true);
            }
        }
        Ok(Some(bean))
    }
}

/// Select list and row reader of a compiled query.
#[derive(Debug, Clone)]
pub struct SqlTree {
    root: SqlTreeNode,
    select: Vec<String>,
}

impl SqlTree {
    /// Build from the fetched nodes of `tree`.
    pub fn build(map: &DescriptorMap, tree: &JoinTree, detail: &OrmQueryDetail) -> Result<Self> {
        let root = SqlTreeNode::build(map, tree, 0, detail)?;
        let mut select = Vec::new();
        root.append_select(&mut select);
        Ok(Self { root, select })
    }

    pub fn root(&self) -> &SqlTreeNode {
        &self.root
    }

    /// Select list, alias qualified, in read order.
    pub fn select_columns(&self) -> &[String] {
        &self.select
    }

    /// Materialize rows into beans; returns distinct root beans in row order.
    pub fn read_rows(&self, rows: &[Row], ctx: &mut dyn RowLoadContext) -> Result<Vec<BeanRef>> {
        let mut state = ReadState::default();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for row in rows {
            let mut reader = RowReader::new(row);
            if let Some(bean) = self.root.read_bean(&mut reader, ctx, &mut state)? {
                if seen.insert(bean_key(&bean)) {
                    out.push(bean);
                }
            }
        }
        tracing::trace!(rows = rows.len(), beans = out.len(), "Rows materialized");
        Ok(out)
    }
}
