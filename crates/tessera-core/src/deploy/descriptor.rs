//! Entity type descriptors and the map they are built into.

use super::id_binder::IdBinder;
use super::property::{BeanProperty, ImportedColumn, PropertyKind};
use crate::Result;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// How the id of a new bean is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdGeneration {
    /// The application assigns the id before insert.
    #[default]
    Assigned,
    /// The database generates the id (identity/auto-increment column).
    Identity,
}

/// A secondary table joined one-to-one onto the base table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableJoin {
    /// Joined table name
    pub table: String,
    /// Column on the base table
    pub local_column: String,
    /// Column on the joined table
    pub foreign_column: String,
    /// Left outer join instead of inner join
    pub outer: bool,
}

impl TableJoin {
    /// Alias of this join below a node aliased `alias`.
    pub fn alias(alias: &str, index: usize) -> String {
        format!("{}_j{}", alias, index)
    }
}

/// Single-table inheritance information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritInfo {
    /// Name of the hierarchy root type
    pub root: String,
    /// Direct parent type, `None` at the root
    pub parent: Option<String>,
    /// Discriminator column shared by the hierarchy
    pub discriminator_column: String,
    /// Discriminator value of this type
    pub discriminator_value: String,
    /// All (transitive) subtypes
    pub descendants: Vec<String>,
    /// Discriminator values of this type and every descendant
    pub hierarchy_values: Vec<String>,
}

/// Immutable metadata for one mapped entity (or embeddable) type.
#[derive(Debug)]
pub struct BeanDescriptor {
    name: String,
    base_table: Option<String>,
    alias: String,
    properties: Vec<BeanProperty>,
    id_binder: IdBinder,
    version: Option<usize>,
    id_generation: IdGeneration,
    inheritance: Option<InheritInfo>,
    table_joins: Vec<TableJoin>,
    extra_where: Option<String>,
    embeddable: bool,
}

impl BeanDescriptor {
    /// Start declaring an entity type.
    pub fn builder(name: &str) -> DescriptorBuilder {
        DescriptorBuilder::new(name)
    }

    /// Logical type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base table, `None` for embeddables.
    pub fn base_table(&self) -> Option<&str> {
        self.base_table.as_deref()
    }

    /// Base table, failing for embeddables.
    pub fn table(&self) -> Result<&str> {
        self.base_table
            .as_deref()
            .ok_or_else(|| Error::mapping(&self.name, "embeddable type has no table"))
    }

    /// Root table alias.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Properties in declaration order (parent properties first for subtypes).
    pub fn properties(&self) -> &[BeanProperty] {
        &self.properties
    }

    /// Property at a position.
    pub fn property_at(&self, position: usize) -> Option<&BeanProperty> {
        self.properties.get(position)
    }

    /// Look up a property by name.
    pub fn property(&self, name: &str) -> Option<&BeanProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Look up a property by name, failing with a mapping error.
    pub fn require_property(&self, name: &str) -> Result<&BeanProperty> {
        self.property(name)
            .ok_or_else(|| Error::mapping_property(&self.name, name, "unknown property"))
    }

    /// Position of a property by name.
    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn id_binder(&self) -> &IdBinder {
        &self.id_binder
    }

    /// The version property, if the type has one.
    pub fn version_property(&self) -> Option<&BeanProperty> {
        self.version.and_then(|idx| self.properties.get(idx))
    }

    pub fn id_generation(&self) -> IdGeneration {
        self.id_generation
    }

    pub fn inheritance(&self) -> Option<&InheritInfo> {
        self.inheritance.as_ref()
    }

    /// Whether this type is the root of an inheritance hierarchy (or has none).
    pub fn is_hierarchy_root(&self) -> bool {
        self.inheritance.as_ref().is_none_or(|i| i.parent.is_none())
    }

    /// Name used to scope identity: the hierarchy root, or the type itself.
    pub fn root_name(&self) -> &str {
        self.inheritance.as_ref().map_or(&self.name, |i| &i.root)
    }

    pub fn table_joins(&self) -> &[TableJoin] {
        &self.table_joins
    }

    /// Restriction added wherever this type is queried, `${ta}` being its alias.
    pub fn extra_where(&self) -> Option<&str> {
        self.extra_where.as_deref()
    }

    pub fn is_embeddable(&self) -> bool {
        self.embeddable
    }

    /// Whether `name` is this type or one of its subtypes.
    pub fn is_assignable_from(&self, name: &str) -> bool {
        self.name == name
            || self
                .inheritance
                .as_ref()
                .is_some_and(|i| i.descendants.iter().any(|d| d == name))
    }
}

/// Declaration of an entity or embeddable type.
///
/// ```rust,ignore
/// let order = BeanDescriptor::builder("Order")
///     .table("orders")
///     .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
///     .property(BeanProperty::scalar("status", "status", SqlType::VarChar(20)))
///     .property(BeanProperty::one("customer", "Customer"));
/// ```
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    name: String,
    table: Option<String>,
    alias: Option<String>,
    properties: Vec<BeanProperty>,
    embeddable: bool,
    discriminator: Option<(String, String)>,
    extends: Option<(String, String)>,
    table_joins: Vec<TableJoin>,
    extra_where: Option<String>,
    id_generation: IdGeneration,
}

impl DescriptorBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table: None,
            alias: None,
            properties: Vec::new(),
            embeddable: false,
            discriminator: None,
            extends: None,
            table_joins: Vec::new(),
            extra_where: None,
            id_generation: IdGeneration::Assigned,
        }
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    /// Override the root table alias (default: first letter of the name).
    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn property(mut self, property: BeanProperty) -> Self {
        self.properties.push(property);
        self
    }

    /// Declare this type as embeddable (columns live on the owner's table).
    pub fn embeddable(mut self) -> Self {
        self.embeddable = true;
        self
    }

    /// Make this type the root of a single-table hierarchy.
    pub fn discriminator(mut self, column: &str, value: &str) -> Self {
        self.discriminator = Some((column.to_string(), value.to_string()));
        self
    }

    /// Declare this type as a subtype of `parent` stored in the parent's table.
    pub fn extends(mut self, parent: &str, discriminator_value: &str) -> Self {
        self.extends = Some((parent.to_string(), discriminator_value.to_string()));
        self
    }

    /// Add a secondary table join; reference it from properties by index.
    pub fn table_join(mut self, table: &str, local_column: &str, foreign_column: &str) -> Self {
        self.table_joins.push(TableJoin {
            table: table.to_string(),
            local_column: local_column.to_string(),
            foreign_column: foreign_column.to_string(),
            outer: true,
        });
        self
    }

    pub fn extra_where(mut self, clause: &str) -> Self {
        self.extra_where = Some(clause.to_string());
        self
    }

    pub fn id_generation(mut self, generation: IdGeneration) -> Self {
        self.id_generation = generation;
        self
    }

    fn default_alias(&self) -> String {
        self.name
            .chars()
            .find(char::is_ascii_alphabetic)
            .map_or_else(|| "t".to_string(), |c| c.to_ascii_lowercase().to_string())
    }
}

/// All descriptors of a deployment, keyed by type name.
#[derive(Debug, Default)]
pub struct DescriptorMap {
    descriptors: HashMap<String, Arc<BeanDescriptor>>,
}

impl DescriptorMap {
    /// Build every declared type and resolve cross-type references.
    #[tracing::instrument(level = "debug", skip(builders), fields(types = builders.len()))]
    pub fn build(builders: Vec<DescriptorBuilder>) -> Result<Self> {
        let mut declared: HashMap<String, DescriptorBuilder> = HashMap::new();
        let mut order = Vec::new();
        for builder in builders {
            if declared.contains_key(&builder.name) {
                return Err(Error::mapping(&builder.name, "type declared twice"));
            }
            order.push(builder.name.clone());
            declared.insert(builder.name.clone(), builder);
        }

        // embeddables first; they only hold scalar columns
        let mut embeddables: HashMap<String, Arc<BeanDescriptor>> = HashMap::new();
        for name in &order {
            let builder = &declared[name];
            if builder.embeddable {
                let desc = build_embeddable(builder)?;
                embeddables.insert(name.clone(), Arc::new(desc));
            }
        }

        let mut built: HashMap<String, BeanDescriptor> = HashMap::new();
        let mut remaining: Vec<&String> = order
            .iter()
            .filter(|name| !declared[*name].embeddable)
            .collect();
        while !remaining.is_empty() {
            let before = remaining.len();
            let mut deferred = Vec::new();
            for name in remaining {
                let builder = &declared[name];
                let parent = match &builder.extends {
                    Some((parent, _)) => match built.get(parent) {
                        Some(parent) => Some(parent),
                        None if declared.contains_key(parent) => {
                            deferred.push(name);
                            continue;
                        }
                        None => {
                            return Err(Error::mapping(
                                name,
                                format!("unknown parent type {}", parent),
                            ));
                        }
                    },
                    None => None,
                };
                let desc = build_entity(builder, parent, &embeddables)?;
                built.insert(name.clone(), desc);
            }
            if deferred.len() == before {
                return Err(Error::mapping(
                    deferred[0],
                    "cyclic or embeddable inheritance chain",
                ));
            }
            remaining = deferred;
        }

        link_hierarchies(&mut built);
        resolve_imported(&mut built)?;
        resolve_many(&mut built)?;

        let mut descriptors: HashMap<String, Arc<BeanDescriptor>> = embeddables;
        for (name, desc) in built {
            descriptors.insert(name, Arc::new(desc));
        }
        tracing::debug!(types = descriptors.len(), "Descriptor map built");
        Ok(Self { descriptors })
    }

    /// Look up a type by name.
    pub fn get(&self, name: &str) -> Result<&Arc<BeanDescriptor>> {
        self.descriptors
            .get(name)
            .ok_or_else(|| Error::mapping(name, "unknown entity type"))
    }

    /// The concrete type of a row of `desc`'s hierarchy with discriminator `value`.
    pub fn concrete(&self, desc: &BeanDescriptor, value: &str) -> Result<&Arc<BeanDescriptor>> {
        let Some(inherit) = desc.inheritance() else {
            return self.get(desc.name());
        };
        if inherit.discriminator_value == value {
            return self.get(desc.name());
        }
        for name in &inherit.descendants {
            let sub = self.get(name)?;
            if sub
                .inheritance()
                .is_some_and(|i| i.discriminator_value == value)
            {
                return Ok(sub);
            }
        }
        Err(Error::mapping(
            desc.name(),
            format!("unknown discriminator value '{}'", value),
        ))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// All descriptors, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<BeanDescriptor>> {
        self.descriptors.values()
    }
}

fn build_embeddable(builder: &DescriptorBuilder) -> Result<BeanDescriptor> {
    let mut properties = builder.properties.clone();
    for (position, prop) in properties.iter_mut().enumerate() {
        if !prop.is_scalar() {
            return Err(Error::mapping_property(
                &builder.name,
                &prop.name,
                "embeddable types may only hold scalar properties",
            ));
        }
        prop.position = position;
    }
    Ok(BeanDescriptor {
        name: builder.name.clone(),
        base_table: None,
        alias: builder.alias.clone().unwrap_or_else(|| builder.default_alias()),
        properties,
        id_binder: IdBinder::empty(&builder.name),
        version: None,
        id_generation: IdGeneration::Assigned,
        inheritance: None,
        table_joins: Vec::new(),
        extra_where: None,
        embeddable: true,
    })
}

fn build_entity(
    builder: &DescriptorBuilder,
    parent: Option<&BeanDescriptor>,
    embeddables: &HashMap<String, Arc<BeanDescriptor>>,
) -> Result<BeanDescriptor> {
    let mut properties = parent.map(|p| p.properties.clone()).unwrap_or_default();
    for prop in &builder.properties {
        if properties.iter().any(|p| p.name == prop.name) {
            return Err(Error::mapping_property(
                &builder.name,
                &prop.name,
                "property declared twice",
            ));
        }
        properties.push(prop.clone());
    }

    let mut table_joins = parent.map(|p| p.table_joins.clone()).unwrap_or_default();
    table_joins.extend(builder.table_joins.iter().cloned());

    for (position, prop) in properties.iter_mut().enumerate() {
        prop.position = position;
        if let Some(join) = prop.table_join {
            if join >= table_joins.len() {
                return Err(Error::mapping_property(
                    &builder.name,
                    &prop.name,
                    "table join index out of range",
                ));
            }
        }
        if let PropertyKind::Embedded(info) = &mut prop.kind {
            let embeddable = embeddables.get(&info.target).ok_or_else(|| {
                Error::mapping_property(
                    &builder.name,
                    &prop.name,
                    format!("{} is not an embeddable type", info.target),
                )
            })?;
            info.descriptor = Some(Arc::clone(embeddable));
        }
    }

    let inheritance = match (&builder.extends, &builder.discriminator, parent) {
        (Some((parent_name, value)), _, Some(parent)) => {
            let parent_inherit = parent.inheritance.as_ref().ok_or_else(|| {
                Error::mapping(
                    &builder.name,
                    format!("parent {} declares no discriminator", parent_name),
                )
            })?;
            Some(InheritInfo {
                root: parent_inherit.root.clone(),
                parent: Some(parent_name.clone()),
                discriminator_column: parent_inherit.discriminator_column.clone(),
                discriminator_value: value.clone(),
                descendants: Vec::new(),
                hierarchy_values: Vec::new(),
            })
        }
        (None, Some((column, value)), _) => Some(InheritInfo {
            root: builder.name.clone(),
            parent: None,
            discriminator_column: column.clone(),
            discriminator_value: value.clone(),
            descendants: Vec::new(),
            hierarchy_values: Vec::new(),
        }),
        _ => None,
    };

    let base_table = match parent {
        Some(parent) => parent.base_table.clone(),
        None => Some(
            builder
                .table
                .clone()
                .ok_or_else(|| Error::mapping(&builder.name, "no table declared"))?,
        ),
    };
    let alias = match parent {
        Some(parent) => parent.alias.clone(),
        None => builder.alias.clone().unwrap_or_else(|| builder.default_alias()),
    };

    let id_binder = IdBinder::from_properties(&builder.name, &properties)?;
    let version = properties.iter().position(|p| p.version);
    let extra_where = builder
        .extra_where
        .clone()
        .or_else(|| parent.and_then(|p| p.extra_where.clone()));

    Ok(BeanDescriptor {
        name: builder.name.clone(),
        base_table,
        alias,
        properties,
        id_binder,
        version,
        id_generation: parent.map_or(builder.id_generation, |p| p.id_generation),
        inheritance,
        table_joins,
        extra_where,
        embeddable: false,
    })
}

fn link_hierarchies(built: &mut HashMap<String, BeanDescriptor>) {
    let links: Vec<(String, Vec<String>)> = built
        .values()
        .map(|desc| {
            let mut ancestors = Vec::new();
            let mut current = desc.inheritance.as_ref().and_then(|i| i.parent.clone());
            while let Some(name) = current {
                current = built
                    .get(&name)
                    .and_then(|d| d.inheritance.as_ref())
                    .and_then(|i| i.parent.clone());
                ancestors.push(name);
            }
            (desc.name.clone(), ancestors)
        })
        .collect();

    for (name, ancestors) in links {
        for ancestor in ancestors {
            if let Some(inherit) = built.get_mut(&ancestor).and_then(|d| d.inheritance.as_mut()) {
                inherit.descendants.push(name.clone());
            }
        }
    }

    let values: HashMap<String, String> = built
        .values()
        .filter_map(|d| {
            d.inheritance
                .as_ref()
                .map(|i| (d.name.clone(), i.discriminator_value.clone()))
        })
        .collect();
    for desc in built.values_mut() {
        if let Some(inherit) = desc.inheritance.as_mut() {
            inherit.descendants.sort();
            let mut hierarchy = vec![inherit.discriminator_value.clone()];
            hierarchy.extend(
                inherit
                    .descendants
                    .iter()
                    .filter_map(|d| values.get(d).cloned()),
            );
            inherit.hierarchy_values = hierarchy;
        }
    }
}

fn resolve_imported(built: &mut HashMap<String, BeanDescriptor>) -> Result<()> {
    let mut updates = Vec::new();
    for desc in built.values() {
        for prop in &desc.properties {
            let Some(one) = prop.assoc_one() else {
                continue;
            };
            let target = built.get(&one.target).ok_or_else(|| {
                Error::mapping_property(
                    &desc.name,
                    &prop.name,
                    format!("unknown target type {}", one.target),
                )
            })?;
            let id_columns = target.id_binder.columns();
            if id_columns.is_empty() {
                return Err(Error::mapping_property(
                    &desc.name,
                    &prop.name,
                    format!("target {} has no id", one.target),
                ));
            }
            if !one.fk_columns.is_empty() && one.fk_columns.len() != id_columns.len() {
                return Err(Error::mapping_property(
                    &desc.name,
                    &prop.name,
                    format!(
                        "{} foreign key columns declared, target id has {}",
                        one.fk_columns.len(),
                        id_columns.len()
                    ),
                ));
            }
            let imported: Vec<ImportedColumn> = id_columns
                .iter()
                .enumerate()
                .map(|(i, col)| ImportedColumn {
                    fk_column: one
                        .fk_columns
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| format!("{}_{}", prop.name, col.column)),
                    target_property: col.property.clone(),
                    target_column: col.column.clone(),
                    sql_type: col.sql_type.clone(),
                })
                .collect();
            updates.push((desc.name.clone(), prop.position, imported));
        }
    }
    for (name, position, imported) in updates {
        if let Some(desc) = built.get_mut(&name) {
            if let PropertyKind::AssocOne(one) = &mut desc.properties[position].kind {
                one.imported = imported;
            }
        }
    }
    Ok(())
}

fn resolve_many(built: &mut HashMap<String, BeanDescriptor>) -> Result<()> {
    let mut updates = Vec::new();
    for desc in built.values() {
        for prop in &desc.properties {
            let Some(many) = prop.assoc_many() else {
                continue;
            };
            let target = built.get(&many.target).ok_or_else(|| {
                Error::mapping_property(
                    &desc.name,
                    &prop.name,
                    format!("unknown target type {}", many.target),
                )
            })?;
            let back = target
                .property(&many.mapped_by)
                .and_then(|p| p.assoc_one())
                .ok_or_else(|| {
                    Error::mapping_property(
                        &desc.name,
                        &prop.name,
                        format!(
                            "{}.{} is not a to-one association",
                            many.target, many.mapped_by
                        ),
                    )
                })?;
            let columns = back.imported.iter().map(|c| c.fk_column.clone()).collect();
            updates.push((desc.name.clone(), prop.position, columns));
        }
    }
    for (name, position, columns) in updates {
        if let Some(desc) = built.get_mut(&name) {
            if let PropertyKind::AssocMany(many) = &mut desc.properties[position].kind {
                many.fk_columns = columns;
            }
        }
    }
    Ok(())
}
