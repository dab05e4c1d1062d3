//! Mapped property definitions.

use crate::types::SqlType;
use std::sync::Arc;

use super::BeanDescriptor;

/// Metadata about one mapped attribute of an entity type.
///
/// Properties are declared with the builder methods below and resolved once
/// when the owning [`DescriptorMap`](super::DescriptorMap) is built; after that
/// they are immutable and shared across threads.
#[derive(Debug, Clone)]
pub struct BeanProperty {
    /// Logical property name
    pub name: String,
    /// Database column (empty for to-many and embedded properties)
    pub db_column: String,
    /// SQL type code of the column
    pub sql_type: SqlType,
    /// Scalar, association or embedded
    pub kind: PropertyKind,
    /// Part of the primary key
    pub id: bool,
    /// Optimistic concurrency version column
    pub version: bool,
    /// Included in INSERT statements
    pub insertable: bool,
    /// Included in UPDATE statements
    pub updatable: bool,
    /// Value generated by the database on insert
    pub generated: bool,
    /// Index into the owner's secondary table joins
    pub table_join: Option<usize>,
    /// Position within the owning descriptor, set at build
    pub(crate) position: usize,
}

/// What kind of value a property holds.
#[derive(Debug, Clone)]
pub enum PropertyKind {
    /// A plain column value
    Scalar,
    /// A to-one association stored as foreign key column(s) on this table
    AssocOne(AssocOne),
    /// A to-many association mapped by a to-one on the target type
    AssocMany(AssocMany),
    /// An embedded bean whose columns live on this table
    Embedded(EmbeddedInfo),
}

/// To-one association details.
#[derive(Debug, Clone)]
pub struct AssocOne {
    /// Target entity type name
    pub target: String,
    /// Declared foreign key columns; defaults to `<name>_<id column>`
    pub fk_columns: Vec<String>,
    /// Foreign key columns paired with the target's id, resolved at build
    pub imported: Vec<ImportedColumn>,
    /// Whether the foreign key may be null (outer join)
    pub optional: bool,
    /// Extra join restriction using `${ta}` for the joined table alias
    pub extra_where: Option<String>,
}

/// One foreign key column imported from the target's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedColumn {
    /// Column on the owning table
    pub fk_column: String,
    /// Target id property the column references
    pub target_property: String,
    /// Column on the target table
    pub target_column: String,
    /// SQL type of the key column
    pub sql_type: SqlType,
}

/// To-many association details.
#[derive(Debug, Clone)]
pub struct AssocMany {
    /// Target entity type name
    pub target: String,
    /// Name of the to-one property on the target pointing back at the owner
    pub mapped_by: String,
    /// Foreign key columns on the target table, resolved at build
    pub fk_columns: Vec<String>,
    /// Extra join restriction using `${ta}` for the joined table alias
    pub extra_where: Option<String>,
    /// Order applied to the loaded collection (logical property of the target)
    pub order_by: Option<String>,
}

/// Embedded bean details.
#[derive(Debug, Clone)]
pub struct EmbeddedInfo {
    /// Embeddable type name
    pub target: String,
    /// Prefix applied to the embeddable's column names
    pub column_prefix: String,
    /// Resolved embeddable descriptor
    pub descriptor: Option<Arc<BeanDescriptor>>,
}

impl BeanProperty {
    fn base(name: &str, db_column: &str, sql_type: SqlType, kind: PropertyKind) -> Self {
        Self {
            name: name.to_string(),
            db_column: db_column.to_string(),
            sql_type,
            kind,
            id: false,
            version: false,
            insertable: true,
            updatable: true,
            generated: false,
            table_join: None,
            position: 0,
        }
    }

    /// A scalar column property.
    pub fn scalar(name: &str, db_column: &str, sql_type: SqlType) -> Self {
        Self::base(name, db_column, sql_type, PropertyKind::Scalar)
    }

    /// A to-one association to `target`.
    pub fn one(name: &str, target: &str) -> Self {
        Self::base(
            name,
            "",
            SqlType::BigInt,
            PropertyKind::AssocOne(AssocOne {
                target: target.to_string(),
                fk_columns: Vec::new(),
                imported: Vec::new(),
                optional: true,
                extra_where: None,
            }),
        )
    }

    /// A to-many association to `target`, mapped by its to-one `mapped_by`.
    pub fn many(name: &str, target: &str, mapped_by: &str) -> Self {
        let mut prop = Self::base(
            name,
            "",
            SqlType::BigInt,
            PropertyKind::AssocMany(AssocMany {
                target: target.to_string(),
                mapped_by: mapped_by.to_string(),
                fk_columns: Vec::new(),
                extra_where: None,
                order_by: None,
            }),
        );
        prop.insertable = false;
        prop.updatable = false;
        prop
    }

    /// An embedded bean of embeddable type `target`.
    pub fn embedded(name: &str, target: &str) -> Self {
        Self::base(
            name,
            "",
            SqlType::BigInt,
            PropertyKind::Embedded(EmbeddedInfo {
                target: target.to_string(),
                column_prefix: String::new(),
                descriptor: None,
            }),
        )
    }

    /// Mark as (part of) the primary key.
    pub fn id(mut self) -> Self {
        self.id = true;
        self.updatable = false;
        self
    }

    /// Mark as a database generated key.
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// Mark as the version column.
    pub fn version(mut self) -> Self {
        self.version = true;
        self
    }

    /// Exclude from UPDATE statements.
    pub fn not_updatable(mut self) -> Self {
        self.updatable = false;
        self
    }

    /// Exclude from INSERT statements.
    pub fn not_insertable(mut self) -> Self {
        self.insertable = false;
        self
    }

    /// Read this column from a secondary table join of the owner.
    pub fn from_table_join(mut self, join: usize) -> Self {
        self.table_join = Some(join);
        self.insertable = false;
        self.updatable = false;
        self
    }

    /// Declare the foreign key column(s) of a to-one association.
    pub fn fk(mut self, columns: &[&str]) -> Self {
        if let PropertyKind::AssocOne(one) = &mut self.kind {
            one.fk_columns = columns.iter().map(|c| (*c).to_string()).collect();
        }
        self
    }

    /// Mark a to-one association as mandatory (inner join).
    pub fn required(mut self) -> Self {
        if let PropertyKind::AssocOne(one) = &mut self.kind {
            one.optional = false;
        }
        self
    }

    /// Extra join restriction for an association, `${ta}` being its alias.
    pub fn extra_where(mut self, clause: &str) -> Self {
        match &mut self.kind {
            PropertyKind::AssocOne(one) => one.extra_where = Some(clause.to_string()),
            PropertyKind::AssocMany(many) => many.extra_where = Some(clause.to_string()),
            _ => {}
        }
        self
    }

    /// Order applied when loading a to-many association.
    pub fn order_by(mut self, order_by: &str) -> Self {
        if let PropertyKind::AssocMany(many) = &mut self.kind {
            many.order_by = Some(order_by.to_string());
        }
        self
    }

    /// Prefix the embeddable's column names with `prefix`.
    pub fn column_prefix(mut self, prefix: &str) -> Self {
        if let PropertyKind::Embedded(info) = &mut self.kind {
            info.column_prefix = prefix.to_string();
        }
        self
    }

    /// Position within the owning descriptor.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, PropertyKind::Scalar)
    }

    pub fn is_assoc_one(&self) -> bool {
        matches!(self.kind, PropertyKind::AssocOne(_))
    }

    pub fn is_assoc_many(&self) -> bool {
        matches!(self.kind, PropertyKind::AssocMany(_))
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.kind, PropertyKind::Embedded(_))
    }

    /// The to-one details, if this is a to-one association.
    pub fn assoc_one(&self) -> Option<&AssocOne> {
        match &self.kind {
            PropertyKind::AssocOne(one) => Some(one),
            _ => None,
        }
    }

    /// The to-many details, if this is a to-many association.
    pub fn assoc_many(&self) -> Option<&AssocMany> {
        match &self.kind {
            PropertyKind::AssocMany(many) => Some(many),
            _ => None,
        }
    }

    /// The embedded details, if this is an embedded bean.
    pub fn embedded_info(&self) -> Option<&EmbeddedInfo> {
        match &self.kind {
            PropertyKind::Embedded(info) => Some(info),
            _ => None,
        }
    }

    /// Target type name of an association or embedded property.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            PropertyKind::Scalar => None,
            PropertyKind::AssocOne(one) => Some(&one.target),
            PropertyKind::AssocMany(many) => Some(&many.target),
            PropertyKind::Embedded(info) => Some(&info.target),
        }
    }

    /// Columns this property occupies on its own table, in select order.
    ///
    /// Scalars contribute one column, to-one associations their imported
    /// foreign keys, embedded beans every (prefixed) embeddable column and
    /// to-many associations nothing.
    pub fn local_columns(&self) -> Vec<(String, SqlType)> {
        match &self.kind {
            PropertyKind::Scalar => vec![(self.db_column.clone(), self.sql_type.clone())],
            PropertyKind::AssocOne(one) => one
                .imported
                .iter()
                .map(|c| (c.fk_column.clone(), c.sql_type.clone()))
                .collect(),
            PropertyKind::AssocMany(_) => Vec::new(),
            PropertyKind::Embedded(info) => info
                .descriptor
                .as_ref()
                .map(|desc| {
                    desc.properties()
                        .iter()
                        .map(|p| {
                            (
                                format!("{}{}", info.column_prefix, p.db_column),
                                p.sql_type.clone(),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}
