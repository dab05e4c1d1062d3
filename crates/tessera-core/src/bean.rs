//! Entity instances and their interception state.
//!
//! A [`Bean`] is the explicit replacement for an enhanced entity class: a value
//! slot per descriptor property plus an [`Intercept`] that tracks which slots
//! are loaded, which were changed (with the value they had before the first
//! change), and how an unloaded slot can be lazily loaded.
//!
//! Beans are shared through [`BeanRef`] so that the persistence context, the
//! lazy-load batches and application code all see the same instance.

use crate::Result;
use crate::deploy::{BeanDescriptor, IdValue, PropertyKind};
use crate::error::Error;
use crate::field_set::FieldSet;
use crate::value::{Value, key_eq};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared handle to a bean.
pub type BeanRef = Arc<RwLock<Bean>>;

/// Wrap a bean into a shared handle.
pub fn new_ref(bean: Bean) -> BeanRef {
    Arc::new(RwLock::new(bean))
}

/// Read-lock a bean, recovering from a poisoned lock.
pub fn read_bean(bean: &BeanRef) -> RwLockReadGuard<'_, Bean> {
    bean.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock a bean, recovering from a poisoned lock.
pub fn write_bean(bean: &BeanRef) -> RwLockWriteGuard<'_, Bean> {
    bean.write().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a pending entry in a lazy-load batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadToken {
    /// Owning load context
    pub context: u64,
    /// Slot within the context's batch list
    pub slot: usize,
    /// Generation of the persistence context that issued the token
    pub generation: u32,
}

/// Lifecycle state of a bean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeanState {
    /// Created by the application, not yet inserted
    New,
    /// Only the id is known; other properties load on first access
    Reference,
    /// Loaded from (or saved to) the database
    Loaded,
    /// Deleted in this unit of work
    Deleted,
}

/// Value of a to-many property.
#[derive(Clone)]
pub enum BeanList {
    /// Not loaded yet; the token identifies the pending batch entry.
    Deferred(Option<LoadToken>),
    /// Loaded members.
    Loaded(Vec<BeanRef>),
}

/// Value held by one property slot.
#[derive(Clone)]
pub enum PropertyValue {
    /// Not selected by the query that produced the bean.
    Unloaded,
    Scalar(Value),
    One(Option<BeanRef>),
    Many(BeanList),
    Embedded(Option<Box<Bean>>),
}

impl PropertyValue {
    /// A scalar value.
    pub fn scalar(value: impl Into<Value>) -> Self {
        PropertyValue::Scalar(value.into())
    }

    /// The scalar value, if this is a scalar slot.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            PropertyValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// The referenced bean of a to-one slot.
    pub fn as_one(&self) -> Option<&BeanRef> {
        match self {
            PropertyValue::One(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Whether the slot holds nothing (null scalar, empty to-one or embedded).
    pub fn is_null(&self) -> bool {
        match self {
            PropertyValue::Unloaded => true,
            PropertyValue::Scalar(v) => v.is_null(),
            PropertyValue::One(b) => b.is_none(),
            PropertyValue::Many(_) => false,
            PropertyValue::Embedded(b) => b.is_none(),
        }
    }

    /// Value equality used for change detection.
    ///
    /// To-one slots compare by the referenced bean's identity or id, embedded
    /// slots by their scalar values.
    pub fn same_as(&self, other: &PropertyValue) -> bool {
        match (self, other) {
            (PropertyValue::Unloaded, PropertyValue::Unloaded) => true,
            (PropertyValue::Scalar(a), PropertyValue::Scalar(b)) => key_eq(a, b),
            (PropertyValue::One(None), PropertyValue::One(None)) => true,
            (PropertyValue::One(Some(a)), PropertyValue::One(Some(b))) => {
                Arc::ptr_eq(a, b) || {
                    let (a, b) = (read_bean(a).id(), read_bean(b).id());
                    a.is_some() && a == b
                }
            }
            (PropertyValue::Embedded(None), PropertyValue::Embedded(None)) => true,
            (PropertyValue::Embedded(Some(a)), PropertyValue::Embedded(Some(b))) => {
                a.values.len() == b.values.len()
                    && a.values.iter().zip(&b.values).all(|(x, y)| x.same_as(y))
            }
            _ => false,
        }
    }

    fn default_for(kind: &PropertyKind) -> Self {
        match kind {
            PropertyKind::Scalar => PropertyValue::Scalar(Value::Null),
            PropertyKind::AssocOne(_) => PropertyValue::One(None),
            PropertyKind::AssocMany(_) => PropertyValue::Many(BeanList::Loaded(Vec::new())),
            PropertyKind::Embedded(_) => PropertyValue::Embedded(None),
        }
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Unloaded => f.write_str("Unloaded"),
            PropertyValue::Scalar(v) => write!(f, "Scalar({})", v.render()),
            PropertyValue::One(None) => f.write_str("One(None)"),
            // no recursion: graphs may be cyclic
            PropertyValue::One(Some(b)) => match b.try_read() {
                Ok(bean) => write!(f, "One({}#{})", bean.type_name(), id_text(&bean)),
                Err(_) => f.write_str("One(<locked>)"),
            },
            PropertyValue::Many(BeanList::Deferred(_)) => f.write_str("Many(Deferred)"),
            PropertyValue::Many(BeanList::Loaded(items)) => write!(f, "Many({})", items.len()),
            PropertyValue::Embedded(b) => write!(f, "Embedded({:?})", b),
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(v: Value) -> Self {
        PropertyValue::Scalar(v)
    }
}

impl From<BeanRef> for PropertyValue {
    fn from(b: BeanRef) -> Self {
        PropertyValue::One(Some(b))
    }
}

impl From<Option<BeanRef>> for PropertyValue {
    fn from(b: Option<BeanRef>) -> Self {
        PropertyValue::One(b)
    }
}

fn id_text(bean: &Bean) -> String {
    bean.id().map_or_else(|| "?".to_string(), |id| id.to_string())
}

/// Interception state carried by every bean.
#[derive(Debug, Clone)]
pub struct Intercept {
    state: BeanState,
    loaded: FieldSet,
    dirty: FieldSet,
    old_values: Vec<Option<PropertyValue>>,
    read_only: bool,
    lazy_token: Option<LoadToken>,
    missing: bool,
}

impl Intercept {
    fn new(state: BeanState, len: usize, loaded: FieldSet) -> Self {
        Self {
            state,
            loaded,
            dirty: FieldSet::empty(len),
            old_values: vec![None; len],
            read_only: false,
            lazy_token: None,
            missing: false,
        }
    }

    pub fn state(&self) -> BeanState {
        self.state
    }

    pub fn loaded(&self) -> &FieldSet {
        &self.loaded
    }

    pub fn dirty(&self) -> &FieldSet {
        &self.dirty
    }
}

/// An entity instance.
#[derive(Clone)]
pub struct Bean {
    descriptor: Arc<BeanDescriptor>,
    values: Vec<PropertyValue>,
    intercept: Intercept,
}

impl Bean {
    /// A new bean created by the application; every slot holds its default.
    pub fn new(descriptor: Arc<BeanDescriptor>) -> Self {
        let len = descriptor.properties().len();
        let values = descriptor
            .properties()
            .iter()
            .map(|p| PropertyValue::default_for(&p.kind))
            .collect();
        Self {
            descriptor,
            values,
            intercept: Intercept::new(BeanState::New, len, FieldSet::all(len)),
        }
    }

    /// A reference bean: only the id is loaded.
    pub fn reference(descriptor: Arc<BeanDescriptor>, id: &IdValue) -> Result<Self> {
        let mut bean = Self::for_load(descriptor);
        bean.intercept.state = BeanState::Reference;
        let binder = bean.descriptor.id_binder().clone();
        binder.convert_set_id(id, Some(&mut bean))?;
        Ok(bean)
    }

    /// An empty bean about to be populated from a row.
    pub fn for_load(descriptor: Arc<BeanDescriptor>) -> Self {
        let len = descriptor.properties().len();
        Self {
            descriptor,
            values: vec![PropertyValue::Unloaded; len],
            intercept: Intercept::new(BeanState::Loaded, len, FieldSet::empty(len)),
        }
    }

    pub fn descriptor(&self) -> &Arc<BeanDescriptor> {
        &self.descriptor
    }

    pub fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn intercept(&self) -> &Intercept {
        &self.intercept
    }

    pub fn state(&self) -> BeanState {
        self.intercept.state
    }

    pub fn set_state(&mut self, state: BeanState) {
        self.intercept.state = state;
    }

    /// The bean's id, `None` while unset.
    pub fn id(&self) -> Option<IdValue> {
        self.descriptor.id_binder().id_for_bean(self)
    }

    pub fn value_at(&self, position: usize) -> Option<&PropertyValue> {
        self.values.get(position)
    }

    /// Slot of a property by name. Does not trigger lazy loading.
    pub fn get(&self, name: &str) -> Result<&PropertyValue> {
        let position = self.position_of(name)?;
        Ok(&self.values[position])
    }

    /// Scalar value of a property, `None` when not loaded.
    pub fn scalar(&self, name: &str) -> Result<Option<&Value>> {
        Ok(self.get(name)?.as_value())
    }

    /// Change a property, recording dirty state and the first old value.
    pub fn set(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        let position = self.position_of(name)?;
        self.set_at(position, value.into())
    }

    /// Change a scalar property.
    pub fn set_value(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.set(name, PropertyValue::Scalar(value.into()))
    }

    /// Change the property at `position`.
    pub fn set_at(&mut self, position: usize, value: PropertyValue) -> Result<()> {
        if self.intercept.read_only {
            let name = self.property_name(position);
            return Err(Error::mapping_property(
                self.descriptor.name(),
                name,
                "bean is read only",
            ));
        }
        if position >= self.values.len() {
            return Err(Error::mapping(
                self.descriptor.name(),
                format!("property position {} out of range", position),
            ));
        }
        let was_loaded = self.intercept.loaded.is_set(position);
        if was_loaded && self.values[position].same_as(&value) {
            return Ok(());
        }
        let previous = std::mem::replace(&mut self.values[position], value);
        if self.intercept.state != BeanState::New
            && was_loaded
            && self.intercept.old_values[position].is_none()
        {
            self.intercept.old_values[position] = Some(previous);
        }
        self.intercept.loaded.set(position);
        self.intercept.dirty.set(position);
        Ok(())
    }

    /// Populate a slot from the database; never marks dirty.
    pub fn load_value(&mut self, position: usize, value: PropertyValue) {
        if let Some(slot) = self.values.get_mut(position) {
            *slot = value;
            self.intercept.loaded.set(position);
        }
    }

    /// Append to a loaded to-many slot; members already present are ignored.
    pub fn append_loaded(&mut self, position: usize, member: BeanRef) {
        if let Some(PropertyValue::Many(BeanList::Loaded(items))) = self.values.get_mut(position) {
            if !items.iter().any(|m| Arc::ptr_eq(m, &member)) {
                items.push(member);
            }
        }
    }

    pub fn is_loaded(&self, position: usize) -> bool {
        self.intercept.loaded.is_set(position)
    }

    /// Positions changed since load (or since the last save).
    pub fn dirty_positions(&self) -> Vec<usize> {
        self.intercept.dirty.iter().collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.intercept.dirty.is_empty()
    }

    /// Value a dirty property had before its first change.
    pub fn old_value(&self, position: usize) -> Option<&PropertyValue> {
        self.intercept.old_values.get(position).and_then(Option::as_ref)
    }

    /// Clear dirty tracking after a successful save; the bean is now loaded.
    pub fn reset_dirty(&mut self) {
        self.intercept.dirty.clear_all();
        self.intercept.old_values.iter_mut().for_each(|v| *v = None);
        self.intercept.state = BeanState::Loaded;
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.intercept.read_only = read_only;
    }

    pub fn is_read_only(&self) -> bool {
        self.intercept.read_only
    }

    /// Pending lazy-load entry of a reference bean.
    pub fn lazy_token(&self) -> Option<LoadToken> {
        self.intercept.lazy_token
    }

    pub fn set_lazy_token(&mut self, token: Option<LoadToken>) {
        self.intercept.lazy_token = token;
    }

    /// Flag a reference whose row was not found by its batch load.
    pub fn mark_missing(&mut self) {
        self.intercept.missing = true;
        self.intercept.lazy_token = None;
    }

    pub fn is_missing(&self) -> bool {
        self.intercept.missing
    }

    /// Mark the bean as fully materialized from a row.
    pub fn mark_loaded(&mut self) {
        self.intercept.state = BeanState::Loaded;
        self.intercept.lazy_token = None;
    }

    fn position_of(&self, name: &str) -> Result<usize> {
        self.descriptor
            .property_index(name)
            .ok_or_else(|| Error::mapping_property(self.descriptor.name(), name, "unknown property"))
    }

    fn property_name(&self, position: usize) -> String {
        self.descriptor
            .property_at(position)
            .map_or_else(|| position.to_string(), |p| p.name.clone())
    }
}

impl fmt::Debug for Bean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.descriptor.name());
        for (prop, value) in self.descriptor.properties().iter().zip(&self.values) {
            s.field(&prop.name, value);
        }
        s.field("state", &self.intercept.state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::{BeanProperty, DescriptorMap};
    use crate::types::SqlType;

    fn customer() -> Arc<BeanDescriptor> {
        let map = DescriptorMap::build(vec![
            BeanDescriptor::builder("Customer")
                .table("customer")
                .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
                .property(BeanProperty::scalar("name", "name", SqlType::VarChar(40)))
                .property(BeanProperty::scalar("note", "note", SqlType::Text)),
        ])
        .unwrap();
        Arc::clone(map.get("Customer").unwrap())
    }

    #[test]
    fn test_new_bean_defaults() {
        let bean = Bean::new(customer());
        assert_eq!(bean.state(), BeanState::New);
        assert!(bean.is_loaded(2));
        assert_eq!(bean.id(), None);
        assert_eq!(bean.scalar("name").unwrap(), Some(&Value::Null));
    }

    #[test]
    fn test_set_tracks_first_old_value() {
        let desc = customer();
        let mut bean = Bean::for_load(desc);
        bean.load_value(0, PropertyValue::scalar(1_i64));
        bean.load_value(1, PropertyValue::scalar("Ann"));
        assert!(!bean.is_dirty());

        bean.set_value("name", "Bea").unwrap();
        bean.set_value("name", "Cid").unwrap();
        assert_eq!(bean.dirty_positions(), vec![1]);
        assert!(bean.old_value(1).unwrap().same_as(&PropertyValue::scalar("Ann")));

        // unchanged value is not dirty
        bean.reset_dirty();
        bean.set_value("name", "Cid").unwrap();
        assert!(!bean.is_dirty());
    }

    #[test]
    fn test_reference_and_read_only() {
        let mut bean = Bean::reference(customer(), &IdValue::from(5_i64)).unwrap();
        assert_eq!(bean.state(), BeanState::Reference);
        assert!(bean.is_loaded(0));
        assert!(!bean.is_loaded(1));
        assert_eq!(bean.id(), Some(IdValue::from(5_i64)));

        bean.set_read_only(true);
        assert!(matches!(bean.set_value("name", "x"), Err(Error::Mapping(_))));
        assert!(bean.get("nope").is_err());
    }
}
