//! Managed beans: entity instances plus load, dirty and lifecycle state.
//!
//! A [`ManagedBean`] holds its property values in descriptor order inside an
//! `Arc<Vec<Value>>`. Read-only beans share that buffer with the bean cache;
//! every mutation goes through `Arc::make_mut`, so a shared buffer is copied
//! before it is written and the cached snapshot can never change underneath
//! another reader.
//!
//! Property access is explicit. A bean knows which properties hold real data
//! ([`LoadState`]) and callers ask the session to `ensure_loaded` before
//! reading a property that may be unpopulated.

use crate::Result;
use crate::config::ConcurrencyMode;
use crate::descriptor::{EntityDescriptor, PropertyKind};
use crate::error::{Error, MetadataError};
use crate::id::{EntityId, EntityKey};
use crate::value::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Which properties of a bean hold real data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    /// Only the id is known.
    Reference,
    /// The listed property indexes (plus the id) are loaded.
    Partial(BTreeSet<usize>),
    /// Every column property is loaded.
    Loaded,
}

/// Lifecycle tag of a bean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeanLifecycle {
    /// Constructed by the application, never written.
    New,
    /// Identity known, data not loaded.
    Reference,
    /// Loaded (possibly partially) and unchanged.
    Loaded,
    /// Loaded and modified since.
    Dirty,
    /// Deleted in this unit of work.
    Deleted,
}

/// What an UPDATE/DELETE compares against the stored row.
#[derive(Debug, Clone, PartialEq)]
pub enum ConcurrencyToken {
    None,
    /// The version value read at load time.
    Version(Value),
    /// The full old-values snapshot; only loaded properties are compared.
    OldValues(Arc<Vec<Value>>),
}

/// Immutable bean-cache value.
#[derive(Debug, Clone)]
pub struct BeanSnapshot {
    pub entity: &'static str,
    pub id: EntityId,
    pub values: Arc<Vec<Value>>,
    /// `None` when every column property was loaded.
    pub loaded: Option<BTreeSet<usize>>,
}

impl BeanSnapshot {
    pub fn is_complete(&self) -> bool {
        self.loaded.is_none()
    }
}

/// An entity instance with tracked state.
pub struct ManagedBean {
    descriptor: Arc<EntityDescriptor>,
    values: Arc<Vec<Value>>,
    old_values: Option<Arc<Vec<Value>>>,
    load_state: LoadState,
    lifecycle: BeanLifecycle,
    many: HashMap<usize, Vec<BeanRef>>,
    pending_one: HashMap<usize, BeanRef>,
    read_only: bool,
    unmanaged: bool,
}

impl ManagedBean {
    /// A new, unsaved bean with every property NULL and empty collections.
    pub fn new(descriptor: Arc<EntityDescriptor>) -> Self {
        let values = vec![Value::Null; descriptor.property_count()];
        let many = descriptor
            .to_many_properties()
            .map(|p| (p.index, Vec::new()))
            .collect();
        Self {
            descriptor,
            values: Arc::new(values),
            old_values: None,
            load_state: LoadState::Loaded,
            lifecycle: BeanLifecycle::New,
            many,
            pending_one: HashMap::new(),
            read_only: false,
            unmanaged: false,
        }
    }

    /// A reference bean: identity only, everything else unloaded.
    pub fn reference(descriptor: Arc<EntityDescriptor>, id: &EntityId) -> Result<Self> {
        let mut values = vec![Value::Null; descriptor.property_count()];
        for (slot, value) in descriptor
            .id_indexes()
            .iter()
            .zip(descriptor.id_values(id)?)
        {
            values[*slot] = value;
        }
        let values = Arc::new(values);
        Ok(Self {
            descriptor,
            old_values: Some(Arc::clone(&values)),
            values,
            load_state: LoadState::Reference,
            lifecycle: BeanLifecycle::Reference,
            many: HashMap::new(),
            pending_one: HashMap::new(),
            read_only: false,
            unmanaged: false,
        })
    }

    /// A bean materialized from the store. `loaded` is `None` for a full fetch.
    pub fn loaded(
        descriptor: Arc<EntityDescriptor>,
        values: Vec<Value>,
        loaded: Option<BTreeSet<usize>>,
    ) -> Self {
        let values = Arc::new(values);
        Self {
            descriptor,
            old_values: Some(Arc::clone(&values)),
            values,
            load_state: loaded.map_or(LoadState::Loaded, LoadState::Partial),
            lifecycle: BeanLifecycle::Loaded,
            many: HashMap::new(),
            pending_one: HashMap::new(),
            read_only: false,
            unmanaged: false,
        }
    }

    /// A bean built from a cache snapshot: shared buffer when read-only, deep copy otherwise.
    pub fn from_snapshot(
        descriptor: Arc<EntityDescriptor>,
        snapshot: &BeanSnapshot,
        read_only: bool,
    ) -> Self {
        let values = if read_only {
            Arc::clone(&snapshot.values)
        } else {
            Arc::new(snapshot.values.as_ref().clone())
        };
        let mut bean = Self::loaded(descriptor, Vec::new(), snapshot.loaded.clone());
        bean.old_values = Some(Arc::clone(&values));
        bean.values = values;
        bean.read_only = read_only;
        bean
    }

    /// A detached bean holding complete values, e.g. built from a request
    /// payload. Saving it updates every updatable property.
    pub fn unmanaged(descriptor: Arc<EntityDescriptor>, values: Vec<Value>) -> Self {
        let mut bean = Self::loaded(descriptor, values, None);
        bean.old_values = None;
        bean.unmanaged = true;
        bean
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    pub fn entity(&self) -> &'static str {
        self.descriptor.name
    }

    pub fn id(&self) -> EntityId {
        self.descriptor.id_from_values(&self.values)
    }

    /// The (entity, id) key, or `None` while the id is unassigned.
    pub fn key(&self) -> Option<EntityKey> {
        let id = self.id();
        (!id.is_null()).then(|| EntityKey {
            entity: self.descriptor.name,
            id,
        })
    }

    pub fn lifecycle(&self) -> BeanLifecycle {
        self.lifecycle
    }

    pub fn load_state(&self) -> &LoadState {
        &self.load_state
    }

    pub fn is_new(&self) -> bool {
        self.lifecycle == BeanLifecycle::New
    }

    pub fn is_deleted(&self) -> bool {
        self.lifecycle == BeanLifecycle::Deleted
    }

    pub fn is_reference(&self) -> bool {
        self.load_state == LoadState::Reference
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.load_state == LoadState::Loaded
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_unmanaged(&self) -> bool {
        self.unmanaged
    }

    /// Mark the bean read-only; setters will fail with [`Error::ReadOnly`].
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Is the property at `index` populated? Collections count once loaded.
    pub fn is_loaded_at(&self, index: usize) -> bool {
        let property = self.descriptor.property_at(index);
        if let PropertyKind::ToMany { .. } = property.kind {
            return self.many.contains_key(&index);
        }
        if property.is_id() {
            return true;
        }
        match &self.load_state {
            LoadState::Loaded => true,
            LoadState::Reference => false,
            LoadState::Partial(set) => set.contains(&index),
        }
    }

    pub fn is_loaded(&self, property: &str) -> Result<bool> {
        Ok(self.is_loaded_at(self.descriptor.property_index(property)?))
    }

    /// Column property indexes currently loaded, ids included.
    pub fn loaded_indexes(&self) -> Vec<usize> {
        self.descriptor
            .column_properties()
            .map(|p| p.index)
            .filter(|&i| self.is_loaded_at(i))
            .collect()
    }

    /// The raw value buffer, in descriptor order. Unloaded slots hold NULL.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value_at(&self, index: usize) -> &Value {
        &self.values[index]
    }

    /// A loaded property value; `None` for unknown or unloaded properties.
    pub fn value(&self, property: &str) -> Option<&Value> {
        let index = self.descriptor.property(property)?.index;
        self.is_loaded_at(index).then(|| &self.values[index])
    }

    /// Set a property by name, recording dirty state.
    pub fn set(&mut self, property: &str, value: impl Into<Value>) -> Result<()> {
        let index = self.descriptor.property_index(property)?;
        self.set_at(index, value.into())
    }

    /// Set a property by index, recording dirty state.
    pub fn set_at(&mut self, index: usize, value: Value) -> Result<()> {
        self.check_writable(index)?;
        let property = self.descriptor.property_at(index);
        if property.is_id() && !self.is_new() && !self.unmanaged {
            return Err(self.metadata_error(index, "id of a persisted bean cannot change"));
        }
        if let PropertyKind::ToOne { .. } = property.kind {
            self.pending_one.remove(&index);
        }
        self.write_value(index, value);
        Ok(())
    }

    fn check_writable(&self, index: usize) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly {
                entity: self.descriptor.name,
            });
        }
        if self.is_deleted() {
            return Err(Error::Custom(format!(
                "cannot modify deleted bean {}#{}",
                self.descriptor.name,
                self.id()
            )));
        }
        if matches!(
            self.descriptor.property_at(index).kind,
            PropertyKind::ToMany { .. }
        ) {
            return Err(self.metadata_error(index, "collections are changed through add_child/set_many"));
        }
        Ok(())
    }

    fn write_value(&mut self, index: usize, value: Value) {
        if let LoadState::Partial(set) = &mut self.load_state {
            set.insert(index);
        } else if self.load_state == LoadState::Reference {
            self.load_state = LoadState::Partial(BTreeSet::from([index]));
        }
        if self.values[index] == value {
            return;
        }
        Arc::make_mut(&mut self.values)[index] = value;
        if matches!(
            self.lifecycle,
            BeanLifecycle::Loaded | BeanLifecycle::Reference
        ) {
            self.lifecycle = BeanLifecycle::Dirty;
        }
    }

    fn metadata_error(&self, index: usize, message: &str) -> Error {
        Error::Metadata(MetadataError {
            entity: Some(self.descriptor.name.to_string()),
            property: Some(self.descriptor.property_at(index).name.to_string()),
            message: message.to_string(),
        })
    }

    /// Point a to-one association at `target`.
    ///
    /// The foreign key is copied now when the target has an id; otherwise it
    /// is assigned when the target is saved by a cascade. `target` must not be
    /// this bean.
    pub fn set_association(&mut self, property: &str, target: &BeanRef) -> Result<()> {
        let index = self.descriptor.property_index(property)?;
        let descriptor_target = match self.descriptor.property_at(index).kind {
            PropertyKind::ToOne { target } => target,
            _ => return Err(self.metadata_error(index, "not a to-one association")),
        };
        let (target_entity, target_id) = {
            let guard = target.read();
            (guard.entity(), guard.id())
        };
        if target_entity != descriptor_target {
            return Err(self.metadata_error(index, "association target has the wrong entity type"));
        }
        self.check_writable(index)?;
        let fk = target_id.as_single().cloned().unwrap_or(Value::Null);
        self.write_value(index, fk);
        self.pending_one.insert(index, target.clone());
        Ok(())
    }

    /// The bean assigned through [`Self::set_association`], if still pending.
    pub fn association(&self, property: &str) -> Option<&BeanRef> {
        let index = self.descriptor.property(property)?.index;
        self.pending_one.get(&index)
    }

    pub fn pending_associations(&self) -> impl Iterator<Item = (usize, &BeanRef)> {
        self.pending_one.iter().map(|(i, b)| (*i, b))
    }

    /// Write a foreign key resolved by a cascade without touching pending state.
    pub fn assign_foreign_key(&mut self, index: usize, value: Value) {
        self.write_value(index, value);
    }

    /// A loaded collection; `None` while unloaded.
    pub fn many(&self, property: &str) -> Option<&[BeanRef]> {
        let index = self.descriptor.property(property)?.index;
        self.many_at(index)
    }

    pub fn many_at(&self, index: usize) -> Option<&[BeanRef]> {
        self.many.get(&index).map(Vec::as_slice)
    }

    /// Install a loaded collection. Loading does not make the owner dirty.
    pub fn set_many(&mut self, index: usize, children: Vec<BeanRef>) {
        self.many.insert(index, children);
    }

    /// Append a child to a loaded collection.
    pub fn add_child(&mut self, property: &str, child: BeanRef) -> Result<()> {
        let index = self.descriptor.property_index(property)?;
        if self.read_only {
            return Err(Error::ReadOnly {
                entity: self.descriptor.name,
            });
        }
        match self.many.get_mut(&index) {
            Some(children) => {
                children.push(child);
                Ok(())
            }
            None => Err(self.metadata_error(index, "collection is not loaded; call ensure_loaded first")),
        }
    }

    /// Drop a loaded collection so the next access reloads it.
    pub fn unload_many(&mut self, index: usize) {
        self.many.remove(&index);
    }

    /// Property indexes whose values differ from the old-values snapshot.
    ///
    /// New and unmanaged beans report every insertable/updatable column.
    pub fn dirty_indexes(&self) -> Vec<usize> {
        match &self.old_values {
            Some(old) if !self.unmanaged && !self.is_new() => self
                .descriptor
                .column_properties()
                .map(|p| p.index)
                .filter(|&i| self.is_loaded_at(i) && !self.values[i].key_eq(&old[i]))
                .collect(),
            _ => self
                .descriptor
                .column_properties()
                .filter(|p| !p.is_id())
                .map(|p| p.index)
                .collect(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.is_new() || self.unmanaged || !self.dirty_indexes().is_empty()
    }

    pub fn old_values(&self) -> Option<&[Value]> {
        self.old_values.as_deref().map(Vec::as_slice)
    }

    /// The value a version predicate compares against, if any.
    pub fn old_version(&self) -> Option<&Value> {
        let index = self.descriptor.version_property()?.index;
        match &self.old_values {
            Some(old) => Some(&old[index]),
            None => Some(&self.values[index]),
        }
    }

    /// The optimistic-concurrency token for `mode`.
    pub fn concurrency_token(&self, mode: ConcurrencyMode) -> ConcurrencyToken {
        match mode {
            ConcurrencyMode::Version => self
                .old_version()
                .filter(|v| !v.is_null())
                .map_or(ConcurrencyToken::None, |v| ConcurrencyToken::Version(v.clone())),
            ConcurrencyMode::AllProperties => match &self.old_values {
                Some(old) if !self.unmanaged => ConcurrencyToken::OldValues(Arc::clone(old)),
                _ => ConcurrencyToken::None,
            },
            ConcurrencyMode::None => ConcurrencyToken::None,
        }
    }

    /// Fill unloaded properties from a freshly fetched row.
    ///
    /// Properties the application already changed keep their new value. The
    /// old-values snapshot takes the fetched values for the filled slots.
    pub fn merge_fetched(&mut self, fetched: &[Value], fetched_loaded: Option<&BTreeSet<usize>>) {
        if self.is_new() || self.is_deleted() {
            return;
        }
        let fill: Vec<usize> = self
            .descriptor
            .column_properties()
            .map(|p| p.index)
            .filter(|&i| !self.is_loaded_at(i) && fetched_loaded.is_none_or(|set| set.contains(&i)))
            .collect();
        if fill.is_empty() && fetched_loaded.is_some() {
            return;
        }
        let mut old = self
            .old_values
            .as_deref()
            .cloned()
            .unwrap_or_else(|| self.values.as_ref().clone());
        let values = Arc::make_mut(&mut self.values);
        for &i in &fill {
            values[i] = fetched[i].clone();
            old[i] = fetched[i].clone();
        }
        self.old_values = Some(Arc::new(old));
        self.load_state = match (fetched_loaded, &self.load_state) {
            (None, _) => LoadState::Loaded,
            (Some(_), LoadState::Loaded) => LoadState::Loaded,
            (Some(_), LoadState::Partial(set)) => {
                let mut set = set.clone();
                set.extend(fill.iter().copied());
                LoadState::Partial(set)
            }
            (Some(_), LoadState::Reference) => LoadState::Partial(fill.iter().copied().collect()),
        };
        if self.lifecycle == BeanLifecycle::Reference {
            self.lifecycle = if self.dirty_indexes().is_empty() {
                BeanLifecycle::Loaded
            } else {
                BeanLifecycle::Dirty
            };
        }
    }

    /// Write a generated value (identity, version, timestamps) during a save.
    pub fn set_generated(&mut self, index: usize, value: Value) {
        Arc::make_mut(&mut self.values)[index] = value;
        if let LoadState::Partial(set) = &mut self.load_state {
            set.insert(index);
        }
    }

    /// Reset to clean after a successful insert or update.
    ///
    /// The old-values snapshot becomes the written values. Properties that
    /// were never loaded stay unloaded.
    pub fn mark_clean(&mut self) {
        if self.is_new() || self.unmanaged {
            self.load_state = LoadState::Loaded;
            for p in self.descriptor.to_many_properties() {
                self.many.entry(p.index).or_default();
            }
        }
        self.old_values = Some(Arc::clone(&self.values));
        self.lifecycle = BeanLifecycle::Loaded;
        self.unmanaged = false;
        self.pending_one.clear();
    }

    pub fn mark_deleted(&mut self) {
        self.lifecycle = BeanLifecycle::Deleted;
        self.pending_one.clear();
    }

    /// Snapshot for the bean cache. `None` for unsaved beans.
    pub fn snapshot(&self) -> Option<BeanSnapshot> {
        let key = self.key()?;
        let loaded = match &self.load_state {
            LoadState::Loaded => None,
            _ => Some(self.loaded_indexes().into_iter().collect()),
        };
        Some(BeanSnapshot {
            entity: key.entity,
            id: key.id,
            values: Arc::clone(&self.values),
            loaded,
        })
    }

    /// A private copy sharing no state with this bean or its context.
    ///
    /// Collections and pending associations are not carried over.
    pub fn detached_copy(&self) -> ManagedBean {
        ManagedBean {
            descriptor: Arc::clone(&self.descriptor),
            values: Arc::new(self.values.as_ref().clone()),
            old_values: self
                .old_values
                .as_ref()
                .map(|old| Arc::new(old.as_ref().clone())),
            load_state: self.load_state.clone(),
            lifecycle: self.lifecycle,
            many: HashMap::new(),
            pending_one: HashMap::new(),
            read_only: false,
            unmanaged: self.unmanaged,
        }
    }

    /// Do the value buffers of two beans share storage?
    pub fn shares_values_with(&self, snapshot: &BeanSnapshot) -> bool {
        Arc::ptr_eq(&self.values, &snapshot.values)
    }
}

impl fmt::Debug for ManagedBean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedBean")
            .field("entity", &self.descriptor.name)
            .field("values", &self.values)
            .field("load_state", &self.load_state)
            .field("lifecycle", &self.lifecycle)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Shared handle to a bean. Clones point at the same instance.
#[derive(Clone)]
pub struct BeanRef(Arc<RwLock<ManagedBean>>);

impl BeanRef {
    pub fn new(bean: ManagedBean) -> Self {
        Self(Arc::new(RwLock::new(bean)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ManagedBean> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ManagedBean> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Same instance?
    pub fn ptr_eq(a: &BeanRef, b: &BeanRef) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Address of the shared instance, for identity-keyed sets.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn downgrade(&self) -> WeakBeanRef {
        WeakBeanRef(Arc::downgrade(&self.0))
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.read().key()
    }

    pub fn entity(&self) -> &'static str {
        self.read().entity()
    }

    /// Shorthand for reading one loaded property.
    pub fn get(&self, property: &str) -> Option<Value> {
        self.read().value(property).cloned()
    }

    /// Shorthand for setting one property.
    pub fn set(&self, property: &str, value: impl Into<Value>) -> Result<()> {
        self.write().set(property, value)
    }
}

impl fmt::Debug for BeanRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(bean) => match bean.key() {
                Some(key) => write!(f, "BeanRef({key})"),
                None => write!(f, "BeanRef({}#<new>)", bean.entity()),
            },
            Err(_) => f.write_str("BeanRef(<locked>)"),
        }
    }
}

/// Non-owning handle held by lazy-load queues.
#[derive(Clone)]
pub struct WeakBeanRef(Weak<RwLock<ManagedBean>>);

impl WeakBeanRef {
    pub fn upgrade(&self) -> Option<BeanRef> {
        self.0.upgrade().map(BeanRef)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    /// Same value as [`BeanRef::addr`] of the bean this points at.
    pub fn addr(&self) -> usize {
        self.0.as_ptr() as *const () as usize
    }
}

impl fmt::Debug for WeakBeanRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakBeanRef(alive={})", self.is_alive())
    }
}
