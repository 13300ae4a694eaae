//! Entity descriptors: the per-type property tables the runtime works from.
//!
//! A descriptor lists every property of an entity type by index. Beans store
//! their values in the same order, so property access is an index lookup and
//! never needs reflection. Descriptors are collected into an immutable
//! [`DescriptorRegistry`] at startup and shared by `Arc`.

use crate::Result;
use crate::config::{CachePolicy, ConcurrencyMode};
use crate::error::{Error, MetadataError};
use crate::id::EntityId;
use crate::types::SqlType;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// What a property maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    /// Part of the primary key.
    Id,
    /// Plain column.
    Scalar,
    /// Optimistic-concurrency version column.
    Version,
    /// Foreign key column referencing `target`'s id. The bean holds the key value.
    ToOne { target: &'static str },
    /// Collection of `target` beans whose `mapped_by` to-one points back here. No column.
    ToMany {
        target: &'static str,
        mapped_by: &'static str,
    },
}

/// Values the runtime fills in on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GeneratedValue {
    #[default]
    None,
    /// Store-assigned id returned by the insert.
    Identity,
    /// Set once at insert.
    CreatedTimestamp,
    /// Set at insert and at every update.
    UpdatedTimestamp,
}

/// Cascade flags of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cascade {
    pub save: bool,
    pub delete: bool,
}

/// One entry of an entity's property table.
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    /// Position in the bean's value buffer.
    pub index: usize,
    pub name: &'static str,
    pub column: &'static str,
    pub sql_type: SqlType,
    pub kind: PropertyKind,
    pub insertable: bool,
    pub updatable: bool,
    pub generated: GeneratedValue,
    pub cascade: Cascade,
}

impl PropertyDescriptor {
    fn base(name: &'static str, sql_type: SqlType, kind: PropertyKind) -> Self {
        Self {
            index: 0,
            name,
            column: name,
            sql_type,
            kind,
            insertable: true,
            updatable: true,
            generated: GeneratedValue::None,
            cascade: Cascade::default(),
        }
    }

    /// An id property.
    pub fn id(name: &'static str, sql_type: SqlType) -> Self {
        let mut p = Self::base(name, sql_type, PropertyKind::Id);
        p.updatable = false;
        p
    }

    pub fn scalar(name: &'static str, sql_type: SqlType) -> Self {
        Self::base(name, sql_type, PropertyKind::Scalar)
    }

    /// A BIGINT version column, starting at 1 on insert.
    pub fn version(name: &'static str) -> Self {
        Self::base(name, SqlType::BigInt, PropertyKind::Version)
    }

    /// A to-one association stored in `column`, typed as the target's id.
    pub fn to_one(
        name: &'static str,
        column: &'static str,
        target: &'static str,
        sql_type: SqlType,
    ) -> Self {
        let mut p = Self::base(name, sql_type, PropertyKind::ToOne { target });
        p.column = column;
        p
    }

    /// A to-many association loaded through `target.mapped_by`.
    pub fn to_many(name: &'static str, target: &'static str, mapped_by: &'static str) -> Self {
        let mut p = Self::base(name, SqlType::BigInt, PropertyKind::ToMany { target, mapped_by });
        p.column = "";
        p.insertable = false;
        p.updatable = false;
        p
    }

    pub fn column(mut self, column: &'static str) -> Self {
        self.column = column;
        self
    }

    /// Store-generated identity id.
    pub fn identity(mut self) -> Self {
        self.generated = GeneratedValue::Identity;
        self.insertable = false;
        self
    }

    pub fn generated(mut self, generated: GeneratedValue) -> Self {
        self.generated = generated;
        self
    }

    pub fn not_insertable(mut self) -> Self {
        self.insertable = false;
        self
    }

    pub fn not_updatable(mut self) -> Self {
        self.updatable = false;
        self
    }

    pub fn cascade_save(mut self) -> Self {
        self.cascade.save = true;
        self
    }

    pub fn cascade_delete(mut self) -> Self {
        self.cascade.delete = true;
        self
    }

    pub fn cascade_all(self) -> Self {
        self.cascade_save().cascade_delete()
    }

    pub fn is_id(&self) -> bool {
        self.kind == PropertyKind::Id
    }

    pub fn is_version(&self) -> bool {
        self.kind == PropertyKind::Version
    }

    /// Does this property map to a column of the entity's table?
    pub fn has_column(&self) -> bool {
        !matches!(self.kind, PropertyKind::ToMany { .. })
    }

    pub fn is_association(&self) -> bool {
        matches!(
            self.kind,
            PropertyKind::ToOne { .. } | PropertyKind::ToMany { .. }
        )
    }

    /// Target entity of an association.
    pub fn target(&self) -> Option<&'static str> {
        match self.kind {
            PropertyKind::ToOne { target } | PropertyKind::ToMany { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// Metadata for one entity type.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub name: &'static str,
    pub table: &'static str,
    properties: Vec<PropertyDescriptor>,
    by_name: HashMap<&'static str, usize>,
    id_indexes: Vec<usize>,
    version_index: Option<usize>,
    natural_key_index: Option<usize>,
    pub cache_policy: Option<CachePolicy>,
    pub concurrency: Option<ConcurrencyMode>,
    /// Lazy-load batch size hint for this type.
    pub lazy_batch_size: Option<usize>,
    recurse_skippable: bool,
}

impl EntityDescriptor {
    pub fn builder(name: &'static str, table: &'static str) -> EntityDescriptorBuilder {
        EntityDescriptorBuilder {
            name,
            table,
            properties: Vec::new(),
            natural_key: None,
            cache_policy: None,
            concurrency: None,
            lazy_batch_size: None,
        }
    }

    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.by_name.get(name).map(|&i| &self.properties[i])
    }

    /// Index of a property, or a metadata error naming it.
    pub fn property_index(&self, name: &str) -> Result<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::unknown_property(self.name, name))
    }

    pub fn property_at(&self, index: usize) -> &PropertyDescriptor {
        &self.properties[index]
    }

    pub fn id_indexes(&self) -> &[usize] {
        &self.id_indexes
    }

    /// The first id property; composite ids have more, see [`Self::id_indexes`].
    pub fn id_property(&self) -> &PropertyDescriptor {
        &self.properties[self.id_indexes[0]]
    }

    pub fn version_property(&self) -> Option<&PropertyDescriptor> {
        self.version_index.map(|i| &self.properties[i])
    }

    pub fn natural_key_property(&self) -> Option<&PropertyDescriptor> {
        self.natural_key_index.map(|i| &self.properties[i])
    }

    /// True when no association of this type cascades saves, so an
    /// unmodified bean of this type never needs a cascade traversal.
    pub fn recurse_skippable(&self) -> bool {
        self.recurse_skippable
    }

    /// Properties that map to a column, in table order.
    pub fn column_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.iter().filter(|p| p.has_column())
    }

    pub fn to_many_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties
            .iter()
            .filter(|p| matches!(p.kind, PropertyKind::ToMany { .. }))
    }

    pub fn to_one_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties
            .iter()
            .filter(|p| matches!(p.kind, PropertyKind::ToOne { .. }))
    }

    pub fn has_identity(&self) -> bool {
        self.id_indexes
            .iter()
            .any(|&i| self.properties[i].generated == GeneratedValue::Identity)
    }

    /// Build the id of a bean from its value buffer.
    pub fn id_from_values(&self, values: &[Value]) -> EntityId {
        if let [single] = self.id_indexes.as_slice() {
            EntityId::single(values[*single].clone())
        } else {
            EntityId::composite(
                self.id_indexes
                    .iter()
                    .map(|&i| (self.properties[i].name, values[i].clone()))
                    .collect(),
            )
        }
    }

    /// Id component values in id-property order.
    pub fn id_values(&self, id: &EntityId) -> Result<Vec<Value>> {
        let values: Vec<Value> = id.values().into_iter().cloned().collect();
        if values.len() == self.id_indexes.len() {
            Ok(values)
        } else {
            Err(Error::Metadata(MetadataError {
                entity: Some(self.name.to_string()),
                property: None,
                message: format!(
                    "id {id} has {} components, {} expects {}",
                    values.len(),
                    self.name,
                    self.id_indexes.len()
                ),
            }))
        }
    }
}

/// Builder for [`EntityDescriptor`]. Property indexes follow insertion order.
#[derive(Debug)]
pub struct EntityDescriptorBuilder {
    name: &'static str,
    table: &'static str,
    properties: Vec<PropertyDescriptor>,
    natural_key: Option<&'static str>,
    cache_policy: Option<CachePolicy>,
    concurrency: Option<ConcurrencyMode>,
    lazy_batch_size: Option<usize>,
}

impl EntityDescriptorBuilder {
    pub fn property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.push(property);
        self
    }

    /// Name the scalar property whose values map one-to-one onto ids.
    pub fn natural_key(mut self, property: &'static str) -> Self {
        self.natural_key = Some(property);
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    pub fn concurrency(mut self, mode: ConcurrencyMode) -> Self {
        self.concurrency = Some(mode);
        self
    }

    pub fn lazy_batch_size(mut self, n: usize) -> Self {
        self.lazy_batch_size = Some(n);
        self
    }

    /// Validate the property table on its own. Cross-entity checks happen in
    /// [`RegistryBuilder::build`].
    pub fn build(self) -> Result<EntityDescriptor> {
        let name = self.name;
        let fail = |property: Option<&str>, message: String| {
            Err(Error::Metadata(MetadataError {
                entity: Some(name.to_string()),
                property: property.map(str::to_string),
                message,
            }))
        };

        let mut properties = self.properties;
        let mut by_name = HashMap::new();
        let mut id_indexes = Vec::new();
        let mut version_index = None;
        for (index, property) in properties.iter_mut().enumerate() {
            property.index = index;
            if by_name.insert(property.name, index).is_some() {
                return fail(
                    Some(property.name),
                    format!("duplicate property '{}' on {name}", property.name),
                );
            }
            match property.kind {
                PropertyKind::Id => id_indexes.push(index),
                PropertyKind::Version => {
                    if version_index.replace(index).is_some() {
                        return fail(
                            Some(property.name),
                            format!("{name} declares more than one version property"),
                        );
                    }
                    if !property.sql_type.is_versionable() {
                        return fail(
                            Some(property.name),
                            format!(
                                "version property '{}' has non-versionable type {}",
                                property.name,
                                property.sql_type.sql_name()
                            ),
                        );
                    }
                }
                _ => {}
            }
        }
        if id_indexes.is_empty() {
            return fail(None, format!("{name} has no id property"));
        }

        let natural_key_index = match self.natural_key {
            Some(nk) => match by_name.get(nk) {
                Some(&i) if properties[i].kind == PropertyKind::Scalar => Some(i),
                _ => {
                    return fail(
                        Some(nk),
                        format!("natural key '{nk}' is not a scalar property of {name}"),
                    );
                }
            },
            None => None,
        };

        let recurse_skippable = !properties
            .iter()
            .any(|p| p.is_association() && p.cascade.save);

        Ok(EntityDescriptor {
            name,
            table: self.table,
            properties,
            by_name,
            id_indexes,
            version_index,
            natural_key_index,
            cache_policy: self.cache_policy,
            concurrency: self.concurrency,
            lazy_batch_size: self.lazy_batch_size,
            recurse_skippable,
        })
    }
}

/// Immutable map of entity name to descriptor.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    descriptors: HashMap<&'static str, Arc<EntityDescriptor>>,
}

impl DescriptorRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up a descriptor, failing with a metadata error for unknown names.
    pub fn get(&self, entity: &str) -> Result<&Arc<EntityDescriptor>> {
        self.descriptors
            .get(entity)
            .ok_or_else(|| Error::unknown_entity(entity))
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.descriptors.contains_key(entity)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.descriptors.values()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    pending: Vec<Result<EntityDescriptor>>,
}

impl RegistryBuilder {
    /// Add a descriptor; builder errors surface from [`Self::build`].
    pub fn register(mut self, descriptor: EntityDescriptorBuilder) -> Self {
        self.pending.push(descriptor.build());
        self
    }

    /// Validate association targets and `mapped_by` references, then freeze.
    pub fn build(self) -> Result<DescriptorRegistry> {
        let mut descriptors: HashMap<&'static str, Arc<EntityDescriptor>> = HashMap::new();
        for descriptor in self.pending {
            let descriptor = descriptor?;
            let name = descriptor.name;
            if descriptors.insert(name, Arc::new(descriptor)).is_some() {
                return Err(Error::Metadata(MetadataError {
                    entity: Some(name.to_string()),
                    property: None,
                    message: format!("entity '{name}' registered twice"),
                }));
            }
        }

        for descriptor in descriptors.values() {
            for property in descriptor.properties() {
                let fail = |message: String| {
                    Err(Error::Metadata(MetadataError {
                        entity: Some(descriptor.name.to_string()),
                        property: Some(property.name.to_string()),
                        message,
                    }))
                };
                match property.kind {
                    PropertyKind::ToOne { target } => {
                        let Some(target_desc) = descriptors.get(target) else {
                            return fail(format!("unknown association target '{target}'"));
                        };
                        if target_desc.id_indexes().len() != 1 {
                            return fail(format!(
                                "to-one target '{target}' must have a single-column id"
                            ));
                        }
                    }
                    PropertyKind::ToMany { target, mapped_by } => {
                        let Some(target_desc) = descriptors.get(target) else {
                            return fail(format!("unknown association target '{target}'"));
                        };
                        match target_desc.property(mapped_by).map(|p| &p.kind) {
                            Some(PropertyKind::ToOne { target: back }) if *back == descriptor.name => {}
                            _ => {
                                return fail(format!(
                                    "mapped_by '{target}.{mapped_by}' is not a to-one back to '{}'",
                                    descriptor.name
                                ));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        tracing::debug!(entities = descriptors.len(), "Descriptor registry built");
        Ok(DescriptorRegistry { descriptors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer() -> EntityDescriptorBuilder {
        EntityDescriptor::builder("customer", "customers")
            .property(PropertyDescriptor::id("id", SqlType::BigInt).identity())
            .property(PropertyDescriptor::scalar("name", SqlType::Text))
            .property(PropertyDescriptor::scalar("email", SqlType::Text))
            .property(PropertyDescriptor::to_many("orders", "order", "customer"))
            .natural_key("email")
    }

    fn order() -> EntityDescriptorBuilder {
        EntityDescriptor::builder("order", "orders")
            .property(PropertyDescriptor::id("id", SqlType::BigInt).identity())
            .property(PropertyDescriptor::scalar("status", SqlType::Text))
            .property(PropertyDescriptor::version("version"))
            .property(PropertyDescriptor::to_one(
                "customer",
                "customer_id",
                "customer",
                SqlType::BigInt,
            ))
            .property(PropertyDescriptor::to_many("lines", "order_line", "order").cascade_all())
    }

    fn order_line() -> EntityDescriptorBuilder {
        EntityDescriptor::builder("order_line", "order_lines")
            .property(PropertyDescriptor::id("id", SqlType::BigInt).identity())
            .property(PropertyDescriptor::to_one("order", "order_id", "order", SqlType::BigInt))
            .property(PropertyDescriptor::scalar("qty", SqlType::Integer))
    }

    #[test]
    fn test_registry_builds_and_indexes() {
        let registry = DescriptorRegistry::builder()
            .register(customer())
            .register(order())
            .register(order_line())
            .build()
            .unwrap();
        assert_eq!(registry.len(), 3);

        let order = registry.get("order").unwrap();
        assert_eq!(order.property_index("status").unwrap(), 1);
        assert_eq!(order.version_property().unwrap().name, "version");
        assert_eq!(order.id_property().name, "id");
        assert!(order.has_identity());
        assert_eq!(order.column_properties().count(), 4);
        assert!(!order.recurse_skippable());
        assert!(registry.get("customer").unwrap().recurse_skippable());
        assert_eq!(
            registry
                .get("customer")
                .unwrap()
                .natural_key_property()
                .unwrap()
                .name,
            "email"
        );
        assert!(registry.get("invoice").is_err());
    }

    #[test]
    fn test_id_from_values() {
        let desc = EntityDescriptor::builder("line", "lines")
            .property(PropertyDescriptor::id("order_id", SqlType::BigInt))
            .property(PropertyDescriptor::id("line_no", SqlType::Integer))
            .property(PropertyDescriptor::scalar("qty", SqlType::Integer))
            .build()
            .unwrap();
        let id = desc.id_from_values(&[Value::BigInt(1), Value::Int(2), Value::Int(9)]);
        assert!(id.is_composite());
        assert_eq!(desc.id_values(&id).unwrap().len(), 2);
        assert!(desc.id_values(&EntityId::from(1_i64)).is_err());
    }

    #[test]
    fn test_invalid_descriptors_rejected() {
        let no_id = EntityDescriptor::builder("x", "x")
            .property(PropertyDescriptor::scalar("a", SqlType::Text))
            .build();
        assert!(no_id.is_err());

        let dup = EntityDescriptor::builder("x", "x")
            .property(PropertyDescriptor::id("id", SqlType::BigInt))
            .property(PropertyDescriptor::scalar("id", SqlType::Text))
            .build();
        assert!(dup.is_err());

        let bad_version = EntityDescriptor::builder("x", "x")
            .property(PropertyDescriptor::id("id", SqlType::BigInt))
            .property(PropertyDescriptor {
                sql_type: SqlType::Text,
                ..PropertyDescriptor::version("v")
            })
            .build();
        assert!(bad_version.is_err());

        let bad_nk = EntityDescriptor::builder("x", "x")
            .property(PropertyDescriptor::id("id", SqlType::BigInt))
            .natural_key("missing")
            .build();
        assert!(bad_nk.is_err());
    }

    #[test]
    fn test_collection_owner_needs_single_column_id() {
        let shipment = EntityDescriptor::builder("shipment", "shipments")
            .property(PropertyDescriptor::id("region", SqlType::Text))
            .property(PropertyDescriptor::id("number", SqlType::BigInt))
            .property(PropertyDescriptor::to_many("parcels", "parcel", "shipment"));
        let parcel = EntityDescriptor::builder("parcel", "parcels")
            .property(PropertyDescriptor::id("id", SqlType::BigInt))
            .property(PropertyDescriptor::to_one("shipment", "shipment_id", "shipment", SqlType::BigInt));
        let err = DescriptorRegistry::builder()
            .register(shipment)
            .register(parcel)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("single-column id"));
    }

    #[test]
    fn test_dangling_targets_rejected() {
        let err = DescriptorRegistry::builder().register(order()).build().unwrap_err();
        assert!(err.to_string().contains("unknown association target"));

        let wrong_back = EntityDescriptor::builder("customer", "customers")
            .property(PropertyDescriptor::id("id", SqlType::BigInt))
            .property(PropertyDescriptor::to_many("orders", "order", "status"));
        let err = DescriptorRegistry::builder()
            .register(wrong_back)
            .register(order())
            .register(order_line())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("mapped_by"));
    }
}
