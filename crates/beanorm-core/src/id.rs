//! Entity identity: ids and (entity, id) keys.

use crate::value::Value;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone)]
enum IdRepr {
    Single(Value),
    Composite(Vec<(&'static str, Value)>),
}

/// The value(s) identifying one row of an entity type.
///
/// Either a single scalar or an ordered list of named scalars. The hash is
/// computed once at construction; equality ignores integer width so an id
/// typed by the application matches the one read back from the store.
#[derive(Clone)]
pub struct EntityId {
    repr: IdRepr,
    hash: u64,
}

impl EntityId {
    /// A single-column id.
    pub fn single(value: impl Into<Value>) -> Self {
        let repr = IdRepr::Single(value.into());
        let hash = Self::compute_hash(&repr);
        Self { repr, hash }
    }

    /// A composite id from ordered (name, value) parts.
    pub fn composite(parts: Vec<(&'static str, Value)>) -> Self {
        let repr = IdRepr::Composite(parts);
        let hash = Self::compute_hash(&repr);
        Self { repr, hash }
    }

    fn compute_hash(repr: &IdRepr) -> u64 {
        let mut hasher = DefaultHasher::new();
        match repr {
            IdRepr::Single(v) => {
                0u8.hash(&mut hasher);
                v.hash_key(&mut hasher);
            }
            IdRepr::Composite(parts) => {
                1u8.hash(&mut hasher);
                for (name, v) in parts {
                    name.hash(&mut hasher);
                    v.hash_key(&mut hasher);
                }
            }
        }
        hasher.finish()
    }

    /// Component values in order.
    pub fn values(&self) -> Vec<&Value> {
        match &self.repr {
            IdRepr::Single(v) => vec![v],
            IdRepr::Composite(parts) => parts.iter().map(|(_, v)| v).collect(),
        }
    }

    /// The value of a single-column id.
    pub fn as_single(&self) -> Option<&Value> {
        match &self.repr {
            IdRepr::Single(v) => Some(v),
            IdRepr::Composite(_) => None,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.repr, IdRepr::Composite(_))
    }

    /// True when any component is NULL. Such ids belong to unsaved beans.
    pub fn is_null(&self) -> bool {
        match &self.repr {
            IdRepr::Single(v) => v.is_null(),
            IdRepr::Composite(parts) => parts.iter().any(|(_, v)| v.is_null()),
        }
    }

    /// The cached hash.
    pub fn stable_hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for EntityId {
    fn eq(&self, other: &Self) -> bool {
        if self.hash != other.hash {
            return false;
        }
        match (&self.repr, &other.repr) {
            (IdRepr::Single(a), IdRepr::Single(b)) => a.key_eq(b),
            (IdRepr::Composite(a), IdRepr::Composite(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b.iter())
                        .all(|((na, va), (nb, vb))| na == nb && va.key_eq(vb))
            }
            _ => false,
        }
    }
}

impl Eq for EntityId {}

impl Hash for EntityId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({self})")
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            IdRepr::Single(v) => write!(f, "{v}"),
            IdRepr::Composite(parts) => {
                f.write_str("(")?;
                for (i, (name, v)) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}={v}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<i64> for EntityId {
    fn from(v: i64) -> Self {
        EntityId::single(Value::BigInt(v))
    }
}

impl From<i32> for EntityId {
    fn from(v: i32) -> Self {
        EntityId::single(Value::Int(v))
    }
}

impl From<&str> for EntityId {
    fn from(v: &str) -> Self {
        EntityId::single(Value::from(v))
    }
}

impl From<Value> for EntityId {
    fn from(v: Value) -> Self {
        EntityId::single(v)
    }
}

/// (entity type, id): the identity of one logical row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub entity: &'static str,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(entity: &'static str, id: impl Into<EntityId>) -> Self {
        Self {
            entity,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}
