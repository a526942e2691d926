//! The caller-side value model.
//!
//! Values are cheap-to-clone graphs: scalars are inline, strings and
//! byte strings are shared `Rc` slices, and containers are
//! `Rc<RefCell<…>>` so shared subtrees (and cycles) are expressible —
//! the copy pipeline preserves that sharing through the cache.

use std::cell::RefCell;
use std::hash::BuildHasher;
use std::rc::Rc;

use hashbrown::HashMap;

/// Fixed seeds so the hash of an identifier or array key agrees across
/// every process attached to the same region.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

/// Stable hash of a byte string.
pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
    let state = ahash::RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3);
    state.hash_one(bytes)
}

/// An application value as stored into and fetched out of the cache.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Array(Rc<RefCell<ArrayValue>>),
    Object(Rc<ObjectValue>),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn bytes(b: &[u8]) -> Value {
        Value::Bytes(Rc::from(b))
    }

    pub fn array(a: ArrayValue) -> Value {
        Value::Array(Rc::new(RefCell::new(a)))
    }

    pub fn object(class: &str, properties: ArrayValue) -> Value {
        Value::Object(Rc::new(ObjectValue {
            class: Rc::from(class),
            properties,
        }))
    }

    /// Scalars may be updated in place through `Cache::update`.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) | Value::Bytes(_)
        )
    }
}

/// Structural equality. Diverges on cyclic graphs; callers comparing
/// cyclic values must walk them by hand.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Value::Object(a), Value::Object(b)) => {
                a.class == b.class && a.properties == b.properties
            }
            _ => false,
        }
    }
}

/// A key of an ordered container: integer or string, as in the wire
/// format of most dynamic-language maps.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArrayKey {
    Int(i64),
    Str(Rc<str>),
}

impl ArrayKey {
    pub fn str(s: &str) -> ArrayKey {
        ArrayKey::Str(Rc::from(s))
    }

    /// Hash used for bucket placement in the pooled mirror. Integer
    /// keys hash to themselves; string keys through the stable hasher.
    pub(crate) fn stable_hash(&self) -> u64 {
        match self {
            ArrayKey::Int(i) => *i as u64,
            ArrayKey::Str(s) => hash_bytes(s.as_bytes()),
        }
    }
}

/// An insertion-ordered map from `ArrayKey` to `Value`.
///
/// Replacing an existing key keeps its original position, matching the
/// semantics the copy pipeline preserves through the cache.
#[derive(Default, Debug)]
pub struct ArrayValue {
    entries: Vec<(ArrayKey, Value)>,
    index: HashMap<ArrayKey, usize>,
}

impl ArrayValue {
    pub fn new() -> ArrayValue {
        ArrayValue::default()
    }

    pub fn insert(&mut self, key: ArrayKey, value: Value) {
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    /// Append with the next integer key (one past the largest seen).
    pub fn push(&mut self, value: Value) {
        let next = self
            .entries
            .iter()
            .filter_map(|(k, _)| match k {
                ArrayKey::Int(i) => Some(*i),
                ArrayKey::Str(_) => None,
            })
            .max()
            .map_or(0, |m| m + 1);
        self.insert(ArrayKey::Int(next), value);
    }

    pub fn get(&self, key: &ArrayKey) -> Option<&Value> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ArrayKey, Value)> {
        self.entries.iter()
    }
}

impl PartialEq for ArrayValue {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl FromIterator<(ArrayKey, Value)> for ArrayValue {
    fn from_iter<T: IntoIterator<Item = (ArrayKey, Value)>>(iter: T) -> Self {
        let mut a = ArrayValue::new();
        for (k, v) in iter {
            a.insert(k, v);
        }
        a
    }
}

/// An object: a class name plus an ordered property map. Objects are
/// always carried through the serializer, never structurally copied.
#[derive(Debug)]
pub struct ObjectValue {
    pub class: Rc<str>,
    pub properties: ArrayValue,
}
