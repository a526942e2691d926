//! Pluggable value serializers.
//!
//! A serializer turns a `Value` into bytes and back; the cache uses it
//! for object-typed values always, and for whole containers when one
//! is configured. Implementations register under a name; the cache
//! resolves its configured name lazily on first use.
//!
//! The always-available default is a tagged binary format: one-byte
//! tags, little-endian fixed-width scalars, length-prefixed strings,
//! plus a back-reference tag so shared and cyclic containers
//! round-trip with their sharing intact.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::value::{ArrayKey, ArrayValue, Value};

pub trait Serializer: Send + Sync {
    fn name(&self) -> &'static str;
    /// `None` aborts the store that requested it.
    fn serialize(&self, value: &Value) -> Option<Vec<u8>>;
    /// `None` makes the fetch produce `Value::Null` plus a diagnostic.
    fn unserialize(&self, bytes: &[u8]) -> Option<Value>;
}

type Registry = RwLock<HashMap<String, Arc<dyn Serializer>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, Arc<dyn Serializer>> = HashMap::new();
        let default: Arc<dyn Serializer> = Arc::new(BinarySerializer);
        map.insert(default.name().to_string(), default);
        RwLock::new(map)
    })
}

/// Make a serializer resolvable by name. Last registration wins.
pub fn register_serializer(serializer: Arc<dyn Serializer>) {
    let name = serializer.name().to_string();
    registry().write().insert(name, serializer);
}

pub fn find_serializer(name: &str) -> Option<Arc<dyn Serializer>> {
    registry().read().get(name).cloned()
}

/// The built-in tagged binary serializer; always registered.
pub fn default_serializer() -> Arc<dyn Serializer> {
    find_serializer(BinarySerializer.name()).expect("default serializer is always registered")
}

const TAG_NULL: u8 = 1;
const TAG_FALSE: u8 = 2;
const TAG_TRUE: u8 = 3;
const TAG_I64: u8 = 4;
const TAG_F64: u8 = 5;
const TAG_STR: u8 = 6;
const TAG_BYTES: u8 = 7;
const TAG_ARRAY: u8 = 8;
const TAG_OBJECT: u8 = 9;
const TAG_BACKREF: u8 = 10;

const KEY_INT: u8 = 0;
const KEY_STR: u8 = 1;

/// Tagged binary format over `Value`.
pub struct BinarySerializer;

impl Serializer for BinarySerializer {
    fn name(&self) -> &'static str {
        "default"
    }

    fn serialize(&self, value: &Value) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        let mut seen: HashMap<usize, u32> = HashMap::new();
        serialize_element(value, &mut buf, &mut seen);
        Some(buf)
    }

    fn unserialize(&self, bytes: &[u8]) -> Option<Value> {
        let mut arrays: Vec<Rc<RefCell<ArrayValue>>> = Vec::new();
        let (value, consumed) = deserialize_one(bytes, &mut arrays)?;
        if consumed != bytes.len() {
            return None;
        }
        Some(value)
    }
}

fn put_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_le_bytes());
}

fn serialize_key(key: &ArrayKey, buf: &mut Vec<u8>) {
    match key {
        ArrayKey::Int(i) => {
            buf.push(KEY_INT);
            buf.extend_from_slice(&i.to_le_bytes());
        }
        ArrayKey::Str(s) => {
            buf.push(KEY_STR);
            put_len(buf, s.len());
            buf.extend_from_slice(s.as_bytes());
        }
    }
}

fn serialize_element(value: &Value, buf: &mut Vec<u8>, seen: &mut HashMap<usize, u32>) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(false) => buf.push(TAG_FALSE),
        Value::Bool(true) => buf.push(TAG_TRUE),
        Value::Int(v) => {
            buf.push(TAG_I64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Float(v) => {
            buf.push(TAG_F64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Str(s) => {
            buf.push(TAG_STR);
            put_len(buf, s.len());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(TAG_BYTES);
            put_len(buf, b.len());
            buf.extend_from_slice(b);
        }
        Value::Array(rc) => {
            let addr = Rc::as_ptr(rc) as usize;
            if let Some(&id) = seen.get(&addr) {
                buf.push(TAG_BACKREF);
                buf.extend_from_slice(&id.to_le_bytes());
                return;
            }
            seen.insert(addr, seen.len() as u32);

            let array = rc.borrow();
            buf.push(TAG_ARRAY);
            put_len(buf, array.len());
            for (key, val) in array.iter() {
                serialize_key(key, buf);
                serialize_element(val, buf, seen);
            }
        }
        Value::Object(obj) => {
            buf.push(TAG_OBJECT);
            put_len(buf, obj.class.len());
            buf.extend_from_slice(obj.class.as_bytes());
            put_len(buf, obj.properties.len());
            for (key, val) in obj.properties.iter() {
                serialize_key(key, buf);
                serialize_element(val, buf, seen);
            }
        }
    }
}

fn take_len(data: &[u8]) -> Option<(usize, usize)> {
    if data.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
    Some((len, 4))
}

fn deserialize_key(data: &[u8]) -> Option<(ArrayKey, usize)> {
    match *data.first()? {
        KEY_INT => {
            if data.len() < 9 {
                return None;
            }
            let v = i64::from_le_bytes(data[1..9].try_into().unwrap());
            Some((ArrayKey::Int(v), 9))
        }
        KEY_STR => {
            let (len, used) = take_len(&data[1..])?;
            let start = 1 + used;
            let bytes = data.get(start..start + len)?;
            let s = std::str::from_utf8(bytes).ok()?;
            Some((ArrayKey::str(s), start + len))
        }
        _ => None,
    }
}

/// Deserialize one element. Returns `(value, bytes_consumed)`.
fn deserialize_one(
    data: &[u8],
    arrays: &mut Vec<Rc<RefCell<ArrayValue>>>,
) -> Option<(Value, usize)> {
    match *data.first()? {
        TAG_NULL => Some((Value::Null, 1)),
        TAG_FALSE => Some((Value::Bool(false), 1)),
        TAG_TRUE => Some((Value::Bool(true), 1)),

        TAG_I64 => {
            if data.len() < 9 {
                return None;
            }
            let v = i64::from_le_bytes(data[1..9].try_into().unwrap());
            Some((Value::Int(v), 9))
        }

        TAG_F64 => {
            if data.len() < 9 {
                return None;
            }
            let v = f64::from_le_bytes(data[1..9].try_into().unwrap());
            Some((Value::Float(v), 9))
        }

        TAG_STR => {
            let (len, used) = take_len(&data[1..])?;
            let start = 1 + used;
            let bytes = data.get(start..start + len)?;
            let s = std::str::from_utf8(bytes).ok()?;
            Some((Value::str(s), start + len))
        }

        TAG_BYTES => {
            let (len, used) = take_len(&data[1..])?;
            let start = 1 + used;
            let bytes = data.get(start..start + len)?;
            Some((Value::bytes(bytes), start + len))
        }

        TAG_ARRAY => {
            let (count, used) = take_len(&data[1..])?;
            let mut offset = 1 + used;

            // Register before filling so back-references into this
            // array (cycles) resolve.
            let rc = Rc::new(RefCell::new(ArrayValue::new()));
            arrays.push(Rc::clone(&rc));

            for _ in 0..count {
                let (key, used) = deserialize_key(&data[offset..])?;
                offset += used;
                let (val, used) = deserialize_one(&data[offset..], arrays)?;
                offset += used;
                rc.borrow_mut().insert(key, val);
            }
            Some((Value::Array(rc), offset))
        }

        TAG_OBJECT => {
            let (class_len, used) = take_len(&data[1..])?;
            let mut offset = 1 + used;
            let class_bytes = data.get(offset..offset + class_len)?;
            let class = std::str::from_utf8(class_bytes).ok()?;
            offset += class_len;

            let (count, used) = take_len(&data[offset..])?;
            offset += used;

            let mut properties = ArrayValue::new();
            for _ in 0..count {
                let (key, used) = deserialize_key(&data[offset..])?;
                offset += used;
                let (val, used) = deserialize_one(&data[offset..], arrays)?;
                offset += used;
                properties.insert(key, val);
            }
            Some((Value::object(class, properties), offset))
        }

        TAG_BACKREF => {
            if data.len() < 5 {
                return None;
            }
            let id = u32::from_le_bytes(data[1..5].try_into().unwrap()) as usize;
            let rc = arrays.get(id)?;
            Some((Value::Array(Rc::clone(rc)), 5))
        }

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: &Value) -> Value {
        let ser = BinarySerializer;
        let bytes = ser.serialize(v).unwrap();
        ser.unserialize(&bytes).unwrap()
    }

    #[test]
    fn scalars_roundtrip() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(-40),
            Value::Float(2.5),
            Value::str("héllo"),
            Value::bytes(&[0, 1, 2, 255]),
        ] {
            assert_eq!(roundtrip(&v), v);
        }
    }

    #[test]
    fn nested_arrays_and_objects_roundtrip() {
        let inner: ArrayValue = [(ArrayKey::Int(0), Value::str("zero"))].into_iter().collect();
        let v = Value::object(
            "Point",
            [
                (ArrayKey::str("x"), Value::Int(3)),
                (ArrayKey::str("list"), Value::array(inner)),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn shared_subtrees_stay_shared() {
        let shared = Rc::new(RefCell::new(
            [(ArrayKey::str("n"), Value::Int(7))].into_iter().collect(),
        ));
        let root: ArrayValue = [
            (ArrayKey::str("a"), Value::Array(Rc::clone(&shared))),
            (ArrayKey::str("b"), Value::Array(shared)),
        ]
        .into_iter()
        .collect();

        let out = roundtrip(&Value::array(root));
        let Value::Array(out) = out else { panic!() };
        let out = out.borrow();
        let (Some(Value::Array(a)), Some(Value::Array(b))) =
            (out.get(&ArrayKey::str("a")), out.get(&ArrayKey::str("b")))
        else {
            panic!()
        };
        assert!(Rc::ptr_eq(a, b));
    }

    #[test]
    fn cyclic_array_roundtrips() {
        let cell = Rc::new(RefCell::new(ArrayValue::new()));
        cell.borrow_mut()
            .insert(ArrayKey::str("me"), Value::Array(Rc::clone(&cell)));

        let out = roundtrip(&Value::Array(cell));
        let Value::Array(out) = out else { panic!() };
        let inner = out.borrow();
        let Some(Value::Array(me)) = inner.get(&ArrayKey::str("me")) else {
            panic!()
        };
        assert!(Rc::ptr_eq(&out, me));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let ser = BinarySerializer;
        let bytes = ser.serialize(&Value::str("truncate me")).unwrap();
        assert!(ser.unserialize(&bytes[..bytes.len() - 1]).is_none());
        assert!(ser.unserialize(&[]).is_none());
        assert!(ser.unserialize(&[0xEE]).is_none());
    }

    #[test]
    fn registry_resolves_default() {
        assert!(find_serializer("default").is_some());
        assert!(find_serializer("no-such").is_none());
        assert_eq!(default_serializer().name(), "default");
    }
}
