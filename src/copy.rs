//! The value copy pipeline.
//!
//! `store_value` deep-copies a caller `Value` into pooled
//! `#[repr(C)]` records; `fetch_value` rebuilds a native value graph
//! from them. Containers are mirrored as a prime-sized bucket array
//! plus an insertion-order list. One "already copied" map per
//! top-level copy keeps shared subtrees shared and terminates on
//! cycles; it exists only while the root is a container.
//!
//! Objects always travel through the serializer; whole containers do
//! too when one is configured. A serialized payload is stored as a
//! byte string tagged with the original kind.
//!
//! Any allocation failure aborts the copy with `None`; the caller
//! destroys the pool, so a partial copy is never reachable.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use hashbrown::HashMap;
use log::warn;

use crate::cache::make_prime;
use crate::pool::Pool;
use crate::serializer::{default_serializer, Serializer};
use crate::shm::layout::{
    ArrayNode, ArrayRecord, ValueRecord, AKEY_INT, AKEY_STR, KIND_ARRAY, KIND_BOOL, KIND_BYTES,
    KIND_FLOAT, KIND_INT, KIND_NULL, KIND_OBJECT, KIND_STR, NONE, VFLAG_SERIALIZED,
};
use crate::shm::Sma;
use crate::value::{ArrayKey, ArrayValue, Value};

/// Direction of a copy; affects only refcount initialization of the
/// destination records. `In`/`Out` produce fresh refcount-1 nodes;
/// `Other` mirrors the source count (read-modify-write paths).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CopyMode {
    In,
    Out,
    Other,
}

/// Everything a copy needs: the destination pool, the direction, and
/// the configured serializer (if any).
pub struct CopyContext<'a> {
    pub pool: &'a Pool,
    pub mode: CopyMode,
    pub serializer: Option<Arc<dyn Serializer>>,
}

impl CopyContext<'_> {
    /// Objects serialize through the configured serializer, falling
    /// back to the built-in one.
    fn effective_serializer(&self) -> Arc<dyn Serializer> {
        self.serializer.clone().unwrap_or_else(default_serializer)
    }
}

type CopiedMap = HashMap<usize, u64>;

/// Deep-copy `src` into `ctx.pool`; returns the root record offset.
pub fn store_value(src: &Value, ctx: &CopyContext) -> Option<u64> {
    let mut copied = match src {
        Value::Array(_) => Some(CopiedMap::new()),
        _ => None,
    };
    store_node(src, ctx, &mut copied)
}

fn init_refs(src: &Value, mode: CopyMode) -> u32 {
    match mode {
        CopyMode::In | CopyMode::Out => 1,
        CopyMode::Other => match src {
            Value::Str(s) => Rc::strong_count(s) as u32,
            Value::Bytes(b) => Rc::strong_count(b) as u32,
            Value::Array(a) => Rc::strong_count(a) as u32,
            Value::Object(o) => Rc::strong_count(o) as u32,
            _ => 1,
        },
    }
}

fn new_record(ctx: &CopyContext, kind: u32, flags: u32, refs: u32) -> Option<u64> {
    let off = ctx.pool.alloc(std::mem::size_of::<ValueRecord>())?;
    unsafe {
        let rec = ctx.pool.sma().deref_mut::<ValueRecord>(off);
        rec.kind = kind;
        rec.flags = flags;
        rec.refs = refs;
        rec._pad = 0;
        rec.data = 0;
        rec.len = 0;
    }
    Some(off)
}

fn store_scalar(ctx: &CopyContext, src: &Value, kind: u32, bits: u64) -> Option<u64> {
    let off = new_record(ctx, kind, 0, init_refs(src, ctx.mode))?;
    unsafe {
        ctx.pool.sma().deref_mut::<ValueRecord>(off).data = bits;
    }
    Some(off)
}

fn store_blob(ctx: &CopyContext, src: &Value, kind: u32, flags: u32, bytes: &[u8]) -> Option<u64> {
    let off = new_record(ctx, kind, flags, init_refs(src, ctx.mode))?;
    let data = ctx.pool.alloc_bytes(bytes)?;
    unsafe {
        let rec = ctx.pool.sma().deref_mut::<ValueRecord>(off);
        rec.data = data;
        rec.len = bytes.len() as u64;
    }
    Some(off)
}

fn store_node(src: &Value, ctx: &CopyContext, copied: &mut Option<CopiedMap>) -> Option<u64> {
    match src {
        Value::Null => store_scalar(ctx, src, KIND_NULL, 0),
        Value::Bool(b) => store_scalar(ctx, src, KIND_BOOL, *b as u64),
        Value::Int(i) => store_scalar(ctx, src, KIND_INT, *i as u64),
        Value::Float(f) => store_scalar(ctx, src, KIND_FLOAT, f.to_bits()),
        Value::Str(s) => store_blob(ctx, src, KIND_STR, 0, s.as_bytes()),
        Value::Bytes(b) => store_blob(ctx, src, KIND_BYTES, 0, b),

        Value::Array(rc) => {
            if ctx.serializer.is_some() {
                let bytes = ctx.effective_serializer().serialize(src)?;
                return store_blob(ctx, src, KIND_ARRAY, VFLAG_SERIALIZED, &bytes);
            }

            let addr = Rc::as_ptr(rc) as usize;
            if let Some(map) = copied.as_mut() {
                if let Some(&off) = map.get(&addr) {
                    // Revisited node: reuse the destination and count
                    // the extra reference.
                    unsafe {
                        ctx.pool.sma().deref_mut::<ValueRecord>(off).refs += 1;
                    }
                    return Some(off);
                }
            }

            let off = new_record(ctx, KIND_ARRAY, 0, init_refs(src, ctx.mode))?;
            if let Some(map) = copied.as_mut() {
                map.insert(addr, off);
            }
            let array_off = store_array(&rc.borrow(), ctx, copied)?;
            unsafe {
                ctx.pool.sma().deref_mut::<ValueRecord>(off).data = array_off;
            }
            Some(off)
        }

        Value::Object(_) => {
            let bytes = ctx.effective_serializer().serialize(src)?;
            store_blob(ctx, src, KIND_OBJECT, VFLAG_SERIALIZED, &bytes)
        }
    }
}

fn store_array(array: &ArrayValue, ctx: &CopyContext, copied: &mut Option<CopiedMap>) -> Option<u64> {
    let sma = ctx.pool.sma();
    let num_buckets = make_prime(array.len()) as u64;

    let arr_off = ctx.pool.alloc(std::mem::size_of::<ArrayRecord>())?;
    let buckets_off = ctx.pool.alloc_zeroed(num_buckets as usize * 8)?;
    unsafe {
        let arr = sma.deref_mut::<ArrayRecord>(arr_off);
        arr.buckets = buckets_off;
        arr.num_buckets = num_buckets;
        arr.list_head = NONE;
        arr.list_tail = NONE;
        arr.count = array.len() as u64;
        arr._pad = 0;
    }

    for (key, val) in array.iter() {
        let node_off = ctx.pool.alloc(std::mem::size_of::<ArrayNode>())?;
        let hash = key.stable_hash();
        let (key_kind, key_len, key_data) = match key {
            ArrayKey::Int(i) => (AKEY_INT, 0u32, *i as u64),
            ArrayKey::Str(s) => (AKEY_STR, s.len() as u32, ctx.pool.alloc_bytes(s.as_bytes())?),
        };
        let value_off = store_node(val, ctx, copied)?;

        unsafe {
            let bucket_cell = sma.deref_mut::<u64>(buckets_off + (hash % num_buckets) * 8);
            let node = sma.deref_mut::<ArrayNode>(node_off);
            node.hash = hash;
            node.key_kind = key_kind;
            node.key_len = key_len;
            node.key_data = key_data;
            node.value = value_off;
            node.next_in_bucket = *bucket_cell;
            node.list_next = NONE;
            *bucket_cell = node_off;

            let arr = sma.deref_mut::<ArrayRecord>(arr_off);
            if arr.list_head == NONE {
                arr.list_head = node_off;
            } else {
                sma.deref_mut::<ArrayNode>(arr.list_tail).list_next = node_off;
            }
            arr.list_tail = node_off;
        }
    }

    Some(arr_off)
}

type FetchedMap = HashMap<u64, Rc<RefCell<ArrayValue>>>;

/// Rebuild a native value from the pooled records rooted at `off`.
///
/// # Safety
/// `off` must be the root record of a live (not yet freed) entry in
/// `sma`.
pub unsafe fn fetch_value(
    sma: &Arc<Sma>,
    off: u64,
    serializer: Option<&Arc<dyn Serializer>>,
) -> Value {
    let root = sma.deref::<ValueRecord>(off);
    let mut fetched = if root.kind == KIND_ARRAY && root.flags & VFLAG_SERIALIZED == 0 {
        Some(FetchedMap::new())
    } else {
        None
    };
    fetch_node(sma, off, serializer, &mut fetched)
}

unsafe fn fetch_node(
    sma: &Arc<Sma>,
    off: u64,
    serializer: Option<&Arc<dyn Serializer>>,
    fetched: &mut Option<FetchedMap>,
) -> Value {
    let rec = sma.deref::<ValueRecord>(off);

    if rec.flags & VFLAG_SERIALIZED != 0 {
        let bytes = sma.bytes(rec.data, rec.len as usize);
        let ser = serializer.cloned().unwrap_or_else(default_serializer);
        return match ser.unserialize(bytes) {
            Some(v) => v,
            None => {
                warn!(
                    "failed to unserialize a {} byte cached payload; substituting null",
                    rec.len
                );
                Value::Null
            }
        };
    }

    match rec.kind {
        KIND_NULL => Value::Null,
        KIND_BOOL => Value::Bool(rec.data != 0),
        KIND_INT => Value::Int(rec.data as i64),
        KIND_FLOAT => Value::Float(f64::from_bits(rec.data)),
        KIND_STR => {
            let bytes = sma.bytes(rec.data, rec.len as usize);
            match std::str::from_utf8(bytes) {
                Ok(s) => Value::str(s),
                Err(_) => Value::bytes(bytes),
            }
        }
        KIND_BYTES => Value::bytes(sma.bytes(rec.data, rec.len as usize)),

        KIND_ARRAY => {
            if let Some(map) = fetched.as_ref() {
                if let Some(rc) = map.get(&rec.data) {
                    return Value::Array(Rc::clone(rc));
                }
            }

            // Register before filling so self-references resolve.
            let rc = Rc::new(RefCell::new(ArrayValue::new()));
            if let Some(map) = fetched.as_mut() {
                map.insert(rec.data, Rc::clone(&rc));
            }

            let arr = sma.deref::<ArrayRecord>(rec.data);
            let mut node_off = arr.list_head;
            while node_off != NONE {
                let node = sma.deref::<ArrayNode>(node_off);
                let key = match node.key_kind {
                    AKEY_INT => ArrayKey::Int(node.key_data as i64),
                    _ => {
                        let bytes = sma.bytes(node.key_data, node.key_len as usize);
                        ArrayKey::str(std::str::from_utf8(bytes).unwrap_or(""))
                    }
                };
                let val = fetch_node(sma, node.value, serializer, fetched);
                rc.borrow_mut().insert(key, val);
                node_off = node.list_next;
            }
            Value::Array(rc)
        }

        _ => Value::Null,
    }
}

/// Overwrite a pooled scalar record in place with a new scalar value.
/// Strings and byte strings may grow through the entry's own pool.
/// Returns false for container or object replacements.
pub fn rewrite_scalar(pool: &Pool, rec_off: u64, new: &Value, mode: CopyMode) -> bool {
    let sma = pool.sma();
    unsafe {
        let rec = sma.deref_mut::<ValueRecord>(rec_off);
        let refs = match mode {
            CopyMode::Other => rec.refs,
            CopyMode::In | CopyMode::Out => 1,
        };
        let (kind, bytes): (u32, Option<&[u8]>) = match new {
            Value::Null => (KIND_NULL, None),
            Value::Bool(b) => {
                rec.data = *b as u64;
                (KIND_BOOL, None)
            }
            Value::Int(i) => {
                rec.data = *i as u64;
                (KIND_INT, None)
            }
            Value::Float(f) => {
                rec.data = f.to_bits();
                (KIND_FLOAT, None)
            }
            Value::Str(s) => (KIND_STR, Some(s.as_bytes())),
            Value::Bytes(b) => (KIND_BYTES, Some(&b[..])),
            Value::Array(_) | Value::Object(_) => return false,
        };

        if let Some(src) = bytes {
            let reusable = (rec.kind == KIND_STR || rec.kind == KIND_BYTES)
                && rec.flags & VFLAG_SERIALIZED == 0
                && src.len() as u64 <= rec.len;
            let data = if reusable {
                rec.data
            } else {
                match pool.alloc_bytes(src) {
                    Some(off) => off,
                    None => return false,
                }
            };
            if reusable {
                sma.copy_in(data, src);
                *sma.ptr(data + src.len() as u64) = 0;
            }
            let rec = sma.deref_mut::<ValueRecord>(rec_off);
            rec.data = data;
            rec.len = src.len() as u64;
        } else {
            rec.len = 0;
        }

        let rec = sma.deref_mut::<ValueRecord>(rec_off);
        rec.kind = kind;
        rec.flags = 0;
        rec.refs = refs;
    }
    true
}
