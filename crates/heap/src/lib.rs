use fxhash::FxHashMap;

mod compare;
pub use compare::compare;

mod pack;
pub use pack::{pack_key, PackedKey};

mod json;
pub use json::SerVal;

/// Longest string stored inline within its slot, in bytes.
/// Longer strings are boxed and freed with the slot on last decref.
const INLINE_STR_MAX: usize = 8;

/// Val is a handle to an interned value. Handles are stable for the life of
/// the value: so long as at least one reference is held, the same structural
/// content always resolves to the same handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Val(u32);

/// HeapField is one property of an interned object.
/// `property` is an interned string and fields are ordered by its content.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapField {
    pub property: Val,
    pub value: Val,
}

/// Node is a borrowed view of an interned value, in the shape of the JSON
/// data model. Children of compound variants are themselves handles.
#[derive(Debug, Copy, Clone)]
pub enum Node<'h> {
    Array(&'h [Val]),
    Bool(bool),
    Float(f64),
    NegInt(i64),
    Null,
    Object(&'h [HeapField]),
    PosInt(u64),
    String(&'h str),
}

#[derive(Debug)]
enum Stored {
    Free,
    Null,
    Bool(bool),
    PosInt(u64),
    NegInt(i64),
    Float(f64),
    InlineStr { len: u8, bytes: [u8; INLINE_STR_MAX] },
    String(Box<str>),
    Array(Box<[Val]>),
    Object(Box<[HeapField]>),
}

#[derive(Debug)]
struct Slot {
    refs: u32,
    hash: u64,
    stored: Stored,
}

/// Heap is reference-counted, structurally shared storage for every value
/// that crosses a collection boundary. Interning descends compound values
/// children-first, and a canonical map from content hash to live handles
/// guarantees that structurally equal values share one handle.
///
/// The heap is owned by the engine thread and has no interior locking.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    canon: FxHashMap<u64, Vec<Val>>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            canon: FxHashMap::default(),
        }
    }

    /// Number of live interned values.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn intern_null(&mut self) -> Val {
        self.intern(Stored::Null)
    }

    pub fn intern_bool(&mut self, b: bool) -> Val {
        self.intern(Stored::Bool(b))
    }

    /// Intern an unsigned integer.
    pub fn intern_u64(&mut self, n: u64) -> Val {
        self.intern(Stored::PosInt(n))
    }

    /// Intern a signed integer. Non-negative values canonicalize to the
    /// unsigned representation so that equal numbers share a handle.
    pub fn intern_i64(&mut self, n: i64) -> Val {
        if n >= 0 {
            self.intern(Stored::PosInt(n as u64))
        } else {
            self.intern(Stored::NegInt(n))
        }
    }

    /// Intern a float. Floats holding an exact integer value canonicalize
    /// to the integer representation, matching structural comparison which
    /// treats `20` and `20.0` as equal.
    pub fn intern_f64(&mut self, f: f64) -> Val {
        if f.fract() == 0.0 && f.is_finite() {
            if f >= 0.0 && f < 18446744073709551616.0 {
                return self.intern(Stored::PosInt(f as u64));
            } else if f < 0.0 && f >= i64::MIN as f64 {
                return self.intern(Stored::NegInt(f as i64));
            }
        }
        self.intern(Stored::Float(f))
    }

    pub fn intern_str(&mut self, s: &str) -> Val {
        if s.len() <= INLINE_STR_MAX {
            let mut bytes = [0u8; INLINE_STR_MAX];
            bytes[..s.len()].copy_from_slice(s.as_bytes());
            self.intern(Stored::InlineStr {
                len: s.len() as u8,
                bytes,
            })
        } else {
            self.intern(Stored::String(s.into()))
        }
    }

    /// Intern an array of previously interned items.
    /// One reference of each item is consumed by this call.
    pub fn intern_array(&mut self, items: Vec<Val>) -> Val {
        self.intern(Stored::Array(items.into_boxed_slice()))
    }

    /// Intern an object from (property, value) handle pairs, where each
    /// property is an interned string. Fields are sorted by property and a
    /// repeated property keeps its last value. One reference of every passed
    /// handle is consumed.
    pub fn intern_object(&mut self, fields: Vec<(Val, Val)>) -> Val {
        let mut fields: Vec<HeapField> = fields
            .into_iter()
            .map(|(property, value)| HeapField { property, value })
            .collect();
        fields.sort_by(|l, r| self.str_of(l.property).cmp(self.str_of(r.property)));

        let mut out: Vec<HeapField> = Vec::with_capacity(fields.len());
        for field in fields {
            let duplicate = out
                .last()
                .map_or(false, |last| {
                    self.str_of(last.property) == self.str_of(field.property)
                });
            if duplicate {
                let last = out.pop().unwrap();
                self.dec_ref(last.property);
                self.dec_ref(last.value);
            }
            out.push(field);
        }
        self.intern(Stored::Object(out.into_boxed_slice()))
    }

    /// View the value behind a handle.
    pub fn node(&self, v: Val) -> Node<'_> {
        match &self.slot(v).stored {
            Stored::Null => Node::Null,
            Stored::Bool(b) => Node::Bool(*b),
            Stored::PosInt(n) => Node::PosInt(*n),
            Stored::NegInt(n) => Node::NegInt(*n),
            Stored::Float(f) => Node::Float(*f),
            Stored::InlineStr { len, bytes } => {
                Node::String(std::str::from_utf8(&bytes[..*len as usize]).unwrap())
            }
            Stored::String(s) => Node::String(s),
            Stored::Array(items) => Node::Array(items),
            Stored::Object(fields) => Node::Object(fields),
            Stored::Free => panic!("use of a released value handle"),
        }
    }

    /// The string behind a handle, which must reference a string.
    pub fn str_of(&self, v: Val) -> &str {
        match self.node(v) {
            Node::String(s) => s,
            node => panic!("expected an interned string, found {node:?}"),
        }
    }

    /// Numeric interpretation of a handle, if it references a number.
    pub fn number(&self, v: Val) -> Option<f64> {
        match self.node(v) {
            Node::PosInt(n) => Some(n as f64),
            Node::NegInt(n) => Some(n as f64),
            Node::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Fetch the value at `property` of an interned object.
    pub fn field(&self, obj: Val, property: &str) -> Option<Val> {
        let Node::Object(fields) = self.node(obj) else {
            return None;
        };
        fields
            .binary_search_by(|f| self.str_of(f.property).cmp(property))
            .ok()
            .map(|ind| fields[ind].value)
    }

    /// Property names of an interned object, in sorted order.
    pub fn properties(&self, obj: Val) -> impl Iterator<Item = &str> {
        let fields = match self.node(obj) {
            Node::Object(fields) => fields,
            _ => &[][..],
        };
        fields.iter().map(|f| self.str_of(f.property))
    }

    pub fn inc_ref(&mut self, v: Val) {
        let slot = self.slot_mut(v);
        assert!(slot.refs > 0, "inc_ref of a released value handle");
        slot.refs += 1;
    }

    /// Drop one reference, returning the new count. A value reaching zero
    /// recursively releases its children and returns its slot to the free
    /// list. Underflow is an unrecoverable invariant violation.
    pub fn dec_ref(&mut self, v: Val) -> u32 {
        let mut returned: Option<u32> = None;
        let mut stack = vec![v];

        while let Some(v) = stack.pop() {
            let slot = self.slot_mut(v);
            assert!(slot.refs > 0, "ref-count underflow at {v:?}");
            slot.refs -= 1;
            let refs = slot.refs;
            if returned.is_none() {
                returned = Some(refs);
            }
            if refs != 0 {
                continue;
            }

            let hash = slot.hash;
            match std::mem::replace(&mut slot.stored, Stored::Free) {
                Stored::Array(items) => stack.extend(items.iter()),
                Stored::Object(fields) => {
                    for f in fields.iter() {
                        stack.push(f.property);
                        stack.push(f.value);
                    }
                }
                _ => (),
            }
            self.uncanonicalize(hash, v);
            self.free.push(v.0);
        }
        returned.unwrap()
    }

    fn slot(&self, v: Val) -> &Slot {
        &self.slots[v.0 as usize]
    }

    fn slot_mut(&mut self, v: Val) -> &mut Slot {
        &mut self.slots[v.0 as usize]
    }

    fn intern(&mut self, stored: Stored) -> Val {
        let hash = self.content_hash(&stored);

        let found = self.canon.get(&hash).and_then(|candidates| {
            candidates
                .iter()
                .copied()
                .find(|c| self.shallow_eq(&stored, *c))
        });
        if let Some(found) = found {
            // Consume references of any children the caller passed,
            // which the existing value already holds.
            match stored {
                Stored::Array(items) => {
                    for item in items.iter() {
                        self.dec_ref(*item);
                    }
                }
                Stored::Object(fields) => {
                    for f in fields.iter() {
                        self.dec_ref(f.property);
                        self.dec_ref(f.value);
                    }
                }
                _ => (),
            }
            self.inc_ref(found);
            return found;
        }

        let slot = Slot {
            refs: 1,
            hash,
            stored,
        };
        let v = match self.free.pop() {
            Some(ind) => {
                self.slots[ind as usize] = slot;
                Val(ind)
            }
            None => {
                self.slots.push(slot);
                Val(self.slots.len() as u32 - 1)
            }
        };
        self.canon.entry(hash).or_default().push(v);
        v
    }

    // Structural content hash. Compound hashes mix child content hashes,
    // which are already computed in their slots.
    fn content_hash(&self, stored: &Stored) -> u64 {
        use xxhash_rust::xxh3::xxh3_64;

        let mut buf = Vec::with_capacity(32);
        match stored {
            Stored::Null => buf.push(0),
            Stored::Bool(b) => buf.extend([1, *b as u8]),
            Stored::PosInt(n) => {
                buf.push(2);
                buf.extend(n.to_le_bytes());
            }
            Stored::NegInt(n) => {
                buf.push(3);
                buf.extend(n.to_le_bytes());
            }
            Stored::Float(f) => {
                buf.push(4);
                buf.extend(f.to_bits().to_le_bytes());
            }
            Stored::InlineStr { len, bytes } => {
                buf.push(5);
                buf.extend(&bytes[..*len as usize]);
            }
            Stored::String(s) => {
                buf.push(5);
                buf.extend(s.as_bytes());
            }
            Stored::Array(items) => {
                buf.push(6);
                for item in items.iter() {
                    buf.extend(self.slot(*item).hash.to_le_bytes());
                }
            }
            Stored::Object(fields) => {
                buf.push(7);
                for f in fields.iter() {
                    buf.extend(self.slot(f.property).hash.to_le_bytes());
                    buf.extend(self.slot(f.value).hash.to_le_bytes());
                }
            }
            Stored::Free => unreachable!("hash of a free slot"),
        }
        xxh3_64(&buf)
    }

    // Equality of a candidate Stored against an interned value.
    // Children are canonical, so compound equality is handle equality.
    fn shallow_eq(&self, stored: &Stored, v: Val) -> bool {
        match (stored, &self.slot(v).stored) {
            (Stored::Null, Stored::Null) => true,
            (Stored::Bool(l), Stored::Bool(r)) => l == r,
            (Stored::PosInt(l), Stored::PosInt(r)) => l == r,
            (Stored::NegInt(l), Stored::NegInt(r)) => l == r,
            (Stored::Float(l), Stored::Float(r)) => l.to_bits() == r.to_bits(),
            (
                Stored::InlineStr { len, bytes },
                Stored::InlineStr {
                    len: r_len,
                    bytes: r_bytes,
                },
            ) => bytes[..*len as usize] == r_bytes[..*r_len as usize],
            (Stored::String(l), Stored::String(r)) => l == r,
            (Stored::Array(l), Stored::Array(r)) => l == r,
            (Stored::Object(l), Stored::Object(r)) => l == r,
            _ => false,
        }
    }

    fn uncanonicalize(&mut self, hash: u64, v: Val) {
        let candidates = self
            .canon
            .get_mut(&hash)
            .expect("released value is canonicalized");
        let ind = candidates
            .iter()
            .position(|c| *c == v)
            .expect("released value is canonicalized");
        candidates.swap_remove(ind);
        if candidates.is_empty() {
            self.canon.remove(&hash);
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
