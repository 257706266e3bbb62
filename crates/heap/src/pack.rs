use super::{Heap, Node, Val};

// Type tag bytes, ordered to match the cross-type ranking of `compare`.
const TAG_NULL: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_NUMBER: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_ARRAY: u8 = 0x06;
const TAG_OBJECT: u8 = 0x07;

// Terminates strings, arrays, and objects. Every tag is larger, so a
// prefix value orders before any extension of it.
const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0xFF;

/// PackedKey is an order-preserving byte encoding of a key value:
/// for any keys a and b, `pack_key(a) < pack_key(b)` exactly when
/// `compare(a, b)` is Less. Collections index their rows by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackedKey(Box<[u8]>);

impl PackedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encode `key` into its order-preserving byte form.
pub fn pack_key(heap: &Heap, key: Val) -> PackedKey {
    let mut out = Vec::with_capacity(16);
    pack_into(heap, key, &mut out);
    PackedKey(out.into_boxed_slice())
}

fn pack_into(heap: &Heap, v: Val, out: &mut Vec<u8>) {
    match heap.node(v) {
        Node::Null => out.push(TAG_NULL),
        Node::Bool(false) => out.push(TAG_FALSE),
        Node::Bool(true) => out.push(TAG_TRUE),
        Node::PosInt(n) => pack_number(n as f64, out),
        Node::NegInt(n) => pack_number(n as f64, out),
        Node::Float(f) => pack_number(f, out),
        Node::String(s) => pack_str(s, out),
        Node::Array(items) => {
            out.push(TAG_ARRAY);
            for item in items {
                pack_into(heap, *item, out);
            }
            out.push(TERMINATOR);
        }
        Node::Object(fields) => {
            out.push(TAG_OBJECT);
            for f in fields {
                pack_str(heap.str_of(f.property), out);
                pack_into(heap, f.value, out);
            }
            out.push(TERMINATOR);
        }
    }
}

// Numbers pack as the big-endian f64 bit pattern, sign-flipped so that
// the byte ordering is the numeric ordering.
fn pack_number(f: f64, out: &mut Vec<u8>) {
    let bits = f.to_bits();
    let bits = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    out.push(TAG_NUMBER);
    out.extend(bits.to_be_bytes());
}

// Strings escape embedded terminator bytes and then terminate,
// preserving prefix ordering.
fn pack_str(s: &str, out: &mut Vec<u8>) {
    out.push(TAG_STRING);
    for b in s.as_bytes() {
        out.push(*b);
        if *b == TERMINATOR {
            out.push(ESCAPE);
        }
    }
    out.push(TERMINATOR);
}
