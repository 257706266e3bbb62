use super::{Heap, Node, Val};
use serde::ser::{SerializeMap, SerializeSeq};

impl Heap {
    /// Intern a serde_json::Value, descending children first.
    /// The returned handle owns one reference.
    pub fn intern_value(&mut self, v: &serde_json::Value) -> Val {
        match v {
            serde_json::Value::Null => self.intern_null(),
            serde_json::Value::Bool(b) => self.intern_bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(n) = n.as_u64() {
                    self.intern_u64(n)
                } else if let Some(n) = n.as_i64() {
                    self.intern_i64(n)
                } else {
                    self.intern_f64(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => self.intern_str(s),
            serde_json::Value::Array(items) => {
                let items = items.iter().map(|item| self.intern_value(item)).collect();
                self.intern_array(items)
            }
            serde_json::Value::Object(fields) => {
                let fields = fields
                    .iter()
                    .map(|(property, value)| {
                        let property = self.intern_str(property);
                        let value = self.intern_value(value);
                        (property, value)
                    })
                    .collect();
                self.intern_object(fields)
            }
        }
    }

    /// Materialize the value behind a handle as a serde_json::Value.
    pub fn to_json(&self, v: Val) -> serde_json::Value {
        match self.node(v) {
            Node::Null => serde_json::Value::Null,
            Node::Bool(b) => serde_json::Value::Bool(b),
            Node::PosInt(n) => serde_json::json!(n),
            Node::NegInt(n) => serde_json::json!(n),
            Node::Float(f) => serde_json::json!(f),
            Node::String(s) => serde_json::Value::String(s.to_string()),
            Node::Array(items) => {
                serde_json::Value::Array(items.iter().map(|item| self.to_json(*item)).collect())
            }
            Node::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|f| (self.str_of(f.property).to_string(), self.to_json(f.value)))
                    .collect(),
            ),
        }
    }

    /// A Serialize view over the value behind a handle,
    /// which streams without materializing intermediate structure.
    pub fn ser<'h>(&'h self, val: Val) -> SerVal<'h> {
        SerVal { heap: self, val }
    }
}

/// SerVal implements serde::Serialize for an interned value.
#[derive(Copy, Clone)]
pub struct SerVal<'h> {
    heap: &'h Heap,
    val: Val,
}

impl<'h> serde::Serialize for SerVal<'h> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let SerVal { heap, val } = *self;

        match heap.node(val) {
            Node::Null => serializer.serialize_unit(),
            Node::Bool(b) => serializer.serialize_bool(b),
            Node::PosInt(n) => serializer.serialize_u64(n),
            Node::NegInt(n) => serializer.serialize_i64(n),
            Node::Float(f) => serializer.serialize_f64(f),
            Node::String(s) => serializer.serialize_str(s),
            Node::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&heap.ser(*item))?;
                }
                seq.end()
            }
            Node::Object(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for f in fields {
                    map.serialize_entry(heap.str_of(f.property), &heap.ser(f.value))?;
                }
                map.end()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::Heap;
    use quickcheck::{quickcheck, Arbitrary};
    use serde_json::{json, Value};

    #[test]
    fn test_json_round_trip() {
        let fixture = json!({
            "nested": {"arrays": [[], [1, [2.5, "three"]]]},
            "null": null,
            "ok": true,
            "str": "a string long enough to be boxed",
        });
        let mut heap = Heap::new();

        let v = heap.intern_value(&fixture);
        assert_eq!(heap.to_json(v), fixture);
        assert_eq!(serde_json::to_value(heap.ser(v)).unwrap(), fixture);

        heap.dec_ref(v);
        assert_eq!(heap.live(), 0);
    }

    quickcheck! {
        // Independently interned, structurally equal values share a handle,
        // and releasing every reference empties the heap.
        fn interning_identity(doc: ArbitraryDoc) -> bool {
            let mut heap = Heap::new();

            let a = heap.intern_value(&doc.0);
            let b = heap.intern_value(&doc.0);
            let identical = a == b;

            heap.dec_ref(a);
            heap.dec_ref(b);
            identical && heap.live() == 0
        }
    }

    #[derive(Debug, Clone)]
    struct ArbitraryDoc(Value);

    impl Arbitrary for ArbitraryDoc {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            ArbitraryDoc(arbitrary_value(g, 3))
        }
    }

    fn arbitrary_value(g: &mut quickcheck::Gen, depth: usize) -> Value {
        let choices = if depth == 0 { 5 } else { 7 };
        match u8::arbitrary(g) % choices {
            0 => Value::Null,
            1 => json!(bool::arbitrary(g)),
            2 => json!(u64::arbitrary(g)),
            3 => json!(i64::arbitrary(g)),
            4 => json!(String::arbitrary(g)),
            5 => {
                let n = usize::arbitrary(g) % 4;
                Value::Array((0..n).map(|_| arbitrary_value(g, depth - 1)).collect())
            }
            _ => {
                let n = usize::arbitrary(g) % 4;
                Value::Object(
                    (0..n)
                        .map(|_| (String::arbitrary(g), arbitrary_value(g, depth - 1)))
                        .collect(),
                )
            }
        }
    }
}
