use crate::FlowErr;
use heap::Val;

/// Bag is the per-key content of a collection: an ordered multiset of
/// values, or an error marker standing in for them. Equality of value bags
/// is order-insensitive, because handles are canonical a multiset compare
/// is a sorted handle compare.
#[derive(Debug, Clone, PartialEq)]
pub enum Bag {
    Values(Vec<Val>),
    Error(FlowErr),
}

impl Bag {
    pub fn values(&self) -> &[Val] {
        match self {
            Bag::Values(vs) => vs,
            Bag::Error(_) => &[],
        }
    }

    pub fn err(&self) -> Option<&FlowErr> {
        match self {
            Bag::Values(_) => None,
            Bag::Error(err) => Some(err),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Bag::Values(vs) if vs.is_empty())
    }

    /// Order-insensitive equality.
    pub fn multiset_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Bag::Values(lhs), Bag::Values(rhs)) => {
                if lhs.len() != rhs.len() {
                    return false;
                }
                let mut lhs = lhs.clone();
                let mut rhs = rhs.clone();
                lhs.sort();
                rhs.sort();
                lhs == rhs
            }
            (Bag::Error(lhs), Bag::Error(rhs)) => lhs == rhs,
            _ => false,
        }
    }
}
