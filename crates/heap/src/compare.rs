use super::{Heap, Node, Val};
use itertools::{EitherOrBoth, Itertools};
use std::cmp::Ordering;

/// compare evaluates the deep ordering of `lhs` and `rhs`.
/// This function establishes an arbitrary total ordering over values.
/// Arrays and objects are compared lexicographically, with object fields
/// taken in sorted property order. Numbers compare numerically regardless
/// of representation. Values of unequal types order by a fixed type rank:
/// null < bool < number < string < array < object.
pub fn compare(heap: &Heap, lhs: Val, rhs: Val) -> Ordering {
    // Interning canonicalizes, so equal handles are equal values.
    if lhs == rhs {
        return Ordering::Equal;
    }
    match (heap.node(lhs), heap.node(rhs)) {
        (Node::Array(lhs), Node::Array(rhs)) => lhs
            .iter()
            .zip_longest(rhs)
            .map(|eob| match eob {
                EitherOrBoth::Both(lhs, rhs) => compare(heap, *lhs, *rhs),
                EitherOrBoth::Right(_) => Ordering::Less,
                EitherOrBoth::Left(_) => Ordering::Greater,
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),
        (Node::Bool(lhs), Node::Bool(rhs)) => lhs.cmp(&rhs),
        (Node::Null, Node::Null) => Ordering::Equal,
        (Node::Object(lhs), Node::Object(rhs)) => lhs
            .iter()
            .zip_longest(rhs.iter())
            .map(|eob| match eob {
                EitherOrBoth::Both(lhs, rhs) => {
                    let prop_ord = heap.str_of(lhs.property).cmp(heap.str_of(rhs.property));
                    match prop_ord {
                        Ordering::Equal => compare(heap, lhs.value, rhs.value),
                        _ => prop_ord,
                    }
                }
                EitherOrBoth::Right(_) => Ordering::Less,
                EitherOrBoth::Left(_) => Ordering::Greater,
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),
        (Node::String(lhs), Node::String(rhs)) => lhs.cmp(rhs),

        (lhs, rhs) => match (number_of(lhs), number_of(rhs)) {
            (Some(lhs), Some(rhs)) => lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal),
            // Types are not equal. Order by the fixed type ranking.
            _ => rank(lhs).cmp(&rank(rhs)),
        },
    }
}

fn number_of(node: Node<'_>) -> Option<f64> {
    match node {
        Node::PosInt(n) => Some(n as f64),
        Node::NegInt(n) => Some(n as f64),
        Node::Float(f) => Some(f),
        _ => None,
    }
}

fn rank(node: Node<'_>) -> u8 {
    match node {
        Node::Null => 1,
        Node::Bool(_) => 2,
        Node::PosInt(_) | Node::NegInt(_) | Node::Float(_) => 3,
        Node::String(_) => 4,
        Node::Array(_) => 5,
        Node::Object(_) => 6,
    }
}
