//! Pool-backed storage for parsed JSON value trees.
//!
//! Values live in an arena and reference each other by index; strings are
//! spans into the caller's source buffer and own nothing. Recycling a
//! container returns its children transitively, and list/map storage is
//! reused through [`Pool`] so steady-state parsing allocates nothing.

use meridian_common::buf::Span;
use meridian_common::encode::{Encodable, EncodeError, Encoder, ValueFormat};
use meridian_common::pool::Pool;

pub type NodeId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Long,
    Double,
    String,
    List,
    Map,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub key: Span,
    pub value: NodeId,
}

#[derive(Debug, Default)]
enum Node {
    /// Slot is on the free list.
    #[default]
    Free,
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    Str(Span),
    List(Vec<NodeId>),
    Map(Vec<MapEntry>),
}

/// Arena of value nodes with free-list recycling.
#[derive(Debug, Default)]
pub struct ValueArena {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    list_pool: Pool<Vec<NodeId>>,
    map_pool: Pool<Vec<MapEntry>>,
}

impl ValueArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_null(&mut self) -> NodeId {
        self.alloc(Node::Null)
    }

    pub fn alloc_bool(&mut self, v: bool) -> NodeId {
        self.alloc(Node::Bool(v))
    }

    pub fn alloc_long(&mut self, v: i64) -> NodeId {
        self.alloc(Node::Long(v))
    }

    pub fn alloc_double(&mut self, v: f64) -> NodeId {
        self.alloc(Node::Double(v))
    }

    pub fn alloc_str(&mut self, span: Span) -> NodeId {
        self.alloc(Node::Str(span))
    }

    pub fn alloc_list(&mut self) -> NodeId {
        let storage = self.list_pool.borrow();
        self.alloc(Node::List(storage))
    }

    pub fn alloc_map(&mut self) -> NodeId {
        let storage = self.map_pool.borrow();
        self.alloc(Node::Map(storage))
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id as usize] = node;
            id
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as NodeId
        }
    }

    /// Returns `id` and, transitively, all of its children to the pools.
    pub fn recycle(&mut self, id: NodeId) {
        match std::mem::take(&mut self.nodes[id as usize]) {
            Node::List(children) => {
                for child in &children {
                    self.recycle(*child);
                }
                self.list_pool.give_back(children);
            }
            Node::Map(entries) => {
                for entry in &entries {
                    self.recycle(entry.value);
                }
                self.map_pool.give_back(entries);
            }
            _ => {}
        }
        self.free.push(id);
    }

    pub fn push_to_list(&mut self, list: NodeId, child: NodeId) {
        match &mut self.nodes[list as usize] {
            Node::List(children) => children.push(child),
            _ => debug_assert!(false, "push_to_list on a non-list node"),
        }
    }

    /// Inserts under `key`; returns false when the map already holds it.
    pub fn insert_into_map(&mut self, map: NodeId, key: Span, child: NodeId, src: &[u8]) -> bool {
        match &mut self.nodes[map as usize] {
            Node::Map(entries) => {
                if entries
                    .iter()
                    .any(|entry| entry.key.slice(src) == key.slice(src))
                {
                    return false;
                }
                entries.push(MapEntry { key, value: child });
                true
            }
            _ => {
                debug_assert!(false, "insert_into_map on a non-map node");
                false
            }
        }
    }

    pub fn kind(&self, id: NodeId) -> ValueKind {
        match &self.nodes[id as usize] {
            Node::Free => unreachable!("read of a recycled value"),
            Node::Null => ValueKind::Null,
            Node::Bool(_) => ValueKind::Bool,
            Node::Long(_) => ValueKind::Long,
            Node::Double(_) => ValueKind::Double,
            Node::Str(_) => ValueKind::String,
            Node::List(_) => ValueKind::List,
            Node::Map(_) => ValueKind::Map,
        }
    }

    /// Number of live (non-recycled) nodes, for pool accounting in tests.
    pub fn live_nodes(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

/// A read handle over one value: arena + source buffer + node index.
#[derive(Clone, Copy)]
pub struct ValueRef<'a> {
    arena: &'a ValueArena,
    src: &'a [u8],
    id: NodeId,
}

impl<'a> ValueRef<'a> {
    pub fn new(arena: &'a ValueArena, src: &'a [u8], id: NodeId) -> Self {
        Self { arena, src, id }
    }

    fn node(&self) -> &'a Node {
        &self.arena.nodes[self.id as usize]
    }

    pub fn kind(&self) -> ValueKind {
        self.arena.kind(self.id)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.node(), Node::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.node() {
            Node::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self.node() {
            Node::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Doubles and longs both read as doubles.
    pub fn as_double(&self) -> Option<f64> {
        match self.node() {
            Node::Double(v) => Some(*v),
            Node::Long(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Raw string bytes, escapes untouched.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self.node() {
            Node::Str(span) => Some(span.slice(self.src)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Element or entry count; `None` for scalars.
    pub fn len(&self) -> Option<usize> {
        match self.node() {
            Node::List(children) => Some(children.len()),
            Node::Map(entries) => Some(entries.len()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn at(&self, index: usize) -> Option<ValueRef<'a>> {
        match self.node() {
            Node::List(children) => children
                .get(index)
                .map(|id| ValueRef::new(self.arena, self.src, *id)),
            _ => None,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<ValueRef<'a>> {
        match self.node() {
            Node::Map(entries) => entries
                .iter()
                .find(|entry| entry.key.slice(self.src) == key)
                .map(|entry| ValueRef::new(self.arena, self.src, entry.value)),
            _ => None,
        }
    }

    /// Map entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&'a [u8], ValueRef<'a>)> + '_ {
        let entries: &[MapEntry] = match self.node() {
            Node::Map(entries) => entries,
            _ => &[],
        };
        entries.iter().map(move |entry| {
            (
                entry.key.slice(self.src),
                ValueRef::new(self.arena, self.src, entry.value),
            )
        })
    }

    /// List elements in order.
    pub fn items(&self) -> impl Iterator<Item = ValueRef<'a>> + '_ {
        let children: &[NodeId] = match self.node() {
            Node::List(children) => children,
            _ => &[],
        };
        children
            .iter()
            .map(move |id| ValueRef::new(self.arena, self.src, *id))
    }

    /// Structural equality across arenas: same shapes, same scalar values,
    /// same key order.
    pub fn structurally_equals(&self, other: &ValueRef<'_>) -> bool {
        match (self.node(), other.node()) {
            (Node::Null, Node::Null) => true,
            (Node::Bool(a), Node::Bool(b)) => a == b,
            (Node::Long(a), Node::Long(b)) => a == b,
            (Node::Double(a), Node::Double(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Node::Str(a), Node::Str(b)) => a.slice(self.src) == b.slice(other.src),
            (Node::List(a), Node::List(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| {
                        ValueRef::new(self.arena, self.src, *x)
                            .structurally_equals(&ValueRef::new(other.arena, other.src, *y))
                    })
            }
            (Node::Map(a), Node::Map(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| {
                        x.key.slice(self.src) == y.key.slice(other.src)
                            && ValueRef::new(self.arena, self.src, x.value)
                                .structurally_equals(&ValueRef::new(other.arena, other.src, y.value))
                    })
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for ValueRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.node() {
            Node::Free => write!(f, "<recycled>"),
            Node::Null => write!(f, "null"),
            Node::Bool(v) => write!(f, "{v}"),
            Node::Long(v) => write!(f, "{v}"),
            Node::Double(v) => write!(f, "{v}"),
            Node::Str(span) => write!(f, "{:?}", String::from_utf8_lossy(span.slice(self.src))),
            Node::List(_) => f.debug_list().entries(self.items()).finish(),
            Node::Map(_) => {
                let mut map = f.debug_map();
                for (key, value) in self.entries() {
                    map.entry(&String::from_utf8_lossy(key), &value);
                }
                map.finish()
            }
        }
    }
}

impl Encodable for ValueRef<'_> {
    fn encode<F: ValueFormat>(&self, enc: &mut Encoder<'_, F>) -> Result<(), EncodeError> {
        match self.node() {
            Node::Free => Ok(()),
            Node::Null => enc.null().map(|_| ()),
            Node::Bool(v) => enc.boolean(*v).map(|_| ()),
            Node::Long(v) => enc.long(*v).map(|_| ()),
            Node::Double(v) => enc.double(*v).map(|_| ()),
            Node::Str(span) => enc.string(span.slice(self.src)).map(|_| ()),
            Node::List(_) => {
                enc.open_list()?;
                for item in self.items() {
                    enc.object(&item)?;
                }
                enc.close_list().map(|_| ())
            }
            Node::Map(_) => {
                enc.open_map()?;
                for (key, value) in self.entries() {
                    enc.string(key)?;
                    enc.object(&value)?;
                }
                enc.close_map().map(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycle_returns_children_transitively() {
        let mut arena = ValueArena::new();
        let src = b"ab";

        let map = arena.alloc_map();
        let list = arena.alloc_list();
        let one = arena.alloc_long(1);
        arena.push_to_list(list, one);
        assert!(arena.insert_into_map(map, Span::new(0, 1), list, src));
        let s = arena.alloc_str(Span::new(1, 1));
        assert!(arena.insert_into_map(map, Span::new(1, 1), s, src));
        assert_eq!(arena.live_nodes(), 4);

        arena.recycle(map);
        assert_eq!(arena.live_nodes(), 0);

        // Storage comes back out of the pools.
        let map2 = arena.alloc_map();
        let list2 = arena.alloc_list();
        assert_eq!(arena.live_nodes(), 2);
        arena.recycle(map2);
        arena.recycle(list2);
    }

    #[test]
    fn duplicate_keys_rejected() {
        let mut arena = ValueArena::new();
        let src = b"aa";
        let map = arena.alloc_map();
        let a = arena.alloc_long(1);
        let b = arena.alloc_long(2);
        assert!(arena.insert_into_map(map, Span::new(0, 1), a, src));
        // Different span, same bytes.
        assert!(!arena.insert_into_map(map, Span::new(1, 1), b, src));
    }

    #[test]
    fn value_ref_reads() {
        let mut arena = ValueArena::new();
        let src = b"key\"hi\"";
        let map = arena.alloc_map();
        let s = arena.alloc_str(Span::new(4, 2));
        let n = arena.alloc_long(7);
        arena.insert_into_map(map, Span::new(0, 3), s, src);
        let list = arena.alloc_list();
        arena.push_to_list(list, n);
        arena.insert_into_map(map, Span::new(3, 1), list, src);

        let root = ValueRef::new(&arena, src, map);
        assert_eq!(root.kind(), ValueKind::Map);
        assert_eq!(root.len(), Some(2));
        assert_eq!(root.get(b"key").unwrap().as_str(), Some("hi"));
        let list = root.get(b"\"").unwrap();
        assert_eq!(list.at(0).unwrap().as_long(), Some(7));
        assert_eq!(list.at(0).unwrap().as_double(), Some(7.0));
    }
}
