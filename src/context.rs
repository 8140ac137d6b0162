//! Allocation context shared by everything around a function.
//!
//! Two kinds of resources live here:
//!
//! * interners, for data without identity that can be deduplicated (names
//!   and constants): handing out stable `u32` handles makes value equality a
//!   handle comparison, which the φ-identity rule relies on;
//! * id allocators for blocks and instructions, which are the opposite:
//!   pure identities. Ids are minted context-wide so handles from different
//!   functions can never collide; the *definitions* live in per-function
//!   [`EntityDefs`] tables, not in the `Context`.
//!
//! The interners use interior mutability (`elsa`'s frozen set never moves
//! interned data), so interning works through a shared `&Context`. Nothing
//! here is `Sync`; one context is meant to serve one analysis thread.

use elsa::FrozenIndexSet;
use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::hash::Hash;

use crate::ConstDef;

#[derive(Default)]
pub struct Context {
    strs: FrozenIndexSet<Box<str>>,
    consts: FrozenIndexSet<Box<ConstDef>>,
    next_block: Cell<u32>,
    next_inst: Cell<u32>,
}

// NOTE: none of the handle types derive `PartialOrd, Ord`; neither the
// interning order nor the id allocation order is part of the API.

/// Handle for an interned string (function, block, value and opcode names).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct InternedStr(u32);

/// Handle for an interned [`ConstDef`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Const(u32);

/// Identity of a basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Block(u32);

/// Identity of an instruction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Inst(u32);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    #[track_caller]
    pub fn intern_str(&self, s: &str) -> InternedStr {
        if let Some((i, _)) = self.strs.get_full(s) {
            return InternedStr(i as u32);
        }
        let (i, _) = self.strs.insert_full(s.into());
        InternedStr(i.try_into().expect("string interner overflowed u32"))
    }

    #[track_caller]
    pub fn intern_const(&self, c: ConstDef) -> Const {
        if let Some((i, _)) = self.consts.get_full(&c) {
            return Const(i as u32);
        }
        let (i, _) = self.consts.insert_full(Box::new(c));
        Const(i.try_into().expect("constant interner overflowed u32"))
    }
}

impl std::ops::Index<InternedStr> for Context {
    type Output = str;

    fn index(&self, s: InternedStr) -> &str {
        &self.strs[s.0 as usize]
    }
}

impl std::ops::Index<Const> for Context {
    type Output = ConstDef;

    fn index(&self, c: Const) -> &ConstDef {
        &self.consts[c.0 as usize]
    }
}

/// An id the [`Context`] can mint; implemented exactly for [`Block`] and
/// [`Inst`]. Fresh ids are meant to come out of [`EntityDefs::define`],
/// which pairs every minted id with its definition.
pub trait EntityId: Copy + Eq + Hash {
    fn alloc(cx: &Context) -> Self;
}

fn bump(counter: &Cell<u32>) -> u32 {
    let id = counter.get();
    counter.set(id.checked_add(1).expect("entity id overflowed u32"));
    id
}

impl EntityId for Block {
    fn alloc(cx: &Context) -> Self {
        Block(bump(&cx.next_block))
    }
}

impl EntityId for Inst {
    fn alloc(cx: &Context) -> Self {
        Inst(bump(&cx.next_inst))
    }
}

/// Definitions of the entities a function owns, keyed by id.
///
/// By design there is no way to iterate an `EntityDefs`, or to obtain an id
/// without defining the entity: deterministic traversal always goes through
/// [`FuncDef::block_order`](crate::FuncDef::block_order) and per-block
/// instruction lists instead.
pub struct EntityDefs<K: EntityId, V> {
    map: FxHashMap<K, V>,
}

impl<K: EntityId, V> Default for EntityDefs<K, V> {
    fn default() -> Self {
        Self {
            map: FxHashMap::default(),
        }
    }
}

impl<K: EntityId, V> EntityDefs<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    #[track_caller]
    pub fn define(&mut self, cx: &Context, def: V) -> K {
        let id = K::alloc(cx);
        assert!(self.map.insert(id, def).is_none());
        id
    }
}

impl<K: EntityId, V> std::ops::Index<K> for EntityDefs<K, V> {
    type Output = V;

    fn index(&self, id: K) -> &V {
        &self.map[&id]
    }
}

impl<K: EntityId, V> std::ops::IndexMut<K> for EntityDefs<K, V> {
    fn index_mut(&mut self, id: K) -> &mut V {
        self.map.get_mut(&id).unwrap()
    }
}
