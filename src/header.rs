//! Object layout.
//!
//! Every object starts with two header words followed by its reference slots and
//! then its raw data words:
//!
//! +--------------+------+----------------------------------------------+
//! | word         | bits |                                              |
//! +--------------+------+----------------------------------------------+
//! | mark         |    2 | forwarding tag                               |
//! |              |    4 | age                                          |
//! |              |    1 | locked                                       |
//! |              |   25 | identity hash                                |
//! |              |   32 | forwardee, as a word index from heap base    |
//! +--------------+------+----------------------------------------------+
//! | layout       |    2 | kind (plain, reference array, filler)        |
//! |              |   30 | number of reference slots                    |
//! |              |   32 | total size in words                          |
//! +--------------+------+----------------------------------------------+
//! | refs[n]      |   64 | object addresses, zero is null               |
//! | data[m]      |   64 | raw words                                    |
//! +--------------+------+----------------------------------------------+
//!
//! Notes:
//! - Installing a forwarding pointer overwrites the age, lock and hash bits, so
//!   marks that carry state are preserved on the side when an object cannot move.
//! - The layout word is never touched by the collector after allocation; object
//!   size stays computable even for forwarded objects.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use modular_bitfield::prelude::*;

use crate::address::Address;
use crate::globals::{align_up, HEADER_WORDS, MAX_AGE, MIN_OBJ_ALIGNMENT_WORDS};

macro_rules! as_atomic {
    ($value: expr;$t: ident) => {
        unsafe { &*($value as *const core::sync::atomic::$t) }
    };
}

#[derive(BitfieldSpecifier, Clone, Copy, Debug, PartialEq, Eq)]
#[bits = 2]
pub enum ForwardTag {
    NotForwarded = 0,
    Forwarded = 1,
    SelfForwarded = 2,
}

#[bitfield(bits = 64)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MarkWord {
    pub tag: ForwardTag,
    pub age: B4,
    pub locked: bool,
    pub hash: B25,
    pub forwardee: B32,
}

impl MarkWord {
    /// Mark word of a freshly allocated object.
    #[inline]
    pub fn prototype() -> Self {
        Self::new()
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self::from_bytes(raw.to_le_bytes())
    }

    #[inline]
    pub fn raw(self) -> u64 {
        u64::from_le_bytes(self.into_bytes())
    }

    #[inline]
    pub fn is_prototype(self) -> bool {
        self.raw() == 0
    }

    /// True when the mark carries state that forwarding would destroy.
    #[inline]
    pub fn must_be_preserved(self) -> bool {
        !self.is_prototype()
    }

    #[inline]
    pub fn forwarding_state(self) -> ForwardingState {
        match self.tag() {
            ForwardTag::NotForwarded => ForwardingState::NotForwarded,
            ForwardTag::Forwarded => ForwardingState::ForwardedTo(self.forwardee()),
            ForwardTag::SelfForwarded => ForwardingState::SelfForwarded,
        }
    }

    #[inline]
    pub fn forwarded_to(word_index: u32) -> Self {
        Self::new()
            .with_tag(ForwardTag::Forwarded)
            .with_forwardee(word_index)
    }

    #[inline]
    pub fn self_forwarded() -> Self {
        Self::new().with_tag(ForwardTag::SelfForwarded)
    }

    #[inline]
    pub fn incr_age(self) -> Self {
        let age = self.age();
        if age < MAX_AGE {
            self.with_age(age + 1)
        } else {
            self
        }
    }
}

impl fmt::Debug for MarkWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkWord")
            .field("tag", &self.tag())
            .field("age", &self.age())
            .field("locked", &self.locked())
            .field("hash", &self.hash())
            .field("forwardee", &self.forwardee())
            .finish()
    }
}

/// Where an object lives after (or during) evacuation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardingState {
    NotForwarded,
    /// Copied; the payload is the word index of the copy relative to the heap base.
    ForwardedTo(u32),
    /// Could not be copied and stays where it is.
    SelfForwarded,
}

#[derive(BitfieldSpecifier, Clone, Copy, Debug, PartialEq, Eq)]
#[bits = 2]
pub enum ObjectKind {
    Plain = 0,
    RefArray = 1,
    Filler = 2,
}

#[bitfield(bits = 64)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ObjectLayout {
    pub kind: ObjectKind,
    pub refs: B30,
    pub size: B32,
}

impl ObjectLayout {
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self::from_bytes(raw.to_le_bytes())
    }

    #[inline]
    pub fn raw(self) -> u64 {
        u64::from_le_bytes(self.into_bytes())
    }
}

/// Shape of an object the mutator wants to allocate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shape {
    pub kind: ObjectKind,
    pub refs: u32,
    pub data_words: u32,
}

impl Shape {
    pub const fn plain(refs: u32, data_words: u32) -> Self {
        Self {
            kind: ObjectKind::Plain,
            refs,
            data_words,
        }
    }

    pub const fn ref_array(len: u32) -> Self {
        Self {
            kind: ObjectKind::RefArray,
            refs: len,
            data_words: 0,
        }
    }

    /// Plain object without references whose total size is close to `bytes`.
    pub fn with_size_in_bytes(bytes: usize) -> Self {
        let words = (bytes / 8).max(HEADER_WORDS);
        Self::plain(0, (words - HEADER_WORDS) as u32)
    }

    #[inline]
    pub fn size_words(&self) -> usize {
        align_up(
            HEADER_WORDS + self.refs as usize + self.data_words as usize,
            MIN_OBJ_ALIGNMENT_WORDS,
        )
    }
}

/// Reference to an object in the heap.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef(Address);

impl ObjectRef {
    /// # Safety
    /// `addr` must be the start of an object inside the committed heap.
    #[inline(always)]
    pub unsafe fn from_address(addr: Address) -> Self {
        debug_assert!(!addr.is_zero());
        ObjectRef(addr)
    }

    /// Decodes a slot value; zero is null.
    #[inline(always)]
    pub fn from_raw(raw: usize) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(ObjectRef(Address::from_usize(raw)))
        }
    }

    #[inline(always)]
    pub fn address(self) -> Address {
        self.0
    }

    #[inline(always)]
    pub fn raw(self) -> usize {
        self.0.as_usize()
    }

    #[inline(always)]
    fn mark_cell(self) -> &'static AtomicU64 {
        as_atomic!(self.0.as_usize(); AtomicU64)
    }

    #[inline(always)]
    pub fn mark(self) -> MarkWord {
        MarkWord::from_raw(self.mark_cell().load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn set_mark(self, mark: MarkWord) {
        self.mark_cell().store(mark.raw(), Ordering::Release);
    }

    #[inline(always)]
    pub fn cas_mark(self, expected: MarkWord, new: MarkWord) -> Result<MarkWord, MarkWord> {
        self.mark_cell()
            .compare_exchange(expected.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(MarkWord::from_raw)
            .map_err(MarkWord::from_raw)
    }

    #[inline(always)]
    pub fn forwarding_state(self) -> ForwardingState {
        self.mark().forwarding_state()
    }

    /// Atomically installs `new_mark` unless the object is already forwarded.
    ///
    /// Returns the mark that was replaced on success or the winning forwarding mark
    /// when another thread got there first.
    pub fn forward_atomic(self, new_mark: MarkWord) -> Result<MarkWord, MarkWord> {
        let mut current = self.mark();
        loop {
            if current.tag() != ForwardTag::NotForwarded {
                return Err(current);
            }
            match self.cas_mark(current, new_mark) {
                Ok(prev) => return Ok(prev),
                Err(actual) => current = actual,
            }
        }
    }

    #[inline(always)]
    pub fn layout(self) -> ObjectLayout {
        unsafe { ObjectLayout::from_raw(self.0.add_words(1).load_word() as u64) }
    }

    #[inline(always)]
    pub fn kind(self) -> ObjectKind {
        self.layout().kind()
    }

    #[inline(always)]
    pub fn is_filler(self) -> bool {
        self.kind() == ObjectKind::Filler
    }

    #[inline(always)]
    pub fn size_words(self) -> usize {
        self.layout().size() as usize
    }

    #[inline(always)]
    pub fn end(self) -> Address {
        self.0.add_words(self.size_words())
    }

    #[inline(always)]
    pub fn ref_count(self) -> usize {
        match self.kind() {
            ObjectKind::Filler => 0,
            _ => self.layout().refs() as usize,
        }
    }

    #[inline(always)]
    pub fn data_words(self) -> usize {
        match self.kind() {
            ObjectKind::Filler => 0,
            _ => self.size_words() - HEADER_WORDS - self.ref_count(),
        }
    }

    /// Address of reference slot `index`.
    #[inline(always)]
    pub fn slot(self, index: usize) -> Address {
        debug_assert!(index < self.ref_count());
        self.0.add_words(HEADER_WORDS + index)
    }

    /// Iterates the addresses of this object's reference slots.
    #[inline]
    pub fn slots(self) -> impl DoubleEndedIterator<Item = Address> {
        let first = self.0.add_words(HEADER_WORDS);
        (0..self.ref_count()).map(move |i| first.add_words(i))
    }

    #[inline(always)]
    pub fn data_address(self, index: usize) -> Address {
        debug_assert!(index < self.data_words());
        self.0.add_words(HEADER_WORDS + self.ref_count() + index)
    }

    #[inline(always)]
    pub fn read_data(self, index: usize) -> u64 {
        unsafe { self.data_address(index).load_word() as u64 }
    }

    #[inline(always)]
    pub fn write_data(self, index: usize, value: u64) {
        unsafe { self.data_address(index).store_word(value as usize) }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:?})", self.0)
    }
}

/// Atomic view of a reference slot.
#[inline(always)]
pub fn slot_cell(slot: Address) -> &'static AtomicUsize {
    as_atomic!(slot.as_usize(); AtomicUsize)
}

#[inline(always)]
pub fn load_slot(slot: Address) -> Option<ObjectRef> {
    ObjectRef::from_raw(slot_cell(slot).load(Ordering::Acquire))
}

#[inline(always)]
pub fn store_slot(slot: Address, value: Option<ObjectRef>) {
    slot_cell(slot).store(value.map_or(0, |o| o.raw()), Ordering::Release);
}

/// Writes the header of a new object of `shape` at `addr` and nulls its slots.
/// Data words are left as found; fresh heap memory is zero.
pub fn initialize_object(addr: Address, shape: Shape) -> ObjectRef {
    let size = shape.size_words();
    let layout = ObjectLayout::new()
        .with_kind(shape.kind)
        .with_refs(shape.refs)
        .with_size(size as u32);
    unsafe {
        addr.store_word(MarkWord::prototype().raw() as usize);
        addr.add_words(1).store_word(layout.raw() as usize);
        for i in 0..shape.refs as usize {
            addr.add_words(HEADER_WORDS + i).store_word(0);
        }
        ObjectRef::from_address(addr)
    }
}

/// Makes `[start, end)` parsable by placing a single filler object over it.
pub fn fill_range(start: Address, end: Address) {
    debug_assert!(start <= end);
    let words = end.words_from(start);
    if words == 0 {
        return;
    }
    debug_assert!(words >= MIN_OBJ_ALIGNMENT_WORDS, "gap of {} words cannot be filled", words);
    let layout = ObjectLayout::new()
        .with_kind(ObjectKind::Filler)
        .with_refs(0)
        .with_size(words as u32);
    unsafe {
        start.store_word(MarkWord::prototype().raw() as usize);
        start.add_words(1).store_word(layout.raw() as usize);
    }
}

/// Walks the objects laid out back to back in `[start, end)`.
pub fn walk_objects(start: Address, end: Address, mut visitor: impl FnMut(ObjectRef)) {
    let mut cur = start;
    while cur < end {
        let obj = unsafe { ObjectRef::from_address(cur) };
        let size = obj.size_words();
        crate::guarantee!(size >= MIN_OBJ_ALIGNMENT_WORDS, "unparsable object at {:?}", cur);
        visitor(obj);
        cur = cur.add_words(size);
    }
}
