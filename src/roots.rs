//! Root handles and externally supplied root enumeration.

use parking_lot::Mutex;

use crate::header::ObjectRef;

/// Visitor handed to root providers. Every slot passed to it may be updated in place.
pub struct RootVisitor<'a> {
    f: &'a mut dyn FnMut(&mut usize),
}

impl<'a> RootVisitor<'a> {
    pub(crate) fn new(f: &'a mut dyn FnMut(&mut usize)) -> Self {
        Self { f }
    }

    pub fn visit(&mut self, slot: &mut Option<ObjectRef>) {
        let mut raw = slot.map_or(0, |o| o.raw());
        (self.f)(&mut raw);
        *slot = ObjectRef::from_raw(raw);
    }

    pub fn visit_raw(&mut self, slot: &mut usize) {
        (self.f)(slot);
    }
}

/// Root category supplied by the embedding runtime. Called once per pause, and
/// once per marking cycle, with every root slot it owns.
pub type RootProvider = Box<dyn FnMut(&mut RootVisitor<'_>) + Send>;

#[derive(Default)]
struct RootTable {
    slots: Vec<usize>,
    free: Vec<usize>,
}

/// Handle table of strong roots. Index stable, slots updated by the collector.
#[derive(Default)]
pub struct RootSet {
    table: Mutex<RootTable>,
}

/// A handle to a rooted object. Release it with the owner's `release`.
#[derive(Debug, PartialEq, Eq)]
pub struct Root(usize);

impl Root {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, obj: Option<ObjectRef>) -> Root {
        let mut table = self.table.lock();
        let raw = obj.map_or(0, |o| o.raw());
        match table.free.pop() {
            Some(index) => {
                table.slots[index] = raw;
                Root(index)
            }
            None => {
                table.slots.push(raw);
                Root(table.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, root: &Root) -> Option<ObjectRef> {
        ObjectRef::from_raw(self.table.lock().slots[root.0])
    }

    pub fn set(&self, root: &Root, obj: Option<ObjectRef>) {
        self.table.lock().slots[root.0] = obj.map_or(0, |o| o.raw());
    }

    pub fn remove(&self, root: Root) {
        let mut table = self.table.lock();
        table.slots[root.0] = 0;
        table.free.push(root.0);
    }

    pub fn len(&self) -> usize {
        let table = self.table.lock();
        table.slots.len() - table.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies `f` to every non-null slot.
    pub fn for_each_slot(&self, mut f: impl FnMut(&mut usize)) {
        let mut table = self.table.lock();
        for slot in table.slots.iter_mut() {
            if *slot != 0 {
                f(slot);
            }
        }
    }
}
