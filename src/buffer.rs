//! Raw typed memory regions with optional cross-lane sharing.
//!
//! `Column<T>` is a single typed field's storage: `Owned` is the
//! single-lane fast path (plain `Vec<T>`, no synchronization), `Shared` is
//! the multi-lane path used when `WorldConfig::threads > 1` wants a field
//! visible to more than one lane without copying it per frame.

use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug)]
pub enum Column<T> {
    Owned(Vec<T>),
    Shared(Arc<RwLock<Vec<T>>>),
}

impl<T: Clone + Default> Column<T> {
    pub fn new_owned() -> Self {
        Column::Owned(Vec::new())
    }

    pub fn new_shared() -> Self {
        Column::Shared(Arc::new(RwLock::new(Vec::new())))
    }

    pub fn share(&self) -> Self {
        match self {
            Column::Owned(v) => Column::Shared(Arc::new(RwLock::new(v.clone()))),
            Column::Shared(a) => Column::Shared(a.clone()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Owned(v) => v.len(),
            Column::Shared(a) => a.read().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ensure_len(&mut self, len: usize) {
        match self {
            Column::Owned(v) => {
                if v.len() < len {
                    v.resize(len, T::default());
                }
            }
            Column::Shared(a) => {
                let mut g = a.write();
                if g.len() < len {
                    g.resize(len, T::default());
                }
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<T> {
        match self {
            Column::Owned(v) => v.get(index).cloned(),
            Column::Shared(a) => a.read().get(index).cloned(),
        }
    }

    pub fn set(&mut self, index: usize, value: T) {
        self.ensure_len(index + 1);
        match self {
            Column::Owned(v) => v[index] = value,
            Column::Shared(a) => a.write()[index] = value,
        }
    }

    pub fn push(&mut self, value: T) -> usize {
        match self {
            Column::Owned(v) => {
                v.push(value);
                v.len() - 1
            }
            Column::Shared(a) => {
                let mut g = a.write();
                g.push(value);
                g.len() - 1
            }
        }
    }

    /// Swap-remove, returning the index of the element that was moved into
    /// `index` (if any), mirroring the sparse store's compaction need.
    pub fn swap_remove(&mut self, index: usize) -> (T, Option<usize>) {
        match self {
            Column::Owned(v) => {
                let moved = if index != v.len() - 1 {
                    Some(v.len() - 1)
                } else {
                    None
                };
                (v.swap_remove(index), moved)
            }
            Column::Shared(a) => {
                let mut g = a.write();
                let moved = if index != g.len() - 1 {
                    Some(g.len() - 1)
                } else {
                    None
                };
                (g.swap_remove(index), moved)
            }
        }
    }

    pub fn snapshot(&self) -> Vec<T> {
        match self {
            Column::Owned(v) => v.clone(),
            Column::Shared(a) => a.read().clone(),
        }
    }

    /// Mutating counterparts that work through a shared reference, for
    /// columns that are always constructed `Shared` (the `ComponentStore`
    /// uses these so that a single-borrow-rule accessor, which only ever
    /// holds `&ComponentStore`, can still mutate a field in place).
    pub fn set_through_shared(&self, index: usize, value: T) {
        match self {
            Column::Owned(_) => unreachable!("set_through_shared called on an Owned column"),
            Column::Shared(a) => {
                let mut g = a.write();
                if g.len() <= index {
                    g.resize(index + 1, T::default());
                }
                g[index] = value;
            }
        }
    }

    pub fn push_through_shared(&self, value: T) -> usize {
        match self {
            Column::Owned(_) => unreachable!("push_through_shared called on an Owned column"),
            Column::Shared(a) => {
                let mut g = a.write();
                g.push(value);
                g.len() - 1
            }
        }
    }
}

/// An append-only byte heap for dynamic-string fields. Rows never overwrite another row's bytes in place;
/// updating a string appends fresh bytes and rewrites the row's
/// `(offset, length)` pointer, leaving the old bytes as heap garbage until
/// the whole component store is dropped. Acceptable for a per-frame
/// simulation heap; not intended as a space-optimal string interner.
#[derive(Debug, Default)]
pub struct ByteHeap {
    bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StringSlot {
    pub offset: u32,
    pub len: u32,
}

impl ByteHeap {
    pub fn new() -> Self {
        ByteHeap::default()
    }

    pub fn append(&mut self, data: &[u8], max_bytes: usize) -> StringSlot {
        let truncated = &data[..data.len().min(max_bytes)];
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(truncated);
        StringSlot {
            offset,
            len: truncated.len() as u32,
        }
    }

    pub fn read(&self, slot: StringSlot) -> &[u8] {
        let start = slot.offset as usize;
        let end = start + slot.len as usize;
        &self.bytes[start..end]
    }
}
