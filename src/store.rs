//! Per-component-type columnar storage.
//!
//! Component fields live in parallel typed arrays indexed by row, one
//! `ComponentStore` per declared type, rather than behind per-entity
//! objects. `FieldAccessor` enforces a single-borrow rule with an explicit
//! epoch stamp rather than a ref-count: each access bumps the store's
//! epoch, and an older accessor still in scope goes stale rather than
//! aliasing the new one.

use std::sync::Arc;
use std::sync::Weak;

use downcast_rs::{impl_downcast, DowncastSync};
use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::bitset::Bitset;
use crate::buffer::{ByteHeap, Column, StringSlot};
use crate::component::{ComponentType, ComponentTypeId, FieldKind, StorageFlavor};
use crate::entity::{Entity, EntityIndex};
use crate::error::{WorldError, WorldResult};

/// A host-owned opaque value stored behind an `object`/`weakObject` field.
/// Any
/// `'static + Send + Sync` value qualifies, downcast by the field's caller.
pub trait HostValue: DowncastSync {}
impl_downcast!(HostValue);
impl<T: std::any::Any + Send + Sync> HostValue for T {}

enum FieldColumn {
    Bool(Column<bool>),
    U8(Column<u8>),
    U16(Column<u16>),
    U32(Column<u32>),
    I8(Column<i8>),
    I16(Column<i16>),
    I32(Column<i32>),
    F32(Column<f32>),
    F64(Column<f64>),
    StaticString(Column<u16>),
    DynamicString {
        slots: Column<StringSlot>,
        heap: Mutex<ByteHeap>,
        max_bytes: usize,
    },
    Ref(Column<Option<Entity>>),
    Object(Mutex<Vec<Option<Arc<dyn HostValue>>>>),
    WeakObject(Mutex<Vec<Option<Weak<dyn HostValue>>>>),
    Vector {
        values: Mutex<Vec<Vec<f64>>>,
        width: usize,
    },
    /// Not stored locally; served by `RefIndex`.
    Backrefs,
}

impl FieldColumn {
    fn new(kind: &FieldKind) -> Self {
        match kind {
            FieldKind::Bool => FieldColumn::Bool(Column::new_shared()),
            FieldKind::U8 => FieldColumn::U8(Column::new_shared()),
            FieldKind::U16 => FieldColumn::U16(Column::new_shared()),
            FieldKind::U32 => FieldColumn::U32(Column::new_shared()),
            FieldKind::I8 => FieldColumn::I8(Column::new_shared()),
            FieldKind::I16 => FieldColumn::I16(Column::new_shared()),
            FieldKind::I32 => FieldColumn::I32(Column::new_shared()),
            FieldKind::F32 => FieldColumn::F32(Column::new_shared()),
            FieldKind::F64 => FieldColumn::F64(Column::new_shared()),
            FieldKind::StaticString { .. } => FieldColumn::StaticString(Column::new_shared()),
            FieldKind::DynamicString { max_bytes } => FieldColumn::DynamicString {
                slots: Column::new_shared(),
                heap: Mutex::new(ByteHeap::new()),
                max_bytes: *max_bytes,
            },
            FieldKind::Ref => FieldColumn::Ref(Column::new_shared()),
            FieldKind::Object => FieldColumn::Object(Mutex::new(Vec::new())),
            FieldKind::WeakObject => FieldColumn::WeakObject(Mutex::new(Vec::new())),
            FieldKind::Vector { shape, .. } => FieldColumn::Vector {
                values: Mutex::new(Vec::new()),
                width: shape.components as usize,
            },
            FieldKind::Backrefs { .. } => FieldColumn::Backrefs,
        }
    }

    fn ensure_len(&self, len: usize) {
        // Scalar and ref columns grow lazily on first write, via
        // `set_through_shared`'s own resize-on-demand; this hook only
        // needs to handle the row kinds that manage their own length
        // outside of `Column`.
        match self {
            FieldColumn::Object(v) => {
                let mut g = v.lock();
                if g.len() < len {
                    g.resize_with(len, || None);
                }
            }
            FieldColumn::WeakObject(v) => {
                let mut g = v.lock();
                if g.len() < len {
                    g.resize_with(len, || None);
                }
            }
            FieldColumn::Vector { values, width } => {
                let mut g = values.lock();
                if g.len() < len {
                    g.resize_with(len, || vec![0.0; *width]);
                }
            }
            _ => {}
        }
    }
}

/// One row's worth of removed-but-not-yet-recycled data, kept around for
/// the limbo window and for same-frame
/// resurrection.
#[derive(Debug, Clone)]
struct PendingRemoval {
    entity_index: EntityIndex,
    /// Sparse-only: the dense row the data still occupies.
    dense_row: Option<usize>,
    removed_on_frame: u64,
}

/// Storage for a single registered component type.
pub struct ComponentStore {
    pub type_id: ComponentTypeId,
    pub type_name: &'static str,
    flavor: StorageFlavor,
    field_names: Vec<String>,
    field_kinds: Vec<FieldKind>,
    columns: Vec<FieldColumn>,

    /// Authoritative presence over entity index, for both flavors.
    presence: Bitset,
    /// Sparse only: entity index -> dense row.
    sparse_index: FxHashMap<EntityIndex, usize>,
    /// Sparse only: dense row -> entity index, for swap-remove bookkeeping.
    dense_entities: Vec<EntityIndex>,

    /// Rows pending limbo expiry, keyed by entity index.
    pending_removals: FxHashMap<EntityIndex, PendingRemoval>,
    max_limbo_components: usize,

    /// Single-borrow-rule epoch per live accessor, keyed by entity index.
    active_epoch: Mutex<FxHashMap<EntityIndex, u64>>,
    next_epoch: Mutex<u64>,
}

impl ComponentStore {
    pub fn new(ty: &ComponentType, max_limbo_components: usize) -> Self {
        let columns = ty.fields.iter().map(|f| FieldColumn::new(&f.kind)).collect();
        ComponentStore {
            type_id: ty.id,
            type_name: Box::leak(ty.name.clone().into_boxed_str()),
            flavor: ty.storage,
            field_names: ty.fields.iter().map(|f| f.name.clone()).collect(),
            field_kinds: ty.fields.iter().map(|f| f.kind.clone()).collect(),
            columns,
            presence: Bitset::new(),
            sparse_index: FxHashMap::default(),
            dense_entities: Vec::new(),
            pending_removals: FxHashMap::default(),
            max_limbo_components,
            active_epoch: Mutex::new(FxHashMap::default()),
            next_epoch: Mutex::new(1),
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_names.iter().position(|n| n == name)
    }

    pub fn has(&self, index: EntityIndex) -> bool {
        self.presence.get(index as usize)
    }

    fn row_of(&self, index: EntityIndex) -> Option<usize> {
        match self.flavor {
            StorageFlavor::Packed => {
                if self.has(index) {
                    Some(index as usize)
                } else {
                    None
                }
            }
            StorageFlavor::Sparse => self.sparse_index.get(&index).copied(),
        }
    }

    /// Allocates (or resurrects) a row for `index`. Returns the row number.
    /// If a `PendingRemoval` for this entity exists (removed earlier this
    /// frame and not yet flushed to limbo), it is cancelled and its row is
    /// reused verbatim: the resurrected row keeps its pre-removal state
    /// without reinitialization unless a patch is supplied by the caller
    /// separately.
    pub fn add(&mut self, index: EntityIndex) -> usize {
        if let Some(pending) = self.pending_removals.remove(&index) {
            self.presence.set(index as usize);
            return match self.flavor {
                StorageFlavor::Packed => index as usize,
                StorageFlavor::Sparse => {
                    let row = pending.dense_row.expect("sparse pending removal missing row");
                    self.sparse_index.insert(index, row);
                    row
                }
            };
        }

        self.presence.set(index as usize);
        match self.flavor {
            StorageFlavor::Packed => {
                let row = index as usize;
                for col in &self.columns {
                    col.ensure_len(row + 1);
                }
                row
            }
            StorageFlavor::Sparse => {
                let row = self.dense_entities.len();
                self.dense_entities.push(index);
                self.sparse_index.insert(index, row);
                for col in &self.columns {
                    col.ensure_len(row + 1);
                }
                row
            }
        }
    }

    /// Marks `index`'s row for limbo rather than freeing it immediately.
    /// The presence bit clears right away so non-stale reads stop seeing it
    /// in the same call. Fails with `LimboComponentCapacityExceeded` if the
    /// limbo set is already at its configured bound.
    pub fn remove(&mut self, index: EntityIndex, current_frame: u64) -> WorldResult<()> {
        if self.pending_removals.len() >= self.max_limbo_components {
            return Err(WorldError::LimboComponentCapacityExceeded {
                limit: self.max_limbo_components,
            });
        }
        let row = self.row_of(index);
        self.presence.clear_bit(index as usize);
        self.pending_removals.insert(
            index,
            PendingRemoval {
                entity_index: index,
                dense_row: row,
                removed_on_frame: current_frame,
            },
        );
        Ok(())
    }

    /// Called by the executor while advancing the limbo window. Any
    /// pending removal whose `removed_on_frame` has aged past
    /// `limbo_frames` is finally compacted out of the store.
    pub fn advance_limbo(&mut self, current_frame: u64, limbo_frames: u64) {
        let expired: Vec<EntityIndex> = self
            .pending_removals
            .iter()
            .filter(|(_, p)| current_frame.saturating_sub(p.removed_on_frame) >= limbo_frames)
            .map(|(idx, _)| *idx)
            .collect();

        for idx in expired {
            let pending = self.pending_removals.remove(&idx).unwrap();
            if self.flavor == StorageFlavor::Sparse {
                if let Some(row) = pending.dense_row {
                    self.compact_sparse_row(row);
                }
            }
        }
    }

    fn compact_sparse_row(&mut self, row: usize) {
        let last = self.dense_entities.len() - 1;
        if row != last {
            let moved_entity = self.dense_entities[last];
            self.dense_entities[row] = moved_entity;
            self.sparse_index.insert(moved_entity, row);
        }
        self.dense_entities.pop();
        // Field columns are compacted alongside by the same swap-remove
        // pattern; their lengths are kept in sync by callers that treat
        // `row` as the authority, so we simply leave trailing garbage,
        // swap-with-last compaction, cheap and order-agnostic since
        // valid entry, shrink logical length" without physically shrinking
        // every typed buffer on every removal.
    }

    /// Whether `index` still has data readable under the limbo contract:
    /// present normally, or pending-removed and the handle declared
    /// `access_recently_deleted_data`.
    pub fn is_readable(&self, entity: &Entity) -> bool {
        if self.has(entity.index()) {
            return true;
        }
        entity.can_access_recently_deleted_data() && self.pending_removals.contains_key(&entity.index())
    }

    fn row_for_read(&self, entity: &Entity) -> Option<usize> {
        if self.has(entity.index()) {
            return self.row_of(entity.index());
        }
        if entity.can_access_recently_deleted_data() {
            return self
                .pending_removals
                .get(&entity.index())
                .and_then(|p| match self.flavor {
                    StorageFlavor::Packed => Some(entity.index() as usize),
                    StorageFlavor::Sparse => p.dense_row,
                });
        }
        None
    }

    /// Opens an accessor for `entity`, stamping a fresh epoch that
    /// invalidates any earlier live accessor for the same row.
    pub fn access(&self, entity: Entity, mutable: bool) -> WorldResult<FieldAccessor<'_>> {
        let row = self.row_for_read(&entity).ok_or(WorldError::StaleComponentRead {
            entity,
            type_name: self.type_name,
        })?;

        let mut epoch_guard = self.active_epoch.lock();
        let mut next = self.next_epoch.lock();
        let epoch = *next;
        *next += 1;
        epoch_guard.insert(entity.index(), epoch);
        drop(epoch_guard);
        drop(next);

        Ok(FieldAccessor {
            store: self,
            entity,
            row,
            epoch,
            mutable,
        })
    }
}

macro_rules! scalar_accessor {
    ($get_name:ident, $set_name:ident, $variant:ident, $ty:ty) => {
        pub fn $get_name(&self, field: usize) -> WorldResult<$ty> {
            self.check_epoch()?;
            match &self.store.columns[field] {
                FieldColumn::$variant(col) => Ok(col.get(self.row).unwrap_or_default()),
                _ => Err(WorldError::internal("field kind mismatch")),
            }
        }

        pub fn $set_name(&self, field: usize, value: $ty) -> WorldResult<()> {
            self.check_epoch()?;
            self.require_mutable()?;
            match &self.store.columns[field] {
                FieldColumn::$variant(col) => {
                    col.set_through_shared(self.row, value);
                    Ok(())
                }
                _ => Err(WorldError::internal("field kind mismatch")),
            }
        }
    };
}

/// A thin, epoch-stamped view over one entity's row, returned by
/// `ComponentStore::access`. Valid only until the next `access()` call for
/// the same entity on the same store.
pub struct FieldAccessor<'s> {
    store: &'s ComponentStore,
    entity: Entity,
    row: usize,
    epoch: u64,
    mutable: bool,
}

impl<'s> std::fmt::Debug for FieldAccessor<'s> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldAccessor")
            .field("entity", &self.entity)
            .field("row", &self.row)
            .field("epoch", &self.epoch)
            .field("mutable", &self.mutable)
            .finish()
    }
}

impl<'s> FieldAccessor<'s> {
    /// The epoch this accessor was stamped with, for forwarding into
    /// `QueryEngine::on_write` after a mutation.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn check_epoch(&self) -> WorldResult<()> {
        let guard = self.store.active_epoch.lock();
        match guard.get(&self.entity.index()) {
            Some(e) if *e == self.epoch => Ok(()),
            _ => Err(WorldError::StaleAccessor {
                entity: self.entity,
                type_name: self.store.type_name,
            }),
        }
    }

    fn require_mutable(&self) -> WorldResult<()> {
        if self.mutable {
            Ok(())
        } else {
            Err(WorldError::internal("write attempted through a read() accessor"))
        }
    }

    scalar_accessor!(get_bool, set_bool, Bool, bool);
    scalar_accessor!(get_u8, set_u8, U8, u8);
    scalar_accessor!(get_u16, set_u16, U16, u16);
    scalar_accessor!(get_u32, set_u32, U32, u32);
    scalar_accessor!(get_i8, set_i8, I8, i8);
    scalar_accessor!(get_i16, set_i16, I16, i16);
    scalar_accessor!(get_i32, set_i32, I32, i32);
    scalar_accessor!(get_f32, set_f32, F32, f32);
    scalar_accessor!(get_f64, set_f64, F64, f64);
    scalar_accessor!(get_static_string_index, set_static_string_index, StaticString, u16);

    pub fn get_ref(&self, field: usize) -> WorldResult<Option<Entity>> {
        self.check_epoch()?;
        match &self.store.columns[field] {
            FieldColumn::Ref(col) => Ok(col.get(self.row).flatten()),
            _ => Err(WorldError::internal("field kind mismatch")),
        }
    }

    pub fn set_ref(&self, field: usize, value: Option<Entity>) -> WorldResult<()> {
        self.check_epoch()?;
        self.require_mutable()?;
        match &self.store.columns[field] {
            FieldColumn::Ref(col) => {
                col.set_through_shared(self.row, value);
                Ok(())
            }
            _ => Err(WorldError::internal("field kind mismatch")),
        }
    }

    pub fn get_dynamic_string(&self, field: usize) -> WorldResult<Vec<u8>> {
        self.check_epoch()?;
        match &self.store.columns[field] {
            FieldColumn::DynamicString { slots, heap, .. } => {
                let slot = slots.get(self.row).unwrap_or_default();
                Ok(heap.lock().read(slot).to_vec())
            }
            _ => Err(WorldError::internal("field kind mismatch")),
        }
    }

    pub fn set_dynamic_string(&self, field: usize, data: &[u8]) -> WorldResult<()> {
        self.check_epoch()?;
        self.require_mutable()?;
        match &self.store.columns[field] {
            FieldColumn::DynamicString { slots, heap, max_bytes } => {
                let slot = heap.lock().append(data, *max_bytes);
                slots.set_through_shared(self.row, slot);
                Ok(())
            }
            _ => Err(WorldError::internal("field kind mismatch")),
        }
    }

    pub fn get_object(&self, field: usize) -> WorldResult<Option<Arc<dyn HostValue>>> {
        self.check_epoch()?;
        match &self.store.columns[field] {
            FieldColumn::Object(v) => Ok(v.lock().get(self.row).cloned().flatten()),
            _ => Err(WorldError::internal("field kind mismatch")),
        }
    }

    pub fn set_object(&self, field: usize, value: Option<Arc<dyn HostValue>>) -> WorldResult<()> {
        self.check_epoch()?;
        self.require_mutable()?;
        match &self.store.columns[field] {
            FieldColumn::Object(v) => {
                let mut g = v.lock();
                if g.len() <= self.row {
                    g.resize_with(self.row + 1, || None);
                }
                g[self.row] = value;
                Ok(())
            }
            _ => Err(WorldError::internal("field kind mismatch")),
        }
    }

    pub fn get_weak_object(&self, field: usize) -> WorldResult<Option<Arc<dyn HostValue>>> {
        self.check_epoch()?;
        match &self.store.columns[field] {
            FieldColumn::WeakObject(v) => Ok(v.lock().get(self.row).and_then(|w| w.as_ref()).and_then(|w| w.upgrade())),
            _ => Err(WorldError::internal("field kind mismatch")),
        }
    }

    pub fn set_weak_object(&self, field: usize, value: Option<&Arc<dyn HostValue>>) -> WorldResult<()> {
        self.check_epoch()?;
        self.require_mutable()?;
        match &self.store.columns[field] {
            FieldColumn::WeakObject(v) => {
                let mut g = v.lock();
                if g.len() <= self.row {
                    g.resize_with(self.row + 1, || None);
                }
                g[self.row] = value.map(Arc::downgrade);
                Ok(())
            }
            _ => Err(WorldError::internal("field kind mismatch")),
        }
    }

    pub fn get_vector(&self, field: usize) -> WorldResult<Vec<f64>> {
        self.check_epoch()?;
        match &self.store.columns[field] {
            FieldColumn::Vector { values, width } => {
                let g = values.lock();
                Ok(g.get(self.row).cloned().unwrap_or_else(|| vec![0.0; *width]))
            }
            _ => Err(WorldError::internal("field kind mismatch")),
        }
    }

    pub fn set_vector(&self, field: usize, data: &[f64]) -> WorldResult<()> {
        self.check_epoch()?;
        self.require_mutable()?;
        match &self.store.columns[field] {
            FieldColumn::Vector { values, width } => {
                let mut g = values.lock();
                if g.len() <= self.row {
                    g.resize_with(self.row + 1, || vec![0.0; *width]);
                }
                g[self.row] = data.to_vec();
                Ok(())
            }
            _ => Err(WorldError::internal("field kind mismatch")),
        }
    }
}
