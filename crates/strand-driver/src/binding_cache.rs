//! Content-addressed cache of native descriptor sets.
//!
//! Logical sets are edited slot by slot and bound by index without touching
//! native state. `commit` resolves every set the pipeline uses to a native
//! set whose written content matches, allocating and writing one only on a
//! miss, then issues native binds only for indices whose native set or
//! dynamic offsets differ from what was last bound.

use std::collections::{BTreeMap, HashMap};

use strand_core::ImageLayout;
use strand_protocol::{BindingKind, LayoutMask, RawHandle, SamplerParams, MAX_DESCRIPTOR_SETS};
use tracing::{debug, error, trace};

use crate::backend::{Backend, SetWrite, WriteResource};
use crate::driver::NativeResources;
use crate::error::BackendError;

/// Identity of a native set for the lifetime of the cache.
pub type SetId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotContent {
    Buffer {
        buffer: RawHandle,
        offset: u64,
        size: u64,
    },
    Texture {
        texture: RawHandle,
        sampler: SamplerParams,
    },
}

impl SlotContent {
    fn mentions(&self, resource: RawHandle) -> bool {
        match self {
            Self::Buffer { buffer, .. } => *buffer == resource,
            Self::Texture { texture, .. } => *texture == resource,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SetKey {
    layout: RawHandle,
    slots: Vec<(u8, SlotContent)>,
}

struct LogicalSet {
    layout: RawHandle,
    slots: BTreeMap<u8, SlotContent>,
}

struct CachedSet<B: Backend> {
    id: SetId,
    native: B::DescriptorSet,
    /// Last command buffer that bound it.
    last_used: u64,
}

struct LayoutEntry<B: Backend> {
    native: B::SetLayout,
    mask: LayoutMask,
    /// Native sets free for reuse, no longer referenced by any recorded work.
    free: Vec<B::DescriptorSet>,
}

struct Retiring<B: Backend> {
    layout: RawHandle,
    native: B::DescriptorSet,
    last_used: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct BoundSet {
    set: RawHandle,
    offsets: Vec<u32>,
}

/// What the native command buffer currently has bound.
#[derive(Debug, Clone, PartialEq)]
struct LastBound {
    program: RawHandle,
    set_mask: u8,
    sets: [Option<(SetId, Vec<u32>)>; MAX_DESCRIPTOR_SETS],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingCounters {
    pub native_binds: u64,
    pub allocations: u64,
    pub hits: u64,
    pub reuses: u64,
}

pub struct BindingCache<B: Backend> {
    capacity: usize,
    layouts: HashMap<RawHandle, LayoutEntry<B>>,
    logical: HashMap<RawHandle, LogicalSet>,
    cache: HashMap<SetKey, CachedSet<B>>,
    retiring: Vec<Retiring<B>>,
    bound: [Option<BoundSet>; MAX_DESCRIPTOR_SETS],
    last: Option<LastBound>,
    next_id: SetId,
    counters: BindingCounters,
}

impl<B: Backend> BindingCache<B> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            layouts: HashMap::new(),
            logical: HashMap::new(),
            cache: HashMap::new(),
            retiring: Vec::new(),
            bound: Default::default(),
            last: None,
            next_id: 1,
            counters: BindingCounters::default(),
        }
    }

    // ── Layouts and logical sets ────────────────────────────

    pub fn add_layout(&mut self, handle: RawHandle, native: B::SetLayout, mask: LayoutMask) {
        self.layouts.insert(
            handle,
            LayoutEntry {
                native,
                mask,
                free: Vec::new(),
            },
        );
    }

    pub fn layout_native(&self, handle: RawHandle) -> Option<&B::SetLayout> {
        self.layouts.get(&handle).map(|l| &l.native)
    }

    pub fn layout_mask(&self, handle: RawHandle) -> Option<LayoutMask> {
        self.layouts.get(&handle).map(|l| l.mask)
    }

    pub fn add_set(&mut self, handle: RawHandle, layout: RawHandle) {
        if !self.layouts.contains_key(&layout) {
            error!("descriptor set {} created with unknown layout {}", handle, layout);
            panic!("descriptor set {handle} references unknown layout {layout}");
        }
        self.logical.insert(
            handle,
            LogicalSet {
                layout,
                slots: BTreeMap::new(),
            },
        );
    }

    /// Writes `content` into `slot` of a logical set. Validates the slot was
    /// declared with a compatible kind.
    pub fn update(&mut self, set: RawHandle, slot: u8, content: SlotContent) {
        let Some(logical) = self.logical.get_mut(&set) else {
            error!("update of unknown descriptor set {}", set);
            panic!("descriptor set {set} does not exist");
        };
        let mask = match self.layouts.get(&logical.layout) {
            Some(layout) => layout.mask,
            None => panic!("descriptor set {set} outlived its layout"),
        };
        let compatible = match (mask.kind_of(slot), &content) {
            (Some(kind), SlotContent::Buffer { .. }) => kind.is_buffer(),
            (Some(kind), SlotContent::Texture { .. }) => kind.is_texture(),
            (None, _) => false,
        };
        if !compatible {
            error!(
                "slot {} of set {} is declared as {:?}, cannot hold {:?}",
                slot,
                set,
                mask.kind_of(slot),
                content
            );
            panic!("descriptor set {set}: slot {slot} cannot hold {content:?}");
        }
        logical.slots.insert(slot, content);
    }

    /// Textures sampled through a logical set.
    pub fn sampled_textures(&self, set: RawHandle) -> Vec<RawHandle> {
        self.logical
            .get(&set)
            .map(|logical| {
                logical
                    .slots
                    .values()
                    .filter_map(|content| match content {
                        SlotContent::Texture { texture, .. } => Some(*texture),
                        SlotContent::Buffer { .. } => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Bind state ──────────────────────────────────────────

    pub fn bind(&mut self, index: u8, set: RawHandle, offsets: Vec<u32>) {
        if !self.logical.contains_key(&set) {
            error!("bind of unknown descriptor set {}", set);
            panic!("descriptor set {set} does not exist");
        }
        self.bound[index as usize] = Some(BoundSet { set, offsets });
    }

    pub fn unbind(&mut self, index: u8) {
        self.bound[index as usize] = None;
    }

    /// Logical sets bound at the indices in `set_mask`.
    pub fn bound_sets(&self, set_mask: u8) -> Vec<RawHandle> {
        (0..MAX_DESCRIPTOR_SETS)
            .filter(|i| set_mask & (1 << i) != 0)
            .filter_map(|i| self.bound[i].as_ref().map(|b| b.set))
            .collect()
    }

    /// Native bind state does not survive a command buffer boundary.
    pub fn reset_bound_snapshot(&mut self) {
        self.last = None;
    }

    // ── Commit ──────────────────────────────────────────────

    /// Resolves the sets `program` uses and binds what changed.
    #[allow(clippy::too_many_arguments)]
    pub fn commit(
        &mut self,
        backend: &mut B,
        natives: &NativeResources<B>,
        program: RawHandle,
        pipeline_layout: &B::Program,
        set_mask: u8,
        seq: u64,
        frontier: u64,
    ) -> Result<(), BackendError> {
        let mut keys: [Option<SetKey>; MAX_DESCRIPTOR_SETS] = Default::default();
        let mut desired: [Option<(SetId, Vec<u32>)>; MAX_DESCRIPTOR_SETS] = Default::default();

        for index in 0..MAX_DESCRIPTOR_SETS {
            if set_mask & (1 << index) == 0 {
                continue;
            }
            let Some(bound) = self.bound[index].clone() else {
                error!("program {} uses descriptor set {} but none is bound", program, index);
                panic!("program {program} uses descriptor set {index} but none is bound");
            };
            let key = self.key_of(bound.set);
            let id = self.resolve(backend, natives, &key, seq, frontier)?;
            keys[index] = Some(key);
            desired[index] = Some((id, bound.offsets));
        }

        let full_rebind = match &self.last {
            Some(last) => last.program != program || last.set_mask != set_mask,
            None => true,
        };
        for index in 0..MAX_DESCRIPTOR_SETS {
            let Some((_, offsets)) = &desired[index] else {
                continue;
            };
            let unchanged = !full_rebind
                && self.last.as_ref().map(|l| &l.sets[index]) == Some(&desired[index]);
            if unchanged {
                continue;
            }
            let Some(key) = &keys[index] else { continue };
            if let Some(cached) = self.cache.get(key) {
                backend.bind_set(pipeline_layout, index as u8, &cached.native, offsets);
                self.counters.native_binds += 1;
                trace!("bound native set {} at index {}", cached.id, index);
            }
        }

        self.last = Some(LastBound {
            program,
            set_mask,
            sets: desired,
        });
        Ok(())
    }

    fn key_of(&self, set: RawHandle) -> SetKey {
        let Some(logical) = self.logical.get(&set) else {
            error!("commit of unknown descriptor set {}", set);
            panic!("descriptor set {set} does not exist");
        };
        SetKey {
            layout: logical.layout,
            slots: logical.slots.iter().map(|(slot, c)| (*slot, *c)).collect(),
        }
    }

    /// Finds or creates the native set holding exactly `key`'s content.
    fn resolve(
        &mut self,
        backend: &mut B,
        natives: &NativeResources<B>,
        key: &SetKey,
        seq: u64,
        frontier: u64,
    ) -> Result<SetId, BackendError> {
        if let Some(cached) = self.cache.get_mut(key) {
            cached.last_used = seq;
            self.counters.hits += 1;
            return Ok(cached.id);
        }

        let native = match self.take_native(key.layout, frontier) {
            Some(native) => native,
            None => {
                let Some(layout) = self.layouts.get_mut(&key.layout) else {
                    panic!("descriptor set layout {} does not exist", key.layout);
                };
                self.counters.allocations += 1;
                backend.allocate_set(&mut layout.native)?
            }
        };

        let Some(layout) = self.layouts.get(&key.layout) else {
            panic!("descriptor set layout {} does not exist", key.layout);
        };
        let writes = build_writes(natives, &layout.mask, key);
        backend.write_set(&native, &writes);

        let id = self.next_id;
        self.next_id += 1;
        trace!("wrote native set {} ({} slots)", id, key.slots.len());
        self.cache.insert(
            key.clone(),
            CachedSet {
                id,
                native,
                last_used: seq,
            },
        );
        Ok(id)
    }

    /// A free native set for `layout`: from the layout's pool, or, once the
    /// cache is at capacity, the least recently used retired entry.
    fn take_native(&mut self, layout: RawHandle, frontier: u64) -> Option<B::DescriptorSet> {
        if let Some(native) = self.layouts.get_mut(&layout).and_then(|l| l.free.pop()) {
            return Some(native);
        }
        if self.cache.len() < self.capacity {
            return None;
        }
        let victim = self
            .cache
            .iter()
            .filter(|(key, cached)| key.layout == layout && cached.last_used <= frontier)
            .min_by_key(|(_, cached)| cached.last_used)
            .map(|(key, _)| key.clone());
        let cached = self.cache.remove(&victim?)?;
        self.counters.reuses += 1;
        Some(cached.native)
    }

    // ── Eviction ────────────────────────────────────────────

    /// Drops every cached native set whose content mentions `resource`.
    pub fn evict_resource(&mut self, resource: RawHandle) {
        let doomed: Vec<SetKey> = self
            .cache
            .keys()
            .filter(|key| key.slots.iter().any(|(_, c)| c.mentions(resource)))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return;
        }
        debug!("evicting {} native sets referencing {}", doomed.len(), resource);
        for key in doomed {
            if let Some(cached) = self.cache.remove(&key) {
                self.forget_bound(cached.id);
                self.retiring.push(Retiring {
                    layout: key.layout,
                    native: cached.native,
                    last_used: cached.last_used,
                });
            }
        }
    }

    pub fn remove_set(&mut self, set: RawHandle) {
        self.logical.remove(&set);
        for bound in &mut self.bound {
            if bound.as_ref().is_some_and(|b| b.set == set) {
                *bound = None;
            }
        }
    }

    /// Removes a layout and returns its native object for destruction.
    /// Every native set allocated from it goes with it.
    pub fn remove_layout(&mut self, layout: RawHandle) -> Option<B::SetLayout> {
        self.cache.retain(|key, _| key.layout != layout);
        self.retiring.retain(|r| r.layout != layout);
        self.last = None;
        self.layouts.remove(&layout).map(|entry| entry.native)
    }

    /// Returns evicted native sets whose last use retired to their pools.
    pub fn retire(&mut self, frontier: u64) {
        let mut index = 0;
        while index < self.retiring.len() {
            if self.retiring[index].last_used <= frontier {
                let retired = self.retiring.swap_remove(index);
                if let Some(layout) = self.layouts.get_mut(&retired.layout) {
                    layout.free.push(retired.native);
                }
            } else {
                index += 1;
            }
        }
    }

    /// Moves every native set back to its layout's pool. Only valid once the
    /// device is idle.
    pub fn clear_history(&mut self) {
        let reclaimed = self.cache.len() + self.retiring.len();
        for (key, cached) in self.cache.drain() {
            if let Some(layout) = self.layouts.get_mut(&key.layout) {
                layout.free.push(cached.native);
            }
        }
        for retiring in self.retiring.drain(..) {
            if let Some(layout) = self.layouts.get_mut(&retiring.layout) {
                layout.free.push(retiring.native);
            }
        }
        self.last = None;
        debug!("binding history cleared, {} native sets reclaimed", reclaimed);
    }

    /// Tears down every layout. Caller must have waited for the device.
    pub fn drain_layouts(&mut self) -> Vec<B::SetLayout> {
        self.cache.clear();
        self.retiring.clear();
        self.logical.clear();
        self.bound = Default::default();
        self.last = None;
        self.layouts.drain().map(|(_, entry)| entry.native).collect()
    }

    fn forget_bound(&mut self, id: SetId) {
        if let Some(last) = &self.last {
            if last.sets.iter().flatten().any(|(bound, _)| *bound == id) {
                self.last = None;
            }
        }
    }

    pub fn counters(&self) -> BindingCounters {
        self.counters
    }

    pub fn cached_sets(&self) -> usize {
        self.cache.len()
    }
}

fn build_writes<'a, B: Backend>(
    natives: &'a NativeResources<B>,
    mask: &LayoutMask,
    key: &SetKey,
) -> Vec<SetWrite<'a, B>> {
    key.slots
        .iter()
        .map(|(slot, content)| {
            let kind = mask.kind_of(*slot).unwrap_or(BindingKind::UniformBuffer);
            let resource = match content {
                SlotContent::Buffer {
                    buffer,
                    offset,
                    size,
                } => WriteResource::Buffer {
                    buffer: natives.buffer(*buffer),
                    offset: *offset,
                    size: *size,
                },
                SlotContent::Texture { texture, sampler } => {
                    let (native, format) = natives.texture(*texture);
                    WriteResource::Texture {
                        texture: native,
                        sampler: natives.sampler(sampler),
                        layout: ImageLayout::sampled_for(format),
                    }
                }
            };
            SetWrite {
                slot: *slot,
                kind,
                resource,
            }
        })
        .collect()
}
