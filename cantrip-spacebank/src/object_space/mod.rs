// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Raw storage: installed ranges of object space and the frame caches
//! in front of them.

extern crate alloc;
use alloc::vec;
use alloc::vec::Vec;
use bitvec::prelude::*;
use cantrip_spacebank_interface::frame_of;
use cantrip_spacebank_interface::frame_oid;
use cantrip_spacebank_interface::frame_to_oid;
use cantrip_spacebank_interface::BankId;
use cantrip_spacebank_interface::BaseType;
use cantrip_spacebank_interface::FrameProvider;
use cantrip_spacebank_interface::Oid;
use cantrip_spacebank_interface::RangeDesc;
use cantrip_spacebank_interface::SpaceBankError;
use cantrip_spacebank_interface::NUM_BASE_TYPES;
use cantrip_spacebank_interface::OBJECTS_PER_FRAME;
use cantrip_spacebank_interface::PAGE_SIZE;
use log::{debug, info, trace};
use smallvec::SmallVec;

pub const MAX_RANGES: usize = 16;
// Ranges kept inline; the rest spill to the heap.
const RANGE_CAPACITY: usize = 4;

// Frame caches per base type, selected by a hash of the bank.
pub const NCACHE: usize = 64;
// Frames held by one cache.
pub const MAX_CACHE_ENT: usize = 64;

// Frames tracked by one page of free-frame bitmap.
const FRAMES_PER_SUBMAP: u64 = PAGE_SIZE * 8;

fn howmany(value: u64, unit: u64) -> u64 { (value + (unit - 1)) / unit }

// An installed extent of object space. Frames are laid out as
//   [reserved][bitmap pages][allocatable...]
// where the reserved frames hold the initial system image.
struct Range {
    desc: RangeDesc,
    n_frames: u64,
    reserved_frames: u64,
    n_submaps: u64,
    n_avail: u64,          // Frames marked free in |free|
    end_cleared_oid: Oid,  // Frames at or past this have never been zeroed
    free: BitBox<u32, Lsb0>, // 1 => frame is free
}
impl Range {
    fn frame_index(&self, oid: Oid) -> usize { frame_of(oid - self.desc.start_oid) as usize }
    fn frame_oid(&self, index: usize) -> Oid { self.desc.start_oid + frame_to_oid(index as u64) }
    fn usable_frames(&self) -> u64 { self.n_frames - self.n_submaps }
    fn is_submap(&self, index: usize) -> bool {
        let first = self.reserved_frames as usize;
        first <= index && index < first + self.n_submaps as usize
    }
}

// LIFO of free frames popped from the range bitmaps. Entries
// [ndx..top) are valid; a release may push back below |ndx|.
#[derive(Clone)]
struct AllocCache {
    ndx: usize,
    top: usize,
    oids: [Oid; MAX_CACHE_ENT],
}
impl AllocCache {
    fn new() -> Self {
        AllocCache {
            ndx: 0,
            top: 0,
            oids: [0; MAX_CACHE_ENT],
        }
    }
    fn len(&self) -> usize { self.top - self.ndx }
    fn contains(&self, oid: Oid) -> bool { self.oids[self.ndx..self.top].contains(&oid) }
    fn pop(&mut self) -> Option<Oid> {
        if self.ndx < self.top {
            let oid = self.oids[self.ndx];
            self.ndx += 1;
            Some(oid)
        } else {
            None
        }
    }
    fn push_back(&mut self, oid: Oid) -> bool {
        if self.ndx > 0 {
            self.ndx -= 1;
            self.oids[self.ndx] = oid;
            true
        } else {
            false
        }
    }
}

fn cache_index(base_type: BaseType, bank: BankId) -> usize {
    base_type.index() * NCACHE + bank.index() % NCACHE
}

pub struct ObjectSpace {
    ranges: SmallVec<[Range; RANGE_CAPACITY]>,
    caches: Vec<AllocCache>, // NUM_BASE_TYPES * NCACHE
}
impl ObjectSpace {
    pub fn new() -> Self {
        ObjectSpace {
            ranges: SmallVec::new(),
            caches: vec![AllocCache::new(); NUM_BASE_TYPES * NCACHE],
        }
    }

    pub fn range_count(&self) -> usize { self.ranges.len() }
    // Frames available for allocation over all time.
    pub fn total_frames(&self) -> u64 { self.ranges.iter().map(|r| r.usable_frames()).sum() }
    // Frames marked free in the range bitmaps.
    pub fn free_frames(&self) -> u64 { self.ranges.iter().map(|r| r.n_avail).sum() }
    // Free frames held in the caches.
    pub fn cached_frames(&self) -> u64 { self.caches.iter().map(|c| c.len() as u64).sum() }

    pub fn contains(&self, oid: Oid) -> bool { self.ranges.iter().any(|r| r.desc.contains(oid)) }

    // Registers |desc|; its first |reserved_frames| frames are already in
    // use. Returns the number of frames the range adds to object space.
    pub fn install_range(
        &mut self,
        desc: &RangeDesc,
        reserved_frames: u64,
    ) -> Result<u64, SpaceBankError> {
        trace!("install_range {:?} reserved {}", desc, reserved_frames);
        if self.ranges.len() >= MAX_RANGES {
            return Err(SpaceBankError::TooManyRanges);
        }
        if desc.start_oid >= desc.end_oid
            || frame_oid(desc.start_oid) != desc.start_oid
            || frame_oid(desc.end_oid) != desc.end_oid
        {
            return Err(SpaceBankError::RequestError);
        }
        if self
            .ranges
            .iter()
            .any(|r| desc.start_oid < r.desc.end_oid && r.desc.start_oid < desc.end_oid)
        {
            return Err(SpaceBankError::RangeOverlap);
        }
        let n_frames = desc.n_frames();
        let n_submaps = howmany(n_frames, FRAMES_PER_SUBMAP);
        let first_free = reserved_frames + n_submaps;
        if first_free >= n_frames {
            return Err(SpaceBankError::RangeTooSmall);
        }
        let mut free = bitvec![u32, Lsb0; 0; n_frames as usize].into_boxed_bitslice();
        free[first_free as usize..].fill(true);
        let range = Range {
            desc: *desc,
            n_frames,
            reserved_frames,
            n_submaps,
            n_avail: n_frames - first_free,
            end_cleared_oid: desc.start_oid + frame_to_oid(first_free),
            free,
        };
        #[cfg(feature = "CONFIG_NOISY_RANGES")]
        info!(
            "range [{:#x}, {:#x}) frames {} reserved {} submaps {} avail {}",
            desc.start_oid, desc.end_oid, n_frames, reserved_frames, n_submaps, range.n_avail
        );
        let usable = range.usable_frames();
        self.ranges.push(range);
        Ok(usable)
    }

    // Returns a free frame for |bank|. The bank's cache is tried first,
    // then refilled from the ranges; as a last resort frames are taken
    // from other caches, of this type and then of any type.
    pub fn alloc_frame(
        &mut self,
        bank: BankId,
        base_type: BaseType,
        provider: &mut dyn FrameProvider,
    ) -> Result<Oid, SpaceBankError> {
        let index = cache_index(base_type, bank);
        if let Some(oid) = self.caches[index].pop() {
            trace!("alloc_frame {} {:?} -> {:#x}", bank, base_type, oid);
            return Ok(oid);
        }
        if self.fill_cache(index, provider)? {
            if let Some(oid) = self.caches[index].pop() {
                trace!("alloc_frame {} {:?} -> {:#x} (refill)", bank, base_type, oid);
                return Ok(oid);
            }
        }
        if let Some(oid) = self.steal(base_type, bank).or_else(|| self.steal_any(bank)) {
            trace!("alloc_frame {} {:?} -> {:#x} (stolen)", bank, base_type, oid);
            return Ok(oid);
        }
        debug!("alloc_frame {} {:?} failed (out of space)", bank, base_type);
        Err(SpaceBankError::OutOfSpace)
    }

    // Returns |oid| to the free pool.
    pub fn release_frame(&mut self, bank: BankId, oid: Oid, base_type: BaseType) {
        trace!("release_frame {} {:?} {:#x}", bank, base_type, oid);
        assert!(frame_oid(oid) == oid, "release of unaligned frame {:#x}", oid);
        debug_assert!(!self.is_cached(oid), "release of cached frame {:#x}", oid);
        let range = match self.ranges.iter_mut().find(|r| r.desc.contains(oid)) {
            Some(range) => range,
            None => panic!("release of frame {:#x} outside object space", oid),
        };
        let index = range.frame_index(oid);
        assert!(!range.is_submap(index), "release of bitmap frame {:#x}", oid);
        assert!(!range.free[index], "double free of frame {:#x}", oid);
        if self.caches[cache_index(base_type, bank)].push_back(oid) {
            return;
        }
        range.free.set(index, true);
        range.n_avail += 1;
    }

    fn is_cached(&self, oid: Oid) -> bool { self.caches.iter().any(|c| c.contains(oid)) }

    // Moves up to MAX_CACHE_ENT free frames from the first range with
    // space into cache |index|. Returns false if every range is full.
    fn fill_cache(
        &mut self,
        index: usize,
        provider: &mut dyn FrameProvider,
    ) -> Result<bool, SpaceBankError> {
        let range = match self.ranges.iter_mut().find(|r| r.n_avail > 0) {
            Some(range) => range,
            None => return Ok(false),
        };
        let frames: SmallVec<[usize; MAX_CACHE_ENT]> =
            range.free.iter_ones().take(MAX_CACHE_ENT).collect();
        let cache = &mut self.caches[index];
        debug_assert!(cache.len() == 0);
        cache.ndx = 0;
        cache.top = 0;
        for frame in frames {
            let oid = range.frame_oid(frame);
            while range.end_cleared_oid <= oid {
                provider.zero_frame(range.end_cleared_oid)?;
                range.end_cleared_oid += OBJECTS_PER_FRAME;
            }
            range.free.set(frame, false);
            range.n_avail -= 1;
            cache.oids[cache.top] = oid;
            cache.top += 1;
        }
        Ok(true)
    }

    // Takes a frame from the |base_type| caches, searching from |bank|'s
    // bucket onwards.
    fn steal(&mut self, base_type: BaseType, bank: BankId) -> Option<Oid> {
        let first = base_type.index() * NCACHE;
        let home = bank.index() % NCACHE;
        (0..NCACHE).find_map(|i| self.caches[first + (home + i) % NCACHE].pop())
    }

    fn steal_any(&mut self, bank: BankId) -> Option<Oid> {
        BaseType::ALL.iter().find_map(|base_type| self.steal(*base_type, bank))
    }

    pub fn debug(&self) {
        for range in &self.ranges {
            info!(
                "[{:#x}, {:#x}) frames {:6} reserved {:6} bitmap {:2} free {:6} cleared to {:#x}",
                range.desc.start_oid,
                range.desc.end_oid,
                range.n_frames,
                range.reserved_frames,
                range.n_submaps,
                range.n_avail,
                range.end_cleared_oid,
            );
        }
        for base_type in BaseType::ALL {
            let first = base_type.index() * NCACHE;
            let cached: usize = self.caches[first..first + NCACHE].iter().map(|c| c.len()).sum();
            info!("{:?} caches hold {} frames", base_type, cached);
        }
    }
}
impl Default for ObjectSpace {
    fn default() -> Self { Self::new() }
}
