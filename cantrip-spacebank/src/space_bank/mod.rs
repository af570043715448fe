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

//! Cantrip OS SpaceBank storage allocator

extern crate alloc;
use crate::alloc_tree::TreeArena;
use crate::alloc_tree::TreeError;
use crate::bank::BankTable;
use crate::bank::TypeFrameCache;
use crate::object_space::ObjectSpace;
use alloc::boxed::Box;
use alloc::vec::Vec;
use cantrip_spacebank_interface::frame_oid;
use cantrip_spacebank_interface::frame_to_oid;
use cantrip_spacebank_interface::index_in_frame;
use cantrip_spacebank_interface::BankId;
use cantrip_spacebank_interface::BankKey;
use cantrip_spacebank_interface::BankLimits;
use cantrip_spacebank_interface::BaseType;
use cantrip_spacebank_interface::Cap;
use cantrip_spacebank_interface::CapabilityFabric;
use cantrip_spacebank_interface::FrameProvider;
use cantrip_spacebank_interface::ObjType;
use cantrip_spacebank_interface::Oid;
use cantrip_spacebank_interface::PremadeKey;
use cantrip_spacebank_interface::Precludes;
use cantrip_spacebank_interface::SpaceBankError;
use cantrip_spacebank_interface::SpaceBankInterface;
use cantrip_spacebank_interface::SpaceBankStats;
use cantrip_spacebank_interface::VolumeSize;
use cantrip_spacebank_interface::NUM_PRECLUDES;
use cantrip_spacebank_interface::OBJECTS_PER_FRAME;
use core::mem;
use log::{debug, error, info, trace, warn};
use smallvec::SmallVec;

// Most objects named by one alloc, free, or identify request.
pub const MAX_OBJECTS_PER_REQUEST: usize = 3;

// The SpaceBank tracks which bank owns every allocated object. Each
// bank charges the frames it uses against its own limit and the limit
// of every ancestor; frames come from the ObjectSpace and are recorded
// in the bank's AllocTree. Objects are made real (and later destroyed)
// through the FrameProvider; keys to banks are built with the
// CapabilityFabric.
pub struct SpaceBank {
    banks: BankTable,
    arena: TreeArena,
    space: ObjectSpace,
    provider: Box<dyn FrameProvider + Send>,
    fabric: Box<dyn CapabilityFabric + Send>,

    // Alloc requests refused for lack of quota.
    limit_reached: usize,

    // Alloc requests refused for lack of storage.
    out_of_space: usize,
}

impl SpaceBank {
    // Creates a SpaceBank with the fixed banks and no storage; call
    // boot() to install object space.
    pub fn new(
        provider: Box<dyn FrameProvider + Send>,
        fabric: Box<dyn CapabilityFabric + Send>,
    ) -> Self {
        let mut banks = BankTable::new();
        // NB: creation order fixes the well-known bank ids. The root
        // bank's limit grows as ranges are installed.
        assert_eq!(banks.create(None, 0), Ok(BankId::ROOT));
        assert_eq!(banks.create(Some(BankId::ROOT), u64::MAX), Ok(BankId::PRIME));
        assert_eq!(banks.create(Some(BankId::PRIME), 0), Ok(BankId::VERIFY));
        SpaceBank {
            banks,
            arena: TreeArena::new(),
            space: ObjectSpace::new(),
            provider,
            fabric,
            limit_reached: 0,
            out_of_space: 0,
        }
    }

    // Installs object space and charges the initial system image to the
    // prime bank.
    pub fn boot(&mut self, volsize: &VolumeSize) -> Result<(), SpaceBankError> {
        trace!("boot {:?}", volsize);
        if volsize.image_frames() > 0 && volsize.image_range >= volsize.ranges.len() {
            return Err(SpaceBankError::RequestError);
        }
        for (index, desc) in volsize.ranges.iter().enumerate() {
            let reserved = if index == volsize.image_range { volsize.image_frames() } else { 0 };
            let usable = self.space.install_range(desc, reserved)?;
            self.banks.bank_mut(BankId::ROOT).limit += usable;
        }
        if volsize.image_frames() > 0 {
            let start_oid = volsize.ranges[volsize.image_range].start_oid;
            self.preallocate_type(BankId::PRIME, BaseType::Node, start_oid, volsize.nodes)?;
            self.preallocate_type(
                BankId::PRIME,
                BaseType::Page,
                start_oid + frame_to_oid(volsize.node_frames()),
                volsize.pages,
            )?;
        }
        for key in &volsize.premade_keys {
            self.install_premade_key(key)?;
        }
        info!(
            "SpaceBank: {} ranges, {} frames, {} free, image {} nodes {} pages",
            self.space.range_count(),
            self.space.total_frames(),
            self.space.free_frames(),
            volsize.nodes,
            volsize.pages
        );
        Ok(())
    }

    // Records |count| objects of |base_type| starting at |start_oid| as
    // allocated to |bank|. The unused tail of a partially filled last
    // frame primes the bank's type frame cache.
    pub fn preallocate_type(
        &mut self,
        bank: BankId,
        base_type: BaseType,
        start_oid: Oid,
        count: u64,
    ) -> Result<(), SpaceBankError> {
        trace!("preallocate {} {:?} {:#x} count {}", bank, base_type, start_oid, count);
        if count > 0 && (frame_oid(start_oid) != start_oid || !self.space.contains(start_oid)) {
            return Err(SpaceBankError::RequestError);
        }
        let per_frame = base_type.objects_per_frame();
        let mut oid = start_oid;
        let mut remaining = count;
        while remaining > 0 {
            let used = remaining.min(per_frame as u64) as u32;
            self.banks.reserve_frames(bank, 1)?;
            self.banks
                .get_mut(bank)?
                .alloc_tree
                .insert_oids(&mut self.arena, base_type, oid, per_frame);
            if used < per_frame {
                self.flush_type_frame(bank, base_type);
                if let Some(cache) = self.banks.bank_mut(bank).type_frame_mut(base_type) {
                    cache.frame_oid = oid;
                    cache.free_map = base_type.frame_mask() & !((1 << used) - 1);
                }
            }
            remaining -= used as u64;
            oid += OBJECTS_PER_FRAME;
        }
        Ok(())
    }

    // Wires a forwarder from the system image up as a restricted key.
    pub fn install_premade_key(&mut self, key: &PremadeKey) -> Result<(), SpaceBankError> {
        trace!("install_premade_key {:?}", key);
        let (obj_type, oid) = self.provider.identify(key.forwarder).ok_or(SpaceBankError::InvalidCap)?;
        if obj_type != ObjType::Forwarder {
            return Err(SpaceBankError::WrongType);
        }
        self.banks.get(key.bank)?;
        self.init_key_node(key.forwarder, key.bank, key.precludes)?;
        self.banks.bank_mut(key.bank).limited_keys[key.precludes.index()] = Some(oid);
        Ok(())
    }

    pub fn reserve_frames(&mut self, bank: BankId, count: u64) -> Result<(), SpaceBankError> {
        self.banks.reserve_frames(bank, count)
    }
    pub fn unreserve_frames(&mut self, bank: BankId, count: u64) {
        self.banks.unreserve_frames(bank, count)
    }

    fn note_failure(&mut self, err: &SpaceBankError) {
        match err {
            SpaceBankError::LimitReached => self.limit_reached += 1,
            SpaceBankError::OutOfSpace => self.out_of_space += 1,
            _ => {}
        }
    }

    // Charges a new frame to |bank| and records it in the bank's tree.
    fn alloc_new_frame(&mut self, bank: BankId, base_type: BaseType) -> Result<Oid, SpaceBankError> {
        self.banks.reserve_frames(bank, 1)?;
        let frame = match self.space.alloc_frame(bank, base_type, self.provider.as_mut()) {
            Ok(frame) => frame,
            Err(e) => {
                self.banks.unreserve_frames(bank, 1);
                return Err(e);
            }
        };
        // NB: the root bank is allocate-only so its frames are not tracked.
        if bank != BankId::ROOT {
            self.banks.bank_mut(bank).alloc_tree.insert_oids(
                &mut self.arena,
                base_type,
                frame,
                base_type.objects_per_frame(),
            );
        }
        Ok(frame)
    }

    // Takes an object from the bank's partially used frame, starting a
    // new frame when none is cached.
    fn alloc_from_type_frame(
        &mut self,
        bank: BankId,
        base_type: BaseType,
    ) -> Result<Oid, SpaceBankError> {
        let cached = self
            .banks
            .bank(bank)
            .type_frame(base_type)
            .map_or(false, |cache| !cache.is_empty());
        let fresh = if cached { None } else { Some(self.alloc_new_frame(bank, base_type)?) };
        match self.banks.bank_mut(bank).type_frame_mut(base_type) {
            Some(cache) => {
                if let Some(frame) = fresh {
                    cache.frame_oid = frame;
                    cache.free_map = base_type.frame_mask();
                }
                let index = cache.free_map.trailing_zeros();
                cache.free_map &= !(1 << index);
                Ok(cache.frame_oid + index as u64)
            }
            None => panic!("{:?} has no type frame cache", base_type),
        }
    }

    // Allocates one object of |obj_type| from |bank|.
    pub fn alloc_object(
        &mut self,
        bank: BankId,
        obj_type: ObjType,
    ) -> Result<(Oid, Cap), SpaceBankError> {
        trace!("alloc_object {} {:?}", bank, obj_type);
        self.banks.get(bank)?;
        let base_type = obj_type.base_type();
        let saved = self.saved_type_frame(bank, base_type);
        let oid = if base_type.is_multi_object() {
            self.alloc_from_type_frame(bank, base_type)
        } else {
            self.alloc_new_frame(bank, base_type)
        };
        let oid = match oid {
            Ok(oid) => oid,
            Err(e) => {
                self.note_failure(&e);
                return Err(e);
            }
        };
        match self.provider.retype_and_get_cap(obj_type, oid) {
            Ok(cap) => {
                self.banks.bank_mut(bank).allocs[obj_type.index()] += 1;
                Ok((oid, cap))
            }
            Err(e) => {
                error!("retype {:?} {:#x} for {} failed: {:?}", obj_type, oid, bank, e);
                self.restore_objects(bank, base_type, &[oid], saved);
                Err(e)
            }
        }
    }

    // Removes |oid| from |bank|'s tree, returning its frame to object
    // space when the frame empties.
    fn tree_remove_oid(
        &mut self,
        bank: BankId,
        base_type: BaseType,
        oid: Oid,
    ) -> Result<(), TreeError> {
        let freed = self
            .banks
            .bank_mut(bank)
            .alloc_tree
            .remove_oid(&mut self.arena, base_type, oid)?;
        if let Some(frame) = freed {
            self.banks.unreserve_frames(bank, 1);
            self.space.release_frame(bank, frame, base_type);
        }
        Ok(())
    }

    // Returns an entirely free frame that was charged to |bank|.
    fn release_whole_frame(&mut self, bank: BankId, base_type: BaseType, frame: Oid) {
        if bank == BankId::ROOT {
            self.banks.unreserve_frames(bank, 1);
            self.space.release_frame(bank, frame, base_type);
            return;
        }
        for index in 0..base_type.objects_per_frame() {
            if let Err(e) = self.tree_remove_oid(bank, base_type, frame + index as u64) {
                panic!("frame {:#x} not tracked by {}: {:?}", frame, bank, e);
            }
        }
    }

    // Marks |oid| free in |bank| without touching the statistics.
    fn release_oid(&mut self, bank: BankId, base_type: BaseType, oid: Oid) -> Result<(), SpaceBankError> {
        let frame = frame_oid(oid);
        let bit = 1u32 << index_in_frame(oid);
        if let Some(cache) = self.banks.get_mut(bank)?.type_frame_mut(base_type) {
            if cache.holds(frame) {
                assert!(cache.free_map & bit == 0, "free of unallocated object {:#x}", oid);
                cache.free_map |= bit;
                if cache.free_map == base_type.frame_mask() {
                    cache.reset();
                    self.release_whole_frame(bank, base_type, frame);
                }
                return Ok(());
            }
        }
        if bank == BankId::ROOT {
            // Untracked; a root object only owns its frame when it is
            // the sole object in it.
            if base_type.is_multi_object() {
                return Err(SpaceBankError::NotInBank);
            }
            self.banks.unreserve_frames(bank, 1);
            self.space.release_frame(bank, frame, base_type);
            return Ok(());
        }
        self.tree_remove_oid(bank, base_type, oid)
            .or(Err(SpaceBankError::NotInBank))
    }

    // Frees |oid| (of |obj_type|) owned by |bank|.
    pub fn dealloc_oid(&mut self, bank: BankId, obj_type: ObjType, oid: Oid) -> Result<(), SpaceBankError> {
        trace!("dealloc_oid {} {:?} {:#x}", bank, obj_type, oid);
        self.release_oid(bank, obj_type.base_type(), oid)?;
        self.banks.bank_mut(bank).deallocs[obj_type.index()] += 1;
        Ok(())
    }

    // Returns true if |oid| is allocated to |bank|.
    pub fn contains_oid(&mut self, bank: BankId, base_type: BaseType, oid: Oid) -> Result<bool, SpaceBankError> {
        let bank = self.banks.get_mut(bank)?;
        if index_in_frame(oid) >= base_type.objects_per_frame() {
            return Ok(false);
        }
        if let Some(cache) = bank.type_frame(base_type) {
            if cache.holds(frame_oid(oid)) {
                return Ok(cache.free_map & (1 << index_in_frame(oid)) == 0);
            }
        }
        Ok(bank.alloc_tree.check_for_oid(&self.arena, oid))
    }

    // Rescinds and frees the object named by |cap|.
    pub fn dealloc_object(&mut self, bank: BankId, cap: Cap) -> Result<(), SpaceBankError> {
        let (obj_type, oid) = self.provider.identify(cap).ok_or(SpaceBankError::InvalidCap)?;
        if !self.contains_oid(bank, obj_type.base_type(), oid)? {
            return Err(SpaceBankError::NotInBank);
        }
        self.rescind_and_dealloc(bank, obj_type, oid, cap)
    }

    fn rescind_and_dealloc(
        &mut self,
        bank: BankId,
        obj_type: ObjType,
        oid: Oid,
        cap: Cap,
    ) -> Result<(), SpaceBankError> {
        self.provider.rescind_cap(cap)?;
        if let Err(e) = self.dealloc_oid(bank, obj_type, oid) {
            panic!("dealloc of owned object {:#x} in {}: {:?}", oid, bank, e);
        }
        Ok(())
    }

    fn saved_type_frame(&self, bank: BankId, base_type: BaseType) -> Option<TypeFrameCache> {
        self.banks.bank(bank).type_frame(base_type).copied()
    }

    // Returns |oids|, taken since the bank's type frame looked like
    // |saved|, to the bank. Objects from the saved frame go back to the
    // cache; frames started since then are released whole.
    fn restore_objects(
        &mut self,
        bank: BankId,
        base_type: BaseType,
        oids: &[Oid],
        saved: Option<TypeFrameCache>,
    ) {
        let saved = match saved {
            Some(saved) => saved,
            None => {
                for &oid in oids {
                    if let Err(e) = self.release_oid(bank, base_type, oid) {
                        panic!("undo alloc of {:#x} in {}: {:?}", oid, bank, e);
                    }
                }
                return;
            }
        };
        let mut fresh: SmallVec<[Oid; MAX_OBJECTS_PER_REQUEST]> = SmallVec::new();
        for &oid in oids {
            let frame = frame_oid(oid);
            if !saved.holds(frame) && !fresh.contains(&frame) {
                fresh.push(frame);
            }
        }
        if let Some(cache) = self.banks.bank_mut(bank).type_frame_mut(base_type) {
            *cache = saved;
        }
        for frame in fresh {
            self.release_whole_frame(bank, base_type, frame);
        }
    }

    // Reverses successful alloc_object calls made since the bank's type
    // frame looked like |saved|.
    fn undo_alloc(
        &mut self,
        bank: BankId,
        obj_type: ObjType,
        objs: &[(Oid, Cap)],
        saved: Option<TypeFrameCache>,
    ) {
        let mut oids: SmallVec<[Oid; MAX_OBJECTS_PER_REQUEST]> = SmallVec::new();
        for &(oid, cap) in objs.iter().rev() {
            if let Err(e) = self.provider.rescind_cap(cap) {
                warn!("rescind {:?} {:#x} failed: {:?}", obj_type, oid, e);
            }
            self.banks.bank_mut(bank).allocs[obj_type.index()] -= 1;
            oids.push(oid);
        }
        self.restore_objects(bank, obj_type.base_type(), &oids, saved);
    }

    // Allocates |count| objects; on failure nothing stays allocated.
    pub fn alloc_objects(
        &mut self,
        bank: BankId,
        obj_type: ObjType,
        count: usize,
    ) -> Result<Vec<Cap>, SpaceBankError> {
        if count == 0 || count > MAX_OBJECTS_PER_REQUEST {
            return Err(SpaceBankError::RequestError);
        }
        self.banks.get(bank)?;
        let saved = self.saved_type_frame(bank, obj_type.base_type());
        let mut objs: SmallVec<[(Oid, Cap); MAX_OBJECTS_PER_REQUEST]> = SmallVec::new();
        for _ in 0..count {
            match self.alloc_object(bank, obj_type) {
                Ok(obj) => objs.push(obj),
                Err(e) => {
                    debug!("alloc {} x {:?} from {} failed: {:?}", count, obj_type, bank, e);
                    self.undo_alloc(bank, obj_type, &objs, saved);
                    return Err(e);
                }
            }
        }
        Ok(objs.iter().map(|(_, cap)| *cap).collect())
    }

    // Checks each of |caps| names a distinct |obj_type| object owned by
    // |bank|; returns the object ids.
    fn check_objects(
        &mut self,
        bank: BankId,
        obj_type: ObjType,
        caps: &[Cap],
    ) -> Result<SmallVec<[Oid; MAX_OBJECTS_PER_REQUEST]>, SpaceBankError> {
        if caps.is_empty() || caps.len() > MAX_OBJECTS_PER_REQUEST {
            return Err(SpaceBankError::RequestError);
        }
        let mut oids: SmallVec<[Oid; MAX_OBJECTS_PER_REQUEST]> = SmallVec::new();
        for cap in caps {
            let (cap_type, oid) = self.provider.identify(*cap).ok_or(SpaceBankError::InvalidCap)?;
            if cap_type != obj_type {
                return Err(SpaceBankError::WrongType);
            }
            if !self.contains_oid(bank, obj_type.base_type(), oid)? {
                return Err(SpaceBankError::NotInBank);
            }
            if oids.contains(&oid) {
                return Err(SpaceBankError::RequestError);
            }
            oids.push(oid);
        }
        Ok(oids)
    }

    // Frees the objects named by |caps|. Every object is checked before
    // any is freed.
    pub fn free_objects(
        &mut self,
        bank: BankId,
        obj_type: ObjType,
        caps: &[Cap],
    ) -> Result<(), SpaceBankError> {
        trace!("free_objects {} {:?} {:?}", bank, obj_type, caps);
        let oids = self.check_objects(bank, obj_type, caps)?;
        for (cap, oid) in caps.iter().zip(oids) {
            self.rescind_and_dealloc(bank, obj_type, oid, *cap)?;
        }
        Ok(())
    }

    pub fn identify_objects(
        &mut self,
        bank: BankId,
        obj_type: ObjType,
        caps: &[Cap],
    ) -> Result<(), SpaceBankError> {
        trace!("identify_objects {} {:?} {:?}", bank, obj_type, caps);
        self.check_objects(bank, obj_type, caps).map(|_| ())
    }

    // Frees the |obj_type| objects held in the slots of |node|. Returns
    // a bitmap of slots whose contents could not be freed.
    pub fn reclaim_from_node(
        &mut self,
        bank: BankId,
        obj_type: ObjType,
        node: Cap,
    ) -> Result<u32, SpaceBankError> {
        trace!("reclaim_from_node {} {:?} {:?}", bank, obj_type, node);
        match self.provider.identify(node) {
            Some((node_type, _)) if node_type == ObjType::Node => {}
            Some(_) => return Err(SpaceBankError::WrongType),
            None => return Err(SpaceBankError::InvalidCap),
        }
        let slots = self.provider.node_slots(node)?;
        let mut failed = 0u32;
        for (index, slot) in slots.iter().enumerate().take(u32::BITS as usize) {
            let freed = match slot {
                Some(cap) => self.free_objects(bank, obj_type, &[*cap]).is_ok(),
                None => false,
            };
            if !freed {
                failed |= 1 << index;
            }
        }
        Ok(failed)
    }

    fn init_key_node(
        &mut self,
        forwarder: Cap,
        bank: BankId,
        precludes: Precludes,
    ) -> Result<(), SpaceBankError> {
        let target = self.fabric.make_restricted_cap(precludes)?;
        self.fabric.swap_forwarder_target(forwarder, target, bank)
    }

    // Returns a key to |bank| carrying |precludes|. The forwarder behind
    // each variant is allocated from the bank on first use.
    pub fn create_key(&mut self, bank: BankId, precludes: Precludes) -> Result<Cap, SpaceBankError> {
        trace!("create_key {} {:?}", bank, precludes);
        let index = precludes.index();
        let existing = self.banks.get(bank)?.limited_keys[index];
        let forwarder = match existing {
            Some(oid) => self.provider.retype_and_get_cap(ObjType::Forwarder, oid)?,
            None => {
                let saved = self.saved_type_frame(bank, BaseType::Node);
                let (oid, cap) = self.alloc_object(bank, ObjType::Forwarder)?;
                if let Err(e) = self.init_key_node(cap, bank, precludes) {
                    error!("init key for {} failed: {:?}", bank, e);
                    self.undo_alloc(bank, ObjType::Forwarder, &[(oid, cap)], saved);
                    return Err(e);
                }
                self.banks.bank_mut(bank).limited_keys[index] = Some(oid);
                cap
            }
        };
        self.fabric.opaque_forwarder(forwarder)
    }

    // Creates an unlimited child of |parent|; returns it with an
    // unrestricted key.
    pub fn create_child_bank(&mut self, parent: BankId) -> Result<(BankId, Cap), SpaceBankError> {
        trace!("create_child_bank {}", parent);
        let child = self.banks.create(Some(parent), u64::MAX)?;
        match self.create_key(child, Precludes::empty()) {
            Ok(cap) => Ok((child, cap)),
            Err(e) => {
                self.destroy_bank(child, true)?;
                Err(e)
            }
        }
    }

    // Moves the free objects of |bank|'s cached frame out of its tree.
    fn flush_type_frame(&mut self, bank: BankId, base_type: BaseType) {
        let (frame, free_map) = match self.banks.bank_mut(bank).type_frame_mut(base_type) {
            Some(cache) if !cache.is_empty() => {
                let flushed = (cache.frame_oid, cache.free_map);
                cache.reset();
                flushed
            }
            _ => return,
        };
        for index in 0..base_type.objects_per_frame() {
            if free_map & (1 << index) == 0 {
                continue;
            }
            if let Err(e) = self.tree_remove_oid(bank, base_type, frame + index as u64) {
                panic!("cached frame {:#x} not tracked by {}: {:?}", frame, bank, e);
            }
        }
    }

    // Rescinds the forwarders behind |bank|'s keys and frees them.
    fn retire_limited_keys(&mut self, bank: BankId) {
        let keys = mem::replace(&mut self.banks.bank_mut(bank).limited_keys, [None; NUM_PRECLUDES]);
        for oid in keys.iter().flatten() {
            self.rescind_object(ObjType::Forwarder, *oid);
            if let Err(e) = self.tree_remove_oid(bank, BaseType::Node, *oid) {
                warn!("key forwarder {:#x} not tracked by {}: {:?}", oid, bank, e);
            }
        }
    }

    // Destroys the object |oid| along with every capability to it.
    fn rescind_object(&mut self, obj_type: ObjType, oid: Oid) {
        match self.provider.retype_and_get_cap(obj_type, oid) {
            Ok(cap) => {
                if let Err(e) = self.provider.rescind_cap(cap) {
                    warn!("rescind {:?} {:#x} failed: {:?}", obj_type, oid, e);
                }
            }
            Err(e) => warn!("no cap for {:?} {:#x}: {:?}", obj_type, oid, e),
        }
    }

    // Rescinds every object charged to |bank| and returns the frames.
    #[cfg(not(feature = "CONFIG_DESTROY_BY_OBJECT"))]
    fn reclaim_storage(&mut self, bank: BankId) {
        loop {
            let slot = match self
                .banks
                .bank_mut(bank)
                .alloc_tree
                .incremental_destroy(&mut self.arena)
            {
                Some(slot) => slot,
                None => break,
            };
            let obj_type = slot.base_type.obj_type();
            for index in 0..slot.base_type.objects_per_frame() {
                if slot.map & (1 << index) != 0 {
                    self.rescind_object(obj_type, slot.frame_oid + index as u64);
                }
            }
            self.banks.unreserve_frames(bank, 1);
            self.space.release_frame(bank, slot.frame_oid, slot.base_type);
        }
    }

    #[cfg(feature = "CONFIG_DESTROY_BY_OBJECT")]
    fn reclaim_storage(&mut self, bank: BankId) {
        loop {
            let (oid, base_type) = match self.banks.bank(bank).alloc_tree.find_oid(&self.arena) {
                Some(found) => found,
                None => break,
            };
            self.rescind_object(base_type.obj_type(), oid);
            if let Err(e) = self.tree_remove_oid(bank, base_type, oid) {
                panic!("reclaim of {:#x} from {}: {:?}", oid, bank, e);
            }
        }
    }

    // Hands everything charged to |bank| to |dest|. The frames are
    // already counted against |dest| as an ancestor.
    fn merge_storage(&mut self, bank: BankId, dest: BankId) {
        let mut tree = mem::take(&mut self.banks.bank_mut(bank).alloc_tree);
        self.banks
            .bank_mut(dest)
            .alloc_tree
            .merge_from(&mut self.arena, &mut tree);
    }

    // Destroys |bank| and all its descendants. Their storage is either
    // rescinded and returned to object space or, if |reclaim_storage| is
    // false, handed to |bank|'s parent.
    pub fn destroy_bank(&mut self, bank: BankId, reclaim_storage: bool) -> Result<(), SpaceBankError> {
        trace!("destroy_bank {} reclaim_storage {}", bank, reclaim_storage);
        let top_parent = match self.banks.get(bank)?.parent {
            Some(parent) => parent,
            None => panic!("destroy of root bank"),
        };
        assert!(bank != BankId::PRIME, "destroy of prime bank");

        // Depth-first, children before parents, without recursion.
        let mut cur = bank;
        loop {
            while let Some(child) = self.banks.bank(cur).first_child {
                cur = child;
            }
            let (parent, next) = {
                let b = self.banks.bank(cur);
                (b.parent, b.next_sibling)
            };
            for base_type in BaseType::ALL {
                self.flush_type_frame(cur, base_type);
            }
            self.retire_limited_keys(cur);
            if reclaim_storage {
                self.reclaim_storage(cur);
            } else {
                self.merge_storage(cur, top_parent);
            }
            debug_assert!(self.banks.bank(cur).alloc_tree.is_empty());
            self.banks.unlink(cur);
            self.banks.release(cur);
            if cur == bank {
                break;
            }
            cur = match next.or(parent) {
                Some(id) => id,
                None => panic!("destroy walked off the top from {}", cur),
            };
        }
        Ok(())
    }

    pub fn set_bank_limit(&mut self, bank: BankId, limit: u64) -> Result<(), SpaceBankError> {
        trace!("set_bank_limit {} {}", bank, limit);
        self.banks.set_limit(bank, limit)
    }

    pub fn bank_limits(&self, bank: BankId) -> Result<BankLimits, SpaceBankError> {
        self.banks.limits(bank)
    }

    // Returns true if |cap| is a key to a live bank.
    pub fn verify_bank(&self, cap: Cap) -> bool {
        self.fabric
            .bank_of(cap)
            .map_or(false, |(bank, _)| self.banks.get(bank).is_ok())
    }
}

impl SpaceBankInterface for SpaceBank {
    fn alloc(
        &mut self,
        key: &BankKey,
        obj_type: ObjType,
        count: usize,
    ) -> Result<Vec<Cap>, SpaceBankError> {
        self.alloc_objects(key.bank, obj_type, count)
    }
    fn free(&mut self, key: &BankKey, obj_type: ObjType, caps: &[Cap]) -> Result<(), SpaceBankError> {
        self.free_objects(key.bank, obj_type, caps)
    }
    fn identify(
        &mut self,
        key: &BankKey,
        obj_type: ObjType,
        caps: &[Cap],
    ) -> Result<(), SpaceBankError> {
        self.identify_objects(key.bank, obj_type, caps)
    }
    fn reclaim_from_node(
        &mut self,
        key: &BankKey,
        obj_type: ObjType,
        node: Cap,
    ) -> Result<u32, SpaceBankError> {
        SpaceBank::reclaim_from_node(self, key.bank, obj_type, node)
    }
    fn reduce(&mut self, key: &BankKey, precludes: Precludes) -> Result<Cap, SpaceBankError> {
        self.create_key(key.bank, key.precludes | precludes)
    }
    fn destroy(&mut self, key: &BankKey, reclaim_storage: bool) -> Result<(), SpaceBankError> {
        if !key.precludes.can_destroy() {
            return Err(SpaceBankError::UnknownRequest);
        }
        // NB: the fixed banks are never destroyed.
        if [BankId::ROOT, BankId::PRIME, BankId::VERIFY].contains(&key.bank) {
            return Err(SpaceBankError::RequestError);
        }
        self.destroy_bank(key.bank, reclaim_storage)
    }
    fn set_limits(&mut self, key: &BankKey, frame_limit: u64) -> Result<(), SpaceBankError> {
        if !key.precludes.can_modify_limits() {
            return Err(SpaceBankError::UnknownRequest);
        }
        self.set_bank_limit(key.bank, frame_limit)
    }
    fn get_limits(&self, key: &BankKey) -> Result<BankLimits, SpaceBankError> {
        self.bank_limits(key.bank)
    }
    fn create_child(&mut self, key: &BankKey) -> Result<Cap, SpaceBankError> {
        self.create_child_bank(key.bank).map(|(_, cap)| cap)
    }
    fn verify(&self, key: &BankKey, cap: Cap) -> Result<bool, SpaceBankError> {
        self.banks.get(key.bank)?;
        Ok(self.verify_bank(cap))
    }
    fn stats(&self) -> Result<SpaceBankStats, SpaceBankError> {
        Ok(SpaceBankStats {
            ranges: self.space.range_count(),
            total_frames: self.space.total_frames(),
            free_frames: self.space.free_frames(),
            cached_frames: self.space.cached_frames(),
            banks: self.banks.live_banks(),
            tree_nodes: self.arena.live_nodes(),
            limit_reached: self.limit_reached,
            out_of_space: self.out_of_space,
        })
    }
    fn debug(&self) -> Result<(), SpaceBankError> {
        for (id, bank) in self.banks.iter() {
            info!(
                "{} parent {:?} limit {} allocated {} frames {} keys {:?}",
                id,
                bank.parent,
                bank.limit,
                bank.alloc_count,
                bank.alloc_tree.frame_count(&self.arena),
                bank.limited_keys,
            );
        }
        self.space.debug();
        Ok(())
    }
}
