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

//! Cantrip OS SpaceBank support

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

// Object identifier. OIDs are dense; OBJECTS_PER_FRAME consecutive
// OIDs name the objects that share one storage frame.
pub type Oid = u64;

pub const OBJECTS_PER_FRAME: u64 = 256;
// Number of node-sized objects packed in one frame.
pub const NODES_PER_FRAME: u32 = 8;
pub const PAGE_SIZE: u64 = 4096;

// Per-frame allocation state is kept in a u32 bitmap.
const_assert!(NODES_PER_FRAME < u32::BITS);
const_assert!(NODES_PER_FRAME as u64 <= OBJECTS_PER_FRAME);
const_assert!(OBJECTS_PER_FRAME.is_power_of_two());

// Frame number holding |oid|.
pub fn frame_of(oid: Oid) -> u64 { oid / OBJECTS_PER_FRAME }
// OID of the first object in the frame holding |oid|.
pub fn frame_oid(oid: Oid) -> Oid { oid & !(OBJECTS_PER_FRAME - 1) }
// Object index of |oid| within its frame.
pub fn index_in_frame(oid: Oid) -> u32 { (oid % OBJECTS_PER_FRAME) as u32 }
pub fn frame_to_oid(frame: u64) -> Oid { frame * OBJECTS_PER_FRAME }

// Storage is handed out in frames of one of these base types. A frame
// holds either a single page or NODES_PER_FRAME nodes.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum BaseType {
    Page = 0,
    Node,
}
pub const NUM_BASE_TYPES: usize = 2;
impl BaseType {
    pub const ALL: [BaseType; NUM_BASE_TYPES] = [BaseType::Page, BaseType::Node];

    pub fn index(self) -> usize { self as usize }

    pub fn objects_per_frame(self) -> u32 {
        match self {
            BaseType::Page => 1,
            BaseType::Node => NODES_PER_FRAME,
        }
    }

    // Bitmap with one bit set for each object in a frame.
    pub fn frame_mask(self) -> u32 { (1u32 << self.objects_per_frame()) - 1 }

    // True if several objects share a frame (and so go through a
    // bank's type frame cache).
    pub fn is_multi_object(self) -> bool { self.objects_per_frame() > 1 }

    // The object type used to name a whole frame of this base type.
    pub fn obj_type(self) -> ObjType {
        match self {
            BaseType::Page => ObjType::Page,
            BaseType::Node => ObjType::Node,
        }
    }
}

// Object types a client may allocate. Node-based types share node
// frames and are tracked as Node storage.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ObjType {
    Page = 0,
    Node,
    Forwarder,
    Gpt,
    Process,
}
impl ObjType {
    pub const COUNT: usize = 5;
    pub const ALL: [ObjType; ObjType::COUNT] = [
        ObjType::Page,
        ObjType::Node,
        ObjType::Forwarder,
        ObjType::Gpt,
        ObjType::Process,
    ];

    pub fn index(self) -> usize { self as usize }

    pub fn base_type(self) -> BaseType {
        match self {
            ObjType::Page => BaseType::Page,
            ObjType::Node | ObjType::Forwarder | ObjType::Gpt | ObjType::Process => BaseType::Node,
        }
    }
}

bitflags! {
    // Restrictions carried by a bank key. Every combination has its own
    // lazily fabricated forwarder so there are NUM_PRECLUDES variants.
    #[derive(Default, Serialize, Deserialize)]
    pub struct Precludes: u32 {
        const DESTROY = 0x1;
        const LIMIT_MODS = 0x2;
    }
}
pub const NUM_PRECLUDES: usize = 4;
const_assert!(Precludes::all().bits() as usize == NUM_PRECLUDES - 1);
impl Precludes {
    // Index of this combination in a bank's limited key table.
    pub fn index(&self) -> usize { self.bits() as usize }
    pub fn can_destroy(&self) -> bool { !self.contains(Precludes::DESTROY) }
    pub fn can_modify_limits(&self) -> bool { !self.contains(Precludes::LIMIT_MODS) }
}

// Opaque capability handle. The SpaceBank never looks inside; it only
// passes handles to and from its collaborators.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Cap(pub usize);

// Bank identity. Bank records are recycled; the generation distinguishes
// a live bank from a destroyed one that used the same record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BankId {
    index: u32,
    generation: u32,
}
impl BankId {
    // Allocate-only bank that owns all storage; it has no parent.
    pub const ROOT: BankId = BankId::new(0, 0);
    // Parent of all client banks; owns the initial system image.
    pub const PRIME: BankId = BankId::new(1, 0);
    // Zero-limit bank whose key is used to validate other bank keys.
    pub const VERIFY: BankId = BankId::new(2, 0);

    pub const fn new(index: u32, generation: u32) -> Self { BankId { index, generation } }
    pub fn index(&self) -> usize { self.index as usize }
    pub fn generation(&self) -> u32 { self.generation }
}
impl fmt::Display for BankId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bank{}.{}", self.index, self.generation)
    }
}

// What an invocation of a bank key names: the bank and the
// restrictions carried by the key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BankKey {
    pub bank: BankId,
    pub precludes: Precludes,
}
impl BankKey {
    pub fn new(bank: BankId, precludes: Precludes) -> Self { BankKey { bank, precludes } }
}

#[derive(Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BankLimits {
    // Frame limit set on this bank.
    pub frame_limit: u64,

    // Frames currently charged to this bank (including descendants).
    pub alloc_count: u64,

    // Smallest limit on the path from this bank to the root.
    pub effective_frame_limit: u64,

    // Frames that may still be allocated, considering every ancestor.
    pub effective_alloc_limit: u64,

    // Objects allocated and reclaimed over all time, by ObjType.
    pub allocs: [u64; ObjType::COUNT],
    pub reclaims: [u64; ObjType::COUNT],
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SpaceBankStats {
    // Storage ranges installed.
    pub ranges: usize,

    // Frames usable for allocation over all ranges.
    pub total_frames: u64,

    // Frames marked free in the range bitmaps.
    pub free_frames: u64,

    // Free frames parked in the allocation caches.
    pub cached_frames: u64,

    // Live banks, including the fixed ones.
    pub banks: usize,

    // AllocTree nodes in use across all banks.
    pub tree_nodes: usize,

    // Allocation requests that failed for lack of quota.
    pub limit_reached: usize,

    // Allocation requests that failed for lack of storage.
    pub out_of_space: usize,
}

// A contiguous extent of object space.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RangeDesc {
    pub start_oid: Oid,
    pub end_oid: Oid, // Exclusive
}
impl RangeDesc {
    pub fn new(start_oid: Oid, end_oid: Oid) -> Self { RangeDesc { start_oid, end_oid } }
    pub fn n_frames(&self) -> u64 { frame_of(self.end_oid - self.start_oid) }
    pub fn contains(&self, oid: Oid) -> bool { self.start_oid <= oid && oid < self.end_oid }
}

// A forwarder built into the system image that must be wired up as a
// restricted key to one of the fixed banks.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct PremadeKey {
    pub bank: BankId,
    pub precludes: Precludes,
    pub forwarder: Cap,
}

// Boot description of object space. The initial image occupies the
// start of |ranges[image_range]|: |nodes| nodes packed into node frames
// followed by |pages| pages.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VolumeSize {
    pub ranges: Vec<RangeDesc>,
    pub image_range: usize,
    pub nodes: u64,
    pub pages: u64,
    pub premade_keys: Vec<PremadeKey>,
}
impl VolumeSize {
    pub fn node_frames(&self) -> u64 {
        let per = NODES_PER_FRAME as u64;
        (self.nodes + per - 1) / per
    }
    // Frames at the start of the image range that are already in use.
    pub fn image_frames(&self) -> u64 { self.node_frames() + self.pages }
}

#[repr(usize)]
#[derive(Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum SpaceBankError {
    Success = 0,
    LimitReached,   // Quota exhausted at some level of the bank hierarchy
    OutOfSpace,     // No free frame anywhere in object space
    TooManyRanges,  // Range table full
    RangeOverlap,   // Range intersects an installed range
    RangeTooSmall,  // Range cannot hold its reserved frames + bitmap
    TooManyBanks,   // Bank table full
    InvalidBank,    // Bank was destroyed (or never existed)
    NotInBank,      // Object not allocated from this bank
    InvalidCap,     // Capability does not name a bank-managed object
    WrongType,      // Object is not of the requested type
    RequestError,   // Malformed request (e.g. bad object count)
    UnknownRequest, // Operation not permitted through this key
    RetypeFailed,
    RescindFailed,
    #[default]
    UnknownError,
}
impl From<SpaceBankError> for Result<(), SpaceBankError> {
    fn from(err: SpaceBankError) -> Result<(), SpaceBankError> {
        if err == SpaceBankError::Success {
            Ok(())
        } else {
            Err(err)
        }
    }
}

// Kernel services used to turn frames into objects. Implementations
// live with the component glue; tests use fakes.
pub trait FrameProvider {
    // Returns a capability of type |obj_type| for |oid|, retyping the
    // containing frame as needed.
    fn retype_and_get_cap(&mut self, obj_type: ObjType, oid: Oid) -> Result<Cap, SpaceBankError>;
    // Invalidates |cap| and every capability derived from the object.
    fn rescind_cap(&mut self, cap: Cap) -> Result<(), SpaceBankError>;
    // Returns the type and OID of the object named by |cap|.
    fn identify(&self, cap: Cap) -> Option<(ObjType, Oid)>;
    // Zeroes a frame that has never been handed out.
    fn zero_frame(&mut self, frame_oid: Oid) -> Result<(), SpaceBankError>;
    // Returns the capabilities held in the slots of the node |node|.
    fn node_slots(&self, node: Cap) -> Result<Vec<Option<Cap>>, SpaceBankError>;
}

// Kernel services used to build the keys handed to clients.
pub trait CapabilityFabric {
    // Returns a start key to the SpaceBank carrying |precludes|.
    fn make_restricted_cap(&mut self, precludes: Precludes) -> Result<Cap, SpaceBankError>;
    // Points |forwarder| at |target|, recording |bank| in the forwarder.
    fn swap_forwarder_target(
        &mut self,
        forwarder: Cap,
        target: Cap,
        bank: BankId,
    ) -> Result<(), SpaceBankError>;
    // Returns the opaque (client-visible) key for |forwarder|.
    fn opaque_forwarder(&mut self, forwarder: Cap) -> Result<Cap, SpaceBankError>;
    // Returns the bank and restrictions recorded for a bank key.
    fn bank_of(&self, cap: Cap) -> Option<(BankId, Precludes)>;
}

// Operations reachable through a bank key.
pub trait SpaceBankInterface {
    // Allocates 1..=3 objects; either all succeed or none do.
    fn alloc(&mut self, key: &BankKey, obj_type: ObjType, count: usize)
        -> Result<Vec<Cap>, SpaceBankError>;
    // Frees 1..=3 objects; either all are freed or none are.
    fn free(&mut self, key: &BankKey, obj_type: ObjType, caps: &[Cap])
        -> Result<(), SpaceBankError>;
    // Checks 1..=3 objects are of |obj_type| and belong to the bank.
    fn identify(&mut self, key: &BankKey, obj_type: ObjType, caps: &[Cap])
        -> Result<(), SpaceBankError>;
    // Frees the objects held in the slots of |node|; returns a bitmap
    // of the slots that could not be reclaimed.
    fn reclaim_from_node(&mut self, key: &BankKey, obj_type: ObjType, node: Cap)
        -> Result<u32, SpaceBankError>;
    // Returns a key to the same bank with |precludes| added.
    fn reduce(&mut self, key: &BankKey, precludes: Precludes) -> Result<Cap, SpaceBankError>;
    fn destroy(&mut self, key: &BankKey, reclaim_storage: bool) -> Result<(), SpaceBankError>;
    fn set_limits(&mut self, key: &BankKey, frame_limit: u64) -> Result<(), SpaceBankError>;
    fn get_limits(&self, key: &BankKey) -> Result<BankLimits, SpaceBankError>;
    fn create_child(&mut self, key: &BankKey) -> Result<Cap, SpaceBankError>;
    // Returns true if |cap| is a key to a live bank.
    fn verify(&self, key: &BankKey, cap: Cap) -> Result<bool, SpaceBankError>;
    fn stats(&self) -> Result<SpaceBankStats, SpaceBankError>;
    fn debug(&self) -> Result<(), SpaceBankError>;
}
