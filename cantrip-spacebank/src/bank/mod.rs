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

//! Bank records and the quota hierarchy.

extern crate alloc;
use crate::alloc_tree::AllocTree;
use alloc::vec::Vec;
use cantrip_spacebank_interface::BankId;
use cantrip_spacebank_interface::BankLimits;
use cantrip_spacebank_interface::BaseType;
use cantrip_spacebank_interface::ObjType;
use cantrip_spacebank_interface::Oid;
use cantrip_spacebank_interface::SpaceBankError;
use cantrip_spacebank_interface::NUM_PRECLUDES;
use log::{debug, trace};

// Upper bound on live banks.
pub const MAX_BANKS: usize = 4096;

// A partially used multi-object frame. Objects are handed out from
// here before a new frame is charged to the bank.
#[derive(Debug, Default, Clone, Copy)]
pub struct TypeFrameCache {
    pub frame_oid: Oid,
    pub free_map: u32, // 1 => object is free
}
impl TypeFrameCache {
    pub fn is_empty(&self) -> bool { self.free_map == 0 }
    pub fn holds(&self, frame_oid: Oid) -> bool { !self.is_empty() && self.frame_oid == frame_oid }
    pub fn reset(&mut self) {
        self.frame_oid = 0;
        self.free_map = 0;
    }
}

#[derive(Debug)]
pub struct Bank {
    pub parent: Option<BankId>,
    pub first_child: Option<BankId>,
    pub next_sibling: Option<BankId>,

    pub limit: u64,       // Max frames charged to this bank
    pub alloc_count: u64, // Frames charged to this bank & descendants

    pub alloc_tree: AllocTree,
    pub node_frame: TypeFrameCache,

    // Forwarders backing the restricted keys to this bank, indexed by
    // Precludes::index(). Allocated from this bank.
    pub limited_keys: [Option<Oid>; NUM_PRECLUDES],

    pub allocs: [u64; ObjType::COUNT],
    pub deallocs: [u64; ObjType::COUNT],
}
impl Bank {
    fn new(parent: Option<BankId>, limit: u64) -> Self {
        Bank {
            parent,
            first_child: None,
            next_sibling: None,
            limit,
            alloc_count: 0,
            alloc_tree: AllocTree::new(),
            node_frame: TypeFrameCache::default(),
            limited_keys: [None; NUM_PRECLUDES],
            allocs: [0; ObjType::COUNT],
            deallocs: [0; ObjType::COUNT],
        }
    }

    // Returns the type frame cache for multi-object base types.
    pub fn type_frame(&self, base_type: BaseType) -> Option<&TypeFrameCache> {
        match base_type {
            BaseType::Node => Some(&self.node_frame),
            BaseType::Page => None,
        }
    }
    pub fn type_frame_mut(&mut self, base_type: BaseType) -> Option<&mut TypeFrameCache> {
        match base_type {
            BaseType::Node => Some(&mut self.node_frame),
            BaseType::Page => None,
        }
    }
}

struct BankSlot {
    generation: u32,
    bank: Option<Bank>,
}

// All bank records. Records are recycled through a free list; a
// BankId is only honored while its generation matches the record's.
pub struct BankTable {
    slots: Vec<BankSlot>,
    free: Vec<u32>,
    live: usize,
}
impl BankTable {
    pub fn new() -> Self {
        BankTable {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn live_banks(&self) -> usize { self.live }

    // Live banks in table order.
    pub fn iter(&self) -> impl Iterator<Item = (BankId, &Bank)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.bank
                .as_ref()
                .map(|bank| (BankId::new(index as u32, slot.generation), bank))
        })
    }

    pub fn get(&self, id: BankId) -> Result<&Bank, SpaceBankError> {
        match self.slots.get(id.index()) {
            Some(slot) if slot.generation == id.generation() => {
                slot.bank.as_ref().ok_or(SpaceBankError::InvalidBank)
            }
            _ => Err(SpaceBankError::InvalidBank),
        }
    }
    pub fn get_mut(&mut self, id: BankId) -> Result<&mut Bank, SpaceBankError> {
        match self.slots.get_mut(id.index()) {
            Some(slot) if slot.generation == id.generation() => {
                slot.bank.as_mut().ok_or(SpaceBankError::InvalidBank)
            }
            _ => Err(SpaceBankError::InvalidBank),
        }
    }

    // Accessors for ids taken from bank links; a dangling link is a
    // bookkeeping error.
    pub fn bank(&self, id: BankId) -> &Bank {
        match self.get(id) {
            Ok(bank) => bank,
            Err(_) => panic!("dangling reference to {}", id),
        }
    }
    pub fn bank_mut(&mut self, id: BankId) -> &mut Bank {
        match self.get_mut(id) {
            Ok(bank) => bank,
            Err(_) => panic!("dangling reference to {}", id),
        }
    }

    // Creates a bank with |limit| and links it at the head of |parent|'s
    // children.
    pub fn create(&mut self, parent: Option<BankId>, limit: u64) -> Result<BankId, SpaceBankError> {
        if let Some(parent) = parent {
            self.get(parent)?;
        }
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.bank = Some(Bank::new(parent, limit));
                BankId::new(index, slot.generation)
            }
            None => {
                if self.slots.len() >= MAX_BANKS {
                    debug!("Bank create failed (table full)");
                    return Err(SpaceBankError::TooManyBanks);
                }
                self.slots.push(BankSlot {
                    generation: 0,
                    bank: Some(Bank::new(parent, limit)),
                });
                BankId::new((self.slots.len() - 1) as u32, 0)
            }
        };
        if let Some(parent) = parent {
            let parent_bank = self.bank_mut(parent);
            let sibling = parent_bank.first_child.replace(id);
            self.bank_mut(id).next_sibling = sibling;
        }
        self.live += 1;
        trace!("create {} parent {:?} limit {}", id, parent, limit);
        Ok(id)
    }

    // Removes |id| from its parent's list of children.
    pub fn unlink(&mut self, id: BankId) {
        let (parent, next) = {
            let bank = self.bank(id);
            (bank.parent, bank.next_sibling)
        };
        let parent = match parent {
            Some(parent) => parent,
            None => panic!("unlink of parentless {}", id),
        };
        if self.bank(parent).first_child == Some(id) {
            self.bank_mut(parent).first_child = next;
        } else {
            let mut cur = self.bank(parent).first_child;
            while let Some(sibling) = cur {
                let after = self.bank(sibling).next_sibling;
                if after == Some(id) {
                    self.bank_mut(sibling).next_sibling = next;
                    break;
                }
                cur = after;
            }
            assert!(cur.is_some(), "{} not a child of {}", id, parent);
        }
        self.bank_mut(id).next_sibling = None;
    }

    // Frees the record for |id|; the bank must already be unlinked.
    pub fn release(&mut self, id: BankId) {
        let slot = &mut self.slots[id.index()];
        assert!(slot.generation == id.generation() && slot.bank.is_some());
        slot.bank = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        self.live -= 1;
        trace!("release {}", id);
    }

    // Charges |count| frames to |id| and each of its ancestors. Either
    // every level accepts the charge or nothing changes.
    pub fn reserve_frames(&mut self, id: BankId, count: u64) -> Result<(), SpaceBankError> {
        let mut cur = Some(id);
        while let Some(bank_id) = cur {
            let bank = self.bank_mut(bank_id);
            let fits = bank
                .alloc_count
                .checked_add(count)
                .map_or(false, |total| total <= bank.limit);
            if !fits {
                debug!(
                    "reserve {} frames for {} hit limit {} at {}",
                    count, id, bank.limit, bank_id
                );
                // Undo the levels already charged.
                let mut undo = Some(id);
                while let Some(undo_id) = undo {
                    if undo_id == bank_id {
                        break;
                    }
                    let bank = self.bank_mut(undo_id);
                    bank.alloc_count -= count;
                    undo = bank.parent;
                }
                return Err(SpaceBankError::LimitReached);
            }
            bank.alloc_count += count;
            cur = bank.parent;
        }
        Ok(())
    }

    // Returns |count| frames charged to |id| and each of its ancestors.
    pub fn unreserve_frames(&mut self, id: BankId, count: u64) {
        let mut cur = Some(id);
        while let Some(bank_id) = cur {
            let bank = self.bank_mut(bank_id);
            assert!(
                bank.alloc_count >= count,
                "unreserve {} frames from {} with {} charged",
                count,
                bank_id,
                bank.alloc_count
            );
            bank.alloc_count -= count;
            cur = bank.parent;
        }
    }

    pub fn set_limit(&mut self, id: BankId, limit: u64) -> Result<(), SpaceBankError> {
        self.get_mut(id)?.limit = limit;
        Ok(())
    }

    pub fn limits(&self, id: BankId) -> Result<BankLimits, SpaceBankError> {
        let bank = self.get(id)?;
        let mut effective_frame_limit = u64::MAX;
        let mut effective_alloc_limit = u64::MAX;
        let mut cur = Some(id);
        while let Some(bank_id) = cur {
            let b = self.bank(bank_id);
            effective_frame_limit = effective_frame_limit.min(b.limit);
            effective_alloc_limit = effective_alloc_limit.min(b.limit.saturating_sub(b.alloc_count));
            cur = b.parent;
        }
        Ok(BankLimits {
            frame_limit: bank.limit,
            alloc_count: bank.alloc_count,
            effective_frame_limit,
            effective_alloc_limit,
            allocs: bank.allocs,
            reclaims: bank.deallocs,
        })
    }
}
impl Default for BankTable {
    fn default() -> Self { Self::new() }
}
