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

//! Cantrip OS SpaceBank storage allocator support

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::boxed::Box;
use alloc::vec::Vec;
use cantrip_spacebank_interface::BankKey;
use cantrip_spacebank_interface::BankLimits;
use cantrip_spacebank_interface::Cap;
use cantrip_spacebank_interface::CapabilityFabric;
use cantrip_spacebank_interface::FrameProvider;
use cantrip_spacebank_interface::ObjType;
use cantrip_spacebank_interface::Precludes;
use cantrip_spacebank_interface::SpaceBankError;
use cantrip_spacebank_interface::SpaceBankInterface;
use cantrip_spacebank_interface::SpaceBankStats;
use cantrip_spacebank_interface::VolumeSize;
use spin::Mutex;
use spin::MutexGuard;

mod alloc_tree;
mod bank;
mod object_space;
mod space_bank;
pub use space_bank::SpaceBank;
pub use space_bank::MAX_OBJECTS_PER_REQUEST;

#[cfg(test)]
mod fake;

// CantripSpaceBank bundles an instance of the SpaceBank and synchronizes
// public use with a Mutex. Setup is two steps so the instance can be a
// static: empty() is const, init() supplies the kernel services and
// installs object space.
pub struct CantripSpaceBank {
    manager: Mutex<Option<SpaceBank>>,
}
impl CantripSpaceBank {
    // Constructs a partially-initialized instance; to complete call init().
    pub const fn empty() -> CantripSpaceBank {
        CantripSpaceBank {
            manager: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Guard {
        Guard {
            manager: self.manager.lock(),
        }
    }
}
pub struct Guard<'a> {
    manager: MutexGuard<'a, Option<SpaceBank>>,
}
impl Guard<'_> {
    pub fn is_empty(&self) -> bool { self.manager.is_none() }

    // Finishes the setup started by empty():
    pub fn init(
        &mut self,
        provider: Box<dyn FrameProvider + Send>,
        fabric: Box<dyn CapabilityFabric + Send>,
        volsize: &VolumeSize,
    ) -> Result<(), SpaceBankError> {
        assert!(self.manager.is_none());
        let mut space_bank = SpaceBank::new(provider, fabric);
        space_bank.boot(volsize)?;
        *self.manager = Some(space_bank);
        Ok(())
    }

    fn bank(&self) -> Result<&SpaceBank, SpaceBankError> {
        self.manager.as_ref().ok_or(SpaceBankError::UnknownError)
    }
    fn bank_mut(&mut self) -> Result<&mut SpaceBank, SpaceBankError> {
        self.manager.as_mut().ok_or(SpaceBankError::UnknownError)
    }
}
impl SpaceBankInterface for Guard<'_> {
    fn alloc(
        &mut self,
        key: &BankKey,
        obj_type: ObjType,
        count: usize,
    ) -> Result<Vec<Cap>, SpaceBankError> {
        self.bank_mut()?.alloc(key, obj_type, count)
    }
    fn free(&mut self, key: &BankKey, obj_type: ObjType, caps: &[Cap]) -> Result<(), SpaceBankError> {
        self.bank_mut()?.free(key, obj_type, caps)
    }
    fn identify(
        &mut self,
        key: &BankKey,
        obj_type: ObjType,
        caps: &[Cap],
    ) -> Result<(), SpaceBankError> {
        SpaceBankInterface::identify(self.bank_mut()?, key, obj_type, caps)
    }
    fn reclaim_from_node(
        &mut self,
        key: &BankKey,
        obj_type: ObjType,
        node: Cap,
    ) -> Result<u32, SpaceBankError> {
        SpaceBankInterface::reclaim_from_node(self.bank_mut()?, key, obj_type, node)
    }
    fn reduce(&mut self, key: &BankKey, precludes: Precludes) -> Result<Cap, SpaceBankError> {
        self.bank_mut()?.reduce(key, precludes)
    }
    fn destroy(&mut self, key: &BankKey, reclaim_storage: bool) -> Result<(), SpaceBankError> {
        self.bank_mut()?.destroy(key, reclaim_storage)
    }
    fn set_limits(&mut self, key: &BankKey, frame_limit: u64) -> Result<(), SpaceBankError> {
        self.bank_mut()?.set_limits(key, frame_limit)
    }
    fn get_limits(&self, key: &BankKey) -> Result<BankLimits, SpaceBankError> {
        self.bank()?.get_limits(key)
    }
    fn create_child(&mut self, key: &BankKey) -> Result<Cap, SpaceBankError> {
        self.bank_mut()?.create_child(key)
    }
    fn verify(&self, key: &BankKey, cap: Cap) -> Result<bool, SpaceBankError> {
        self.bank()?.verify(key, cap)
    }
    fn stats(&self) -> Result<SpaceBankStats, SpaceBankError> { self.bank()?.stats() }
    fn debug(&self) -> Result<(), SpaceBankError> { self.bank()?.debug() }
}
