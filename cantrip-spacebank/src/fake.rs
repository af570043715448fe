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

// Fake kernel services for tests. The provider and fabric share state
// so a test can hold a handle to inspect what the SpaceBank did.

use cantrip_spacebank_interface::BankId;
use cantrip_spacebank_interface::Cap;
use cantrip_spacebank_interface::CapabilityFabric;
use cantrip_spacebank_interface::FrameProvider;
use cantrip_spacebank_interface::ObjType;
use cantrip_spacebank_interface::Oid;
use cantrip_spacebank_interface::Precludes;
use cantrip_spacebank_interface::SpaceBankError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FakeState {
    next_cap: usize,
    caps: HashMap<Cap, (ObjType, Oid)>,
    live: HashSet<Oid>,
    rescinded: Vec<Oid>,
    zeroed: Vec<Oid>,
    node_slots: HashMap<Oid, Vec<Option<Cap>>>,
    fail_retype: Option<ObjType>,
    fail_fabric: bool,
    start_keys: HashMap<Cap, Precludes>,
    forwarders: HashMap<Oid, (BankId, Precludes)>,
    opaque: HashMap<Cap, Oid>,
}
impl FakeState {
    fn new_cap(&mut self) -> Cap {
        self.next_cap += 1;
        Cap(self.next_cap)
    }
}

#[derive(Clone, Default)]
pub struct FakeProvider(Arc<Mutex<FakeState>>);
impl FakeProvider {
    pub fn new() -> Self { Self::default() }

    // Fabric sharing this provider's state.
    pub fn fabric(&self) -> FakeFabric { FakeFabric(self.0.clone()) }

    pub fn zeroed(&self) -> Vec<Oid> { self.0.lock().unwrap().zeroed.clone() }
    pub fn rescinded(&self) -> Vec<Oid> { self.0.lock().unwrap().rescinded.clone() }
    pub fn is_live(&self, oid: Oid) -> bool { self.0.lock().unwrap().live.contains(&oid) }

    // Makes retypes to |obj_type| fail (or stop failing with None).
    pub fn fail_retype(&self, obj_type: Option<ObjType>) {
        self.0.lock().unwrap().fail_retype = obj_type;
    }

    // Makes every fabric operation fail.
    pub fn fail_fabric(&self, fail: bool) { self.0.lock().unwrap().fail_fabric = fail; }

    // Mints a capability without the SpaceBank's involvement (e.g. for
    // objects in the system image).
    pub fn mint(&self, obj_type: ObjType, oid: Oid) -> Cap {
        let mut state = self.0.lock().unwrap();
        let cap = state.new_cap();
        state.caps.insert(cap, (obj_type, oid));
        state.live.insert(oid);
        cap
    }

    pub fn set_node_slots(&self, node: Cap, slots: Vec<Option<Cap>>) {
        let mut state = self.0.lock().unwrap();
        let (_, oid) = state.caps[&node];
        state.node_slots.insert(oid, slots);
    }
}
impl FrameProvider for FakeProvider {
    fn retype_and_get_cap(&mut self, obj_type: ObjType, oid: Oid) -> Result<Cap, SpaceBankError> {
        let mut state = self.0.lock().unwrap();
        if state.fail_retype == Some(obj_type) {
            return Err(SpaceBankError::RetypeFailed);
        }
        let cap = state.new_cap();
        state.caps.insert(cap, (obj_type, oid));
        state.live.insert(oid);
        Ok(cap)
    }
    fn rescind_cap(&mut self, cap: Cap) -> Result<(), SpaceBankError> {
        let mut state = self.0.lock().unwrap();
        let (_, oid) = *state.caps.get(&cap).ok_or(SpaceBankError::RescindFailed)?;
        state.caps.retain(|_, (_, o)| *o != oid);
        state.opaque.retain(|_, o| *o != oid);
        state.live.remove(&oid);
        state.rescinded.push(oid);
        Ok(())
    }
    fn identify(&self, cap: Cap) -> Option<(ObjType, Oid)> {
        self.0.lock().unwrap().caps.get(&cap).copied()
    }
    fn zero_frame(&mut self, frame_oid: Oid) -> Result<(), SpaceBankError> {
        self.0.lock().unwrap().zeroed.push(frame_oid);
        Ok(())
    }
    fn node_slots(&self, node: Cap) -> Result<Vec<Option<Cap>>, SpaceBankError> {
        let state = self.0.lock().unwrap();
        let (_, oid) = state.caps.get(&node).ok_or(SpaceBankError::InvalidCap)?;
        Ok(state.node_slots.get(oid).cloned().unwrap_or_else(|| vec![None; 16]))
    }
}

#[derive(Clone)]
pub struct FakeFabric(Arc<Mutex<FakeState>>);
impl CapabilityFabric for FakeFabric {
    fn make_restricted_cap(&mut self, precludes: Precludes) -> Result<Cap, SpaceBankError> {
        let mut state = self.0.lock().unwrap();
        if state.fail_fabric {
            return Err(SpaceBankError::UnknownError);
        }
        let cap = state.new_cap();
        state.start_keys.insert(cap, precludes);
        Ok(cap)
    }
    fn swap_forwarder_target(
        &mut self,
        forwarder: Cap,
        target: Cap,
        bank: BankId,
    ) -> Result<(), SpaceBankError> {
        let mut state = self.0.lock().unwrap();
        let precludes = *state.start_keys.get(&target).ok_or(SpaceBankError::InvalidCap)?;
        match state.caps.get(&forwarder).copied() {
            Some((ObjType::Forwarder, oid)) => {
                state.forwarders.insert(oid, (bank, precludes));
                Ok(())
            }
            _ => Err(SpaceBankError::InvalidCap),
        }
    }
    fn opaque_forwarder(&mut self, forwarder: Cap) -> Result<Cap, SpaceBankError> {
        let mut state = self.0.lock().unwrap();
        if state.fail_fabric {
            return Err(SpaceBankError::UnknownError);
        }
        let (_, oid) = *state.caps.get(&forwarder).ok_or(SpaceBankError::InvalidCap)?;
        let cap = state.new_cap();
        state.opaque.insert(cap, oid);
        Ok(cap)
    }
    fn bank_of(&self, cap: Cap) -> Option<(BankId, Precludes)> {
        let state = self.0.lock().unwrap();
        let oid = state.opaque.get(&cap)?;
        if !state.live.contains(oid) {
            return None;
        }
        state.forwarders.get(oid).copied()
    }
}
