// Copyright 2019-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Host-backed device memory.
//!
//! Emulates a set of accelerator devices in system memory. Each device has a
//! fixed capacity. Allocations receive disjoint, aligned addresses, so that
//! pointer arithmetic on returned `DevicePtr`s behaves like on a real device.
//!
//! The provider is used on hosts without accelerators and in tests. Tests can
//! inject allocation failures per device and inspect the number of live
//! allocations to check for leaks.

use super::memory::{DeviceId, DeviceMemoryProvider, DevicePtr};
use crate::error::{ErrorKind, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

/// Alignment of simulated allocations in bytes.
const ALLOCATION_ALIGNMENT: u64 = 256;

/// First address handed out, keeps null distinguishable.
const BASE_ADDRESS: u64 = 0x1_0000;

#[derive(Debug)]
struct Allocation {
    device_id: DeviceId,
    data: Vec<u8>,
}

#[derive(Debug)]
struct State {
    allocations: BTreeMap<u64, Allocation>,
    bytes_in_use: Vec<usize>,
    next_address: u64,
    total_allocations: usize,
    failing_devices: HashSet<DeviceId>,
}

/// Device memory provider that emulates devices in system memory.
#[derive(Debug)]
pub struct HostBackedDeviceMemory {
    capacity_bytes: usize,
    state: Mutex<State>,
}

impl HostBackedDeviceMemory {
    /// Creates `device_count` devices with `capacity_bytes` of memory each.
    pub fn new(device_count: u32, capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            state: Mutex::new(State {
                allocations: BTreeMap::new(),
                bytes_in_use: vec![0; device_count as usize],
                next_address: BASE_ADDRESS,
                total_allocations: 0,
                failing_devices: HashSet::new(),
            }),
        }
    }

    /// Lets all further allocations on `device_id` fail with out-of-memory.
    pub fn inject_allocation_failure(&self, device_id: DeviceId) {
        self.state.lock().failing_devices.insert(device_id);
    }

    pub fn clear_allocation_failures(&self) {
        self.state.lock().failing_devices.clear();
    }

    /// Number of allocations that have not been freed.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Number of successful allocations since creation.
    pub fn total_allocations(&self) -> usize {
        self.state.lock().total_allocations
    }

    pub fn bytes_in_use(&self, device_id: DeviceId) -> usize {
        self.state
            .lock()
            .bytes_in_use
            .get(device_id as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }
}

impl State {
    fn check_device(&self, device_id: DeviceId) -> Result<()> {
        if (device_id as usize) < self.bytes_in_use.len() {
            Ok(())
        } else {
            Err(ErrorKind::InvalidDevice(device_id).into())
        }
    }

    /// Resolves an address to its allocation and the offset into it.
    ///
    /// Checks that `len` bytes starting at the address lie within the
    /// allocation, and that the allocation belongs to `device_id`.
    fn resolve_mut(
        &mut self,
        ptr: DevicePtr,
        len: usize,
        device_id: DeviceId,
    ) -> Result<(&mut Allocation, usize)> {
        let addr = ptr.as_raw();
        let (base, allocation) = self
            .allocations
            .range_mut(..=addr)
            .next_back()
            .ok_or_else(|| ErrorKind::InvalidHandle(addr))?;

        let offset = (addr - *base) as usize;
        if offset > allocation.data.len() {
            Err(ErrorKind::InvalidHandle(addr))?;
        }
        if allocation.device_id != device_id {
            Err(ErrorKind::InvalidArgument(format!(
                "Address {} belongs to device {}, not device {}",
                ptr, allocation.device_id, device_id
            )))?;
        }
        if offset + len > allocation.data.len() {
            Err(ErrorKind::OutOfBounds(format!(
                "Access of {} bytes at {} exceeds allocation of {} bytes",
                len,
                ptr,
                allocation.data.len()
            )))?;
        }

        Ok((allocation, offset))
    }
}

impl DeviceMemoryProvider for HostBackedDeviceMemory {
    fn device_count(&self) -> u32 {
        self.state.lock().bytes_in_use.len() as u32
    }

    fn allocate(&self, bytes: usize, device_id: DeviceId) -> Result<DevicePtr> {
        let mut state = self.state.lock();
        state.check_device(device_id)?;

        let in_use = state.bytes_in_use[device_id as usize];
        if state.failing_devices.contains(&device_id)
            || in_use.saturating_add(bytes) > self.capacity_bytes
        {
            Err(ErrorKind::OutOfMemory(device_id, bytes))?;
        }

        let address = state.next_address;
        let reserved = (bytes as u64).max(1);
        let reserved = (reserved + ALLOCATION_ALIGNMENT - 1) / ALLOCATION_ALIGNMENT
            * ALLOCATION_ALIGNMENT;
        state.next_address = address.checked_add(reserved).ok_or_else(|| {
            ErrorKind::IntegerOverflow("Simulated address space exhausted".to_string())
        })?;

        state.allocations.insert(
            address,
            Allocation {
                device_id,
                data: vec![0; bytes],
            },
        );
        state.bytes_in_use[device_id as usize] += bytes;
        state.total_allocations += 1;

        Ok(DevicePtr::from_raw(address))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.lock();
        let allocation = state
            .allocations
            .remove(&ptr.as_raw())
            .ok_or_else(|| ErrorKind::InvalidHandle(ptr.as_raw()))?;
        state.bytes_in_use[allocation.device_id as usize] -= allocation.data.len();

        Ok(())
    }

    fn copy_host_to_device(&self, dst: DevicePtr, src: &[u8], device_id: DeviceId) -> Result<()> {
        let mut state = self.state.lock();
        state.check_device(device_id)?;
        let (allocation, offset) = state.resolve_mut(dst, src.len(), device_id)?;
        allocation.data[offset..offset + src.len()].copy_from_slice(src);

        Ok(())
    }

    fn copy_device_to_host(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        device_id: DeviceId,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.check_device(device_id)?;
        let len = dst.len();
        let (allocation, offset) = state.resolve_mut(src, len, device_id)?;
        dst.copy_from_slice(&allocation.data[offset..offset + len]);

        Ok(())
    }

    fn copy_device_to_device(
        &self,
        dst: DevicePtr,
        dst_device_id: DeviceId,
        src: DevicePtr,
        src_device_id: DeviceId,
        bytes: usize,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.check_device(dst_device_id)?;
        state.check_device(src_device_id)?;

        let staging = {
            let (allocation, offset) = state.resolve_mut(src, bytes, src_device_id)?;
            allocation.data[offset..offset + bytes].to_vec()
        };
        let (allocation, offset) = state.resolve_mut(dst, bytes, dst_device_id)?;
        allocation.data[offset..offset + bytes].copy_from_slice(&staging);

        Ok(())
    }
}
