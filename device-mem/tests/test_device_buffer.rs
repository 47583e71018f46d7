// Copyright 2018-2022 Clemens Lutz
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

use device_mem::error::ErrorKind;
use device_mem::runtime::allocator::HostBackedDeviceMemory;
use device_mem::runtime::memory::{DeviceBuffer, DeviceMemoryProvider};
use rayon::prelude::*;
use std::error::Error;
use std::sync::Arc;

fn provider(devices: u32, capacity: usize) -> (Arc<HostBackedDeviceMemory>, Arc<dyn DeviceMemoryProvider>) {
    let mem = Arc::new(HostBackedDeviceMemory::new(devices, capacity));
    let dyn_mem: Arc<dyn DeviceMemoryProvider> = mem.clone();
    (mem, dyn_mem)
}

#[test]
fn buffer_round_trip() -> Result<(), Box<dyn Error>> {
    let (_, mem) = provider(1, 1 << 20);
    let data: Vec<i32> = (0..1000).collect();

    let buffer = DeviceBuffer::from_slice(&mem, &data, 0)?;

    assert_eq!(buffer.len(), 1000);
    assert_eq!(buffer.size_bytes(), 4000);
    assert_eq!(buffer.to_vec()?, data);

    Ok(())
}

#[test]
fn drop_releases_device_memory() -> Result<(), Box<dyn Error>> {
    let (sim, mem) = provider(2, 1 << 20);

    {
        let _a = DeviceBuffer::<i64>::uninitialized(&mem, 128, 0)?;
        let _b = DeviceBuffer::<i64>::uninitialized(&mem, 128, 1)?;
        assert_eq!(sim.live_allocations(), 2);
        assert_eq!(sim.bytes_in_use(1), 1024);
    }

    assert_eq!(sim.live_allocations(), 0);
    assert_eq!(sim.bytes_in_use(0), 0);
    assert_eq!(sim.bytes_in_use(1), 0);

    Ok(())
}

#[test]
fn failed_copy_releases_allocation() -> Result<(), Box<dyn Error>> {
    let (sim, mem) = provider(1, 1 << 20);
    let mut buffer = DeviceBuffer::<i32>::uninitialized(&mem, 4, 0)?;

    assert!(buffer.copy_from(&[1, 2, 3]).is_err());
    drop(buffer);
    assert_eq!(sim.live_allocations(), 0);

    Ok(())
}

#[test]
fn replicate_to_other_device() -> Result<(), Box<dyn Error>> {
    let (sim, mem) = provider(2, 1 << 20);
    let source = DeviceBuffer::from_slice(&mem, &[7_i32, 8, 9], 0)?;

    let replica = source.copy_to_device(1)?;

    assert_eq!(replica.device_id(), 1);
    assert_ne!(replica.as_device_ptr(), source.as_device_ptr());
    assert_eq!(replica.to_vec()?, vec![7, 8, 9]);
    assert_eq!(sim.bytes_in_use(1), 12);

    Ok(())
}

#[test]
fn injected_failure_leaves_no_allocations() -> Result<(), Box<dyn Error>> {
    let (sim, mem) = provider(4, 1 << 20);
    sim.inject_allocation_failure(2);

    let buffers = (0..4_u32)
        .into_par_iter()
        .map(|device_id| DeviceBuffer::from_slice(&mem, &[device_id as i32; 16], device_id))
        .collect::<Result<Vec<_>, _>>();

    match buffers.map_err(|e| e.0) {
        Err(ErrorKind::OutOfMemory(2, 64)) => {}
        other => panic!("Expected out-of-memory on device 2, got {:?}", other),
    }
    assert_eq!(sim.live_allocations(), 0);

    sim.clear_allocation_failures();
    assert!(DeviceBuffer::<i32>::uninitialized(&mem, 16, 2).is_ok());

    Ok(())
}
