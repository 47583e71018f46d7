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

//! Device memory provider contract and scoped device buffers.

use crate::error::{ErrorKind, Result};
use log::{trace, warn};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

/// Index of an accelerator device.
pub type DeviceId = u32;

/// Memory level at which a hash table is materialized
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MemoryLevel {
    /// Host memory that is directly accessible by the CPU
    Cpu,
    /// Device memory that is only accessible through a `DeviceMemoryProvider`
    Gpu,
}

impl MemoryLevel {
    pub fn is_gpu(&self) -> bool {
        *self == MemoryLevel::Gpu
    }
}

impl fmt::Display for MemoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLevel::Cpu => write!(f, "CPU"),
            MemoryLevel::Gpu => write!(f, "GPU"),
        }
    }
}

/// Specifies that the implementing type can be copied bitwise between host
/// and device memory.
///
/// # Safety
///
/// The type must not contain references, pointers, or padding, and any bit
/// pattern copied back from a device must be a valid value of the type.
pub unsafe trait DeviceCopy: Copy + Send + Sync + 'static {}

unsafe impl DeviceCopy for u8 {}
unsafe impl DeviceCopy for i16 {}
unsafe impl DeviceCopy for i32 {}
unsafe impl DeviceCopy for u32 {}
unsafe impl DeviceCopy for i64 {}
unsafe impl DeviceCopy for u64 {}

/// Reinterprets a slice of device-copyable values as raw bytes.
pub fn as_bytes<T: DeviceCopy>(data: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * size_of::<T>()) }
}

/// Reinterprets a mutable slice of device-copyable values as raw bytes.
pub fn as_bytes_mut<T: DeviceCopy>(data: &mut [T]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, data.len() * size_of::<T>())
    }
}

/// An opaque address in the memory of a device.
///
/// The address is only meaningful to the `DeviceMemoryProvider` that issued
/// it. Code generators treat it as a 64-bit integer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn null() -> Self {
        Self(0)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns the address `bytes` bytes after this one.
    pub fn offset(&self, bytes: usize) -> Result<Self> {
        (bytes as u64)
            .checked_add(self.0)
            .map(Self)
            .ok_or_else(|| ErrorKind::IntegerOverflow("Device pointer offset overflows".to_string()).into())
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The engine's device memory manager.
///
/// Any failure, e.g. running out of memory or addressing a device that does
/// not exist, must be reported as an error and never silently ignored.
pub trait DeviceMemoryProvider: fmt::Debug + Send + Sync {
    /// Number of devices that the provider manages.
    fn device_count(&self) -> u32;

    /// Allocates `bytes` bytes on the device.
    fn allocate(&self, bytes: usize, device_id: DeviceId) -> Result<DevicePtr>;

    /// Frees an allocation previously returned by `allocate`.
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Copies host memory to device memory.
    fn copy_host_to_device(&self, dst: DevicePtr, src: &[u8], device_id: DeviceId) -> Result<()>;

    /// Copies device memory to host memory.
    fn copy_device_to_host(&self, dst: &mut [u8], src: DevicePtr, device_id: DeviceId)
        -> Result<()>;

    /// Copies `bytes` bytes between two devices, or within a device.
    fn copy_device_to_device(
        &self,
        dst: DevicePtr,
        dst_device_id: DeviceId,
        src: DevicePtr,
        src_device_id: DeviceId,
        bytes: usize,
    ) -> Result<()>;
}

/// A typed allocation in device memory.
///
/// The buffer owns its allocation and frees it on drop. Dropping a partially
/// built set of buffers therefore releases all device memory acquired so far.
pub struct DeviceBuffer<T: DeviceCopy> {
    provider: Arc<dyn DeviceMemoryProvider>,
    ptr: DevicePtr,
    len: usize,
    device_id: DeviceId,
    _marker: PhantomData<T>,
}

impl<T: DeviceCopy> DeviceBuffer<T> {
    /// Allocates room for `len` elements without initializing them.
    pub fn uninitialized(
        provider: &Arc<dyn DeviceMemoryProvider>,
        len: usize,
        device_id: DeviceId,
    ) -> Result<Self> {
        let bytes = len.checked_mul(size_of::<T>()).ok_or_else(|| {
            ErrorKind::IntegerOverflow("Failed to compute device buffer bytes".to_string())
        })?;
        let ptr = provider.allocate(bytes, device_id)?;
        trace!("Allocated {} bytes at {} on device {}", bytes, ptr, device_id);

        Ok(Self {
            provider: provider.clone(),
            ptr,
            len,
            device_id,
            _marker: PhantomData,
        })
    }

    /// Allocates a buffer and copies `src` into it.
    pub fn from_slice(
        provider: &Arc<dyn DeviceMemoryProvider>,
        src: &[T],
        device_id: DeviceId,
    ) -> Result<Self> {
        let mut buffer = Self::uninitialized(provider, src.len(), device_id)?;
        buffer.copy_from(src)?;
        Ok(buffer)
    }

    pub fn copy_from(&mut self, src: &[T]) -> Result<()> {
        if src.len() != self.len {
            Err(ErrorKind::InvalidArgument(
                "Copy source length must be equal to destination".to_string(),
            ))?;
        }

        self.provider
            .copy_host_to_device(self.ptr, as_bytes(src), self.device_id)
    }

    pub fn copy_to(&self, dst: &mut [T]) -> Result<()> {
        if dst.len() != self.len {
            Err(ErrorKind::InvalidArgument(
                "Copy destination length must be equal to source".to_string(),
            ))?;
        }

        self.provider
            .copy_device_to_host(as_bytes_mut(dst), self.ptr, self.device_id)
    }

    /// Replicates the buffer onto another device.
    pub fn copy_to_device(&self, device_id: DeviceId) -> Result<Self> {
        let replica = Self::uninitialized(&self.provider, self.len, device_id)?;
        self.provider.copy_device_to_device(
            replica.ptr,
            device_id,
            self.ptr,
            self.device_id,
            self.size_bytes(),
        )?;
        Ok(replica)
    }

    pub fn as_device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * size_of::<T>()
    }
}

impl<T: DeviceCopy + Default> DeviceBuffer<T> {
    /// Copies the buffer back into a new host vector.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut host = vec![T::default(); self.len];
        self.copy_to(&mut host)?;
        Ok(host)
    }
}

impl<T: DeviceCopy> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if let Err(e) = self.provider.free(self.ptr) {
            warn!(
                "Failed to free device buffer {} on device {}: {}",
                self.ptr, self.device_id, e
            );
        }
    }
}

impl<T: DeviceCopy> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("device_id", &self.device_id)
            .finish()
    }
}
