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

//! # Device Memory Runtime
//!
//! `device-mem` is the boundary between join hash table construction and the
//! memory of accelerator devices. The engine plugs its device memory manager
//! in through the [`DeviceMemoryProvider`](runtime::memory::DeviceMemoryProvider)
//! trait. Hash table builders never call `free` themselves. Instead, each
//! allocation is owned by a [`DeviceBuffer`](runtime::memory::DeviceBuffer)
//! that releases its memory when it goes out of scope, including on every
//! error path.
//!
//! For hosts without accelerators, and for tests, the
//! [`HostBackedDeviceMemory`](runtime::allocator::HostBackedDeviceMemory)
//! provider emulates a set of devices in system memory.

pub mod error;
pub mod runtime;
