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

use crate::runtime::memory::DeviceId;
use error_chain::error_chain;

error_chain! {
    errors {
        OutOfMemory(device_id: DeviceId, bytes: usize) {
            description("Device out of memory")
            display("Failed to allocate {} bytes on device {}", bytes, device_id)
        }
        InvalidDevice(device_id: DeviceId) {
            description("Invalid device")
            display("Device {} does not exist", device_id)
        }
        InvalidHandle(handle: u64) {
            description("Invalid device memory handle")
            display("No device allocation contains address {:#x}", handle)
        }
        OutOfBounds(msg: String) {
            description("Out of bounds device memory access")
            display("Aborted with: {}", msg)
        }
        InvalidArgument(msg: String) {
            description("Invalid argument error")
            display("Aborted with: {}", msg)
        }
        IntegerOverflow(msg: String) {
            description("Integer overflow error")
            display("Aborted with: {}", msg)
        }
    }
}
