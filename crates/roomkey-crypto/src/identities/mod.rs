// Copyright 2025 The Matrix.org Foundation C.I.C.
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

//! Devices we know about and how much we trust them.
//!
//! A [`DeviceIdentity`] carries the public keys of a device together with its
//! [`TrustState`]. The [`TrustEvaluator`] turns the trust states of the
//! devices that signed a backup version into a [`TrustTier`] for the backup.

pub(crate) mod device;
mod trust;

pub use device::{DeviceIdentity, TrustState};
pub use trust::{TrustEvaluator, TrustTier};
