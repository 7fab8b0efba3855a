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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub mod backups;
mod ciphers;
pub mod config;
mod error;
mod executor;
pub mod gossiping;
mod identities;
mod machine;
pub mod olm;
pub mod requests;
pub mod store;
pub mod types;
mod utilities;

#[cfg(feature = "testing")]
/// Testing facilities and helpers for crypto tests
pub mod testing {
    pub use crate::{identities::device::testing::get_device, requests::testing::*};
}

pub use error::{
    BackupError, DecryptionError, KeyDecodeError, MalformedMessageError, SignatureError,
    TaskError, TransportError,
};
pub use executor::BackgroundTask;
pub use identities::{DeviceIdentity, TrustEvaluator, TrustState, TrustTier};
pub use machine::{CryptoContext, KeyMachine};
#[doc(no_inline)]
pub use vodozemac;

/// The version of the roomkey-crypto crate being used
pub static VERSION: &str = env!("CARGO_PKG_VERSION");

// Enable tracing for tests in this crate
#[cfg(test)]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
