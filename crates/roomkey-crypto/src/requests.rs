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

//! The requests this crate needs the outside world to perform.
//!
//! This crate doesn't do any networking itself, the [`Transport`] trait is
//! implemented by the user of the crate. Failed requests are retried with a
//! bounded exponential backoff, see [`RetryConfig`].

use std::{
    fmt::Debug,
    future::Future,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use backoff::{future::retry_notify, Error as RetryError, ExponentialBackoffBuilder};
use ruma::{DeviceId, UserId};
use tracing::warn;

use crate::{
    config::RetryConfig,
    error::{BackupError, TransportError},
    types::{events::ForwardedRoomKeyContent, BackedUpRoomKey, BackupVersionDescriptor},
};

/// The collaborator that delivers our requests to the server and to other
/// devices.
///
/// Delivery is assumed to be at-least-once, implementations don't need to
/// deduplicate.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Upload a newly created backup version.
    async fn upload_backup_version(
        &self,
        descriptor: &BackupVersionDescriptor,
    ) -> Result<(), TransportError>;

    /// Delete the backup version with the given id on the server.
    async fn delete_backup_version(&self, version: &str) -> Result<(), TransportError>;

    /// Upload encrypted room keys to the given backup version.
    async fn upload_room_keys(
        &self,
        version: &str,
        keys: &[BackedUpRoomKey],
    ) -> Result<(), TransportError>;

    /// Fetch all the encrypted room keys of the given backup version.
    async fn download_room_keys(&self, version: &str)
        -> Result<Vec<BackedUpRoomKey>, TransportError>;

    /// Send a room key to a device that asked for it.
    async fn send_forwarded_room_key(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        content: &ForwardedRoomKeyContent,
    ) -> Result<(), TransportError>;
}

/// A request that failed permanently or ran out of attempts.
#[derive(Debug, Clone)]
pub(crate) struct RetryExhausted {
    pub attempts: u32,
    pub error: TransportError,
}

impl From<RetryExhausted> for BackupError {
    fn from(value: RetryExhausted) -> Self {
        BackupError::BackupUnavailable { attempts: value.attempts, source: value.error }
    }
}

/// Run the given request until it succeeds, fails with a non-transient error
/// or the retry limit is reached.
pub(crate) async fn send_with_retry<T, F, Fut>(
    config: &RetryConfig,
    request_name: &'static str,
    mut request: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_interval)
        .with_max_interval(config.max_interval)
        .with_multiplier(config.multiplier)
        .with_max_elapsed_time(None)
        .build();

    let retry_limit = config.retry_limit;
    let attempts = AtomicU32::new(0);

    let send_request = || {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let response = request();

        async move {
            response.await.map_err(|error| {
                // Turn errors into permanent errors when the retry limit is reached.
                if attempt >= retry_limit || !error.is_transient() {
                    RetryError::permanent(error)
                } else {
                    RetryError::transient(error)
                }
            })
        }
    };

    let notify = |error: TransportError, wait: Duration| {
        warn!(request_name, ?error, ?wait, "Request failed, retrying");
    };

    retry_notify(backoff, send_request, notify).await.map_err(|error| RetryExhausted {
        attempts: attempts.load(Ordering::Relaxed),
        error,
    })
}

/// A [`Transport`] that keeps everything in memory, for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::{
        collections::{BTreeMap, VecDeque},
        sync::{Mutex, MutexGuard},
    };

    use async_trait::async_trait;
    use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};

    use super::Transport;
    use crate::{
        error::TransportError,
        types::{events::ForwardedRoomKeyContent, BackedUpRoomKey, BackupVersionDescriptor},
    };

    /// A room key that was sent to a device.
    #[derive(Debug, Clone)]
    pub struct SentRoomKey {
        /// The user owning the receiving device.
        pub user_id: OwnedUserId,
        /// The receiving device.
        pub device_id: OwnedDeviceId,
        /// The sent content.
        pub content: ForwardedRoomKeyContent,
    }

    #[derive(Debug, Default)]
    struct State {
        failures: VecDeque<TransportError>,
        requests: u32,
        versions: BTreeMap<String, BackupVersionDescriptor>,
        deleted_versions: Vec<String>,
        backups: BTreeMap<String, Vec<BackedUpRoomKey>>,
        sent_room_keys: Vec<SentRoomKey>,
    }

    /// An in-memory transport recording every request.
    #[derive(Debug, Default)]
    pub struct MockTransport {
        state: Mutex<State>,
    }

    impl MockTransport {
        /// Create a new transport where every request succeeds.
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Let the next `count` requests fail with the given error.
        pub fn fail_next_requests(&self, count: usize, error: TransportError) {
            self.state().failures.extend(std::iter::repeat(error).take(count));
        }

        /// The number of requests we received, including failed ones.
        pub fn request_count(&self) -> u32 {
            self.state().requests
        }

        /// The backup versions that were uploaded.
        pub fn uploaded_versions(&self) -> Vec<BackupVersionDescriptor> {
            self.state().versions.values().cloned().collect()
        }

        /// The ids of the backup versions that were deleted.
        pub fn deleted_versions(&self) -> Vec<String> {
            self.state().deleted_versions.clone()
        }

        /// The room keys stored in the given backup version.
        pub fn backed_up_room_keys(&self, version: &str) -> Vec<BackedUpRoomKey> {
            self.state().backups.get(version).cloned().unwrap_or_default()
        }

        /// Put room keys into a backup version, as if another device uploaded
        /// them.
        pub fn insert_backed_up_room_keys(&self, version: &str, keys: Vec<BackedUpRoomKey>) {
            self.state().backups.entry(version.to_owned()).or_default().extend(keys);
        }

        /// The room keys that were sent to other devices.
        pub fn sent_room_keys(&self) -> Vec<SentRoomKey> {
            self.state().sent_room_keys.clone()
        }

        fn request(&self) -> Result<MutexGuard<'_, State>, TransportError> {
            let mut state = self.state();
            state.requests += 1;

            match state.failures.pop_front() {
                Some(error) => Err(error),
                None => Ok(state),
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn upload_backup_version(
            &self,
            descriptor: &BackupVersionDescriptor,
        ) -> Result<(), TransportError> {
            self.request()?.versions.insert(descriptor.version.clone(), descriptor.clone());
            Ok(())
        }

        async fn delete_backup_version(&self, version: &str) -> Result<(), TransportError> {
            let mut state = self.request()?;
            state.versions.remove(version);
            state.backups.remove(version);
            state.deleted_versions.push(version.to_owned());

            Ok(())
        }

        async fn upload_room_keys(
            &self,
            version: &str,
            keys: &[BackedUpRoomKey],
        ) -> Result<(), TransportError> {
            self.request()?.backups.entry(version.to_owned()).or_default().extend_from_slice(keys);
            Ok(())
        }

        async fn download_room_keys(
            &self,
            version: &str,
        ) -> Result<Vec<BackedUpRoomKey>, TransportError> {
            Ok(self.request()?.backups.get(version).cloned().unwrap_or_default())
        }

        async fn send_forwarded_room_key(
            &self,
            user_id: &UserId,
            device_id: &DeviceId,
            content: &ForwardedRoomKeyContent,
        ) -> Result<(), TransportError> {
            self.request()?.sent_room_keys.push(SentRoomKey {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
                content: content.clone(),
            });

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::{send_with_retry, testing::MockTransport, Transport};
    use crate::{config::RetryConfig, error::TransportError};

    fn config() -> RetryConfig {
        RetryConfig::new()
            .retry_limit(3)
            .initial_interval(Duration::from_millis(10))
            .max_interval(Duration::from_millis(50))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let transport = MockTransport::new();
        transport.fail_next_requests(2, TransportError::Timeout);

        let result =
            send_with_retry(&config(), "download", || transport.download_room_keys("1")).await;

        assert!(result.unwrap().is_empty());
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let transport = MockTransport::new();
        transport.fail_next_requests(10, TransportError::Network("offline".to_owned()));

        let error = send_with_retry(&config(), "download", || transport.download_room_keys("1"))
            .await
            .unwrap_err();

        assert_eq!(error.attempts, 3);
        assert_matches!(error.error, TransportError::Network(_));
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let transport = MockTransport::new();
        transport.fail_next_requests(
            1,
            TransportError::Server { status: 403, message: "Forbidden".to_owned() },
        );

        let error = send_with_retry(&config(), "download", || transport.download_room_keys("1"))
            .await
            .unwrap_err();

        assert_eq!(error.attempts, 1);
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_retries_attempt_once() {
        let transport = MockTransport::new();
        transport.fail_next_requests(1, TransportError::Timeout);

        let config = RetryConfig::new().disable_retry();
        let error = send_with_retry(&config, "download", || transport.download_room_keys("1"))
            .await
            .unwrap_err();

        assert_eq!(error.attempts, 1);
        assert_eq!(error.error, TransportError::Timeout);
    }
}
