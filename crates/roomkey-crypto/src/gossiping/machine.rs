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

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde_json::Value;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, instrument, trace, warn};
use zeroize::Zeroizing;

use super::{KeyShareRequest, RequestState, SweepReport};
use crate::{
    ciphers::{PkEncryption, PkMessage},
    error::{DecryptionError, MalformedMessageError},
    identities::DeviceIdentity,
    machine::CryptoContext,
    olm::{RoomKeyPayload, RoomSessionKey, MEGOLM_V1_ALGORITHM},
    requests::send_with_retry,
    store::PutOutcome,
    types::events::{ForwardedRoomKeyContent, KeyShareAction, KeyShareMessage},
};

/// Requests are identified by the sender, the requesting device and the
/// request id.
type RequestId = (OwnedUserId, OwnedDeviceId, String);

#[derive(Debug, Default)]
struct GossipMachineInner {
    /// Every request is behind its own lock, so messages for different
    /// requests are handled concurrently while messages for the same request
    /// are handled one after the other.
    requests: DashMap<RequestId, Arc<Mutex<KeyShareRequest>>>,
}

/// The state machine handling room key requests from other devices.
///
/// Messages may arrive more than once and out of order. Handling the same
/// message twice has the same effect as handling it once and a cancellation
/// wins over its request no matter which of the two arrives first.
#[derive(Debug, Clone)]
pub struct GossipMachine {
    context: CryptoContext,
    inner: Arc<GossipMachineInner>,
}

impl GossipMachine {
    /// Create a new gossip machine operating on the given context.
    pub fn new(context: CryptoContext) -> Self {
        Self { context, inner: Default::default() }
    }

    fn own_device_id(&self) -> &DeviceId {
        self.context.account.device_id()
    }

    /// Handle a key share control message we received from `sender`.
    ///
    /// Returns the state of the request after the message was applied, or
    /// `None` if the message was ignored. Malformed messages are dropped
    /// without touching any request.
    #[instrument(skip_all, fields(sender = ?sender))]
    pub async fn receive_key_share_message(
        &self,
        sender: &UserId,
        content: &Value,
    ) -> Result<Option<RequestState>, MalformedMessageError> {
        let message = KeyShareMessage::from_json(content).inspect_err(|error| {
            warn!(?error, "Dropping a malformed key share message");
        })?;

        if sender == self.context.account.user_id()
            && &*message.requesting_device_id == self.own_device_id()
        {
            trace!(
                request_id = message.request_id,
                "Ignoring a key share message from our own device"
            );
            return Ok(None);
        }

        let state = match message.action.clone() {
            KeyShareAction::ShareRequest => self.handle_request(sender, message).await,
            KeyShareAction::ShareCancellation => self.handle_cancellation(sender, message).await,
            KeyShareAction::Unknown(action) => {
                warn!(
                    requesting_device_id = ?message.requesting_device_id,
                    action,
                    "Received a key share message with an unknown action",
                );
                None
            }
        };

        Ok(state)
    }

    async fn handle_request(
        &self,
        sender: &UserId,
        message: KeyShareMessage,
    ) -> Option<RequestState> {
        if let Some(algorithm) =
            message.algorithm.as_deref().filter(|a| *a != MEGOLM_V1_ALGORITHM)
        {
            warn!(
                requesting_device_id = ?message.requesting_device_id,
                algorithm,
                "Received a key request for an unsupported algorithm",
            );
            return None;
        }

        let id =
            (sender.to_owned(), message.requesting_device_id.clone(), message.request_id.clone());

        let request = match self.inner.requests.entry(id) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                debug!(
                    requesting_device_id = ?message.requesting_device_id,
                    request_id = message.request_id,
                    room_id = ?message.room_id,
                    session_id = message.session_id,
                    "Received a new room key request",
                );

                let request = KeyShareRequest::new(sender, &message, RequestState::Requested);
                entry.insert(Arc::new(Mutex::new(request))).clone()
            }
        };

        let mut request = request.lock().await;
        self.serve(&mut request).await;

        Some(request.state())
    }

    async fn handle_cancellation(
        &self,
        sender: &UserId,
        message: KeyShareMessage,
    ) -> Option<RequestState> {
        let id =
            (sender.to_owned(), message.requesting_device_id.clone(), message.request_id.clone());

        let request = match self.inner.requests.entry(id) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // The request may still be on its way, remember the
                // cancellation so the request is treated as cancelled once it
                // arrives.
                debug!(
                    requesting_device_id = ?message.requesting_device_id,
                    request_id = message.request_id,
                    "Received a cancellation for a request we haven't seen yet",
                );

                entry.insert(Arc::new(Mutex::new(KeyShareRequest::new(
                    sender,
                    &message,
                    RequestState::Cancelled,
                ))));

                return Some(RequestState::Cancelled);
            }
        };

        let mut request = request.lock().await;
        let now = Instant::now();

        if !self.expire_if_stale(&mut request, now)
            && request.finish(RequestState::Cancelled, now)
        {
            info!(
                requesting_device_id = ?request.requesting_device_id(),
                request_id = request.request_id(),
                "A room key request was cancelled",
            );
        }

        Some(request.state())
    }

    /// Try to send the requested room key, the request stays pending if we
    /// can't.
    async fn serve(&self, request: &mut KeyShareRequest) {
        if request.state().is_finished() {
            trace!(
                request_id = request.request_id(),
                state = ?request.state(),
                "The room key request is already finished",
            );
            return;
        }

        if self.expire_if_stale(request, Instant::now()) {
            return;
        }

        let Some(device) =
            self.context.devices.get(request.requesting_user_id(), request.requesting_device_id())
        else {
            debug!(
                user_id = ?request.requesting_user_id(),
                device_id = ?request.requesting_device_id(),
                "Received a room key request from an unknown device",
            );
            return;
        };

        if !device.is_trusted() {
            debug!(
                user_id = ?device.user_id(),
                device_id = ?device.device_id(),
                trust_state = ?device.trust_state(),
                "Received a room key request from a device we don't trust",
            );
            return;
        }

        let key = match request.sender_key() {
            Some(sender_key) => self.context.store.get_with_sender(
                request.room_id(),
                request.session_id(),
                sender_key,
            ),
            None => self.context.store.get(request.room_id(), request.session_id()),
        };

        let Some(key) = key else {
            debug!(
                room_id = ?request.room_id(),
                session_id = request.session_id(),
                "Received a room key request for an unknown room key",
            );
            return;
        };

        let content = self.forward_room_key(&key, &device, request.request_id());

        let result = send_with_retry(&self.context.config.retry, "send_forwarded_room_key", || {
            self.context.transport.send_forwarded_room_key(
                device.user_id(),
                device.device_id(),
                &content,
            )
        })
        .await;

        match result {
            Ok(()) => {
                request.finish(RequestState::Satisfied, Instant::now());

                info!(
                    user_id = ?device.user_id(),
                    device_id = ?device.device_id(),
                    room_id = ?key.room_id(),
                    session_id = key.session_id(),
                    first_known_index = key.first_known_index(),
                    "Served a room key request",
                );
            }
            Err(error) => warn!(
                user_id = ?device.user_id(),
                device_id = ?device.device_id(),
                attempts = error.attempts,
                error = ?error.error,
                "Couldn't send a requested room key, the request stays pending",
            ),
        }
    }

    /// Move a pending request that outlived the configured time to live into
    /// the `Expired` state.
    fn expire_if_stale(&self, request: &mut KeyShareRequest, now: Instant) -> bool {
        let request_ttl = self.context.config.key_requests.request_ttl;

        if now.duration_since(request.created_at()) >= request_ttl
            && request.finish(RequestState::Expired, now)
        {
            debug!(request_id = request.request_id(), "A room key request expired");
            true
        } else {
            false
        }
    }

    /// Encrypt the room key for the identity key of the given device.
    fn forward_room_key(
        &self,
        key: &RoomSessionKey,
        device: &DeviceIdentity,
        request_id: &str,
    ) -> ForwardedRoomKeyContent {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&key.to_payload(Some(self.own_device_id())))
                .expect("We should always be able to serialize a room key payload"),
        );

        let message = PkEncryption::new(device.identity_key()).encrypt(&plaintext);

        ForwardedRoomKeyContent {
            algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
            request_id: request_id.to_owned(),
            room_id: key.room_id().to_owned(),
            session_id: key.session_id().to_owned(),
            session_data: message.into(),
        }
    }

    /// Accept a room key another device forwarded to us.
    ///
    /// Keys are only accepted from devices we trust, `None` is returned
    /// otherwise. Accepted keys are merged into the store like any other
    /// room key.
    #[instrument(
        skip_all,
        fields(sender = ?sender, sender_device = ?sender_device, room_id = ?content.room_id)
    )]
    pub fn receive_forwarded_room_key(
        &self,
        sender: &UserId,
        sender_device: &DeviceId,
        content: &ForwardedRoomKeyContent,
    ) -> Result<Option<PutOutcome>, DecryptionError> {
        let trusted =
            self.context.devices.get(sender, sender_device).is_some_and(|d| d.is_trusted());

        if !trusted {
            warn!("Received a forwarded room key from a device we don't trust, ignoring it");
            return Ok(None);
        }

        let message = PkMessage::try_from(&content.session_data)?;
        let plaintext = Zeroizing::new(
            self.context
                .account
                .decryption()
                .decrypt(&message)
                .map_err(|_| DecryptionError::AuthenticationFailed)?,
        );

        let payload: RoomKeyPayload =
            serde_json::from_slice(&plaintext).map_err(DecryptionError::InvalidPayload)?;

        if payload.room_id != content.room_id || payload.session_id != content.session_id {
            return Err(DecryptionError::AuthenticationFailed);
        }

        let key = RoomSessionKey::from_payload(&payload)?;
        let outcome = self.context.store.put(key);

        info!(session_id = content.session_id, ?outcome, "Received a forwarded room key");

        Ok(Some(outcome))
    }

    /// Try again to serve every pending request.
    ///
    /// Useful after we received new room keys or a device got verified.
    /// Returns the number of requests that were satisfied.
    pub async fn process_pending_requests(&self) -> usize {
        let requests: Vec<_> =
            self.inner.requests.iter().map(|entry| entry.value().clone()).collect();

        let mut satisfied = 0;

        for request in requests {
            let mut request = request.lock().await;

            if request.state() == RequestState::Requested {
                self.serve(&mut request).await;

                if request.state() == RequestState::Satisfied {
                    satisfied += 1;
                }
            }
        }

        satisfied
    }

    /// Expire pending requests that are older than the configured time to
    /// live and forget finished requests once the retention window passed.
    ///
    /// Cancelled requests are kept for at least the time to live, so a request
    /// arriving after its cancellation is still treated as cancelled.
    ///
    /// Requests that are being served at the moment are left alone. Sweeping
    /// is idempotent and can be done on any schedule.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let config = self.context.config.key_requests;
        let mut report = SweepReport::default();

        self.inner.requests.retain(|_, request| {
            let Ok(mut request) = request.try_lock() else {
                return true;
            };

            if request.state() == RequestState::Requested
                && now.duration_since(request.created_at()) >= config.request_ttl
                && request.finish(RequestState::Expired, now)
            {
                report.expired += 1;
            }

            // A cancellation has to outlive any copy of its request that may
            // still arrive.
            let retention = if request.state() == RequestState::Cancelled {
                config.retention.max(config.request_ttl)
            } else {
                config.retention
            };

            match request.finished_at() {
                Some(finished_at) if now.duration_since(finished_at) >= retention => {
                    report.removed += 1;
                    false
                }
                _ => true,
            }
        });

        if report != SweepReport::default() {
            debug!(expired = report.expired, removed = report.removed, "Swept room key requests");
        }

        report
    }

    /// Get the state of a request we received.
    pub async fn request_state(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        request_id: &str,
    ) -> Option<RequestState> {
        let request = self
            .inner
            .requests
            .get(&(user_id.to_owned(), device_id.to_owned(), request_id.to_owned()))?
            .value()
            .clone();

        let state = request.lock().await.state();
        Some(state)
    }

    /// Get a copy of a request we received.
    pub async fn get_request(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        request_id: &str,
    ) -> Option<KeyShareRequest> {
        let request = self
            .inner
            .requests
            .get(&(user_id.to_owned(), device_id.to_owned(), request_id.to_owned()))?
            .value()
            .clone();

        let request = request.lock().await.clone();
        Some(request)
    }

    /// The number of requests we're keeping track of.
    pub fn request_count(&self) -> usize {
        self.inner.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use assert_matches::assert_matches;
    use ruma::{device_id, room_id, user_id, DeviceId, OwnedDeviceId, UserId};
    use serde_json::{json, Value};

    use super::GossipMachine;
    use crate::{
        config::{CryptoConfig, KeyRequestConfig, RetryConfig},
        error::{MalformedMessageError, TransportError},
        gossiping::{RequestState, SweepReport},
        identities::{DeviceIdentity, TrustState},
        machine::CryptoContext,
        olm::{testing::room_key, Account, RoomSessionKey},
        requests::testing::MockTransport,
        store::PutOutcome,
    };

    fn alice_id() -> &'static UserId {
        user_id!("@alice:localhost")
    }

    fn alice_device_id() -> &'static DeviceId {
        device_id!("ALICEDEVICE")
    }

    fn bob_id() -> &'static UserId {
        user_id!("@bob:localhost")
    }

    fn bob_device_id() -> &'static DeviceId {
        device_id!("BOBDEVICE")
    }

    fn config() -> CryptoConfig {
        CryptoConfig::new()
            .retry(RetryConfig::new().retry_limit(2).initial_interval(Duration::from_millis(10)))
            .key_requests(
                KeyRequestConfig::new()
                    .request_ttl(Duration::from_secs(60))
                    .retention(Duration::from_secs(10)),
            )
    }

    fn gossip_machine(
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> (GossipMachine, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let context =
            CryptoContext::new(Account::new(user_id, device_id), transport.clone(), config());

        (GossipMachine::new(context), transport)
    }

    /// Alice's machine together with Bob's device, known to Alice with the
    /// given trust state.
    fn alice_and_bob(
        trust_state: TrustState,
    ) -> (GossipMachine, Arc<MockTransport>, Account, DeviceIdentity) {
        let (machine, transport) = gossip_machine(alice_id(), alice_device_id());

        let bob = Account::new(bob_id(), bob_device_id());
        let mut bob_device = bob.device_identity();
        bob_device.set_trust_state(trust_state);
        machine.context.devices.add(bob_device.clone());

        (machine, transport, bob, bob_device)
    }

    fn store_key(machine: &GossipMachine) -> RoomSessionKey {
        let key = room_key(room_id!("!test:localhost"), "session", 0);
        machine.context.store.put(key.clone());
        key
    }

    fn message(action: &str, request_id: &str) -> Value {
        json!({
            "action": action,
            "requesting_device_id": bob_device_id(),
            "request_id": request_id,
            "room_id": "!test:localhost",
            "session_id": "session",
            "algorithm": "m.megolm.v1.aes-sha2",
        })
    }

    fn request(request_id: &str) -> Value {
        message("request", request_id)
    }

    fn cancellation(request_id: &str) -> Value {
        message("request_cancellation", request_id)
    }

    #[tokio::test]
    async fn requests_from_trusted_devices_are_satisfied() {
        let (machine, transport, _, _) = alice_and_bob(TrustState::Verified);
        store_key(&machine);

        let state = machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();

        assert_eq!(state, Some(RequestState::Satisfied));

        let sent = transport.sent_room_keys();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id, bob_id());
        assert_eq!(sent[0].device_id, bob_device_id());
        assert_eq!(sent[0].content.request_id, "1");
    }

    #[tokio::test]
    async fn late_duplicates_dont_reexport_the_key() {
        let (machine, transport, _, _) = alice_and_bob(TrustState::CrossSigned);
        store_key(&machine);

        machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        let state = machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();

        assert_eq!(state, Some(RequestState::Satisfied));
        assert_eq!(transport.sent_room_keys().len(), 1);
    }

    #[tokio::test]
    async fn untrusted_devices_dont_get_keys() {
        for trust_state in [TrustState::Unverified, TrustState::Blocked] {
            let (machine, transport, _, _) = alice_and_bob(trust_state);
            store_key(&machine);

            let state = machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();

            assert_eq!(state, Some(RequestState::Requested));
            assert_eq!(machine.process_pending_requests().await, 0);
            assert!(transport.sent_room_keys().is_empty());
        }
    }

    #[tokio::test]
    async fn duplicate_requests_are_idempotent() {
        let (machine, _, _, _) = alice_and_bob(TrustState::Unverified);

        machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        let first = machine.get_request(bob_id(), bob_device_id(), "1").await.unwrap();

        machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        let second = machine.get_request(bob_id(), bob_device_id(), "1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(machine.request_count(), 1);
    }

    #[tokio::test]
    async fn cancellations_win_regardless_of_order() {
        let (machine, _, _, _) = alice_and_bob(TrustState::Unverified);

        machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        let state = machine.receive_key_share_message(bob_id(), &cancellation("1")).await.unwrap();
        assert_eq!(state, Some(RequestState::Cancelled));

        let state = machine.receive_key_share_message(bob_id(), &cancellation("2")).await.unwrap();
        assert_eq!(state, Some(RequestState::Cancelled));
        let state = machine.receive_key_share_message(bob_id(), &request("2")).await.unwrap();
        assert_eq!(state, Some(RequestState::Cancelled));

        assert_eq!(
            machine.request_state(bob_id(), bob_device_id(), "1").await,
            Some(RequestState::Cancelled)
        );
        assert_eq!(
            machine.request_state(bob_id(), bob_device_id(), "2").await,
            Some(RequestState::Cancelled)
        );
    }

    #[tokio::test]
    async fn tombstones_suppress_requests_from_trusted_devices() {
        let (machine, transport, _, _) = alice_and_bob(TrustState::Verified);
        store_key(&machine);

        machine.receive_key_share_message(bob_id(), &cancellation("1")).await.unwrap();
        let state = machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();

        assert_eq!(state, Some(RequestState::Cancelled));
        assert!(transport.sent_room_keys().is_empty());
    }

    #[tokio::test]
    async fn satisfied_requests_ignore_cancellations() {
        let (machine, _, _, _) = alice_and_bob(TrustState::Verified);
        store_key(&machine);

        machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        let state = machine.receive_key_share_message(bob_id(), &cancellation("1")).await.unwrap();

        assert_eq!(state, Some(RequestState::Satisfied));
    }

    #[tokio::test]
    async fn malformed_and_unknown_messages_are_dropped() {
        let (machine, _, _, _) = alice_and_bob(TrustState::Verified);

        let mut malformed = request("1");
        malformed.as_object_mut().unwrap().remove("session_id");

        assert_matches!(
            machine.receive_key_share_message(bob_id(), &malformed).await,
            Err(MalformedMessageError::MissingField("session_id"))
        );

        let unknown = message("m.shrug", "1");
        assert_eq!(machine.receive_key_share_message(bob_id(), &unknown).await.unwrap(), None);

        let mut unsupported = request("1");
        unsupported["algorithm"] = "m.olm.v1.curve25519-aes-sha2".into();
        assert_eq!(machine.receive_key_share_message(bob_id(), &unsupported).await.unwrap(), None);

        assert_eq!(machine.request_count(), 0);
    }

    #[tokio::test]
    async fn requests_from_our_own_device_are_ignored() {
        let (machine, _, _, _) = alice_and_bob(TrustState::Verified);

        let mut own_request = request("1");
        own_request["requesting_device_id"] = alice_device_id().as_str().into();

        assert_eq!(
            machine.receive_key_share_message(alice_id(), &own_request).await.unwrap(),
            None
        );
        assert_eq!(machine.request_count(), 0);
    }

    #[tokio::test]
    async fn pending_requests_are_served_later() {
        let (machine, transport, _, bob_device) = alice_and_bob(TrustState::Unverified);

        let state = machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        assert_eq!(state, Some(RequestState::Requested));

        store_key(&machine);
        machine.context.devices.set_trust_state(
            bob_device.user_id(),
            bob_device.device_id(),
            TrustState::Verified,
        );

        assert_eq!(machine.process_pending_requests().await, 1);
        assert_eq!(transport.sent_room_keys().len(), 1);
        assert_eq!(
            machine.request_state(bob_id(), bob_device_id(), "1").await,
            Some(RequestState::Satisfied)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sends_keep_the_request_pending() {
        let (machine, transport, _, _) = alice_and_bob(TrustState::Verified);
        store_key(&machine);

        transport.fail_next_requests(2, TransportError::Timeout);

        let state = machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        assert_eq!(state, Some(RequestState::Requested));

        assert_eq!(machine.process_pending_requests().await, 1);
        assert_eq!(transport.sent_room_keys().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_expire() {
        let (machine, _, _, _) = alice_and_bob(TrustState::Unverified);

        machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        machine.receive_key_share_message(bob_id(), &request("2")).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(machine.sweep().expired, 0);

        tokio::time::advance(Duration::from_secs(31)).await;

        // Expiry also happens when we look at the request again.
        let state = machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        assert_eq!(state, Some(RequestState::Expired));

        let report = machine.sweep();
        assert_eq!(report.expired, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(
            machine.request_state(bob_id(), bob_device_id(), "2").await,
            Some(RequestState::Expired)
        );

        // Sweeping is idempotent.
        assert_eq!(machine.sweep().expired, 0);

        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(machine.sweep().removed, 2);
        assert_eq!(machine.request_count(), 0);
        assert_eq!(machine.request_state(bob_id(), bob_device_id(), "1").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellations_outlive_the_retention_window() {
        let (machine, transport, _, _) = alice_and_bob(TrustState::Verified);
        store_key(&machine);

        machine.receive_key_share_message(bob_id(), &cancellation("1")).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(machine.sweep().removed, 0);

        let state = machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        assert_eq!(state, Some(RequestState::Cancelled));
        assert!(transport.sent_room_keys().is_empty());

        tokio::time::advance(Duration::from_secs(41)).await;
        assert_eq!(machine.sweep().removed, 1);
        assert_eq!(machine.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellations_win_with_the_default_config() {
        let transport = Arc::new(MockTransport::new());
        let context = CryptoContext::new(
            Account::new(alice_id(), alice_device_id()),
            transport.clone(),
            CryptoConfig::new(),
        );
        let machine = GossipMachine::new(context);

        let mut bob_device = Account::new(bob_id(), bob_device_id()).device_identity();
        bob_device.set_trust_state(TrustState::Verified);
        machine.context.devices.add(bob_device);
        store_key(&machine);

        machine.receive_key_share_message(bob_id(), &cancellation("1")).await.unwrap();

        tokio::time::advance(Duration::from_secs(2 * 60 * 60)).await;
        assert_eq!(machine.sweep(), SweepReport::default());

        let state = machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        assert_eq!(state, Some(RequestState::Cancelled));
        assert!(transport.sent_room_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellations_dont_revive_expired_requests() {
        let (machine, _, _, _) = alice_and_bob(TrustState::Unverified);

        machine.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let state = machine.receive_key_share_message(bob_id(), &cancellation("1")).await.unwrap();
        assert_eq!(state, Some(RequestState::Expired));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requesters_are_tracked_independently() {
        let (machine, transport) = gossip_machine(alice_id(), alice_device_id());
        store_key(&machine);

        let mut handles = Vec::new();

        for i in 0..8 {
            let device_id: OwnedDeviceId = format!("BOBDEVICE{i}").into();
            let bob = Account::new(bob_id(), &device_id);
            let mut device = bob.device_identity();
            device.set_trust_state(if i % 2 == 0 {
                TrustState::Verified
            } else {
                TrustState::Unverified
            });
            machine.context.devices.add(device.clone());

            let machine = machine.clone();

            handles.push(tokio::spawn(async move {
                let mut message = request("1");
                message["requesting_device_id"] = device.device_id().as_str().into();

                // Send every message twice to provoke races on the same request.
                let (first, second) = tokio::join!(
                    machine.receive_key_share_message(bob_id(), &message),
                    machine.receive_key_share_message(bob_id(), &message),
                );

                (device.trust_state(), first.unwrap(), second.unwrap())
            }));
        }

        for handle in handles {
            let (trust_state, first, second) = handle.await.unwrap();
            let expected = if trust_state.is_trusted() {
                RequestState::Satisfied
            } else {
                RequestState::Requested
            };

            assert_eq!(first, Some(expected));
            assert_eq!(second, Some(expected));
        }

        assert_eq!(machine.request_count(), 8);
        assert_eq!(transport.sent_room_keys().len(), 4);
    }

    #[tokio::test]
    async fn forwarded_keys_roundtrip() {
        let (alice, transport, bob_account, _) = alice_and_bob(TrustState::Verified);
        let key = store_key(&alice);

        let bob_transport = Arc::new(MockTransport::new());
        let bob = GossipMachine::new(CryptoContext::new(bob_account, bob_transport, config()));

        let mut alice_device = alice.context.account.device_identity();
        alice_device.set_trust_state(TrustState::Unverified);
        bob.context.devices.add(alice_device);

        alice.receive_key_share_message(bob_id(), &request("1")).await.unwrap();
        let content = transport.sent_room_keys().remove(0).content;

        // Bob doesn't trust Alice's device yet.
        assert_eq!(
            bob.receive_forwarded_room_key(alice_id(), alice_device_id(), &content).unwrap(),
            None
        );
        assert!(bob.context.store.is_empty());

        bob.context.devices.set_trust_state(alice_id(), alice_device_id(), TrustState::Verified);

        assert_eq!(
            bob.receive_forwarded_room_key(alice_id(), alice_device_id(), &content).unwrap(),
            Some(PutOutcome::Inserted)
        );

        let received = bob.context.store.get(key.room_id(), key.session_id()).unwrap();
        assert_eq!(received.key_material(), key.key_material());
        assert_eq!(received.first_known_index(), key.first_known_index());
        assert_eq!(received.forwarding_chain(), &[alice_device_id().to_owned()]);
    }
}
