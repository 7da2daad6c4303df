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

use std::collections::HashMap;
use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use vodozemac::megolm::{InboundGroupSession, SessionConfig, SessionKey};
use vodozemac::olm::{Message, OlmMessage, PreKeyMessage};
use vodozemac::{Ed25519PublicKey, Ed25519Signature};
use zeroize::Zeroize;

use crate::account::{pickle_key, Account, StoredAccount};
use crate::canonical_json::{canonical_json, jws_to_base64};
use crate::error::{CryptoError, Result};
use crate::sessions::{GroupSessionIndex, InboundGroupSessionKey, Session};
use crate::store::CryptoStore;

/// The encryption algorithm of device-to-device Olm messages.
pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";

/// The algorithms advertised in our device keys.
const ALGORITHMS: &[&str] = &["m.olm.curve25519-aes-sha256", "m.megolm.v1.aes-sha"];

/// A decrypted device-to-device Olm event.
#[derive(Clone, Debug)]
pub struct DecryptedOlmEvent {
    /// The user id of the sender, verified against the plaintext.
    pub sender: String,
    /// The curve25519 key of the sending device.
    pub sender_key: String,
    /// The device id of the sending device, as claimed by the plaintext.
    pub sender_device: Option<String>,
    /// The plaintext event type.
    pub event_type: String,
    /// The plaintext event content.
    pub content: Value,
}

/// The state machine driving the device's end-to-end encryption duties.
///
/// The machine never talks to the homeserver itself. It hands the client
/// payloads to upload (device keys, one-time keys) and receives the
/// device-to-device events and key counts the client pulls out of `/sync`.
pub struct OlmMachine {
    /// The unique user id that owns this account.
    user_id: String,
    /// The unique device id of the device that holds this account.
    device_id: String,
    /// The homeserver the account was created against.
    server: String,
    /// Our underlying Olm account holding our identity keys.
    account: Account,
    /// Persistent storage for session material.
    store: CryptoStore,
    /// Established pairwise sessions, keyed by the peer's curve25519 key.
    sessions: HashMap<String, Vec<Session>>,
    /// Inbound Megolm sessions for future timeline decryption.
    group_sessions: GroupSessionIndex,
}

impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl OlmMachine {
    /// Restore or create the machine for the given account.
    ///
    /// `stored` is the persisted account record, if one exists. Returns the
    /// machine together with a fresh record to persist when a new account
    /// had to be created.
    pub fn open(
        user_id: &str,
        device_id: &str,
        server: &str,
        stored: Option<&StoredAccount>,
        data_dir: &Path,
        host_user: &str,
    ) -> Result<(Self, Option<StoredAccount>)> {
        let (account, fresh) = match stored {
            Some(stored) => (Account::restore(stored, device_id, server)?, None),
            None => {
                info!("no stored Olm account, creating a new one");
                let account = Account::new();
                let record = account.store(device_id, server);
                (account, Some(record))
            }
        };

        let store = CryptoStore::open(data_dir, user_id, host_user, pickle_key(device_id, server))?;

        let mut group_sessions = GroupSessionIndex::new();
        for (room_id, key, session) in store.load_group_sessions()? {
            group_sessions.insert(&room_id, key, session);
        }

        Ok((
            OlmMachine {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
                server: server.to_owned(),
                account,
                store,
                sessions: HashMap::new(),
                group_sessions,
            },
            fresh,
        ))
    }

    /// The base64 curve25519 identity key of this device.
    pub fn curve25519(&self) -> String {
        self.account.curve25519()
    }

    /// The base64 ed25519 signing key of this device.
    pub fn ed25519(&self) -> String {
        self.account.ed25519()
    }

    /// The inbound Megolm session index.
    pub fn group_sessions(&self) -> &GroupSessionIndex {
        &self.group_sessions
    }

    /// Build the signed device-keys object for `/keys/upload`.
    pub fn device_keys(&self) -> Result<Value> {
        let mut keys = Map::new();
        keys.insert(
            format!("curve25519:{}", self.device_id),
            self.account.curve25519().into(),
        );
        keys.insert(
            format!("ed25519:{}", self.device_id),
            self.account.ed25519().into(),
        );

        let mut device_keys = json!({
            "user_id": self.user_id,
            "device_id": self.device_id,
            "algorithms": ALGORITHMS,
            "keys": keys,
        });
        self.sign_json(&mut device_keys)?;

        Ok(device_keys)
    }

    /// Convert a JSON object to its canonical form, sign it, and insert the
    /// signature as `signatures[user_id]["ed25519:<device_id>"]`.
    ///
    /// Existing `signatures` and `unsigned` members are excluded from the
    /// signed form; `unsigned` is put back afterwards.
    pub fn sign_json(&self, value: &mut Value) -> Result<()> {
        let object = value.as_object_mut().ok_or(CryptoError::NotAnObject)?;
        object.remove("signatures");
        let unsigned = object.remove("unsigned");

        let signature = self.account.sign(&canonical_json(value));

        let object = value.as_object_mut().ok_or(CryptoError::NotAnObject)?;
        if let Some(unsigned) = unsigned {
            object.insert("unsigned".to_owned(), unsigned);
        }

        let mut key_map = Map::new();
        key_map.insert(format!("ed25519:{}", self.device_id), signature.into());
        let mut signatures = Map::new();
        signatures.insert(self.user_id.clone(), Value::Object(key_map));
        object.insert("signatures".to_owned(), Value::Object(signatures));

        Ok(())
    }

    /// Verify that an object carries a valid signature by this account.
    pub fn verify_own_signature(&self, value: &Value) -> Result<()> {
        let signature = value
            .get("signatures")
            .and_then(|s| s.get(&self.user_id))
            .and_then(|s| s.get(format!("ed25519:{}", self.device_id)))
            .and_then(Value::as_str)
            .ok_or(CryptoError::NotAnObject)?;
        let signature = Ed25519Signature::from_base64(&jws_to_base64(signature))?;

        let mut unsigned_value = value.clone();
        let object = unsigned_value.as_object_mut().ok_or(CryptoError::NotAnObject)?;
        object.remove("signatures");
        object.remove("unsigned");

        let key = Ed25519PublicKey::from_base64(&self.account.ed25519())?;
        key.verify(canonical_json(&unsigned_value).as_bytes(), &signature)?;
        Ok(())
    }

    /// Examine the one-time-key counts from a sync response or key upload.
    ///
    /// Returns the signed `one_time_keys` object to upload when the pool
    /// needs replenishing, `None` otherwise. Any algorithm reported below
    /// half of the account's maximum triggers a top-up back to half; a
    /// missing or empty counts object triggers a full batch.
    pub fn update_key_counts(&mut self, counts: &HashMap<String, u64>) -> Option<Value> {
        let max_keys = self.account.max_one_time_keys();
        let mut to_create = max_keys;
        let mut need_to_send = false;

        for (algorithm, &count) in counts {
            debug!(%algorithm, count, "one-time key count");
            if count < max_keys / 2 {
                to_create = max_keys / 2 - count;
                need_to_send = true;
            }
        }

        if counts.is_empty() {
            need_to_send = true;
        }

        if !need_to_send {
            return None;
        }

        debug!(to_create, "replenishing one-time keys");
        self.account.generate_one_time_keys(to_create);
        self.signed_one_time_keys().ok()
    }

    /// Wrap and sign the account's unpublished one-time keys for upload.
    fn signed_one_time_keys(&self) -> Result<Value> {
        let mut one_time_keys = Map::new();

        for (key_id, key) in self.account.one_time_keys() {
            let mut signed_key = json!({ "key": key });
            self.sign_json(&mut signed_key)?;
            one_time_keys.insert(format!("signed_curve25519:{key_id}"), signed_key);
        }

        Ok(Value::Object(one_time_keys))
    }

    /// A one-time-key upload succeeded: mark the keys as published and hand
    /// back the refreshed account record for persisting.
    pub fn mark_keys_published(&mut self) -> StoredAccount {
        self.account.mark_keys_as_published();
        self.account.store(&self.device_id, &self.server)
    }

    /// Decrypt an incoming `m.room.encrypted` device-to-device event.
    ///
    /// Malformed or mismatched events are dropped with a warning, matching
    /// the per-event tolerance of the rest of the sync pipeline. Recognized
    /// `m.room_key` payloads are installed into the Megolm session index.
    pub fn receive_to_device(&mut self, event: &Value) -> Option<DecryptedOlmEvent> {
        let sender = event.get("sender").and_then(Value::as_str)?.to_owned();
        let content = event.get("content")?;

        match content.get("algorithm").and_then(Value::as_str) {
            Some(OLM_ALGORITHM) => {}
            Some("m.megolm.v1.aes-sha2") => {
                debug!(%sender, "megolm is unexpected for device-to-device events");
                return None;
            }
            algorithm => {
                debug!(%sender, ?algorithm, "unknown algorithm in encrypted event");
                return None;
            }
        }

        let sender_key = content.get("sender_key").and_then(Value::as_str)?.to_owned();
        let Some(our_ciphertext) = content
            .get("ciphertext")
            .and_then(|c| c.get(self.account.curve25519()))
        else {
            debug!(%sender, "no ciphertext for our curve25519 key");
            return None;
        };

        let message_type = our_ciphertext.get("type").and_then(Value::as_u64)?;
        let body = our_ciphertext.get("body").and_then(Value::as_str)?;

        let plaintext = match self.decrypt_olm(&sender_key, message_type, body) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(%sender, error = %e, "failed to decrypt olm message");
                return None;
            }
        };

        self.handle_decrypted_olm(&sender, &sender_key, plaintext)
    }

    fn decrypt_olm(
        &mut self,
        sender_key: &str,
        message_type: u64,
        body: &str,
    ) -> Result<Vec<u8>> {
        if message_type == 0 {
            // A pre-key message establishing a new session.
            let message = PreKeyMessage::from_base64(body)?;
            let (session, plaintext) = self.account.create_inbound_session(sender_key, &message)?;
            debug!(session_id = %session.session_id(), "created inbound olm session");

            self.store.save_session(&session)?;
            self.sessions.entry(sender_key.to_owned()).or_default().push(session);

            Ok(plaintext)
        } else {
            let message = OlmMessage::Normal(Message::from_base64(body)?);
            let sessions = self.sessions.entry(sender_key.to_owned()).or_default();

            let mut last_error = CryptoError::MissingSession;
            for session in sessions.iter_mut() {
                match session.decrypt(&message) {
                    Ok(plaintext) => {
                        self.store.save_session(session)?;
                        return Ok(plaintext);
                    }
                    Err(e) => last_error = e,
                }
            }
            Err(last_error)
        }
    }

    /// Validate and dispatch the plaintext of a decrypted Olm message.
    fn handle_decrypted_olm(
        &mut self,
        sender: &str,
        sender_key: &str,
        mut plaintext: Vec<u8>,
    ) -> Option<DecryptedOlmEvent> {
        let parsed: std::result::Result<Value, _> = serde_json::from_slice(&plaintext);
        plaintext.zeroize();

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(sender, error = %e, "failed to parse decrypted olm JSON");
                return None;
            }
        };

        let pt_sender = parsed.get("sender").and_then(Value::as_str);
        let pt_recipient = parsed.get("recipient").and_then(Value::as_str);
        let pt_recipient_ed = parsed
            .get("recipient_keys")
            .and_then(|k| k.get("ed25519"))
            .and_then(Value::as_str);
        let pt_type = parsed.get("type").and_then(Value::as_str);

        let (Some(pt_sender), Some(pt_recipient), Some(pt_recipient_ed), Some(pt_type)) =
            (pt_sender, pt_recipient, pt_recipient_ed, pt_type)
        else {
            warn!(sender, "decrypted olm message is missing a required field");
            return None;
        };

        if pt_sender != sender {
            warn!(sender, pt_sender, "sender mismatch in decrypted olm message");
            return None;
        }
        if pt_recipient != self.user_id {
            warn!(pt_recipient, "recipient mismatch in decrypted olm message");
            return None;
        }
        if pt_recipient_ed != self.account.ed25519() {
            warn!("recipient key mismatch in decrypted olm message");
            return None;
        }

        let decrypted = DecryptedOlmEvent {
            sender: pt_sender.to_owned(),
            sender_key: sender_key.to_owned(),
            sender_device: parsed
                .get("sender_device")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            event_type: pt_type.to_owned(),
            content: parsed.get("content").cloned().unwrap_or(Value::Null),
        };

        if decrypted.event_type == "m.room_key" {
            self.receive_room_key(&decrypted);
        } else {
            debug!(
                event_type = %decrypted.event_type,
                sender, "unhandled decrypted to-device event"
            );
        }

        Some(decrypted)
    }

    /// Install a received `m.room_key` into the Megolm session index.
    fn receive_room_key(&mut self, event: &DecryptedOlmEvent) {
        let room_id = event.content.get("room_id").and_then(Value::as_str);
        let session_id = event.content.get("session_id").and_then(Value::as_str);
        let session_key = event.content.get("session_key").and_then(Value::as_str);
        let algorithm = event.content.get("algorithm").and_then(Value::as_str);

        let (Some(room_id), Some(session_id), Some(session_key)) =
            (room_id, session_id, session_key)
        else {
            warn!(sender = %event.sender, "malformed m.room_key event");
            return;
        };

        if algorithm != Some("m.megolm.v1.aes-sha2") {
            warn!(?algorithm, "unsupported algorithm in m.room_key event");
            return;
        }

        let session_key = match SessionKey::from_base64(session_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "undecodable session key in m.room_key event");
                return;
            }
        };

        let session = InboundGroupSession::new(&session_key, SessionConfig::version_1());
        if session.session_id() != session_id {
            warn!(session_id, "session id mismatch in m.room_key event");
            return;
        }

        let key = InboundGroupSessionKey {
            sender_key: event.sender_key.clone(),
            sender_id: event.sender.clone(),
            session_id: session_id.to_owned(),
            device_id: event.sender_device.clone().unwrap_or_default(),
        };

        info!(room_id, session_id, "received a new inbound group session");
        if let Err(e) = self.store.save_group_session(room_id, &key, &session) {
            warn!(error = %e, "failed to persist inbound group session");
        }
        self.group_sessions.insert(room_id, key, session);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::{json, Value};
    use vodozemac::megolm::{GroupSession, SessionConfig};

    use super::OlmMachine;
    use crate::account::Account;

    fn machine(dir: &std::path::Path) -> OlmMachine {
        let (machine, fresh) = OlmMachine::open(
            "@me:example.org",
            "DEVICEID",
            "https://example.org/",
            None,
            dir,
            "me@host",
        )
        .unwrap();
        assert!(fresh.is_some());
        machine
    }

    #[test]
    fn device_keys_are_signed_and_verifiable() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path());

        let device_keys = machine.device_keys().unwrap();
        assert_eq!(device_keys["user_id"], "@me:example.org");
        assert_eq!(device_keys["device_id"], "DEVICEID");
        assert_eq!(
            device_keys["algorithms"],
            json!(["m.olm.curve25519-aes-sha256", "m.megolm.v1.aes-sha"])
        );
        assert_eq!(
            device_keys["keys"]["curve25519:DEVICEID"],
            Value::from(machine.curve25519())
        );

        machine.verify_own_signature(&device_keys).unwrap();
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path());

        let mut device_keys = machine.device_keys().unwrap();
        device_keys["user_id"] = "@mallory:example.org".into();
        assert!(machine.verify_own_signature(&device_keys).is_err());
    }

    #[test]
    fn unsigned_is_excluded_from_the_signature() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path());

        let mut value = json!({ "key": "abc", "unsigned": { "age": 1 } });
        machine.sign_json(&mut value).unwrap();
        assert_eq!(value["unsigned"]["age"], 1);

        // Changing unsigned content must not invalidate the signature.
        value["unsigned"] = json!({ "age": 2 });
        machine.verify_own_signature(&value).unwrap();
    }

    #[test]
    fn low_key_counts_trigger_replenishment() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = machine(dir.path());

        let mut counts = HashMap::new();
        counts.insert("signed_curve25519".to_owned(), 10);

        let upload = machine.update_key_counts(&counts).unwrap();
        let keys = upload.as_object().unwrap();
        let expected = max_keys() / 2 - 10;
        assert_eq!(keys.len(), expected as usize);

        for (name, key) in keys {
            assert!(name.starts_with("signed_curve25519:"));
            assert!(key["key"].is_string());
            machine.verify_own_signature(key).unwrap();
        }
    }

    #[test]
    fn missing_counts_trigger_a_full_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = machine(dir.path());

        let upload = machine.update_key_counts(&HashMap::new()).unwrap();
        assert_eq!(
            upload.as_object().unwrap().len(),
            max_keys() as usize
        );
    }

    #[test]
    fn healthy_counts_trigger_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = machine(dir.path());

        let mut counts = HashMap::new();
        counts.insert("signed_curve25519".to_owned(), max_keys());
        assert!(machine.update_key_counts(&counts).is_none());
    }

    #[test]
    fn publishing_retires_the_uploaded_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = machine(dir.path());

        let mut counts = HashMap::new();
        counts.insert("signed_curve25519".to_owned(), 0);
        machine.update_key_counts(&counts).unwrap();

        let record = machine.mark_keys_published();
        assert_eq!(record.device_id, "DEVICEID");

        // All generated keys are now published, a healthy count stays quiet.
        counts.insert("signed_curve25519".to_owned(), max_keys());
        assert!(machine.update_key_counts(&counts).is_none());
    }

    /// The pool maximum is a property of the Olm implementation, read it
    /// off a scratch account.
    fn max_keys() -> u64 {
        Account::new().max_one_time_keys()
    }

    fn encrypted_to_device(
        sender: &str,
        sender_account: &Account,
        recipient: &OlmMachine,
        recipient_otk: &str,
        plaintext: &Value,
    ) -> Value {
        let (_, message) = sender_account
            .encrypt_outbound(
                &recipient.curve25519(),
                recipient_otk,
                &plaintext.to_string(),
            )
            .unwrap();
        let (message_type, body) = match message {
            vodozemac::olm::OlmMessage::PreKey(m) => (0, m.to_base64()),
            vodozemac::olm::OlmMessage::Normal(m) => (1, m.to_base64()),
        };

        json!({
            "type": "m.room.encrypted",
            "sender": sender,
            "content": {
                "algorithm": "m.olm.v1.curve25519-aes-sha2",
                "sender_key": sender_account.curve25519(),
                "ciphertext": {
                    (recipient.curve25519()): { "type": message_type, "body": body },
                },
            },
        })
    }

    fn room_key_plaintext(sender: &str, machine: &OlmMachine, session: &GroupSession) -> Value {
        json!({
            "sender": sender,
            "sender_device": "ALICEDEV",
            "recipient": "@me:example.org",
            "recipient_keys": { "ed25519": machine.ed25519() },
            "keys": { "ed25519": "irrelevant" },
            "type": "m.room_key",
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "room_id": "!r:h",
                "session_id": session.session_id(),
                "session_key": session.session_key().to_base64(),
            },
        })
    }

    #[test]
    fn room_keys_land_in_the_group_session_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = machine(dir.path());
        machine.update_key_counts(&HashMap::new()).unwrap();
        let (_, otk) = machine_account_otk(&machine);

        let alice = Account::new();
        let outbound = GroupSession::new(SessionConfig::version_1());
        let plaintext = room_key_plaintext("@alice:example.org", &machine, &outbound);
        let event =
            encrypted_to_device("@alice:example.org", &alice, &machine, &otk, &plaintext);

        let decrypted = machine.receive_to_device(&event).unwrap();
        assert_eq!(decrypted.event_type, "m.room_key");
        assert_eq!(machine.group_sessions().len("!r:h"), 1);
    }

    #[test]
    fn identity_mismatches_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = machine(dir.path());
        machine.update_key_counts(&HashMap::new()).unwrap();
        let (_, otk) = machine_account_otk(&machine);

        let alice = Account::new();
        let outbound = GroupSession::new(SessionConfig::version_1());
        let mut plaintext = room_key_plaintext("@alice:example.org", &machine, &outbound);
        plaintext["recipient"] = "@somebody-else:example.org".into();
        let event =
            encrypted_to_device("@alice:example.org", &alice, &machine, &otk, &plaintext);

        assert!(machine.receive_to_device(&event).is_none());
        assert_eq!(machine.group_sessions().len("!r:h"), 0);
    }

    #[test]
    fn ciphertext_for_other_devices_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = machine(dir.path());

        let event = json!({
            "type": "m.room.encrypted",
            "sender": "@alice:example.org",
            "content": {
                "algorithm": "m.olm.v1.curve25519-aes-sha2",
                "sender_key": "somekey",
                "ciphertext": { "someoneelse": { "type": 0, "body": "xx" } },
            },
        });

        assert!(machine.receive_to_device(&event).is_none());
    }

    fn machine_account_otk(machine: &OlmMachine) -> (String, String) {
        // The machine's own unpublished keys, for handing to a test peer.
        machine.account.one_time_keys().remove(0)
    }
}
