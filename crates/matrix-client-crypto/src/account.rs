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

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use vodozemac::olm::{AccountPickle, OlmMessage, PreKeyMessage, SessionConfig};
use vodozemac::Curve25519PublicKey;

use crate::error::{CryptoError, Result};
use crate::sessions::Session;

/// The persisted form of an [`Account`].
///
/// The device id and homeserver are stored alongside the pickle as sanity
/// checks: a pickle restored onto the wrong device or server is refused.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredAccount {
    /// The device the account belongs to.
    pub device_id: String,
    /// The homeserver the account was created against.
    pub server: String,
    /// The encrypted account pickle.
    pub pickle: String,
}

/// Our underlying Olm account, holding the device's identity keys and
/// unpublished one-time keys.
pub struct Account {
    inner: vodozemac::olm::Account,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("curve25519", &self.curve25519())
            .finish_non_exhaustive()
    }
}

impl Default for Account {
    fn default() -> Self {
        Self::new()
    }
}

impl Account {
    /// Create a fresh account with new identity keys.
    pub fn new() -> Self {
        Account { inner: vodozemac::olm::Account::new() }
    }

    /// Restore an account from its stored record.
    ///
    /// Refuses the record when it was written for another device or
    /// homeserver.
    pub fn restore(stored: &StoredAccount, device_id: &str, server: &str) -> Result<Self> {
        if stored.device_id != device_id || stored.server != server {
            return Err(CryptoError::AccountMismatch);
        }

        let pickle = AccountPickle::from_encrypted(&stored.pickle, &pickle_key(device_id, server))?;
        debug!("restored the Olm account from its pickle");

        Ok(Account { inner: vodozemac::olm::Account::from_pickle(pickle) })
    }

    /// Produce the stored record for this account.
    pub fn store(&self, device_id: &str, server: &str) -> StoredAccount {
        StoredAccount {
            device_id: device_id.to_owned(),
            server: server.to_owned(),
            pickle: self.inner.pickle().encrypt(&pickle_key(device_id, server)),
        }
    }

    /// The base64 form of our curve25519 identity key.
    pub fn curve25519(&self) -> String {
        self.inner.identity_keys().curve25519.to_base64()
    }

    /// The base64 form of our ed25519 signing key.
    pub fn ed25519(&self) -> String {
        self.inner.identity_keys().ed25519.to_base64()
    }

    /// Sign a message with the account's ed25519 key, returning the base64
    /// signature.
    pub fn sign(&self, message: &str) -> String {
        self.inner.sign(message).to_base64()
    }

    /// The maximum number of one-time keys the account can hold.
    pub fn max_one_time_keys(&self) -> u64 {
        self.inner.max_number_of_one_time_keys() as u64
    }

    /// Generate `count` fresh one-time keys.
    pub fn generate_one_time_keys(&mut self, count: u64) {
        self.inner.generate_one_time_keys(count as usize);
    }

    /// The unpublished one-time keys as `(key id, key)` base64 pairs.
    pub fn one_time_keys(&self) -> Vec<(String, String)> {
        self.inner
            .one_time_keys()
            .into_iter()
            .map(|(key_id, key)| (key_id.to_base64(), key.to_base64()))
            .collect()
    }

    /// Mark the current one-time keys as published to the server.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Create an inbound Olm session from a pre-key message.
    ///
    /// The one-time key the message used is consumed from the account.
    /// Returns the new session and the decrypted plaintext of the message.
    pub fn create_inbound_session(
        &mut self,
        sender_key: &str,
        message: &PreKeyMessage,
    ) -> Result<(Session, Vec<u8>)> {
        let their_key = Curve25519PublicKey::from_base64(sender_key)?;
        let result = self.inner.create_inbound_session(their_key, message)?;

        Ok((
            Session::new(result.session, sender_key.to_owned()),
            result.plaintext,
        ))
    }

    /// Encrypt a plaintext to the given session's peer. Test helper used to
    /// drive the inbound paths.
    #[doc(hidden)]
    pub fn encrypt_outbound(
        &self,
        their_identity_key: &str,
        their_one_time_key: &str,
        plaintext: &str,
    ) -> Result<(vodozemac::olm::Session, OlmMessage)> {
        let identity = Curve25519PublicKey::from_base64(their_identity_key)?;
        let one_time = Curve25519PublicKey::from_base64(their_one_time_key)?;
        let mut session =
            self.inner
                .create_outbound_session(SessionConfig::version_1(), identity, one_time);
        let message = session.encrypt(plaintext);
        Ok((session, message))
    }
}

/// Derive the key protecting pickles for this account.
///
/// The host exposes no secret to protect the pickle with, so the key is
/// bound to the account coordinates instead.
pub(crate) fn pickle_key(device_id: &str, server: &str) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, format!("{device_id}|{server}").as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(b"matrix-client-olm-pickle", &mut key)
        .expect("32 bytes is a valid hkdf output length");
    key
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{Account, StoredAccount};
    use crate::error::CryptoError;

    #[test]
    fn accounts_survive_a_pickle_round_trip() {
        let account = Account::new();
        let stored = account.store("DEVICEID", "https://example.org/");

        let restored = Account::restore(&stored, "DEVICEID", "https://example.org/").unwrap();
        assert_eq!(account.curve25519(), restored.curve25519());
        assert_eq!(account.ed25519(), restored.ed25519());
    }

    #[test]
    fn mismatched_records_are_refused() {
        let account = Account::new();
        let stored = account.store("DEVICEID", "https://example.org/");

        let err = Account::restore(&stored, "OTHERDEVICE", "https://example.org/").unwrap_err();
        assert_matches!(err, CryptoError::AccountMismatch);

        let err = Account::restore(&stored, "DEVICEID", "https://other.example/").unwrap_err();
        assert_matches!(err, CryptoError::AccountMismatch);
    }

    #[test]
    fn tampered_pickles_fail_to_decrypt() {
        let account = Account::new();
        let mut stored = account.store("DEVICEID", "https://example.org/");
        stored.pickle = "not a pickle".to_owned();

        let err = Account::restore(&stored, "DEVICEID", "https://example.org/").unwrap_err();
        assert_matches!(err, CryptoError::Pickle(_));
    }

    #[test]
    fn one_time_keys_are_enumerable_until_published() {
        let mut account = Account::new();
        assert!(account.one_time_keys().is_empty());

        account.generate_one_time_keys(3);
        assert_eq!(account.one_time_keys().len(), 3);

        account.mark_keys_as_published();
        assert!(account.one_time_keys().is_empty());
    }

    #[test]
    fn stored_record_serializes_with_its_sanity_fields() {
        let stored = StoredAccount {
            device_id: "DEV".into(),
            server: "https://example.org/".into(),
            pickle: "blob".into(),
        };
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["device_id"], "DEV");
        assert_eq!(json["server"], "https://example.org/");
        assert_eq!(json["pickle"], "blob");
    }
}
