//! Repository key material.
//!
//! The password never touches the data: PBKDF2-HMAC-SHA1 over a stored
//! salt derives a key-encryption key, which unwraps the actual 128-bit
//! data-encryption key (a single AES-ECB block). An HMAC-SHA1 of a
//! stored random input, keyed by the unwrapped key, proves the password
//! was right before anything else is decrypted.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use thiserror::Error;

use crate::encryption;
use crate::proto::EncryptionKeyInfo;

/// PBKDF2 rounds used for newly generated key material.
pub const DEFAULT_ROUNDS: u32 = 10000;

const SALT_SIZE: usize = 16;
const CHECK_INPUT_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid password specified")]
    InvalidPassword,
    #[error("malformed encryption key material in storage info")]
    MalformedKeyInfo,
}

/// An unlocked (or absent) data-encryption key.
pub struct EncryptionKey {
    key: Option<[u8; encryption::KEY_SIZE]>,
}

impl Clone for EncryptionKey {
    fn clone(&self) -> Self {
        Self { key: self.key }
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        // Clear the key from memory.
        if let Some(ref mut k) = self.key {
            k.fill(0);
        }
    }
}

impl EncryptionKey {
    /// A key object without any key set; streams pass through unchanged.
    pub fn none() -> Self {
        Self { key: None }
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn key(&self) -> Option<&[u8; encryption::KEY_SIZE]> {
        self.key.as_ref()
    }

    /// Unlock the data-encryption key with the given password. With no
    /// key info the password is ignored and no key is set.
    pub fn unlock(password: &str, info: Option<&EncryptionKeyInfo>) -> Result<Self, Error> {
        let info = match info {
            Some(info) => info,
            None => return Ok(Self::none()),
        };

        if info.encrypted_key.len() != encryption::BLOCK_SIZE {
            return Err(Error::MalformedKeyInfo);
        }

        let kek = derive_key(password, &info.salt, info.rounds);

        let mut key = [0u8; encryption::KEY_SIZE];
        key.copy_from_slice(&info.encrypted_key);
        encryption::decrypt_block_ecb(&kek, &mut key);

        if calculate_key_hmac(&key, &info.key_check_input) != info.key_check_hmac {
            return Err(Error::InvalidPassword);
        }

        Ok(Self { key: Some(key) })
    }

    /// Generate fresh key material protected by `password`. Returns the
    /// storable info together with the unlocked key.
    pub fn generate(password: &str) -> (EncryptionKeyInfo, Self) {
        let mut rng = rand::thread_rng();

        let mut salt = vec![0u8; SALT_SIZE];
        rng.fill_bytes(&mut salt);

        let kek = derive_key(password, &salt, DEFAULT_ROUNDS);

        let mut key = [0u8; encryption::KEY_SIZE];
        rng.fill_bytes(&mut key);

        let mut check_input = vec![0u8; CHECK_INPUT_SIZE];
        rng.fill_bytes(&mut check_input);
        let check_hmac = calculate_key_hmac(&key, &check_input);

        let mut encrypted_key = key;
        encryption::encrypt_block_ecb(&kek, &mut encrypted_key);

        let info = EncryptionKeyInfo {
            salt,
            rounds: DEFAULT_ROUNDS,
            encrypted_key: encrypted_key.to_vec(),
            key_check_input: check_input,
            key_check_hmac: check_hmac,
        };

        (info, Self { key: Some(key) })
    }
}

fn derive_key(password: &str, salt: &[u8], rounds: u32) -> [u8; encryption::KEY_SIZE] {
    let mut kek = [0u8; encryption::KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, rounds, &mut kek);
    kek
}

fn calculate_key_hmac(key: &[u8; encryption::KEY_SIZE], input: &[u8]) -> Vec<u8> {
    let mut mac =
        <Hmac<Sha1> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(input);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_unlock() {
        let (info, key) = EncryptionKey::generate("correct horse");
        let unlocked = EncryptionKey::unlock("correct horse", Some(&info)).unwrap();
        assert_eq!(key.key(), unlocked.key());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let (info, _) = EncryptionKey::generate("alpha");
        assert!(matches!(
            EncryptionKey::unlock("beta", Some(&info)),
            Err(Error::InvalidPassword)
        ));
    }

    #[test]
    fn no_info_means_no_key() {
        let key = EncryptionKey::unlock("ignored", None).unwrap();
        assert!(!key.has_key());
    }
}
