//! AES-128-CBC block primitives with PKCS#7 padding.
//!
//! The container format fixes AES-128 in CBC mode; the chaining is done
//! here over the raw block cipher because the container needs the next
//! IV handed back across buffer boundaries (the last ciphertext block of
//! one buffer seeds the first block of the next). No cipher negotiation
//! exists in the format.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use thiserror::Error;

/// Size of the key in bytes.
pub const KEY_SIZE: usize = 16;
/// Size of the IV in bytes.
pub const IV_SIZE: usize = 16;
/// Cipher block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// The IV consisting of zero bytes. Used where no IV applies.
pub const ZERO_IV: [u8; IV_SIZE] = [0u8; IV_SIZE];

#[derive(Error, Debug)]
#[error("bad padding encountered")]
pub struct BadPadding;

/// Encrypt `data` in place with CBC over AES-128. `data.len()` must be a
/// multiple of [`BLOCK_SIZE`]. Returns the IV to continue encrypting
/// with, which in CBC is the last ciphertext block.
pub fn encrypt(iv: &[u8; IV_SIZE], key: &[u8; KEY_SIZE], data: &mut [u8]) -> [u8; IV_SIZE] {
    debug_assert!(data.len() % BLOCK_SIZE == 0, "size must be a block multiple");

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut prev = *iv;

    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        let ga = GenericArray::from_mut_slice(block);
        cipher.encrypt_block(ga);
        prev.copy_from_slice(block);
    }

    prev
}

/// The IV that decrypts the data following `data`, which in CBC is the
/// last ciphertext block. Must be taken before an in-place decryption
/// overwrites it.
pub fn next_decryption_iv(data: &[u8]) -> [u8; IV_SIZE] {
    debug_assert!(data.len() >= BLOCK_SIZE && data.len() % BLOCK_SIZE == 0);
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&data[data.len() - BLOCK_SIZE..]);
    iv
}

/// The reverse of [`encrypt`], in place.
pub fn decrypt(iv: &[u8; IV_SIZE], key: &[u8; KEY_SIZE], data: &mut [u8]) {
    debug_assert!(data.len() % BLOCK_SIZE == 0, "size must be a block multiple");

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut prev = *iv;

    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        let cur: [u8; BLOCK_SIZE] = (&*block).try_into().unwrap();
        let ga = GenericArray::from_mut_slice(block);
        cipher.decrypt_block(ga);
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        prev = cur;
    }
}

/// Encrypt a single 16-byte block with the raw cipher (ECB). Used only
/// to wrap the 128-bit data-encryption key.
pub fn encrypt_block_ecb(key: &[u8; KEY_SIZE], block: &mut [u8; BLOCK_SIZE]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

/// The reverse of [`encrypt_block_ecb`].
pub fn decrypt_block_ecb(key: &[u8; KEY_SIZE], block: &mut [u8; BLOCK_SIZE]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cipher.decrypt_block(GenericArray::from_mut_slice(block));
}

/// PKCS#7: pad the final partial block. `data` holds `size` payload
/// bytes (`size < BLOCK_SIZE`) and must have room for a full block; the
/// remaining bytes are filled with the pad value.
pub fn pad(data: &mut [u8], size: usize) {
    debug_assert!(size < BLOCK_SIZE, "size to pad is too large: {size}");
    let v = (BLOCK_SIZE - size) as u8;
    for b in data[size..BLOCK_SIZE].iter_mut() {
        *b = v;
    }
}

/// PKCS#7: returns the payload size of a padded final block. The data is
/// unchanged; use its first bytes.
pub fn unpad(data: &[u8]) -> Result<usize, BadPadding> {
    debug_assert!(data.len() >= BLOCK_SIZE);
    let block = &data[..BLOCK_SIZE];
    let v = block[BLOCK_SIZE - 1];
    if v == 0 || v as usize > BLOCK_SIZE {
        return Err(BadPadding);
    }
    // Every pad byte must carry the pad value.
    for &b in &block[BLOCK_SIZE - v as usize..] {
        if b != v {
            return Err(BadPadding);
        }
    }
    Ok(BLOCK_SIZE - v as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_SIZE] = *b"0123456789abcdef";

    #[test]
    fn cbc_round_trip_with_iv_chaining() {
        let mut data = [0u8; 64];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let original = data;

        // Encrypt in two runs, chaining the IV across them.
        let iv = encrypt(&ZERO_IV, &KEY, &mut data[..32]);
        encrypt(&iv, &KEY, &mut data[32..]);

        // Decrypt in two runs the same way.
        let iv = next_decryption_iv(&data[..32]);
        decrypt(&ZERO_IV, &KEY, &mut data[..32]);
        decrypt(&iv, &KEY, &mut data[32..]);

        assert_eq!(data, original);
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let mut data = [7u8; 32];
        encrypt(&ZERO_IV, &KEY, &mut data);
        assert_ne!(data, [7u8; 32]);
        // CBC: equal plaintext blocks produce distinct ciphertext blocks.
        assert_ne!(&data[..16], &data[16..]);
    }

    #[test]
    fn ecb_block_round_trip() {
        let mut block = *b"sixteen byte blk";
        let original = block;
        encrypt_block_ecb(&KEY, &mut block);
        assert_ne!(block, original);
        decrypt_block_ecb(&KEY, &mut block);
        assert_eq!(block, original);
    }

    #[test]
    fn pad_unpad_round_trip() {
        for size in 0..BLOCK_SIZE {
            let mut block = [0xAAu8; BLOCK_SIZE];
            pad(&mut block, size);
            assert_eq!(unpad(&block).unwrap(), size);
        }
    }

    #[test]
    fn unpad_rejects_garbage() {
        assert!(unpad(&[0u8; BLOCK_SIZE]).is_err()); // pad value 0
        let mut block = [17u8; BLOCK_SIZE];
        block[BLOCK_SIZE - 1] = 17; // > BLOCK_SIZE
        assert!(unpad(&block).is_err());
        let mut block = [0u8; BLOCK_SIZE];
        block[BLOCK_SIZE - 1] = 3;
        block[BLOCK_SIZE - 2] = 3;
        block[BLOCK_SIZE - 3] = 4; // inconsistent pad byte
        assert!(unpad(&block).is_err());
    }
}
