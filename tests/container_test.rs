//! Round-trip and corruption-detection tests for the encrypted
//! container streams.

use std::fs;
use std::path::Path;

use proptest::prelude::*;
use tempfile::TempDir;

use bitstash::encrypted_file::{Error, InputStream, OutputStream};
use bitstash::encryption::ZERO_IV;
use bitstash::encryption_key::EncryptionKey;

fn write_payload(path: &Path, key: &EncryptionKey, payload: &[u8]) {
    let mut os = OutputStream::create(path, key, &ZERO_IV).unwrap();
    os.write_random_iv().unwrap();
    os.write(payload).unwrap();
    os.write_adler32().unwrap();
    os.finish().unwrap();
}

fn read_payload(path: &Path, key: &EncryptionKey, len: usize) -> Result<Vec<u8>, Error> {
    let mut is = InputStream::open(path, key, &ZERO_IV)?;
    is.consume_random_iv()?;
    let mut buf = vec![0u8; len];
    is.read(&mut buf)?;
    is.check_adler32()?;
    Ok(buf)
}

#[test]
fn empty_payload_round_trips() {
    let dir = TempDir::new().unwrap();
    for key in [EncryptionKey::none(), EncryptionKey::generate("pw").1] {
        let path = dir.path().join("f");
        let _ = fs::remove_file(&path);
        write_payload(&path, &key, b"");
        assert_eq!(read_payload(&path, &key, 0).unwrap(), b"");
    }
}

#[test]
fn various_sizes_round_trip() {
    let dir = TempDir::new().unwrap();
    let (_, key) = EncryptionKey::generate("pw");

    // Sizes around block and buffer boundaries are where the held-back
    // remainder logic can go wrong.
    for size in [1usize, 15, 16, 17, 31, 32, 4080, 4092, 4096, 4100, 8192, 100_000] {
        let payload: Vec<u8> = (0..size).map(|x| (x * 31 % 251) as u8).collect();
        let path = dir.path().join(format!("f{size}"));
        write_payload(&path, &key, &payload);
        assert_eq!(read_payload(&path, &key, size).unwrap(), payload, "size {size}");
    }
}

#[test]
fn equal_plaintexts_have_distinct_ciphertexts() {
    let dir = TempDir::new().unwrap();
    let (_, key) = EncryptionKey::generate("pw");

    let a = dir.path().join("a");
    let b = dir.path().join("b");
    write_payload(&a, &key, b"identical content");
    write_payload(&b, &key, b"identical content");

    // The random IV block makes the files diverge from the start.
    assert_ne!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
}

#[test]
fn skip_keeps_cipher_and_checksum_state() {
    let dir = TempDir::new().unwrap();
    let (_, key) = EncryptionKey::generate("pw");
    let payload: Vec<u8> = (0..10_000u32).map(|x| (x % 256) as u8).collect();
    let path = dir.path().join("f");
    write_payload(&path, &key, &payload);

    let mut is = InputStream::open(&path, &key, &ZERO_IV).unwrap();
    is.consume_random_iv().unwrap();
    assert!(is.skip(6000).unwrap());
    let mut tail = vec![0u8; 4000];
    is.read(&mut tail).unwrap();
    assert_eq!(tail, payload[6000..]);
    is.check_adler32().unwrap();
}

#[test]
fn wrong_size_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (_, key) = EncryptionKey::generate("pw");
    let path = dir.path().join("f");
    write_payload(&path, &key, b"some bytes");

    let mut raw = fs::read(&path).unwrap();
    raw.pop(); // no longer a multiple of the block size
    fs::write(&path, &raw).unwrap();

    assert!(matches!(
        InputStream::open(&path, &key, &ZERO_IV),
        Err(Error::IncorrectFileSize)
    ));
}

#[test]
fn read_rest_verified_returns_payload() {
    let dir = TempDir::new().unwrap();
    let (_, key) = EncryptionKey::generate("pw");
    let path = dir.path().join("f");

    let head = b"head part";
    let tail: Vec<u8> = (0..33_000u32).map(|x| (x * 7 % 256) as u8).collect();

    let mut os = OutputStream::create(&path, &key, &ZERO_IV).unwrap();
    os.write_random_iv().unwrap();
    os.write(head).unwrap();
    os.write_adler32().unwrap();
    os.write(&tail).unwrap();
    os.write_adler32().unwrap();
    os.finish().unwrap();

    let mut is = InputStream::open(&path, &key, &ZERO_IV).unwrap();
    is.consume_random_iv().unwrap();
    let mut buf = vec![0u8; head.len()];
    is.read(&mut buf).unwrap();
    is.check_adler32().unwrap();
    assert_eq!(is.read_rest_verified().unwrap(), tail);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    // Any payload, any key: what is written comes back, and any single
    // bit flip in the file is detected.
    #[test]
    fn container_round_trip_and_corruption(
        payload in proptest::collection::vec(any::<u8>(), 0..20_000),
        encrypted in any::<bool>(),
        flip_at in any::<proptest::sample::Index>(),
    ) {
        let dir = TempDir::new().unwrap();
        let key = if encrypted {
            EncryptionKey::generate("pw").1
        } else {
            EncryptionKey::none()
        };
        let path = dir.path().join("f");
        write_payload(&path, &key, &payload);

        prop_assert_eq!(read_payload(&path, &key, payload.len()).unwrap(), payload.clone());

        // Corrupt one bit and expect the read to fail one way or
        // another (bad padding, adler mismatch, or garbled framing).
        let mut raw = fs::read(&path).unwrap();
        let at = flip_at.index(raw.len());
        raw[at] ^= 1;
        fs::write(&path, &raw).unwrap();

        let result = read_payload(&path, &key, payload.len());
        prop_assert!(result.is_err());
    }
}
