//! On-disk messages and their framing.
//!
//! Every structured record in the repository is a protobuf message
//! preceded by its varint byte length. Header records, bundle metadata,
//! index records, backup descriptors and the instruction stream all use
//! the same framing. Messages are declared with prost derives; the field
//! tags are frozen and never reused.

use prost::Message;
use thiserror::Error;

use crate::encrypted_file::{InputStream, OutputStream};

#[derive(Error, Debug)]
pub enum Error {
    #[error("can't parse message: {0}")]
    CantParse(#[from] prost::DecodeError),
    #[error("message length {0} is not plausible")]
    BadLength(u64),
    #[error(transparent)]
    File(#[from] crate::encrypted_file::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Upper bound on a single framed message. Instruction streams and
/// backup data can be large; anything beyond this is corruption.
const MAX_MESSAGE_SIZE: u64 = 1 << 30;

// ── Messages ─────────────────────────────────────────────────────────────────

/// Leading record of every repository file; carries the format version.
#[derive(Clone, PartialEq, Message)]
pub struct FileHeader {
    #[prost(uint32, tag = "1")]
    pub version: u32,
}

/// Key material stored in the plaintext `info` file.
#[derive(Clone, PartialEq, Message)]
pub struct EncryptionKeyInfo {
    #[prost(bytes = "vec", tag = "1")]
    pub salt: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub rounds: u32,
    /// The 128-bit data-encryption key, AES-ECB-wrapped with the
    /// password-derived key.
    #[prost(bytes = "vec", tag = "3")]
    pub encrypted_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub key_check_input: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub key_check_hmac: Vec<u8>,
}

/// Storage descriptor, readable without a password (`info`).
#[derive(Clone, PartialEq, Message)]
pub struct StorageInfo {
    #[prost(uint32, tag = "1")]
    pub chunk_max_size: u32,
    #[prost(uint32, tag = "2")]
    pub bundle_max_payload_size: u32,
    #[prost(message, optional, tag = "3")]
    pub encryption_key: Option<EncryptionKeyInfo>,
    #[prost(string, tag = "4")]
    pub default_compression_method: String,
}

/// Extended configuration, stored encrypted (`info_extended`).
#[derive(Clone, PartialEq, Message)]
pub struct ExtendedStorageInfo {
    #[prost(uint32, tag = "1")]
    pub chunk_max_size: u32,
    #[prost(uint32, tag = "2")]
    pub bundle_max_payload_size: u32,
    #[prost(string, tag = "3")]
    pub compression_method: String,
    /// Literal runs shorter than this are inlined into the backup
    /// instead of becoming chunks.
    #[prost(uint32, tag = "4")]
    pub small_literal_threshold: u32,
}

/// Header of a bundle file: format version and the compression method
/// the payload was encoded with.
#[derive(Clone, PartialEq, Message)]
pub struct BundleFileHeader {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub compression_method: String,
}

/// One chunk inside a bundle: its 24-byte id and payload size.
#[derive(Clone, PartialEq, Message)]
pub struct ChunkRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub size: u32,
}

/// Ordered list of the chunks a bundle holds.
#[derive(Clone, PartialEq, Message)]
pub struct BundleInfo {
    #[prost(message, repeated, tag = "1")]
    pub chunk_record: Vec<ChunkRecord>,
}

/// Per-bundle record header in an index file. An absent id terminates
/// the record sequence.
#[derive(Clone, PartialEq, Message)]
pub struct IndexBundleHeader {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub id: Option<Vec<u8>>,
}

/// One step of a backup: emit a stored chunk or emit inline bytes.
/// Exactly one field is set per record.
#[derive(Clone, PartialEq, Message)]
pub struct BackupInstruction {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub chunk_to_emit: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub bytes_to_emit: Option<Vec<u8>>,
}

/// The user-facing backup descriptor.
#[derive(Clone, PartialEq, Message)]
pub struct BackupInfo {
    /// SHA-256 of the original stream.
    #[prost(bytes = "vec", tag = "1")]
    pub sha256: Vec<u8>,
    /// Length of the original stream in bytes.
    #[prost(uint64, tag = "2")]
    pub size: u64,
    /// Number of self-compression rounds applied to `backup_data`.
    #[prost(uint32, tag = "3")]
    pub iterations: u32,
    /// The (possibly iterated) instruction stream.
    #[prost(bytes = "vec", tag = "4")]
    pub backup_data: Vec<u8>,
    /// Elapsed whole seconds the backup took to create.
    #[prost(uint64, tag = "5")]
    pub time: u64,
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// Serializes a length-delimited message into a container stream.
pub fn serialize<M: Message>(message: &M, stream: &mut OutputStream) -> Result<()> {
    let buf = message.encode_length_delimited_to_vec();
    stream.write(&buf)?;
    Ok(())
}

/// Reads and parses a length-delimited message from a container stream.
pub fn parse<M: Message + Default>(stream: &mut InputStream) -> Result<M> {
    let len = read_varint(stream)?;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::BadLength(len));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read(&mut buf)?;
    Ok(M::decode(buf.as_slice())?)
}

/// Appends a length-delimited message to an in-memory stream.
pub fn append<M: Message>(message: &M, out: &mut Vec<u8>) {
    out.extend_from_slice(&message.encode_length_delimited_to_vec());
}

fn read_varint(stream: &mut InputStream) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        stream.read(&mut byte)?;
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::BadLength(u64::MAX));
        }
    }
}

/// Iterator over the length-delimited [`BackupInstruction`] records of
/// an in-memory instruction stream.
pub struct InstructionIter<'a> {
    data: &'a [u8],
}

impl<'a> InstructionIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl Iterator for InstructionIter<'_> {
    type Item = Result<BackupInstruction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        match BackupInstruction::decode_length_delimited(&mut self.data) {
            Ok(instr) => Some(Ok(instr)),
            Err(e) => {
                self.data = &[];
                Some(Err(e.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_stream_round_trip() {
        let mut stream = Vec::new();
        append(
            &BackupInstruction { chunk_to_emit: Some(vec![1u8; 24]), bytes_to_emit: None },
            &mut stream,
        );
        append(
            &BackupInstruction { chunk_to_emit: None, bytes_to_emit: Some(b"raw".to_vec()) },
            &mut stream,
        );

        let decoded: Vec<BackupInstruction> =
            InstructionIter::new(&stream).collect::<Result<_>>().unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].chunk_to_emit.as_deref(), Some(&[1u8; 24][..]));
        assert_eq!(decoded[1].bytes_to_emit.as_deref(), Some(&b"raw"[..]));
    }

    #[test]
    fn absent_and_empty_ids_are_distinct() {
        // The index terminator relies on "no id" being distinguishable
        // from any real record.
        let sentinel = IndexBundleHeader { id: None };
        let real = IndexBundleHeader { id: Some(vec![0u8; 24]) };
        let sentinel_bytes = sentinel.encode_length_delimited_to_vec();
        let real_bytes = real.encode_length_delimited_to_vec();
        assert_ne!(sentinel_bytes, real_bytes);
        let parsed = IndexBundleHeader::decode_length_delimited(&sentinel_bytes[..]).unwrap();
        assert!(parsed.id.is_none());
    }
}
