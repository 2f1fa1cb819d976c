//! The encrypted container: buffered file streams with optional
//! AES-128-CBC + PKCS#7 and a running adler32 of all cleartext.
//!
//! # On-disk shape
//!
//! ```text
//! [ random IV block (16 B, only when a key is set) ]
//! <cleartext payload ...>
//! u32 LE  adler32 of all preceding cleartext   ← written by the producer
//! [ PKCS#7 padding to a block multiple, only when a key is set ]
//! ```
//!
//! The whole file, trailer included, is encrypted when a key is set; the
//! leading random-IV block makes equal plaintexts diverge from the first
//! ciphertext byte even under a fixed key and a zero initial IV. When no
//! key is set the same framing is used, blocks pass through unchanged and
//! no padding is applied; the adler32 trailer is still written and
//! checked.
//!
//! # Buffering rule
//!
//! The read buffer is strictly larger than one cipher block so the last
//! block read can be held back across a refill: only the block that turns
//! out to be the final block of the file is depadded. This predates AEAD;
//! an authenticated mode (GCM, SIV) would supersede both the padding and
//! the adler32 trailer in a future format version.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use adler2::Adler32;
use byteorder::{ByteOrder, LittleEndian};
use rand::RngCore;
use thiserror::Error;

use crate::encryption::{self, BLOCK_SIZE, IV_SIZE, KEY_SIZE};
use crate::encryption_key::EncryptionKey;
use crate::PAGE_SIZE;

#[derive(Error, Debug)]
pub enum Error {
    #[error("encrypted file data is corrupted")]
    Corrupted,
    #[error("size of the encrypted file is incorrect")]
    IncorrectFileSize,
    #[error(transparent)]
    BadPadding(#[from] encryption::BadPadding),
    #[error("adler32 mismatch")]
    AdlerMismatch,
    #[error("read failed")]
    ReadFailed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// ── OutputStream ─────────────────────────────────────────────────────────────

/// Buffered writing end of the container. `finish()` must be called to
/// flush the final (padded) block; dropping an unfinished stream leaves a
/// truncated file behind, which only ever happens to files under `tmp/`.
pub struct OutputStream {
    file:     File,
    key:      Option<[u8; KEY_SIZE]>,
    iv:       [u8; IV_SIZE],
    buffer:   Vec<u8>,
    used:     usize,
    adler:    Adler32,
}

impl OutputStream {
    /// Creates the output file. With no key set the output is not
    /// encrypted and `initial_iv` is ignored.
    pub fn create(path: &Path, key: &EncryptionKey, initial_iv: &[u8; IV_SIZE]) -> Result<Self> {
        Ok(Self {
            file:   File::create(path)?,
            key:    key.key().copied(),
            iv:     *initial_iv,
            buffer: vec![0u8; PAGE_SIZE],
            used:   0,
            adler:  Adler32::new(),
        })
    }

    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        self.adler.write_slice(data);
        while !data.is_empty() {
            let room = self.buffer.len() - self.used;
            let n = room.min(data.len());
            self.buffer[self.used..self.used + n].copy_from_slice(&data[..n]);
            self.used += n;
            data = &data[n..];
            if self.used == self.buffer.len() {
                self.flush_buffer()?;
            }
        }
        Ok(())
    }

    /// adler32 of all cleartext written so far.
    pub fn adler32(&self) -> u32 {
        self.adler.checksum()
    }

    /// Writes the current adler32 value to the stream (little-endian).
    pub fn write_adler32(&mut self) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, self.adler.checksum());
        self.write(&buf)
    }

    /// Writes one block of random bytes. Used right after opening, so
    /// that the zero initial IV never encrypts meaningful data directly.
    /// Does nothing when no key is set.
    pub fn write_random_iv(&mut self) -> Result<()> {
        if self.key.is_some() {
            let mut iv = [0u8; IV_SIZE];
            rand::thread_rng().fill_bytes(&mut iv);
            self.write(&iv)?;
        }
        Ok(())
    }

    /// Flushes the final block, applying PKCS#7 padding when a key is
    /// set, and closes the file.
    pub fn finish(mut self) -> Result<()> {
        let mut to_write = self.used;
        if self.key.is_some() {
            let partial = self.used % BLOCK_SIZE;
            let block_start = self.used - partial;
            // The buffer always has room: a completely full buffer was
            // flushed by the last write().
            encryption::pad(&mut self.buffer[block_start..block_start + BLOCK_SIZE], partial);
            to_write = block_start + BLOCK_SIZE;
        }
        if to_write > 0 {
            self.encrypt_and_write(to_write)?;
        }
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        let n = self.buffer.len();
        self.encrypt_and_write(n)?;
        self.used = 0;
        Ok(())
    }

    fn encrypt_and_write(&mut self, bytes: usize) -> Result<()> {
        if let Some(ref key) = self.key {
            debug_assert!(bytes > 0 && bytes % BLOCK_SIZE == 0);
            self.iv = encryption::encrypt(&self.iv, key, &mut self.buffer[..bytes]);
        }
        self.file.write_all(&self.buffer[..bytes])?;
        Ok(())
    }
}

// ── InputStream ──────────────────────────────────────────────────────────────

/// Buffered reading end of the container.
///
/// Internally this produces decrypted windows one refill at a time; the
/// last cipher block of a full buffer is held back (`remainder`) so that
/// PKCS#7 depadding is applied only to the true final block of the file.
pub struct InputStream {
    file:      File,
    key:       Option<[u8; KEY_SIZE]>,
    iv:        [u8; IV_SIZE],
    buffer:    Vec<u8>,
    start:     usize,
    fill:      usize,
    remainder: usize,
    backed_up: bool,
    produced:  u64,
    adler:     Adler32,
}

impl InputStream {
    /// Opens the input file. With no key set the input is not decrypted
    /// and `initial_iv` is ignored.
    pub fn open(path: &Path, key: &EncryptionKey, initial_iv: &[u8; IV_SIZE]) -> Result<Self> {
        let file = File::open(path)?;
        if key.has_key() {
            let size = file.metadata()?.len();
            // Padding means the size must be a non-zero block multiple.
            if size == 0 || size % BLOCK_SIZE as u64 != 0 {
                return Err(Error::IncorrectFileSize);
            }
        }
        Ok(Self {
            file,
            key:       key.key().copied(),
            iv:        *initial_iv,
            buffer:    vec![0u8; PAGE_SIZE.max(BLOCK_SIZE * 2)],
            start:     0,
            fill:      0,
            remainder: 0,
            backed_up: false,
            produced:  0,
            adler:     Adler32::new(),
        })
    }

    /// Traditional read; fails with `ReadFailed` if the stream ends
    /// before `buf` is filled.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            if !self.next()? {
                return Err(Error::ReadFailed);
            }
            let window = &self.buffer[self.start..self.start + self.fill];
            let needed = buf.len() - written;
            if window.len() > needed {
                buf[written..].copy_from_slice(&window[..needed]);
                let excess = window.len() - needed;
                self.back_up(excess);
                written = buf.len();
            } else {
                buf[written..written + window.len()].copy_from_slice(window);
                written += window.len();
            }
        }
        Ok(())
    }

    /// Skips `count` bytes. The data is still read and decrypted, since both
    /// the CBC state and the adler32 depend on it. Returns false if the
    /// stream ended first.
    pub fn skip(&mut self, mut count: usize) -> Result<bool> {
        while count > 0 {
            if !self.next()? {
                return Ok(false);
            }
            if self.fill > count {
                let excess = self.fill - count;
                self.back_up(excess);
                return Ok(true);
            }
            count -= self.fill;
        }
        Ok(true)
    }

    /// adler32 of all data consumed so far. Makes any pending window
    /// impossible to back up further.
    pub fn adler32(&mut self) -> u32 {
        self.back_up(0);
        self.adler.checksum()
    }

    /// Reads a little-endian adler32 trailer and compares it with the
    /// running value over everything consumed before it.
    pub fn check_adler32(&mut self) -> Result<()> {
        let ours = self.adler32();
        let mut buf = [0u8; 4];
        self.read(&mut buf)?;
        if ours != LittleEndian::read_u32(&buf) {
            return Err(Error::AdlerMismatch);
        }
        Ok(())
    }

    /// Reads and discards one IV-sized block: the random IV written by
    /// [`OutputStream::write_random_iv`]. Does nothing when no key is set.
    pub fn consume_random_iv(&mut self) -> Result<()> {
        if self.key.is_some() {
            let mut iv = [0u8; IV_SIZE];
            self.read(&mut iv)?;
        }
        Ok(())
    }

    /// Reads everything up to end-of-file, treating the final four bytes
    /// as the adler32 trailer: verifies it against all cleartext before
    /// it and returns that cleartext.
    pub fn read_rest_verified(&mut self) -> Result<Vec<u8>> {
        // Normalize so the running adler covers exactly the bytes
        // consumed before this call.
        self.back_up(0);
        let mut base = self.adler.clone();

        let mut out = Vec::new();
        while self.next()? {
            out.extend_from_slice(&self.buffer[self.start..self.start + self.fill]);
        }
        if out.len() < 4 {
            return Err(Error::Corrupted);
        }
        let trailer = out.split_off(out.len() - 4);
        base.write_slice(&out);
        if base.checksum() != LittleEndian::read_u32(&trailer) {
            return Err(Error::AdlerMismatch);
        }
        Ok(out)
    }

    // ── Window machinery ─────────────────────────────────────────────────────

    /// Advances to the next decrypted window (`self.start`/`self.fill`).
    /// Returns false at end of stream.
    fn next(&mut self) -> Result<bool> {
        if self.backed_up {
            self.backed_up = false;
        } else {
            // The previous window counts as consumed now.
            self.adler
                .write_slice(&self.buffer[self.start..self.start + self.fill]);

            // Once a full buffer has been read there is always a held-back
            // remainder; none means the previous refill hit end of file.
            if self.produced > 0 && self.remainder == 0 {
                self.fill = 0;
                return Ok(false);
            }

            // Move the held-back bytes to the front and refill after them.
            let rem_start = self.start + self.fill;
            self.buffer.copy_within(rem_start..rem_start + self.remainder, 0);
            self.start = 0;
            let rem = self.remainder;
            let read = read_up_to(&mut self.file, &mut self.buffer[rem..])?;
            self.fill = read + rem;
            self.decrypt_window()?;
        }
        self.produced += self.fill as u64;
        Ok(self.fill > 0)
    }

    /// Returns the trailing `count` bytes of the current window
    /// unconsumed; the consumed prefix enters the adler32.
    fn back_up(&mut self, count: usize) {
        if !self.backed_up {
            debug_assert!(count <= self.fill, "backing up too much");
            let consumed = self.fill - count;
            self.adler
                .write_slice(&self.buffer[self.start..self.start + consumed]);
            self.start += consumed;
            self.fill = count;
            self.produced -= count as u64;
            self.backed_up = self.fill > 0;
        } else {
            debug_assert!(count == 0, "backing up after being backed up already");
        }
    }

    fn decrypt_window(&mut self) -> Result<()> {
        if self.fill == self.buffer.len() {
            // Full buffer: set the last block aside. It may turn out to
            // be the padded final block of the file, which is handled the
            // next time around.
            self.remainder = BLOCK_SIZE;
            self.fill -= BLOCK_SIZE;
            self.do_decrypt()?;
        } else {
            // End of file: the last block carries the padding.
            self.do_decrypt()?;
            if self.key.is_some() && self.fill > 0 {
                let last = self.start + self.fill - BLOCK_SIZE;
                let payload = encryption::unpad(&self.buffer[last..last + BLOCK_SIZE])?;
                self.fill -= BLOCK_SIZE - payload;
            }
            self.remainder = 0;
        }
        Ok(())
    }

    fn do_decrypt(&mut self) -> Result<()> {
        let key = match self.key {
            Some(ref k) => *k,
            None => return Ok(()),
        };
        // The size was validated at open, but the file can change while
        // being read.
        if self.fill == 0 || self.fill % BLOCK_SIZE != 0 {
            return Err(Error::IncorrectFileSize);
        }
        let window = &mut self.buffer[self.start..self.start + self.fill];
        // The next IV is the last ciphertext block; take it before the
        // in-place decryption overwrites it.
        let next_iv = encryption::next_decryption_iv(window);
        encryption::decrypt(&self.iv, &key, window);
        self.iv = next_iv;
        Ok(())
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
