//! Streaming AES-256-CBC with PKCS#7 padding
//!
//! [`EncryptingReader`] wraps the plaintext source of an upload and yields
//! ciphertext; [`DecryptingWriter`] wraps the destination of a download and
//! accepts ciphertext. Both hold at most one read chunk in memory.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{SymmetricKey, BLOCK_SIZE};
use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Plaintext read per refill
const CHUNK_SIZE: usize = 64 * 1024;

/// Length of the ciphertext produced for `plain_len` bytes of plaintext
pub fn ciphertext_len(plain_len: u64) -> u64 {
    (plain_len / BLOCK_SIZE as u64 + 1) * BLOCK_SIZE as u64
}

/// Reader yielding the CBC encryption of an inner plaintext reader
pub struct EncryptingReader<R> {
    inner: R,
    cipher: Aes256CbcEnc,
    /// Plaintext not yet forming a whole block
    pending: Vec<u8>,
    /// Ciphertext ready to hand out
    out: Vec<u8>,
    out_pos: usize,
    scratch: Vec<u8>,
    finished: bool,
}

impl<R> EncryptingReader<R> {
    pub fn new(inner: R, key: &SymmetricKey) -> Result<Self> {
        let (key, iv) = key.cbc_params()?;
        let cipher = Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|e| Error::Encryption(format!("Failed to create cipher: {}", e)))?;

        Ok(Self {
            inner,
            cipher,
            pending: Vec::with_capacity(BLOCK_SIZE),
            out: Vec::new(),
            out_pos: 0,
            scratch: vec![0u8; CHUNK_SIZE],
            finished: false,
        })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EncryptingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.out_pos < this.out.len() {
                let n = (this.out.len() - this.out_pos).min(buf.remaining());
                buf.put_slice(&this.out[this.out_pos..this.out_pos + n]);
                this.out_pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.finished {
                return Poll::Ready(Ok(()));
            }

            let mut scratch = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut scratch))?;
            let filled = scratch.filled();
            if filled.is_empty() {
                // pending is always shorter than a block here
                let pad = BLOCK_SIZE - this.pending.len();
                this.pending.resize(BLOCK_SIZE, pad as u8);
                this.finished = true;
            } else {
                this.pending.extend_from_slice(filled);
            }

            let whole = this.pending.len() - this.pending.len() % BLOCK_SIZE;
            this.out.clear();
            this.out.extend(this.pending.drain(..whole));
            this.out_pos = 0;
            for block in this.out.chunks_exact_mut(BLOCK_SIZE) {
                this.cipher
                    .encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
    }
}

/// Writer decrypting CBC ciphertext into an inner writer
///
/// The last ciphertext block is held back until shutdown, where the PKCS#7
/// padding is checked and removed. Shutdown must be called to emit it.
pub struct DecryptingWriter<W> {
    inner: W,
    cipher: Aes256CbcDec,
    /// Ciphertext not yet decrypted
    pending: Vec<u8>,
    /// Plaintext waiting to be written to `inner`
    out: Vec<u8>,
    out_pos: usize,
    finished: bool,
}

impl<W> DecryptingWriter<W> {
    pub fn new(inner: W, key: &SymmetricKey) -> Result<Self> {
        let (key, iv) = key.cbc_params()?;
        let cipher = Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| Error::Decryption(format!("Failed to create cipher: {}", e)))?;

        Ok(Self {
            inner,
            cipher,
            pending: Vec::with_capacity(BLOCK_SIZE * 2),
            out: Vec::new(),
            out_pos: 0,
            finished: false,
        })
    }

    fn decrypt_blocks(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

impl<W: AsyncWrite + Unpin> DecryptingWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.out_pos < self.out.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.out[self.out_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.out_pos += n;
        }
        self.out.clear();
        self.out_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DecryptingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                "write after shutdown",
            )));
        }
        ready!(this.poll_drain(cx))?;

        this.pending.extend_from_slice(buf);
        if this.pending.len() > BLOCK_SIZE {
            let keep = match this.pending.len() % BLOCK_SIZE {
                0 => BLOCK_SIZE,
                rem => rem,
            };
            let whole = this.pending.len() - keep;
            let mut blocks: Vec<u8> = this.pending.drain(..whole).collect();
            this.decrypt_blocks(&mut blocks);
            this.out = blocks;
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.finished {
            ready!(this.poll_drain(cx))?;
            if this.pending.len() != BLOCK_SIZE {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "ciphertext is not a whole number of blocks",
                )));
            }

            let mut last = std::mem::take(&mut this.pending);
            this.decrypt_blocks(&mut last);
            let pad = last[BLOCK_SIZE - 1] as usize;
            if pad == 0 || pad > BLOCK_SIZE || last[BLOCK_SIZE - pad..].iter().any(|&b| b as usize != pad) {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "bad padding",
                )));
            }
            last.truncate(BLOCK_SIZE - pad);
            this.out = last;
            this.finished = true;
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
