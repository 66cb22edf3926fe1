//! Streaming stripe and reconstruct over async byte streams

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::code::{ErasureCode, ReedSolomonCode};
use super::MAX_STRIPES;
use crate::error::{Error, Result};

/// Number of bytes each stripe receives when an input shorter than
/// `logical_end` is striped with `k` data stripes.
pub fn stripe_len(logical_end: u64, data_stripes: usize, packet_size: usize) -> u64 {
    let block = (data_stripes * packet_size) as u64;
    let rounds = logical_end.div_ceil(block).max(1);
    rounds * packet_size as u64
}

/// Splits one stream into N stripes and rebuilds it from any K of them.
///
/// Holds no state between calls beyond the code itself; buffers live for
/// one call and never exceed one round (`n * packet_size`).
pub struct Striper {
    code: Box<dyn ErasureCode>,
    packet_size: usize,
}

impl Striper {
    /// Create a striper backed by Reed-Solomon
    pub fn new(data_stripes: usize, total_stripes: usize, packet_size: usize) -> Result<Self> {
        let code = ReedSolomonCode::new(data_stripes, total_stripes)?;
        Self::with_code(Box::new(code), packet_size)
    }

    /// Create a striper over any K-of-N code
    pub fn with_code(code: Box<dyn ErasureCode>, packet_size: usize) -> Result<Self> {
        if packet_size == 0 {
            return Err(Error::InvalidErasureConfig(
                "packet_size must be greater than 0".to_string(),
            ));
        }
        let (k, n) = (code.data_shards(), code.total_shards());
        if k == 0 || n < k || n > MAX_STRIPES {
            return Err(Error::InvalidErasureConfig(format!(
                "invalid stripe counts k={} n={}",
                k, n
            )));
        }
        Ok(Self { code, packet_size })
    }

    pub fn data_stripes(&self) -> usize {
        self.code.data_shards()
    }

    pub fn total_stripes(&self) -> usize {
        self.code.total_shards()
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Bytes of source consumed per round
    pub fn block_size(&self) -> usize {
        self.data_stripes() * self.packet_size
    }

    /// Encode `input` onto `outputs`, one packet per stripe per round.
    ///
    /// Rounds continue, zero-padded, until the padded size reaches
    /// `logical_end`. Returns the pad bytes used (`logical_end` minus the
    /// bytes read from `input`).
    pub async fn stripe<R, W>(&self, input: &mut R, outputs: &mut [W], logical_end: u64) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let k = self.data_stripes();
        let n = self.total_stripes();
        let packet = self.packet_size;
        let block_len = self.block_size();

        if outputs.len() != n {
            return Err(Error::InvalidErasureConfig(format!(
                "expected {} output stripes, got {}",
                n,
                outputs.len()
            )));
        }

        let mut block = vec![0u8; block_len];
        let mut shards = vec![vec![0u8; packet]; n];
        let mut consumed: u64 = 0;
        let mut rounds: u64 = 0;
        let mut eof = false;

        loop {
            let read = if eof { 0 } else { read_full(input, &mut block).await? };
            consumed += read as u64;
            if consumed > logical_end {
                return Err(Error::StripeOverrun { limit: logical_end });
            }
            if read < block_len {
                eof = true;
                block[read..].fill(0);
            }

            for (i, shard) in shards.iter_mut().take(k).enumerate() {
                shard.copy_from_slice(&block[i * packet..(i + 1) * packet]);
            }
            self.code.encode(&mut shards)?;

            for (shard, output) in shards.iter().zip(outputs.iter_mut()) {
                output.write_all(shard).await?;
            }
            rounds += 1;

            if rounds * block_len as u64 >= logical_end {
                if eof {
                    break;
                }
                // Input filled the last round exactly; anything further overruns
                if consumed == logical_end {
                    let mut probe = [0u8; 1];
                    if input.read(&mut probe).await? > 0 {
                        return Err(Error::StripeOverrun { limit: logical_end });
                    }
                    break;
                }
            }
        }

        debug!(
            "Striped {} bytes into {} rounds across {} stripes (k={})",
            consumed, rounds, n, k
        );
        Ok(logical_end - consumed)
    }

    /// Rebuild `target_len` bytes from the present stripes into `output`.
    ///
    /// Absent stripes are `None` and never read. Fails before touching any
    /// stream when fewer than K stripes are present. A stripe that ends
    /// mid-round is reported as [`Error::UnexpectedEof`].
    pub async fn construct<R, W>(
        &self,
        inputs: &mut [Option<R>],
        output: &mut W,
        target_len: u64,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let k = self.data_stripes();
        let n = self.total_stripes();
        let packet = self.packet_size;
        let block_len = self.block_size() as u64;

        if inputs.len() != n {
            return Err(Error::InvalidErasureConfig(format!(
                "expected {} input stripes, got {}",
                n,
                inputs.len()
            )));
        }

        let available = inputs.iter().filter(|s| s.is_some()).count();
        if available < k {
            return Err(Error::InsufficientStripes {
                available,
                required: k,
            });
        }

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; n];
        let mut written: u64 = 0;

        while written < target_len {
            for (index, (slot, input)) in shards.iter_mut().zip(inputs.iter_mut()).enumerate() {
                let Some(reader) = input else {
                    *slot = None;
                    continue;
                };
                let mut buf = slot.take().unwrap_or_default();
                buf.resize(packet, 0);
                reader.read_exact(&mut buf).await.map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => Error::UnexpectedEof {
                        stripe: index,
                        written,
                    },
                    _ => Error::Io(e),
                })?;
                *slot = Some(buf);
            }

            self.code.reconstruct(&mut shards)?;

            let take = (target_len - written).min(block_len) as usize;
            let mut remaining = take;
            for shard in shards.iter().take(k) {
                let data = shard.as_deref().ok_or_else(|| {
                    Error::ErasureDecode("data packet missing after reconstruction".to_string())
                })?;
                let len = remaining.min(packet);
                output.write_all(&data[..len]).await?;
                remaining -= len;
                if remaining == 0 {
                    break;
                }
            }
            written += take as u64;
        }

        output.flush().await?;
        Ok(written)
    }
}

/// Fill `buf` from `input` until full or end of stream
async fn read_full<R: AsyncRead + Unpin>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let num = input.read(&mut buf[filled..]).await?;
        if num == 0 {
            break;
        }
        filled += num;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn stripe_all(striper: &Striper, data: &[u8], end: u64) -> (Vec<Vec<u8>>, u64) {
        let mut outputs = vec![Vec::new(); striper.total_stripes()];
        let mut input = Cursor::new(data.to_vec());
        let pad = striper.stripe(&mut input, &mut outputs, end).await.unwrap();
        (outputs, pad)
    }

    fn readers(stripes: &[Vec<u8>], keep: &[bool]) -> Vec<Option<Cursor<Vec<u8>>>> {
        stripes
            .iter()
            .zip(keep)
            .map(|(s, k)| k.then(|| Cursor::new(s.clone())))
            .collect()
    }

    #[test]
    fn test_stripe_len() {
        // 1 MiB plus pad, 5-of-7 at 10 KiB packets
        assert_eq!(stripe_len(1048576 + 256, 5, 10240), 215040);
        assert_eq!(stripe_len(0, 5, 10240), 10240);
        assert_eq!(stripe_len(100, 2, 64), 64);
        assert_eq!(stripe_len(129, 2, 64), 128);
    }

    #[tokio::test]
    async fn test_roundtrip_all_present() {
        let striper = Striper::new(3, 5, 64).unwrap();
        let data = sample(1000);
        let end = data.len() as u64 + 16;

        let (stripes, pad) = stripe_all(&striper, &data, end).await;
        assert_eq!(pad, 16);
        for s in &stripes {
            assert_eq!(s.len() as u64, stripe_len(end, 3, 64));
        }

        let mut inputs = readers(&stripes, &[true; 5]);
        let mut out = Vec::new();
        let written = striper
            .construct(&mut inputs, &mut out, data.len() as u64)
            .await
            .unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_every_k_subset_reconstructs() {
        let striper = Striper::new(3, 5, 32).unwrap();
        let data = sample(777);
        let (stripes, _) = stripe_all(&striper, &data, 800).await;

        for mask in 0u32..32 {
            if mask.count_ones() < 3 {
                continue;
            }
            let keep: Vec<bool> = (0..5).map(|i| mask & (1 << i) != 0).collect();
            let mut inputs = readers(&stripes, &keep);
            let mut out = Vec::new();
            striper
                .construct(&mut inputs, &mut out, data.len() as u64)
                .await
                .unwrap();
            assert_eq!(out, data, "failed for mask {:05b}", mask);
        }
    }

    #[tokio::test]
    async fn test_insufficient_stripes_writes_nothing() {
        let striper = Striper::new(3, 5, 32).unwrap();
        let data = sample(300);
        let (stripes, _) = stripe_all(&striper, &data, 320).await;

        let mut inputs = readers(&stripes, &[true, false, false, true, false]);
        let mut out = Vec::new();
        let err = striper
            .construct(&mut inputs, &mut out, data.len() as u64)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientStripes { available: 2, required: 3 }
        ));
        assert!(out.is_empty());
        // untouched readers are still at the start
        assert_eq!(inputs[0].as_ref().unwrap().position(), 0);
    }

    #[tokio::test]
    async fn test_zero_length_input() {
        let striper = Striper::new(2, 3, 16).unwrap();
        let (stripes, pad) = stripe_all(&striper, &[], 0).await;
        assert_eq!(pad, 0);
        for s in &stripes {
            assert_eq!(s.len(), 16);
        }

        let mut inputs = readers(&stripes, &[true; 3]);
        let mut out = Vec::new();
        let written = striper.construct(&mut inputs, &mut out, 0).await.unwrap();
        assert_eq!(written, 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_padding_spans_extra_rounds() {
        let striper = Striper::new(2, 3, 8).unwrap();
        let data = sample(10);
        // 10 bytes of data padded to 50 needs four 16-byte rounds
        let (stripes, pad) = stripe_all(&striper, &data, 50).await;
        assert_eq!(pad, 40);
        assert_eq!(stripes[0].len(), 32);

        let mut inputs = readers(&stripes, &[false, true, true]);
        let mut out = Vec::new();
        striper.construct(&mut inputs, &mut out, 10).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_short_stripe_is_unexpected_eof() {
        let striper = Striper::new(2, 3, 16).unwrap();
        let data = sample(100);
        let (mut stripes, _) = stripe_all(&striper, &data, 120).await;
        let len = stripes[1].len();
        stripes[1].truncate(len - 5);

        let mut inputs = readers(&stripes, &[true; 3]);
        let mut out = Vec::new();
        let err = striper
            .construct(&mut inputs, &mut out, data.len() as u64)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof { stripe: 1, .. }));
    }

    #[tokio::test]
    async fn test_input_longer_than_logical_end() {
        let striper = Striper::new(2, 3, 16).unwrap();
        let mut outputs = vec![Vec::new(); 3];
        let mut input = Cursor::new(sample(100));
        let err = striper.stripe(&mut input, &mut outputs, 50).await.unwrap_err();
        assert!(matches!(err, Error::StripeOverrun { limit: 50 }));
    }

    #[tokio::test]
    async fn test_input_ending_on_round_boundary() {
        let striper = Striper::new(2, 3, 16).unwrap();
        for rounds in 1..=3usize {
            let data = sample(rounds * 32);
            let end = data.len() as u64;
            let (stripes, pad) = stripe_all(&striper, &data, end).await;
            assert_eq!(pad, 0);
            for s in &stripes {
                assert_eq!(s.len() as u64, stripe_len(end, 2, 16));
            }

            let mut inputs = readers(&stripes, &[true, false, true]);
            let mut out = Vec::new();
            striper.construct(&mut inputs, &mut out, end).await.unwrap();
            assert_eq!(out, data);
        }
    }

    #[tokio::test]
    async fn test_overrun_past_round_boundary() {
        let striper = Striper::new(2, 3, 16).unwrap();
        let mut outputs = vec![Vec::new(); 3];
        let mut input = Cursor::new(sample(33));
        let err = striper.stripe(&mut input, &mut outputs, 32).await.unwrap_err();
        assert!(matches!(err, Error::StripeOverrun { limit: 32 }));
    }

    #[tokio::test]
    async fn test_no_parity_stripes() {
        let striper = Striper::new(2, 2, 16).unwrap();
        let data = sample(70);
        let (stripes, _) = stripe_all(&striper, &data, 80).await;

        let mut inputs = readers(&stripes, &[true, true]);
        let mut out = Vec::new();
        striper.construct(&mut inputs, &mut out, 70).await.unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(Striper::new(0, 3, 16).is_err());
        assert!(Striper::new(4, 3, 16).is_err());
        assert!(Striper::new(2, 3, 0).is_err());
    }
}
