//! flate2 による permessage-deflate 実装

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::{
    CHUNK_SIZE, CompressionError, CompressionStatus, Compressor, DeflateParams, Decompressor,
    SYNC_FLUSH_TAIL,
};

/// 送信メッセージの圧縮器
///
/// ヘッダーなしの raw deflate を使い、メッセージ単位で同期フラッシュする。
/// 接続の間は同じ辞書を使い続け、context takeover なしの場合はメッセージごとにリセットする。
pub struct DeflateCompressor {
    inner: Compress,
    params: DeflateParams,
}

impl std::fmt::Debug for DeflateCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateCompressor")
            .field("params", &self.params)
            .field("total_in", &self.inner.total_in())
            .finish()
    }
}

impl DeflateCompressor {
    pub fn new(params: DeflateParams) -> Self {
        let params = params.normalized();
        Self {
            inner: Compress::new_with_window_bits(
                Compression::default(),
                false,
                params.server_window_bits,
            ),
            params,
        }
    }

    /// 1 メッセージ分を圧縮する
    ///
    /// 16KB 単位で出力を取り出し、末尾の `00 00 FF FF` を取り除いて返す。
    pub fn compress_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut offset = 0;

        loop {
            let status = self.compress(&payload[offset..], &mut chunk)?;
            offset += status.consumed();
            out.extend_from_slice(&chunk[..status.produced()]);
            if status.is_complete() {
                break;
            }
        }

        if !self.params.server_context_takeover {
            self.reset();
        }

        if out.is_empty() {
            return Err(CompressionError::NoOutput);
        }
        if out.ends_with(&SYNC_FLUSH_TAIL) {
            out.truncate(out.len() - SYNC_FLUSH_TAIL.len());
        }
        Ok(out)
    }
}

impl Compressor for DeflateCompressor {
    fn compress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<CompressionStatus, CompressionError> {
        let flush = if self.params.server_context_takeover {
            FlushCompress::Sync
        } else {
            FlushCompress::Full
        };

        let before_in = self.inner.total_in();
        let before_out = self.inner.total_out();
        self.inner
            .compress(input, output, flush)
            .map_err(|e| CompressionError::Internal(e.to_string()))?;
        let consumed = (self.inner.total_in() - before_in) as usize;
        let produced = (self.inner.total_out() - before_out) as usize;

        // 出力に空きが残っていればフラッシュは完了している
        if consumed == input.len() && produced < output.len() {
            Ok(CompressionStatus::Complete { consumed, produced })
        } else {
            Ok(CompressionStatus::OutputFull { consumed, produced })
        }
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// 受信メッセージの展開器
pub struct DeflateDecompressor {
    inner: Decompress,
    params: DeflateParams,
}

impl std::fmt::Debug for DeflateDecompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateDecompressor")
            .field("params", &self.params)
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

impl DeflateDecompressor {
    pub fn new(params: DeflateParams) -> Self {
        let params = params.normalized();
        Self {
            inner: Decompress::new_with_window_bits(false, params.client_window_bits),
            params,
        }
    }

    /// 1 メッセージ分を展開する
    ///
    /// 送信側が取り除いた `00 00 FF FF` を補ってから展開する。
    /// 展開後のサイズが `limit` を超えたらエラー。
    pub fn decompress_message(
        &mut self,
        payload: &[u8],
        limit: usize,
    ) -> Result<Vec<u8>, CompressionError> {
        let mut input = Vec::with_capacity(payload.len() + SYNC_FLUSH_TAIL.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&SYNC_FLUSH_TAIL);

        let mut out = Vec::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut offset = 0;

        loop {
            let status = self.decompress(&input[offset..], &mut chunk)?;
            offset += status.consumed();
            out.extend_from_slice(&chunk[..status.produced()]);
            if out.len() > limit {
                return Err(CompressionError::OutputTooLarge {
                    size: out.len(),
                    limit,
                });
            }
            if status.is_complete() {
                break;
            }
            if !status.is_output_full() && offset == input.len() {
                break;
            }
            if status.consumed() == 0 && status.produced() == 0 {
                return Err(CompressionError::InvalidData(
                    "inflate made no progress".to_string(),
                ));
            }
        }

        if !self.params.client_context_takeover {
            self.reset();
        }
        Ok(out)
    }
}

impl Decompressor for DeflateDecompressor {
    fn decompress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<CompressionStatus, CompressionError> {
        let before_in = self.inner.total_in();
        let before_out = self.inner.total_out();
        let status = self
            .inner
            .decompress(input, output, FlushDecompress::Sync)
            .map_err(|e| CompressionError::InvalidData(e.to_string()))?;
        let consumed = (self.inner.total_in() - before_in) as usize;
        let produced = (self.inner.total_out() - before_out) as usize;

        if status == Status::StreamEnd {
            Ok(CompressionStatus::Complete { consumed, produced })
        } else if produced == output.len() {
            Ok(CompressionStatus::OutputFull { consumed, produced })
        } else {
            Ok(CompressionStatus::Continue { consumed, produced })
        }
    }

    fn reset(&mut self) {
        self.inner.reset(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(takeover: bool) -> DeflateParams {
        DeflateParams {
            server_context_takeover: takeover,
            client_context_takeover: takeover,
            ..DeflateParams::default()
        }
    }

    #[test]
    fn test_compress_strips_sync_tail() {
        let mut compressor = DeflateCompressor::new(params(true));
        let out = compressor.compress_message(b"Hello").unwrap();
        assert!(!out.is_empty());
        assert!(!out.ends_with(&SYNC_FLUSH_TAIL));

        let mut decompressor = DeflateDecompressor::new(params(true));
        let plain = decompressor.decompress_message(&out, 1024).unwrap();
        assert_eq!(plain, b"Hello");
    }

    #[test]
    fn test_rfc7692_hello_sample() {
        // RFC 7692 Section 7.2.3.1
        let compressed = [0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00];
        let mut decompressor = DeflateDecompressor::new(DeflateParams::default());
        let plain = decompressor.decompress_message(&compressed, 1024).unwrap();
        assert_eq!(plain, b"Hello");
    }

    #[test]
    fn test_context_takeover_shrinks_repeated_message() {
        let mut compressor = DeflateCompressor::new(params(true));
        let first = compressor.compress_message(b"Hello Hello Hello").unwrap();
        let second = compressor.compress_message(b"Hello Hello Hello").unwrap();
        assert!(second.len() < first.len());

        let mut decompressor = DeflateDecompressor::new(params(true));
        assert_eq!(
            decompressor.decompress_message(&first, 1024).unwrap(),
            b"Hello Hello Hello"
        );
        assert_eq!(
            decompressor.decompress_message(&second, 1024).unwrap(),
            b"Hello Hello Hello"
        );
    }

    #[test]
    fn test_no_context_takeover_is_stateless() {
        let mut compressor = DeflateCompressor::new(params(false));
        let first = compressor.compress_message(b"abcabcabc").unwrap();
        let second = compressor.compress_message(b"abcabcabc").unwrap();
        assert_eq!(first, second);

        // 新しい展開器でも 2 通目を単独で展開できる
        let mut decompressor = DeflateDecompressor::new(params(false));
        assert_eq!(
            decompressor.decompress_message(&second, 1024).unwrap(),
            b"abcabcabc"
        );
    }

    #[test]
    fn test_large_message_spans_chunks() {
        let payload: Vec<u8> = (0..200_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let mut compressor = DeflateCompressor::new(params(true));
        let out = compressor.compress_message(&payload).unwrap();
        assert!(out.len() > CHUNK_SIZE);

        let mut decompressor = DeflateDecompressor::new(params(true));
        let plain = decompressor.decompress_message(&out, payload.len()).unwrap();
        assert_eq!(plain, payload);
    }

    #[test]
    fn test_out_of_range_window_bits_are_clamped() {
        for bits in [0u8, 8, 16, 200] {
            let params = DeflateParams {
                server_window_bits: bits,
                client_window_bits: bits,
                ..DeflateParams::default()
            };
            let mut compressor = DeflateCompressor::new(params);
            let out = compressor.compress_message(b"hello hello").unwrap();

            let mut decompressor = DeflateDecompressor::new(params);
            assert_eq!(
                decompressor.decompress_message(&out, 1024).unwrap(),
                b"hello hello"
            );
        }
    }

    #[test]
    fn test_inflate_limit() {
        let payload = vec![b'a'; 10_000];
        let mut compressor = DeflateCompressor::new(params(true));
        let out = compressor.compress_message(&payload).unwrap();

        let mut decompressor = DeflateDecompressor::new(params(true));
        assert!(matches!(
            decompressor.decompress_message(&out, 100),
            Err(CompressionError::OutputTooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_input_is_rejected() {
        let mut decompressor = DeflateDecompressor::new(DeflateParams::default());
        assert!(decompressor
            .decompress_message(&[0xff, 0xff, 0xff, 0xff, 0xff], 1024)
            .is_err());
    }
}
