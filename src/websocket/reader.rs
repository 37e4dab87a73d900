use crate::compression::DeflateParams;
use crate::error::Error;

#[cfg(feature = "deflate")]
use crate::compression::DeflateDecompressor;
#[cfg(not(feature = "deflate"))]
use crate::compression::CompressionError;

use super::frame::{FrameDecoder, Opcode};

/// 受信メッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct Fragments {
    opcode: Opcode,
    compressed: bool,
    payload: Vec<u8>,
}

/// フレームからメッセージを組み立てる
///
/// 分割されたデータフレームを連結し、途中に挟まった制御フレームはそのまま返す。
/// RSV1 付きのメッセージは交渉済みのパラメーターで展開する。
#[derive(Debug)]
pub struct MessageReader {
    decoder: FrameDecoder,
    deflate: Option<DeflateParams>,
    #[cfg(feature = "deflate")]
    inflater: Option<DeflateDecompressor>,
    fragments: Option<Fragments>,
    max_message_size: usize,
}

impl MessageReader {
    pub fn new(
        version: u32,
        deflate: Option<DeflateParams>,
        max_message_size: usize,
    ) -> Result<Self, Error> {
        Ok(Self {
            decoder: FrameDecoder::new(version, max_message_size)?,
            deflate,
            #[cfg(feature = "deflate")]
            inflater: None,
            fragments: None,
            max_message_size,
        })
    }

    /// 受信データを追加
    pub fn feed(&mut self, data: &[u8]) {
        self.decoder.feed(data);
    }

    /// 未処理のバイトを取り出す
    pub fn take_remaining(&mut self) -> Vec<u8> {
        self.decoder.take_remaining()
    }

    /// 完成したメッセージを 1 つ取り出す。データ不足なら None
    pub fn next_message(&mut self) -> Result<Option<Message>, Error> {
        loop {
            let Some(frame) = self.decoder.decode()? else {
                return Ok(None);
            };

            if frame.opcode.is_control() {
                return Ok(Some(Message {
                    opcode: frame.opcode,
                    payload: frame.payload,
                }));
            }
            if frame.compressed && self.deflate.is_none() {
                return Err(Error::InvalidData(
                    "compressed frame without negotiated deflate".to_string(),
                ));
            }

            match (frame.opcode, self.fragments.as_mut()) {
                (Opcode::Continuation, Some(fragments)) => {
                    if frame.compressed {
                        return Err(Error::InvalidData(
                            "RSV1 set on continuation frame".to_string(),
                        ));
                    }
                    let size = fragments.payload.len() + frame.payload.len();
                    if size > self.max_message_size {
                        return Err(Error::SizeLimitExceeded {
                            size: size as u64,
                            limit: self.max_message_size as u64,
                        });
                    }
                    fragments.payload.extend_from_slice(&frame.payload);
                }
                (Opcode::Continuation, None) => {
                    return Err(Error::InvalidData(
                        "continuation frame without a message".to_string(),
                    ));
                }
                (_, Some(_)) => {
                    return Err(Error::InvalidData(
                        "new message before the previous one finished".to_string(),
                    ));
                }
                (opcode, None) => {
                    self.fragments = Some(Fragments {
                        opcode,
                        compressed: frame.compressed,
                        payload: frame.payload,
                    });
                }
            }

            if frame.fin {
                if let Some(fragments) = self.fragments.take() {
                    let payload = if fragments.compressed {
                        self.inflate(&fragments.payload)?
                    } else {
                        fragments.payload
                    };
                    return Ok(Some(Message {
                        opcode: fragments.opcode,
                        payload,
                    }));
                }
            }
        }
    }

    #[cfg(feature = "deflate")]
    fn inflate(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let params = self.deflate.unwrap_or_default();
        let inflater = self
            .inflater
            .get_or_insert_with(|| DeflateDecompressor::new(params));
        Ok(inflater.decompress_message(payload, self.max_message_size)?)
    }

    #[cfg(not(feature = "deflate"))]
    fn inflate(&mut self, _payload: &[u8]) -> Result<Vec<u8>, Error> {
        Err(Error::Compression(CompressionError::Unsupported))
    }
}
