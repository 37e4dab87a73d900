use crate::error::Error;

/// 旧プロトコル (hixie-76) のバージョン番号
pub const LEGACY_VERSION: u32 = 0;

/// 接続終了の制御フレーム (FIN + close、ペイロードなし)
pub const CLOSE_FRAME: [u8; 2] = [0x88, 0x00];

/// 旧プロトコルの接続終了フレーム
pub const LEGACY_CLOSE_FRAME: [u8; 2] = [0xFF, 0x00];

/// 制御フレームのペイロード上限
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// 対応している WebSocket バージョンかどうか
pub fn is_supported_version(version: u32) -> bool {
    matches!(version, 0 | 7 | 8 | 13)
}

/// オペコード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// 制御フレームかどうか
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// WebSocket フレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub fin: bool,
    /// RSV1 (permessage-deflate で圧縮済み)
    pub compressed: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    /// 単独のテキストフレーム
    pub fn text(payload: Vec<u8>) -> Self {
        Self {
            opcode: Opcode::Text,
            fin: true,
            compressed: false,
            payload,
        }
    }

    /// 単独の制御フレーム
    pub fn control(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            fin: true,
            compressed: false,
            payload,
        }
    }
}

/// テキストフレームのヘッダーをエンコード
///
/// バージョン 7/8/13 では先頭バイトが `0x81`、圧縮時は `0xC1`。
/// 旧プロトコルでは開始バイト `0x00` のみ。
pub fn encode_header(version: u32, payload_len: usize, compressed: bool) -> Result<Vec<u8>, Error> {
    match version {
        LEGACY_VERSION => Ok(vec![0x00]),
        7 | 8 | 13 => {
            let first = if compressed { 0xC1 } else { 0x81 };
            Ok(length_header(first, payload_len))
        }
        _ => Err(Error::EncodingUnsupported { version }),
    }
}

/// テキストフレームをエンコード
///
/// サーバーからのフレームなのでマスクしない。
pub fn encode_text_frame(version: u32, payload: &[u8], compressed: bool) -> Result<Vec<u8>, Error> {
    let mut frame = encode_header(version, payload.len(), compressed)?;
    frame.reserve(payload.len() + 1);
    frame.extend_from_slice(payload);
    if version == LEGACY_VERSION {
        frame.push(0xFF);
    }
    Ok(frame)
}

/// 制御フレームをエンコード
pub fn encode_control_frame(version: u32, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, Error> {
    if !opcode.is_control() {
        return Err(Error::InvalidData(format!(
            "not a control opcode: {:?}",
            opcode
        )));
    }
    if payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(Error::InvalidData(format!(
            "control frame payload too long: {}",
            payload.len()
        )));
    }
    match version {
        LEGACY_VERSION if opcode == Opcode::Close => Ok(LEGACY_CLOSE_FRAME.to_vec()),
        LEGACY_VERSION => Err(Error::InvalidData(
            "legacy websocket has no ping/pong frames".to_string(),
        )),
        7 | 8 | 13 => {
            let mut frame = length_header(0x80 | opcode.as_u8(), payload.len());
            frame.extend_from_slice(payload);
            Ok(frame)
        }
        _ => Err(Error::EncodingUnsupported { version }),
    }
}

/// 接続終了フレームをエンコード
pub fn encode_close_frame(version: u32) -> Result<Vec<u8>, Error> {
    encode_control_frame(version, Opcode::Close, &[])
}

fn length_header(first: u8, payload_len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(10);
    header.push(first);
    if payload_len < 126 {
        header.push(payload_len as u8);
    } else if payload_len < 65536 {
        header.push(126);
        header.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        header.push(127);
        header.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }
    header
}

/// 受信フレームのデコーダー (Sans I/O)
///
/// クライアントからのマスク付きフレームも、マスクなしのフレームも受け付ける。
#[derive(Debug)]
pub struct FrameDecoder {
    version: u32,
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(version: u32, max_payload: usize) -> Result<Self, Error> {
        if !is_supported_version(version) {
            return Err(Error::EncodingUnsupported { version });
        }
        Ok(Self {
            version,
            buf: Vec::new(),
            max_payload,
        })
    }

    /// 受信データを追加
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// バッファ済みのバイト数
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// 未処理のバイトを取り出す
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// フレームを 1 つ取り出す。データ不足なら None
    pub fn decode(&mut self) -> Result<Option<Frame>, Error> {
        if self.version == LEGACY_VERSION {
            self.decode_legacy()
        } else {
            self.decode_rfc6455()
        }
    }

    fn decode_rfc6455(&mut self) -> Result<Option<Frame>, Error> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let b0 = self.buf[0];
        let b1 = self.buf[1];

        if b0 & 0x30 != 0 {
            return Err(Error::InvalidData("reserved frame bits set".to_string()));
        }
        let fin = b0 & 0x80 != 0;
        let compressed = b0 & 0x40 != 0;
        let opcode = Opcode::from_u8(b0 & 0x0F).ok_or_else(|| {
            Error::InvalidData(format!("unknown opcode: {:#x}", b0 & 0x0F))
        })?;
        let masked = b1 & 0x80 != 0;

        let (payload_len, mut offset) = match b1 & 0x7F {
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([self.buf[2], self.buf[3]])), 4)
            }
            127 => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.buf[2..10]);
                let len = u64::from_be_bytes(bytes);
                if len & (1 << 63) != 0 {
                    return Err(Error::InvalidData("frame length MSB set".to_string()));
                }
                (len, 10)
            }
            n => (u64::from(n), 2),
        };

        if opcode.is_control() && (payload_len > MAX_CONTROL_PAYLOAD as u64 || !fin) {
            return Err(Error::InvalidData(
                "control frame must be final and at most 125 bytes".to_string(),
            ));
        }
        if payload_len > self.max_payload as u64 {
            return Err(Error::SizeLimitExceeded {
                size: payload_len,
                limit: self.max_payload as u64,
            });
        }
        let payload_len = payload_len as usize;

        let mask = if masked {
            if self.buf.len() < offset + 4 {
                return Ok(None);
            }
            let key = [
                self.buf[offset],
                self.buf[offset + 1],
                self.buf[offset + 2],
                self.buf[offset + 3],
            ];
            offset += 4;
            Some(key)
        } else {
            None
        };

        let total = offset + payload_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mut payload = self.buf[offset..total].to_vec();
        if let Some(key) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }
        self.buf.drain(..total);

        Ok(Some(Frame {
            opcode,
            fin,
            compressed,
            payload,
        }))
    }

    fn decode_legacy(&mut self) -> Result<Option<Frame>, Error> {
        let Some(&first) = self.buf.first() else {
            return Ok(None);
        };
        match first {
            0x00 => match self.buf.iter().position(|&b| b == 0xFF) {
                Some(end) => {
                    let payload = self.buf[1..end].to_vec();
                    self.buf.drain(..=end);
                    Ok(Some(Frame::text(payload)))
                }
                None => {
                    let pending = self.buf.len() - 1;
                    if pending > self.max_payload {
                        return Err(Error::SizeLimitExceeded {
                            size: pending as u64,
                            limit: self.max_payload as u64,
                        });
                    }
                    Ok(None)
                }
            },
            0xFF => {
                if self.buf.len() < 2 {
                    return Ok(None);
                }
                if self.buf[1] != 0x00 {
                    return Err(Error::InvalidData(
                        "legacy length-prefixed frames are not supported".to_string(),
                    ));
                }
                self.buf.drain(..2);
                Ok(Some(Frame::control(Opcode::Close, Vec::new())))
            }
            b => Err(Error::InvalidData(format!(
                "unexpected legacy frame type: {:#x}",
                b
            ))),
        }
    }
}
