//! WebSocket フレーミング (RFC 6455 / 旧プロトコル)
//!
//! バージョン 7/8/13 の RFC 6455 形式と、`0x00 ... 0xFF` で区切る旧プロトコルに対応する。
//! サーバーからの送信フレームはマスクしない。
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_transport::websocket::{MessageReader, Opcode, encode_text_frame};
//!
//! // 送信: FIN + text
//! let frame = encode_text_frame(13, b"hi", false)?;
//! assert_eq!(frame, [0x81, 0x02, 0x68, 0x69]);
//!
//! // 受信: フレームを組み立ててメッセージにする
//! let mut reader = MessageReader::new(13, None, 1024)?;
//! reader.feed(&frame);
//! let message = reader.next_message()?.unwrap();
//! assert_eq!(message.opcode, Opcode::Text);
//! assert_eq!(message.payload, b"hi");
//! # Ok::<(), shiguredo_transport::Error>(())
//! ```

mod frame;
mod handshake;
mod reader;

pub use frame::{
    CLOSE_FRAME, Frame, FrameDecoder, LEGACY_CLOSE_FRAME, LEGACY_VERSION, MAX_CONTROL_PAYLOAD,
    Opcode, encode_close_frame, encode_control_frame, encode_header, encode_text_frame,
    is_supported_version,
};
pub use handshake::{
    LEGACY_KEY3_LEN, LEGACY_NONCE_LEN, WEBSOCKET_GUID, accept_key, encode_switching_protocols,
    legacy_challenge,
};
pub use reader::{Message, MessageReader};
