//! # shiguredo_transport
//!
//! HTTP/1.x と WebSocket の接続単位トランスポートエンジン (Sans I/O)
//!
//! ## 特徴
//!
//! - **Sans I/O**: ソケットを持たず、実行すべき処理を [`Action`] として返す
//! - **ボディの上限管理**: 大きなボディは一時ファイルへ退避し、サイクル終了時に削除する
//! - **multipart/form-data**: チャンク境界に依存しないストリーミングデコード
//! - **WebSocket**: RFC 6455 (7/8/13) と旧プロトコル、permessage-deflate に対応
//!
//! ## 使い方
//!
//! ### リクエストボディの受信とディスパッチ
//!
//! ```rust
//! use shiguredo_transport::{
//!     Action, ConnectionScheme, ReceiveState, Reply, RequestDescriptor, TransportLimits,
//! };
//!
//! let request = RequestDescriptor::new("POST", "/")
//!     .content_type("application/x-www-form-urlencoded")
//!     .content_length(3);
//! let mut reply = Reply::new(request, TransportLimits::default(), ConnectionScheme::Http);
//!
//! // 受信したボディを順に渡す
//! reply.consume_body(b"a=1", ReceiveState::Complete);
//! assert!(matches!(reply.poll_action(), Some(Action::Dispatch)));
//! assert_eq!(reply.form().parameters.first("a"), Some("1"));
//! ```
//!
//! ### WebSocket フレームの送信
//!
//! ```rust
//! use shiguredo_transport::websocket::encode_text_frame;
//!
//! let frame = encode_text_frame(13, b"hi", false)?;
//! assert_eq!(frame, [0x81, 0x02, 0x68, 0x69]);
//! # Ok::<(), shiguredo_transport::Error>(())
//! ```

mod body_store;
pub mod compression;
mod error;
pub mod form;
mod limits;
pub mod multipart;
mod reply;
mod request;
mod response;
mod scan_buffer;
pub mod websocket;

pub use body_store::BodyStore;
pub use error::{Error, ErrorKind};
pub use limits::TransportLimits;
pub use reply::{
    Action, ReadCallback, ReadEvent, ReceiveState, Reply, ReplyPhase, RequestData, WriteCallback,
    WriteEvent,
};
pub use request::{ConnectionScheme, RequestDescriptor, RouteKind};
pub use response::{Response, encode_chunk, reason_phrase, stock_response};
