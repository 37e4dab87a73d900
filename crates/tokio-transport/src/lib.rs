//! tokio_transport - Tokio integration for shiguredo_transport
//!
//! Sans I/O の `shiguredo_transport` を tokio のソケットにつなぐ。
//!
//! ## Features
//!
//! - `server` - TCP サーバー機能 (デフォルト有効)
//! - `full` - すべての機能を有効化
//!
//! ## 特徴
//!
//! - **1 接続 1 タスク**: `Reply` に触れるのは接続タスクだけ
//! - **Keep-Alive**: 同じ `Reply` をリセットして次のリクエストに使う
//! - **WebSocket**: 101 の送出、フレームの組み立て、ping への pong 応答
//! - **ソケットの引き渡し**: 独自プロトコルのリソースへ生のソケットを渡す
//!
//! ## サーバー
//!
//! ```ignore
//! use shiguredo_transport::RequestDescriptor;
//! use tokio_transport::{Exchange, Server};
//!
//! fn parse_head(buf: &[u8]) -> Result<Option<(RequestDescriptor, usize)>, shiguredo_transport::Error> {
//!     // リクエストヘッドのパースは外側の層で行う
//!     # todo!()
//! }
//!
//! async fn dispatch(exchange: Exchange) {
//!     let name = exchange.form().parameters.first("name").unwrap_or("world").to_string();
//!     exchange.set_content_type("text/plain");
//!     let _ = exchange.send(format!("Hello, {name}!").as_bytes(), true).await;
//! }
//!
//! let server = Server::bind("0.0.0.0:8080").await?;
//! server.serve(parse_head, dispatch).await?;
//! ```

mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
#[cfg(feature = "server")]
pub mod server;

pub use connection::serve_connection;
pub use context::{HeadParser, ServerContext};
pub use dispatch::{AsyncStream, Dispatcher, Exchange, RawSocket};
pub use error::{Error, Result};
#[cfg(feature = "server")]
pub use server::Server;

// shiguredo_transport の型を re-export
pub use shiguredo_transport::{RequestDescriptor, RouteKind, TransportLimits};
