//! HTTP/WebSocket サーバー
//!
//! 接続ごとにタスクを立て、[`serve_connection`] で処理する。
//!
//! ## 使い方
//!
//! ```ignore
//! use tokio_transport::{Exchange, Server};
//!
//! async fn dispatch(exchange: Exchange) {
//!     exchange.set_content_type("text/plain");
//!     let _ = exchange.send(b"Hello, World!", true).await;
//! }
//!
//! let server = Server::bind("0.0.0.0:8080").await?
//!     .max_request_size(10 * 1024 * 1024);
//! server.serve(parse_head, dispatch).await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use shiguredo_transport::TransportLimits;
use tokio::net::TcpListener;

use crate::connection::serve_connection;
use crate::context::{HeadParser, ServerContext};
use crate::dispatch::Dispatcher;
use crate::error::Result;

/// HTTP/WebSocket サーバー
///
/// TLS 終端は行わない。TLS が必要な場合は終端後のストリームを
/// [`serve_connection`] に直接渡す。
pub struct Server {
    listener: TcpListener,
    limits: TransportLimits,
    keep_alive_timeout: Duration,
    read_buffer_size: usize,
    max_head_size: usize,
}

impl Server {
    /// 指定アドレスにバインド
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            limits: TransportLimits::default(),
            keep_alive_timeout: Duration::from_secs(60),
            read_buffer_size: 8192,
            max_head_size: 64 * 1024,
        })
    }

    /// サイズ制限をまとめて設定
    pub fn limits(mut self, limits: TransportLimits) -> Self {
        self.limits = limits;
        self
    }

    /// メモリに保持するボディの最大サイズを設定
    pub fn max_memory_request_size(mut self, size: u64) -> Self {
        self.limits.max_memory_request_size = size;
        self
    }

    /// url-encoded フォームボディの最大サイズを設定
    pub fn max_form_data_size(mut self, size: u64) -> Self {
        self.limits.max_form_data_size = size;
        self
    }

    /// リクエスト全体の最大サイズを設定
    pub fn max_request_size(mut self, size: u64) -> Self {
        self.limits.max_request_size = size;
        self
    }

    /// Keep-Alive タイムアウトを設定
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// 読み取りバッファサイズを設定
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// リクエストヘッドの最大サイズを設定
    pub fn max_head_size(mut self, size: usize) -> Self {
        self.max_head_size = size;
        self
    }

    /// ローカルアドレスを取得
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn context<P, D>(&self, parser: P, dispatcher: D) -> Arc<ServerContext<P, D>> {
        let mut context = ServerContext::new(parser, dispatcher);
        context.limits = self.limits.clone();
        context.keep_alive_timeout = self.keep_alive_timeout;
        context.read_buffer_size = self.read_buffer_size;
        context.max_head_size = self.max_head_size;
        Arc::new(context)
    }

    /// サーバーを起動
    pub async fn serve<P: HeadParser, D: Dispatcher>(self, parser: P, dispatcher: D) -> Result<()> {
        let context = self.context(parser, dispatcher);

        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let context = context.clone();

            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, context).await {
                    tracing::warn!(peer = %peer_addr, error = %e, "connection error");
                }
            });
        }
    }

    /// 単一の接続を処理 (テスト用)
    pub async fn handle_one<P: HeadParser, D: Dispatcher>(
        self,
        parser: P,
        dispatcher: D,
    ) -> Result<()> {
        let context = self.context(parser, dispatcher);
        let (stream, peer_addr) = self.listener.accept().await?;
        tracing::debug!(peer = %peer_addr, "accepted");
        serve_connection(stream, context).await
    }
}
