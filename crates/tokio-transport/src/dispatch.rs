//! アプリケーションへのディスパッチ
//!
//! 完全なリクエストが揃うと [`Dispatcher::handle`] が別タスクで呼ばれる。
//! アプリケーションは [`Exchange`] を通して応答を組み立て、WebSocket メッセージを読み書きする。
//! `Exchange` の操作はすべて接続タスクへのコマンドとして送られ、接続タスクだけが
//! `Reply` を触る。
//!
//! ## 使い方
//!
//! ```ignore
//! use tokio_transport::Exchange;
//!
//! async fn dispatch(mut exchange: Exchange) {
//!     if exchange.request().is_websocket() {
//!         // エコー
//!         while let Ok(Some(message)) = exchange.read_message().await {
//!             if exchange.send(&message, false).await.is_err() {
//!                 break;
//!             }
//!         }
//!         return;
//!     }
//!
//!     exchange.set_content_type("text/plain");
//!     let _ = exchange.send(b"Hello", true).await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use shiguredo_transport::{
    BodyStore, ReadEvent, RequestData, RequestDescriptor, RouteKind, WriteEvent,
    form::FormData,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// リクエストの受け手
pub trait Dispatcher: Send + Sync + 'static {
    /// WebSocket アップグレード要求の受け先を決める
    fn route(&self, _request: &RequestDescriptor) -> RouteKind {
        RouteKind::Framework
    }

    /// リクエストを処理する
    fn handle(&self, exchange: Exchange) -> impl Future<Output = ()> + Send;

    /// ソケットごと引き渡されたリクエストを処理する
    ///
    /// [`RouteKind::RawSocket`] を返したバージョン 13 の WebSocket 要求で呼ばれる。
    /// 既定の実装はソケットを閉じる。
    fn handle_raw_socket(
        &self,
        request: RequestDescriptor,
        socket: RawSocket,
    ) -> impl Future<Output = ()> + Send {
        async move {
            tracing::warn!(path = %request.path, "raw socket route without a handler");
            drop(socket);
        }
    }
}

/// 関数からディスパッチャーを作成
impl<F, Fut> Dispatcher for F
where
    F: Fn(Exchange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    fn handle(&self, exchange: Exchange) -> impl Future<Output = ()> + Send {
        (self)(exchange)
    }
}

/// 接続タスクへのコマンド
pub(crate) enum Command {
    SetStatus(u16),
    SetContentType(String),
    SetLocation(String),
    SetContentLength(u64),
    Send {
        data: Vec<u8>,
        complete: bool,
        done: oneshot::Sender<WriteEvent>,
    },
    Pong {
        payload: Vec<u8>,
        done: oneshot::Sender<WriteEvent>,
    },
    Read {
        done: oneshot::Sender<ReadEvent>,
    },
    Close,
}

/// 1 リクエスト分のアプリケーション側ハンドル
///
/// drop すると応答が完了していなければ接続タスクが完了させる。
pub struct Exchange {
    data: RequestData,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("request", &self.data.descriptor)
            .finish()
    }
}

impl Exchange {
    pub(crate) fn new(data: RequestData, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { data, commands }
    }

    pub fn request(&self) -> &RequestDescriptor {
        &self.data.descriptor
    }

    /// クエリとフォームのパラメーター、アップロードされたファイル
    pub fn form(&self) -> &FormData {
        &self.data.form
    }

    /// リクエストボディ (読み出し位置は先頭)
    pub fn body_mut(&mut self) -> &mut BodyStore {
        &mut self.data.body
    }

    pub fn set_status(&self, status: u16) {
        self.command(Command::SetStatus(status));
    }

    pub fn set_content_type(&self, content_type: &str) {
        self.command(Command::SetContentType(content_type.to_string()));
    }

    /// リダイレクト先を設定する (ステータス未設定なら 302)
    pub fn set_location(&self, location: &str) {
        self.command(Command::SetLocation(location.to_string()));
    }

    pub fn set_content_length(&self, length: u64) {
        self.command(Command::SetContentLength(length));
    }

    /// データを送り、書き込みの完了を待つ
    ///
    /// `complete` が true なら応答はこれで終わり。WebSocket では 1 メッセージを送る。
    pub async fn send(&self, data: &[u8], complete: bool) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.command(Command::Send {
            data: data.to_vec(),
            complete,
            done,
        });
        match rx.await {
            Ok(WriteEvent::Completed) => Ok(()),
            Ok(WriteEvent::Error) | Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// 次の WebSocket メッセージを読む
    ///
    /// ping には pong を返して読み続ける。close を受けたら `Ok(None)`。
    pub async fn read_message(&self) -> Result<Option<Vec<u8>>> {
        loop {
            let (done, rx) = oneshot::channel();
            self.command(Command::Read { done });
            match rx.await {
                Ok(ReadEvent::Message(payload)) => return Ok(Some(payload)),
                Ok(ReadEvent::Ping(payload)) => {
                    let (done, rx) = oneshot::channel();
                    self.command(Command::Pong { payload, done });
                    if !matches!(rx.await, Ok(WriteEvent::Completed)) {
                        return Err(Error::ConnectionClosed);
                    }
                }
                Ok(ReadEvent::Closed) => return Ok(None),
                Ok(ReadEvent::Error) | Err(_) => return Err(Error::ConnectionClosed),
            }
        }
    }

    /// 応答後に接続を閉じる (WebSocket では close フレームを送る)
    pub fn close(&self) {
        self.command(Command::Close);
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("connection already gone");
        }
    }
}

/// 非同期ストリーム
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// 引き渡されたソケット
///
/// 接続タスクが読み込み済みで未処理のバイト列を先に返す。
pub struct RawSocket {
    stream: Box<dyn AsyncStream>,
    buffered: Vec<u8>,
    position: usize,
}

impl std::fmt::Debug for RawSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSocket")
            .field("buffered", &(self.buffered.len() - self.position))
            .finish()
    }
}

impl RawSocket {
    pub(crate) fn new(stream: Box<dyn AsyncStream>, buffered: Vec<u8>) -> Self {
        Self {
            stream,
            buffered,
            position: 0,
        }
    }

    /// 読み込み済みのバイト数
    pub fn buffered(&self) -> usize {
        self.buffered.len() - self.position
    }
}

impl AsyncRead for RawSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.position < self.buffered.len() {
            let n = buf.remaining().min(self.buffered.len() - self.position);
            let start = self.position;
            buf.put_slice(&self.buffered[start..start + n]);
            self.position += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for RawSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_raw_socket_replays_buffered_bytes() {
        let (client, server) = tokio::io::duplex(64);
        let mut socket = RawSocket::new(Box::new(server), b"abc".to_vec());
        assert_eq!(socket.buffered(), 3);

        let mut client = client;
        client.write_all(b"def").await.unwrap();

        let mut buf = [0u8; 6];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcdef");
        assert_eq!(socket.buffered(), 0);
    }

    #[tokio::test]
    async fn test_send_reports_closed_connection() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let data = RequestData {
            descriptor: RequestDescriptor::new("GET", "/"),
            form: FormData::new(),
            body: BodyStore::memory(),
        };
        let exchange = Exchange::new(data, tx);
        assert!(matches!(
            exchange.send(b"x", true).await,
            Err(Error::ConnectionClosed)
        ));
    }
}
