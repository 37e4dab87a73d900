//! 接続ごとの処理
//!
//! 1 接続を 1 タスクで処理し、`Reply` が返す [`Action`] を順に実行する。
//! `Reply` を触るのはこのタスクだけで、アプリケーションとはコマンドチャネルでやり取りする。

use std::sync::Arc;

use shiguredo_transport::websocket::{LEGACY_VERSION, MessageReader, Opcode, legacy_challenge};
use shiguredo_transport::{
    Action, ReceiveState, Reply, ReplyPhase, RequestDescriptor, stock_response,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::{HeadParser, ServerContext};
use crate::dispatch::{AsyncStream, Command, Dispatcher, Exchange, RawSocket};
use crate::error::{Error, Result};

/// 1 接続を最後まで処理する
///
/// `stream` は平文でも TLS 終端後でもよい。
pub async fn serve_connection<S, P, D>(stream: S, context: Arc<ServerContext<P, D>>) -> Result<()>
where
    S: AsyncStream + 'static,
    P: HeadParser,
    D: Dispatcher,
{
    let buf = vec![0u8; context.read_buffer_size.max(1)];
    let connection = Connection {
        stream,
        context,
        pending: Vec::new(),
        buf,
        reply: None,
    };
    connection.run().await
}

enum Flow {
    Continue,
    Close,
    Transfer,
}

/// 1 サイクル分のアプリケーションとのやり取り
struct Cycle {
    commands_tx: Option<mpsc::UnboundedSender<Command>>,
    commands: mpsc::UnboundedReceiver<Command>,
    app: Option<JoinHandle<()>>,
    app_done: bool,
    reader: Option<MessageReader>,
    read_wanted: bool,
    eof: bool,
}

impl Cycle {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            commands_tx: Some(tx),
            commands: rx,
            app: None,
            app_done: false,
            reader: None,
            read_wanted: false,
            eof: false,
        }
    }
}

enum Wake {
    Command(Option<Command>),
    Read(std::io::Result<usize>),
}

struct Connection<S, P, D> {
    stream: S,
    context: Arc<ServerContext<P, D>>,
    /// 読み込み済みで未処理のバイト
    pending: Vec<u8>,
    buf: Vec<u8>,
    reply: Option<Reply>,
}

impl<S, P, D> Connection<S, P, D>
where
    S: AsyncStream + 'static,
    P: HeadParser,
    D: Dispatcher,
{
    async fn run(mut self) -> Result<()> {
        loop {
            let Some(descriptor) = self.read_head().await? else {
                return Ok(());
            };
            tracing::debug!(
                method = %descriptor.method,
                path = %descriptor.path,
                websocket = descriptor.is_websocket(),
                "request head"
            );

            let mut reply = match self.reply.take() {
                Some(mut reply) => {
                    reply.reset(descriptor);
                    reply
                }
                None => Reply::new(
                    descriptor,
                    self.context.limits.clone(),
                    self.context.scheme,
                ),
            };

            let mut cycle = Cycle::new();
            let flow = self.run_cycle(&mut reply, &mut cycle).await;
            if let Some(app) = cycle.app.take() {
                if let Err(e) = app.await {
                    tracing::error!(error = %e, "dispatch task failed");
                }
            }

            match flow? {
                Flow::Continue => self.reply = Some(reply),
                Flow::Close => {
                    let _ = self.stream.shutdown().await;
                    return Ok(());
                }
                Flow::Transfer => {
                    let request = reply.request().clone();
                    let Connection {
                        stream,
                        context,
                        pending,
                        ..
                    } = self;
                    tracing::debug!(path = %request.path, buffered = pending.len(), "socket transferred");
                    let socket = RawSocket::new(Box::new(stream), pending);
                    context.dispatcher.handle_raw_socket(request, socket).await;
                    return Ok(());
                }
            }
        }
    }

    async fn read_head(&mut self) -> Result<Option<RequestDescriptor>> {
        loop {
            if !self.pending.is_empty() {
                match self.context.parser.parse(&self.pending) {
                    Ok(Some((mut descriptor, consumed))) => {
                        self.pending.drain(..consumed.min(self.pending.len()));
                        if descriptor.is_websocket() {
                            descriptor.route = self.context.dispatcher.route(&descriptor);
                        }
                        return Ok(Some(descriptor));
                    }
                    Ok(None) if self.pending.len() > self.context.max_head_size => {
                        tracing::debug!(len = self.pending.len(), "request head too large");
                        self.reject(400).await;
                        return Ok(None);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "malformed request head");
                        self.reject(e.status_code()).await;
                        return Ok(None);
                    }
                }
            }

            let read = tokio::time::timeout(
                self.context.keep_alive_timeout,
                self.stream.read(&mut self.buf),
            )
            .await;
            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => {
                    tracing::debug!("keep-alive timeout");
                    return Ok(None);
                }
            };
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&self.buf[..n]);
        }
    }

    async fn reject(&mut self, status: u16) {
        let bytes = stock_response("HTTP/1.1", status, true).encode();
        if let Err(e) = self.write_all(&bytes).await {
            tracing::debug!(error = %e, status, "failed to send rejection");
        }
        let _ = self.stream.shutdown().await;
    }

    async fn run_cycle(&mut self, reply: &mut Reply, cycle: &mut Cycle) -> Result<Flow> {
        let mut remaining = reply.request().content_length.unwrap_or(0);
        let legacy = reply.request().websocket_version == Some(LEGACY_VERSION);
        let mut key3 = Vec::new();

        // ボディ (WebSocket ではハンドシェイクの残り)
        loop {
            let take = remaining.min(self.pending.len() as u64) as usize;
            let chunk: Vec<u8> = self.pending.drain(..take).collect();
            remaining -= take as u64;
            let state = if remaining == 0 {
                ReceiveState::Complete
            } else {
                ReceiveState::Partial
            };
            if !legacy {
                reply.consume_body(&chunk, state);
            } else {
                // 旧プロトコルではキー 3 からチャレンジ応答を計算して渡す
                key3.extend_from_slice(&chunk);
                match state {
                    ReceiveState::Complete => match legacy_nonce(reply.request(), &key3) {
                        Ok(nonce) => reply.consume_body(&nonce, state),
                        Err(e) => {
                            tracing::debug!(error = %e, "websocket legacy handshake rejected");
                            reply.consume_body(&[], ReceiveState::Error);
                        }
                    },
                    _ => reply.consume_body(&[], state),
                }
            }

            let flow = self.pump(reply, cycle).await?;
            if !matches!(flow, Flow::Continue) {
                return Ok(flow);
            }
            if remaining == 0 || !is_receiving(reply.phase()) {
                break;
            }

            let read = tokio::time::timeout(
                self.context.keep_alive_timeout,
                self.stream.read(&mut self.buf),
            )
            .await;
            match read {
                Ok(Ok(n)) if n > 0 => self.pending.extend_from_slice(&self.buf[..n]),
                other => {
                    tracing::debug!(remaining, timeout = other.is_err(), "request body ended early");
                    reply.consume_body(&[], ReceiveState::Error);
                    let flow = self.pump(reply, cycle).await?;
                    return Ok(match flow {
                        Flow::Continue => Flow::Close,
                        flow => flow,
                    });
                }
            }
        }

        // アプリケーションの応答
        loop {
            let flow = self.pump(reply, cycle).await?;
            if !matches!(flow, Flow::Continue) {
                return Ok(flow);
            }
            if reply.is_finished() {
                return Ok(if reply.close_connection() {
                    Flow::Close
                } else {
                    Flow::Continue
                });
            }
            if cycle.app.is_none() || cycle.app_done {
                // これ以上進める手段がない
                tracing::debug!(phase = ?reply.phase(), "cycle stalled, closing");
                return Ok(Flow::Close);
            }

            if cycle.read_wanted {
                if cycle.eof {
                    cycle.read_wanted = false;
                    reply.consume_websocket_message(Opcode::Text, &[], ReceiveState::Error);
                    continue;
                }
                if deliver_buffered(reply, cycle) {
                    continue;
                }
            }

            let reading = cycle.reader.is_some() && cycle.read_wanted && !cycle.eof;
            let wake = tokio::select! {
                command = cycle.commands.recv() => Wake::Command(command),
                read = self.stream.read(&mut self.buf), if reading => Wake::Read(read),
            };

            match wake {
                Wake::Command(Some(command)) => apply_command(reply, cycle, command),
                Wake::Command(None) => {
                    cycle.app_done = true;
                    finish_response(reply);
                }
                Wake::Read(Ok(n)) if n > 0 => {
                    if let Some(reader) = cycle.reader.as_mut() {
                        reader.feed(&self.buf[..n]);
                    }
                }
                Wake::Read(result) => {
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "websocket read failed");
                    }
                    cycle.eof = true;
                }
            }
        }
    }

    /// キューに積まれた処理をすべて実行する
    async fn pump(&mut self, reply: &mut Reply, cycle: &mut Cycle) -> Result<Flow> {
        while let Some(action) = reply.poll_action() {
            match action {
                Action::Write(bytes) => {
                    let result = self.write_all(&bytes).await;
                    if let Err(e) = &result {
                        tracing::debug!(error = %e, len = bytes.len(), "write failed");
                    }
                    reply.write_done(result.is_ok());
                }
                Action::ReadMore => cycle.read_wanted = true,
                Action::Dispatch => self.dispatch(reply, cycle)?,
                Action::TransferSocket => return Ok(Flow::Transfer),
                Action::Close => return Ok(Flow::Close),
                notification => {
                    notification.run_notification();
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn dispatch(&mut self, reply: &mut Reply, cycle: &mut Cycle) -> Result<()> {
        let Some(commands) = cycle.commands_tx.take() else {
            tracing::warn!("request dispatched twice");
            return Ok(());
        };

        let data = reply.take_request();
        if let Some(version) = data.descriptor.websocket_version {
            let mut reader = MessageReader::new(
                version,
                data.descriptor.deflate,
                self.context.limits.max_memory_request_size as usize,
            )?;
            reader.feed(&self.pending);
            self.pending.clear();
            cycle.reader = Some(reader);
            cycle.read_wanted = false;
            // 101 (旧プロトコルではナンスも) を先に送る
            reply.send(None, false);
        }

        let exchange = Exchange::new(data, commands);
        let context = self.context.clone();
        cycle.app = Some(tokio::spawn(async move {
            context.dispatcher.handle(exchange).await;
        }));
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }
}

fn legacy_nonce(
    request: &RequestDescriptor,
    key3: &[u8],
) -> std::result::Result<[u8; 16], shiguredo_transport::Error> {
    let (key1, key2) = request.legacy_keys.as_ref().ok_or_else(|| {
        shiguredo_transport::Error::InvalidData("missing Sec-WebSocket-Key1/Key2".to_string())
    })?;
    legacy_challenge(key1, key2, key3)
}

fn is_receiving(phase: ReplyPhase) -> bool {
    matches!(
        phase,
        ReplyPhase::ReceivingBody | ReplyPhase::ReceivingHandshake | ReplyPhase::HandshakeSent
    )
}

/// 受信済みのフレームからメッセージを 1 つ渡す
fn deliver_buffered(reply: &mut Reply, cycle: &mut Cycle) -> bool {
    let Some(reader) = cycle.reader.as_mut() else {
        return false;
    };
    match reader.next_message() {
        Ok(Some(message)) => {
            cycle.read_wanted = false;
            reply.consume_websocket_message(message.opcode, &message.payload, ReceiveState::Complete);
            true
        }
        Ok(None) => false,
        Err(e) => {
            tracing::debug!(error = %e, "invalid websocket frame");
            cycle.read_wanted = false;
            cycle.eof = true;
            reply.consume_websocket_message(Opcode::Text, &[], ReceiveState::Error);
            true
        }
    }
}

fn apply_command(reply: &mut Reply, cycle: &Cycle, command: Command) {
    match command {
        Command::SetStatus(status) => reply.set_status(status),
        Command::SetContentType(content_type) => reply.set_content_type(&content_type),
        Command::SetLocation(location) => reply.set_location(&location),
        Command::SetContentLength(length) => reply.set_content_length(length),
        Command::Send {
            data,
            complete,
            done,
        } => {
            reply.write(&data);
            reply.send(
                Some(Box::new(move |event| {
                    let _ = done.send(event);
                })),
                complete,
            );
        }
        Command::Pong { payload, done } => reply.send_control(
            Opcode::Pong,
            &payload,
            Some(Box::new(move |event| {
                let _ = done.send(event);
            })),
        ),
        Command::Read { done } => {
            if cycle.reader.is_none() {
                let _ = done.send(shiguredo_transport::ReadEvent::Error);
                return;
            }
            reply.read_websocket_message(Box::new(move |event| {
                let _ = done.send(event);
            }));
        }
        Command::Close => {
            reply.set_close_connection();
            if reply.request().is_websocket() {
                reply.send(None, false);
            }
        }
    }
}

/// アプリケーションが `Exchange` を手放した後の後始末
fn finish_response(reply: &mut Reply) {
    if reply.is_finished() {
        return;
    }
    if reply.request().is_websocket() {
        reply.set_close_connection();
        reply.send(None, false);
    } else {
        reply.send(None, true);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use shiguredo_transport::RouteKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    /// テスト用の最小限のヘッドパーサー
    fn parse_head(
        buf: &[u8],
    ) -> std::result::Result<Option<(RequestDescriptor, usize)>, shiguredo_transport::Error> {
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            return Ok(None);
        };
        let head = std::str::from_utf8(&buf[..end])
            .map_err(|_| shiguredo_transport::Error::InvalidData("head".to_string()))?;
        let mut lines = head.split("\r\n");
        let mut parts = lines.next().unwrap_or_default().split(' ');
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(shiguredo_transport::Error::InvalidData("request line".to_string()));
        };
        let (path, query) = target.split_once('?').unwrap_or((target, ""));

        let mut descriptor = RequestDescriptor::new(method, path)
            .version(version)
            .query_string(query);
        let mut key1 = None;
        let mut key2 = None;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "content-length" => {
                    descriptor.content_length = value.parse().ok();
                }
                "content-type" => descriptor.content_type = Some(value.to_string()),
                "connection" if value.eq_ignore_ascii_case("close") => descriptor.keep_alive = false,
                "sec-websocket-version" => {
                    descriptor.websocket_version = value.parse().ok();
                    descriptor.url_scheme = "ws".to_string();
                }
                "sec-websocket-key" => descriptor.websocket_key = Some(value.to_string()),
                "sec-websocket-key1" => key1 = Some(line[name.len() + 1..].trim_start().to_string()),
                "sec-websocket-key2" => key2 = Some(line[name.len() + 1..].trim_start().to_string()),
                _ => {}
            }
        }
        if let (Some(key1), Some(key2)) = (key1, key2) {
            descriptor = descriptor.legacy_keys(&key1, &key2);
            descriptor.websocket_version = Some(0);
            descriptor.url_scheme = "ws".to_string();
            descriptor.content_length = Some(8);
        }
        Ok(Some((descriptor, end + 4)))
    }

    struct Echo;

    impl Dispatcher for Echo {
        fn route(&self, request: &RequestDescriptor) -> RouteKind {
            if request.path == "/raw" {
                RouteKind::RawSocket
            } else {
                RouteKind::Framework
            }
        }

        async fn handle(&self, exchange: Exchange) {
            if exchange.request().is_websocket() {
                while let Ok(Some(message)) = exchange.read_message().await {
                    if exchange.send(&message, false).await.is_err() {
                        return;
                    }
                }
                return;
            }
            let value = exchange.form().parameters.first("a").unwrap_or("-").to_string();
            exchange.set_content_type("text/plain");
            let _ = exchange.send(value.as_bytes(), true).await;
        }

        async fn handle_raw_socket(&self, _request: RequestDescriptor, mut socket: RawSocket) {
            let mut buf = [0u8; 4];
            if socket.read_exact(&mut buf).await.is_ok() {
                let _ = socket.write_all(b"raw:").await;
                let _ = socket.write_all(&buf).await;
            }
        }
    }

    fn start(context: ServerContext<fn(&[u8]) -> ParseResult, Echo>) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let context = Arc::new(context);
        tokio::spawn(async move {
            let _ = serve_connection(server, context).await;
        });
        client
    }

    type ParseResult =
        std::result::Result<Option<(RequestDescriptor, usize)>, shiguredo_transport::Error>;

    fn context() -> ServerContext<fn(&[u8]) -> ParseResult, Echo> {
        let mut context = ServerContext::new(parse_head as fn(&[u8]) -> ParseResult, Echo);
        context.keep_alive_timeout = Duration::from_secs(5);
        context
    }

    async fn read_until(client: &mut DuplexStream, needle: &[u8]) -> Vec<u8> {
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !received.windows(needle.len()).any(|w| w == needle) {
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "connection closed: {:?}", String::from_utf8_lossy(&received));
            received.extend_from_slice(&buf[..n]);
        }
        received
    }

    async fn read_to_close(client: &mut DuplexStream) -> Vec<u8> {
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        received
    }

    #[tokio::test]
    async fn test_form_post_and_keep_alive() {
        let mut client = start(context());
        client
            .write_all(
                b"POST /form HTTP/1.1\r\n\
                  Content-Type: application/x-www-form-urlencoded\r\n\
                  Content-Length: 3\r\n\r\n\
                  a=1\
                  GET /next?a=2 HTTP/1.1\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let received = read_to_close(&mut client).await;
        let text = String::from_utf8(received).unwrap();
        let first = text.find("HTTP/1.1 200 OK\r\n").unwrap();
        let second = text.rfind("HTTP/1.1 200 OK\r\n").unwrap();
        assert!(first < second);
        assert!(text[..second].ends_with("\r\n\r\n1"));
        assert!(text[second..].contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n2"));
    }

    #[tokio::test]
    async fn test_oversized_body_is_drained() {
        let mut context = context();
        context.limits = context.limits.max_request_size(4);
        let mut client = start(context);
        client
            .write_all(
                b"POST /big HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789\
                  GET /?a=ok HTTP/1.1\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let text = String::from_utf8(read_to_close(&mut client).await).unwrap();
        assert!(text.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"));
        assert!(text.contains("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));
    }

    #[tokio::test]
    async fn test_malformed_head_is_rejected() {
        let mut client = start(context());
        client.write_all(b"NONSENSE\r\n\r\n").await.unwrap();

        let text = String::from_utf8(read_to_close(&mut client).await).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn test_websocket_echo_and_close() {
        let mut client = start(context());
        client
            .write_all(
                b"GET /ws HTTP/1.1\r\n\
                  Upgrade: websocket\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .await
            .unwrap();
        let head = read_until(&mut client, b"\r\n\r\n").await;
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        // マスク付きの "hi"
        let key = [1u8, 2, 3, 4];
        let mut frame = vec![0x81, 0x82];
        frame.extend_from_slice(&key);
        frame.extend(b"hi".iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        client.write_all(&frame).await.unwrap();
        let echoed = read_until(&mut client, b"hi").await;
        assert_eq!(echoed, [0x81, 0x02, 0x68, 0x69]);

        // ping には pong
        client.write_all(&[0x89, 0x80, 0, 0, 0, 0]).await.unwrap();
        let pong = read_until(&mut client, &[0x8A, 0x00]).await;
        assert_eq!(pong, [0x8A, 0x00]);

        // close
        client.write_all(&[0x88, 0x80, 0, 0, 0, 0]).await.unwrap();
        let rest = read_to_close(&mut client).await;
        assert_eq!(rest, [0x88, 0x00]);
    }

    #[tokio::test]
    async fn test_websocket_legacy_challenge() {
        let mut client = start(context());
        client
            .write_all(
                b"GET /ws HTTP/1.1\r\n\
                  Upgrade: WebSocket\r\n\
                  Sec-WebSocket-Key1: 18x 6]8vM;54 *(5:  {   U1]8  z [  8\r\n\
                  Sec-WebSocket-Key2: 1_ tx7X d  <  nw  334J702) 7]o}` 0\r\n\r\n",
            )
            .await
            .unwrap();
        // キー 3 が届く前に 101 を返す
        let head = read_until(&mut client, b"\r\n\r\n").await;
        assert!(head.starts_with(b"HTTP/1.1 101 WebSocket Protocol Handshake\r\n"));

        client.write_all(b"Tm[K T2u").await.unwrap();
        let nonce = read_until(&mut client, b"fQJ,fN/4F4!~K~MH").await;
        assert_eq!(nonce, b"fQJ,fN/4F4!~K~MH");

        client.write_all(b"\x00hi\xff").await.unwrap();
        let echoed = read_until(&mut client, &[0xFF]).await;
        assert_eq!(echoed, b"\x00hi\xff");
    }

    #[tokio::test]
    async fn test_websocket_legacy_bad_key_closes() {
        let mut client = start(context());
        client
            .write_all(
                b"GET /ws HTTP/1.1\r\n\
                  Sec-WebSocket-Key1: 12345\r\n\
                  Sec-WebSocket-Key2: 1 2\r\n\r\n12345678",
            )
            .await
            .unwrap();
        let text = String::from_utf8(read_to_close(&mut client).await).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(!text.contains("101"));
    }

    #[tokio::test]
    async fn test_raw_socket_transfer() {
        let mut client = start(context());
        client
            .write_all(
                b"GET /raw HTTP/1.1\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  Sec-WebSocket-Key: x\r\n\r\nab",
            )
            .await
            .unwrap();
        client.write_all(b"cd").await.unwrap();

        let received = read_until(&mut client, b"raw:abcd").await;
        assert_eq!(received, b"raw:abcd");
    }
}
