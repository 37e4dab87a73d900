//! 1 リクエスト/応答サイクルの状態機械 (Sans I/O)
//!
//! ボディの受信、ディスパッチ、応答バイトのバッファリング、WebSocket の
//! ハンドシェイクとメッセージ送受信を扱う。I/O は行わず、実行すべき処理を
//! [`Action`] としてキューに積む。呼び出し側は [`Reply::poll_action`] で取り出して実行し、
//! 書き込みが終わったら [`Reply::write_done`] を呼ぶ。
//!
//! ## 使い方
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
//! reply.consume_body(b"a=1", ReceiveState::Complete);
//! assert!(matches!(reply.poll_action(), Some(Action::Dispatch)));
//! assert_eq!(reply.form().parameters.first("a"), Some("1"));
//!
//! // アプリケーションが応答を書く
//! reply.set_content_type("text/plain");
//! reply.write(b"ok");
//! reply.send(None, true);
//! let Some(Action::Write(bytes)) = reply.poll_action() else { panic!() };
//! assert!(bytes.starts_with(b"HTTP/1.1 200 OK\r\n"));
//! reply.write_done(true);
//! assert!(reply.is_finished());
//! ```

mod event;

use std::collections::VecDeque;
use std::fmt;

use crate::body_store::BodyStore;
use crate::compression::CompressionError;
use crate::error::{Error, ErrorKind};
use crate::form::{FormData, expand_reserved_params, parse_form_urlencoded};
use crate::limits::TransportLimits;
use crate::multipart::MultipartDecoder;
use crate::request::{ConnectionScheme, RequestDescriptor, RouteKind};
use crate::response::{Response, encode_chunk, stock_response};
use crate::websocket::{
    LEGACY_NONCE_LEN, LEGACY_VERSION, Opcode, encode_close_frame, encode_control_frame,
    encode_switching_protocols, encode_text_frame, is_supported_version,
};

#[cfg(feature = "deflate")]
use crate::compression::DeflateCompressor;

pub use event::{
    Action, ReadCallback, ReadEvent, ReceiveState, ReplyPhase, WriteCallback, WriteEvent,
};

/// ボディの書き込み先
///
/// 最初のチャンクを受け取った時点で一度だけ決まる。
#[derive(Debug)]
enum BodySink {
    Store(BodyStore),
    Multipart(MultipartDecoder),
    /// 読み捨て
    Drain,
}

/// アプリケーションへ渡すリクエストデータ
#[derive(Debug)]
pub struct RequestData {
    pub descriptor: RequestDescriptor,
    pub form: FormData,
    /// 読み出し位置を先頭に戻したボディ
    pub body: BodyStore,
}

/// 1 サイクル分の状態
///
/// keep-alive 接続では作り直さずに [`Reply::reset`] で再利用する。
pub struct Reply {
    limits: TransportLimits,
    scheme: ConnectionScheme,
    request: RequestDescriptor,
    phase: ReplyPhase,

    sink: Option<BodySink>,
    body_received: u64,
    form: FormData,
    body: BodyStore,

    status: Option<u16>,
    content_type: String,
    location: Option<String>,
    content_length: Option<u64>,
    out_buf: Vec<u8>,
    sending: usize,
    write_in_flight: bool,
    transmitting: bool,
    chunked: bool,
    response_complete: bool,
    close_connection: bool,
    fetch_more: Option<WriteCallback>,
    read_more_after_write: bool,

    message: Vec<u8>,
    read_callback: Option<ReadCallback>,
    handshake_complete: bool,
    handshake_nonce: Option<Vec<u8>>,
    sending_messages: bool,
    close_frame_sent: bool,
    /// 圧縮に失敗してフレームを捨てた
    frame_dropped: bool,
    #[cfg(feature = "deflate")]
    compressor: Option<DeflateCompressor>,
    #[cfg(all(test, feature = "deflate"))]
    fail_next_compression: bool,

    actions: VecDeque<Action>,
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("phase", &self.phase)
            .field("status", &self.status)
            .field("body_received", &self.body_received)
            .field("out_buf", &self.out_buf.len())
            .field("sending", &self.sending)
            .field("close_connection", &self.close_connection)
            .field("actions", &self.actions)
            .finish()
    }
}

impl Reply {
    pub fn new(
        request: RequestDescriptor,
        limits: TransportLimits,
        scheme: ConnectionScheme,
    ) -> Self {
        let mut reply = Self {
            limits,
            scheme,
            request: request.clone(),
            phase: ReplyPhase::ReceivingBody,
            sink: None,
            body_received: 0,
            form: FormData::new(),
            body: BodyStore::memory(),
            status: None,
            content_type: String::new(),
            location: None,
            content_length: None,
            out_buf: Vec::new(),
            sending: 0,
            write_in_flight: false,
            transmitting: false,
            chunked: false,
            response_complete: false,
            close_connection: false,
            fetch_more: None,
            read_more_after_write: false,
            message: Vec::new(),
            read_callback: None,
            handshake_complete: false,
            handshake_nonce: None,
            sending_messages: false,
            close_frame_sent: false,
            frame_dropped: false,
            #[cfg(feature = "deflate")]
            compressor: None,
            #[cfg(all(test, feature = "deflate"))]
            fail_next_compression: false,
            actions: VecDeque::new(),
        };
        reply.reset(request);
        reply
    }

    /// 次のリクエストのために状態を初期化する
    ///
    /// 前のサイクルの一時ファイルはここで削除される。圧縮器の辞書も破棄する。
    pub fn reset(&mut self, request: RequestDescriptor) {
        self.sink = None;
        self.body_received = 0;
        self.form = FormData::new();
        self.body = BodyStore::memory();

        self.status = None;
        self.content_type.clear();
        self.location = None;
        self.content_length = None;
        self.out_buf.clear();
        self.sending = 0;
        self.write_in_flight = false;
        self.transmitting = false;
        self.chunked = false;
        self.response_complete = false;
        self.fetch_more = None;
        self.read_more_after_write = false;

        self.message.clear();
        self.read_callback = None;
        self.handshake_complete = false;
        self.handshake_nonce = None;
        self.sending_messages = false;
        self.close_frame_sent = false;
        self.frame_dropped = false;
        #[cfg(feature = "deflate")]
        {
            self.compressor = None;
        }
        self.actions.clear();

        self.close_connection = !request.keep_alive;
        self.phase = if request.is_websocket() {
            ReplyPhase::ReceivingHandshake
        } else {
            ReplyPhase::ReceivingBody
        };
        self.request = request;
    }

    // ------------------------------------------------------------------
    // 状態の参照
    // ------------------------------------------------------------------

    pub fn request(&self) -> &RequestDescriptor {
        &self.request
    }

    pub fn phase(&self) -> ReplyPhase {
        self.phase
    }

    /// サイクルが終わったかどうか
    pub fn is_finished(&self) -> bool {
        self.phase.is_finished()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// 応答後に接続を閉じるかどうか
    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    /// 受け取ったボディのバイト数
    pub fn body_received(&self) -> u64 {
        self.body_received
    }

    /// パース済みのパラメーターとファイル
    pub fn form(&self) -> &FormData {
        &self.form
    }

    /// 読み出し位置を先頭に戻したボディ
    pub fn body_mut(&mut self) -> &mut BodyStore {
        &mut self.body
    }

    /// 送信中のバイト数
    pub fn bytes_in_flight(&self) -> usize {
        self.sending
    }

    /// リクエストデータをアプリケーションへ引き渡す
    ///
    /// 以降 `form()` と `body_mut()` は空になる。
    pub fn take_request(&mut self) -> RequestData {
        RequestData {
            descriptor: self.request.clone(),
            form: std::mem::take(&mut self.form),
            body: std::mem::take(&mut self.body),
        }
    }

    /// 次に実行する処理を取り出す
    pub fn poll_action(&mut self) -> Option<Action> {
        let action = self.actions.pop_front()?;
        if matches!(action, Action::Dispatch) && self.phase == ReplyPhase::Dispatched {
            self.phase = ReplyPhase::AwaitingResponse;
        }
        Some(action)
    }

    // ------------------------------------------------------------------
    // 応答の設定
    // ------------------------------------------------------------------

    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.content_type = content_type.to_string();
    }

    /// リダイレクト先を設定する
    ///
    /// ステータス未設定なら 302 になる。
    pub fn set_location(&mut self, location: &str) {
        self.location = Some(location.to_string());
        if self.status.is_none() {
            self.status = Some(302);
        }
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.content_length = Some(length);
    }

    /// 応答後に接続を閉じるようにする
    pub fn set_close_connection(&mut self) {
        self.close_connection = true;
    }

    /// 送信バッファに追記
    pub fn write(&mut self, data: &[u8]) {
        self.out_buf.extend_from_slice(data);
    }

    // ------------------------------------------------------------------
    // 受信
    // ------------------------------------------------------------------

    /// リクエストボディ (WebSocket ではハンドシェイクの残り) を受け取る
    pub fn consume_body(&mut self, data: &[u8], state: ReceiveState) {
        if self.request.is_websocket() {
            self.consume_handshake(data, state);
            return;
        }
        if self.phase != ReplyPhase::ReceivingBody {
            tracing::warn!(phase = ?self.phase, len = data.len(), "body data outside of receipt");
            return;
        }

        let mut state = state;
        if self.sink.is_none() {
            match self.begin_body() {
                Ok(sink) => self.sink = Some(sink),
                Err(e) => {
                    tracing::error!(error = %e, "cannot accept request body");
                    self.sink = Some(BodySink::Drain);
                    self.status = Some(e.status_code());
                    state = ReceiveState::Error;
                }
            }
        }

        if state != ReceiveState::Error {
            self.body_received += data.len() as u64;
            if self.body_received > self.limits.max_request_size && self.status != Some(413) {
                tracing::debug!(
                    size = self.body_received,
                    limit = self.limits.max_request_size,
                    "request too large, draining"
                );
                self.reject_oversized();
            }

            if let Err(e) = self.write_body(data) {
                if self.status == Some(413) || e.kind() == ErrorKind::SizeLimit {
                    // 413 確定後は内容を捨てて読み進める
                    self.reject_oversized();
                    self.sink = Some(BodySink::Drain);
                } else {
                    tracing::error!(error = %e, "request body rejected");
                    self.status = Some(e.status_code());
                    self.sink = Some(BodySink::Drain);
                    state = ReceiveState::Error;
                }
            }
        }

        if state == ReceiveState::Error {
            // 一時ファイルとアップロード途中のファイルはここで消える
            self.sink = Some(BodySink::Drain);
            if self.status.is_none_or(|s| s < 300) {
                self.status = Some(400);
            }
            self.close_connection = true;
        }

        if state == ReceiveState::Partial {
            return;
        }

        if self.status.is_some_and(|s| s >= 300) {
            self.send_stock_reply();
            return;
        }

        match self.finish_body() {
            Ok(()) => {
                tracing::debug!(
                    method = %self.request.method,
                    path = %self.request.path,
                    len = self.body_received,
                    "dispatching request"
                );
                self.phase = ReplyPhase::Dispatched;
                self.actions.push_back(Action::Dispatch);
            }
            Err(e) => {
                tracing::error!(error = %e, "request body could not be completed");
                self.status = Some(e.status_code());
                if e.kind() != ErrorKind::SizeLimit {
                    self.close_connection = true;
                }
                self.send_stock_reply();
            }
        }
    }

    fn begin_body(&mut self) -> Result<BodySink, Error> {
        let oversized = self
            .request
            .content_length
            .is_some_and(|length| length > self.limits.max_request_size);
        if oversized {
            self.status = Some(413);
        }

        if self.request.is_multipart() {
            if self.request.method != "POST" {
                return Err(Error::InvalidData(format!(
                    "multipart body not allowed for {}",
                    self.request.method
                )));
            }
            let content_type = self.request.content_type.as_deref().unwrap_or_default();
            let mut decoder = MultipartDecoder::from_content_type(content_type, &self.limits)?;
            if oversized {
                decoder.discard_parts();
            }
            return Ok(BodySink::Multipart(decoder));
        }

        if oversized {
            return Ok(BodySink::Drain);
        }
        Ok(BodySink::Store(BodyStore::begin_write(
            self.request.content_length,
            &self.limits,
        )))
    }

    fn write_body(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.sink.as_mut() {
            Some(BodySink::Store(store)) => store.write(data),
            Some(BodySink::Multipart(decoder)) => decoder.feed(data),
            Some(BodySink::Drain) | None => Ok(()),
        }
    }

    fn reject_oversized(&mut self) {
        self.status = Some(413);
        match self.sink.as_mut() {
            Some(BodySink::Multipart(decoder)) => decoder.discard_parts(),
            Some(BodySink::Store(_)) => self.sink = Some(BodySink::Drain),
            _ => {}
        }
    }

    fn finish_body(&mut self) -> Result<(), Error> {
        if !self.request.query_string.is_empty() {
            parse_form_urlencoded(&self.request.query_string, &mut self.form.parameters);
        }

        match self.sink.take() {
            Some(BodySink::Store(mut store)) => {
                store.finish_and_rewind()?;
                if self.request.is_form_urlencoded() {
                    if store.len() > self.limits.max_form_data_size {
                        return Err(Error::SizeLimitExceeded {
                            size: store.len(),
                            limit: self.limits.max_form_data_size,
                        });
                    }
                    let bytes = store.read_to_vec()?;
                    parse_form_urlencoded(&String::from_utf8_lossy(&bytes), &mut self.form.parameters);
                    store.finish_and_rewind()?;
                }
                self.body = store;
            }
            Some(BodySink::Multipart(mut decoder)) => {
                decoder.finish()?;
                for entry in decoder.take_entries() {
                    self.form.insert_entry(entry);
                }
            }
            Some(BodySink::Drain) | None => {}
        }

        expand_reserved_params(&mut self.form.parameters);
        Ok(())
    }

    fn consume_handshake(&mut self, data: &[u8], state: ReceiveState) {
        let version = self.request.websocket_version.unwrap_or(LEGACY_VERSION);

        if state == ReceiveState::Error {
            if self.transmitting {
                // 101 を送った後は閉じることしかできない
                self.close_connection = true;
                self.phase = ReplyPhase::Error;
                self.actions.push_back(Action::Close);
            } else {
                self.status = Some(400);
                self.close_connection = true;
                self.send_stock_reply();
            }
            return;
        }

        if !self.scheme.accepts_websocket_scheme(&self.request.url_scheme) {
            tracing::error!(scheme = %self.request.url_scheme, "websocket scheme mismatch");
            self.status = Some(400);
            self.close_connection = true;
            self.send_stock_reply();
            return;
        }

        if !is_supported_version(version) {
            tracing::error!(version, "unsupported websocket version");
            self.status = Some(400);
            self.close_connection = true;
            self.send_stock_reply();
            return;
        }

        if self.request.route == RouteKind::RawSocket && version == 13 {
            tracing::debug!(path = %self.request.path, "transferring socket to raw websocket resource");
            self.phase = ReplyPhase::Transferred;
            self.actions.push_back(Action::TransferSocket);
            return;
        }

        self.status = Some(101);

        match state {
            ReceiveState::Partial => {
                if self.phase == ReplyPhase::ReceivingHandshake {
                    tracing::debug!(version, "sending 101 before the rest of the handshake");
                    self.message.extend_from_slice(data);
                    self.phase = ReplyPhase::HandshakeSent;
                    self.read_more_after_write = true;
                    self.send(None, false);
                } else {
                    self.message.extend_from_slice(data);
                    self.actions.push_back(Action::ReadMore);
                }
            }
            ReceiveState::Complete => {
                self.message.extend_from_slice(data);
                if version == LEGACY_VERSION {
                    let len = self.message.len().min(LEGACY_NONCE_LEN);
                    self.handshake_nonce = Some(self.message[..len].to_vec());
                }
                self.message.clear();
                self.handshake_complete = true;
                self.phase = ReplyPhase::Open;
                self.actions.push_back(Action::Dispatch);
            }
            ReceiveState::Error => {}
        }
    }

    /// WebSocket メッセージ (またはその一部) を受け取る
    pub fn consume_websocket_message(&mut self, opcode: Opcode, data: &[u8], state: ReceiveState) {
        let mut state = state;
        let size = (self.message.len() + data.len()) as u64;
        if size > self.limits.max_memory_request_size {
            tracing::error!(
                size,
                limit = self.limits.max_memory_request_size,
                "websocket message too large"
            );
            state = ReceiveState::Error;
        } else {
            self.message.extend_from_slice(data);
        }

        match state {
            ReceiveState::Partial => return,
            ReceiveState::Error => {
                self.message.clear();
                self.close_connection = true;
                self.deliver(ReadEvent::Error);
                return;
            }
            ReceiveState::Complete => {}
        }

        match opcode {
            Opcode::Close => {
                self.message.clear();
                self.close_connection = true;
                self.phase = ReplyPhase::Closing;
                self.deliver(ReadEvent::Closed);
            }
            Opcode::Continuation | Opcode::Text => {
                let payload = std::mem::take(&mut self.message);
                self.deliver(ReadEvent::Message(payload));
            }
            Opcode::Ping => {
                let payload = std::mem::take(&mut self.message);
                self.deliver(ReadEvent::Ping(payload));
            }
            Opcode::Binary => {
                tracing::error!(len = self.message.len(), "binary websocket messages are not supported");
                self.message.clear();
                self.rearm_read();
            }
            Opcode::Pong => {
                self.message.clear();
                self.rearm_read();
            }
        }
    }

    /// 次の WebSocket メッセージを待つ
    ///
    /// 読み取りコールバックは同時に 1 つだけ登録できる。
    pub fn read_websocket_message(&mut self, callback: ReadCallback) {
        if self.read_callback.is_some() {
            tracing::debug!("websocket read already pending");
            return;
        }
        self.read_callback = Some(callback);
        self.message.clear();
        self.actions.push_back(Action::ReadMore);
    }

    fn deliver(&mut self, event: ReadEvent) {
        match self.read_callback.take() {
            Some(callback) => self.actions.push_back(Action::NotifyRead { callback, event }),
            None => tracing::warn!(?event, "websocket event without a pending read"),
        }
    }

    fn rearm_read(&mut self) {
        if let Some(callback) = self.read_callback.take() {
            self.read_websocket_message(callback);
        }
    }

    // ------------------------------------------------------------------
    // 送信
    // ------------------------------------------------------------------

    /// 送信バッファの内容を送る
    ///
    /// 書き込みが終わると `callback` が呼ばれる。送信中に呼ばれた場合は何もしない。
    /// ステータス未設定で何も送っていない状態でコールバックだけ渡された場合は、
    /// 何も送らずに `Completed` を通知する (続きのデータを待つ場合の使い方)。
    pub fn send(&mut self, callback: Option<WriteCallback>, response_complete: bool) {
        if self.write_in_flight {
            tracing::debug!("send ignored: a write is still in flight");
            return;
        }
        if self.phase.is_finished() {
            tracing::warn!(phase = ?self.phase, "send after the cycle finished");
            return;
        }
        if self.close_frame_sent {
            tracing::debug!("send ignored: close frame already sent");
            self.out_buf.clear();
            if let Some(callback) = callback {
                self.actions.push_back(Action::NotifyWrite {
                    callback,
                    event: WriteEvent::Error,
                });
            }
            return;
        }

        if self.status.is_none() {
            let continuation = !self.transmitting && !response_complete && self.out_buf.is_empty();
            if continuation && callback.is_some() {
                self.fetch_more = callback;
                self.post_fetch_more(WriteEvent::Completed);
                return;
            }
            self.status = Some(200);
        }

        self.fetch_more = callback;
        self.response_complete |= response_complete;

        let wire = match self.next_buffers() {
            Ok(wire) => wire,
            Err(e) => {
                tracing::error!(error = %e, "send aborted");
                self.out_buf.clear();
                self.sending = 0;
                if e.kind() == ErrorKind::EncodingUnsupported {
                    self.close_connection = true;
                }
                self.post_fetch_more(WriteEvent::Error);
                return;
            }
        };

        if !self.request.is_websocket() {
            self.phase = ReplyPhase::SendingResponse;
        }

        if wire.is_empty() {
            self.write_done(true);
        } else {
            self.write_in_flight = true;
            self.actions.push_back(Action::Write(wire));
        }
    }

    /// WebSocket の制御フレームを送る (ping への pong 応答など)
    pub fn send_control(&mut self, opcode: Opcode, payload: &[u8], callback: Option<WriteCallback>) {
        if self.write_in_flight || self.close_frame_sent {
            tracing::debug!(?opcode, "control frame ignored");
            return;
        }
        let version = self.request.websocket_version.unwrap_or(LEGACY_VERSION);
        match encode_control_frame(version, opcode, payload) {
            Ok(frame) => {
                self.fetch_more = callback;
                self.sending = 0;
                self.write_in_flight = true;
                self.actions.push_back(Action::Write(frame));
            }
            Err(e) => {
                tracing::error!(error = %e, ?opcode, "control frame dropped");
                if let Some(callback) = callback {
                    self.actions.push_back(Action::NotifyWrite {
                        callback,
                        event: WriteEvent::Error,
                    });
                }
            }
        }
    }

    /// 書き込みの完了を通知する
    pub fn write_done(&mut self, success: bool) {
        self.write_in_flight = false;
        if success {
            let sent = self.sending.min(self.out_buf.len());
            self.out_buf.drain(..sent);
        }
        self.sending = 0;

        let frame_dropped = std::mem::take(&mut self.frame_dropped);
        let event = if success && !frame_dropped {
            WriteEvent::Completed
        } else {
            WriteEvent::Error
        };

        if !success {
            tracing::debug!(phase = ?self.phase, "write failed");
            self.close_connection = true;
            self.phase = ReplyPhase::Error;
        } else if self.close_frame_sent {
            self.phase = ReplyPhase::Done;
        } else if !self.request.is_websocket() && self.response_complete && self.out_buf.is_empty()
        {
            self.phase = ReplyPhase::Done;
        }

        if self.read_more_after_write {
            self.read_more_after_write = false;
            if success {
                self.actions.push_back(Action::ReadMore);
            }
        }

        self.post_fetch_more(event);

        if self.phase.is_finished() && self.close_connection {
            self.actions.push_back(Action::Close);
        }
    }

    fn post_fetch_more(&mut self, event: WriteEvent) {
        if let Some(callback) = self.fetch_more.take() {
            self.actions.push_back(Action::NotifyWrite { callback, event });
        }
    }

    fn send_stock_reply(&mut self) {
        let status = self.status.unwrap_or(500);
        let response = stock_response(&self.request.version, status, self.close_connection);
        tracing::debug!(status, close = self.close_connection, "sending stock reply");

        self.out_buf = response.encode();
        self.sending = self.out_buf.len();
        self.transmitting = true;
        self.response_complete = true;
        self.fetch_more = None;
        self.phase = ReplyPhase::SendingResponse;
        self.write_in_flight = true;
        self.actions.push_back(Action::Write(self.out_buf.clone()));
    }

    fn next_buffers(&mut self) -> Result<Vec<u8>, Error> {
        if self.request.is_websocket() {
            return self.next_websocket_buffers();
        }

        let mut wire = Vec::new();
        if !self.transmitting {
            wire = self.encode_head();
            self.transmitting = true;
        }
        if self.chunked {
            if !self.out_buf.is_empty() {
                wire.extend_from_slice(&encode_chunk(&self.out_buf));
            }
            if self.response_complete {
                wire.extend_from_slice(&encode_chunk(&[]));
            }
        } else {
            wire.extend_from_slice(&self.out_buf);
        }
        self.sending = self.out_buf.len();
        Ok(wire)
    }

    fn encode_head(&mut self) -> Vec<u8> {
        let status = self.status.unwrap_or(200);
        let mut response = Response::with_version(&self.request.version, status);
        if !self.content_type.is_empty() {
            response.add_header("Content-Type", &self.content_type);
        }
        if let Some(location) = &self.location {
            response.add_header("Location", location);
        }
        let bodiless = status < 200 || status == 204 || status == 304;
        match self.content_length {
            _ if bodiless => {}
            Some(length) => response.add_header("Content-Length", &length.to_string()),
            None if self.response_complete => {
                response.add_header("Content-Length", &self.out_buf.len().to_string())
            }
            None if self.request.is_http11() => {
                self.chunked = true;
                response.add_header("Transfer-Encoding", "chunked");
            }
            // 長さが分からない HTTP/1.0 応答は接続を閉じて終端を示す
            None => self.close_connection = true,
        }
        if self.close_connection {
            response.add_header("Connection", "close");
        }
        response.encode_head()
    }

    fn next_websocket_buffers(&mut self) -> Result<Vec<u8>, Error> {
        let version = self.request.websocket_version.unwrap_or(LEGACY_VERSION);
        let mut wire = Vec::new();

        if !self.transmitting {
            wire = encode_switching_protocols(&self.request)?;
            self.transmitting = true;
        }

        self.sending = 0;
        if !self.sending_messages {
            if !self.handshake_complete {
                return Ok(wire);
            }
            if let Some(nonce) = self.handshake_nonce.take() {
                wire.extend_from_slice(&nonce);
            }
            self.sending_messages = true;
        }

        if self.phase == ReplyPhase::Closing && !self.out_buf.is_empty() {
            // close を受けた後のデータは送らずに close フレームを返す
            tracing::debug!(len = self.out_buf.len(), "data after close dropped");
            self.out_buf.clear();
        }

        if !self.out_buf.is_empty() {
            let compressed = self.request.deflate.is_some() && version != LEGACY_VERSION;
            let frame = if compressed {
                match self.deflate_out_buf() {
                    Ok(payload) => encode_text_frame(version, &payload, true)?,
                    Err(e) => {
                        // 101 とノンスは送り、このフレームだけを捨てる
                        tracing::error!(error = %e, len = self.out_buf.len(), "deflate failed, frame dropped");
                        self.out_buf.clear();
                        self.frame_dropped = true;
                        return Ok(wire);
                    }
                }
            } else {
                encode_text_frame(version, &self.out_buf, false)?
            };
            tracing::debug!(len = self.out_buf.len(), frame = frame.len(), compressed, "websocket frame");
            wire.extend_from_slice(&frame);
            self.sending = self.out_buf.len();
        } else if self.close_connection && !self.close_frame_sent {
            wire.extend_from_slice(&encode_close_frame(version)?);
            self.close_frame_sent = true;
            self.phase = ReplyPhase::Closing;
        }
        Ok(wire)
    }

    #[cfg(feature = "deflate")]
    fn deflate_out_buf(&mut self) -> Result<Vec<u8>, CompressionError> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_compression) {
            return Err(CompressionError::NoOutput);
        }
        let params = self.request.deflate.unwrap_or_default();
        self.compressor
            .get_or_insert_with(|| DeflateCompressor::new(params))
            .compress_message(&self.out_buf)
    }

    #[cfg(not(feature = "deflate"))]
    fn deflate_out_buf(&mut self) -> Result<Vec<u8>, CompressionError> {
        Err(CompressionError::Unsupported)
    }
}
