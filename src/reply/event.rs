use std::fmt;

/// 受信データの到着状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// まだ続きがある
    Partial,
    /// これで最後
    Complete,
    /// 読み取りに失敗した
    Error,
}

/// 1 サイクルの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPhase {
    /// ボディ受信中
    ReceivingBody,
    /// ディスパッチ要求を積んだ
    Dispatched,
    /// アプリケーションの応答待ち
    AwaitingResponse,
    /// 応答送信中
    SendingResponse,
    /// 完了
    Done,
    /// 失敗
    Error,
    /// WebSocket ハンドシェイク受信中
    ReceivingHandshake,
    /// 101 を送った (ハンドシェイクの残りを待つ)
    HandshakeSent,
    /// WebSocket メッセージ送受信中
    Open,
    /// 接続終了処理中
    Closing,
    /// ソケットを引き渡した
    Transferred,
}

impl ReplyPhase {
    /// サイクルが終わったかどうか
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ReplyPhase::Done | ReplyPhase::Error | ReplyPhase::Transferred
        )
    }
}

/// 書き込み完了の通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEvent {
    Completed,
    Error,
}

/// WebSocket 読み取りの通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// テキストメッセージを受信した
    Message(Vec<u8>),
    /// ping を受信した (ペイロードは pong で返す)
    Ping(Vec<u8>),
    /// close を受信した
    Closed,
    /// 読み取りに失敗した
    Error,
}

pub type WriteCallback = Box<dyn FnOnce(WriteEvent) + Send>;
pub type ReadCallback = Box<dyn FnOnce(ReadEvent) + Send>;

/// 呼び出し側が実行する処理
///
/// `Reply` はコールバックを直接呼ばず、すべてこのキューに積む。
/// 呼び出し側は `Reply` の処理から戻った後で順に実行する。
pub enum Action {
    /// リクエストをアプリケーションへ渡す
    Dispatch,
    /// バイト列を書き込み、終わったら `Reply::write_done` を呼ぶ
    Write(Vec<u8>),
    /// 続きを読み込む
    ReadMore,
    /// 書き込み完了コールバックを呼ぶ
    NotifyWrite {
        callback: WriteCallback,
        event: WriteEvent,
    },
    /// 読み取りコールバックを呼ぶ
    NotifyRead {
        callback: ReadCallback,
        event: ReadEvent,
    },
    /// 読み込みを止めてソケットを引き渡す
    TransferSocket,
    /// 接続を閉じる
    Close,
}

impl Action {
    /// コールバックを伴う通知なら実行する
    ///
    /// それ以外の処理はそのまま返す。
    pub fn run_notification(self) -> Option<Action> {
        match self {
            Action::NotifyWrite { callback, event } => {
                callback(event);
                None
            }
            Action::NotifyRead { callback, event } => {
                callback(event);
                None
            }
            other => Some(other),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Dispatch => write!(f, "Dispatch"),
            Action::Write(bytes) => write!(f, "Write({} bytes)", bytes.len()),
            Action::ReadMore => write!(f, "ReadMore"),
            Action::NotifyWrite { event, .. } => write!(f, "NotifyWrite({:?})", event),
            Action::NotifyRead { event, .. } => write!(f, "NotifyRead({:?})", event),
            Action::TransferSocket => write!(f, "TransferSocket"),
            Action::Close => write!(f, "Close"),
        }
    }
}
