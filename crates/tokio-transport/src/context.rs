//! サーバー全体で共有する設定
//!
//! 接続より先に作られ、すべての接続が閉じた後に破棄される。

use std::time::Duration;

use shiguredo_transport::{ConnectionScheme, RequestDescriptor, TransportLimits};

/// リクエストヘッドのパーサー
///
/// ヘッドのパースとルーティングは外側の層が受け持つ。
pub trait HeadParser: Send + Sync + 'static {
    /// `buf` の先頭からリクエストヘッドを読み取る
    ///
    /// ヘッドが揃っていなければ `Ok(None)`。揃っていれば記述子とヘッドのバイト数を返す。
    fn parse(
        &self,
        buf: &[u8],
    ) -> Result<Option<(RequestDescriptor, usize)>, shiguredo_transport::Error>;
}

/// 関数からパーサーを作成
impl<F> HeadParser for F
where
    F: Fn(&[u8]) -> Result<Option<(RequestDescriptor, usize)>, shiguredo_transport::Error>
        + Send
        + Sync
        + 'static,
{
    fn parse(
        &self,
        buf: &[u8],
    ) -> Result<Option<(RequestDescriptor, usize)>, shiguredo_transport::Error> {
        (self)(buf)
    }
}

/// 接続処理が参照する設定とコラボレーター
pub struct ServerContext<P, D> {
    pub limits: TransportLimits,
    pub scheme: ConnectionScheme,
    /// 1 回の読み取りで使うバッファサイズ
    pub read_buffer_size: usize,
    /// リクエストヘッドの最大サイズ
    pub max_head_size: usize,
    /// 次のリクエストを待つ時間
    pub keep_alive_timeout: Duration,
    pub parser: P,
    pub dispatcher: D,
}

impl<P, D> ServerContext<P, D> {
    pub fn new(parser: P, dispatcher: D) -> Self {
        Self {
            limits: TransportLimits::default(),
            scheme: ConnectionScheme::Http,
            read_buffer_size: 8192,
            max_head_size: 64 * 1024,
            keep_alive_timeout: Duration::from_secs(60),
            parser,
            dispatcher,
        }
    }
}

impl<P, D> std::fmt::Debug for ServerContext<P, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("limits", &self.limits)
            .field("scheme", &self.scheme)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("max_head_size", &self.max_head_size)
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .finish()
    }
}
