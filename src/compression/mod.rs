//! permessage-deflate 圧縮/展開 (Sans I/O)
//!
//! RFC 7692 の permessage-deflate 拡張で使う圧縮/展開インターフェース。
//! 実装は `deflate` feature で有効になる flate2 バックエンド。
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_transport::compression::DeflateParams;
//!
//! // server_max_window_bits が負なら context takeover なし
//! let params = DeflateParams::from_server_max_window_bits(-1);
//! assert_eq!(params.server_window_bits, 15);
//! assert!(!params.server_context_takeover);
//!
//! // Sec-WebSocket-Extensions のオファーを解釈
//! let offer = DeflateParams::parse_offer("permessage-deflate; client_max_window_bits").unwrap();
//! assert_eq!(offer.response_header(), "permessage-deflate");
//! ```

use core::fmt;

#[cfg(feature = "deflate")]
mod deflate;

#[cfg(feature = "deflate")]
pub use deflate::{DeflateCompressor, DeflateDecompressor};

/// 1 回の圧縮/展開呼び出しで使う出力チャンクサイズ
pub const CHUNK_SIZE: usize = 16 * 1024;

/// 既定のウィンドウサイズ (2^15)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// 同期フラッシュが末尾に付ける空ブロック
pub const SYNC_FLUSH_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// 圧縮/展開エラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionError {
    /// 入力データが不正
    InvalidData(String),
    /// 内部エラー
    Internal(String),
    /// 圧縮結果が空
    NoOutput,
    /// 展開結果が上限を超えた
    OutputTooLarge { size: usize, limit: usize },
    /// deflate が無効なビルド
    Unsupported,
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionError::InvalidData(msg) => write!(f, "invalid data: {}", msg),
            CompressionError::Internal(msg) => write!(f, "internal error: {}", msg),
            CompressionError::NoOutput => write!(f, "deflate produced no output"),
            CompressionError::OutputTooLarge { size, limit } => {
                write!(f, "inflated message too large: {} > {}", size, limit)
            }
            CompressionError::Unsupported => write!(f, "deflate support is not enabled"),
        }
    }
}

impl std::error::Error for CompressionError {}

/// 処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStatus {
    /// 入力をすべて消費し、さらに入力が必要
    Continue {
        /// 消費した入力バイト数
        consumed: usize,
        /// 生成した出力バイト数
        produced: usize,
    },
    /// 入力をすべて消費し、フラッシュも完了した
    Complete {
        /// 消費した入力バイト数
        consumed: usize,
        /// 生成した出力バイト数
        produced: usize,
    },
    /// 出力バッファが満杯
    OutputFull {
        /// 消費した入力バイト数
        consumed: usize,
        /// 生成した出力バイト数
        produced: usize,
    },
}

impl CompressionStatus {
    /// 消費した入力バイト数を取得
    #[inline]
    pub fn consumed(&self) -> usize {
        match self {
            CompressionStatus::Continue { consumed, .. } => *consumed,
            CompressionStatus::Complete { consumed, .. } => *consumed,
            CompressionStatus::OutputFull { consumed, .. } => *consumed,
        }
    }

    /// 生成した出力バイト数を取得
    #[inline]
    pub fn produced(&self) -> usize {
        match self {
            CompressionStatus::Continue { produced, .. } => *produced,
            CompressionStatus::Complete { produced, .. } => *produced,
            CompressionStatus::OutputFull { produced, .. } => *produced,
        }
    }

    /// 処理が完了したかどうかを判定
    #[inline]
    pub fn is_complete(&self) -> bool {
        matches!(self, CompressionStatus::Complete { .. })
    }

    /// 出力バッファが満杯かどうかを判定
    #[inline]
    pub fn is_output_full(&self) -> bool {
        matches!(self, CompressionStatus::OutputFull { .. })
    }
}

/// 圧縮トレイト (Sans I/O)
///
/// 呼び出しごとに同期フラッシュまで行う。`OutputFull` の間は
/// 未消費の入力を渡して再度呼び出す。
pub trait Compressor {
    /// 入力データを圧縮して出力バッファに書き込む
    ///
    /// # 戻り値
    /// - `OutputFull`: 出力バッファが満杯、残りの入力で再度呼び出す必要あり
    /// - `Complete`: 入力をすべて消費しフラッシュ完了
    fn compress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<CompressionStatus, CompressionError>;

    /// 圧縮器をリセットして辞書を破棄する
    fn reset(&mut self);
}

/// 展開トレイト (Sans I/O)
pub trait Decompressor {
    /// 圧縮データを展開して出力バッファに書き込む
    ///
    /// # 戻り値
    /// - `Continue`: 入力をすべて消費した
    /// - `OutputFull`: 出力バッファが満杯、残りの入力で再度呼び出す必要あり
    /// - `Complete`: ストリーム終端に達した
    fn decompress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<CompressionStatus, CompressionError>;

    /// 展開器をリセットして辞書を破棄する
    fn reset(&mut self);
}

/// 交渉済みの permessage-deflate パラメーター
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateParams {
    /// サーバー送信方向のウィンドウビット数 (9-15)
    pub server_window_bits: u8,
    /// サーバー送信方向で辞書をメッセージ間で引き継ぐか
    pub server_context_takeover: bool,
    /// クライアント送信方向のウィンドウビット数 (9-15)
    pub client_window_bits: u8,
    /// クライアント送信方向で辞書をメッセージ間で引き継ぐか
    pub client_context_takeover: bool,
}

impl Default for DeflateParams {
    fn default() -> Self {
        Self {
            server_window_bits: DEFAULT_WINDOW_BITS,
            server_context_takeover: true,
            client_window_bits: DEFAULT_WINDOW_BITS,
            client_context_takeover: true,
        }
    }
}

impl DeflateParams {
    /// server_max_window_bits 設定値から作成
    ///
    /// 負の値は context takeover なしを表し、絶対値をウィンドウサイズとして扱う。
    /// 範囲外の値は既定の 15 になる。両方向に同じ設定を使う。
    pub fn from_server_max_window_bits(bits: i32) -> Self {
        let context_takeover = bits >= 0;
        let window_bits = clamp_window_bits(bits.unsigned_abs());
        Self {
            server_window_bits: window_bits,
            server_context_takeover: context_takeover,
            client_window_bits: window_bits,
            client_context_takeover: context_takeover,
        }
    }

    /// Sec-WebSocket-Extensions ヘッダーのオファーを解釈
    ///
    /// カンマ区切りのオファーのうち、最初に受理できる permessage-deflate を返す。
    pub fn parse_offer(header: &str) -> Option<Self> {
        header.split(',').find_map(parse_single_offer)
    }

    /// ウィンドウビット数を 9-15 に収めた値
    ///
    /// フィールドを直接組み立てた場合でも圧縮器に渡せる値になる。
    pub fn normalized(self) -> Self {
        Self {
            server_window_bits: clamp_window_bits(u32::from(self.server_window_bits)),
            client_window_bits: clamp_window_bits(u32::from(self.client_window_bits)),
            ..self
        }
    }

    /// 101 応答に載せる Sec-WebSocket-Extensions の値
    pub fn response_header(&self) -> String {
        let params = self.normalized();
        let mut value = String::from("permessage-deflate");
        if !params.server_context_takeover {
            value.push_str("; server_no_context_takeover");
        }
        if !params.client_context_takeover {
            value.push_str("; client_no_context_takeover");
        }
        if params.server_window_bits != DEFAULT_WINDOW_BITS {
            value.push_str(&format!(
                "; server_max_window_bits={}",
                params.server_window_bits
            ));
        }
        if params.client_window_bits != DEFAULT_WINDOW_BITS {
            value.push_str(&format!(
                "; client_max_window_bits={}",
                params.client_window_bits
            ));
        }
        value
    }
}

fn clamp_window_bits(bits: u32) -> u8 {
    match bits {
        // raw deflate では 8 は 9 として扱われる
        8 => 9,
        9..=15 => bits as u8,
        _ => DEFAULT_WINDOW_BITS,
    }
}

fn parse_single_offer(offer: &str) -> Option<DeflateParams> {
    let mut params = offer.split(';').map(str::trim);
    if !params.next()?.eq_ignore_ascii_case("permessage-deflate") {
        return None;
    }

    let mut result = DeflateParams::default();
    for param in params {
        if param.is_empty() {
            continue;
        }
        let (name, value) = match param.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
            None => (param, None),
        };
        if name.eq_ignore_ascii_case("server_no_context_takeover") {
            result.server_context_takeover = false;
        } else if name.eq_ignore_ascii_case("client_no_context_takeover") {
            result.client_context_takeover = false;
        } else if name.eq_ignore_ascii_case("server_max_window_bits") {
            result.server_window_bits = parse_window_bits(value?)?;
        } else if name.eq_ignore_ascii_case("client_max_window_bits") {
            // 値なしは「クライアントが対応している」だけを意味する
            if let Some(value) = value {
                result.client_window_bits = parse_window_bits(value)?;
            }
        } else {
            return None;
        }
    }
    Some(result)
}

fn parse_window_bits(value: &str) -> Option<u8> {
    let bits: u8 = value.parse().ok()?;
    (8..=15).contains(&bits).then(|| clamp_window_bits(u32::from(bits)))
}
