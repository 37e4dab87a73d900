use std::fmt;

use crate::compression::CompressionError;

/// エラー分類
///
/// 各エラーがどの失敗クラスに属するかを示す。
/// 分類によって応答ステータスと接続の扱いが決まる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 一時ファイルの作成/再オープン失敗、宣言サイズに満たない読み取り
    Transport,
    /// 不正なボディ、スキーム不一致、multipart の途中切断
    Protocol,
    /// ボディまたはフォームデータのサイズ超過
    SizeLimit,
    /// deflate 圧縮/展開の失敗
    Compression,
    /// 対応していない WebSocket バージョン
    EncodingUnsupported,
}

/// トランスポートエラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// 一時ファイルの I/O エラー
    Storage(String),
    /// 宣言された長さを読み切れなかった
    ShortRead { expected: u64, actual: u64 },
    /// 終端境界の前に入力が尽きた
    TruncatedBody,
    /// 不正なデータ
    InvalidData(String),
    /// サイズ制限超過
    SizeLimitExceeded { size: u64, limit: u64 },
    /// 圧縮/展開エラー
    Compression(CompressionError),
    /// 未対応の WebSocket バージョン
    EncodingUnsupported { version: u32 },
}

impl Error {
    /// エラー分類を取得
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Storage(_) | Error::ShortRead { .. } => ErrorKind::Transport,
            Error::TruncatedBody | Error::InvalidData(_) => ErrorKind::Protocol,
            Error::SizeLimitExceeded { .. } => ErrorKind::SizeLimit,
            Error::Compression(_) => ErrorKind::Compression,
            Error::EncodingUnsupported { .. } => ErrorKind::EncodingUnsupported,
        }
    }

    /// このエラーに対応する応答ステータスコード
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Protocol => 400,
            ErrorKind::SizeLimit => 413,
            ErrorKind::Transport | ErrorKind::Compression | ErrorKind::EncodingUnsupported => 500,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Storage(msg) => write!(f, "storage error: {}", msg),
            Error::ShortRead { expected, actual } => {
                write!(f, "short read: expected {} bytes, got {}", expected, actual)
            }
            Error::TruncatedBody => write!(f, "body ended before the closing boundary"),
            Error::InvalidData(msg) => write!(f, "invalid data: {}", msg),
            Error::SizeLimitExceeded { size, limit } => {
                write!(f, "size limit exceeded: {} > {}", size, limit)
            }
            Error::Compression(e) => write!(f, "compression error: {}", e),
            Error::EncodingUnsupported { version } => {
                write!(f, "unsupported websocket version: {}", version)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Compression(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CompressionError> for Error {
    fn from(e: CompressionError) -> Self {
        Error::Compression(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_by_kind() {
        assert_eq!(Error::Storage("x".to_string()).status_code(), 500);
        assert_eq!(
            Error::ShortRead {
                expected: 10,
                actual: 3
            }
            .status_code(),
            500
        );
        assert_eq!(Error::TruncatedBody.status_code(), 400);
        assert_eq!(Error::InvalidData("x".to_string()).status_code(), 400);
        assert_eq!(
            Error::SizeLimitExceeded { size: 2, limit: 1 }.status_code(),
            413
        );
        assert_eq!(
            Error::EncodingUnsupported { version: 9 }.kind(),
            ErrorKind::EncodingUnsupported
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::SizeLimitExceeded { size: 20, limit: 10 }.to_string(),
            "size limit exceeded: 20 > 10"
        );
        assert_eq!(
            Error::EncodingUnsupported { version: 9 }.to_string(),
            "unsupported websocket version: 9"
        );
    }

    #[test]
    fn test_from_io_error() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(e.kind(), ErrorKind::Transport);
    }
}
