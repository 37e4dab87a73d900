//! tokio-transport エラー型

use std::fmt;

/// tokio-transport エラー
#[derive(Debug)]
pub enum Error {
    /// I/O エラー
    Io(std::io::Error),
    /// トランスポート層のエラー
    Transport(shiguredo_transport::Error),
    /// 接続タイムアウト
    Timeout,
    /// 接続が閉じられた
    ConnectionClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Transport(e) => write!(f, "transport error: {}", e),
            Error::Timeout => write!(f, "connection timeout"),
            Error::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<shiguredo_transport::Error> for Error {
    fn from(e: shiguredo_transport::Error) -> Self {
        Error::Transport(e)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

/// Result 型エイリアス
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = Error::Transport(shiguredo_transport::Error::TruncatedBody);
        assert!(e.to_string().starts_with("transport error: "));
        assert_eq!(Error::ConnectionClosed.to_string(), "connection closed");
    }

    #[test]
    fn test_source() {
        use std::error::Error as _;

        let e = Error::from(std::io::Error::other("boom"));
        assert!(e.source().is_some());
        assert!(Error::Timeout.source().is_none());
    }
}
