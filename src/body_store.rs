//! リクエストボディの保持
//!
//! 宣言された長さがメモリ上限以下ならメモリに、超えるなら一時ファイルに貯める。
//! どちらを使うかは `begin_write` の時点で一度だけ決まる。
//!
//! 一時ファイルは書き込みのたびに開いて閉じる。遅いアップロードが
//! ファイルディスクリプターを握り続けないようにするため。
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_transport::{BodyStore, TransportLimits};
//!
//! let limits = TransportLimits::default();
//! let mut store = BodyStore::begin_write(Some(5), &limits);
//! store.write(b"hello")?;
//! store.finish_and_rewind()?;
//!
//! let mut buf = [0u8; 16];
//! let n = store.read(&mut buf)?;
//! assert_eq!(&buf[..n], b"hello");
//! # Ok::<(), shiguredo_transport::Error>(())
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use tempfile::TempPath;

use crate::error::Error;
use crate::limits::TransportLimits;

const SPOOL_PREFIX: &str = "transport-spool";

#[derive(Debug)]
enum Backing {
    Memory {
        data: Vec<u8>,
        position: usize,
    },
    Spool {
        // 最初の書き込みで作成する
        path: Option<TempPath>,
        reader: Option<File>,
    },
}

/// リクエストボディのストア
#[derive(Debug)]
pub struct BodyStore {
    backing: Backing,
    len: u64,
}

impl Default for BodyStore {
    fn default() -> Self {
        Self::memory()
    }
}

impl BodyStore {
    /// 空のメモリストアを作成
    pub fn memory() -> Self {
        Self {
            backing: Backing::Memory {
                data: Vec::new(),
                position: 0,
            },
            len: 0,
        }
    }

    /// 一時ファイルを使うストアを作成
    pub fn spool() -> Self {
        Self {
            backing: Backing::Spool {
                path: None,
                reader: None,
            },
            len: 0,
        }
    }

    /// 宣言された長さに応じてストアを選ぶ
    pub fn begin_write(declared_length: Option<u64>, limits: &TransportLimits) -> Self {
        match declared_length {
            Some(length) if length > limits.max_memory_request_size => Self::spool(),
            _ => Self::memory(),
        }
    }

    /// ボディを追記
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.backing {
            Backing::Memory { data: buf, .. } => buf.extend_from_slice(data),
            Backing::Spool { path, .. } => {
                if path.is_none() {
                    *path = Some(create_spool()?);
                }
                if let Some(path) = path {
                    append_to(path, data).map_err(|e| {
                        tracing::error!(path = %path.display(), error = %e, "spool write failed");
                        Error::Storage(format!("cannot write spool file: {}", e))
                    })?;
                }
            }
        }
        self.len += data.len() as u64;
        Ok(())
    }

    /// 書き込みを終えて先頭から読める状態にする
    pub fn finish_and_rewind(&mut self) -> Result<(), Error> {
        match &mut self.backing {
            Backing::Memory { position, .. } => *position = 0,
            Backing::Spool { path, reader } => {
                *reader = match path {
                    Some(path) => Some(File::open(&*path).map_err(|e| {
                        tracing::error!(path = %path.display(), error = %e, "spool reopen failed");
                        Error::Storage(format!("cannot reopen spool file: {}", e))
                    })?),
                    None => None,
                };
            }
        }
        Ok(())
    }

    /// 最大 `buf.len()` バイト読み込む
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match &mut self.backing {
            Backing::Memory { data, position } => {
                let n = (data.len() - *position).min(buf.len());
                buf[..n].copy_from_slice(&data[*position..*position + n]);
                *position += n;
                Ok(n)
            }
            Backing::Spool { reader, .. } => match reader {
                Some(file) => Ok(file.read(buf)?),
                None => Ok(0),
            },
        }
    }

    /// 残りをすべて読み込む
    ///
    /// 書き込んだ長さに届かなければ `ShortRead`。
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>, Error> {
        let mut result = Vec::with_capacity(self.len.min(usize::MAX as u64) as usize);
        let mut buf = [0u8; 8192];
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                break;
            }
            result.extend_from_slice(&buf[..n]);
        }
        if (result.len() as u64) < self.len {
            return Err(Error::ShortRead {
                expected: self.len,
                actual: result.len() as u64,
            });
        }
        Ok(result)
    }

    /// 書き込まれたバイト数
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 一時ファイルを使っているかどうか
    pub fn is_spooled(&self) -> bool {
        matches!(self.backing, Backing::Spool { .. })
    }

    /// 一時ファイルのパス (まだ作成されていなければ None)
    pub fn spool_path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Spool { path, .. } => path.as_deref(),
            Backing::Memory { .. } => None,
        }
    }
}

impl Read for BodyStore {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        BodyStore::read(self, buf).map_err(std::io::Error::other)
    }
}

fn create_spool() -> Result<TempPath, Error> {
    let file = tempfile::Builder::new()
        .prefix(SPOOL_PREFIX)
        .tempfile()
        .map_err(|e| {
            tracing::error!(error = %e, "spool creation failed");
            Error::Storage(format!("cannot create spool file: {}", e))
        })?;
    let path = file.into_temp_path();
    tracing::debug!(path = %path.display(), "spool file created");
    Ok(path)
}

fn append_to(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(data)
}
