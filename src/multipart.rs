//! multipart/form-data のストリーミングデコード (RFC 7578)
//!
//! ## 概要
//!
//! ボディを固定容量のウィンドウに通しながら境界を探し、テキストフィールドは文字列に、
//! ファイルパートは一時ファイルに書き出す。データは任意の単位で分割して渡してよい。
//! 境界が 2 回の読み込みにまたがっても見落とさないよう、ウィンドウ末尾の
//! 境界長 + 2 バイトは常に残しておく。
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_transport::TransportLimits;
//! use shiguredo_transport::form::FormValue;
//! use shiguredo_transport::multipart::MultipartDecoder;
//!
//! let limits = TransportLimits::default();
//! let mut decoder =
//!     MultipartDecoder::from_content_type("multipart/form-data; boundary=X", &limits)?;
//!
//! decoder.feed(b"--X\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--X--")?;
//! decoder.finish()?;
//!
//! let entries = decoder.take_entries();
//! assert_eq!(entries[0].name, "a");
//! assert!(matches!(&entries[0].value, FormValue::Text(v) if v == "1"));
//! # Ok::<(), shiguredo_transport::Error>(())
//! ```

use std::io::Write;

use tempfile::NamedTempFile;

use crate::error::Error;
use crate::form::{FormEntry, FormValue, UploadedFile};
use crate::limits::TransportLimits;
use crate::scan_buffer::ScanBuffer;

/// 1 回にウィンドウへ取り込む最大バイト数
pub const READ_CHUNK_SIZE: usize = 8192;

/// 境界文字列の最大長 (`--` を含む)
pub const MAX_BOUNDARY_LEN: usize = 100;

/// パートヘッダーの最大長
pub const MAX_PART_HEAD_SIZE: usize = 16 * 1024;

const HEAD_END: &[u8] = b"\r\n\r\n";
const UPLOAD_PREFIX: &str = "transport-upload";

/// Content-Type から境界トークンを取り出す
///
/// `boundary=` の値は引用符付きでも裸でもよい。
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    fish_param(content_type, "boundary", |c| c.is_whitespace(), false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// 最初の境界より前
    Preamble,
    /// ウィンドウ先頭に境界がある
    Delimiter,
    /// パートヘッダー読み込み中
    Head,
    /// パートボディ読み込み中
    Body,
    /// 終端境界の後
    Done,
}

#[derive(Debug)]
enum Target {
    Discard,
    Text {
        name: String,
        value: Vec<u8>,
    },
    File {
        name: String,
        file: NamedTempFile,
        client_file_name: String,
        content_type: String,
        size: u64,
    },
}

impl Target {
    fn write(&mut self, data: &[u8], max_field_size: u64) -> Result<(), Error> {
        match self {
            Target::Discard => Ok(()),
            Target::Text { value, .. } => {
                let size = (value.len() + data.len()) as u64;
                if size > max_field_size {
                    return Err(Error::SizeLimitExceeded {
                        size,
                        limit: max_field_size,
                    });
                }
                value.extend_from_slice(data);
                Ok(())
            }
            Target::File { file, size, .. } => {
                file.write_all(data).map_err(|e| {
                    tracing::error!(path = %file.path().display(), error = %e, "upload write failed");
                    Error::Storage(format!("cannot write upload file: {}", e))
                })?;
                *size += data.len() as u64;
                Ok(())
            }
        }
    }
}

/// multipart/form-data デコーダー
#[derive(Debug)]
pub struct MultipartDecoder {
    delimiter: Vec<u8>,
    window: ScanBuffer,
    phase: Phase,
    head: Vec<u8>,
    target: Target,
    discarding: bool,
    max_field_size: u64,
    entries: Vec<FormEntry>,
}

impl MultipartDecoder {
    /// 境界トークンを指定して作成
    pub fn new(boundary: &str, limits: &TransportLimits) -> Result<Self, Error> {
        if boundary.is_empty() || boundary.len() + 2 > MAX_BOUNDARY_LEN {
            return Err(Error::InvalidData(format!(
                "multipart boundary length out of range: {}",
                boundary.len()
            )));
        }
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());

        Ok(Self {
            delimiter,
            window: ScanBuffer::with_capacity(READ_CHUNK_SIZE + MAX_BOUNDARY_LEN),
            phase: Phase::Preamble,
            head: Vec::new(),
            target: Target::Discard,
            discarding: false,
            max_field_size: limits.max_form_data_size,
            entries: Vec::new(),
        })
    }

    /// Content-Type ヘッダーの値から作成
    pub fn from_content_type(content_type: &str, limits: &TransportLimits) -> Result<Self, Error> {
        let boundary = boundary_from_content_type(content_type).ok_or_else(|| {
            Error::InvalidData("could not find a boundary for multipart data".to_string())
        })?;
        Self::new(&boundary, limits)
    }

    /// 以降のパートをすべて読み捨てる
    ///
    /// リクエスト全体がサイズ上限を超えた後に使う。境界の追跡だけは続け、
    /// 途中のパートと取り出し前のパートも破棄する。
    pub fn discard_parts(&mut self) {
        self.discarding = true;
        self.target = Target::Discard;
        self.entries.clear();
    }

    /// ボディの断片を渡す
    pub fn feed(&mut self, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            let n = self
                .window
                .fill(&data[..data.len().min(READ_CHUNK_SIZE)]);
            if n == 0 {
                return Err(Error::InvalidData("multipart scan window stalled".to_string()));
            }
            data = &data[n..];
            self.process()?;
        }
        Ok(())
    }

    /// 入力の終わりを通知する
    ///
    /// 終端境界まで届いていなければ `TruncatedBody`。
    pub fn finish(&mut self) -> Result<(), Error> {
        self.process()?;
        if self.phase != Phase::Done {
            self.target = Target::Discard;
            return Err(Error::TruncatedBody);
        }
        Ok(())
    }

    /// 終端境界に到達したかどうか
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    /// 完成したパートを取り出す
    pub fn take_entries(&mut self) -> Vec<FormEntry> {
        std::mem::take(&mut self.entries)
    }

    fn process(&mut self) -> Result<(), Error> {
        loop {
            match self.phase {
                Phase::Done => {
                    // エピローグは読み捨てる
                    self.window.clear();
                    return Ok(());
                }
                Phase::Preamble => {
                    if !self.scan_until_delimiter(0)? {
                        return Ok(());
                    }
                    self.phase = Phase::Delimiter;
                }
                Phase::Delimiter => {
                    let need = self.delimiter.len() + 2;
                    if self.window.len() < need {
                        return Ok(());
                    }
                    if &self.window.as_slice()[self.delimiter.len()..need] == b"--" {
                        self.phase = Phase::Done;
                    } else {
                        self.window.consume(need);
                        self.phase = Phase::Head;
                    }
                }
                Phase::Head => {
                    let window = self.window.as_slice();
                    match self.window.find(HEAD_END) {
                        Some(pos) => {
                            // 最後のヘッダー行の CRLF は残す
                            self.head.extend_from_slice(&window[..pos + 2]);
                            self.window.consume(pos + HEAD_END.len());
                            self.start_part()?;
                            self.phase = Phase::Body;
                        }
                        None => {
                            let flush = window.len().saturating_sub(HEAD_END.len());
                            self.head.extend_from_slice(&window[..flush]);
                            self.window.consume(flush);
                            if self.head.len() > MAX_PART_HEAD_SIZE {
                                return Err(Error::InvalidData(format!(
                                    "multipart part head too long: {} > {}",
                                    self.head.len(),
                                    MAX_PART_HEAD_SIZE
                                )));
                            }
                            return Ok(());
                        }
                    }
                }
                Phase::Body => {
                    if !self.scan_until_delimiter(2)? {
                        return Ok(());
                    }
                    self.finish_part()?;
                    self.phase = Phase::Delimiter;
                }
            }
        }
    }

    /// 境界を探してその手前までをターゲットへ流す
    ///
    /// 見つかれば境界の直前 `trim` バイトを除いて流し、境界の先頭まで進める。
    /// 見つからなければ境界長 + `trim` バイトを残して流す。
    fn scan_until_delimiter(&mut self, trim: usize) -> Result<bool, Error> {
        let window = self.window.as_slice();
        match self.window.find(&self.delimiter) {
            Some(pos) => {
                self.target
                    .write(&window[..pos.saturating_sub(trim)], self.max_field_size)?;
                self.window.consume(pos);
                Ok(true)
            }
            None => {
                let keep = self.delimiter.len() + trim;
                let flush = window.len().saturating_sub(keep);
                self.target.write(&window[..flush], self.max_field_size)?;
                self.window.consume(flush);
                Ok(false)
            }
        }
    }

    fn start_part(&mut self) -> Result<(), Error> {
        let head = String::from_utf8_lossy(&self.head).into_owned();
        self.head.clear();

        let mut name = String::new();
        let mut file_name = String::new();
        let mut content_type = String::new();

        for line in head.split("\r\n") {
            let trimmed = line.trim_start();
            if starts_with_ignore_case(trimmed, "content-disposition:") {
                let not_token = |c: char| c.is_whitespace() || c == ':' || c == ';';
                if let Some(value) = fish_param(line, "name", not_token, false) {
                    name = value;
                }
                if let Some(value) = fish_param(line, "filename", not_token, true) {
                    file_name = value;
                }
            }
            if starts_with_ignore_case(trimmed, "content-type:") {
                if let Some(value) = fish_value(&trimmed["content-type:".len()..]) {
                    content_type = value;
                }
            }
        }

        tracing::debug!(name = %name, file_name = %file_name, content_type = %content_type, "multipart part");

        self.target = if self.discarding {
            Target::Discard
        } else if !file_name.is_empty() {
            let file = tempfile::Builder::new()
                .prefix(UPLOAD_PREFIX)
                .tempfile()
                .map_err(|e| {
                    tracing::error!(error = %e, "upload file creation failed");
                    Error::Storage(format!("cannot create upload file: {}", e))
                })?;
            tracing::debug!(path = %file.path().display(), "spooling upload");
            Target::File {
                name,
                file,
                client_file_name: file_name,
                content_type,
                size: 0,
            }
        } else if !name.is_empty() {
            Target::Text {
                name,
                value: Vec::new(),
            }
        } else {
            Target::Discard
        };
        Ok(())
    }

    fn finish_part(&mut self) -> Result<(), Error> {
        match std::mem::replace(&mut self.target, Target::Discard) {
            Target::Discard => {}
            Target::Text { name, value } => self.entries.push(FormEntry {
                name,
                value: FormValue::Text(String::from_utf8_lossy(&value).into_owned()),
            }),
            Target::File {
                name,
                mut file,
                client_file_name,
                content_type,
                size,
            } => {
                file.flush()
                    .map_err(|e| Error::Storage(format!("cannot flush upload file: {}", e)))?;
                let spool = file.into_temp_path();
                self.entries.push(FormEntry {
                    name,
                    value: FormValue::File(UploadedFile::new(
                        spool,
                        client_file_name,
                        content_type,
                        size,
                    )),
                });
            }
        }
        Ok(())
    }
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// `key=` の値を取り出す
///
/// キーは単語の先頭でのみ一致する (`name=` は `filename=` に一致しない)。
/// 値は引用符付き、または `stop` に当たるまでの裸のトークン。
fn fish_param(
    text: &str,
    key: &str,
    stop: impl Fn(char) -> bool,
    allow_empty_quoted: bool,
) -> Option<String> {
    let bytes = text.as_bytes();
    let pattern_len = key.len() + 1;
    let mut from = 0;

    while from + pattern_len <= bytes.len() {
        let at = from;
        from += 1;
        let candidate = &bytes[at..at + pattern_len];
        if !candidate[..key.len()].eq_ignore_ascii_case(key.as_bytes())
            || candidate[key.len()] != b'='
        {
            continue;
        }
        if at > 0 && is_word_byte(bytes[at - 1]) {
            continue;
        }

        let rest = &text[at + pattern_len..];
        if let Some(quoted) = rest.strip_prefix('"') {
            if let Some(end) = quoted.find('"') {
                if end > 0 || allow_empty_quoted {
                    return Some(quoted[..end].to_string());
                }
            }
        }
        let end = rest.find(|c: char| stop(c)).unwrap_or(rest.len());
        if end > 0 {
            return Some(rest[..end].to_string());
        }
    }
    None
}

/// ヘッダー値の先頭トークンを取り出す (引用符付きも可)
fn fish_value(text: &str) -> Option<String> {
    let rest = text.trim_start();
    if let Some(quoted) = rest.strip_prefix('"') {
        if let Some(end) = quoted.find('"') {
            if end > 0 {
                return Some(quoted[..end].to_string());
            }
        }
    }
    let end = rest
        .find(|c: char| c.is_whitespace() || c == ':' || c == ';')
        .unwrap_or(rest.len());
    (end > 0).then(|| rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_decoder(boundary: &str) -> MultipartDecoder {
        MultipartDecoder::new(boundary, &TransportLimits::default()).unwrap()
    }

    fn text_value(entry: &FormEntry) -> &str {
        match &entry.value {
            FormValue::Text(v) => v,
            FormValue::File(_) => panic!("expected text"),
        }
    }

    #[test]
    fn test_boundary_from_content_type() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(
            boundary_from_content_type("multipart/form-data; BOUNDARY=\"a b;c\""),
            Some("a b;c".to_string())
        );
        assert_eq!(boundary_from_content_type("multipart/form-data"), None);
        assert_eq!(
            boundary_from_content_type("multipart/form-data; xboundary=1"),
            None
        );
    }

    #[test]
    fn test_fish_param_word_boundary() {
        let line = "Content-Disposition: form-data; filename=\"a.txt\"; name=field";
        let stop = |c: char| c.is_whitespace() || c == ':' || c == ';';
        assert_eq!(fish_param(line, "name", stop, false), Some("field".to_string()));
        assert_eq!(
            fish_param(line, "filename", stop, true),
            Some("a.txt".to_string())
        );
        assert_eq!(
            fish_param("form-data; filename=\"\"", "filename", stop, true),
            Some(String::new())
        );
    }

    #[test]
    fn test_single_field() {
        let mut decoder = new_decoder("X");
        decoder
            .feed(b"--X\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--X--")
            .unwrap();
        decoder.finish().unwrap();

        let entries = decoder.take_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a");
        assert_eq!(text_value(&entries[0]), "1");
    }

    #[test]
    fn test_fields_and_file_byte_by_byte() {
        let body = b"preamble\r\n--bnd\r\n\
            content-disposition: form-data; name=a\r\n\r\n\
            first\r\n\
            --bnd\r\n\
            Content-Disposition: form-data; name=\"up\"; filename=\"f.bin\"\r\n\
            Content-Type: application/octet-stream\r\n\r\n\
            \x00\x01--bn\r\n\x02\r\n\
            --bnd\r\n\
            Content-Disposition: form-data; name=\"a\"\r\n\r\n\
            second\r\n\
            --bnd--\r\nepilogue";

        let mut decoder = new_decoder("bnd");
        for b in body.iter() {
            decoder.feed(std::slice::from_ref(b)).unwrap();
        }
        decoder.finish().unwrap();

        let entries = decoder.take_entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(text_value(&entries[0]), "first");
        assert_eq!(text_value(&entries[2]), "second");
        match &entries[1].value {
            FormValue::File(file) => {
                assert_eq!(entries[1].name, "up");
                assert_eq!(file.client_file_name(), "f.bin");
                assert_eq!(file.content_type(), "application/octet-stream");
                assert_eq!(file.read_contents().unwrap(), b"\x00\x01--bn\r\n\x02");
                assert_eq!(file.size(), 9);
            }
            FormValue::Text(_) => panic!("expected file"),
        }
    }

    #[test]
    fn test_large_value_crosses_window() {
        let value = "v".repeat(READ_CHUNK_SIZE * 3 + 17);
        let body = format!(
            "--B\r\nContent-Disposition: form-data; name=\"big\"\r\n\r\n{}\r\n--B--",
            value
        );
        let mut decoder = new_decoder("B");
        decoder.feed(body.as_bytes()).unwrap();
        decoder.finish().unwrap();

        let entries = decoder.take_entries();
        assert_eq!(text_value(&entries[0]), value);
    }

    #[test]
    fn test_empty_name_is_skipped() {
        let mut decoder = new_decoder("X");
        decoder
            .feed(
                b"--X\r\nContent-Disposition: form-data\r\n\r\nignored\r\n\
                  --X\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\n2\r\n--X--",
            )
            .unwrap();
        decoder.finish().unwrap();

        let entries = decoder.take_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
    }

    #[test]
    fn test_discarded_files_create_nothing() {
        let mut decoder = new_decoder("X");
        decoder.discard_parts();
        decoder
            .feed(
                b"--X\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a\"\r\n\r\n\
                  data\r\n--X--",
            )
            .unwrap();
        decoder.finish().unwrap();
        assert!(decoder.take_entries().is_empty());
    }

    #[test]
    fn test_discarded_fields_are_not_kept() {
        let mut decoder = new_decoder("X");
        decoder.discard_parts();
        for i in 0..20_000 {
            let part = format!("--X\r\nContent-Disposition: form-data; name=\"f{i}\"\r\n\r\nv{i}\r\n");
            decoder.feed(part.as_bytes()).unwrap();
            assert!(decoder.take_entries().is_empty());
        }
        decoder.feed(b"--X--").unwrap();
        decoder.finish().unwrap();
        assert!(decoder.take_entries().is_empty());
    }

    #[test]
    fn test_discard_drops_part_in_progress() {
        let mut decoder = new_decoder("X");
        decoder
            .feed(
                b"--X\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n\
                  --X\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\nhalf",
            )
            .unwrap();
        decoder.discard_parts();
        decoder.feed(b"-done\r\n--X--").unwrap();
        decoder.finish().unwrap();
        assert!(decoder.take_entries().is_empty());
    }

    #[test]
    fn test_truncated_body() {
        let mut decoder = new_decoder("X");
        decoder
            .feed(b"--X\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--X")
            .unwrap();
        assert_eq!(decoder.finish(), Err(Error::TruncatedBody));
        assert!(decoder.take_entries().len() <= 1);

        let mut decoder = new_decoder("X");
        decoder.feed(b"no boundary here").unwrap();
        assert_eq!(decoder.finish(), Err(Error::TruncatedBody));
    }

    #[test]
    fn test_field_size_limit() {
        let limits = TransportLimits::default().max_form_data_size(4);
        let mut decoder = MultipartDecoder::new("X", &limits).unwrap();
        let result = decoder
            .feed(b"--X\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n123456\r\n--X--");
        assert!(matches!(result, Err(Error::SizeLimitExceeded { .. })));
    }

    #[test]
    fn test_invalid_boundary() {
        let limits = TransportLimits::default();
        assert!(MultipartDecoder::new("", &limits).is_err());
        assert!(MultipartDecoder::new(&"b".repeat(99), &limits).is_err());
        assert!(MultipartDecoder::from_content_type("multipart/form-data", &limits).is_err());
    }

    #[test]
    fn test_head_too_long() {
        let mut decoder = new_decoder("X");
        let mut body = b"--X\r\nContent-Disposition: form-data; name=\"a\"".to_vec();
        body.extend(std::iter::repeat_n(b'x', MAX_PART_HEAD_SIZE + 10));
        assert!(matches!(decoder.feed(&body), Err(Error::InvalidData(_))));
    }
}
