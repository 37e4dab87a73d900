//! フォームデータ
//!
//! クエリ文字列、url-encoded ボディ、multipart ボディから得たパラメーターと
//! アップロードファイルを保持する。
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_transport::form::{ParameterMap, parse_form_urlencoded};
//!
//! let mut params = ParameterMap::new();
//! parse_form_urlencoded("a=1&b=hello+world&a=2", &mut params);
//! assert_eq!(params.get("a"), Some(&["1".to_string(), "2".to_string()][..]));
//! assert_eq!(params.first("b"), Some("hello world"));
//! ```

use std::collections::HashMap;
use std::path::Path;

use tempfile::TempPath;

/// 別の url-encoded 文字列をまとめて運ぶ予約パラメーター名
pub const RESERVED_PARAMS_KEY: &str = "Wt-params";

/// パラメーターマップ
///
/// キーごとに値のリストを持つ。キーの並びは最初に現れた順、
/// 同じキーの値は追加された順を保つ。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterMap {
    index: HashMap<String, usize>,
    entries: Vec<(String, Vec<String>)>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 値を追加
    pub fn push(&mut self, key: &str, value: String) {
        match self.index.get(key) {
            Some(&i) => self.entries[i].1.push(value),
            None => {
                self.index.insert(key.to_string(), self.entries.len());
                self.entries.push((key.to_string(), vec![value]));
            }
        }
    }

    /// キーの値をすべて取得
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.index
            .get(key)
            .map(|&i| self.entries[i].1.as_slice())
    }

    /// キーの最初の値を取得
    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// キーを取り除いて値を返す
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        let i = self.index.remove(key)?;
        let (_, values) = self.entries.remove(i);
        for position in self.index.values_mut() {
            if *position > i {
                *position -= 1;
            }
        }
        Some(values)
    }

    /// キーを最初に現れた順で列挙
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.entries.clear();
    }
}

/// アップロードされたファイルパート
///
/// 一時ファイルはこの値が破棄されたときに削除される。
#[derive(Debug)]
pub struct UploadedFile {
    spool: TempPath,
    client_file_name: String,
    content_type: String,
    size: u64,
}

impl UploadedFile {
    pub(crate) fn new(
        spool: TempPath,
        client_file_name: String,
        content_type: String,
        size: u64,
    ) -> Self {
        Self {
            spool,
            client_file_name,
            content_type,
            size,
        }
    }

    /// 一時ファイルのパス
    pub fn spool_path(&self) -> &Path {
        &self.spool
    }

    /// クライアントが送ってきたファイル名
    pub fn client_file_name(&self) -> &str {
        &self.client_file_name
    }

    /// パートで宣言された Content-Type
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// ファイルサイズ
    pub fn size(&self) -> u64 {
        self.size
    }

    /// 一時ファイルを読み込む
    pub fn read_contents(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.spool_path())
    }
}

/// multipart パートの値
#[derive(Debug)]
pub enum FormValue {
    /// テキストフィールド
    Text(String),
    /// ファイルパート
    File(UploadedFile),
}

/// multipart パート 1 件分
#[derive(Debug)]
pub struct FormEntry {
    pub name: String,
    pub value: FormValue,
}

/// 1 サイクル分のフォームデータ
#[derive(Debug, Default)]
pub struct FormData {
    pub parameters: ParameterMap,
    pub files: Vec<(String, UploadedFile)>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    /// multipart パートを取り込む
    pub fn insert_entry(&mut self, entry: FormEntry) {
        match entry.value {
            FormValue::Text(value) => self.parameters.push(&entry.name, value),
            FormValue::File(file) => self.files.push((entry.name, file)),
        }
    }

    /// 指定した名前の最初のファイル
    pub fn file(&self, name: &str) -> Option<&UploadedFile> {
        self.files
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, file)| file)
    }

    /// 指定した名前のファイルをすべて取得
    pub fn files_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a UploadedFile> {
        self.files
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, file)| file)
    }

    /// パラメーターとファイルを破棄する (一時ファイルも削除される)
    pub fn clear(&mut self) {
        self.parameters.clear();
        self.files.clear();
    }
}

/// url-encoded 文字列をパースしてマップに追加
///
/// `+` は空白、`%XX` はバイトとして扱う。不正なエスケープはそのまま残す。
/// キーが空の組は無視する。
pub fn parse_form_urlencoded(input: &str, params: &mut ParameterMap) {
    for pair in input.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = url_decode(key);
        if key.is_empty() {
            continue;
        }
        params.push(&key, url_decode(value));
    }
}

/// 予約パラメーターに詰められた url-encoded 文字列を展開する
///
/// 値が 1 つだけのときに限り、同じマップへパースし直す。
pub fn expand_reserved_params(params: &mut ParameterMap) {
    let blob = match params.get(RESERVED_PARAMS_KEY) {
        Some([single]) => single.clone(),
        _ => return,
    };
    parse_form_urlencoded(&blob, params);
}

/// `+` と `%XX` を復号する
///
/// 不正な UTF-8 は置換文字になる。
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                result.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (from_hex_char(bytes[i + 1]), from_hex_char(bytes[i + 2])) {
                    (Some(high), Some(low)) => {
                        result.push((high << 4) | low);
                        i += 3;
                    }
                    _ => {
                        result.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                result.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&result).into_owned()
}

fn from_hex_char(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}
