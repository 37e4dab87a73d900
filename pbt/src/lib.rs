//! PBT テスト共通ユーティリティ

use proptest::prelude::*;

// ========================================
// multipart/form-data 生成
// ========================================

/// 境界トークン
pub fn boundary() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9]{8,32}".prop_map(|s| s)
}

/// フィールド名 (RFC 7578)
pub fn field_name() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_]{0,15}".prop_map(|s| s)
}

/// ファイル名
pub fn file_name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_]{1,16}\\.[a-z]{1,4}".prop_map(|s| s)
}

/// テキスト値
pub fn text_value() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 .,!?]{0,64}".prop_map(|s| s)
}

/// ファイル内容
///
/// `-` を含めないので境界と衝突しない。CR/LF は含む。
pub fn file_bytes() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>().prop_filter("no dash", |b| *b != b'-'), 0..2048)
}

/// multipart のパート
#[derive(Debug, Clone)]
pub enum GeneratedPart {
    Field { name: String, value: String },
    File { name: String, file_name: String, data: Vec<u8> },
}

pub fn part() -> impl Strategy<Value = GeneratedPart> {
    prop_oneof![
        (field_name(), text_value()).prop_map(|(name, value)| GeneratedPart::Field { name, value }),
        (field_name(), file_name(), file_bytes())
            .prop_map(|(name, file_name, data)| GeneratedPart::File { name, file_name, data }),
    ]
}

/// パート列から multipart ボディを組み立てる
pub fn multipart_body(boundary: &str, parts: &[GeneratedPart]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match part {
            GeneratedPart::Field { name, value } => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            GeneratedPart::File {
                name,
                file_name,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

/// ボディを分割する位置
///
/// 1 バイト単位の分割も含む。
pub fn chunk_sizes() -> impl Strategy<Value = Vec<usize>> {
    proptest::collection::vec(1usize..64, 1..32)
}

/// `sizes` を繰り返し使ってデータを分割する
pub fn split_by<'a>(data: &'a [u8], sizes: &[usize]) -> Vec<&'a [u8]> {
    let mut chunks = Vec::new();
    let mut rest = data;
    let mut i = 0;
    while !rest.is_empty() {
        let n = sizes[i % sizes.len()].min(rest.len());
        let (head, tail) = rest.split_at(n);
        chunks.push(head);
        rest = tail;
        i += 1;
    }
    chunks
}
