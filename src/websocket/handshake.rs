use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::Md5;
use sha1::{Digest, Sha1};

use crate::error::Error;
use crate::request::RequestDescriptor;
use crate::response::Response;

use super::frame::{LEGACY_VERSION, is_supported_version};

/// Sec-WebSocket-Accept の計算に使う GUID (RFC 6455 Section 1.3)
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// 旧プロトコルのハンドシェイク応答に載せるナンスの長さ
pub const LEGACY_NONCE_LEN: usize = 16;

/// Sec-WebSocket-Key から Sec-WebSocket-Accept を計算
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// 旧プロトコルのキー 3 の長さ (ヘッドの後に続くボディ)
pub const LEGACY_KEY3_LEN: usize = 8;

/// 旧プロトコルのチャレンジ応答を計算
///
/// Key1 / Key2 の数字を連結した値を空白の数で割り、それぞれ 32 ビットのビッグエンディアンにして
/// キー 3 の 8 バイトと連結した MD5 が応答の 16 バイトになる。
pub fn legacy_challenge(key1: &str, key2: &str, key3: &[u8]) -> Result<[u8; LEGACY_NONCE_LEN], Error> {
    if key3.len() != LEGACY_KEY3_LEN {
        return Err(Error::InvalidData(format!(
            "websocket key3 must be {} bytes, got {}",
            LEGACY_KEY3_LEN,
            key3.len()
        )));
    }

    let mut hasher = Md5::new();
    hasher.update(legacy_key_number(key1)?.to_be_bytes());
    hasher.update(legacy_key_number(key2)?.to_be_bytes());
    hasher.update(key3);
    let mut nonce = [0u8; LEGACY_NONCE_LEN];
    nonce.copy_from_slice(&hasher.finalize());
    Ok(nonce)
}

fn legacy_key_number(key: &str) -> Result<u32, Error> {
    let invalid = || Error::InvalidData(format!("invalid websocket legacy key: {:?}", key));

    let mut number: u64 = 0;
    for digit in key.bytes().filter(u8::is_ascii_digit) {
        number = number
            .checked_mul(10)
            .and_then(|n| n.checked_add(u64::from(digit - b'0')))
            .ok_or_else(invalid)?;
    }
    let spaces = key.bytes().filter(|&b| b == b' ').count() as u64;
    if spaces == 0 || number % spaces != 0 {
        return Err(invalid());
    }
    u32::try_from(number / spaces).map_err(|_| invalid())
}

/// 101 応答ヘッドをエンコード
///
/// 旧プロトコルではナンスをこの後に別途送る。
pub fn encode_switching_protocols(request: &RequestDescriptor) -> Result<Vec<u8>, Error> {
    let version = request
        .websocket_version
        .ok_or_else(|| Error::InvalidData("not a websocket request".to_string()))?;
    if !is_supported_version(version) {
        return Err(Error::EncodingUnsupported { version });
    }

    if version == LEGACY_VERSION {
        let mut response = Response::with_version(&request.version, 101)
            .header("Upgrade", "WebSocket")
            .header("Connection", "Upgrade");
        response.reason_phrase = "WebSocket Protocol Handshake".to_string();
        return Ok(response.encode_head());
    }

    let key = request
        .websocket_key
        .as_deref()
        .ok_or_else(|| Error::InvalidData("missing Sec-WebSocket-Key".to_string()))?;
    let mut response = Response::with_version(&request.version, 101)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", &accept_key(key));
    if let Some(params) = &request.deflate {
        response.add_header("Sec-WebSocket-Extensions", &params.response_header());
    }
    Ok(response.encode_head())
}
