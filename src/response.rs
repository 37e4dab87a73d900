/// 応答メッセージ
///
/// 応答ヘッドのエンコードと、エラー時の定型応答の組み立てに使う。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP バージョン (HTTP/1.1 等)
    pub version: String,
    /// ステータスコード
    pub status_code: u16,
    /// ステータスフレーズ
    pub reason_phrase: String,
    /// ヘッダー
    pub headers: Vec<(String, String)>,
    /// ボディ
    pub body: Vec<u8>,
}

impl Response {
    /// 新しい応答を作成 (HTTP/1.1)
    pub fn new(status_code: u16) -> Self {
        Self::with_version("HTTP/1.1", status_code)
    }

    /// バージョンを指定して作成
    pub fn with_version(version: &str, status_code: u16) -> Self {
        Self {
            version: version.to_string(),
            status_code,
            reason_phrase: reason_phrase(status_code).to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// ヘッダーを追加 (ビルダーパターン)
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// ボディを設定 (ビルダーパターン)
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// ヘッダーを追加
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// ヘッダーを取得 (大文字小文字を区別しない)
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// ヘッダーが存在するか確認
    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// ステータス行とヘッダーだけをエンコード
    pub fn encode_head(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        // Status line: VERSION SP STATUS SP REASON CRLF
        buf.extend_from_slice(self.version.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status_code.to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.reason_phrase.as_bytes());
        buf.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// ボディ込みでエンコード
    ///
    /// 1xx/204 以外で長さの指定がなければ Content-Length を付ける。
    pub fn encode(&self) -> Vec<u8> {
        let needs_length = !(100..200).contains(&self.status_code)
            && self.status_code != 204
            && !self.has_header("Content-Length")
            && !self.has_header("Transfer-Encoding");

        if needs_length {
            let mut with_length = self.clone();
            with_length.add_header("Content-Length", &self.body.len().to_string());
            let mut buf = with_length.encode_head();
            buf.extend_from_slice(&self.body);
            return buf;
        }

        let mut buf = self.encode_head();
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// ステータスコードの既定フレーズ
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Request Entity Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// エラー時の定型応答
///
/// 小さな HTML ボディを持つ完結した応答を返す。
pub fn stock_response(version: &str, status_code: u16, close: bool) -> Response {
    let phrase = reason_phrase(status_code);
    let body = format!(
        "<html><head><title>{phrase}</title></head><body><h1>{status_code} {phrase}</h1></body></html>"
    );
    let mut response = Response::with_version(version, status_code)
        .header("Content-Type", "text/html")
        .body(body.into_bytes());
    if close {
        response.add_header("Connection", "close");
    }
    response
}

/// データを chunked 形式でエンコード
///
/// 空のデータは終端チャンクになる。
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();

    if data.is_empty() {
        // 終端チャンク
        buf.extend_from_slice(b"0\r\n\r\n");
    } else {
        // チャンクサイズ (16進数)
        buf.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        buf.extend_from_slice(data);
        buf.extend_from_slice(b"\r\n");
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_with_length() {
        let response = Response::new(200)
            .header("Content-Type", "text/plain")
            .body(b"ok".to_vec());
        assert_eq!(
            response.encode(),
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok"
        );
    }

    #[test]
    fn test_switching_protocols_has_no_length() {
        let response = Response::new(101).header("Upgrade", "websocket");
        assert_eq!(
            response.encode(),
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n"
        );
    }

    #[test]
    fn test_stock_response() {
        let response = stock_response("HTTP/1.1", 413, true);
        assert_eq!(response.reason_phrase, "Request Entity Too Large");
        assert_eq!(response.get_header("connection"), Some("close"));
        let encoded = response.encode();
        assert!(encoded.starts_with(b"HTTP/1.1 413 Request Entity Too Large\r\n"));
        assert!(String::from_utf8_lossy(&encoded).contains("<h1>413 Request Entity Too Large</h1>"));
    }

    #[test]
    fn test_encode_chunk() {
        assert_eq!(encode_chunk(b"hello"), b"5\r\nhello\r\n");
        assert_eq!(encode_chunk(&[0u8; 26])[..4], *b"1a\r\n");
        assert_eq!(encode_chunk(b""), b"0\r\n\r\n");
    }
}
