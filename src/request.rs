use crate::compression::DeflateParams;

/// リクエストの受け先
///
/// ディスパッチ時に一度だけ決まり、そのサイクルの間は変わらない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteKind {
    /// フレームワークが応答を組み立てる通常の経路
    #[default]
    Framework,
    /// アップグレード後のソケットをリソースがそのまま引き取る経路
    RawSocket,
}

/// 接続のスキーム
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionScheme {
    #[default]
    Http,
    Https,
}

impl ConnectionScheme {
    /// WebSocket の URL スキームがこの接続と整合するか
    ///
    /// `ws` は平文接続、`wss` は TLS 接続でのみ受け付ける。
    pub fn accepts_websocket_scheme(&self, url_scheme: &str) -> bool {
        match self {
            ConnectionScheme::Http => url_scheme.eq_ignore_ascii_case("ws"),
            ConnectionScheme::Https => url_scheme.eq_ignore_ascii_case("wss"),
        }
    }
}

/// パース済みリクエストヘッドのうち、トランスポートが参照する部分
///
/// ヘッド自体のパースは外側の層が行う。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// HTTP メソッド
    pub method: String,
    /// HTTP バージョン (デフォルト: HTTP/1.1)
    pub version: String,
    /// リクエストパス
    pub path: String,
    /// クエリ文字列 (`?` を含まない)
    pub query_string: String,
    /// Content-Length (宣言がなければ None)
    pub content_length: Option<u64>,
    /// Content-Type
    pub content_type: Option<String>,
    /// URL スキーム (http, https, ws, wss)
    pub url_scheme: String,
    /// WebSocket バージョン (WebSocket でなければ None、旧プロトコルは 0)
    pub websocket_version: Option<u32>,
    /// Sec-WebSocket-Key
    pub websocket_key: Option<String>,
    /// 旧プロトコルの Sec-WebSocket-Key1 / Sec-WebSocket-Key2
    pub legacy_keys: Option<(String, String)>,
    /// 交渉済みの permessage-deflate パラメーター
    pub deflate: Option<DeflateParams>,
    /// Keep-Alive を要求しているか
    pub keep_alive: bool,
    /// 受け先
    pub route: RouteKind,
}

impl RequestDescriptor {
    /// 新しい記述子を作成 (HTTP/1.1)
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            version: "HTTP/1.1".to_string(),
            path: path.to_string(),
            query_string: String::new(),
            content_length: None,
            content_type: None,
            url_scheme: "http".to_string(),
            websocket_version: None,
            websocket_key: None,
            legacy_keys: None,
            deflate: None,
            keep_alive: true,
            route: RouteKind::Framework,
        }
    }

    /// WebSocket アップグレード要求として作成
    pub fn websocket(path: &str, version: u32) -> Self {
        let mut request = Self::new("GET", path);
        request.url_scheme = "ws".to_string();
        request.websocket_version = Some(version);
        request
    }

    /// HTTP バージョンを設定 (ビルダーパターン)
    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// クエリ文字列を設定 (ビルダーパターン)
    pub fn query_string(mut self, query: &str) -> Self {
        self.query_string = query.to_string();
        self
    }

    /// Content-Length を設定 (ビルダーパターン)
    pub fn content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    /// Content-Type を設定 (ビルダーパターン)
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    /// URL スキームを設定 (ビルダーパターン)
    pub fn url_scheme(mut self, scheme: &str) -> Self {
        self.url_scheme = scheme.to_string();
        self
    }

    /// Sec-WebSocket-Key を設定 (ビルダーパターン)
    pub fn websocket_key(mut self, key: &str) -> Self {
        self.websocket_key = Some(key.to_string());
        self
    }

    /// 旧プロトコルの Sec-WebSocket-Key1 / Key2 を設定 (ビルダーパターン)
    pub fn legacy_keys(mut self, key1: &str, key2: &str) -> Self {
        self.legacy_keys = Some((key1.to_string(), key2.to_string()));
        self
    }

    /// permessage-deflate パラメーターを設定 (ビルダーパターン)
    pub fn deflate(mut self, params: DeflateParams) -> Self {
        self.deflate = Some(params);
        self
    }

    /// Keep-Alive を設定 (ビルダーパターン)
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// 受け先を設定 (ビルダーパターン)
    pub fn route(mut self, route: RouteKind) -> Self {
        self.route = route;
        self
    }

    /// WebSocket アップグレード要求かどうか
    pub fn is_websocket(&self) -> bool {
        self.websocket_version.is_some()
    }

    /// Content-Type が multipart/form-data かどうか
    pub fn is_multipart(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| starts_with_ignore_case(ct, "multipart/form-data"))
    }

    /// ボディを url-encoded フォームとして解釈すべきかどうか
    ///
    /// POST に限り、application/x-www-form-urlencoded に加えて
    /// クエリに `&contentType=x-www-form-urlencoded` を含む場合も対象になる。
    pub fn is_form_urlencoded(&self) -> bool {
        if self.method != "POST" {
            return false;
        }
        let declared = self
            .content_type
            .as_deref()
            .is_some_and(|ct| starts_with_ignore_case(ct, "application/x-www-form-urlencoded"));
        declared
            || self
                .query_string
                .contains("&contentType=x-www-form-urlencoded")
    }

    /// HTTP/1.1 以降かどうか
    pub fn is_http11(&self) -> bool {
        self.version.ends_with("/1.1")
    }
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}
