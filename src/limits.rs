/// リクエストサイズの制限設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportLimits {
    /// メモリに保持するボディの最大サイズ (デフォルト: 128KB)
    ///
    /// これを超える Content-Length のボディは一時ファイルに退避する。
    /// WebSocket メッセージ 1 件の上限も兼ねる。
    pub max_memory_request_size: u64,
    /// url-encoded フォームボディの最大サイズ (デフォルト: 5MB)
    pub max_form_data_size: u64,
    /// リクエスト全体の最大サイズ (デフォルト: 40MB)
    ///
    /// 超過したボディは読み捨てて 413 を返す。
    pub max_request_size: u64,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_memory_request_size: 128 * 1024,   // 128KB
            max_form_data_size: 5 * 1024 * 1024,   // 5MB
            max_request_size: 40 * 1024 * 1024,    // 40MB
        }
    }
}

impl TransportLimits {
    /// 制限なしの設定を作成
    pub fn unlimited() -> Self {
        Self {
            max_memory_request_size: u64::MAX,
            max_form_data_size: u64::MAX,
            max_request_size: u64::MAX,
        }
    }

    /// メモリ保持上限を設定 (ビルダーパターン)
    pub fn max_memory_request_size(mut self, size: u64) -> Self {
        self.max_memory_request_size = size;
        self
    }

    /// フォームデータ上限を設定 (ビルダーパターン)
    pub fn max_form_data_size(mut self, size: u64) -> Self {
        self.max_form_data_size = size;
        self
    }

    /// リクエスト全体の上限を設定 (ビルダーパターン)
    pub fn max_request_size(mut self, size: u64) -> Self {
        self.max_request_size = size;
        self
    }
}
