/// 固定容量のスキャンウィンドウ
///
/// 未消費のバイトを `start..end` の範囲で保持する。`fill` で後ろに追加し、
/// `consume` で先頭から捨てる。末尾に空きが足りなくなったときだけ
/// 未消費部分を先頭へ詰める。保持量が容量を超えることはない。
#[derive(Debug, Clone)]
pub struct ScanBuffer {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl ScanBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// 未消費のバイト数
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// 追加できるバイト数
    pub fn free_space(&self) -> usize {
        self.capacity() - self.len()
    }

    /// 未消費のバイト列
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// 未消費部分から部分列を探す
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        find_bytes(self.as_slice(), needle)
    }

    /// 空きの範囲でデータを追加し、追加したバイト数を返す
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free_space());
        if n == 0 {
            return 0;
        }
        if self.capacity() - self.end < n {
            self.compact();
        }
        self.buf[self.end..self.end + n].copy_from_slice(&data[..n]);
        self.end += n;
        n
    }

    /// 先頭から `n` バイト捨てる
    ///
    /// `n` が未消費のバイト数を超える場合はすべて捨てる。
    pub fn consume(&mut self, n: usize) {
        self.start += n.min(self.len());
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    fn compact(&mut self) {
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }
}

/// バイト列から部分列を検索
pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > haystack.len() {
        return None;
    }

    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_respects_capacity() {
        let mut buf = ScanBuffer::with_capacity(8);
        assert_eq!(buf.fill(b"0123456789"), 8);
        assert_eq!(buf.as_slice(), b"01234567");
        assert_eq!(buf.free_space(), 0);
        assert_eq!(buf.fill(b"x"), 0);
    }

    #[test]
    fn test_compaction_keeps_content() {
        let mut buf = ScanBuffer::with_capacity(8);
        buf.fill(b"abcdef");
        buf.consume(4);
        assert_eq!(buf.as_slice(), b"ef");

        // 末尾の空きは 2 バイトだけなので詰め直しが起きる
        assert_eq!(buf.fill(b"ghijkl"), 6);
        assert_eq!(buf.as_slice(), b"efghijkl");
        assert_eq!(buf.len(), buf.capacity());
    }

    #[test]
    fn test_find_and_consume_all() {
        let mut buf = ScanBuffer::with_capacity(16);
        buf.fill(b"xx--bound");
        assert_eq!(buf.find(b"--bound"), Some(2));
        assert_eq!(buf.find(b"--other"), None);

        buf.consume(100);
        assert!(buf.is_empty());
        assert_eq!(buf.free_space(), 16);
    }
}
