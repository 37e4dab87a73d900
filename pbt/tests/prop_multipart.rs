//! multipart/form-data デコーダーのプロパティテスト

use pbt::{GeneratedPart, boundary, chunk_sizes, multipart_body, part, split_by};
use proptest::prelude::*;
use shiguredo_transport::form::{FormEntry, FormValue};
use shiguredo_transport::multipart::MultipartDecoder;
use shiguredo_transport::{
    Action, ConnectionScheme, ReceiveState, Reply, RequestDescriptor, TransportLimits,
};

/// 比較用に (名前, テキスト or ファイル名と中身) へ変換する
fn summarize(entries: Vec<FormEntry>) -> Vec<(String, String, Vec<u8>)> {
    entries
        .into_iter()
        .map(|entry| match entry.value {
            FormValue::Text(value) => (entry.name, String::new(), value.into_bytes()),
            FormValue::File(file) => {
                let data = file.read_contents().unwrap();
                (entry.name, file.client_file_name().to_string(), data)
            }
        })
        .collect()
}

fn decode<'a>(boundary: &str, chunks: impl IntoIterator<Item = &'a [u8]>) -> Vec<FormEntry> {
    let mut decoder = MultipartDecoder::new(boundary, &TransportLimits::default()).unwrap();
    for chunk in chunks {
        decoder.feed(chunk).unwrap();
    }
    decoder.finish().unwrap();
    decoder.take_entries()
}

fn expected(parts: &[GeneratedPart]) -> Vec<(String, String, Vec<u8>)> {
    parts
        .iter()
        .map(|part| match part {
            GeneratedPart::Field { name, value } => {
                (name.clone(), String::new(), value.clone().into_bytes())
            }
            GeneratedPart::File {
                name,
                file_name,
                data,
            } => (name.clone(), file_name.clone(), data.clone()),
        })
        .collect()
}

// 分割の仕方に関係なく同じ結果になる
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn multipart_chunking_does_not_matter(
        boundary in boundary(),
        parts in proptest::collection::vec(part(), 1..5),
        sizes in chunk_sizes(),
    ) {
        let body = multipart_body(&boundary, &parts);

        let whole = summarize(decode(&boundary, [body.as_slice()]));
        let split = summarize(decode(&boundary, split_by(&body, &sizes)));

        prop_assert_eq!(&whole, &expected(&parts));
        prop_assert_eq!(whole, split);
    }
}

// 1 バイトずつ渡しても境界を見落とさない
proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn multipart_byte_at_a_time(
        boundary in boundary(),
        parts in proptest::collection::vec(part(), 1..3),
    ) {
        let body = multipart_body(&boundary, &parts);
        let entries = summarize(decode(&boundary, body.chunks(1)));
        prop_assert_eq!(entries, expected(&parts));
    }
}

// 末尾が欠けたボディはエラーになる
proptest! {
    #[test]
    fn multipart_truncated_body_fails(
        boundary in boundary(),
        parts in proptest::collection::vec(part(), 1..3),
        cut in 1usize..16,
    ) {
        let body = multipart_body(&boundary, &parts);
        let end = body.len().saturating_sub(cut + 4);
        let mut decoder = MultipartDecoder::new(&boundary, &TransportLimits::default()).unwrap();
        let fed = decoder.feed(&body[..end]);
        prop_assert!(fed.is_err() || decoder.finish().is_err());
    }
}

// 上限超過の multipart は 413 になり、ファイルは記録されず、後続の位置もずれない
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn multipart_over_limit_is_413_and_aligned(
        boundary in boundary(),
        parts in proptest::collection::vec(part(), 1..4),
        sizes in chunk_sizes(),
        value in "[a-z0-9]{1,16}",
    ) {
        let body = multipart_body(&boundary, &parts);
        let next = format!("v={value}");
        let mut stream = body.clone();
        stream.extend_from_slice(next.as_bytes());

        let limits = TransportLimits::default().max_request_size(body.len() as u64 - 1);
        let request = RequestDescriptor::new("POST", "/upload")
            .content_type(&format!("multipart/form-data; boundary={boundary}"))
            .content_length(body.len() as u64);
        let mut reply = Reply::new(request, limits, ConnectionScheme::Http);

        let declared = body.len();
        for chunk in split_by(&stream[..declared], &sizes) {
            reply.consume_body(chunk, ReceiveState::Partial);
        }
        reply.consume_body(b"", ReceiveState::Complete);

        let Some(Action::Write(bytes)) = reply.poll_action() else {
            return Err(TestCaseError::fail("no reply written"));
        };
        prop_assert!(bytes.starts_with(b"HTTP/1.1 413 "));
        prop_assert!(reply.form().files.is_empty());
        reply.write_done(true);
        prop_assert!(reply.is_finished());
        prop_assert!(!reply.close_connection());

        reply.reset(
            RequestDescriptor::new("POST", "/")
                .content_type("application/x-www-form-urlencoded")
                .content_length(next.len() as u64),
        );
        reply.consume_body(&stream[declared..], ReceiveState::Complete);
        prop_assert!(matches!(reply.poll_action(), Some(Action::Dispatch)));
        prop_assert_eq!(reply.form().parameters.first("v"), Some(value.as_str()));
    }
}
