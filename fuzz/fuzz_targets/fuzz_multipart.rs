#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shiguredo_transport::TransportLimits;
use shiguredo_transport::multipart::MultipartDecoder;

#[derive(Arbitrary, Debug)]
struct FuzzMultipart {
    boundary_index: u8,
    chunk_size: u8,
    max_form_data_size: u16,
    discard_parts: bool,
    data: Vec<u8>,
}

fuzz_target!(|input: FuzzMultipart| {
    // 様々な境界でデコードを試行
    let boundaries = ["boundary", "----WebKitFormBoundary", "abc123", "---", "X"];
    let boundary = boundaries[input.boundary_index as usize % boundaries.len()];

    let limits = TransportLimits::default().max_form_data_size(input.max_form_data_size as u64);
    let Ok(mut decoder) = MultipartDecoder::new(boundary, &limits) else {
        return;
    };
    if input.discard_parts {
        decoder.discard_parts();
    }

    // パニックしなければ OK
    let chunk_size = (input.chunk_size as usize).max(1);
    for chunk in input.data.chunks(chunk_size) {
        if decoder.feed(chunk).is_err() {
            return;
        }
    }
    let _ = decoder.finish();
    for entry in decoder.take_entries() {
        let _ = entry.name.len();
    }
});
