#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shiguredo_transport::compression::DeflateParams;
use shiguredo_transport::websocket::{FrameDecoder, MessageReader};

#[derive(Arbitrary, Debug)]
struct FuzzFrames {
    version_index: u8,
    deflate: bool,
    max_payload: u16,
    data: Vec<u8>,
}

fuzz_target!(|input: FuzzFrames| {
    let versions = [0u32, 7, 8, 13];
    let version = versions[input.version_index as usize % versions.len()];
    let max_payload = input.max_payload as usize;

    // フレーム単位
    if let Ok(mut decoder) = FrameDecoder::new(version, max_payload) {
        decoder.feed(&input.data);
        while let Ok(Some(frame)) = decoder.decode() {
            let _ = frame.payload.len();
        }
    }

    // メッセージ単位 (展開込み)
    let deflate = input.deflate.then(DeflateParams::default);
    if let Ok(mut reader) = MessageReader::new(version, deflate, max_payload) {
        reader.feed(&input.data);
        while let Ok(Some(message)) = reader.next_message() {
            let _ = message.payload.len();
        }
    }
});
