//! WebSocket フレームのプロパティテスト

use proptest::prelude::*;
use shiguredo_transport::websocket::{
    FrameDecoder, LEGACY_VERSION, Opcode, encode_control_frame, encode_header, encode_text_frame,
};

fn rfc_version() -> impl Strategy<Value = u32> {
    prop_oneof![Just(7u32), Just(8u32), Just(13u32)]
}

/// クライアントからのフレームと同じ形にマスクする
fn mask(frame: &[u8], key: [u8; 4]) -> Vec<u8> {
    let header_len = match frame[1] {
        126 => 4,
        127 => 10,
        _ => 2,
    };
    let mut masked = frame[..header_len].to_vec();
    masked[1] |= 0x80;
    masked.extend_from_slice(&key);
    masked.extend(
        frame[header_len..]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4]),
    );
    masked
}

// 長さフィールドの形式は長さの範囲で決まる
proptest! {
    #[test]
    fn length_tier_matches_payload_length(version in rfc_version(), len in 0usize..200_000) {
        let header = encode_header(version, len, false).unwrap();
        prop_assert_eq!(header[0], 0x81);
        if len < 126 {
            prop_assert_eq!(header, vec![0x81, len as u8]);
        } else if len < 65536 {
            prop_assert_eq!(header, vec![0x81, 126, (len >> 8) as u8, len as u8]);
        } else {
            let mut expected = vec![0x81, 127];
            expected.extend_from_slice(&(len as u64).to_be_bytes());
            prop_assert_eq!(header, expected);
        }
    }
}

// 圧縮フラグは RSV1
proptest! {
    #[test]
    fn compressed_flag_sets_rsv1(version in rfc_version(), len in 0usize..1000) {
        let header = encode_header(version, len, true).unwrap();
        prop_assert_eq!(header[0], 0xC1);
    }
}

// エンコードしてデコードすると元に戻る (サーバー側デコーダーはマスクを要求しない)
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn text_frame_roundtrip(
        version in rfc_version(),
        payload in prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..130),
            proptest::collection::vec(any::<u8>(), 65530..65600),
        ],
        key in any::<[u8; 4]>(),
        split in 1usize..32,
    ) {
        let frame = encode_text_frame(version, &payload, false).unwrap();
        let masked = mask(&frame, key);

        let mut decoder = FrameDecoder::new(version, 1 << 20).unwrap();
        let mut decoded = None;
        for chunk in masked.chunks(split) {
            prop_assert!(decoded.is_none());
            decoder.feed(chunk);
            decoded = decoder.decode().unwrap();
        }
        let decoded = decoded.unwrap();
        prop_assert_eq!(decoded.opcode, Opcode::Text);
        prop_assert!(decoded.fin);
        prop_assert!(!decoded.compressed);
        prop_assert_eq!(decoded.payload, payload);
        prop_assert_eq!(decoder.buffered(), 0);
    }
}

// 旧プロトコルのテキストフレーム
proptest! {
    #[test]
    fn legacy_frame_roundtrip(text in "[a-zA-Z0-9 ]{0,200}") {
        let frame = encode_text_frame(LEGACY_VERSION, text.as_bytes(), false).unwrap();
        prop_assert_eq!(frame[0], 0x00);
        prop_assert_eq!(*frame.last().unwrap(), 0xFF);

        let mut decoder = FrameDecoder::new(LEGACY_VERSION, 1024).unwrap();
        decoder.feed(&frame);
        let decoded = decoder.decode().unwrap().unwrap();
        prop_assert_eq!(decoded.opcode, Opcode::Text);
        prop_assert_eq!(decoded.payload, text.into_bytes());
    }
}

// 制御フレーム
proptest! {
    #[test]
    fn control_frame_roundtrip(
        version in rfc_version(),
        opcode in prop_oneof![Just(Opcode::Ping), Just(Opcode::Pong)],
        payload in proptest::collection::vec(any::<u8>(), 0..=125),
    ) {
        let frame = encode_control_frame(version, opcode, &payload).unwrap();
        let mut decoder = FrameDecoder::new(version, 1024).unwrap();
        decoder.feed(&frame);
        let decoded = decoder.decode().unwrap().unwrap();
        prop_assert_eq!(decoded.opcode, opcode);
        prop_assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn oversized_control_payload_is_rejected(
        version in rfc_version(),
        payload in proptest::collection::vec(any::<u8>(), 126..300),
    ) {
        prop_assert!(encode_control_frame(version, Opcode::Ping, &payload).is_err());
    }
}

// 任意の入力でパニックしない
proptest! {
    #[test]
    fn decoder_never_panics(
        version in prop_oneof![Just(0u32), Just(13u32)],
        data in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut decoder = FrameDecoder::new(version, 256).unwrap();
        decoder.feed(&data);
        while let Ok(Some(_)) = decoder.decode() {}
    }
}
