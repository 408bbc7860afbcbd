//! Frame decoder behaviour on realistic mixed streams

use vnlink_core::core::protocol::binary::OutputGroup;
use vnlink_core::core::protocol::framing::encode_binary;
use vnlink_core::core::protocol::{build_sentence, BinaryHeader, ChecksumMode, FrameDecoder, FrameKind};

/// Twenty alternating ASCII/binary frames followed by a tail of valid
/// sentences long enough to resolve any header a corruption could fake.
fn mixed_stream() -> Vec<Vec<u8>> {
    let mut masks = [0u16; 6];
    masks[OutputGroup::Attitude.index()] = 1 << 1;
    let header = BinaryHeader::new(masks);

    let mut frames = Vec::new();
    for i in 0..20u8 {
        if i % 2 == 0 {
            let body = format!("VNYPR,{:+08.3},{:+08.3},{:+08.3}", f32::from(i), -1.5f32, 0.25f32);
            let mode = if i % 4 == 0 { ChecksumMode::Crc16 } else { ChecksumMode::Xor8 };
            frames.push(build_sentence(&body, mode));
        } else {
            let payload: Vec<u8> = [f32::from(i), 0.5, -0.5]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect();
            frames.push(encode_binary(&header, &payload));
        }
    }
    for i in 0..40u8 {
        let body = format!(
            "VNQTN,{:+08.5},{:+08.5},{:+08.5},{:+08.5}",
            0.0f32,
            0.0f32,
            f32::from(i) / 100.0,
            1.0f32
        );
        frames.push(build_sentence(&body, ChecksumMode::Crc16));
    }
    frames
}

fn frame_content(frame: &[u8]) -> &[u8] {
    if frame.first() == Some(&b'$') {
        &frame[..frame.len() - 2]
    } else {
        frame
    }
}

#[test]
fn clean_stream_decodes_every_frame() {
    let frames = mixed_stream();
    let stream: Vec<u8> = frames.concat();

    let mut decoder = FrameDecoder::new();
    let decoded = decoder.push(&stream);
    assert_eq!(decoded.len(), frames.len());
    assert_eq!(decoder.stats().drops, 0);
    assert_eq!(decoder.stats().skipped_bytes, 0);
    assert_eq!(decoded[1].kind, FrameKind::Binary);
    assert_eq!(decoded[2].kind, FrameKind::Ascii);
}

#[test]
fn single_byte_corruption_drops_exactly_one_frame() {
    let frames = mixed_stream();
    let stream: Vec<u8> = frames.concat();

    let mut start = 0;
    for target in 0..20 {
        for offset in 0..frames[target].len() {
            let mut corrupted = stream.clone();
            corrupted[start + offset] ^= 0x01;

            let decoded = FrameDecoder::new().push(&corrupted);
            assert_eq!(
                decoded.len(),
                frames.len() - 1,
                "frame {target}, byte {offset}"
            );

            let expected = frames
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != target)
                .map(|(_, f)| frame_content(f));
            for (got, want) in decoded.iter().zip(expected) {
                assert_eq!(&got.bytes[..], want, "frame {target}, byte {offset}");
            }
        }
        start += frames[target].len();
    }
}

#[test]
fn byte_at_a_time_matches_bulk() {
    let stream: Vec<u8> = mixed_stream().concat();

    let mut bulk = FrameDecoder::new();
    let expected = bulk.push(&stream);

    let mut trickle = FrameDecoder::new();
    let mut decoded = Vec::new();
    for byte in &stream {
        decoded.extend(trickle.push(std::slice::from_ref(byte)));
    }
    assert_eq!(decoded, expected);
    assert_eq!(trickle.buffered(), 0);
}

#[test]
fn oversized_ascii_candidate_is_abandoned() {
    let mut stream = b"$VN".to_vec();
    stream.extend(std::iter::repeat(b'A').take(2000));
    stream.extend_from_slice(&build_sentence("VNYPR,1,2,3", ChecksumMode::Xor8));

    let mut decoder = FrameDecoder::new();
    let frames = decoder.push(&stream);
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0].bytes[..6], b"$VNYPR");
}
