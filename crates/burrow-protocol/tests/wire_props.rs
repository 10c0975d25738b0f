//! Property tests for the frame codec

use burrow_protocol::wire::{decode_frame, encode_frame, FrameHeader, HEADER_SIZE};
use proptest::prelude::*;

proptest! {
    /// decode(encode(f)) = f and the encoded length is 8 + |body|
    #[test]
    fn frame_roundtrip(
        main in any::<u16>(),
        sub in any::<u16>(),
        body in proptest::collection::vec(any::<u8>(), 0..4096),
    ) {
        let buf = encode_frame(main, sub, &body);
        prop_assert_eq!(buf.len(), HEADER_SIZE + body.len());
        let (head, decoded) = decode_frame(&buf).unwrap();
        prop_assert_eq!(head.main_type, main);
        prop_assert_eq!(head.sub_type, sub);
        prop_assert_eq!(head.data_len as usize, body.len());
        prop_assert_eq!(&decoded[..], &body[..]);
    }

    /// The 8-byte header encoding is self-inverse for every field value
    #[test]
    fn header_roundtrip(
        len in any::<u32>(),
        main in any::<u16>(),
        sub in any::<u16>(),
    ) {
        let head = FrameHeader::new(main, sub, len);
        let decoded = FrameHeader::decode(&head.encode()).unwrap();
        prop_assert_eq!(decoded, head);
    }

    /// Truncating an encoded frame anywhere inside the body fails decode
    #[test]
    fn truncated_frame_rejected(
        body in proptest::collection::vec(any::<u8>(), 1..256),
        cut in 0usize..256,
    ) {
        let buf = encode_frame(1, 2, &body);
        let cut = cut.min(body.len() - 1);
        let truncated = &buf[..HEADER_SIZE + cut];
        prop_assert!(decode_frame(truncated).is_err());
    }
}
