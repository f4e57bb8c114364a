use bytes::{Bytes, BytesMut};
use jasperdb::core::JasperError;
use jasperdb::core::protocol::{RespFrame, RespFrameCodec};
use tokio_util::codec::{Decoder, Encoder};

fn encode(frame: &RespFrame) -> BytesMut {
    let mut buf = BytesMut::new();
    RespFrameCodec.encode(frame.clone(), &mut buf).unwrap();
    buf
}

fn decode_one(buf: &mut BytesMut) -> Option<RespFrame> {
    RespFrameCodec.decode(buf).unwrap()
}

#[test]
fn test_simple_string_round_trip() {
    let frame = RespFrame::SimpleString("OK".to_string());
    let mut buf = encode(&frame);
    assert_eq!(&buf[..], b"+OK\r\n");
    assert_eq!(decode_one(&mut buf), Some(frame));
    assert!(buf.is_empty());
}

#[test]
fn test_error_round_trip() {
    let frame = RespFrame::Error("ERR something went wrong".to_string());
    let mut buf = encode(&frame);
    assert_eq!(&buf[..], b"-ERR something went wrong\r\n");
    assert_eq!(decode_one(&mut buf), Some(frame));
}

#[test]
fn test_integer_round_trip() {
    for value in [0i64, 42, -17, i64::MAX, i64::MIN] {
        let frame = RespFrame::Integer(value);
        let mut buf = encode(&frame);
        assert_eq!(decode_one(&mut buf), Some(frame));
    }
}

#[test]
fn test_bulk_string_round_trip() {
    let frame = RespFrame::BulkString(Bytes::from_static(b"hello"));
    let mut buf = encode(&frame);
    assert_eq!(&buf[..], b"$5\r\nhello\r\n");
    assert_eq!(decode_one(&mut buf), Some(frame));
}

#[test]
fn test_bulk_string_with_binary_payload() {
    let frame = RespFrame::BulkString(Bytes::from_static(b"a\r\nb\x00c"));
    let mut buf = encode(&frame);
    assert_eq!(decode_one(&mut buf), Some(frame));
}

#[test]
fn test_null_bulk_and_null_array() {
    let mut buf = encode(&RespFrame::Null);
    assert_eq!(&buf[..], b"$-1\r\n");
    assert_eq!(decode_one(&mut buf), Some(RespFrame::Null));

    let mut buf = encode(&RespFrame::NullArray);
    assert_eq!(&buf[..], b"*-1\r\n");
    assert_eq!(decode_one(&mut buf), Some(RespFrame::NullArray));
}

#[test]
fn test_nested_array_round_trip() {
    let frame = RespFrame::Array(vec![
        RespFrame::BulkString(Bytes::from_static(b"SET")),
        RespFrame::BulkString(Bytes::from_static(b"key")),
        RespFrame::Array(vec![RespFrame::Integer(1), RespFrame::Null]),
        RespFrame::SimpleString("inline".to_string()),
    ]);
    let mut buf = encode(&frame);
    assert_eq!(decode_one(&mut buf), Some(frame));
}

#[test]
fn test_empty_array_round_trip() {
    let frame = RespFrame::Array(vec![]);
    let mut buf = encode(&frame);
    assert_eq!(&buf[..], b"*0\r\n");
    assert_eq!(decode_one(&mut buf), Some(frame));
}

#[test]
fn test_truncated_input_waits_for_more_data() {
    // A partial bulk string must not error; the decoder asks for more bytes.
    let mut buf = BytesMut::from(&b"$10\r\nhel"[..]);
    assert_eq!(decode_one(&mut buf), None);
    // The buffer is untouched so decoding can resume later.
    assert_eq!(&buf[..], b"$10\r\nhel");

    let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfoo\r\n"[..]);
    assert_eq!(decode_one(&mut buf), None);
}

#[test]
fn test_malformed_input_is_rejected() {
    let mut codec = RespFrameCodec;

    // Unknown type prefix.
    let mut buf = BytesMut::from(&b"?5\r\nhello\r\n"[..]);
    assert!(matches!(codec.decode(&mut buf), Err(JasperError::SyntaxError)));

    // Non-numeric length.
    let mut buf = BytesMut::from(&b"$abc\r\nhello\r\n"[..]);
    assert!(matches!(codec.decode(&mut buf), Err(JasperError::SyntaxError)));

    // Bulk string data not terminated by CRLF.
    let mut buf = BytesMut::from(&b"$5\r\nhelloXX"[..]);
    assert!(matches!(codec.decode(&mut buf), Err(JasperError::SyntaxError)));
}

#[test]
fn test_oversized_frames_are_rejected() {
    let mut codec = RespFrameCodec;

    // An array claiming more elements than the protocol limit.
    let mut buf = BytesMut::from(&b"*99999999\r\n"[..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(JasperError::OversizedFrame)
    ));

    // A bulk string claiming more than 512MB.
    let mut buf = BytesMut::from(&b"$999999999\r\n"[..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(JasperError::OversizedFrame)
    ));
}

#[test]
fn test_pipelined_frames_decode_in_order() {
    let mut buf = BytesMut::new();
    RespFrameCodec
        .encode(RespFrame::SimpleString("first".into()), &mut buf)
        .unwrap();
    RespFrameCodec
        .encode(RespFrame::Integer(2), &mut buf)
        .unwrap();
    RespFrameCodec
        .encode(RespFrame::BulkString(Bytes::from_static(b"third")), &mut buf)
        .unwrap();

    assert_eq!(
        decode_one(&mut buf),
        Some(RespFrame::SimpleString("first".into()))
    );
    assert_eq!(decode_one(&mut buf), Some(RespFrame::Integer(2)));
    assert_eq!(
        decode_one(&mut buf),
        Some(RespFrame::BulkString(Bytes::from_static(b"third")))
    );
    assert!(buf.is_empty());
}

#[test]
fn test_into_args_extracts_command_arguments() {
    let frame = RespFrame::command([
        Bytes::from_static(b"SET"),
        Bytes::from_static(b"k"),
        Bytes::from_static(b"v"),
    ]);
    let args = frame.into_args().unwrap();
    assert_eq!(args, vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"v")]);

    assert!(RespFrame::Integer(3).into_args().is_err());
}
