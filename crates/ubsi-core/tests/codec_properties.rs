//! 编解码与分帧的性质验证。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：`decode(encode(v)) == v` 与 `unframe(frame(p)) == p` 是线协议的根本契约；
//!   以 Proptest 随机生成任意嵌套的值，同时显式覆盖长度边界 {0,1,127,128,255,256,65535,65536}。
//! - **设计手法 (How)**：`arb_value()` 以递归策略生成 16 种变体；浮点排除 NaN（NaN 不满足自反相等）。
//! - **断言 (What)**：往返结果逐值相等；分帧后逐字节喂入解帧器，仅在最后一个字节到达时产出负载。

use bytes::{BufMut, Bytes, BytesMut};
use proptest::prelude::*;
use ubsi_core::frame::{Frame, FrameDecoder, frame};
use ubsi_core::{ObjectId, Value, decode, encode};

const BOUNDARIES: [usize; 8] = [0, 1, 127, 128, 255, 256, 65_535, 65_536];

fn arb_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i8>().prop_map(Value::Byte),
        any::<i32>().prop_map(Value::Int),
        any::<i64>().prop_map(Value::Long),
        any::<i128>().prop_map(|v| Value::BigInt(v.to_string())),
        any::<f64>()
            .prop_filter("NaN is not reflexive", |v| !v.is_nan())
            .prop_map(Value::Double),
        (any::<i64>(), 1usize..6).prop_map(|(m, s)| Value::Decimal(format!("{m}.{}", "7".repeat(s)))),
        proptest::collection::vec(any::<u8>(), 0..300).prop_map(|v| Value::Bytes(Bytes::from(v))),
        ".{0,40}".prop_map(Value::Str),
        any::<[u8; 12]>().prop_map(|b| Value::Id(ObjectId::from_bytes(b))),
        ("[a-z/]{0,12}", any::<i32>()).prop_map(|(pattern, flags)| Value::Pattern { pattern, flags }),
    ]
}

fn arb_value() -> impl Strategy<Value = Value> {
    arb_leaf().prop_recursive(4, 64, 10, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..10).prop_map(Value::List),
            proptest::collection::vec(inner.clone(), 0..10).prop_map(Value::Set),
            proptest::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
            proptest::collection::vec((inner.clone(), inner), 0..6).prop_map(Value::Map),
        ]
    })
}

proptest! {
    #[test]
    fn prop_codec_roundtrip(value in arb_value()) {
        let bytes = encode(&value).expect("encode");
        prop_assert_eq!(decode(&bytes).expect("decode"), value);
    }

    #[test]
    fn prop_frame_roundtrip(payload in proptest::collection::vec(any::<u8>(), 1..2048)) {
        let mut buf = BytesMut::from(&frame(&payload)[..]);
        let out = FrameDecoder::new().decode(&mut buf).expect("valid frame");
        prop_assert_eq!(out, Some(Frame::Payload(Bytes::from(payload))));
        prop_assert!(buf.is_empty());
    }
}

#[test]
fn codec_roundtrip_at_length_boundaries() {
    for len in BOUNDARIES {
        let cases = [
            Value::Str("s".repeat(len)),
            Value::Bytes(Bytes::from(vec![0xAB; len])),
            Value::List(vec![Value::Int(-1); len]),
            Value::Set(vec![Value::Null; len]),
            Value::Array(vec![Value::Bool(true); len]),
            Value::Map((0..len).map(|i| (Value::Long(i as i64), Value::Byte(0))).collect()),
        ];
        for value in cases {
            let bytes = encode(&value).expect("encode");
            assert_eq!(decode(&bytes).expect("decode"), value, "len={len}");
        }
    }
}

#[test]
fn codec_roundtrip_edge_scalars() {
    for value in [
        Value::Str(String::new()),
        Value::Int(0),
        Value::Int(i32::MIN),
        Value::Long(-1),
        Value::Long(i64::MAX),
        Value::Byte(i8::MIN),
        Value::Double(-0.5),
        Value::BigInt("-123456789012345678901234567890".into()),
        Value::Decimal("-0.000".into()),
        Value::List(vec![Value::Str(String::new())]),
        Value::Map(vec![]),
    ] {
        let bytes = encode(&value).expect("encode");
        assert_eq!(decode(&bytes).expect("decode"), value);
    }
}

#[test]
fn frame_roundtrip_at_length_boundaries() {
    let decoder = FrameDecoder::new();
    for len in BOUNDARIES {
        let payload = vec![0x5A; len];
        let framed = frame(&payload);
        let mut buf = BytesMut::new();
        let mut produced = None;
        for (i, byte) in framed.iter().enumerate() {
            buf.put_u8(*byte);
            let out = decoder.decode(&mut buf).expect("valid frame");
            if i + 1 < framed.len() {
                assert_eq!(out, None, "len={len} byte={i}");
            } else {
                produced = out;
            }
        }
        let expected = if len == 0 {
            Frame::Heartbeat
        } else {
            Frame::Payload(Bytes::from(payload))
        };
        assert_eq!(produced, Some(expected), "len={len}");
    }
}

#[test]
fn invalid_length_nibble_is_decode_error() {
    assert!(decode(&[0x9F]).is_err());
}
