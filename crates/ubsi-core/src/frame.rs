//! 帧层：为每条编码后的消息加上可变长度的尺寸头。
//!
//! # 教案级注释
//!
//! - **意图 (Why)**：TCP 是字节流，需要显式分帧；短消息只额外付出 1 字节。
//! - **逻辑 (How)**：
//!   - 负载长度 `< 128` 时写 1 字节长度；
//!   - 否则写标记字节 `0xA8 | n`（n = 1..=4），其后是 n 个小端长度字节；
//!   - 长度为 0 的帧即单字节 `0x00`，表示心跳，不携带负载。
//! - **契约 (What)**：[`FrameDecoder::decode`] 在数据不足时返回 `Ok(None)` 且不消费任何字节，
//!   从不阻塞；识别标记使用 `(b & 0xF8) == 0xA8`，n 超出 1..=4 视为协议错误；
//!   声明长度超过 [`MAX_FRAME_LEN`] 的帧在读到尺寸头时即被拒绝，不会按对端声明预留缓冲。

use crate::codec::{DecodeError, length_byte_count, put_length_le};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// 单字节长度可表示的上限（不含）。
pub const SHORT_FRAME_LIMIT: usize = 128;

/// 长帧标记的高 5 位。
pub const LONG_FRAME_MARKER: u8 = 0xA8;

/// 单帧负载上限。
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// 心跳帧的线上表示。
pub const HEARTBEAT: [u8; 1] = [0x00];

/// 一次解帧的结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// 零长度帧。
    Heartbeat,
    /// 编码后的值负载。
    Payload(Bytes),
}

/// 写入尺寸头。
pub fn put_frame_header(buf: &mut BytesMut, len: usize) {
    if len < SHORT_FRAME_LIMIT {
        buf.put_u8(len as u8);
    } else {
        let count = length_byte_count(len);
        buf.put_u8(LONG_FRAME_MARKER | count);
        put_length_le(buf, len, count);
    }
}

/// 为负载加上尺寸头，得到可直接写入套接字的字节。
pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    put_frame_header(&mut buf, payload.len());
    buf.put_slice(payload);
    buf.freeze()
}

/// 增量解帧器。
///
/// 无内部状态：每次调用都从缓冲头部重新解析尺寸头，因此可以在任意字节边界被打断。
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameDecoder;

impl FrameDecoder {
    pub const fn new() -> Self {
        Self
    }

    /// 尝试从 `src` 头部切出一帧。
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        let Some(&head) = src.first() else {
            return Ok(None);
        };

        let (header_len, payload_len) = if usize::from(head) < SHORT_FRAME_LIMIT {
            (1, usize::from(head))
        } else if head & 0xF8 == LONG_FRAME_MARKER {
            let count = usize::from(head & 0x07);
            if !(1..=4).contains(&count) {
                return Err(DecodeError::InvalidFrameHeader { byte: head });
            }
            if src.len() < 1 + count {
                return Ok(None);
            }
            let len = src[1..=count]
                .iter()
                .enumerate()
                .fold(0usize, |acc, (i, b)| acc | (usize::from(*b) << (i * 8)));
            if len > MAX_FRAME_LEN {
                return Err(DecodeError::FrameTooLarge {
                    len,
                    max: MAX_FRAME_LEN,
                });
            }
            (1 + count, len)
        } else {
            return Err(DecodeError::InvalidFrameHeader { byte: head });
        };

        if src.len() < header_len + payload_len {
            src.reserve(header_len + payload_len - src.len());
            return Ok(None);
        }
        src.advance(header_len);
        if payload_len == 0 {
            return Ok(Some(Frame::Heartbeat));
        }
        Ok(Some(Frame::Payload(src.split_to(payload_len).freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes_follow_thresholds() {
        assert_eq!(frame(&[0u8; 127])[0], 127);
        assert_eq!(&frame(&[0u8; 128])[..2], &[0xA9, 128]);
        assert_eq!(&frame(&[0u8; 256])[..3], &[0xAA, 0x00, 0x01]);
        assert_eq!(&frame(&vec![0u8; 65536])[..4], &[0xAB, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn zero_length_frame_is_heartbeat() {
        let mut buf = BytesMut::from(&HEARTBEAT[..]);
        assert_eq!(FrameDecoder::new().decode(&mut buf), Ok(Some(Frame::Heartbeat)));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_input_waits_without_consuming() {
        let framed = frame(&[7u8; 300]);
        let decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        for (i, byte) in framed.iter().enumerate() {
            buf.put_u8(*byte);
            let out = decoder.decode(&mut buf).expect("valid stream");
            if i + 1 < framed.len() {
                assert_eq!(out, None);
                assert_eq!(buf.len(), i + 1);
            } else {
                assert_eq!(out, Some(Frame::Payload(Bytes::from(vec![7u8; 300]))));
            }
        }
    }

    #[test]
    fn back_to_back_frames_split_cleanly() {
        let mut buf = BytesMut::new();
        buf.put_slice(&frame(b"ab"));
        buf.put_slice(&HEARTBEAT);
        buf.put_slice(&frame(b"c"));
        let decoder = FrameDecoder::new();
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::Payload(Bytes::from_static(b"ab")))
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Frame::Heartbeat));
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::Payload(Bytes::from_static(b"c")))
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_frames_are_rejected_at_the_header() {
        let decoder = FrameDecoder::new();
        let mut forged = BytesMut::from(&[0xAC, 0xFF, 0xFF, 0xFF, 0xFF][..]);
        assert_eq!(
            decoder.decode(&mut forged),
            Err(DecodeError::FrameTooLarge {
                len: u32::MAX as usize,
                max: MAX_FRAME_LEN,
            })
        );
        assert!(forged.capacity() < 1024);

        let mut over = BytesMut::new();
        put_frame_header(&mut over, MAX_FRAME_LEN + 1);
        assert!(matches!(
            decoder.decode(&mut over),
            Err(DecodeError::FrameTooLarge { .. })
        ));

        let mut limit = BytesMut::new();
        put_frame_header(&mut limit, MAX_FRAME_LEN);
        assert_eq!(decoder.decode(&mut limit), Ok(None));
    }

    #[test]
    fn invalid_headers_are_rejected() {
        let decoder = FrameDecoder::new();
        for byte in [0xA8u8, 0xAD, 0xAF, 0x80, 0xFF] {
            let mut buf = BytesMut::from(&[byte, 0, 0, 0, 0, 0][..]);
            assert_eq!(
                decoder.decode(&mut buf),
                Err(DecodeError::InvalidFrameHeader { byte })
            );
        }
    }
}
