//! 多帧消息的长度前缀编解码。

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zss_client::{Frames, Operation, TransportError};

/// 单条消息允许的最大帧数。
pub const MAX_FRAMES: usize = 64;

/// 单帧允许的最大字节数。
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

/// 将帧序列编码为一段连续字节。
///
/// 空消息与超限消息在写出前即被拒绝，避免对端读到无法解码的数据。
pub fn encode(frames: &[Bytes]) -> Result<Bytes, TransportError> {
    check_count(frames.len())?;
    let body: usize = frames.iter().map(|frame| PREFIX_LEN + frame.len()).sum();
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + body);
    buf.put_u32(frames.len() as u32);
    for frame in frames {
        check_len(frame.len())?;
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }
    Ok(buf.freeze())
}

/// 写出一条完整消息并刷新。
pub async fn write_message<W>(writer: &mut W, frames: &[Bytes]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let encoded = encode(frames)?;
    writer
        .write_all(&encoded)
        .await
        .map_err(|err| TransportError::io(Operation::SEND, err))?;
    writer
        .flush()
        .await
        .map_err(|err| TransportError::io(Operation::SEND, err))
}

/// 读取一条完整消息。
///
/// # 契约 (What)
/// - 在消息边界遇到 EOF 时返回 `Ok(None)`，表示对端正常关闭；
/// - 消息中途 EOF 视为接收失败；
/// - 帧数为零或超限、单帧超长视为协议错误，调用方应断开连接。
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Frames>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let count = match reader.read_u32().await {
        Ok(count) => count as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(TransportError::io(Operation::RECEIVE, err)),
    };
    check_count(count)?;

    let mut frames = Frames::with_capacity(count);
    for _ in 0..count {
        let len = reader
            .read_u32()
            .await
            .map_err(|err| TransportError::io(Operation::RECEIVE, err))? as usize;
        check_len(len)?;
        let mut frame = vec![0u8; len];
        reader
            .read_exact(&mut frame)
            .await
            .map_err(|err| TransportError::io(Operation::RECEIVE, err))?;
        frames.push(Bytes::from(frame));
    }
    Ok(Some(frames))
}

fn check_count(count: usize) -> Result<(), TransportError> {
    if count == 0 || count > MAX_FRAMES {
        return Err(TransportError::Protocol(format!(
            "message carries {count} frames, expected 1..={MAX_FRAMES}"
        )));
    }
    Ok(())
}

fn check_len(len: usize) -> Result<(), TransportError> {
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Protocol(format!(
            "frame of {len} bytes exceeds {MAX_FRAME_LEN}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&'static str]) -> Frames {
        parts.iter().map(|part| Bytes::from_static(part.as_bytes())).collect()
    }

    #[test]
    fn encode_prefixes_count_and_lengths() {
        let encoded = encode(&frames(&["ab", ""])).unwrap();
        assert_eq!(
            encoded.as_ref(),
            &[0, 0, 0, 2, 0, 0, 0, 2, b'a', b'b', 0, 0, 0, 0][..]
        );
    }

    #[test]
    fn encode_rejects_empty_and_oversized_messages() {
        assert_eq!(
            encode(&[]).unwrap_err().code(),
            "zss.transport.protocol_violation"
        );
        let many = vec![Bytes::new(); MAX_FRAMES + 1];
        assert!(matches!(encode(&many), Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn read_returns_consecutive_messages_then_none() {
        let mut wire = encode(&frames(&["client#1"])).unwrap().to_vec();
        wire.extend_from_slice(&encode(&frames(&["ZSS:0.0", "REQ"])).unwrap());
        let mut reader = wire.as_slice();

        assert_eq!(read_message(&mut reader).await.unwrap(), Some(frames(&["client#1"])));
        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            Some(frames(&["ZSS:0.0", "REQ"]))
        );
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_message_is_a_receive_error() {
        let wire = encode(&frames(&["payload"])).unwrap();
        let mut reader = &wire[..wire.len() - 2];

        let err = read_message(&mut reader).await.unwrap_err();
        assert_eq!(err.code(), "zss.transport.receive_failed");
    }

    #[tokio::test]
    async fn oversized_frame_header_is_rejected_before_allocation() {
        let mut wire = vec![0, 0, 0, 1];
        wire.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        let mut reader = wire.as_slice();

        assert!(matches!(
            read_message(&mut reader).await,
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn write_message_round_trips_through_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_message(&mut client, &frames(&["a", "bc"])).await.unwrap();
        assert_eq!(
            read_message(&mut server).await.unwrap(),
            Some(frames(&["a", "bc"]))
        );
    }
}
