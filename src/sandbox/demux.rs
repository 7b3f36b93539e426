//! Docker 多路复用日志流解析
//!
//! 非 TTY 容器的 attach/logs 输出由若干帧组成：`[stream_type, 0, 0, 0, len_be_u32] payload`，
//! stream_type 0=stdin、1=stdout、2=stderr。bollard 通常已经解码好，
//! 但兼容实现（如 Podman 的 Docker API）有时把原始帧整块交给 Console 变体，这里负责拆分。

use thiserror::Error;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            0 => Some(StreamKind::Stdin),
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub kind: StreamKind,
    pub payload: &'a [u8],
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DemuxError {
    #[error("truncated frame header at offset {0}")]
    TruncatedHeader(usize),

    #[error("unknown stream marker {marker} at offset {offset}")]
    UnknownStream { marker: u8, offset: usize },

    #[error("frame at offset {offset} declares {declared} bytes but only {available} remain")]
    TruncatedPayload {
        offset: usize,
        declared: usize,
        available: usize,
    },
}

/// 严格解析：整个缓冲区必须恰好由完整帧组成
pub fn parse_frames(buf: &[u8]) -> Result<Vec<Frame<'_>>, DemuxError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let header = buf
            .get(offset..offset + HEADER_LEN)
            .ok_or(DemuxError::TruncatedHeader(offset))?;
        let kind = StreamKind::from_marker(header[0]).ok_or(DemuxError::UnknownStream {
            marker: header[0],
            offset,
        })?;
        // 第 1..4 字节为填充，必须为 0，否则不是帧格式
        if header[1..4] != [0, 0, 0] {
            return Err(DemuxError::UnknownStream {
                marker: header[0],
                offset,
            });
        }
        let declared = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let start = offset + HEADER_LEN;
        let payload = buf.get(start..start + declared).ok_or(DemuxError::TruncatedPayload {
            offset,
            declared,
            available: buf.len() - start,
        })?;
        frames.push(Frame { kind, payload });
        offset = start + declared;
    }
    Ok(frames)
}

/// 拆分为 (stdout, stderr)；stdin 帧丢弃
pub fn demultiplex(buf: &[u8]) -> Result<(Vec<u8>, Vec<u8>), DemuxError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    for frame in parse_frames(buf)? {
        match frame.kind {
            StreamKind::Stdout => stdout.extend_from_slice(frame.payload),
            StreamKind::Stderr => stderr.extend_from_slice(frame.payload),
            StreamKind::Stdin => {}
        }
    }
    Ok((stdout, stderr))
}

/// 宽松拆分：是帧格式则按流类型追加，否则整块视为 stdout
pub fn split_into(buf: &[u8], stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) {
    match demultiplex(buf) {
        Ok((out, err)) => {
            stdout.extend_from_slice(&out);
            stderr.extend_from_slice(&err);
        }
        Err(_) => stdout.extend_from_slice(buf),
    }
}
