//! Binary framing for the transfer protocol.
//!
//! Every transport frame starts with a one-byte tag followed by a
//! type-specific payload. JSON payloads are UTF-8; all integers are
//! big-endian. Parsing is total: every byte sequence either decodes to a
//! [`WireMessage`] or a typed [`WireError`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Plaintext chunk size. The final chunk of a file may be shorter.
pub const CHUNK_SIZE: usize = 65_536;

/// Send-buffer occupancy above which the sender pauses.
pub const BUFFER_FULL: usize = 262_144;

/// Occupancy at which the transport's low-watermark event resumes a paused
/// sender.
pub const BUFFER_LOW: usize = 131_072;

/// GCM nonce length carried in every chunk frame.
pub const IV_LEN: usize = 12;

pub const TAG_FILE_INFO: u8 = 0x01;
pub const TAG_FILE_CHUNK: u8 = 0x02;
pub const TAG_FILE_COMPLETE: u8 = 0x03;
pub const TAG_FILE_ACCEPT: u8 = 0x04;
pub const TAG_FILE_REJECT: u8 = 0x05;
/// Reserved for in-band progress reports; never sent.
pub const TAG_PROGRESS: u8 = 0x10;
pub const TAG_ENCRYPTION_KEY: u8 = 0x20;
pub const TAG_QUEUE_INFO: u8 = 0x21;

/// Metadata announcing a file, sent ahead of its chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    pub name: String,
    pub size: u64,
    /// MIME type; possibly empty.
    #[serde(rename = "type")]
    pub mime: String,
    #[serde(rename = "totalChunks")]
    pub total_chunks: u32,
    /// Relative path within a selected folder, when sending a tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    #[serde(rename = "totalFiles")]
    pub total_files: u32,
    #[serde(rename = "currentIndex")]
    pub current_index: u32,
}

/// One encrypted chunk. `ciphertext` carries the GCM tag appended per
/// standard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub chunk_index: u32,
    pub file_id: String,
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    FileInfo(FileInfo),
    FileChunk(FileChunk),
    FileComplete,
    FileAccept,
    FileReject,
    EncryptionKey([u8; 32]),
    QueueInfo(QueueInfo),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("reserved message tag 0x{0:02x}")]
    ReservedTag(u8),
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),
    #[error("invalid {0} payload: {1}")]
    Json(&'static str, String),
    #[error("file id is not valid UTF-8")]
    FileIdEncoding,
    #[error("iv length {0} is not {IV_LEN}")]
    IvLength(usize),
    #[error("encryption key length {0} is not 32")]
    KeyLength(usize),
}

impl WireMessage {
    pub fn encode(&self) -> Bytes {
        match self {
            WireMessage::FileInfo(info) => encode_json(TAG_FILE_INFO, info),
            WireMessage::QueueInfo(queue) => encode_json(TAG_QUEUE_INFO, queue),
            WireMessage::FileComplete => Bytes::from_static(&[TAG_FILE_COMPLETE]),
            WireMessage::FileAccept => Bytes::from_static(&[TAG_FILE_ACCEPT]),
            WireMessage::FileReject => Bytes::from_static(&[TAG_FILE_REJECT]),
            WireMessage::EncryptionKey(key) => {
                let mut frame = Vec::with_capacity(1 + key.len());
                frame.push(TAG_ENCRYPTION_KEY);
                frame.extend_from_slice(key);
                Bytes::from(frame)
            }
            WireMessage::FileChunk(chunk) => {
                let id = chunk.file_id.as_bytes();
                let mut frame =
                    Vec::with_capacity(1 + 4 + 1 + id.len() + 1 + IV_LEN + chunk.ciphertext.len());
                frame.push(TAG_FILE_CHUNK);
                frame.extend_from_slice(&chunk.chunk_index.to_be_bytes());
                frame.push(id.len() as u8);
                frame.extend_from_slice(id);
                frame.push(IV_LEN as u8);
                frame.extend_from_slice(&chunk.iv);
                frame.extend_from_slice(&chunk.ciphertext);
                Bytes::from(frame)
            }
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let (&tag, payload) = frame.split_first().ok_or(WireError::Empty)?;
        match tag {
            TAG_FILE_INFO => Ok(WireMessage::FileInfo(decode_json("FileInfo", payload)?)),
            TAG_QUEUE_INFO => Ok(WireMessage::QueueInfo(decode_json("QueueInfo", payload)?)),
            TAG_FILE_COMPLETE => Ok(WireMessage::FileComplete),
            TAG_FILE_ACCEPT => Ok(WireMessage::FileAccept),
            TAG_FILE_REJECT => Ok(WireMessage::FileReject),
            TAG_ENCRYPTION_KEY => {
                let key: [u8; 32] = payload
                    .try_into()
                    .map_err(|_| WireError::KeyLength(payload.len()))?;
                Ok(WireMessage::EncryptionKey(key))
            }
            TAG_FILE_CHUNK => decode_chunk(payload),
            TAG_PROGRESS => Err(WireError::ReservedTag(tag)),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

fn encode_json<T: Serialize>(tag: u8, value: &T) -> Bytes {
    let json = serde_json::to_vec(value).expect("wire structs serialize infallibly");
    let mut frame = Vec::with_capacity(1 + json.len());
    frame.push(tag);
    frame.extend_from_slice(&json);
    Bytes::from(frame)
}

fn decode_json<'a, T: Deserialize<'a>>(name: &'static str, payload: &'a [u8]) -> Result<T, WireError> {
    serde_json::from_slice(payload).map_err(|err| WireError::Json(name, err.to_string()))
}

fn decode_chunk(payload: &[u8]) -> Result<WireMessage, WireError> {
    let (index_bytes, rest) = split_at_checked(payload, 4, "chunk index")?;
    let chunk_index = u32::from_be_bytes(index_bytes.try_into().expect("4-byte slice"));

    let (&id_len, rest) = rest.split_first().ok_or(WireError::Truncated("file id length"))?;
    let (id_bytes, rest) = split_at_checked(rest, id_len as usize, "file id")?;
    let file_id = std::str::from_utf8(id_bytes)
        .map_err(|_| WireError::FileIdEncoding)?
        .to_string();

    let (&iv_len, rest) = rest.split_first().ok_or(WireError::Truncated("iv length"))?;
    if iv_len as usize != IV_LEN {
        return Err(WireError::IvLength(iv_len as usize));
    }
    let (iv_bytes, ciphertext) = split_at_checked(rest, IV_LEN, "iv")?;
    let iv: [u8; IV_LEN] = iv_bytes.try_into().expect("12-byte slice");

    Ok(WireMessage::FileChunk(FileChunk {
        chunk_index,
        file_id,
        iv,
        ciphertext: ciphertext.to_vec(),
    }))
}

fn split_at_checked<'a>(
    payload: &'a [u8],
    mid: usize,
    what: &'static str,
) -> Result<(&'a [u8], &'a [u8]), WireError> {
    if payload.len() < mid {
        return Err(WireError::Truncated(what));
    }
    Ok(payload.split_at(mid))
}

/// Chunk count for a file of `size` bytes: `ceil(size / CHUNK_SIZE)`.
/// A zero-byte file has zero chunks.
pub fn total_chunks(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_info_round_trips_with_wire_names() {
        let info = FileInfo {
            id: "1f1deb9e-4f9a-4cf0-9c0a-2f97a1a2b3c4".into(),
            name: "hello.bin".into(),
            size: 204_800,
            mime: "application/octet-stream".into(),
            total_chunks: 4,
            path: Some("folder/hello.bin".into()),
        };
        let frame = WireMessage::FileInfo(info.clone()).encode();
        assert_eq!(frame[0], TAG_FILE_INFO);
        let json = std::str::from_utf8(&frame[1..]).expect("utf8 payload");
        assert!(json.contains("\"totalChunks\":4"));
        assert!(json.contains("\"type\":\"application/octet-stream\""));
        assert_eq!(
            WireMessage::decode(&frame).expect("decode"),
            WireMessage::FileInfo(info)
        );
    }

    #[test]
    fn file_info_path_is_optional() {
        let frame = WireMessage::FileInfo(FileInfo {
            id: "id".into(),
            name: "a".into(),
            size: 0,
            mime: String::new(),
            total_chunks: 0,
            path: None,
        })
        .encode();
        assert!(!std::str::from_utf8(&frame[1..]).expect("utf8").contains("path"));
        assert!(WireMessage::decode(&frame).is_ok());
    }

    #[test]
    fn chunk_layout_is_exact() {
        let chunk = FileChunk {
            chunk_index: 0x0102_0304,
            file_id: "abc".into(),
            iv: [7u8; IV_LEN],
            ciphertext: vec![0xAA, 0xBB],
        };
        let frame = WireMessage::FileChunk(chunk.clone()).encode();
        assert_eq!(frame[0], TAG_FILE_CHUNK);
        assert_eq!(&frame[1..5], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frame[5], 3);
        assert_eq!(&frame[6..9], b"abc");
        assert_eq!(frame[9], IV_LEN as u8);
        assert_eq!(&frame[10..22], &[7u8; 12]);
        assert_eq!(&frame[22..], &[0xAA, 0xBB]);
        assert_eq!(
            WireMessage::decode(&frame).expect("decode"),
            WireMessage::FileChunk(chunk)
        );
    }

    #[test]
    fn empty_payload_messages() {
        for (msg, tag) in [
            (WireMessage::FileComplete, TAG_FILE_COMPLETE),
            (WireMessage::FileAccept, TAG_FILE_ACCEPT),
            (WireMessage::FileReject, TAG_FILE_REJECT),
        ] {
            let frame = msg.encode();
            assert_eq!(frame.as_ref(), &[tag]);
            assert_eq!(WireMessage::decode(&frame).expect("decode"), msg);
        }
    }

    #[test]
    fn encryption_key_requires_32_bytes() {
        let frame = WireMessage::EncryptionKey([9u8; 32]).encode();
        assert_eq!(frame.len(), 33);
        assert!(WireMessage::decode(&frame).is_ok());
        assert_eq!(
            WireMessage::decode(&frame[..20]).unwrap_err(),
            WireError::KeyLength(19)
        );
    }

    #[test]
    fn malformed_frames_fail_typed() {
        assert_eq!(WireMessage::decode(&[]).unwrap_err(), WireError::Empty);
        assert_eq!(
            WireMessage::decode(&[0x7f]).unwrap_err(),
            WireError::UnknownTag(0x7f)
        );
        assert_eq!(
            WireMessage::decode(&[TAG_PROGRESS]).unwrap_err(),
            WireError::ReservedTag(TAG_PROGRESS)
        );
        assert_eq!(
            WireMessage::decode(&[TAG_FILE_CHUNK, 0, 0]).unwrap_err(),
            WireError::Truncated("chunk index")
        );
        // iv_len other than 12 is rejected
        let mut frame = vec![TAG_FILE_CHUNK, 0, 0, 0, 0, 1, b'x', 11];
        frame.extend_from_slice(&[0u8; 11]);
        assert_eq!(
            WireMessage::decode(&frame).unwrap_err(),
            WireError::IvLength(11)
        );
    }

    #[test]
    fn chunk_counts() {
        assert_eq!(total_chunks(0), 0);
        assert_eq!(total_chunks(1), 1);
        assert_eq!(total_chunks(CHUNK_SIZE as u64), 1);
        assert_eq!(total_chunks(CHUNK_SIZE as u64 + 1), 2);
        assert_eq!(total_chunks(204_800), 4);
        assert_eq!(total_chunks(100_000_000), 1526);
    }
}
