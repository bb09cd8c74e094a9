//! Framing and binary encoding for protocol messages
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! +----------+--------+---------+------------------+
//! | len      | type   | flags   | payload          |
//! | 4 bytes  | 1 byte | 1 byte  | len - 2 bytes    |
//! +----------+--------+---------+------------------+
//! ```
//!
//! `len` covers type, flags, and payload. Flags bit 0 marks a
//! deflate-compressed payload. Strings are u16-length-prefixed UTF-8;
//! repeated elements are u32-count-prefixed.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use meshsync_core::device_id::ShortId;
use meshsync_core::vector::Counter;
use meshsync_core::{Compression, DeviceId, FileInfo, FileType, Vector};

use crate::error::ProtocolError;
use crate::messages::{
    CcDevice, CcFolder, ClusterConfig, DownloadProgressUpdate, ErrorCode, Hello, Message, Request,
    Response,
};

/// Upper bound on a single frame.
pub const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

/// Upper bound on any repeated-element count, to bound allocation on
/// malformed input.
const MAX_ITEMS: u32 = 1 << 21;

const FLAG_COMPRESSED: u8 = 0x01;

/// Don't bother compressing tiny payloads.
const COMPRESS_THRESHOLD: usize = 128;

// ============================================================================
// Primitive helpers
// ============================================================================

fn need(buf: &impl Buf, n: usize, context: &'static str) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        Err(ProtocolError::Truncated(context))
    } else {
        Ok(())
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut Bytes) -> Result<String, ProtocolError> {
    need(buf, 2, "string length")?;
    let len = buf.get_u16() as usize;
    need(buf, len, "string bytes")?;
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|e| ProtocolError::Malformed {
        context: "string",
        detail: e.to_string(),
    })
}

fn get_count(buf: &mut Bytes, context: &'static str) -> Result<usize, ProtocolError> {
    need(buf, 4, context)?;
    let count = buf.get_u32();
    if count > MAX_ITEMS {
        return Err(ProtocolError::Malformed {
            context,
            detail: format!("count {count} exceeds limit"),
        });
    }
    Ok(count as usize)
}

fn get_hash(buf: &mut Bytes) -> Result<[u8; 32], ProtocolError> {
    need(buf, 32, "hash")?;
    let mut hash = [0u8; 32];
    buf.copy_to_slice(&mut hash);
    Ok(hash)
}

fn get_bool(buf: &mut Bytes, context: &'static str) -> Result<bool, ProtocolError> {
    need(buf, 1, context)?;
    Ok(buf.get_u8() != 0)
}

fn put_vector(buf: &mut BytesMut, vector: &Vector) {
    buf.put_u32(vector.counters().len() as u32);
    for c in vector.counters() {
        buf.put_u64(c.id.as_u64());
        buf.put_u64(c.value);
    }
}

fn get_vector(buf: &mut Bytes) -> Result<Vector, ProtocolError> {
    let count = get_count(buf, "version counters")?;
    let mut counters = Vec::with_capacity(count);
    for _ in 0..count {
        need(buf, 16, "version counter")?;
        counters.push(Counter {
            id: ShortId(buf.get_u64()),
            value: buf.get_u64(),
        });
    }
    Ok(Vector::from_counters(counters))
}

// ============================================================================
// FileInfo
// ============================================================================

const FILE_FLAG_DELETED: u8 = 0x01;
const FILE_FLAG_INVALID: u8 = 0x02;
const FILE_FLAG_NO_PERMISSIONS: u8 = 0x04;

fn put_file_info(buf: &mut BytesMut, f: &FileInfo) {
    put_str(buf, &f.name);
    buf.put_u8(f.file_type.as_u8());
    buf.put_u64(f.size);
    buf.put_u32(f.permissions);
    buf.put_i64(f.modified_s);
    buf.put_i32(f.modified_ns);
    let mut flags = 0u8;
    if f.deleted {
        flags |= FILE_FLAG_DELETED;
    }
    if f.invalid {
        flags |= FILE_FLAG_INVALID;
    }
    if f.no_permissions {
        flags |= FILE_FLAG_NO_PERMISSIONS;
    }
    buf.put_u8(flags);
    buf.put_u64(f.sequence);
    buf.put_u32(f.block_size);
    put_vector(buf, &f.version);
    buf.put_u32(f.blocks.len() as u32);
    for b in &f.blocks {
        buf.put_u64(b.offset);
        buf.put_u32(b.size);
        buf.put_slice(&b.hash);
        buf.put_u32(b.weak_hash);
    }
    put_str(buf, &f.symlink_target);
}

fn get_file_info(buf: &mut Bytes) -> Result<FileInfo, ProtocolError> {
    let name = get_str(buf)?;
    need(buf, 1, "file type")?;
    let type_byte = buf.get_u8();
    let file_type = FileType::from_u8(type_byte).ok_or(ProtocolError::Malformed {
        context: "file type",
        detail: format!("unknown value {type_byte}"),
    })?;
    need(buf, 8 + 4 + 8 + 4 + 1 + 8 + 4, "file fields")?;
    let size = buf.get_u64();
    let permissions = buf.get_u32();
    let modified_s = buf.get_i64();
    let modified_ns = buf.get_i32();
    let flags = buf.get_u8();
    let sequence = buf.get_u64();
    let block_size = buf.get_u32();
    let version = get_vector(buf)?;
    let block_count = get_count(buf, "blocks")?;
    let mut blocks = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        need(buf, 8 + 4 + 32 + 4, "block")?;
        let offset = buf.get_u64();
        let size = buf.get_u32();
        let hash = get_hash(buf)?;
        let weak_hash = buf.get_u32();
        blocks.push(meshsync_core::BlockInfo {
            offset,
            size,
            hash,
            weak_hash,
        });
    }
    let symlink_target = get_str(buf)?;

    Ok(FileInfo {
        name,
        file_type,
        size,
        permissions,
        modified_s,
        modified_ns,
        version,
        sequence,
        deleted: flags & FILE_FLAG_DELETED != 0,
        invalid: flags & FILE_FLAG_INVALID != 0,
        no_permissions: flags & FILE_FLAG_NO_PERMISSIONS != 0,
        block_size,
        blocks,
        symlink_target,
    })
}

fn put_file_list(buf: &mut BytesMut, folder: &str, files: &[FileInfo]) {
    put_str(buf, folder);
    buf.put_u32(files.len() as u32);
    for f in files {
        put_file_info(buf, f);
    }
}

fn get_file_list(buf: &mut Bytes) -> Result<(String, Vec<FileInfo>), ProtocolError> {
    let folder = get_str(buf)?;
    let count = get_count(buf, "files")?;
    let mut files = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        files.push(get_file_info(buf)?);
    }
    Ok((folder, files))
}

// ============================================================================
// Message payloads
// ============================================================================

fn encode_payload(msg: &Message) -> BytesMut {
    let mut buf = BytesMut::new();
    match msg {
        Message::Hello(h) => {
            put_str(&mut buf, &h.device_name);
            put_str(&mut buf, &h.client_name);
            put_str(&mut buf, &h.client_version);
        }
        Message::ClusterConfig(cc) => {
            buf.put_u32(cc.folders.len() as u32);
            for folder in &cc.folders {
                put_str(&mut buf, &folder.id);
                put_str(&mut buf, &folder.label);
                buf.put_u32(folder.devices.len() as u32);
                for dev in &folder.devices {
                    buf.put_slice(dev.id.as_bytes());
                    put_str(&mut buf, &dev.name);
                    buf.put_u8(u8::from(dev.introducer));
                    buf.put_u8(u8::from(dev.skip_introduction_removals));
                    buf.put_u64(dev.max_request_kib);
                    buf.put_u64(dev.index_id);
                    buf.put_u64(dev.max_sequence);
                }
            }
        }
        Message::Index { folder, files } | Message::IndexUpdate { folder, files } => {
            put_file_list(&mut buf, folder, files);
        }
        Message::Request(r) => {
            buf.put_u32(r.id);
            put_str(&mut buf, &r.folder);
            put_str(&mut buf, &r.name);
            buf.put_i64(r.offset);
            buf.put_i32(r.size);
            buf.put_slice(&r.hash);
            buf.put_u32(r.weak_hash);
            buf.put_u8(u8::from(r.from_temporary));
        }
        Message::Response(r) => {
            buf.put_u32(r.id);
            buf.put_u32(r.data.len() as u32);
            buf.put_slice(&r.data);
            buf.put_u8(r.code.as_u8());
        }
        Message::DownloadProgress { folder, updates } => {
            put_str(&mut buf, folder);
            buf.put_u32(updates.len() as u32);
            for u in updates {
                put_str(&mut buf, &u.name);
                put_vector(&mut buf, &u.version);
                buf.put_u32(u.block_indexes.len() as u32);
                for i in &u.block_indexes {
                    buf.put_u32(*i);
                }
            }
        }
        Message::Ping => {}
        Message::Close { reason } => {
            put_str(&mut buf, reason);
        }
    }
    buf
}

fn decode_payload(type_id: u8, mut buf: Bytes) -> Result<Message, ProtocolError> {
    let msg = match type_id {
        0x00 => Message::Hello(Hello {
            device_name: get_str(&mut buf)?,
            client_name: get_str(&mut buf)?,
            client_version: get_str(&mut buf)?,
        }),
        0x01 => {
            let folder_count = get_count(&mut buf, "folders")?;
            let mut folders = Vec::with_capacity(folder_count.min(4096));
            for _ in 0..folder_count {
                let id = get_str(&mut buf)?;
                let label = get_str(&mut buf)?;
                let device_count = get_count(&mut buf, "devices")?;
                let mut devices = Vec::with_capacity(device_count.min(4096));
                for _ in 0..device_count {
                    let device_id = DeviceId::from_raw(get_hash(&mut buf)?);
                    let name = get_str(&mut buf)?;
                    let introducer = get_bool(&mut buf, "introducer")?;
                    let skip = get_bool(&mut buf, "skip flag")?;
                    need(&buf, 24, "device fields")?;
                    devices.push(CcDevice {
                        id: device_id,
                        name,
                        introducer,
                        skip_introduction_removals: skip,
                        max_request_kib: buf.get_u64(),
                        index_id: buf.get_u64(),
                        max_sequence: buf.get_u64(),
                    });
                }
                folders.push(CcFolder {
                    id,
                    label,
                    devices,
                });
            }
            Message::ClusterConfig(ClusterConfig { folders })
        }
        0x02 => {
            let (folder, files) = get_file_list(&mut buf)?;
            Message::Index { folder, files }
        }
        0x03 => {
            let (folder, files) = get_file_list(&mut buf)?;
            Message::IndexUpdate { folder, files }
        }
        0x04 => {
            need(&buf, 4, "request id")?;
            let id = buf.get_u32();
            let folder = get_str(&mut buf)?;
            let name = get_str(&mut buf)?;
            need(&buf, 8 + 4, "request range")?;
            let offset = buf.get_i64();
            let size = buf.get_i32();
            let hash = get_hash(&mut buf)?;
            need(&buf, 4 + 1, "request tail")?;
            let weak_hash = buf.get_u32();
            let from_temporary = buf.get_u8() != 0;
            Message::Request(Request {
                id,
                folder,
                name,
                offset,
                size,
                hash,
                weak_hash,
                from_temporary,
            })
        }
        0x05 => {
            need(&buf, 8, "response header")?;
            let id = buf.get_u32();
            let len = buf.get_u32() as usize;
            need(&buf, len + 1, "response data")?;
            let data = buf.split_to(len);
            let code_byte = buf.get_u8();
            let code = ErrorCode::from_u8(code_byte).ok_or(ProtocolError::Malformed {
                context: "error code",
                detail: format!("unknown value {code_byte}"),
            })?;
            Message::Response(Response { id, data, code })
        }
        0x06 => {
            let folder = get_str(&mut buf)?;
            let count = get_count(&mut buf, "progress updates")?;
            let mut updates = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let name = get_str(&mut buf)?;
                let version = get_vector(&mut buf)?;
                let index_count = get_count(&mut buf, "block indexes")?;
                let mut block_indexes = Vec::with_capacity(index_count.min(4096));
                for _ in 0..index_count {
                    need(&buf, 4, "block index")?;
                    block_indexes.push(buf.get_u32());
                }
                updates.push(DownloadProgressUpdate {
                    name,
                    version,
                    block_indexes,
                });
            }
            Message::DownloadProgress { folder, updates }
        }
        0x07 => Message::Ping,
        0x08 => Message::Close {
            reason: get_str(&mut buf)?,
        },
        other => return Err(ProtocolError::UnknownMessage(other)),
    };

    if buf.has_remaining() {
        return Err(ProtocolError::Malformed {
            context: "frame",
            detail: format!("{} trailing bytes", buf.remaining()),
        });
    }
    Ok(msg)
}

// ============================================================================
// Framing
// ============================================================================

fn should_compress(msg: &Message, mode: Compression, payload_len: usize) -> bool {
    if payload_len < COMPRESS_THRESHOLD {
        return false;
    }
    match mode {
        Compression::Never => false,
        Compression::Always => true,
        Compression::Metadata => !matches!(msg, Message::Response(_)),
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut decoder = flate2::read::DeflateDecoder::new(data).take(MAX_FRAME_LEN as u64);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Serialize a message into a complete frame, applying compression when
/// the negotiated mode allows and it actually helps.
///
/// # Errors
/// Returns an error if compression fails.
pub fn encode_frame(msg: &Message, mode: Compression) -> Result<Bytes, ProtocolError> {
    let payload = encode_payload(msg);
    let mut flags = 0u8;
    let body: Vec<u8> = if should_compress(msg, mode, payload.len()) {
        let compressed = deflate(&payload)?;
        if compressed.len() < payload.len() {
            flags |= FLAG_COMPRESSED;
            compressed
        } else {
            payload.to_vec()
        }
    } else {
        payload.to_vec()
    };

    let mut frame = BytesMut::with_capacity(4 + 2 + body.len());
    frame.put_u32((body.len() + 2) as u32);
    frame.put_u8(msg.type_id());
    frame.put_u8(flags);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Read one message off the stream.
///
/// # Errors
/// Returns an error for I/O failures, oversized frames, or malformed
/// content; all are fatal to the connection.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, ProtocolError> {
    let len = reader.read_u32().await? as usize;
    if len < 2 {
        return Err(ProtocolError::Truncated("frame header"));
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized(len));
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;

    let type_id = frame[0];
    let flags = frame[1];
    let payload = if flags & FLAG_COMPRESSED != 0 {
        Bytes::from(inflate(&frame[2..])?)
    } else {
        Bytes::copy_from_slice(&frame[2..])
    };

    decode_payload(type_id, payload)
}

/// Write one message to the stream.
///
/// # Errors
/// Returns an error if encoding or the write fails.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
    mode: Compression,
) -> Result<(), ProtocolError> {
    let frame = encode_frame(msg, mode)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
