//! Raw-TCP batch engine.
//!
//! Minimal framing for lossless links: every frame opens with the `FAST`
//! magic and a type tag. The sender announces the batch with INIT, waits for
//! READY, then streams each file as HEADER / raw bytes / END with an OK from
//! the receiver after HEADER and END. File integrity is spot-checked with
//! the first four bytes of an MD5 digest carried in the header.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use md5::{Digest, Md5};

use super::sanitize::sanitize_filename;
use super::{TransferContext, TransferError, TransferResult};

/// Frame magic.
pub(crate) const MAGIC: [u8; 4] = *b"FAST";

// Frame type tags.
pub(crate) const TYPE_HEADER: u8 = 0x01;
/// Reserved tag for framed data; payload bytes travel raw in this design.
#[allow(dead_code)]
pub(crate) const TYPE_DATA: u8 = 0x02;
pub(crate) const TYPE_END: u8 = 0x03;
pub(crate) const TYPE_OK: u8 = 0x04;
pub(crate) const TYPE_READY: u8 = 0x10;
pub(crate) const TYPE_INIT: u8 = 0x11;
pub(crate) const TYPE_BATCH: u8 = 0x12;

/// File payload chunk size.
const CHUNK_SIZE: usize = 64 * 1024;

/// How much leading noise the magic scanner tolerates.
const SCAN_WINDOW: usize = 64 * 1024;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const OK_TIMEOUT: Duration = Duration::from_secs(10);

/// Bytes of a HEADER frame after the magic.
const HEADER_BODY_LEN: usize = 8 + 1 + 1 + 4;

/// First four bytes of the MD5 digest as a big-endian word.
pub(crate) fn md5_prefix(data: &[u8]) -> u32 {
    let digest = Md5::digest(data);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Parsed HEADER frame body (everything after the magic, before the name).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileHeader {
    pub size: u64,
    pub name_len: u8,
    pub checksum: u32,
}

/// Build a complete HEADER frame.
pub(crate) fn build_header(filename: &str, size: u64, checksum: u32) -> Vec<u8> {
    let name = &filename.as_bytes()[..filename.len().min(255)];
    let mut frame = Vec::with_capacity(4 + HEADER_BODY_LEN + name.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&size.to_be_bytes());
    frame.push(name.len() as u8);
    frame.push(TYPE_HEADER);
    frame.extend_from_slice(&checksum.to_be_bytes());
    frame.extend_from_slice(name);
    frame
}

/// Parse a HEADER frame body. Fails when the embedded type tag is wrong.
pub(crate) fn parse_header_body(body: &[u8]) -> Option<FileHeader> {
    if body.len() < HEADER_BODY_LEN || body[9] != TYPE_HEADER {
        return None;
    }
    Some(FileHeader {
        size: u64::from_be_bytes(body[..8].try_into().ok()?),
        name_len: body[8],
        checksum: u32::from_be_bytes(body[10..14].try_into().ok()?),
    })
}

/// A 5-byte control frame: magic plus type tag.
fn control_frame(tag: u8) -> [u8; 5] {
    [MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3], tag]
}

/// Expect a control frame with the given tag.
async fn expect_control(
    ctx: &mut TransferContext<'_>,
    tag: u8,
    what: &str,
    base_timeout: Duration,
) -> TransferResult<()> {
    let Some(frame) = ctx.read_exact(5, base_timeout).await else {
        if !ctx.link.is_connected() {
            return Err(TransferError::LinkClosed);
        }
        return Err(TransferError::Timeout(what.into()));
    };
    if frame[..4] != MAGIC || frame[4] != tag {
        return Err(TransferError::Protocol(format!(
            "bad {what} frame: {frame:02X?}"
        )));
    }
    Ok(())
}

/// Upload entry point.
pub(crate) async fn send(ctx: &mut TransferContext<'_>, files: &[PathBuf]) -> TransferResult<()> {
    let total_size: u64 = files
        .iter()
        .map(|p| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0))
        .sum();

    // INIT carries the file count; the peer answers READY.
    let mut init = control_frame(TYPE_INIT).to_vec();
    init.extend_from_slice(&(files.len() as u16).to_be_bytes());
    ctx.send_raw(&init, "INIT").await?;
    expect_control(ctx, TYPE_READY, "READY", HANDSHAKE_TIMEOUT).await?;

    let mut sent_total: u64 = 0;
    for path in files {
        ctx.check_cancel()?;
        let data = std::fs::read(path)?;
        let filename = path.file_name().unwrap_or_default().to_string_lossy();
        let checksum = md5_prefix(&data);

        tracing::info!("rawtcp send: {} ({} bytes)", filename, data.len());
        ctx.sink.file_start(filename.as_ref());

        let header = build_header(&filename, data.len() as u64, checksum);
        ctx.send_raw(&header, "HEADER").await?;
        expect_control(ctx, TYPE_OK, "OK after HEADER", OK_TIMEOUT).await?;

        for chunk in data.chunks(CHUNK_SIZE) {
            ctx.check_cancel()?;
            ctx.send_raw(chunk, "data chunk").await?;
            sent_total += chunk.len() as u64;
            ctx.stats.bytes_transferred += chunk.len() as u64;
            ctx.sink
                .progress_named(sent_total, total_size, "Streaming", filename.as_ref());
        }

        ctx.send_raw(&control_frame(TYPE_END), "END").await?;
        if let Err(e) = expect_control(ctx, TYPE_OK, "OK after END", OK_TIMEOUT).await {
            // Some peers skip the final OK; the data is already across.
            tracing::warn!("no final OK for {}: {}", filename, e);
        }

        ctx.stats.blocks_sent += 1;
        ctx.sink.file_complete(filename.as_ref(), data.len() as u64);
    }
    Ok(())
}

/// What the initial magic scan found.
enum Opening {
    /// BATCH frame with a file count.
    Batch(u16),
    /// Legacy single-file opening: the HEADER body was already consumed.
    LegacyHeader(FileHeader),
}

/// Scan the incoming stream for the `FAST` magic, skipping up to
/// [`SCAN_WINDOW`] bytes of interactive chatter ahead of it.
async fn scan_opening(ctx: &mut TransferContext<'_>) -> TransferResult<Opening> {
    let deadline = tokio::time::Instant::now() + ctx.scaled(HANDSHAKE_TIMEOUT);
    let mut tail: Vec<u8> = Vec::new();
    let mut scanned = 0usize;

    while tokio::time::Instant::now() < deadline {
        ctx.check_cancel()?;
        if scanned > SCAN_WINDOW {
            return Err(TransferError::Protocol(format!(
                "no FAST magic within {SCAN_WINDOW} bytes"
            )));
        }
        let Some(byte) = ctx.read_byte(Duration::from_secs(1)).await else {
            if !ctx.link.is_connected() {
                return Err(TransferError::LinkClosed);
            }
            continue;
        };
        scanned += 1;
        tail.push(byte);
        if tail.len() > 8 {
            tail.drain(..tail.len() - 4);
        }
        if !tail.ends_with(&MAGIC) {
            continue;
        }

        if scanned > 4 {
            tracing::debug!("skipped {} bytes before FAST magic", scanned - 4);
        }
        let Some(tag) = ctx.read_byte(Duration::from_secs(5)).await else {
            return Err(TransferError::Timeout("frame tag".into()));
        };

        // INIT and BATCH both announce a batch with a u16 file count; INIT
        // comes from dialing clients, BATCH from hosting peers.
        if tag == TYPE_BATCH || tag == TYPE_INIT {
            let count_bytes = ctx
                .read_exact(2, Duration::from_secs(5))
                .await
                .ok_or_else(|| TransferError::Timeout("batch file count".into()))?;
            return Ok(Opening::Batch(u16::from_be_bytes([
                count_bytes[0],
                count_bytes[1],
            ])));
        }

        // Anything else is read as a legacy HEADER whose first size byte we
        // already hold; the embedded redundant tag decides whether it really
        // was one. A mismatch resumes the scan.
        let rest = ctx
            .read_exact(HEADER_BODY_LEN - 1, Duration::from_secs(5))
            .await
            .ok_or_else(|| TransferError::Timeout("legacy header body".into()))?;
        let mut body = vec![tag];
        body.extend_from_slice(&rest);
        match parse_header_body(&body) {
            Some(header) => return Ok(Opening::LegacyHeader(header)),
            None => {
                tracing::debug!("magic without header frame, continuing scan");
                scanned += body.len();
                tail.clear();
            }
        }
    }
    Err(TransferError::Timeout("FAST magic".into()))
}

/// Receive one file given its parsed header.
async fn receive_one(
    ctx: &mut TransferContext<'_>,
    dir: &Path,
    header: FileHeader,
) -> TransferResult<PathBuf> {
    let name_bytes = ctx
        .read_exact(header.name_len as usize, Duration::from_secs(5))
        .await
        .ok_or_else(|| TransferError::Timeout("file name".into()))?;
    let name = String::from_utf8_lossy(&name_bytes).into_owned();
    let safe_name = sanitize_filename(&name, ".prg");
    let path = dir.join(&safe_name);

    tracing::info!(
        "rawtcp receiving '{}' ({} bytes) -> {}",
        name,
        header.size,
        path.display()
    );
    ctx.sink.file_start(&safe_name);
    ctx.send_raw(&control_frame(TYPE_OK), "OK after HEADER").await?;

    let mut file = std::fs::File::create(&path)?;
    let mut hasher = Md5::new();
    let mut remaining = header.size;
    while remaining > 0 {
        ctx.check_cancel()?;
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let chunk = ctx
            .read_exact(want, HANDSHAKE_TIMEOUT)
            .await
            .ok_or_else(|| TransferError::Timeout("file data".into()))?;
        file.write_all(&chunk)?;
        hasher.update(&chunk);
        remaining -= chunk.len() as u64;
        ctx.stats.bytes_transferred += chunk.len() as u64;
        ctx.sink.progress_named(
            header.size - remaining,
            header.size,
            "Receiving",
            &safe_name,
        );
    }
    file.flush()?;

    let digest = hasher.finalize();
    let actual = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    if actual != header.checksum {
        ctx.stats.corrupted += 1;
        tracing::warn!(
            "MD5 prefix mismatch for {}: header {:08X}, computed {:08X}",
            safe_name,
            header.checksum,
            actual
        );
    }

    match ctx.read_exact(5, Duration::from_secs(5)).await {
        Some(frame) if frame[..4] == MAGIC && frame[4] == TYPE_END => {}
        Some(frame) => tracing::warn!("expected END, got {:02X?}", frame),
        None => tracing::warn!("no END marker after {}", safe_name),
    }
    ctx.send_raw(&control_frame(TYPE_OK), "OK after END").await?;

    ctx.sink.file_complete(&safe_name, header.size);
    Ok(path)
}

/// Download entry point.
pub(crate) async fn receive(
    ctx: &mut TransferContext<'_>,
    dir: &Path,
) -> TransferResult<Vec<PathBuf>> {
    ctx.send_raw(&control_frame(TYPE_READY), "READY").await?;

    let (count, mut pre_header) = match scan_opening(ctx).await? {
        Opening::Batch(count) => {
            tracing::debug!("batch mode: {} file(s)", count);
            (count.max(1), None)
        }
        Opening::LegacyHeader(header) => {
            tracing::debug!("legacy single-file mode");
            (1, Some(header))
        }
    };

    let mut files = Vec::new();
    for _ in 0..count {
        ctx.check_cancel()?;
        let header = match pre_header.take() {
            Some(h) => h,
            None => {
                let frame = ctx
                    .read_exact(4 + HEADER_BODY_LEN, HANDSHAKE_TIMEOUT)
                    .await
                    .ok_or_else(|| TransferError::Timeout("file header".into()))?;
                if frame[..4] != MAGIC {
                    return Err(TransferError::Protocol("bad header magic".into()));
                }
                parse_header_body(&frame[4..])
                    .ok_or_else(|| TransferError::Protocol("malformed header frame".into()))?
            }
        };

        let path = receive_one(ctx, dir, header).await?;
        files.push(path);
    }

    if files.is_empty() {
        return Err(TransferError::Protocol("no files received".into()));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_prefix_known_value() {
        // MD5("abc") = 900150983cd24fb0...
        assert_eq!(md5_prefix(b"abc"), 0x90015098);
    }

    #[test]
    fn test_header_roundtrip() {
        let frame = build_header("GAME.PRG", 51200, 0xDEADBEEF);
        assert_eq!(&frame[..4], b"FAST");
        let header = parse_header_body(&frame[4..]).unwrap();
        assert_eq!(header.size, 51200);
        assert_eq!(header.name_len, 8);
        assert_eq!(header.checksum, 0xDEADBEEF);
        assert_eq!(&frame[4 + HEADER_BODY_LEN..], b"GAME.PRG");
    }

    #[test]
    fn test_header_body_rejects_wrong_tag() {
        let mut frame = build_header("X", 1, 0);
        frame[4 + 9] = TYPE_DATA;
        assert!(parse_header_body(&frame[4..]).is_none());
    }

    #[test]
    fn test_control_frame_layout() {
        assert_eq!(control_frame(TYPE_READY), *b"FAST\x10");
        assert_eq!(control_frame(TYPE_OK), *b"FAST\x04");
        assert_eq!(control_frame(TYPE_END), *b"FAST\x03");
    }
}
