//! TurboModem engine.
//!
//! Throughput-oriented protocol: fixed 4 KiB blocks, CRC-32 per block and an
//! 8-block pipeline between acknowledgements. The receiver answers each
//! window with TBAC plus an 8-bit bitmap (bit i = block base+i arrived
//! intact, 0xFE substituted for 0xFF on the wire); the sender retransmits
//! only the cleared bits. Multi-file batches run TBRQ/TBOK rounds until the
//! sender answers a TBRQ with TBND.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crc::{Crc, CRC_32_ISO_HDLC};

use super::sanitize::sanitize_filename;
use super::{TransferContext, TransferError, TransferResult};

/// Data block magic.
const MAGIC: [u8; 2] = *b"TB";

// Command frames.
const CMD_REQUEST: [u8; 4] = *b"TBRQ";
const CMD_OK: [u8; 4] = *b"TBOK";
const CMD_END: [u8; 4] = *b"TBND";
const CMD_ACK: [u8; 4] = *b"TBAC";
/// Reserved negative ACK; window NAKs travel in the TBAC bitmap instead.
#[allow(dead_code)]
const CMD_NAK: [u8; 4] = *b"TBNK";
const CMD_EOT: [u8; 5] = *b"TBEOT";
const CMD_CAN: [u8; 5] = *b"TBCAN";

/// Fixed block payload size.
pub(crate) const BLOCK_SIZE: usize = 4096;

/// Blocks in flight between acknowledgements.
const WINDOW_SIZE: usize = 8;

/// Retry budget per window.
const MAX_RETRIES: usize = 16;

/// Safety cap on files per batch.
const MAX_FILES: usize = 100;

const ACK_TIMEOUT: Duration = Duration::from_secs(30);
const BLOCK_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PATTERN_TIMEOUT: Duration = Duration::from_secs(60);

/// CRC-32 (IEEE, zlib-compatible).
pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Encode one data block: TB, block# (u32 BE), size (u16 BE, always 4096),
/// zero-padded payload, CRC-32 (u32 BE) over the padded payload.
pub(crate) fn encode_block(block_num: u32, data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    padded.resize(BLOCK_SIZE, 0);

    let mut frame = Vec::with_capacity(2 + 4 + 2 + BLOCK_SIZE + 4);
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&block_num.to_be_bytes());
    frame.extend_from_slice(&(BLOCK_SIZE as u16).to_be_bytes());
    frame.extend_from_slice(&padded);
    frame.extend_from_slice(&CRC32.checksum(&padded).to_be_bytes());
    frame
}

/// Decode and verify a complete block frame. `None` on any mismatch.
pub(crate) fn decode_block(frame: &[u8]) -> Option<(u32, Vec<u8>)> {
    if frame.len() < 2 + 4 + 2 + 4 || frame[..2] != MAGIC {
        return None;
    }
    let block_num = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]);
    let size = u16::from_be_bytes([frame[6], frame[7]]) as usize;
    let size = if size == 0 { BLOCK_SIZE } else { size };
    if frame.len() != 8 + size + 4 {
        return None;
    }
    let payload = &frame[8..8 + size];
    let wire_crc = u32::from_be_bytes([
        frame[8 + size],
        frame[8 + size + 1],
        frame[8 + size + 2],
        frame[8 + size + 3],
    ]);
    if CRC32.checksum(payload) != wire_crc {
        return None;
    }
    Some((block_num, payload.to_vec()))
}

/// Scan the stream for an exact byte pattern, discarding leading noise.
async fn wait_for_pattern(
    ctx: &mut TransferContext<'_>,
    pattern: &[u8],
    base_timeout: Duration,
) -> TransferResult<bool> {
    let deadline = tokio::time::Instant::now() + ctx.scaled(base_timeout);
    let mut tail: Vec<u8> = Vec::new();
    let mut skipped = 0usize;
    while tokio::time::Instant::now() < deadline {
        ctx.check_cancel()?;
        let Some(byte) = ctx.read_byte(Duration::from_secs(1)).await else {
            if !ctx.link.is_connected() {
                return Err(TransferError::LinkClosed);
            }
            continue;
        };
        tail.push(byte);
        if tail.len() > pattern.len() * 2 {
            tail.drain(..pattern.len());
            skipped += pattern.len();
        }
        if tail.ends_with(pattern) {
            if skipped + tail.len() > pattern.len() {
                tracing::debug!(
                    "skipped {} noise bytes before {:?}",
                    skipped + tail.len() - pattern.len(),
                    String::from_utf8_lossy(pattern)
                );
            }
            return Ok(true);
        }
    }
    Ok(false)
}

/// Read one block off the wire. `None` covers timeouts, bad magic and CRC
/// failures alike; the window bitmap sorts it out.
async fn read_block(ctx: &mut TransferContext<'_>) -> Option<(u32, Vec<u8>)> {
    let header = ctx.read_exact(8, BLOCK_TIMEOUT).await?;
    if header[..2] != MAGIC {
        tracing::warn!("bad block magic: {:02X} {:02X}", header[0], header[1]);
        return None;
    }
    let block_num = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    let size = u16::from_be_bytes([header[6], header[7]]) as usize;
    let size = if size == 0 { BLOCK_SIZE } else { size };

    let payload = ctx.read_exact(size, BLOCK_TIMEOUT).await?;
    let crc_bytes = ctx.read_exact(4, Duration::from_secs(5)).await?;
    let wire_crc = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

    if CRC32.checksum(&payload) != wire_crc {
        ctx.stats.corrupted += 1;
        tracing::warn!("CRC mismatch on block {}", block_num);
        return None;
    }
    ctx.stats.blocks_received += 1;
    Some((block_num, payload))
}

/// Read a 4-byte command, folding the 5-byte TBCAN into `Cancelled`.
async fn read_command(
    ctx: &mut TransferContext<'_>,
    base_timeout: Duration,
) -> TransferResult<Option<[u8; 4]>> {
    let Some(cmd) = ctx.read_exact(4, base_timeout).await else {
        if !ctx.link.is_connected() {
            return Err(TransferError::LinkClosed);
        }
        return Ok(None);
    };
    let cmd: [u8; 4] = [cmd[0], cmd[1], cmd[2], cmd[3]];
    if cmd == [b'T', b'B', b'C', b'A'] {
        // TBCAN: consume the trailing byte and surface the cancel.
        let _ = ctx.read_byte(Duration::from_secs(1)).await;
        return Err(TransferError::Cancelled);
    }
    Ok(Some(cmd))
}

/// Send one file's blocks through the sliding window.
async fn send_file_blocks(
    ctx: &mut TransferContext<'_>,
    data: &[u8],
    filename: &str,
) -> TransferResult<()> {
    let filesize = data.len();
    let mut window: Vec<(u32, &[u8])> = Vec::with_capacity(WINDOW_SIZE);
    let mut chunks = data.chunks(BLOCK_SIZE);
    let mut next_block: u32 = 1;
    let mut sent: usize = 0;
    let mut retries = 0usize;

    loop {
        if ctx.cancel.is_cancelled() {
            let _ = ctx.send_raw(&CMD_CAN, "TBCAN").await;
            return Err(TransferError::Cancelled);
        }

        while window.len() < WINDOW_SIZE {
            match chunks.next() {
                Some(chunk) => {
                    window.push((next_block, chunk));
                    next_block += 1;
                }
                None => break,
            }
        }
        if window.is_empty() {
            break;
        }

        for &(num, chunk) in &window {
            let frame = encode_block(num, chunk);
            ctx.send_raw(&frame, &format!("block {num}")).await?;
            ctx.stats.blocks_sent += 1;
        }

        let Some(cmd) = read_command(ctx, ACK_TIMEOUT).await? else {
            retries += 1;
            if retries > MAX_RETRIES {
                return Err(TransferError::Timeout("window ACK".into()));
            }
            continue;
        };
        if cmd != CMD_ACK {
            tracing::warn!("expected TBAC, got {:?}", String::from_utf8_lossy(&cmd));
            retries += 1;
            if retries > MAX_RETRIES {
                return Err(TransferError::Protocol("no TBAC for window".into()));
            }
            continue;
        }
        let Some(bitmap) = ctx.read_byte(Duration::from_secs(5)).await else {
            retries += 1;
            if retries > MAX_RETRIES {
                return Err(TransferError::Timeout("ACK bitmap".into()));
            }
            continue;
        };

        if bitmap >= 0xFE {
            for &(_, chunk) in &window {
                sent += chunk.len();
            }
            ctx.stats.bytes_transferred += window.iter().map(|(_, c)| c.len() as u64).sum::<u64>();
            window.clear();
            retries = 0;
            ctx.sink.progress_named(
                sent as u64,
                filesize as u64,
                format!("Sent {} KB", sent / 1024),
                filename,
            );
        } else {
            // Keep only the blocks whose bits are clear.
            let keep: Vec<(u32, &[u8])> = window
                .iter()
                .enumerate()
                .filter(|(i, _)| (bitmap & (1u8 << i)) == 0)
                .map(|(_, &entry)| entry)
                .collect();
            ctx.stats.retransmits += keep.len() as u64;
            tracing::debug!(
                "window bitmap {:02X}: retransmitting {} block(s)",
                bitmap,
                keep.len()
            );
            window = keep;
            retries += 1;
            if retries > MAX_RETRIES {
                return Err(TransferError::Protocol(
                    "window retries exhausted".into(),
                ));
            }
        }
    }

    ctx.send_raw(&CMD_EOT, "TBEOT").await?;
    let Some(final_ack) = ctx.read_exact(5, BLOCK_TIMEOUT).await else {
        return Err(TransferError::Timeout("final ACK after EOT".into()));
    };
    if final_ack[..4] != CMD_ACK {
        return Err(TransferError::Protocol("bad final ACK after EOT".into()));
    }
    Ok(())
}

/// Upload entry point: serve TBRQ rounds until the queue is empty.
pub(crate) async fn send(ctx: &mut TransferContext<'_>, files: &[PathBuf]) -> TransferResult<()> {
    let mut queue: Vec<&PathBuf> = files.iter().collect();
    queue.reverse(); // pop() preserves the caller's order

    loop {
        ctx.check_cancel()?;
        if !wait_for_pattern(ctx, &CMD_REQUEST, PATTERN_TIMEOUT).await? {
            return Err(TransferError::Timeout("TBRQ".into()));
        }

        let Some(path) = queue.pop() else {
            ctx.send_raw(&CMD_END, "TBND").await?;
            break;
        };

        let data = std::fs::read(path)?;
        let filename = path.file_name().unwrap_or_default().to_string_lossy();
        let name_bytes = filename.as_bytes();
        tracing::info!("turbomodem send: {} ({} bytes)", filename, data.len());

        let mut header = Vec::with_capacity(4 + 8 + 2 + name_bytes.len());
        header.extend_from_slice(&CMD_OK);
        header.extend_from_slice(&(data.len() as u64).to_be_bytes());
        header.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
        header.extend_from_slice(name_bytes);
        ctx.send_raw(&header, "TBOK header").await?;

        ctx.sink.file_start(filename.as_ref());
        send_file_blocks(ctx, &data, &filename).await?;
        ctx.sink.file_complete(filename.as_ref(), data.len() as u64);
    }
    Ok(())
}

/// Receive one file's blocks after its TBOK header.
async fn receive_file_blocks(
    ctx: &mut TransferContext<'_>,
    path: &Path,
    filesize: u64,
    filename: &str,
) -> TransferResult<()> {
    let mut file = std::fs::File::create(path)?;
    let mut pending: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut expected_block: u32 = 1;
    let mut received: u64 = 0;
    let mut retries = 0usize;

    while received < filesize {
        if ctx.cancel.is_cancelled() {
            let _ = ctx.send_raw(&CMD_CAN, "TBCAN").await;
            return Err(TransferError::Cancelled);
        }

        let remaining_blocks =
            ((filesize - received) as usize + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let window_len = remaining_blocks.min(WINDOW_SIZE);
        let window_range = expected_block..expected_block + window_len as u32;

        // Only the still-missing blocks of this window are in flight.
        let missing = window_range
            .clone()
            .filter(|n| !pending.contains_key(n))
            .count();
        for _ in 0..missing {
            match read_block(ctx).await {
                Some((num, data)) => {
                    pending.insert(num, data);
                }
                None => break,
            }
        }

        // Bitmap over the expected window; bits outside it stay set.
        let mut bitmap: u8 = 0xFF;
        for (i, num) in window_range.clone().enumerate() {
            if !pending.contains_key(&num) {
                bitmap &= !(1u8 << i);
            }
        }
        let wire_bitmap = if bitmap == 0xFF { 0xFE } else { bitmap };
        let mut ack = CMD_ACK.to_vec();
        ack.push(wire_bitmap);
        ctx.send_raw(&ack, "TBAC + bitmap").await?;

        if window_range.clone().any(|n| !pending.contains_key(&n)) {
            retries += 1;
            ctx.stats.retransmits += 1;
            tracing::debug!("window incomplete (bitmap {:02X}), retry {}", bitmap, retries);
            if retries > MAX_RETRIES {
                let _ = ctx.send_raw(&CMD_CAN, "TBCAN").await;
                return Err(TransferError::Protocol(
                    "window retries exhausted".into(),
                ));
            }
            continue;
        }
        retries = 0;

        // Flush the contiguous run, trimming the tail to the declared size.
        while let Some(data) = pending.remove(&expected_block) {
            let keep = ((filesize - received) as usize).min(data.len());
            file.write_all(&data[..keep])?;
            received += keep as u64;
            expected_block += 1;
            ctx.sink.progress_named(
                received,
                filesize,
                format!("Received {} KB", received / 1024),
                filename,
            );
            if received >= filesize {
                break;
            }
        }
        ctx.stats.bytes_transferred = received;
    }

    // End of file: TBEOT answered with an all-ones bitmap.
    match ctx.read_exact(5, BLOCK_TIMEOUT).await {
        Some(eot) if eot == CMD_EOT => {
            let mut ack = CMD_ACK.to_vec();
            ack.push(0xFE);
            ctx.send_raw(&ack, "final TBAC").await?;
        }
        Some(other) => {
            tracing::warn!("expected TBEOT, got {:02X?}", other);
            let mut ack = CMD_ACK.to_vec();
            ack.push(0xFE);
            ctx.send_raw(&ack, "final TBAC").await?;
        }
        None => {
            return Err(TransferError::Timeout("TBEOT".into()));
        }
    }

    file.flush()?;
    Ok(())
}

/// Download entry point: TBRQ rounds until TBND.
pub(crate) async fn receive(
    ctx: &mut TransferContext<'_>,
    dir: &Path,
) -> TransferResult<Vec<PathBuf>> {
    let mut files = Vec::new();

    for _ in 0..MAX_FILES {
        ctx.check_cancel()?;
        ctx.send_raw(&CMD_REQUEST, "TBRQ").await?;

        let Some(cmd) = read_command(ctx, REQUEST_TIMEOUT).await? else {
            return Err(TransferError::Timeout("TBOK/TBND".into()));
        };
        if cmd == CMD_END {
            tracing::debug!("TBND: batch complete");
            break;
        }
        if cmd != CMD_OK {
            return Err(TransferError::Protocol(format!(
                "expected TBOK or TBND, got {:?}",
                String::from_utf8_lossy(&cmd)
            )));
        }

        let size_bytes = ctx
            .read_exact(8, BLOCK_TIMEOUT)
            .await
            .ok_or_else(|| TransferError::Timeout("file size".into()))?;
        let mut size_arr = [0u8; 8];
        size_arr.copy_from_slice(&size_bytes);
        let filesize = u64::from_be_bytes(size_arr);

        let len_bytes = ctx
            .read_exact(2, Duration::from_secs(5))
            .await
            .ok_or_else(|| TransferError::Timeout("name length".into()))?;
        let name_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;

        let name_bytes = ctx
            .read_exact(name_len, Duration::from_secs(5))
            .await
            .ok_or_else(|| TransferError::Timeout("file name".into()))?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();

        let safe_name = sanitize_filename(&name, ".prg");
        let path = dir.join(&safe_name);
        tracing::info!(
            "turbomodem receiving '{}' ({} bytes) -> {}",
            name,
            filesize,
            path.display()
        );
        ctx.sink.file_start(&safe_name);

        match receive_file_blocks(ctx, &path, filesize, &safe_name).await {
            Ok(()) => {
                ctx.sink.file_complete(&safe_name, filesize);
                files.push(path);
            }
            Err(e) => {
                ctx.sink.file_error(&safe_name, e.to_string());
                return Err(e);
            }
        }
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
    fn test_block_roundtrip() {
        let data = vec![0x5Au8; 1000];
        let frame = encode_block(3, &data);
        assert_eq!(frame.len(), 2 + 4 + 2 + BLOCK_SIZE + 4);
        assert_eq!(&frame[..2], b"TB");

        let (num, payload) = decode_block(&frame).unwrap();
        assert_eq!(num, 3);
        assert_eq!(payload.len(), BLOCK_SIZE);
        assert_eq!(&payload[..1000], &data[..]);
        // Padding is zeroes.
        assert!(payload[1000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bit_flip_rejected() {
        let data = vec![0x11u8; BLOCK_SIZE];
        let frame = encode_block(1, &data);
        // Flip one bit in each region of the payload and expect rejection.
        for &pos in &[8usize, 8 + 2048, 8 + BLOCK_SIZE - 1] {
            let mut bad = frame.clone();
            bad[pos] ^= 0x01;
            assert!(decode_block(&bad).is_none(), "flip at {pos} not caught");
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut frame = encode_block(1, &[0u8; 16]);
        frame[0] = b'X';
        assert!(decode_block(&frame).is_none());
    }

    #[test]
    fn test_header_field_layout() {
        let frame = encode_block(0x01020304, &[0u8; 16]);
        assert_eq!(&frame[2..6], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&frame[6..8], &[0x10, 0x00]); // 4096 big-endian
    }

    #[test]
    fn test_crc32_is_zlib_compatible() {
        // Well-known zlib crc32 of "123456789".
        assert_eq!(CRC32.checksum(b"123456789"), 0xCBF43926);
    }
}
