//! YMODEM batch engine.
//!
//! Each file is announced by block 0 (filename NUL decimal-size NUL, zero
//! padded to 128 bytes, CRC-16) and transported as XMODEM-1K payload blocks.
//! An empty block 0 terminates the batch. A single-file upload skips block 0
//! entirely and degrades to plain XMODEM-1K, which is what the boards this
//! protocol grew up with expect.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::sanitize::sanitize_filename;
use super::xmodem::{
    read_block_body, send_block_with_retries, BlockRead, ACK, CRC_REQUEST, EOT, NAK, SOH, STX, SUB,
};
use super::{LiveDirection, TransferContext, TransferError, TransferResult};

/// Base timeout while waiting for the receiver's `C`.
const START_TIMEOUT: Duration = Duration::from_secs(60);

/// Base timeout for the `C` that requests file data after block 0.
const DATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Pause between the data-`C` and the first payload block, giving the peer
/// time to open its output file.
const PRE_DATA_PAUSE: Duration = Duration::from_secs(2);

/// Receiver-side pause between seeing EOT and acknowledging it.
const EOT_ACK_PAUSE: Duration = Duration::from_millis(2200);

/// Receiver-side pause in the post-header ACK dance.
const HEADER_ACK_PAUSE: Duration = Duration::from_millis(2700);

/// Base timeout for a payload block header.
const BLOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry budget for corrupted payload blocks.
const MAX_RETRIES: usize = 10;

/// Wait for one specific byte, ignoring everything else on the wire.
async fn wait_for_byte(
    ctx: &mut TransferContext<'_>,
    wanted: u8,
    base_timeout: Duration,
) -> TransferResult<()> {
    let deadline = tokio::time::Instant::now() + ctx.scaled(base_timeout);
    while tokio::time::Instant::now() < deadline {
        ctx.check_cancel()?;
        match ctx.read_byte(Duration::from_secs(1)).await {
            Some(b) if b == wanted => return Ok(()),
            Some(other) => {
                tracing::debug!("ignoring 0x{:02X} while waiting for 0x{:02X}", other, wanted);
            }
            None => {
                if !ctx.link.is_connected() {
                    return Err(TransferError::LinkClosed);
                }
            }
        }
    }
    Err(TransferError::Timeout(format!("byte 0x{wanted:02X}")))
}

/// Build the 128-byte block-0 payload: `name\0size\0` zero padded.
fn build_block0(filename: &str, size: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(128);
    if !filename.is_empty() {
        payload.extend_from_slice(filename.as_bytes());
        payload.push(0);
        payload.extend_from_slice(size.to_string().as_bytes());
        payload.push(0);
    }
    payload.resize(128, 0);
    payload
}

/// Parse block 0 into (filename, size). An empty filename ends the batch.
fn parse_block0(payload: &[u8]) -> TransferResult<(String, u64)> {
    let name_end = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TransferError::Protocol("block 0 without NUL terminator".into()))?;
    if name_end == 0 {
        return Ok((String::new(), 0));
    }
    let name = String::from_utf8_lossy(&payload[..name_end]).into_owned();

    let rest = &payload[name_end + 1..];
    let size_end = rest
        .iter()
        .position(|&b| b == 0 || b == b' ')
        .unwrap_or(rest.len());
    let size = std::str::from_utf8(&rest[..size_end])
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok((name, size))
}

/// Send block 0 for one file (or the end-of-batch null header).
async fn send_header(ctx: &mut TransferContext<'_>, filename: &str, size: u64) -> TransferResult<()> {
    ctx.sink
        .live(LiveDirection::Wait, None, "Waiting for CRC request");
    wait_for_byte(ctx, CRC_REQUEST, START_TIMEOUT).await?;

    let payload = build_block0(filename, size);
    send_block_with_retries(ctx, SOH, 0, &payload, true).await?;

    if !filename.is_empty() {
        // The peer asks for the data with another C; give it breathing room.
        wait_for_byte(ctx, CRC_REQUEST, DATA_REQUEST_TIMEOUT).await?;
        ctx.pause(ctx.scaled(PRE_DATA_PAUSE)).await;
    }
    Ok(())
}

/// Send one file's payload as XMODEM-1K blocks followed by EOT.
async fn send_data(
    ctx: &mut TransferContext<'_>,
    path: &Path,
    filename: &str,
    file_idx: usize,
    total_files: usize,
) -> TransferResult<()> {
    let data = std::fs::read(path)?;
    let total = data.len() as u64;
    let mut block_num: u8 = 1;
    let mut sent: u64 = 0;

    for chunk in data.chunks(1024) {
        ctx.check_cancel()?;
        let mut padded = chunk.to_vec();
        padded.resize(1024, SUB);
        send_block_with_retries(ctx, STX, block_num, &padded, true).await?;

        sent += chunk.len() as u64;
        ctx.stats.bytes_transferred += chunk.len() as u64;
        block_num = block_num.wrapping_add(1);

        let status = if total_files > 1 {
            format!("File {file_idx}/{total_files}: {filename} ({sent}/{total} bytes)")
        } else {
            format!("{filename} ({sent}/{total} bytes)")
        };
        ctx.sink.progress_named(sent, total, status, filename);
    }

    ctx.send_raw(&[EOT], "EOT").await?;
    wait_for_byte(ctx, ACK, BLOCK_TIMEOUT).await?;

    // Some boards double-ACK the EOT; absence of the second is not an error.
    if wait_for_byte(ctx, ACK, Duration::from_secs(2)).await.is_err() {
        tracing::debug!("no second ACK after EOT (non-fatal)");
    }
    Ok(())
}

/// Upload files. One file degrades to headerless XMODEM-1K; two or more use
/// the full batch framing with a null header at the end.
pub(crate) async fn send(ctx: &mut TransferContext<'_>, files: &[PathBuf]) -> TransferResult<()> {
    let total_files = files.len();

    if total_files == 1 {
        let path = &files[0];
        let filename = path.file_name().unwrap_or_default().to_string_lossy();
        tracing::info!("YMODEM single-file send (no header): {}", filename);

        ctx.sink.file_start(filename.as_ref());
        wait_for_byte(ctx, CRC_REQUEST, START_TIMEOUT).await?;
        ctx.pause(ctx.scaled(PRE_DATA_PAUSE)).await;
        send_data(ctx, path, &filename, 1, 1).await?;
        ctx.sink
            .file_complete(filename.as_ref(), std::fs::metadata(path)?.len());
        return Ok(());
    }

    tracing::info!("YMODEM batch send: {} files", total_files);
    for (idx, path) in files.iter().enumerate() {
        let filename = path.file_name().unwrap_or_default().to_string_lossy();
        let size = std::fs::metadata(path)?.len();

        ctx.sink.file_start(filename.as_ref());
        send_header(ctx, &filename, size).await?;
        send_data(ctx, path, &filename, idx + 1, total_files).await?;
        ctx.sink.file_complete(filename.as_ref(), size);
    }

    // End of batch: one null header.
    send_header(ctx, "", 0).await?;
    Ok(())
}

/// Wait for a block-0 header. Returns `None` on end-of-batch EOT.
///
/// The `C` request is re-sent every few seconds; the sender may have eaten
/// the first one while it was still waiting out its optional second EOT ACK.
async fn receive_header(ctx: &mut TransferContext<'_>) -> TransferResult<Option<(String, u64)>> {
    let deadline = tokio::time::Instant::now() + ctx.scaled(START_TIMEOUT);
    let mut last_request = tokio::time::Instant::now();
    loop {
        ctx.check_cancel()?;
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(TransferError::Timeout("YMODEM header block".into()));
        }
        if now.duration_since(last_request) >= Duration::from_secs(3) {
            ctx.send_raw(&[CRC_REQUEST], "C for header (retry)").await?;
            last_request = now;
        }
        match ctx.read_byte(Duration::from_secs(1)).await {
            Some(SOH) => match read_block_body(ctx, 128, true).await? {
                BlockRead::Ok { num: 0, data } => {
                    return parse_block0(&data).map(Some);
                }
                BlockRead::Ok { num, .. } => {
                    tracing::warn!("expected block 0, got block {}", num);
                    ctx.send_raw(&[NAK], "NAK").await?;
                }
                BlockRead::Bad => {
                    ctx.send_raw(&[NAK], "NAK").await?;
                }
            },
            Some(EOT) => return Ok(None),
            Some(other) => {
                tracing::debug!("ignoring 0x{:02X} while waiting for header", other);
            }
            None => {
                if !ctx.link.is_connected() {
                    return Err(TransferError::LinkClosed);
                }
            }
        }
    }
}

/// Receive one file's payload blocks until EOT.
async fn receive_data(
    ctx: &mut TransferContext<'_>,
    path: &Path,
    filename: &str,
    size: u64,
) -> TransferResult<()> {
    let mut data: Vec<u8> = Vec::new();
    let mut expected: u8 = 1;
    let mut retries = 0usize;

    loop {
        ctx.check_cancel()?;
        let header = ctx
            .read_byte(BLOCK_TIMEOUT)
            .await
            .ok_or_else(|| TransferError::Timeout("YMODEM data block".into()))?;

        match header {
            EOT => {
                ctx.pause(ctx.scaled(EOT_ACK_PAUSE)).await;
                ctx.send_raw(&[ACK], "ACK for EOT").await?;
                break;
            }
            SOH | STX => {
                let block_size = if header == STX { 1024 } else { 128 };
                match read_block_body(ctx, block_size, true).await? {
                    BlockRead::Ok { num, data: block } => {
                        if num == expected {
                            data.extend_from_slice(&block);
                            expected = expected.wrapping_add(1);
                            retries = 0;
                            ctx.stats.blocks_received += 1;
                            ctx.send_raw(&[ACK], "ACK").await?;
                            ctx.pause(ctx.profile.post_ack_delay).await;

                            let done = if size > 0 {
                                (data.len() as u64).min(size)
                            } else {
                                data.len() as u64
                            };
                            ctx.sink.progress_named(
                                done,
                                size,
                                format!("{filename} ({done}/{size} bytes)"),
                                filename,
                            );
                        } else if num == expected.wrapping_sub(1) {
                            ctx.send_raw(&[ACK], "ACK duplicate").await?;
                        } else {
                            return Err(TransferError::Protocol(format!(
                                "block {num} out of sequence (expected {expected})"
                            )));
                        }
                    }
                    BlockRead::Bad => {
                        retries += 1;
                        if retries > MAX_RETRIES {
                            return Err(TransferError::Protocol(
                                "too many corrupted blocks".into(),
                            ));
                        }
                        ctx.send_raw(&[NAK], "NAK").await?;
                    }
                }
            }
            other => {
                tracing::debug!("ignoring 0x{:02X} inside data stream", other);
            }
        }
    }

    // Trim to the declared size; with no size, strip the SUB padding.
    if size > 0 {
        data.truncate(size as usize);
    } else {
        while data.last() == Some(&SUB) {
            data.pop();
        }
    }
    ctx.stats.bytes_transferred += data.len() as u64;
    std::fs::write(path, &data)?;
    Ok(())
}

/// Download a batch into `dir`. Returns the files written.
pub(crate) async fn receive(
    ctx: &mut TransferContext<'_>,
    dir: &Path,
) -> TransferResult<Vec<PathBuf>> {
    let mut received = Vec::new();

    loop {
        ctx.check_cancel()?;
        ctx.send_raw(&[CRC_REQUEST], "C for header").await?;

        let header = match receive_header(ctx).await {
            Ok(h) => h,
            Err(TransferError::Timeout(_)) if !received.is_empty() => {
                // No further header after at least one file: batch done.
                tracing::debug!("no more headers, batch complete");
                break;
            }
            Err(e) => return Err(e),
        };

        let Some((name, size)) = header else {
            // EOT instead of a header also ends the batch.
            ctx.send_raw(&[ACK], "ACK end-of-batch").await?;
            break;
        };

        if name.is_empty() {
            ctx.send_raw(&[ACK], "ACK null header").await?;
            break;
        }

        let safe_name = sanitize_filename(&name, ".prg");
        let path = dir.join(&safe_name);
        tracing::info!("YMODEM receiving '{}' ({} bytes) -> {}", name, size, path.display());
        ctx.sink.file_start(&safe_name);

        // Header acknowledged, then the data request: ACK ACK <pause> ACK C.
        ctx.send_raw(&[ACK], "ACK header").await?;
        ctx.pause(ctx.profile.post_ack_delay).await;
        ctx.send_raw(&[ACK], "ACK header (2nd)").await?;
        ctx.pause(ctx.scaled(HEADER_ACK_PAUSE)).await;
        ctx.send_raw(&[ACK, CRC_REQUEST], "ACK + C for data").await?;

        match receive_data(ctx, &path, &safe_name, size).await {
            Ok(()) => {
                let written = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                ctx.sink.file_complete(&safe_name, written);
                received.push(path);
            }
            Err(e) => {
                ctx.sink.file_error(&safe_name, e.to_string());
                return Err(e);
            }
        }
    }

    if received.is_empty() {
        return Err(TransferError::Protocol("no files received".into()));
    }
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block0_roundtrip() {
        let payload = build_block0("GAME.PRG", 51200);
        assert_eq!(payload.len(), 128);
        let (name, size) = parse_block0(&payload).unwrap();
        assert_eq!(name, "GAME.PRG");
        assert_eq!(size, 51200);
    }

    #[test]
    fn test_null_block0() {
        let payload = build_block0("", 0);
        assert_eq!(payload.len(), 128);
        assert!(payload.iter().all(|&b| b == 0));
        let (name, size) = parse_block0(&payload).unwrap();
        assert!(name.is_empty());
        assert_eq!(size, 0);
    }

    #[test]
    fn test_parse_block0_space_terminated_size() {
        let mut payload = b"FILE\x00123 junk".to_vec();
        payload.resize(128, 0);
        let (name, size) = parse_block0(&payload).unwrap();
        assert_eq!(name, "FILE");
        assert_eq!(size, 123);
    }

    #[test]
    fn test_parse_block0_garbage_size_is_zero() {
        let mut payload = b"FILE\x00abc\x00".to_vec();
        payload.resize(128, 0);
        let (_, size) = parse_block0(&payload).unwrap();
        assert_eq!(size, 0);
    }
}
