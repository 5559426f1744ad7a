//! XMODEM family engine.
//!
//! Covers the three wire variants: checksum-8 with 128-byte blocks, CRC-16
//! with 128-byte blocks, and CRC-16 with 1024-byte blocks. The receiver
//! initiates by sending NAK (checksum) or `C` (CRC); blocks are retried up
//! to [`MAX_RETRIES`] times and either side may abort with a double CAN.

use std::path::Path;
use std::time::Duration;

use crc::{Crc, CRC_16_XMODEM};

use super::{LiveDirection, TransferContext, TransferError, TransferProtocol, TransferResult};

// XMODEM control characters
pub(crate) const SOH: u8 = 0x01; // 128-byte block header
pub(crate) const STX: u8 = 0x02; // 1024-byte block header
pub(crate) const EOT: u8 = 0x04; // end of transmission
pub(crate) const ACK: u8 = 0x06;
pub(crate) const NAK: u8 = 0x15;
pub(crate) const CAN: u8 = 0x18;
pub(crate) const SUB: u8 = 0x1A; // padding character
pub(crate) const CRC_REQUEST: u8 = b'C';

/// Retry budget for a single block, and for the EOT handshake.
const MAX_RETRIES: usize = 10;

/// Base timeout for ACK/NAK responses (scaled by the speed profile).
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Base timeout for the initial start signal.
const START_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between repeated start bytes while waiting for the sender.
const START_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Attempts to provoke the sender with a start byte before giving up.
const START_RETRIES: usize = 20;

/// CRC-16/XMODEM: polynomial 0x1021, init 0, no reflection, no final XOR.
pub(crate) const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Wire variant of the XMODEM family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// 128-byte blocks, checksum-8 trailer.
    Checksum,
    /// 128-byte blocks, CRC-16 trailer.
    Crc,
    /// 1024-byte blocks, CRC-16 trailer.
    Crc1k,
}

impl Variant {
    pub fn from_protocol(protocol: TransferProtocol) -> Self {
        match protocol {
            TransferProtocol::Xmodem => Self::Checksum,
            TransferProtocol::XmodemCrc => Self::Crc,
            _ => Self::Crc1k,
        }
    }

    pub fn block_size(&self) -> usize {
        match self {
            Self::Crc1k => 1024,
            _ => 128,
        }
    }

    pub fn header(&self) -> u8 {
        match self {
            Self::Crc1k => STX,
            _ => SOH,
        }
    }

    pub fn uses_crc(&self) -> bool {
        !matches!(self, Self::Checksum)
    }
}

/// Sum of all data bytes mod 256.
pub(crate) fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Assemble one block: header, number, complement, payload, trailer.
pub(crate) fn build_block(header: u8, block_num: u8, data: &[u8], use_crc: bool) -> Vec<u8> {
    let mut block = Vec::with_capacity(data.len() + 5);
    block.push(header);
    block.push(block_num);
    block.push(255 - block_num);
    block.extend_from_slice(data);
    if use_crc {
        let crc = CRC16.checksum(data);
        block.extend_from_slice(&crc.to_be_bytes());
    } else {
        block.push(checksum8(data));
    }
    block
}

/// Outcome of reading one block body after its header byte.
pub(crate) enum BlockRead {
    /// Valid block.
    Ok { num: u8, data: Vec<u8> },
    /// Complement or trailer mismatch, or a short read - caller should NAK.
    Bad,
}

/// Read block number, complement, payload and trailer; verify everything.
pub(crate) async fn read_block_body(
    ctx: &mut TransferContext<'_>,
    size: usize,
    use_crc: bool,
) -> TransferResult<BlockRead> {
    let Some(nums) = ctx.read_exact(2, Duration::from_secs(5)).await else {
        return Ok(BlockRead::Bad);
    };
    let (num, complement) = (nums[0], nums[1]);
    if num.wrapping_add(complement) != 255 {
        tracing::warn!(
            "block number complement mismatch: {:02X}/{:02X}",
            num,
            complement
        );
        ctx.stats.corrupted += 1;
        return Ok(BlockRead::Bad);
    }

    let Some(data) = ctx.read_exact(size, RESPONSE_TIMEOUT).await else {
        return Ok(BlockRead::Bad);
    };

    let valid = if use_crc {
        let Some(trailer) = ctx.read_exact(2, Duration::from_secs(5)).await else {
            return Ok(BlockRead::Bad);
        };
        let received = u16::from_be_bytes([trailer[0], trailer[1]]);
        let computed = CRC16.checksum(&data);
        if received != computed {
            tracing::warn!(
                "CRC mismatch on block {}: received {:04X}, computed {:04X}",
                num,
                received,
                computed
            );
        }
        received == computed
    } else {
        let Some(trailer) = ctx.read_exact(1, Duration::from_secs(5)).await else {
            return Ok(BlockRead::Bad);
        };
        trailer[0] == checksum8(&data)
    };

    if !valid {
        ctx.stats.corrupted += 1;
        return Ok(BlockRead::Bad);
    }
    Ok(BlockRead::Ok { num, data })
}

/// Send one block and retry on NAK/timeout until ACKed.
pub(crate) async fn send_block_with_retries(
    ctx: &mut TransferContext<'_>,
    header: u8,
    block_num: u8,
    data: &[u8],
    use_crc: bool,
) -> TransferResult<()> {
    let block = build_block(header, block_num, data, use_crc);
    for attempt in 0..MAX_RETRIES {
        ctx.check_cancel()?;
        if attempt > 0 {
            ctx.stats.retransmits += 1;
        }
        ctx.send_raw(&block, &format!("block {block_num}")).await?;
        ctx.stats.blocks_sent += 1;

        match ctx.read_byte(RESPONSE_TIMEOUT).await {
            Some(ACK) => {
                ctx.pause(ctx.profile.inter_block_delay).await;
                return Ok(());
            }
            Some(CAN) => return Err(TransferError::Cancelled),
            Some(other) => {
                tracing::debug!("block {} answered with 0x{:02X}, retrying", block_num, other);
            }
            None => {
                if !ctx.link.is_connected() {
                    return Err(TransferError::LinkClosed);
                }
            }
        }
    }
    Err(TransferError::Timeout(format!("ACK for block {block_num}")))
}

/// Tell the peer we are aborting.
async fn send_cancel(ctx: &mut TransferContext<'_>) {
    let _ = ctx.send_raw(&[CAN, CAN], "cancel").await;
}

/// Wait for the receiver's start signal (NAK or `C`).
async fn wait_for_start(ctx: &mut TransferContext<'_>, use_crc: bool) -> TransferResult<u8> {
    let deadline = tokio::time::Instant::now() + ctx.scaled(START_TIMEOUT);
    while tokio::time::Instant::now() < deadline {
        ctx.check_cancel()?;
        match ctx.read_byte(Duration::from_secs(1)).await {
            Some(CRC_REQUEST) if use_crc => return Ok(CRC_REQUEST),
            Some(NAK) => return Ok(NAK),
            Some(CAN) => return Err(TransferError::Cancelled),
            Some(other) => {
                tracing::debug!("ignoring 0x{:02X} while waiting for start", other);
            }
            None => {
                if !ctx.link.is_connected() {
                    return Err(TransferError::LinkClosed);
                }
            }
        }
    }
    Err(TransferError::Timeout("start signal".into()))
}

/// Send a single file.
pub(crate) async fn send(
    ctx: &mut TransferContext<'_>,
    variant: Variant,
    path: &Path,
) -> TransferResult<()> {
    let data = std::fs::read(path)?;
    let total = data.len() as u64;
    let block_size = variant.block_size();
    let use_crc = variant.uses_crc();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    tracing::info!(
        "XMODEM send: {} ({} bytes, {}-byte blocks, crc={})",
        filename,
        total,
        block_size,
        use_crc
    );
    ctx.sink.progress(0, total, "Waiting for receiver...");
    ctx.sink
        .live(LiveDirection::Wait, None, "Waiting for NAK/C");

    let start = wait_for_start(ctx, use_crc).await?;
    tracing::debug!("start signal 0x{:02X}", start);

    let mut block_num: u8 = 1;
    let mut sent: u64 = 0;
    for chunk in data.chunks(block_size) {
        if ctx.cancel.is_cancelled() {
            send_cancel(ctx).await;
            return Err(TransferError::Cancelled);
        }

        let mut padded = chunk.to_vec();
        padded.resize(block_size, SUB);
        send_block_with_retries(ctx, variant.header(), block_num, &padded, use_crc).await?;

        sent = (sent + chunk.len() as u64).min(total);
        ctx.stats.bytes_transferred = sent;
        block_num = block_num.wrapping_add(1);
        ctx.sink
            .progress_named(sent, total, format!("Block {block_num}"), &filename);
    }

    // EOT, retried until acknowledged.
    for _ in 0..MAX_RETRIES {
        ctx.send_raw(&[EOT], "EOT").await?;
        match ctx.read_byte(RESPONSE_TIMEOUT).await {
            Some(ACK) => {
                ctx.sink.progress_named(total, total, "Complete", &filename);
                return Ok(());
            }
            Some(CAN) => return Err(TransferError::Cancelled),
            Some(_) | None => {
                if !ctx.link.is_connected() {
                    return Err(TransferError::LinkClosed);
                }
            }
        }
    }
    Err(TransferError::Timeout("ACK for EOT".into()))
}

/// Receive a single file into `path`.
pub(crate) async fn receive(
    ctx: &mut TransferContext<'_>,
    variant: Variant,
    path: &Path,
) -> TransferResult<()> {
    let use_crc = variant.uses_crc();
    let start_byte = if use_crc { CRC_REQUEST } else { NAK };

    ctx.sink.progress(0, 0, "Starting receive...");
    ctx.send_raw(&[start_byte], "start signal").await?;

    let mut data: Vec<u8> = Vec::new();
    let mut expected: u8 = 1;
    let mut retries = 0usize;
    let mut start_attempts = 0usize;
    let mut started = false;

    loop {
        if ctx.cancel.is_cancelled() {
            send_cancel(ctx).await;
            return Err(TransferError::Cancelled);
        }

        let header = match ctx
            .read_byte(if started {
                RESPONSE_TIMEOUT
            } else {
                START_RETRY_INTERVAL
            })
            .await
        {
            Some(b) => b,
            None => {
                if !ctx.link.is_connected() {
                    return Err(TransferError::LinkClosed);
                }
                if !started {
                    // Keep provoking the sender with the start byte.
                    start_attempts += 1;
                    if start_attempts > START_RETRIES {
                        return Err(TransferError::Timeout("sender start".into()));
                    }
                    ctx.send_raw(&[start_byte], "start signal").await?;
                    continue;
                }
                return Err(TransferError::Timeout("next block header".into()));
            }
        };

        match header {
            SOH | STX => {
                started = true;
                let size = if header == STX { 1024 } else { 128 };
                match read_block_body(ctx, size, use_crc).await? {
                    BlockRead::Ok { num, data: block } => {
                        if num == expected {
                            data.extend_from_slice(&block);
                            expected = expected.wrapping_add(1);
                            retries = 0;
                            ctx.stats.blocks_received += 1;
                            ctx.stats.bytes_transferred = data.len() as u64;
                            ctx.send_raw(&[ACK], "ACK").await?;
                            ctx.sink
                                .progress(data.len() as u64, 0, format!("Received block {num}"));
                        } else if num == expected.wrapping_sub(1) {
                            // Duplicate of the previous block: ACK, discard.
                            tracing::debug!("duplicate block {}, ACKing", num);
                            ctx.send_raw(&[ACK], "ACK duplicate").await?;
                        } else {
                            tracing::warn!("unexpected block {} (expected {})", num, expected);
                            retries += 1;
                            if retries > MAX_RETRIES {
                                return Err(TransferError::Protocol("block sequence lost".into()));
                            }
                            ctx.send_raw(&[NAK], "NAK").await?;
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
            EOT => {
                ctx.send_raw(&[ACK], "ACK for EOT").await?;
                break;
            }
            CAN => return Err(TransferError::Cancelled),
            other => {
                tracing::debug!("ignoring header byte 0x{:02X}", other);
            }
        }
    }

    // Strip trailing padding.
    while data.last() == Some(&SUB) {
        data.pop();
    }
    ctx.stats.bytes_transferred = data.len() as u64;
    std::fs::write(path, &data)?;
    ctx.sink
        .progress(data.len() as u64, data.len() as u64, "Receive complete");
    tracing::info!("XMODEM receive complete: {} bytes", data.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_vector() {
        // Canonical CRC-16/XMODEM test vector.
        assert_eq!(CRC16.checksum(b"123456789"), 0x31C3);
        assert_eq!(CRC16.checksum(&[]), 0x0000);
    }

    #[test]
    fn test_checksum8() {
        assert_eq!(checksum8(&[0, 0, 0]), 0);
        assert_eq!(checksum8(&[1, 2, 3]), 6);
        assert_eq!(checksum8(&[200, 100]), 44); // 300 mod 256
    }

    #[test]
    fn test_build_block_crc_layout() {
        let data = [0u8; 128];
        let block = build_block(SOH, 1, &data, true);
        // header + num + complement + 128 data + 2 CRC = 133 bytes
        assert_eq!(block.len(), 133);
        assert_eq!(block[0], SOH);
        assert_eq!(block[1], 1);
        assert_eq!(block[2], 254);
        let crc = u16::from_be_bytes([block[131], block[132]]);
        assert_eq!(crc, CRC16.checksum(&data));
    }

    #[test]
    fn test_build_block_checksum_layout() {
        let data = [0xAAu8; 128];
        let block = build_block(SOH, 3, &data, false);
        assert_eq!(block.len(), 132);
        assert_eq!(*block.last().unwrap(), checksum8(&data));
    }

    #[test]
    fn test_variant_properties() {
        assert_eq!(Variant::Checksum.block_size(), 128);
        assert!(!Variant::Checksum.uses_crc());
        assert_eq!(Variant::Crc.header(), SOH);
        assert!(Variant::Crc.uses_crc());
        assert_eq!(Variant::Crc1k.block_size(), 1024);
        assert_eq!(Variant::Crc1k.header(), STX);
    }

    #[test]
    fn test_variant_from_protocol() {
        assert_eq!(
            Variant::from_protocol(TransferProtocol::Xmodem),
            Variant::Checksum
        );
        assert_eq!(
            Variant::from_protocol(TransferProtocol::XmodemCrc),
            Variant::Crc
        );
        assert_eq!(
            Variant::from_protocol(TransferProtocol::Xmodem1k),
            Variant::Crc1k
        );
    }
}
