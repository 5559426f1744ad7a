//! Punter C1 engine.
//!
//! Punter frames everything in 3-byte ASCII handshake codes (GOO, BAD, ACK,
//! SYN, S/B) around checksummed blocks of at most 255 bytes. Every transfer
//! runs two phases: phase A carries a one-byte file-type block, phase B the
//! file data. Each phase is closed with the ACK/S-B/SYN/SYN/S-B "end-off"
//! ceremony. Multi-file batches prefix each file with a tab-padded header
//! line and close with a tab/EOT end marker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::sanitize::sanitize_filename;
use super::{LiveDirection, TransferContext, TransferError, TransferResult};

// Handshake codes.
const GOO: [u8; 3] = *b"GOO";
const BAD: [u8; 3] = *b"BAD";
const ACK: [u8; 3] = *b"ACK";
const SYN: [u8; 3] = *b"SYN";
const SB: [u8; 3] = *b"S/B";

/// Cancel byte blasted at the peer when the user aborts.
const CANCEL_BYTE: u8 = 0x18;

/// Block geometry: 7-byte header, payload up to 248 bytes.
const HEADER_LEN: usize = 7;
const BLOCK_PAYLOAD: usize = 248;
const MAX_BLOCK: usize = 255;

/// Handshake blocks have fixed sizes: the phase A file-type block carries one
/// payload byte, the phase B opener is header-only.
const BLOCK1_LEN: usize = 8;
const BLOCK2_LEN: usize = 7;

/// File-type block advertises this next size, a quirk the real peers expect.
const BLOCK1_NEXT_SIZE: u8 = 0xC9;

/// Retries per block on BAD.
const MAX_RETRIES: usize = 3;

/// Base timeouts (scaled by the speed profile).
const CODE_TIMEOUT: Duration = Duration::from_secs(10);
const SB_TIMEOUT: Duration = Duration::from_secs(15);
const FIRST_GOO_TIMEOUT: Duration = Duration::from_secs(60);
const HEADER_TIMEOUT: Duration = Duration::from_secs(30);
const NEXT_HEADER_TIMEOUT: Duration = Duration::from_secs(8);
const BLOCK_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Compute the additive and cyclic checksums over `data`.
///
/// Additive is a 16-bit wrapping sum. Cyclic XORs each byte into the low
/// byte and rotates the 16-bit word left by one.
pub(crate) fn checksums(data: &[u8]) -> (u16, u16) {
    let additive = data
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    let mut cyclic: u16 = 0;
    for &b in data {
        cyclic ^= b as u16;
        cyclic = cyclic.rotate_left(1);
    }
    (additive, cyclic)
}

/// Assemble a block: checksums, next-block size, index, payload.
pub(crate) fn make_block(payload: &[u8], next_size: u8, index: u16) -> Vec<u8> {
    let rest = [next_size, (index & 0xFF) as u8, (index >> 8) as u8];
    let mut check_data = Vec::with_capacity(rest.len() + payload.len());
    check_data.extend_from_slice(&rest);
    check_data.extend_from_slice(payload);
    let (additive, cyclic) = checksums(&check_data);

    let mut block = Vec::with_capacity(HEADER_LEN + payload.len());
    block.extend_from_slice(&additive.to_le_bytes());
    block.extend_from_slice(&cyclic.to_le_bytes());
    block.extend_from_slice(&rest);
    block.extend_from_slice(payload);
    block
}

/// A received and verified block.
#[derive(Debug, Clone)]
pub(crate) struct Block {
    pub payload: Vec<u8>,
    /// Advertised total size of the *next* block (header + payload).
    pub next_size: u8,
    pub index: u16,
}

impl Block {
    /// The final block of a file carries index 0xFFxx.
    pub fn is_last(&self) -> bool {
        self.index >= 0xFF00
    }
}

/// Parse and verify a raw block. Returns `None` on checksum mismatch.
pub(crate) fn parse_block(raw: &[u8]) -> Option<Block> {
    if raw.len() < HEADER_LEN {
        return None;
    }
    let additive = u16::from_le_bytes([raw[0], raw[1]]);
    let cyclic = u16::from_le_bytes([raw[2], raw[3]]);
    let (calc_add, calc_cyc) = checksums(&raw[4..]);
    if additive != calc_add || cyclic != calc_cyc {
        return None;
    }
    Some(Block {
        payload: raw[HEADER_LEN..].to_vec(),
        next_size: raw[4],
        index: u16::from_le_bytes([raw[5], raw[6]]),
    })
}

/// Advertised size for the block following the one ending at `sent` bytes.
fn next_block_size(file_len: usize, sent: usize) -> u8 {
    let remaining = file_len.saturating_sub(sent);
    (remaining.min(BLOCK_PAYLOAD) + HEADER_LEN).min(MAX_BLOCK) as u8
}

async fn send_code(ctx: &mut TransferContext<'_>, code: [u8; 3]) -> TransferResult<()> {
    ctx.sink.live(
        LiveDirection::Out,
        Some(&code),
        String::from_utf8_lossy(&code).into_owned(),
    );
    ctx.send_raw(&code, std::str::from_utf8(&code).unwrap_or("code"))
        .await
}

/// Scan the stream for the first of the expected 3-byte codes.
///
/// Unmatched bytes are skipped, which absorbs stray codes left over from the
/// previous exchange. `Ok(None)` means the deadline passed.
async fn wait_for_code(
    ctx: &mut TransferContext<'_>,
    expected: &[[u8; 3]],
    base_timeout: Duration,
) -> TransferResult<Option<[u8; 3]>> {
    let names: Vec<&str> = expected
        .iter()
        .map(|c| std::str::from_utf8(c).unwrap_or("?"))
        .collect();
    ctx.sink.live(
        LiveDirection::Wait,
        None,
        format!("Waiting for {}", names.join("/")),
    );

    let deadline = tokio::time::Instant::now() + ctx.scaled(base_timeout);
    let mut tail: Vec<u8> = Vec::with_capacity(8);
    while tokio::time::Instant::now() < deadline {
        ctx.check_cancel()?;
        let Some(byte) = ctx.read_byte(Duration::from_millis(500)).await else {
            if !ctx.link.is_connected() {
                return Err(TransferError::LinkClosed);
            }
            continue;
        };
        tail.push(byte);
        if tail.len() > 8 {
            tail.drain(..tail.len() - 4);
        }
        for code in expected {
            if tail.ends_with(code) {
                ctx.sink.live(
                    LiveDirection::In,
                    Some(code),
                    String::from_utf8_lossy(code).into_owned(),
                );
                return Ok(Some(*code));
            }
        }
    }
    Ok(None)
}

/// Read one block of `expected_total` bytes (header included).
///
/// Stray handshake codes ahead of the header are skipped. A short final read
/// is accepted when the checksums verify over what actually arrived, which
/// copes with peers that over-advertise the first data block.
async fn receive_block(
    ctx: &mut TransferContext<'_>,
    expected_total: usize,
) -> TransferResult<Option<Block>> {
    let expected_total = expected_total.max(HEADER_LEN);

    let mut first = match ctx.read_exact(3, BLOCK_READ_TIMEOUT).await {
        Some(b) => b,
        None => return Ok(None),
    };
    let mut skips = 0;
    while (first[..] == GOO || first[..] == ACK || first[..] == SB) && skips < 4 {
        skips += 1;
        first = match ctx.read_exact(3, BLOCK_READ_TIMEOUT).await {
            Some(b) => b,
            None => return Ok(None),
        };
    }

    let Some(rest) = ctx.read_exact(HEADER_LEN - 3, Duration::from_secs(5)).await else {
        return Ok(None);
    };
    let mut raw = first;
    raw.extend_from_slice(&rest);

    let payload_len = expected_total - HEADER_LEN;
    if payload_len > 0 {
        let payload = ctx
            .link
            .read_exact_or_partial(payload_len, ctx.scaled(BLOCK_READ_TIMEOUT))
            .await;
        raw.extend_from_slice(&payload);
    }

    match parse_block(&raw) {
        Some(block) => Ok(Some(block)),
        None => {
            ctx.stats.corrupted += 1;
            tracing::warn!("punter block checksum error ({} bytes)", raw.len());
            Ok(None)
        }
    }
}

/// Receive a block, answering BAD and re-requesting up to the retry limit.
async fn receive_block_with_retry(
    ctx: &mut TransferContext<'_>,
    expected_total: usize,
) -> TransferResult<Block> {
    for _ in 0..MAX_RETRIES {
        if let Some(block) = receive_block(ctx, expected_total).await? {
            ctx.stats.blocks_received += 1;
            return Ok(block);
        }
        send_code(ctx, BAD).await?;
        ctx.stats.retransmits += 1;
        match wait_for_code(ctx, &[ACK], CODE_TIMEOUT).await? {
            Some(_) => send_code(ctx, SB).await?,
            None => break,
        }
    }
    Err(TransferError::Protocol(
        "punter block failed after retries".into(),
    ))
}

/// Send a block and retry on BAD up to the retry limit.
async fn send_block_with_retry(ctx: &mut TransferContext<'_>, block: &[u8]) -> TransferResult<()> {
    for _ in 0..MAX_RETRIES {
        ctx.check_cancel()?;
        ctx.send_raw(block, &format!("block ({} bytes)", block.len()))
            .await?;
        ctx.stats.blocks_sent += 1;

        match wait_for_code(ctx, &[GOO, BAD], SB_TIMEOUT).await? {
            Some(code) if code == GOO => return Ok(()),
            Some(_) => {
                ctx.stats.retransmits += 1;
                ctx.pause(Duration::from_millis(200)).await;
                // Some peers re-request with S/B or ACK before the resend.
                let _ = wait_for_code(ctx, &[SB, ACK], Duration::from_secs(2)).await?;
            }
            None => {
                return Err(TransferError::Timeout("GOO/BAD after block".into()));
            }
        }
    }
    Err(TransferError::Protocol(
        "punter block rejected after retries".into(),
    ))
}

/// How a transfer leg is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prologue {
    /// Single-file upload: we open with GOO ourselves.
    SingleFile,
    /// Batch upload: a file header was just sent, peer opens with GOO.
    AfterHeader,
    /// Download after a file header was received.
    Receive,
    /// Download where the peer is already mid-handshake (no header seen).
    ReceiveTransferMode,
}

/// The end-off ceremony from the side that initiates it.
async fn end_off_initiate(ctx: &mut TransferContext<'_>) -> TransferResult<()> {
    send_code(ctx, ACK).await?;
    if wait_for_code(ctx, &[SB], SB_TIMEOUT).await?.is_none() {
        tracing::warn!("no S/B in end-off");
    }
    ctx.pause(Duration::from_millis(200)).await;
    send_code(ctx, SYN).await?;
    if wait_for_code(ctx, &[SYN], SB_TIMEOUT).await?.is_none() {
        tracing::warn!("no SYN in end-off");
    }
    Ok(())
}

/// The end-off ceremony from the answering side.
async fn end_off_answer(ctx: &mut TransferContext<'_>) -> TransferResult<()> {
    if wait_for_code(ctx, &[ACK], CODE_TIMEOUT).await?.is_none() {
        tracing::warn!("no ACK in end-off");
    }
    send_code(ctx, SB).await?;
    if wait_for_code(ctx, &[SYN], CODE_TIMEOUT).await?.is_none() {
        tracing::warn!("no SYN in end-off");
    }
    send_code(ctx, SYN).await?;
    Ok(())
}

/// Send one file through the phase A / phase B machinery.
async fn send_file_payload(
    ctx: &mut TransferContext<'_>,
    path: &Path,
    prologue: Prologue,
) -> TransferResult<()> {
    let data = std::fs::read(path)?;
    let file_len = data.len();
    let filename = path.file_name().unwrap_or_default().to_string_lossy();
    tracing::info!("punter send: {} ({} bytes)", filename, file_len);

    // Phase A: handshake and file-type block.
    match prologue {
        Prologue::SingleFile => {
            send_code(ctx, GOO).await?;
            if wait_for_code(ctx, &[GOO], FIRST_GOO_TIMEOUT).await?.is_none() {
                return Err(TransferError::Timeout("peer GOO".into()));
            }
            ctx.pause(Duration::from_millis(200)).await;
            send_code(ctx, ACK).await?;
        }
        _ => {
            if wait_for_code(ctx, &[GOO], FIRST_GOO_TIMEOUT).await?.is_none() {
                return Err(TransferError::Timeout("peer GOO after header".into()));
            }
            ctx.pause(Duration::from_millis(200)).await;
            send_code(ctx, GOO).await?;
            if wait_for_code(ctx, &[GOO], HEADER_TIMEOUT).await?.is_none() {
                return Err(TransferError::Timeout("second peer GOO".into()));
            }
            ctx.pause(Duration::from_millis(200)).await;
            send_code(ctx, ACK).await?;
        }
    }

    if wait_for_code(ctx, &[SB], SB_TIMEOUT).await?.is_none() {
        return Err(TransferError::Timeout("S/B for file-type block".into()));
    }
    ctx.pause(Duration::from_millis(200)).await;

    let block1 = make_block(&[0x01], BLOCK1_NEXT_SIZE, 0xFFFF);
    send_block_with_retry(ctx, &block1).await?;
    ctx.pause(Duration::from_millis(200)).await;

    end_off_initiate(ctx).await?;
    ctx.pause(Duration::from_millis(300)).await;
    send_code(ctx, SB).await?;

    // Phase B: collect the peer's GOO volley, then open the data stream.
    let mut goos = 0usize;
    'collect: for _ in 0..20 {
        ctx.check_cancel()?;
        let window_end = tokio::time::Instant::now() + ctx.scaled(Duration::from_secs(3));
        while tokio::time::Instant::now() < window_end {
            if wait_for_code(ctx, &[GOO], Duration::from_secs(1))
                .await?
                .is_some()
            {
                goos += 1;
            }
            if goos >= 3 {
                break 'collect;
            }
        }
        if goos >= 3 {
            break;
        }
        send_code(ctx, SB).await?;
        ctx.pause(Duration::from_millis(300)).await;
    }
    if goos == 0 {
        return Err(TransferError::Timeout("phase B GOO volley".into()));
    }

    send_code(ctx, ACK).await?;
    if wait_for_code(ctx, &[SB], CODE_TIMEOUT).await?.is_none() {
        return Err(TransferError::Timeout("S/B for data opener".into()));
    }

    let block2 = make_block(&[], MAX_BLOCK as u8, 0x0000);
    send_block_with_retry(ctx, &block2).await?;

    // Data loop. Even an empty file sends one (empty) final block so the
    // peer sees a terminating index.
    let mut sent = 0usize;
    let mut index: u16 = 1;
    loop {
        if ctx.cancel.is_cancelled() {
            let _ = ctx.send_raw(&[CANCEL_BYTE], "cancel").await;
            return Err(TransferError::Cancelled);
        }

        send_code(ctx, ACK).await?;
        ctx.pause(Duration::from_millis(100)).await;
        if wait_for_code(ctx, &[SB], SB_TIMEOUT).await?.is_none() {
            return Err(TransferError::Timeout(format!("S/B for data block {index}")));
        }
        ctx.pause(Duration::from_millis(100)).await;

        let end = (sent + BLOCK_PAYLOAD).min(file_len);
        let chunk = &data[sent..end];
        let is_last = end >= file_len;
        let (advertised, block_index) = if is_last {
            ((chunk.len() + HEADER_LEN) as u8, 0xFFFFu16)
        } else {
            (next_block_size(file_len, end), index)
        };

        let block = make_block(chunk, advertised, block_index);
        send_block_with_retry(ctx, &block).await?;

        sent = end;
        ctx.stats.bytes_transferred += chunk.len() as u64;
        ctx.sink.progress_named(
            sent as u64,
            file_len as u64,
            format!("Block {index}"),
            filename.as_ref(),
        );
        index += 1;

        if is_last {
            break;
        }
    }

    // End-off phase B.
    ctx.pause(Duration::from_millis(200)).await;
    end_off_initiate(ctx).await?;
    ctx.pause(Duration::from_millis(200)).await;
    send_code(ctx, SB).await?;
    ctx.pause(Duration::from_millis(300)).await;

    Ok(())
}

/// Build the batch file header line: ten tabs, name, comma, type, CR.
pub(crate) fn build_file_header(filename: &str, ftype: char) -> Vec<u8> {
    let clean: String = filename.chars().take(16).collect::<String>().to_uppercase();
    let mut header = vec![0x09u8; 10];
    header.extend_from_slice(clean.as_bytes());
    header.push(b',');
    header.push(ftype.to_ascii_uppercase() as u8);
    header.push(0x0D);
    header
}

/// Build the end-of-batch marker: sixteen tabs, sixteen EOTs, CR.
pub(crate) fn build_end_marker() -> Vec<u8> {
    let mut marker = vec![0x09u8; 16];
    marker.extend_from_slice(&[0x04u8; 16]);
    marker.push(0x0D);
    marker
}

/// File type letter from the extension: SEQ-ish files are `S`, the rest `P`.
fn file_type_for(path: &Path) -> char {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("seq") | Some("txt") | Some("s") => 'S',
        _ => 'P',
    }
}

/// Upload entry point.
pub(crate) async fn send(ctx: &mut TransferContext<'_>, files: &[PathBuf]) -> TransferResult<()> {
    if files.len() == 1 {
        let path = &files[0];
        let filename = path.file_name().unwrap_or_default().to_string_lossy();
        ctx.sink.file_start(filename.as_ref());
        send_file_payload(ctx, path, Prologue::SingleFile).await?;

        // Single-file terminator: five 0x04 0x09 pairs.
        ctx.pause(Duration::from_millis(300)).await;
        for _ in 0..5 {
            ctx.send_raw(&[0x04, 0x09], "end signal").await?;
            ctx.pause(Duration::from_millis(100)).await;
        }
        ctx.sink
            .file_complete(filename.as_ref(), std::fs::metadata(path)?.len());
        return Ok(());
    }

    for (idx, path) in files.iter().enumerate() {
        let filename = path.file_name().unwrap_or_default().to_string_lossy();
        let is_last_file = idx + 1 == files.len();
        ctx.sink.file_start(filename.as_ref());

        let header = build_file_header(&filename, file_type_for(path));
        ctx.send_raw(&header, "file header").await?;

        send_file_payload(ctx, path, Prologue::AfterHeader).await?;
        ctx.sink
            .file_complete(filename.as_ref(), std::fs::metadata(path)?.len());

        if !is_last_file {
            // Inter-file interchange: S/B -> SYN, SYN -> S/B.
            ctx.pause(Duration::from_millis(300)).await;
            send_code(ctx, SB).await?;
            if wait_for_code(ctx, &[SYN], CODE_TIMEOUT).await?.is_none() {
                tracing::warn!("no SYN between files, continuing");
            }
            ctx.pause(Duration::from_millis(200)).await;
            send_code(ctx, SYN).await?;
            if wait_for_code(ctx, &[SB], CODE_TIMEOUT).await?.is_none() {
                tracing::warn!("no S/B between files, continuing");
            }
            ctx.pause(Duration::from_millis(500)).await;
        }
    }

    ctx.pause(Duration::from_millis(500)).await;
    ctx.send_raw(&build_end_marker(), "end marker").await?;
    Ok(())
}

/// What the header scanner saw.
#[derive(Debug)]
enum HeaderEvent {
    File { name: String, ftype: char },
    TransferMode,
    End,
    TimedOut,
}

/// Wait for a batch file header, the end marker, or evidence that the peer
/// is already mid-handshake (GOO followed by ACK, legacy headerless mode).
///
/// While scanning, S/B is answered with SYN and SYN with S/B so a batch
/// sender's inter-file interchange completes against us.
async fn wait_for_header(
    ctx: &mut TransferContext<'_>,
    base_timeout: Duration,
) -> TransferResult<HeaderEvent> {
    let deadline = tokio::time::Instant::now() + ctx.scaled(base_timeout);
    let mut tail: Vec<u8> = Vec::new();
    let mut name: Vec<u8> = Vec::new();
    let mut tab_count = 0usize;
    let mut eot_count = 0usize;
    let mut end_pairs = 0usize;
    let mut goo_seen = false;

    while tokio::time::Instant::now() < deadline {
        ctx.check_cancel()?;
        let Some(byte) = ctx.read_byte(Duration::from_millis(500)).await else {
            if !ctx.link.is_connected() {
                return Err(TransferError::LinkClosed);
            }
            continue;
        };

        tail.push(byte);
        if tail.len() > 8 {
            tail.drain(..tail.len() - 4);
        }

        // Single-file terminator: a run of 0x04 0x09 pairs.
        if tail.ends_with(&[0x04, 0x09]) {
            end_pairs += 1;
            if end_pairs >= 3 {
                return Ok(HeaderEvent::End);
            }
        } else if byte != 0x04 && byte != 0x09 {
            end_pairs = 0;
        }

        if tail.ends_with(&GOO) {
            goo_seen = true;
        } else if tail.ends_with(&ACK) && goo_seen {
            return Ok(HeaderEvent::TransferMode);
        } else if tail.ends_with(&SB) {
            send_code(ctx, SYN).await?;
            continue;
        } else if tail.ends_with(&SYN) {
            send_code(ctx, SB).await?;
            continue;
        }

        match byte {
            0x09 => {
                tab_count += 1;
                name.clear();
                eot_count = 0;
            }
            0x04 if tab_count >= 10 => {
                eot_count += 1;
                if eot_count >= 10 {
                    return Ok(HeaderEvent::End);
                }
            }
            0x0D if tab_count >= 10 && !name.is_empty() => {
                let line = String::from_utf8_lossy(&name).into_owned();
                if let Some((file, ftype)) = line.rsplit_once(',') {
                    if file.chars().any(|c| c.is_alphanumeric()) {
                        return Ok(HeaderEvent::File {
                            name: file.to_string(),
                            ftype: ftype.chars().next().unwrap_or('P'),
                        });
                    }
                }
                tracing::debug!("discarding non-header line: {:?}", line);
                name.clear();
                tab_count = 0;
            }
            b if tab_count >= 10 && !matches!(b, 0x09 | 0x04 | 0x0D) => {
                name.push(b);
                eot_count = 0;
            }
            _ => {
                tab_count = 0;
                name.clear();
            }
        }
    }
    Ok(HeaderEvent::TimedOut)
}

/// Receive one file through the phase A / phase B machinery.
async fn receive_file_payload(
    ctx: &mut TransferContext<'_>,
    path: &Path,
    prologue: Prologue,
) -> TransferResult<()> {
    let display_name = path.file_name().unwrap_or_default().to_string_lossy();

    // Phase A.
    match prologue {
        Prologue::ReceiveTransferMode => {
            // Peer already sent GOO + ACK; it expects our S/B.
            send_code(ctx, SB).await?;
        }
        _ => {
            let mut code = None;
            for _ in 0..5 {
                send_code(ctx, GOO).await?;
                ctx.pause(Duration::from_millis(150)).await;
                code = wait_for_code(ctx, &[GOO, ACK], Duration::from_secs(2)).await?;
                if code.is_some() {
                    break;
                }
            }
            let Some(mut code) = code else {
                return Err(TransferError::Timeout("response to GOO volley".into()));
            };
            if code == GOO {
                send_code(ctx, GOO).await?;
                code = wait_for_code(ctx, &[ACK], CODE_TIMEOUT)
                    .await?
                    .ok_or_else(|| TransferError::Timeout("ACK from sender".into()))?;
            }
            debug_assert_eq!(code, ACK);
            send_code(ctx, SB).await?;
        }
    }

    let block1 = receive_block_with_retry(ctx, BLOCK1_LEN).await?;
    tracing::debug!(
        "file-type block: {} payload byte(s), next_size {}",
        block1.payload.len(),
        block1.next_size
    );
    send_code(ctx, GOO).await?;

    end_off_answer(ctx).await?;
    if wait_for_code(ctx, &[SB], CODE_TIMEOUT).await?.is_none() {
        tracing::warn!("no S/B closing end-off A");
    }

    // Phase B.
    let mut code = None;
    let wait_set: &[[u8; 3]] = match prologue {
        Prologue::ReceiveTransferMode => &[GOO, ACK, SB],
        _ => &[GOO, ACK],
    };
    for _ in 0..5 {
        send_code(ctx, GOO).await?;
        ctx.pause(Duration::from_millis(150)).await;
        code = wait_for_code(ctx, wait_set, Duration::from_secs(2)).await?;
        if code.is_some() {
            break;
        }
    }
    if code == Some(GOO) {
        send_code(ctx, GOO).await?;
        code = wait_for_code(ctx, &[ACK], CODE_TIMEOUT).await?;
    }
    match code {
        Some(c) if c == SB => {
            // Peer already opened the data stream.
        }
        _ => {
            if code.is_none() {
                tracing::warn!("no ACK for phase B, sending S/B anyway");
            }
            send_code(ctx, SB).await?;
        }
    }

    let block2 = receive_block_with_retry(ctx, BLOCK2_LEN).await?;
    send_code(ctx, GOO).await?;

    // Data loop, sizes chained through next_size.
    let mut file_data: Vec<u8> = Vec::new();
    let mut expected = block2.next_size as usize;
    let mut count = 0usize;
    loop {
        if ctx.cancel.is_cancelled() {
            let _ = ctx.send_raw(&[CANCEL_BYTE], "cancel").await;
            return Err(TransferError::Cancelled);
        }
        match wait_for_code(ctx, &[ACK, SYN], CODE_TIMEOUT).await? {
            None => {
                tracing::debug!("no ACK, assuming end of data");
                break;
            }
            Some(c) if c == SYN => {
                send_code(ctx, SYN).await?;
                break;
            }
            Some(_) => {}
        }
        send_code(ctx, SB).await?;

        let block = receive_block_with_retry(ctx, expected).await?;
        expected = block.next_size as usize;
        file_data.extend_from_slice(&block.payload);
        count += 1;
        ctx.stats.bytes_transferred += block.payload.len() as u64;
        ctx.sink.progress_named(
            file_data.len() as u64,
            0,
            format!("{display_name}: block {count}"),
            display_name.as_ref(),
        );

        send_code(ctx, GOO).await?;
        if block.is_last() {
            break;
        }
    }

    // End-off phase B.
    if let Some(c) = wait_for_code(ctx, &[ACK, SB], Duration::from_secs(5)).await? {
        if c == ACK {
            send_code(ctx, SB).await?;
            if wait_for_code(ctx, &[SYN], Duration::from_secs(5)).await?.is_some() {
                send_code(ctx, SYN).await?;
                let _ = wait_for_code(ctx, &[SB], Duration::from_secs(5)).await?;
            }
        }
    }

    std::fs::write(path, &file_data)?;
    tracing::info!(
        "punter received {} bytes in {} blocks -> {}",
        file_data.len(),
        count,
        path.display()
    );
    Ok(())
}

/// Download entry point: announce readiness, then loop over headers.
pub(crate) async fn receive(
    ctx: &mut TransferContext<'_>,
    dir: &Path,
) -> TransferResult<Vec<PathBuf>> {
    for _ in 0..3 {
        send_code(ctx, GOO).await?;
        ctx.pause(Duration::from_millis(200)).await;
    }

    let mut files: Vec<PathBuf> = Vec::new();
    loop {
        ctx.check_cancel()?;
        let timeout = if files.is_empty() {
            HEADER_TIMEOUT
        } else {
            NEXT_HEADER_TIMEOUT
        };

        match wait_for_header(ctx, timeout).await? {
            HeaderEvent::File { name, ftype } => {
                let ext = if ftype.eq_ignore_ascii_case(&'S') {
                    ".seq"
                } else {
                    ".prg"
                };
                let safe_name = sanitize_filename(&name, ext);
                let path = dir.join(&safe_name);
                tracing::info!("punter header: '{}',{} -> {}", name, ftype, path.display());
                ctx.sink.file_start(&safe_name);

                match receive_file_payload(ctx, &path, Prologue::Receive).await {
                    Ok(()) => {
                        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                        ctx.sink.file_complete(&safe_name, size);
                        files.push(path);
                    }
                    Err(e) => {
                        ctx.sink.file_error(&safe_name, e.to_string());
                        return Err(e);
                    }
                }
                ctx.pause(Duration::from_millis(300)).await;
            }
            HeaderEvent::TransferMode => {
                let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
                let safe_name = format!("download_{stamp}.prg");
                let path = dir.join(&safe_name);
                tracing::info!("punter transfer mode (no header) -> {}", path.display());
                ctx.sink.file_start(&safe_name);

                match receive_file_payload(ctx, &path, Prologue::ReceiveTransferMode).await {
                    Ok(()) => {
                        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                        ctx.sink.file_complete(&safe_name, size);
                        files.push(path);
                    }
                    Err(e) => {
                        ctx.sink.file_error(&safe_name, e.to_string());
                        return Err(e);
                    }
                }
                ctx.pause(Duration::from_millis(300)).await;
            }
            HeaderEvent::End => break,
            HeaderEvent::TimedOut => {
                if files.is_empty() {
                    return Err(TransferError::Timeout("punter file header".into()));
                }
                tracing::debug!("no further headers, batch complete");
                break;
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
    fn test_checksum_vectors() {
        let (additive, cyclic) = checksums(&[0x01]);
        assert_eq!(additive, 0x0001);
        assert_eq!(cyclic, 0x0002); // rotate-left16(0x01 ^ 0, 1)
    }

    #[test]
    fn test_checksum_additive_wraps() {
        let data = vec![0xFFu8; 300];
        let (additive, _) = checksums(&data);
        assert_eq!(additive, ((300u32 * 0xFF) & 0xFFFF) as u16);
    }

    #[test]
    fn test_block_roundtrip() {
        let payload = b"HELLO PUNTER";
        let block = make_block(payload, 0x42, 7);
        assert_eq!(block.len(), HEADER_LEN + payload.len());

        let parsed = parse_block(&block).unwrap();
        assert_eq!(parsed.payload, payload);
        assert_eq!(parsed.next_size, 0x42);
        assert_eq!(parsed.index, 7);
        assert!(!parsed.is_last());
    }

    #[test]
    fn test_last_block_index() {
        let block = make_block(&[0x01], BLOCK1_NEXT_SIZE, 0xFFFF);
        assert_eq!(block.len(), BLOCK1_LEN);
        let parsed = parse_block(&block).unwrap();
        assert!(parsed.is_last());
    }

    #[test]
    fn test_corrupted_block_rejected() {
        let mut block = make_block(b"DATA", 255, 1);
        block[10] ^= 0x01;
        assert!(parse_block(&block).is_none());
    }

    #[test]
    fn test_next_size_advertisement() {
        // A file whose final block carries 100 payload bytes: the block
        // before it advertises 107 (7 header + 100 payload).
        let file_len = BLOCK_PAYLOAD + 100;
        assert_eq!(next_block_size(file_len, BLOCK_PAYLOAD), 107);
        // Plenty remaining: a full 255-byte block.
        assert_eq!(next_block_size(10_000, 0), 255);
    }

    #[test]
    fn test_file_header_layout() {
        let header = build_file_header("game.prg", 'p');
        assert_eq!(&header[..10], &[0x09u8; 10][..]);
        assert_eq!(&header[10..18], b"GAME.PRG");
        assert_eq!(header[18], b',');
        assert_eq!(header[19], b'P');
        assert_eq!(*header.last().unwrap(), 0x0D);
    }

    #[test]
    fn test_end_marker_layout() {
        let marker = build_end_marker();
        assert_eq!(marker.len(), 33);
        assert!(marker[..16].iter().all(|&b| b == 0x09));
        assert!(marker[16..32].iter().all(|&b| b == 0x04));
        assert_eq!(marker[32], 0x0D);
    }
}
