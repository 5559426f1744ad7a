//! retroterm - retro BBS terminal core.
//!
//! The bidirectional byte-stream engine behind a PETSCII terminal: a stream
//! interpreter driving a virtual screen, a scrollback store, and the family
//! of binary file-transfer protocols (XMODEM variants, YMODEM, Punter C1,
//! TurboModem, raw-TCP batch) multiplexed over one TCP connection.

pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod screen;
pub mod session;
pub mod transfer;

pub use config::Config;
pub use error::{Result, RetroTermError};
pub use link::ByteLink;
pub use screen::{
    encode_key_text, petscii_to_screen_code, screen_code_to_petscii, Cell, CharsetMode,
    PetsciiParser, ScreenBuffer, ScrollbackBuffer, ScrollbackView,
};
pub use session::TerminalSession;
pub use transfer::{
    receive_files, send_files, CancelToken, LiveDirection, ProgressSink, SpeedProfile,
    TransferError, TransferEvent, TransferOptions, TransferOutcome, TransferProtocol,
    TransferStats, XMODEM_TEMP_NAME,
};
