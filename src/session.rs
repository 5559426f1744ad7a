//! Interactive terminal session.
//!
//! Glues the byte link to the PETSCII parser and the scrollback store. The
//! session is the only reader of the interactive queue; while a transfer
//! runs it simply stops pumping and the dispatcher owns the link.

use std::time::Duration;

use crate::link::ByteLink;
use crate::screen::{
    encode_key_text, PetsciiParser, ScreenBuffer, ScrollbackBuffer, ScrollbackView,
};

/// One interactive connection to a board.
pub struct TerminalSession {
    link: ByteLink,
    parser: PetsciiParser,
    scrollback: ScrollbackBuffer,
}

impl TerminalSession {
    /// Create a session over an established link.
    pub fn new(link: ByteLink, width: usize, height: usize) -> Self {
        Self {
            link,
            parser: PetsciiParser::new(ScreenBuffer::new(width, height)),
            scrollback: ScrollbackBuffer::new(),
        }
    }

    pub fn link(&self) -> &ByteLink {
        &self.link
    }

    pub fn screen(&self) -> &ScreenBuffer {
        self.parser.screen()
    }

    pub fn parser_mut(&mut self) -> &mut PetsciiParser {
        &mut self.parser
    }

    pub fn scrollback(&self) -> &ScrollbackBuffer {
        &self.scrollback
    }

    /// Drop the captured history.
    pub fn clear_scrollback(&mut self) {
        self.scrollback.clear();
    }

    /// Build a paged scrollback view at the given width.
    pub fn scrollback_view(&self, width: usize, lines_per_page: usize) -> ScrollbackView {
        ScrollbackView::build(&self.scrollback, width, lines_per_page)
    }

    /// Drain whatever the link has queued into the parser.
    ///
    /// Returns true when bytes were processed. Call this from the UI loop;
    /// it waits at most `wait` for new data.
    pub async fn pump(&mut self, wait: Duration) -> bool {
        match self.link.read_any(wait).await {
            Some(data) => {
                self.scrollback.append(&data);
                self.parser.feed(&data);
                true
            }
            None => false,
        }
    }

    /// Send interactive text, translated to PETSCII.
    pub async fn send_text(&self, text: &str) -> std::io::Result<()> {
        self.link.write_all(&encode_key_text(text)).await
    }

    /// Send a single PETSCII key code.
    pub async fn send_key(&self, key: u8) -> std::io::Result<()> {
        self.link.write_all(&[key]).await
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn session_pair() -> (TerminalSession, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let link = ByteLink::from_stream(client);
        (TerminalSession::new(link, 40, 25), server)
    }

    #[tokio::test]
    async fn test_pump_feeds_parser_and_scrollback() {
        let (mut session, mut peer) = session_pair().await;
        peer.write_all(&[0x93, b'H', b'I']).await.unwrap();

        let mut got = false;
        for _ in 0..20 {
            if session.pump(Duration::from_millis(100)).await {
                got = true;
                break;
            }
        }
        assert!(got);
        assert_eq!(session.scrollback().len(), 3);
        assert!(session.screen().populated_cells() >= 2);
    }

    #[tokio::test]
    async fn test_send_text_is_petscii() {
        let (session, mut peer) = session_pair().await;
        session.send_text("hi\n").await.unwrap();

        let mut buf = [0u8; 3];
        tokio::io::AsyncReadExt::read_exact(&mut peer, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, [b'H', b'I', 0x0D]);
    }
}
