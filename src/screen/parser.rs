//! PETSCII stream interpreter.
//!
//! A byte-at-a-time state machine that turns an incoming PETSCII stream into
//! mutations on a [`ScreenBuffer`]. The only multi-byte state is the pending
//! background-colour flag (CTRL-B takes the next byte as a colour) and a
//! three-byte window matching the bell sequence 0x5C 0x42 0x31.

use super::buffer::{CharsetMode, ScreenBuffer};
use super::charset::{color_from_code, is_printable, petscii_to_screen_code};

/// The bell escape sequence transmitted by some boards.
const BELL_SEQUENCE: [u8; 3] = [0x5C, 0x42, 0x31];

/// Separator written into scrollback replays instead of clearing.
const CLEAR_SEPARATOR: &str = "---- CLR ----";

/// PETSCII parser driving a screen buffer.
pub struct PetsciiParser {
    screen: ScreenBuffer,
    /// Replaying for the scrollback viewer: HOME is ignored and CLEAR SCREEN
    /// renders a separator instead of wiping history.
    scrollback_mode: bool,
    awaiting_bg_color: bool,
    bell_buf: [u8; 3],
    bell_len: usize,
    bell_count: u64,
    on_bell: Option<Box<dyn FnMut() + Send>>,
}

impl std::fmt::Debug for PetsciiParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PetsciiParser")
            .field("scrollback_mode", &self.scrollback_mode)
            .field("awaiting_bg_color", &self.awaiting_bg_color)
            .field("bell_len", &self.bell_len)
            .field("bell_count", &self.bell_count)
            .finish()
    }
}

impl PetsciiParser {
    /// Create a parser that owns the given screen.
    pub fn new(screen: ScreenBuffer) -> Self {
        Self {
            screen,
            scrollback_mode: false,
            awaiting_bg_color: false,
            bell_buf: [0; 3],
            bell_len: 0,
            bell_count: 0,
            on_bell: None,
        }
    }

    /// Create a parser in scrollback-replay mode.
    pub fn new_scrollback(screen: ScreenBuffer) -> Self {
        let mut parser = Self::new(screen);
        parser.scrollback_mode = true;
        parser
    }

    /// Set a callback fired on each bell event.
    pub fn set_bell_callback(&mut self, callback: impl FnMut() + Send + 'static) {
        self.on_bell = Some(Box::new(callback));
    }

    /// Total bell events seen so far.
    pub fn bell_count(&self) -> u64 {
        self.bell_count
    }

    pub fn screen(&self) -> &ScreenBuffer {
        &self.screen
    }

    pub fn screen_mut(&mut self) -> &mut ScreenBuffer {
        &mut self.screen
    }

    /// Consume the parser and return the screen.
    pub fn into_screen(self) -> ScreenBuffer {
        self.screen
    }

    /// Process a slice of stream bytes.
    pub fn feed(&mut self, data: &[u8]) {
        for &byte in data {
            self.feed_byte(byte);
        }
    }

    /// Process a single stream byte.
    pub fn feed_byte(&mut self, byte: u8) {
        if self.match_bell(byte) {
            return;
        }
        self.handle_byte(byte);
    }

    fn emit_bell(&mut self) {
        self.bell_count += 1;
        if let Some(cb) = self.on_bell.as_mut() {
            cb();
        }
    }

    /// Advance the bell matcher. Returns true when the byte was consumed.
    ///
    /// On a mismatch the buffered prefix is replayed through `handle_byte`
    /// directly; the replay must not re-enter bell matching or a pathological
    /// stream of 0x5C bytes would recurse forever.
    fn match_bell(&mut self, byte: u8) -> bool {
        if self.bell_len < BELL_SEQUENCE.len() && byte == BELL_SEQUENCE[self.bell_len] {
            self.bell_buf[self.bell_len] = byte;
            self.bell_len += 1;
            if self.bell_len == BELL_SEQUENCE.len() {
                self.bell_len = 0;
                self.emit_bell();
            }
            return true;
        }

        if self.bell_len > 0 {
            let buffered = self.bell_len;
            self.bell_len = 0;
            for i in 0..buffered {
                let b = self.bell_buf[i];
                self.handle_byte(b);
            }
        }

        // The mismatching byte may itself open a new sequence.
        if byte == BELL_SEQUENCE[0] {
            self.bell_buf[0] = byte;
            self.bell_len = 1;
            return true;
        }

        false
    }

    fn handle_byte(&mut self, byte: u8) {
        // A pending CTRL-B consumes the next byte when it is a colour code;
        // anything else falls through to normal handling.
        if self.awaiting_bg_color {
            self.awaiting_bg_color = false;
            if let Some(color) = color_from_code(byte) {
                self.screen.set_screen_bg(color);
                return;
            }
        }

        match byte {
            0x02 => {
                self.awaiting_bg_color = true;
            }
            0x03 => {
                self.screen.set_screen_bg(0);
            }
            0x07 => {
                self.emit_bell();
            }
            0x0D | 0x8D => {
                // Explicit CR clears reverse video; auto-wrap does not.
                self.screen.set_reverse(false);
                self.screen.newline();
            }
            0x13 => {
                if !self.scrollback_mode {
                    self.screen.home();
                }
            }
            0x93 => {
                if self.scrollback_mode {
                    self.write_clear_separator();
                } else {
                    self.screen.clear();
                }
            }
            0x11 => self.screen.move_cursor(0, 1),
            0x91 => self.screen.move_cursor(0, -1),
            0x1D => self.screen.move_cursor(1, 0),
            0x9D => self.screen.move_cursor(-1, 0),
            0x14 => self.screen.delete_back(),
            0x94 => self.screen.insert_blank(),
            0x0E => self.screen.set_charset(CharsetMode::Lower),
            0x8E => self.screen.set_charset(CharsetMode::Upper),
            0x12 => self.screen.set_reverse(true),
            0x92 => self.screen.set_reverse(false),
            _ => {
                if let Some(color) = color_from_code(byte) {
                    self.screen.set_fg(color);
                } else if is_printable(byte) {
                    self.screen.write_screen_code(petscii_to_screen_code(byte));
                }
                // Remaining control bytes (< 0x20 and 0x80..0x9F) are noise.
            }
        }
    }

    fn write_clear_separator(&mut self) {
        self.screen.newline();
        let old_fg = self.screen.current_fg;
        self.screen.set_fg(1);
        for b in CLEAR_SEPARATOR.bytes() {
            self.screen.write_screen_code(petscii_to_screen_code(b));
        }
        self.screen.set_fg(old_fg);
        self.screen.newline();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::charset::petscii_to_screen_code as map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn parser_40x25() -> PetsciiParser {
        PetsciiParser::new(ScreenBuffer::new(40, 25))
    }

    #[test]
    fn test_clear_color_and_text() {
        let mut p = parser_40x25();
        p.feed(&[0x93, 0x05, b'H', b'I', 0x0D, 0x1C, b'A']);

        let screen = p.screen();
        assert_eq!(screen.read_line(0)[0].code, map(b'H'));
        assert_eq!(screen.read_line(0)[0].fg, 1);
        assert_eq!(screen.read_line(0)[1].code, map(b'I'));
        assert_eq!(screen.read_line(1)[0].code, map(b'A'));
        assert_eq!(screen.read_line(1)[0].fg, 2);
        assert!(!screen.reverse_mode);
    }

    #[test]
    fn test_reverse_cleared_by_cr() {
        let mut p = parser_40x25();
        p.feed(&[0x12, b'X', 0x0D, b'Y']);

        let screen = p.screen();
        assert!(screen.read_line(0)[0].reverse);
        assert!(!screen.read_line(1)[0].reverse);
        assert!(!screen.reverse_mode);
    }

    #[test]
    fn test_reverse_survives_auto_wrap() {
        let mut p = PetsciiParser::new(ScreenBuffer::new(4, 25));
        p.feed(&[0x12]);
        p.feed(&[b'A'; 4]);
        assert!(p.screen().reverse_mode);
        assert_eq!(p.screen().cursor_y, 1);
    }

    #[test]
    fn test_ctrl_b_sets_background() {
        let mut p = parser_40x25();
        p.feed(&[0x02, 0x1C]);
        assert_eq!(p.screen().screen_bg, 2);
        assert_eq!(p.screen().populated_cells(), 0);
    }

    #[test]
    fn test_ctrl_b_non_color_falls_through() {
        let mut p = parser_40x25();
        p.feed(&[0x02, b'A']);
        assert_eq!(p.screen().screen_bg, 0);
        assert_eq!(p.screen().read_line(0)[0].code, map(b'A'));
    }

    #[test]
    fn test_ctrl_c_resets_background() {
        let mut p = parser_40x25();
        p.feed(&[0x02, 0x1C, 0x03]);
        assert_eq!(p.screen().screen_bg, 0);
    }

    #[test]
    fn test_bell_sequence() {
        let bells = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&bells);

        let mut p = parser_40x25();
        p.set_bell_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        p.feed(&[0x5C, 0x42, 0x31]);
        assert_eq!(bells.load(Ordering::SeqCst), 1);
        assert_eq!(p.bell_count(), 1);
        // The sequence itself leaves no cells behind.
        assert_eq!(p.screen().populated_cells(), 0);
    }

    #[test]
    fn test_broken_bell_prefix_replays() {
        let mut p = parser_40x25();
        p.feed(&[0x5C, 0x42, 0x32]);

        let screen = p.screen();
        assert_eq!(p.bell_count(), 0);
        assert_eq!(screen.read_line(0)[0].code, map(0x5C));
        assert_eq!(screen.read_line(0)[1].code, map(0x42));
        assert_eq!(screen.read_line(0)[2].code, map(0x32));
    }

    #[test]
    fn test_bell_restart_on_repeated_prefix() {
        // 5C 5C 42 31: the first 5C is replayed as text, the rest rings.
        let mut p = parser_40x25();
        p.feed(&[0x5C, 0x5C, 0x42, 0x31]);
        assert_eq!(p.bell_count(), 1);
        assert_eq!(p.screen().read_line(0)[0].code, map(0x5C));
        assert_eq!(p.screen().read_line(0)[1].code, 0x20);
    }

    #[test]
    fn test_ctrl_g_bell() {
        let mut p = parser_40x25();
        p.feed(&[0x07]);
        assert_eq!(p.bell_count(), 1);
    }

    #[test]
    fn test_cursor_movement() {
        let mut p = parser_40x25();
        p.feed(&[0x11, 0x11, 0x1D, 0x91]);
        assert_eq!(p.screen().cursor_x, 1);
        assert_eq!(p.screen().cursor_y, 1);
    }

    #[test]
    fn test_charset_switch() {
        let mut p = parser_40x25();
        p.feed(&[0x8E]);
        assert_eq!(p.screen().charset, CharsetMode::Upper);
        p.feed(&[0x0E]);
        assert_eq!(p.screen().charset, CharsetMode::Lower);
    }

    #[test]
    fn test_unknown_controls_discarded() {
        let mut p = parser_40x25();
        p.feed(&[0x00, 0x01, 0x06, 0x80, 0x8F]);
        assert_eq!(p.screen().populated_cells(), 0);
        assert_eq!(p.screen().cursor_x, 0);
    }

    #[test]
    fn test_scrollback_mode_clear_writes_separator() {
        let mut p = PetsciiParser::new_scrollback(ScreenBuffer::new_unlimited(40));
        p.feed(&[b'A', 0x93]);
        let text = p.screen().screen_text();
        assert!(text.contains("---- CLR ----"));
        // The pre-clear content is still there.
        assert!(text.contains('A'));
    }

    #[test]
    fn test_scrollback_mode_ignores_home() {
        let mut p = PetsciiParser::new_scrollback(ScreenBuffer::new_unlimited(40));
        p.feed(&[b'A', 0x0D, b'B', 0x13, b'C']);
        // HOME did not move the cursor back to row 0.
        assert_eq!(p.screen().read_line(1)[1].code, map(b'C'));
    }
}
