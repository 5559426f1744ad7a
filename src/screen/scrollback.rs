//! Scrollback store and pager.
//!
//! The store is an append-only log of raw stream bytes; it is the single
//! source of truth for history. Paged views are produced by replaying the
//! log through a scrollback-mode parser into a transient unlimited-growth
//! screen, so any derived line list is cache only and can be rebuilt at any
//! time (including after a width change).

use super::buffer::{Cell, ScreenBuffer};
use super::parser::PetsciiParser;

/// Append-only raw byte log of everything that crossed the interactive session.
#[derive(Debug, Default)]
pub struct ScrollbackBuffer {
    raw: Vec<u8>,
}

impl ScrollbackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw stream bytes.
    pub fn append(&mut self, data: &[u8]) {
        self.raw.extend_from_slice(data);
    }

    /// All raw bytes captured so far.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Discard the log.
    pub fn clear(&mut self) {
        self.raw.clear();
    }
}

/// A replayed view of the scrollback log at a fixed width.
#[derive(Debug)]
pub struct ScrollbackView {
    screen: ScreenBuffer,
    lines_per_page: usize,
}

impl ScrollbackView {
    /// Replay the log into a fresh view.
    pub fn build(buffer: &ScrollbackBuffer, width: usize, lines_per_page: usize) -> Self {
        let mut parser = PetsciiParser::new_scrollback(ScreenBuffer::new_unlimited(width));
        parser.feed(buffer.raw_bytes());
        Self {
            screen: parser.into_screen(),
            lines_per_page: lines_per_page.max(1),
        }
    }

    /// Total replayed line count.
    pub fn line_count(&self) -> usize {
        self.screen.height()
    }

    /// Number of pages at the configured page size.
    pub fn page_count(&self) -> usize {
        self.line_count().div_ceil(self.lines_per_page).max(1)
    }

    /// Rows for one page. Out-of-range pages yield an empty slice-of-rows.
    pub fn page(&self, page_index: usize) -> Vec<&[Cell]> {
        let start = page_index * self.lines_per_page;
        let end = (start + self.lines_per_page).min(self.line_count());
        (start..end.max(start))
            .map(|y| self.screen.read_line(y))
            .collect()
    }

    /// One page rendered as text, for saving or plain display.
    pub fn page_text(&self, page_index: usize) -> String {
        let start = page_index * self.lines_per_page;
        let end = (start + self.lines_per_page).min(self.line_count());
        (start..end.max(start))
            .map(|y| self.screen.line_text(y))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_clear() {
        let mut sb = ScrollbackBuffer::new();
        sb.append(b"HELLO");
        sb.append(&[0x0D]);
        assert_eq!(sb.len(), 6);
        sb.clear();
        assert!(sb.is_empty());
    }

    #[test]
    fn test_view_replays_lines() {
        let mut sb = ScrollbackBuffer::new();
        sb.append(b"ONE");
        sb.append(&[0x0D]);
        sb.append(b"TWO");
        sb.append(&[0x0D]);

        let view = ScrollbackView::build(&sb, 40, 10);
        let text = view.page_text(0);
        assert!(text.contains("ONE"));
        assert!(text.contains("TWO"));
    }

    #[test]
    fn test_paging() {
        let mut sb = ScrollbackBuffer::new();
        for _ in 0..25 {
            sb.append(b"X");
            sb.append(&[0x0D]);
        }

        let view = ScrollbackView::build(&sb, 40, 10);
        assert!(view.line_count() >= 25);
        assert!(view.page_count() >= 3);
        assert_eq!(view.page(0).len(), 10);
        // The last page may be short.
        assert!(view.page(view.page_count() - 1).len() <= 10);
        // Far out-of-range pages are empty.
        assert!(view.page(100).is_empty());
    }

    #[test]
    fn test_clear_screen_preserved_as_separator() {
        let mut sb = ScrollbackBuffer::new();
        sb.append(b"BEFORE");
        sb.append(&[0x93]);
        sb.append(b"AFTER");

        let view = ScrollbackView::build(&sb, 40, 100);
        let text = view.page_text(0);
        assert!(text.to_uppercase().contains("BEFORE"));
        assert!(text.contains("---- CLR ----"));
        assert!(text.to_uppercase().contains("AFTER"));
    }
}
