//! End-to-end scenarios for the PETSCII interpreter pipeline.

use retroterm::screen::{
    petscii_to_screen_code, PetsciiParser, ScreenBuffer, ScrollbackBuffer, ScrollbackView,
};

fn parser() -> PetsciiParser {
    PetsciiParser::new(ScreenBuffer::new(40, 25))
}

#[test]
fn clear_color_text_and_wrap_to_next_row() {
    // CLR, WHITE, "HI", CR, RED, "A"
    let mut p = parser();
    p.feed(&[0x93, 0x05, b'H', b'I', 0x0D, 0x1C, b'A']);

    let screen = p.screen();
    assert_eq!(screen.read_line(0)[0].code, petscii_to_screen_code(b'H'));
    assert_eq!(screen.read_line(0)[0].fg, 1, "white foreground");
    assert_eq!(screen.read_line(0)[1].code, petscii_to_screen_code(b'I'));
    assert_eq!(screen.read_line(1)[0].code, petscii_to_screen_code(b'A'));
    assert_eq!(screen.read_line(1)[0].fg, 2, "red foreground");
    assert!(!screen.reverse_mode);
}

#[test]
fn reverse_cell_then_explicit_cr_clears_reverse() {
    let mut p = parser();
    p.feed(&[0x12, b'X', 0x0D, b'Y']);

    let screen = p.screen();
    assert!(screen.read_line(0)[0].reverse);
    assert!(!screen.read_line(1)[0].reverse);
}

#[test]
fn ctrl_b_color_sets_background_without_writing() {
    let mut p = parser();
    p.feed(&[0x02, 0x1C]);
    assert_eq!(p.screen().screen_bg, 2);
    assert_eq!(p.screen().populated_cells(), 0);
}

#[test]
fn auto_wrap_keeps_reverse_mode() {
    let mut p = PetsciiParser::new(ScreenBuffer::new(40, 25));
    p.feed(&[0x12]);
    p.feed(&[b'*'; 40]);
    assert!(p.screen().reverse_mode);
    assert_eq!(p.screen().cursor_y, 1);
    assert!(p.screen().read_line(0).iter().all(|c| c.reverse));
}

#[test]
fn per_byte_round_trip_on_printables() {
    for b in 0u16..=255 {
        let b = b as u8;
        let printable = (0x20..=0x7F).contains(&b) || b >= 0xA0;
        if !printable {
            continue;
        }
        let mut p = parser();
        p.feed(&[b]);
        assert_eq!(
            p.screen().read_line(0)[0].code,
            petscii_to_screen_code(b),
            "PETSCII 0x{b:02X}"
        );
    }
}

#[test]
fn bell_sequence_rings_once_and_leaves_no_cells() {
    let mut p = parser();
    p.feed(&[0x5C, 0x42, 0x31]);
    assert_eq!(p.bell_count(), 1);
    assert_eq!(p.screen().populated_cells(), 0);

    // The same bytes split across feeds still ring exactly once.
    let mut p = parser();
    p.feed(&[0x5C]);
    p.feed(&[0x42]);
    p.feed(&[0x31]);
    assert_eq!(p.bell_count(), 1);
}

#[test]
fn broken_bell_prefix_becomes_ordinary_text() {
    let mut p = parser();
    p.feed(&[0x5C, 0x42, 0x32]);
    assert_eq!(p.bell_count(), 0);

    let screen = p.screen();
    assert_eq!(screen.read_line(0)[0].code, petscii_to_screen_code(0x5C));
    assert_eq!(screen.read_line(0)[1].code, petscii_to_screen_code(0x42));
    assert_eq!(screen.read_line(0)[2].code, petscii_to_screen_code(0x32));
}

#[test]
fn scroll_preserves_cell_population() {
    let mut p = PetsciiParser::new(ScreenBuffer::new(10, 3));
    // Fill four lines; the grid is three tall, so one line scrolls out.
    for line in [b"AAAA", b"BBBB", b"CCCC", b"DDDD"] {
        p.feed(line);
        p.feed(&[0x0D]);
    }
    let screen = p.screen();
    let on_screen = screen.populated_cells();
    let scrolled: usize = screen
        .scrolled_out()
        .iter()
        .flat_map(|row| row.iter())
        .filter(|c| c.code != 0x20)
        .count();
    assert_eq!(on_screen + scrolled, 16);
}

#[test]
fn scrollback_reparse_pages_the_history() {
    let mut sb = ScrollbackBuffer::new();
    for i in 0..30 {
        let line = format!("LINE {i}");
        sb.append(line.as_bytes());
        sb.append(&[0x0D]);
    }
    // A clear screen mid-stream must not erase earlier history in the view.
    sb.append(&[0x93]);
    sb.append(b"AFTER CLEAR");
    sb.append(&[0x0D]);

    let view = ScrollbackView::build(&sb, 40, 10);
    assert!(view.page_count() >= 3);

    let all: String = (0..view.page_count())
        .map(|p| view.page_text(p))
        .collect::<Vec<_>>()
        .join("\n");
    assert!(all.contains("LINE 0"));
    assert!(all.contains("LINE 29"));
    assert!(all.contains("---- CLR ----"));
    assert!(all.contains("AFTER CLEAR"));

    // The raw log is authoritative; clearing it empties the next view.
    sb.clear();
    let view = ScrollbackView::build(&sb, 40, 10);
    assert_eq!(view.page_text(0).trim(), "");
}
