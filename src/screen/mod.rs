//! Virtual PETSCII screen: charset translation, grid buffer, stream parser
//! and scrollback store.

pub mod buffer;
pub mod charset;
pub mod parser;
pub mod scrollback;

pub use buffer::{Cell, CharsetMode, ScreenBuffer, DEFAULT_FG};
pub use charset::{
    color_from_code, encode_key_text, is_color_code, is_printable, petscii_to_screen_code,
    screen_code_to_petscii, SCREEN_CODE_TABLE,
};
pub use parser::PetsciiParser;
pub use scrollback::{ScrollbackBuffer, ScrollbackView};
