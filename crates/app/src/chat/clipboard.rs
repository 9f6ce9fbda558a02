use std::io::{self, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// OSC 52 "set clipboard" escape; the terminal decodes the payload into the system clipboard.
pub fn osc52_sequence(text: &str) -> String {
    format!("\x1b]52;c;{}\x07", STANDARD.encode(text.as_bytes()))
}

pub fn copy_to_clipboard(out: &mut impl Write, text: &str) -> io::Result<()> {
    out.write_all(osc52_sequence(text).as_bytes())?;
    out.flush()
}
