//! Escape-sequence parser.
//!
//! A byte-at-a-time state machine that classifies a child's raw output into
//! printable runes, C0 controls, and CSI/OSC/ESC sequences, and dispatches
//! them to a [`Handler`]. The parser holds no screen state; the screen is
//! handed in as a narrow callback surface on every call, so the two sides
//! never hold references to each other.

use crate::sgr::{self, SgrAttribute};

/// Columns are advanced to the next multiple of this on a horizontal tab.
pub const TAB_WIDTH: usize = 8;

/// Maximum bytes of one escape sequence before the parser gives up on it.
const MAX_ESCAPE_LEN: usize = 64 * 1024;

/// Maximum number of CSI parameters kept for one sequence.
const MAX_CSI_PARAMS: usize = 64;

/// Parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// Normal text processing.
    #[default]
    Ground,
    /// Just saw ESC; collecting intermediates or the final of an ESC sequence.
    Escape,
    /// Collecting CSI parameter bytes (`0x30..=0x3F`).
    CsiParam,
    /// Collecting CSI intermediate bytes (`0x20..=0x2F`).
    CsiIntermediate,
    /// Collecting an OSC string, terminated by BEL or ST.
    OscString,
    /// Collecting a DCS/APC/PM/SOS string, terminated by BEL or ST.
    StringSequence,
}

/// Callback surface the parser dispatches into.
///
/// Implemented by the screen model; a test double suffices for parser tests.
pub trait Handler {
    /// A decoded printable rune (invalid UTF-8 arrives as U+FFFD).
    fn normal_character(&mut self, ch: char);

    /// Line feed: move to the next row, scrolling the top row out if needed.
    fn next_line(&mut self);

    /// Backspace: move one column left without erasing.
    fn prev_character(&mut self);

    /// Advance the column to the next multiple of [`TAB_WIDTH`].
    fn horizontal_tab(&mut self);

    /// `CSI A`/`CSI B`: negative is up. Never touches the column.
    fn relative_move_cursor_vertical(&mut self, n: i32);

    /// `CSI C`/`CSI D`: negative is left, floored at column 0.
    fn relative_move_cursor_horizontal(&mut self, n: i32);

    /// `CSI H` row component, 0-based.
    fn absolute_move_cursor_vertical(&mut self, y: i32);

    /// `CSI G` / `CSI H` column component and carriage return, 0-based.
    fn absolute_move_cursor_horizontal(&mut self, x: i32);

    /// `CSI J` with its first parameter (0 below, 1 above, 2 everything).
    fn erase_in_display(&mut self, mode: u32);

    /// `CSI K` with its first parameter (0 to end, 1 to cursor, 2 whole line).
    fn erase_in_line(&mut self, mode: u32);

    /// One parsed attribute of a `CSI ... m` sequence.
    fn select_graphic_rendition_attribute(&mut self, attribute: SgrAttribute);

    /// Raw bytes of a sequence the screen does not interpret; they must be
    /// preserved verbatim at the current cell for replay.
    fn unhandled_escape_sequence(&mut self, sequence: &[u8]);
}

/// The escape-sequence state machine.
#[derive(Debug, Default)]
pub struct Parser {
    state: State,
    /// Raw bytes of the escape sequence being collected, including the ESC.
    raw: Vec<u8>,
    params: Vec<u32>,
    subs: Vec<bool>,
    accumulator: u32,
    /// Whether the parameter being accumulated was introduced by a colon.
    param_is_sub: bool,
    /// Private-parameter marker (`?`, `<`, `=`, `>`), if any.
    private_marker: Option<u8>,
    /// Inside OSC/string sequences: saw ESC, waiting to see if ST follows.
    saw_string_escape: bool,
    // Incremental UTF-8 decode of the ground text stream.
    utf8_buf: [u8; 4],
    utf8_len: usize,
    utf8_need: usize,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a slice of raw child output through the state machine.
    pub fn advance<H: Handler>(&mut self, bytes: &[u8], handler: &mut H) {
        for &byte in bytes {
            self.advance_byte(byte, handler);
        }
    }

    fn advance_byte<H: Handler>(&mut self, byte: u8, handler: &mut H) {
        match self.state {
            State::Ground => self.ground_byte(byte, handler),
            State::Escape => self.escape_byte(byte, handler),
            State::CsiParam => self.csi_param_byte(byte, handler),
            State::CsiIntermediate => self.csi_intermediate_byte(byte, handler),
            State::OscString | State::StringSequence => self.string_byte(byte, handler),
        }
    }

    /// Abort the in-progress sequence and re-dispatch the offending byte
    /// from the ground state.
    fn abort_sequence<H: Handler>(&mut self, byte: u8, handler: &mut H) {
        log::debug!("aborting malformed escape sequence on byte {byte:#04x}");
        self.raw.clear();
        self.state = State::Ground;
        self.advance_byte(byte, handler);
    }

    fn ground_byte<H: Handler>(&mut self, byte: u8, handler: &mut H) {
        if self.utf8_need > 0 {
            if byte & 0xC0 == 0x80 {
                self.utf8_buf[self.utf8_len] = byte;
                self.utf8_len += 1;
                if self.utf8_len == self.utf8_need {
                    let decoded = std::str::from_utf8(&self.utf8_buf[..self.utf8_len])
                        .ok()
                        .and_then(|s| s.chars().next())
                        .unwrap_or(char::REPLACEMENT_CHARACTER);
                    handler.normal_character(decoded);
                    self.utf8_need = 0;
                    self.utf8_len = 0;
                }
                return;
            }
            // Truncated scalar; emit a replacement and reprocess the byte.
            handler.normal_character(char::REPLACEMENT_CHARACTER);
            self.utf8_need = 0;
            self.utf8_len = 0;
        }

        match byte {
            0x1B => {
                self.state = State::Escape;
                self.raw.clear();
                self.raw.push(byte);
            }
            b'\n' => {
                // The pty line discipline normally cooks this into CR LF;
                // a raw LF still starts the next line at column 0.
                handler.absolute_move_cursor_horizontal(0);
                handler.next_line();
            }
            b'\r' => handler.absolute_move_cursor_horizontal(0),
            0x08 => handler.prev_character(),
            b'\t' => handler.horizontal_tab(),
            0x20..=0x7E => handler.normal_character(byte as char),
            0xC2..=0xDF => {
                self.utf8_buf[0] = byte;
                self.utf8_len = 1;
                self.utf8_need = 2;
            }
            0xE0..=0xEF => {
                self.utf8_buf[0] = byte;
                self.utf8_len = 1;
                self.utf8_need = 3;
            }
            0xF0..=0xF4 => {
                self.utf8_buf[0] = byte;
                self.utf8_len = 1;
                self.utf8_need = 4;
            }
            0x80..=0xFF => handler.normal_character(char::REPLACEMENT_CHARACTER),
            // Remaining C0 controls (BEL, NUL, SO/SI, DEL, ...) are kept
            // verbatim so the replay reproduces them.
            _ => handler.unhandled_escape_sequence(&[byte]),
        }
    }

    fn escape_byte<H: Handler>(&mut self, byte: u8, handler: &mut H) {
        match byte {
            b'[' if self.raw.len() == 1 => {
                self.raw.push(byte);
                self.params.clear();
                self.subs.clear();
                self.accumulator = 0;
                self.param_is_sub = false;
                self.private_marker = None;
                self.state = State::CsiParam;
            }
            b']' if self.raw.len() == 1 => {
                self.raw.push(byte);
                self.saw_string_escape = false;
                self.state = State::OscString;
            }
            b'P' | b'_' | b'^' | b'X' if self.raw.len() == 1 => {
                self.raw.push(byte);
                self.saw_string_escape = false;
                self.state = State::StringSequence;
            }
            // Intermediates of multi-byte ESC sequences (e.g. `ESC ( B`).
            0x20..=0x2F => {
                self.raw.push(byte);
                if self.raw.len() > MAX_ESCAPE_LEN {
                    self.abort_sequence(byte, handler);
                }
            }
            // Final byte: the whole ESC sequence is preserved verbatim.
            0x30..=0x7E => {
                self.raw.push(byte);
                let raw = std::mem::take(&mut self.raw);
                handler.unhandled_escape_sequence(&raw);
                self.state = State::Ground;
            }
            _ => self.abort_sequence(byte, handler),
        }
    }

    fn commit_param(&mut self) {
        if self.params.len() < MAX_CSI_PARAMS {
            self.params.push(self.accumulator);
            self.subs.push(self.param_is_sub);
        }
        self.accumulator = 0;
    }

    fn csi_param_byte<H: Handler>(&mut self, byte: u8, handler: &mut H) {
        if self.raw.len() > MAX_ESCAPE_LEN {
            self.abort_sequence(byte, handler);
            return;
        }
        match byte {
            b'0'..=b'9' => {
                self.raw.push(byte);
                self.accumulator = self
                    .accumulator
                    .saturating_mul(10)
                    .saturating_add(u32::from(byte - b'0'));
            }
            b';' | b':' => {
                self.raw.push(byte);
                self.commit_param();
                self.param_is_sub = byte == b':';
            }
            b'<'..=b'?' => {
                self.raw.push(byte);
                self.private_marker = Some(byte);
            }
            0x20..=0x2F => {
                self.raw.push(byte);
                self.commit_param();
                self.state = State::CsiIntermediate;
            }
            0x40..=0x7E => {
                self.raw.push(byte);
                self.commit_param();
                self.dispatch_csi(byte, handler);
            }
            _ => self.abort_sequence(byte, handler),
        }
    }

    fn csi_intermediate_byte<H: Handler>(&mut self, byte: u8, handler: &mut H) {
        match byte {
            0x20..=0x2F => {
                self.raw.push(byte);
                if self.raw.len() > MAX_ESCAPE_LEN {
                    self.abort_sequence(byte, handler);
                }
            }
            // A sequence with intermediates is nothing we interpret;
            // preserve it verbatim.
            0x40..=0x7E => {
                self.raw.push(byte);
                let raw = std::mem::take(&mut self.raw);
                handler.unhandled_escape_sequence(&raw);
                self.state = State::Ground;
            }
            _ => self.abort_sequence(byte, handler),
        }
    }

    fn string_byte<H: Handler>(&mut self, byte: u8, handler: &mut H) {
        if self.saw_string_escape {
            self.saw_string_escape = false;
            if byte == b'\\' {
                self.raw.push(0x1B);
                self.raw.push(byte);
                let raw = std::mem::take(&mut self.raw);
                handler.unhandled_escape_sequence(&raw);
                self.state = State::Ground;
            } else {
                // ESC without ST aborts the string; the ESC starts over.
                self.raw.clear();
                self.raw.push(0x1B);
                self.state = State::Escape;
                self.escape_byte(byte, handler);
            }
            return;
        }
        match byte {
            0x07 => {
                self.raw.push(byte);
                let raw = std::mem::take(&mut self.raw);
                handler.unhandled_escape_sequence(&raw);
                self.state = State::Ground;
            }
            0x1B => self.saw_string_escape = true,
            _ => {
                self.raw.push(byte);
                if self.raw.len() > MAX_ESCAPE_LEN {
                    log::debug!("dropping oversized string sequence");
                    self.raw.clear();
                    self.state = State::Ground;
                }
            }
        }
    }

    /// Parameter at `index`, with zero (absent or empty) mapped to `default`.
    /// Capped so a hostile parameter cannot drive the screen into an
    /// absurdly long cursor walk.
    fn param(&self, index: usize, default: u32) -> i32 {
        let value = match self.params.get(index) {
            Some(&value) if value != 0 => value,
            _ => default,
        };
        value.min(u16::MAX as u32) as i32
    }

    fn dispatch_csi<H: Handler>(&mut self, final_byte: u8, handler: &mut H) {
        self.state = State::Ground;
        let raw = std::mem::take(&mut self.raw);

        if let Some(marker) = self.private_marker {
            // DEC private modes change terminal state that must never reach
            // the replay stream (alt screen, bracketed paste, ...).
            if marker == b'?' && matches!(final_byte, b'h' | b'l') {
                log::debug!(
                    "dropping private mode sequence {:?}",
                    String::from_utf8_lossy(&raw)
                );
                return;
            }
            handler.unhandled_escape_sequence(&raw);
            return;
        }

        match final_byte {
            b'A' => handler.relative_move_cursor_vertical(-self.param(0, 1)),
            b'B' => handler.relative_move_cursor_vertical(self.param(0, 1)),
            b'C' => handler.relative_move_cursor_horizontal(self.param(0, 1)),
            b'D' => handler.relative_move_cursor_horizontal(-self.param(0, 1)),
            b'G' => handler.absolute_move_cursor_horizontal(self.param(0, 1) - 1),
            b'H' | b'f' => {
                handler.absolute_move_cursor_vertical(self.param(0, 1) - 1);
                handler.absolute_move_cursor_horizontal(self.param(1, 1) - 1);
            }
            b'J' => handler.erase_in_display(self.params.first().copied().unwrap_or(0)),
            b'K' => handler.erase_in_line(self.params.first().copied().unwrap_or(0)),
            b'm' => {
                for attribute in sgr::attributes_from_params(&self.params, &self.subs) {
                    handler.select_graphic_rendition_attribute(attribute);
                }
            }
            _ => handler.unhandled_escape_sequence(&raw),
        }
    }
}
