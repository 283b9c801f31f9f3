//! Virtual screen model and scrollback emission.
//!
//! The screen consumes the parser's callbacks, maintains a grid of bounded
//! height and unbounded width, and distills everything into a linear,
//! replay-safe byte stream: lines leave the model only once they scroll off
//! the top (or at [`Screen::end`]), at which point they are rendered as
//! plain text plus canonical SGR runs plus any preserved escape sequences.
//! Absolute cursor motion, clear-screen and friends never reach the output.

use crate::sgr::{SgrAttribute, SgrList};
use crate::vt_parser::{Handler, Parser, TAB_WIDTH};

/// Policy cap on the cursor column; a child addressing columns beyond this
/// is treated as misbehaving rather than allowed to grow a line unboundedly.
pub const MAX_COLUMNS: usize = 10_000;

/// One cell: a rune, the SGR attributes captured when it was written, and
/// raw escape sequences to replay immediately before the rune.
#[derive(Clone, Debug, PartialEq)]
pub struct Character {
    rune: char,
    sgr: SgrList,
    extra_escape_sequences: Vec<u8>,
}

impl Default for Character {
    fn default() -> Self {
        Self {
            rune: ' ',
            sgr: SgrList::new(),
            extra_escape_sequences: Vec::new(),
        }
    }
}

impl Character {
    fn is_default(&self) -> bool {
        self.rune == ' ' && self.sgr.is_empty() && self.extra_escape_sequences.is_empty()
    }
}

/// A line of cells, indexed from 0 and extended on demand.
#[derive(Clone, Debug, Default)]
pub struct Line {
    characters: Vec<Character>,
}

impl Line {
    /// The cell at `x`, extending the line with default cells as needed.
    fn character_at(&mut self, x: usize) -> &mut Character {
        if x >= self.characters.len() {
            self.characters.resize_with(x + 1, Character::default);
        }
        &mut self.characters[x]
    }

    /// Length with trailing default cells (plain spaces) trimmed off.
    pub fn length_without_trailing_default_cells(&self) -> usize {
        let trailing = self
            .characters
            .iter()
            .rev()
            .take_while(|c| c.is_default())
            .count();
        self.characters.len() - trailing
    }

    #[cfg(test)]
    fn text(&self) -> String {
        self.characters[..self.length_without_trailing_default_cells()]
            .iter()
            .map(|c| c.rune)
            .collect()
    }
}

/// The virtual screen for one captured output stream.
pub struct Screen {
    lines: Vec<Line>,
    desired_width: usize,
    max_height: usize,
    cursor_x: usize,
    cursor_y: usize,
    current_sgrs: SgrList,
    queued_scrollback: Vec<u8>,
    has_emitted: bool,
    ended: bool,
}

impl Screen {
    /// Create a screen. Width and height are coerced to at least 1; width
    /// only records the pty dimension, the model itself is unbounded
    /// horizontally.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            lines: vec![Line::default()],
            desired_width: width.max(1),
            max_height: height.max(1),
            cursor_x: 0,
            cursor_y: 0,
            current_sgrs: SgrList::new(),
            queued_scrollback: Vec::new(),
            has_emitted: false,
            ended: false,
        }
    }

    /// Feed raw child output through `parser` into this screen.
    pub fn process(&mut self, bytes: &[u8], parser: &mut Parser) {
        parser.advance(bytes, self);
    }

    pub fn size(&self) -> (usize, usize) {
        (self.desired_width, self.max_height)
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    /// Take the scrollback bytes queued since the last call.
    pub fn take_queued_scrollback(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.queued_scrollback)
    }

    fn current_line(&mut self) -> &mut Line {
        &mut self.lines[self.cursor_y]
    }

    fn set_current_character_to(&mut self, rune: char) {
        let sgr = self.current_sgrs.clone();
        let x = self.cursor_x;
        let character = self.current_line().character_at(x);
        character.rune = rune;
        character.sgr = sgr;
    }

    /// Erase leftwards: step back and overwrite with a space, up to `n`
    /// times, stopping once column 0 has been written.
    ///
    /// Note that a bare backspace only moves ([`Handler::prev_character`]);
    /// this is the erasing variant for `\b \b`-style consumers.
    pub fn delete_left(&mut self, n: usize) {
        for _ in 0..n {
            self.prev_character();
            self.set_current_character_to(' ');
            if self.cursor_x == 0 {
                break;
            }
        }
    }

    /// Render one finalized line into the queued scrollback stream.
    fn send_line_to_scrollback(&mut self, line: &Line) {
        // Every non-first line is preceded by its terminator, so the stream
        // never ends with a dangling newline.
        if self.has_emitted {
            self.queued_scrollback.push(b'\n');
        }
        self.has_emitted = true;

        let no_sgr = SgrList::new();
        let mut previous_sgr = &no_sgr;
        let mut did_set_sgr = false;
        let visible = line.length_without_trailing_default_cells();

        for character in &line.characters[..visible] {
            self.queued_scrollback
                .extend_from_slice(&character.extra_escape_sequences);

            if character.sgr != *previous_sgr {
                self.queued_scrollback.extend_from_slice(b"\x1b[0m");
                for attribute in &character.sgr {
                    self.queued_scrollback.extend_from_slice(&attribute.to_csi());
                }
                did_set_sgr = true;
            }

            let mut buf = [0u8; 4];
            self.queued_scrollback
                .extend_from_slice(character.rune.encode_utf8(&mut buf).as_bytes());

            previous_sgr = &character.sgr;
        }

        // Leave the terminal with default attributes between lines.
        if did_set_sgr {
            self.queued_scrollback.extend_from_slice(b"\x1b[0m");
        }
    }

    /// Flush every remaining line to scrollback and append the cursor
    /// deltas that move the real cursor from the end of the emitted text to
    /// where the child actually left its cursor. May be called only once.
    pub fn end(&mut self) {
        if self.ended {
            panic!("Screen::end() called twice");
        }
        self.ended = true;

        let lines = std::mem::take(&mut self.lines);
        for line in &lines {
            self.send_line_to_scrollback(line);
        }

        // After the last line the real cursor sits one past its last
        // printed cell; walk it to the screen's cursor position.
        let emitted_x = lines
            .last()
            .map(Line::length_without_trailing_default_cells)
            .unwrap_or(0);
        let dx = self.cursor_x as i64 - emitted_x as i64;
        if dx > 0 {
            self.queued_scrollback
                .extend_from_slice(format!("\x1b[{dx}C").as_bytes());
        } else if dx < 0 {
            self.queued_scrollback
                .extend_from_slice(format!("\x1b[{}D", -dx).as_bytes());
        }

        let dy = self.cursor_y as i64 - (lines.len() as i64 - 1);
        if dy > 0 {
            self.queued_scrollback
                .extend_from_slice(format!("\x1b[{dy}B").as_bytes());
        } else if dy < 0 {
            self.queued_scrollback
                .extend_from_slice(format!("\x1b[{}A", -dy).as_bytes());
        }
    }
}

impl Handler for Screen {
    fn normal_character(&mut self, ch: char) {
        self.set_current_character_to(ch);
        // The screen pretends to be infinitely wide; no wrapping.
        self.cursor_x = (self.cursor_x + 1).min(MAX_COLUMNS);
    }

    fn next_line(&mut self) {
        if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
        } else {
            self.lines.push(Line::default());
            self.cursor_y += 1;
        }

        if self.lines.len() > self.max_height {
            let evicted = self.lines.remove(0);
            self.send_line_to_scrollback(&evicted);
            self.cursor_y -= 1;
        }
    }

    fn prev_character(&mut self) {
        self.cursor_x = self.cursor_x.saturating_sub(1);
    }

    fn horizontal_tab(&mut self) {
        self.cursor_x = ((self.cursor_x / TAB_WIDTH + 1) * TAB_WIDTH).min(MAX_COLUMNS);
    }

    fn relative_move_cursor_vertical(&mut self, n: i32) {
        for _ in 0..n.max(0) {
            self.next_line();
        }
        for _ in n.min(0)..0 {
            if self.cursor_y > 0 {
                self.cursor_y -= 1;
            }
        }
    }

    fn relative_move_cursor_horizontal(&mut self, n: i32) {
        let target = self.cursor_x as i64 + i64::from(n);
        self.cursor_x = target.clamp(0, MAX_COLUMNS as i64) as usize;
    }

    fn absolute_move_cursor_vertical(&mut self, y: i32) {
        self.relative_move_cursor_vertical(y - self.cursor_y as i32);
    }

    fn absolute_move_cursor_horizontal(&mut self, x: i32) {
        self.cursor_x = x.clamp(0, MAX_COLUMNS as i32) as usize;
    }

    fn erase_in_display(&mut self, mode: u32) {
        match mode {
            0 => {
                self.erase_in_line(0);
                let below = self.cursor_y + 1;
                for line in &mut self.lines[below..] {
                    *line = Line::default();
                }
            }
            1 => {
                for line in &mut self.lines[..self.cursor_y] {
                    *line = Line::default();
                }
                self.erase_in_line(1);
            }
            2 => {
                for line in &mut self.lines {
                    *line = Line::default();
                }
            }
            _ => {}
        }
    }

    fn erase_in_line(&mut self, mode: u32) {
        let x = self.cursor_x;
        let line = &mut self.lines[self.cursor_y];
        match mode {
            0 => line.characters.truncate(x),
            1 => {
                let end = (x + 1).min(line.characters.len());
                for character in &mut line.characters[..end] {
                    *character = Character::default();
                }
            }
            2 => line.characters.clear(),
            _ => {}
        }
    }

    fn select_graphic_rendition_attribute(&mut self, attribute: SgrAttribute) {
        if attribute.is_unset_all() {
            self.current_sgrs.clear();
        } else {
            attribute.add_to_list(&mut self.current_sgrs);
        }
    }

    fn unhandled_escape_sequence(&mut self, sequence: &[u8]) {
        let x = self.cursor_x;
        self.current_line()
            .character_at(x)
            .extra_escape_sequences
            .extend_from_slice(sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(screen: &mut Screen, input: &[u8]) {
        let mut parser = Parser::new();
        screen.process(input, &mut parser);
    }

    fn replay(input: &[u8], width: usize, height: usize) -> Vec<u8> {
        let mut screen = Screen::new(width, height);
        feed(&mut screen, input);
        screen.end();
        screen.take_queued_scrollback()
    }

    #[test]
    fn test_plain_text_round_trip() {
        let mut screen = Screen::new(80, 24);
        feed(&mut screen, b"hello\nworld\n");
        screen.end();
        assert_eq!(screen.take_queued_scrollback(), b"hello\nworld\n");
        assert!(screen.lines.is_empty());
    }

    #[test]
    fn test_colored_text_replay() {
        assert_eq!(
            replay(b"\x1b[31mred\x1b[0m plain\n", 80, 24),
            b"\x1b[0m\x1b[31mred\x1b[0m plain\x1b[0m\n"
        );
    }

    #[test]
    fn test_backspace_overwrite() {
        let mut screen = Screen::new(80, 24);
        feed(&mut screen, b"abc\x08\x08XY");
        assert_eq!(screen.lines[0].text(), "aXY");
        assert_eq!((screen.cursor_x, screen.cursor_y), (3, 0));
        screen.end();
        // The cursor already sits one past 'Y'; no delta is needed.
        assert_eq!(screen.take_queued_scrollback(), b"aXY");
    }

    #[test]
    fn test_height_eviction() {
        let mut screen = Screen::new(80, 2);
        feed(&mut screen, b"A\nB\nC\n");
        assert_eq!(screen.lines.len(), 2);
        assert_eq!(screen.lines[0].text(), "C");
        assert_eq!(screen.lines[1].text(), "");
        assert_eq!(screen.take_queued_scrollback(), b"A\nB");
        screen.end();
        assert_eq!(screen.take_queued_scrollback(), b"\nC\n");
    }

    #[test]
    fn test_unhandled_osc_kept_in_place() {
        assert_eq!(
            replay(b"foo\x1b]0;title\x07bar\n", 80, 24),
            b"foo\x1b]0;title\x07bar\n"
        );
    }

    #[test]
    fn test_cursor_restore_after_carriage_return() {
        // The child leaves its cursor at column 0 of a 3-column line.
        assert_eq!(replay(b"abc\r", 80, 24), b"abc\x1b[3D");
    }

    #[test]
    fn test_cursor_restore_moves_up() {
        assert_eq!(replay(b"one\ntwo\x1b[A", 80, 24), b"one\ntwo\x1b[1A");
    }

    #[test]
    fn test_bounded_height_and_cursor_containment_under_fuzz() {
        // Deterministic pseudo-random byte soup, heavy on escape bytes.
        let mut state = 0x2545F4914F6CDD1Du64;
        let mut bytes = Vec::with_capacity(4096);
        for _ in 0..4096 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            bytes.push((state >> 32) as u8);
        }
        let mut parser = Parser::new();
        let mut screen = Screen::new(80, 6);
        for chunk in bytes.chunks(7) {
            screen.process(chunk, &mut parser);
            assert!(!screen.lines.is_empty());
            assert!(screen.lines.len() <= 6);
            assert!(screen.cursor_y < screen.lines.len());
            assert!(screen.cursor_x <= MAX_COLUMNS);
        }
    }

    #[test]
    fn test_sgr_idempotence() {
        let mut a = Screen::new(80, 24);
        feed(&mut a, b"\x1b[31mx");
        let mut b = Screen::new(80, 24);
        feed(&mut b, b"\x1b[31m\x1b[31mx");
        assert_eq!(a.lines[0].characters[0], b.lines[0].characters[0]);
    }

    #[test]
    fn test_reset_clears_attributes() {
        let mut screen = Screen::new(80, 24);
        feed(&mut screen, b"\x1b[1m\x1b[31m\x1b[0mx");
        assert!(screen.lines[0].characters[0].sgr.is_empty());
    }

    #[test]
    fn test_end_is_deterministic() {
        let input = b"\x1b[32mgreen\x1b[0m\ntail\x1b[2D";
        assert_eq!(replay(input, 80, 24), replay(input, 80, 24));
    }

    #[test]
    fn test_vertical_move_by_zero_is_noop() {
        let mut screen = Screen::new(80, 24);
        feed(&mut screen, b"x");
        screen.relative_move_cursor_vertical(0);
        assert_eq!((screen.cursor_x, screen.cursor_y), (1, 0));
        assert_eq!(screen.lines.len(), 1);
    }

    #[test]
    #[should_panic(expected = "called twice")]
    fn test_double_end_panics() {
        let mut screen = Screen::new(80, 24);
        screen.end();
        screen.end();
    }

    #[test]
    fn test_delete_left_erases_and_stops_at_column_zero() {
        let mut screen = Screen::new(80, 24);
        feed(&mut screen, b"abc");
        screen.delete_left(5);
        assert_eq!(screen.cursor_x, 0);
        assert_eq!(screen.lines[0].text(), "");
    }

    #[test]
    fn test_overwrite_captures_current_attributes_only() {
        let mut screen = Screen::new(80, 24);
        feed(&mut screen, b"\x1b[1mx\x08\x1b[0m\x1b[31my");
        assert_eq!(
            screen.lines[0].characters[0].sgr,
            vec![SgrAttribute::Primitive(31)]
        );
    }

    #[test]
    fn test_erase_in_line_to_end() {
        let mut screen = Screen::new(80, 24);
        feed(&mut screen, b"abcdef\x1b[3G\x1b[K");
        assert_eq!(screen.lines[0].text(), "ab");
    }

    #[test]
    fn test_erase_in_display_clears_without_emitting() {
        let mut screen = Screen::new(80, 24);
        feed(&mut screen, b"secret\x1b[2Jvisible");
        screen.end();
        let out = screen.take_queued_scrollback();
        let text = String::from_utf8_lossy(&out);
        assert!(!text.contains("secret"));
        assert!(text.contains("visible"));
    }

    #[test]
    fn test_absolute_row_move_past_bottom_scrolls() {
        let mut screen = Screen::new(80, 3);
        feed(&mut screen, b"a\x1b[9;1H");
        assert_eq!(screen.lines.len(), 3);
        assert_eq!(screen.cursor_y, 2);
    }

    #[test]
    fn test_wide_runes_survive_replay() {
        assert_eq!(replay("héllo ☃\n".as_bytes(), 80, 24), "héllo ☃\n".as_bytes());
    }

    #[test]
    fn test_tab_advances_to_next_stop() {
        let mut screen = Screen::new(80, 24);
        feed(&mut screen, b"ab\tx");
        assert_eq!(screen.cursor_x, 9);
        assert_eq!(screen.lines[0].text(), "ab      x");
    }
}
