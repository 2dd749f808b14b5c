use std::io::{self, Write};

use crossterm::{cursor, queue, terminal};
use unicode_width::UnicodeWidthChar;

pub const RESET: &str = "\x1b[0m";

const MAX_LINE_CHARS: usize = 4096;

enum EscapeMode {
    Esc,
    Csi,
    Osc,
    OscEsc,
    StTerminated,
    StEsc,
}

/// Steps an escape-sequence recognizer. Returns the next mode while `c` is
/// still inside a sequence, `None` once the sequence has been consumed.
fn step_escape(mode: EscapeMode, c: char) -> Option<EscapeMode> {
    match mode {
        EscapeMode::Esc => match c {
            '[' => Some(EscapeMode::Csi),
            ']' => Some(EscapeMode::Osc),
            'P' | 'X' | '^' | '_' => Some(EscapeMode::StTerminated),
            _ => None,
        },
        EscapeMode::Csi => {
            if ('@'..='~').contains(&c) {
                None
            } else {
                Some(EscapeMode::Csi)
            }
        }
        EscapeMode::Osc => {
            if c == '\x07' {
                None
            } else if c == '\x1b' {
                Some(EscapeMode::OscEsc)
            } else {
                Some(EscapeMode::Osc)
            }
        }
        EscapeMode::OscEsc => {
            if c == '\\' {
                None
            } else if c == '\x1b' {
                Some(EscapeMode::OscEsc)
            } else {
                Some(EscapeMode::Osc)
            }
        }
        EscapeMode::StTerminated => {
            if c == '\x1b' {
                Some(EscapeMode::StEsc)
            } else {
                Some(EscapeMode::StTerminated)
            }
        }
        EscapeMode::StEsc => {
            if c == '\\' {
                None
            } else if c == '\x1b' {
                Some(EscapeMode::StEsc)
            } else {
                Some(EscapeMode::StTerminated)
            }
        }
    }
}

/// Strips ANSI escape sequences and other control characters from a stream
/// token before it reaches logs or the display. Tabs become spaces; very long
/// tokens are truncated.
pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut esc_mode: Option<EscapeMode> = None;
    let mut truncated = false;
    let mut char_count = 0usize;

    for c in input.chars() {
        if let Some(mode) = esc_mode.take() {
            esc_mode = step_escape(mode, c);
            continue;
        }

        if c == '\x1b' {
            esc_mode = Some(EscapeMode::Esc);
            continue;
        }
        if c == '\r' || c == '\n' {
            continue;
        }
        if c == '\t' {
            out.push(' ');
            char_count += 1;
        } else if c.is_control() || is_format_control(c) {
            continue;
        } else {
            out.push(c);
            char_count += 1;
        }

        if char_count >= MAX_LINE_CHARS {
            truncated = true;
            break;
        }
    }

    if truncated {
        out.push_str(" ...[truncated]");
    }

    out
}

fn is_format_control(c: char) -> bool {
    c == '\u{061C}'
        || c == '\u{200E}'
        || c == '\u{200F}'
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

/// Display-cell length of a string, ignoring ANSI escape sequences.
pub fn visual_length(s: &str) -> usize {
    let mut len = 0usize;
    let mut esc_mode: Option<EscapeMode> = None;
    for c in s.chars() {
        if let Some(mode) = esc_mode.take() {
            esc_mode = step_escape(mode, c);
            continue;
        }
        if c == '\x1b' {
            esc_mode = Some(EscapeMode::Esc);
            continue;
        }
        len += c.width().unwrap_or(0);
    }
    len
}

/// Cuts a string to at most `cells` display cells. Escape sequences are
/// copied through without counting, so coloring survives the cut (the caller
/// is responsible for resetting attributes afterwards).
pub fn trim_to_visual_length(s: &str, cells: usize) -> String {
    let mut out = String::with_capacity(s.len());
    let mut used = 0usize;
    let mut esc_mode: Option<EscapeMode> = None;
    for c in s.chars() {
        if let Some(mode) = esc_mode.take() {
            esc_mode = step_escape(mode, c);
            out.push(c);
            continue;
        }
        if c == '\x1b' {
            esc_mode = Some(EscapeMode::Esc);
            out.push(c);
            continue;
        }
        let w = c.width().unwrap_or(0);
        if used + w > cells {
            break;
        }
        used += w;
        out.push(c);
    }
    out
}

/// Current terminal width in columns, with a conventional fallback when the
/// query fails (e.g. output is not a terminal).
pub fn terminal_width() -> usize {
    terminal::size().map(|(w, _)| w as usize).unwrap_or(80)
}

/// Cursor-addressable output for the live view. Rows are tracked relative to
/// the current group's top anchor; absolute positioning is never used. All
/// writes are best-effort: a broken terminal must not invalidate the run.
pub struct Screen<W: Write> {
    out: W,
    width_override: Option<usize>,
}

impl Screen<io::Stdout> {
    pub fn stdout() -> Self {
        Self {
            out: io::stdout(),
            width_override: None,
        }
    }
}

impl<W: Write> Screen<W> {
    pub fn with_writer(out: W, width_override: Option<usize>) -> Self {
        Self {
            out,
            width_override,
        }
    }

    pub fn width(&self) -> usize {
        self.width_override.unwrap_or_else(terminal_width)
    }

    /// Moves the cursor to `target` (rows below the group anchor) and column 0.
    pub fn move_to(&mut self, cur_line: &mut i32, target: i32) {
        let diff = target - *cur_line;
        if diff > 0 {
            let _ = queue!(self.out, cursor::MoveDown(diff as u16));
        } else if diff < 0 {
            let _ = queue!(self.out, cursor::MoveUp((-diff) as u16));
        }
        let _ = queue!(self.out, cursor::MoveToColumn(0));
        *cur_line = target;
    }

    pub fn erase_line(&mut self) {
        let _ = queue!(
            self.out,
            terminal::Clear(terminal::ClearType::CurrentLine)
        );
    }

    /// Repaints the row at `target`: move, erase, write, newline. Leaves the
    /// cursor on the row below.
    pub fn display(&mut self, line: &str, cur_line: &mut i32, target: i32) {
        self.move_to(cur_line, target);
        self.erase_line();
        let _ = self.out.write_all(line.as_bytes());
        let _ = self.out.write_all(b"\n");
        *cur_line = target + 1;
        let _ = self.out.flush();
    }

    /// Writes a line at the current cursor position without adjusting the
    /// row tracking (used for the group header above the anchor).
    pub fn write_line(&mut self, line: &str) {
        let _ = queue!(self.out, cursor::MoveToColumn(0));
        self.erase_line();
        let _ = self.out.write_all(line.as_bytes());
        let _ = self.out.write_all(b"\n");
        let _ = self.out.flush();
    }

    pub fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_and_osc_sequences() {
        let input = "ok \u{1b}[31mred\u{1b}[0m \u{1b}]0;title\u{7} done";
        let got = sanitize_line(input);
        assert_eq!(got, "ok red  done");
    }

    #[test]
    fn strips_st_terminated_sequences() {
        let input = "a\u{1b}Ppayload\u{1b}\\b";
        let got = sanitize_line(input);
        assert_eq!(got, "ab");
    }

    #[test]
    fn strips_newlines_and_tabs_and_bidi_controls() {
        let input = "a\tb\nc\r\u{202e}x";
        let got = sanitize_line(input);
        assert_eq!(got, "a bcx");
    }

    #[test]
    fn visual_length_ignores_sgr_sequences() {
        assert_eq!(visual_length("abc"), 3);
        assert_eq!(visual_length("\u{1b}[31mabc\u{1b}[0m"), 3);
        assert_eq!(
            visual_length("abc"),
            visual_length("\u{1b}[1m\u{1b}[92mabc\u{1b}[0m")
        );
    }

    #[test]
    fn visual_length_counts_wide_chars_as_two_cells() {
        assert_eq!(visual_length("日本"), 4);
    }

    #[test]
    fn trim_keeps_escapes_and_cuts_cells() {
        let s = "\u{1b}[33mhello world\u{1b}[0m";
        let cut = trim_to_visual_length(s, 5);
        assert_eq!(visual_length(&cut), 5);
        assert!(cut.starts_with("\u{1b}[33m"));
        assert!(cut.contains("hello"));
    }

    #[test]
    fn trim_to_zero_cells_keeps_nothing_visible() {
        assert_eq!(visual_length(&trim_to_visual_length("abcdef", 0)), 0);
    }

    #[test]
    fn screen_tracks_relative_rows() {
        let mut screen = Screen::with_writer(Vec::new(), Some(40));
        let mut cur = 0i32;
        screen.display("first", &mut cur, 0);
        assert_eq!(cur, 1);
        screen.display("second", &mut cur, 3);
        assert_eq!(cur, 4);
        screen.move_to(&mut cur, 0);
        assert_eq!(cur, 0);
    }
}
