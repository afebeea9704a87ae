//! The screen grid behind a terminal: cells, attributes, scrollback and
//! the `vte::Perform` implementation that applies the xterm byte stream.
//!
//! Every cell carries an age; [`Screen::draw`] hands the renderer only the
//! cells that changed since the age it last painted.

use std::collections::VecDeque;

use vte::{Params, Perform};

use crate::config::{parse_pair, parse_u32};
use crate::image::Placement;

pub const SCROLLBACK_LINES: usize = 200;

pub const DEFAULT_FG: u32 = 0x00FF_FFFF;
pub const DEFAULT_BG: u32 = 0x0000_0000;

const TAB_WIDTH: usize = 8;

// VGA palette, normal and bright halves.
const PALETTE: [u32; 16] = [
    0x000000, 0xAA0000, 0x00AA00, 0xAA5500, 0x0000AA, 0xAA00AA, 0x00AAAA, 0xAAAAAA,
    0x555555, 0xFF5555, 0x55FF55, 0xFFFF55, 0x5555FF, 0xFF55FF, 0x55FFFF, 0xFFFFFF,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attrs {
    pub fg: u32,
    pub bg: u32,
    pub inverse: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cell {
    /// `None` renders as a cleared cell.
    pub ch: Option<char>,
    pub attrs: Attrs,
    age: u64,
}

/// Graphics escape (OSC) requests, drained by the owning terminal when the
/// image codes are enabled.
#[derive(Clone, Debug, PartialEq)]
pub enum GfxCommand {
    Image {
        path: String,
        placement: Placement,
        scale: u32,
    },
    Box {
        color: u32,
        size: (u32, u32),
        placement: Placement,
    },
}

pub struct Screen {
    cols: usize,
    rows: usize,
    cells: Vec<Cell>,
    scrollback: VecDeque<Vec<Cell>>,
    view_offset: usize,

    cursor: (usize, usize),
    saved_cursor: (usize, usize),
    cursor_visible: bool,
    last_drawn_cursor: (usize, usize),
    pending_wrap: bool,

    // Scroll region rows [top, bottom).
    scroll_top: usize,
    scroll_bottom: usize,

    attrs: Attrs,
    default_attrs: Attrs,
    fg_base: Option<u8>,
    bold: bool,
    autowrap: bool,

    age: u64,
    damage_all: bool,

    gfx: Vec<GfxCommand>,
}

impl Screen {
    pub fn new(cols: usize, rows: usize) -> Screen {
        let default_attrs = Attrs {
            fg: DEFAULT_FG,
            bg: DEFAULT_BG,
            inverse: false,
        };
        let blank = Cell {
            ch: None,
            attrs: default_attrs,
            age: 0,
        };
        Screen {
            cols,
            rows,
            cells: vec![blank; cols * rows],
            scrollback: VecDeque::new(),
            view_offset: 0,
            cursor: (0, 0),
            saved_cursor: (0, 0),
            cursor_visible: true,
            last_drawn_cursor: (0, 0),
            pending_wrap: false,
            scroll_top: 0,
            scroll_bottom: rows,
            attrs: default_attrs,
            default_attrs,
            fg_base: None,
            bold: false,
            autowrap: true,
            age: 0,
            damage_all: true,
            gfx: Vec::new(),
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cursor(&self) -> (usize, usize) {
        self.cursor
    }

    /// Default colors used for cleared cells; the splash path recolors the
    /// background before drawing.
    pub fn set_default_colors(&mut self, fg: u32, bg: u32) {
        self.default_attrs.fg = fg;
        self.default_attrs.bg = bg;
        self.attrs = self.default_attrs;
    }

    pub fn take_gfx(&mut self) -> Vec<GfxCommand> {
        std::mem::take(&mut self.gfx)
    }

    /// Grow or shrink the grid in place, keeping the top-left content.
    pub fn resize(&mut self, cols: usize, rows: usize) {
        if cols == self.cols && rows == self.rows {
            return;
        }
        let blank = Cell {
            ch: None,
            attrs: self.default_attrs,
            age: 0,
        };
        let mut cells = vec![blank; cols * rows];
        for row in 0..rows.min(self.rows) {
            for col in 0..cols.min(self.cols) {
                cells[row * cols + col] = self.cells[row * self.cols + col];
            }
        }
        self.cells = cells;
        self.cols = cols;
        self.rows = rows;
        self.scroll_top = 0;
        self.scroll_bottom = rows;
        self.cursor = (self.cursor.0.min(cols - 1), self.cursor.1.min(rows - 1));
        self.pending_wrap = false;
        self.view_offset = 0;
        self.damage_all = true;
    }

    pub fn clear(&mut self) {
        self.erase_region(0, 0, self.cols, self.rows);
        self.cursor = (0, 0);
        self.pending_wrap = false;
    }

    // Scrollback view control.

    pub fn sb_line_up(&mut self) {
        self.set_view(self.view_offset + 1);
    }

    pub fn sb_line_down(&mut self) {
        self.set_view(self.view_offset.saturating_sub(1));
    }

    pub fn sb_page_up(&mut self) {
        self.set_view(self.view_offset + self.rows);
    }

    pub fn sb_page_down(&mut self) {
        self.set_view(self.view_offset.saturating_sub(self.rows));
    }

    pub fn sb_reset(&mut self) {
        self.set_view(0);
    }

    pub fn view_offset(&self) -> usize {
        self.view_offset
    }

    fn set_view(&mut self, offset: usize) {
        let offset = offset.min(self.scrollback.len());
        if offset != self.view_offset {
            self.view_offset = offset;
            self.damage_all = true;
        }
    }

    /// Visit every cell that changed since `last_age` (plus the cursor
    /// cells) and return the age to pass next time.
    pub fn draw<F>(&mut self, last_age: u64, mut paint: F) -> u64
    where
        F: FnMut(u32, u32, Option<char>, Attrs),
    {
        let full = self.damage_all || last_age == 0;
        let cursor_moved = self.cursor != self.last_drawn_cursor;

        for row in 0..self.rows {
            for col in 0..self.cols {
                let cell = self.visible_cell(col, row);
                let at_cursor = self.view_offset == 0
                    && self.cursor_visible
                    && (col, row) == self.cursor;
                let was_cursor = (col, row) == self.last_drawn_cursor;
                let aged = cell.age > last_age;
                if !(full || aged || (cursor_moved && (at_cursor || was_cursor))) {
                    continue;
                }
                let mut attrs = cell.attrs;
                if at_cursor {
                    attrs.inverse = !attrs.inverse;
                }
                paint(col as u32, row as u32, cell.ch, attrs);
            }
        }

        self.last_drawn_cursor = self.cursor;
        self.damage_all = false;
        self.age
    }

    fn visible_cell(&self, col: usize, row: usize) -> Cell {
        if self.view_offset > 0 && row < self.view_offset {
            let index = self.scrollback.len() - self.view_offset + row;
            return self.scrollback[index]
                .get(col)
                .copied()
                .unwrap_or(Cell {
                    ch: None,
                    attrs: self.default_attrs,
                    age: 0,
                });
        }
        let row = row - self.view_offset.min(row);
        self.cells[row * self.cols + col]
    }

    // Mutation helpers. Every write stamps a fresh age.

    fn bump(&mut self) -> u64 {
        self.age += 1;
        self.age
    }

    fn set_cell(&mut self, col: usize, row: usize, ch: Option<char>, attrs: Attrs) {
        let age = self.bump();
        let cell = &mut self.cells[row * self.cols + col];
        cell.ch = ch;
        cell.attrs = attrs;
        cell.age = age;
    }

    fn erase_region(&mut self, x0: usize, y0: usize, x1: usize, y1: usize) {
        let attrs = Attrs {
            inverse: false,
            ..self.default_attrs
        };
        for row in y0..y1.min(self.rows) {
            for col in x0..x1.min(self.cols) {
                self.set_cell(col, row, None, attrs);
            }
        }
    }

    /// Scroll the region up. Only lines pushed out by output (`record`)
    /// enter the scrollback ring, and only when the region spans the whole
    /// screen.
    fn scroll_up(&mut self, n: usize, record: bool) {
        for _ in 0..n {
            if record && self.scroll_top == 0 && self.scroll_bottom == self.rows {
                let line: Vec<Cell> =
                    self.cells[0..self.cols].to_vec();
                self.scrollback.push_back(line);
                if self.scrollback.len() > SCROLLBACK_LINES {
                    self.scrollback.pop_front();
                }
                if self.view_offset > 0 {
                    // Keep a scrolled-back view anchored on its content.
                    self.set_view(self.view_offset + 1);
                    self.damage_all = true;
                }
            }
            let age = self.bump();
            for row in self.scroll_top..self.scroll_bottom - 1 {
                for col in 0..self.cols {
                    let below = self.cells[(row + 1) * self.cols + col];
                    let cell = &mut self.cells[row * self.cols + col];
                    cell.ch = below.ch;
                    cell.attrs = below.attrs;
                    cell.age = age;
                }
            }
            self.erase_region(0, self.scroll_bottom - 1, self.cols, self.scroll_bottom);
        }
    }

    fn scroll_down(&mut self, n: usize) {
        for _ in 0..n {
            let age = self.bump();
            for row in (self.scroll_top + 1..self.scroll_bottom).rev() {
                for col in 0..self.cols {
                    let above = self.cells[(row - 1) * self.cols + col];
                    let cell = &mut self.cells[row * self.cols + col];
                    cell.ch = above.ch;
                    cell.attrs = above.attrs;
                    cell.age = age;
                }
            }
            self.erase_region(0, self.scroll_top, self.cols, self.scroll_top + 1);
        }
    }

    fn linefeed(&mut self) {
        if self.cursor.1 + 1 == self.scroll_bottom {
            self.scroll_up(1, true);
        } else if self.cursor.1 + 1 < self.rows {
            self.cursor.1 += 1;
        }
        self.pending_wrap = false;
    }

    fn reverse_linefeed(&mut self) {
        if self.cursor.1 == self.scroll_top {
            self.scroll_down(1);
        } else if self.cursor.1 > 0 {
            self.cursor.1 -= 1;
        }
        self.pending_wrap = false;
    }

    fn move_cursor(&mut self, col: usize, row: usize) {
        self.cursor = (col.min(self.cols - 1), row.min(self.rows - 1));
        self.pending_wrap = false;
    }

    fn current_attrs(&self) -> Attrs {
        self.attrs
    }

    fn reset_state(&mut self) {
        self.attrs = self.default_attrs;
        self.fg_base = None;
        self.bold = false;
        self.scroll_top = 0;
        self.scroll_bottom = self.rows;
        self.cursor_visible = true;
        self.autowrap = true;
        self.view_offset = 0;
        self.clear();
        self.damage_all = true;
    }

    fn apply_sgr(&mut self, params: &Params) {
        let mut flat: Vec<u16> = Vec::new();
        for group in params.iter() {
            for &p in group {
                flat.push(p);
            }
        }
        if flat.is_empty() {
            flat.push(0);
        }

        let mut i = 0;
        while i < flat.len() {
            match flat[i] {
                0 => {
                    self.attrs = self.default_attrs;
                    self.fg_base = None;
                    self.bold = false;
                }
                1 => {
                    self.bold = true;
                    if let Some(base) = self.fg_base {
                        self.attrs.fg = PALETTE[base as usize + 8];
                    }
                }
                22 => {
                    self.bold = false;
                    if let Some(base) = self.fg_base {
                        self.attrs.fg = PALETTE[base as usize];
                    }
                }
                7 => self.attrs.inverse = true,
                27 => self.attrs.inverse = false,
                n @ 30..=37 => {
                    let base = (n - 30) as u8;
                    self.fg_base = Some(base);
                    self.attrs.fg = PALETTE[base as usize + if self.bold { 8 } else { 0 }];
                }
                39 => {
                    self.fg_base = None;
                    self.attrs.fg = self.default_attrs.fg;
                }
                n @ 40..=47 => self.attrs.bg = PALETTE[(n - 40) as usize],
                49 => self.attrs.bg = self.default_attrs.bg,
                n @ 90..=97 => {
                    self.fg_base = None;
                    self.attrs.fg = PALETTE[(n - 90) as usize + 8];
                }
                n @ 100..=107 => self.attrs.bg = PALETTE[(n - 100) as usize + 8],
                38 | 48 => {
                    // 38;5;n or 48;5;n (the ;2;r;g;b form also consumes here)
                    let target_fg = flat[i] == 38;
                    if flat.get(i + 1) == Some(&5)
                        && let Some(&n) = flat.get(i + 2)
                    {
                        let color = xterm_256(n as u8);
                        if target_fg {
                            self.fg_base = None;
                            self.attrs.fg = color;
                        } else {
                            self.attrs.bg = color;
                        }
                        i += 2;
                    } else if flat.get(i + 1) == Some(&2) && flat.len() > i + 4 {
                        let color = (flat[i + 2] as u32) << 16
                            | (flat[i + 3] as u32) << 8
                            | flat[i + 4] as u32;
                        if target_fg {
                            self.fg_base = None;
                            self.attrs.fg = color;
                        } else {
                            self.attrs.bg = color;
                        }
                        i += 4;
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    fn handle_osc(&mut self, payload: &str) {
        let Some((kind, rest)) = payload.split_once(':') else {
            return;
        };

        let mut path = None;
        let mut color = None;
        let mut size = None;
        let mut scale = 1;
        let mut placement = Placement::Center;
        for option in rest.split(';') {
            let Some((key, value)) = option.split_once('=') else {
                continue;
            };
            match key {
                "file" => path = Some(value.to_owned()),
                "color" => color = parse_u32(value).ok(),
                "size" => {
                    size = parse_pair(value)
                        .ok()
                        .map(|(w, h)| (w.max(0) as u32, h.max(0) as u32))
                }
                "scale" => scale = parse_u32(value).unwrap_or(1).clamp(1, 4),
                "location" => {
                    if let Ok((x, y)) = parse_pair(value) {
                        placement = Placement::Location(x, y);
                    }
                }
                "offset" => {
                    if let Ok((x, y)) = parse_pair(value)
                        && !matches!(placement, Placement::Location(..))
                    {
                        placement = Placement::Offset(x, y);
                    }
                }
                _ => {}
            }
        }

        match kind {
            "image" => {
                if let Some(path) = path {
                    self.gfx.push(GfxCommand::Image {
                        path,
                        placement,
                        scale,
                    });
                }
            }
            "box" => {
                if let (Some(color), Some(size)) = (color, size) {
                    self.gfx.push(GfxCommand::Box {
                        color,
                        size,
                        placement,
                    });
                }
            }
            _ => {}
        }
    }
}

fn param(params: &Params, index: usize, default: u16) -> u16 {
    let value = params
        .iter()
        .nth(index)
        .and_then(|group| group.first().copied())
        .unwrap_or(default);
    if value == 0 { default } else { value }
}

/// xterm 256-color index to RGB.
fn xterm_256(n: u8) -> u32 {
    match n {
        0..=15 => PALETTE[n as usize],
        16..=231 => {
            let n = n - 16;
            let scale = |v: u8| -> u32 {
                if v == 0 { 0 } else { 55 + 40 * v as u32 }
            };
            let r = scale(n / 36);
            let g = scale(n / 6 % 6);
            let b = scale(n % 6);
            r << 16 | g << 8 | b
        }
        _ => {
            let gray = 8 + 10 * (n - 232) as u32;
            gray << 16 | gray << 8 | gray
        }
    }
}

impl Perform for Screen {
    fn print(&mut self, c: char) {
        if self.pending_wrap && self.autowrap {
            self.cursor.0 = 0;
            self.linefeed();
        }
        let (col, row) = self.cursor;
        let attrs = self.current_attrs();
        self.set_cell(col, row, Some(c), attrs);
        if col + 1 < self.cols {
            self.cursor.0 = col + 1;
        } else {
            self.pending_wrap = true;
        }
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            0x08 => {
                self.cursor.0 = self.cursor.0.saturating_sub(1);
                self.pending_wrap = false;
            }
            0x09 => {
                let next = (self.cursor.0 / TAB_WIDTH + 1) * TAB_WIDTH;
                self.cursor.0 = next.min(self.cols - 1);
            }
            0x0A | 0x0B | 0x0C => self.linefeed(),
            0x0D => {
                self.cursor.0 = 0;
                self.pending_wrap = false;
            }
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        if intermediates.first() == Some(&b'?') {
            // Private modes: autowrap and cursor visibility.
            let mode = param(params, 0, 0);
            match (mode, action) {
                (7, 'h') => self.autowrap = true,
                (7, 'l') => self.autowrap = false,
                (25, 'h') => {
                    self.cursor_visible = true;
                    self.damage_all = true;
                }
                (25, 'l') => {
                    self.cursor_visible = false;
                    self.damage_all = true;
                }
                _ => {}
            }
            return;
        }

        match action {
            'A' => {
                let n = param(params, 0, 1) as usize;
                self.move_cursor(self.cursor.0, self.cursor.1.saturating_sub(n));
            }
            'B' => {
                let n = param(params, 0, 1) as usize;
                self.move_cursor(self.cursor.0, self.cursor.1 + n);
            }
            'C' => {
                let n = param(params, 0, 1) as usize;
                self.move_cursor(self.cursor.0 + n, self.cursor.1);
            }
            'D' => {
                let n = param(params, 0, 1) as usize;
                self.move_cursor(self.cursor.0.saturating_sub(n), self.cursor.1);
            }
            'E' => {
                let n = param(params, 0, 1) as usize;
                self.move_cursor(0, self.cursor.1 + n);
            }
            'F' => {
                let n = param(params, 0, 1) as usize;
                self.move_cursor(0, self.cursor.1.saturating_sub(n));
            }
            'G' | '`' => {
                let col = param(params, 0, 1) as usize - 1;
                self.move_cursor(col, self.cursor.1);
            }
            'd' => {
                let row = param(params, 0, 1) as usize - 1;
                self.move_cursor(self.cursor.0, row);
            }
            'H' | 'f' => {
                let row = param(params, 0, 1) as usize - 1;
                let col = param(params, 1, 1) as usize - 1;
                self.move_cursor(col, row);
            }
            'J' => match param(params, 0, 0) {
                1 => {
                    self.erase_region(0, 0, self.cols, self.cursor.1);
                    self.erase_region(0, self.cursor.1, self.cursor.0 + 1, self.cursor.1 + 1);
                }
                2 | 3 => {
                    self.erase_region(0, 0, self.cols, self.rows);
                }
                _ => {
                    self.erase_region(self.cursor.0, self.cursor.1, self.cols, self.cursor.1 + 1);
                    self.erase_region(0, self.cursor.1 + 1, self.cols, self.rows);
                }
            },
            'K' => match param(params, 0, 0) {
                1 => self.erase_region(0, self.cursor.1, self.cursor.0 + 1, self.cursor.1 + 1),
                2 => self.erase_region(0, self.cursor.1, self.cols, self.cursor.1 + 1),
                _ => self.erase_region(self.cursor.0, self.cursor.1, self.cols, self.cursor.1 + 1),
            },
            'L' => {
                if (self.scroll_top..self.scroll_bottom).contains(&self.cursor.1) {
                    let saved_top = self.scroll_top;
                    self.scroll_top = self.cursor.1;
                    self.scroll_down(param(params, 0, 1) as usize);
                    self.scroll_top = saved_top;
                }
            }
            'M' => {
                if (self.scroll_top..self.scroll_bottom).contains(&self.cursor.1) {
                    let saved_top = self.scroll_top;
                    self.scroll_top = self.cursor.1;
                    self.scroll_up(param(params, 0, 1) as usize, false);
                    self.scroll_top = saved_top;
                }
            }
            'P' => {
                let n = (param(params, 0, 1) as usize).min(self.cols - self.cursor.0);
                let (col, row) = self.cursor;
                for i in col..self.cols {
                    let src = i + n;
                    let cell = if src < self.cols {
                        self.cells[row * self.cols + src]
                    } else {
                        Cell {
                            ch: None,
                            attrs: self.default_attrs,
                            age: 0,
                        }
                    };
                    self.set_cell(i, row, cell.ch, cell.attrs);
                }
            }
            '@' => {
                let n = (param(params, 0, 1) as usize).min(self.cols - self.cursor.0);
                let (col, row) = self.cursor;
                for i in (col..self.cols).rev() {
                    let cell = if i >= col + n {
                        self.cells[row * self.cols + (i - n)]
                    } else {
                        Cell {
                            ch: None,
                            attrs: self.default_attrs,
                            age: 0,
                        }
                    };
                    self.set_cell(i, row, cell.ch, cell.attrs);
                }
            }
            'X' => {
                let n = (param(params, 0, 1) as usize).min(self.cols - self.cursor.0);
                self.erase_region(
                    self.cursor.0,
                    self.cursor.1,
                    self.cursor.0 + n,
                    self.cursor.1 + 1,
                );
            }
            'S' => self.scroll_up(param(params, 0, 1) as usize, false),
            'T' => self.scroll_down(param(params, 0, 1) as usize),
            'r' => {
                let top = param(params, 0, 1) as usize - 1;
                let bottom = param(params, 1, self.rows as u16) as usize;
                if top < bottom && bottom <= self.rows {
                    self.scroll_top = top;
                    self.scroll_bottom = bottom;
                    self.move_cursor(0, 0);
                }
            }
            'm' => self.apply_sgr(params),
            's' => self.saved_cursor = self.cursor,
            'u' => {
                let (col, row) = self.saved_cursor;
                self.move_cursor(col, row);
            }
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, byte: u8) {
        match byte {
            b'c' => self.reset_state(),
            b'7' => self.saved_cursor = self.cursor,
            b'8' => {
                let (col, row) = self.saved_cursor;
                self.move_cursor(col, row);
            }
            b'D' => self.linefeed(),
            b'M' => self.reverse_linefeed(),
            b'E' => {
                self.cursor.0 = 0;
                self.linefeed();
            }
            _ => {}
        }
    }

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        let payload: Vec<String> = params
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        let payload = payload.join(";");
        self.handle_osc(&payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(screen: &mut Screen, bytes: &[u8]) {
        let mut parser = vte::Parser::new();
        parser.advance(screen, bytes);
    }

    fn row_text(screen: &mut Screen, row: usize) -> String {
        let mut text = vec![' '; screen.cols()];
        screen.damage_all = true;
        screen.draw(0, |col, r, ch, _| {
            if r as usize == row
                && let Some(ch) = ch
            {
                text[col as usize] = ch;
            }
        });
        text.into_iter().collect()
    }

    #[test]
    fn print_and_wrap() {
        let mut screen = Screen::new(4, 3);
        feed(&mut screen, b"abcdef");
        assert_eq!(row_text(&mut screen, 0), "abcd");
        assert_eq!(row_text(&mut screen, 1), "ef  ");
        assert_eq!(screen.cursor(), (2, 1));
    }

    #[test]
    fn crlf_moves_to_next_line_start() {
        let mut screen = Screen::new(8, 3);
        feed(&mut screen, b"hi\r\nyo");
        assert_eq!(row_text(&mut screen, 0), "hi      ");
        assert_eq!(row_text(&mut screen, 1), "yo      ");
    }

    #[test]
    fn cursor_addressing_clamps() {
        let mut screen = Screen::new(10, 5);
        feed(&mut screen, b"\x1b[99;99H");
        assert_eq!(screen.cursor(), (9, 4));
        feed(&mut screen, b"\x1b[2;3H");
        assert_eq!(screen.cursor(), (2, 1));
    }

    #[test]
    fn erase_display_clears_cells() {
        let mut screen = Screen::new(4, 2);
        feed(&mut screen, b"abcdefgh");
        feed(&mut screen, b"\x1b[2J");
        assert_eq!(row_text(&mut screen, 0), "    ");
        assert_eq!(row_text(&mut screen, 1), "    ");
    }

    #[test]
    fn sgr_colors_and_inverse() {
        let mut screen = Screen::new(4, 1);
        feed(&mut screen, b"\x1b[31;7ma");
        let mut seen = None;
        screen.draw(0, |col, _, ch, attrs| {
            if col == 0 && ch == Some('a') {
                seen = Some(attrs);
            }
        });
        let attrs = seen.unwrap();
        assert_eq!(attrs.fg, 0xAA0000);
        assert!(attrs.inverse);
    }

    #[test]
    fn bold_brightens_base_colors() {
        let mut screen = Screen::new(4, 1);
        feed(&mut screen, b"\x1b[32;1mg");
        let mut fg = 0;
        screen.draw(0, |col, _, ch, attrs| {
            if col == 0 && ch == Some('g') {
                fg = attrs.fg;
            }
        });
        assert_eq!(fg, 0x55FF55);
    }

    #[test]
    fn palette_256_mapping() {
        assert_eq!(xterm_256(1), 0xAA0000);
        assert_eq!(xterm_256(16), 0x000000);
        assert_eq!(xterm_256(231), 0xFFFFFF);
        assert_eq!(xterm_256(232), 0x080808);
        assert_eq!(xterm_256(255), 0xEEEEEE);
    }

    #[test]
    fn scrollback_is_bounded() {
        let mut screen = Screen::new(4, 2);
        for i in 0..SCROLLBACK_LINES + 50 {
            feed(&mut screen, format!("{i}\r\n").as_bytes());
        }
        assert_eq!(screen.scrollback.len(), SCROLLBACK_LINES);
    }

    #[test]
    fn page_up_at_top_is_a_no_op() {
        let mut screen = Screen::new(4, 2);
        for i in 0..10 {
            feed(&mut screen, format!("{i}\r\n").as_bytes());
        }
        let max = screen.scrollback.len();
        for _ in 0..100 {
            screen.sb_page_up();
        }
        assert_eq!(screen.view_offset(), max);
        screen.sb_reset();
        assert_eq!(screen.view_offset(), 0);
    }

    #[test]
    fn scrolled_back_view_shows_history() {
        let mut screen = Screen::new(8, 2);
        feed(&mut screen, b"one\r\ntwo\r\nthree");
        screen.sb_line_up();
        assert_eq!(row_text(&mut screen, 0), "one     ");
        assert_eq!(row_text(&mut screen, 1), "two     ");
        screen.sb_line_down();
        assert_eq!(row_text(&mut screen, 0), "two     ");
    }

    #[test]
    fn incremental_draw_only_repaints_changes() {
        let mut screen = Screen::new(8, 2);
        feed(&mut screen, b"hello");
        let age = screen.draw(0, |_, _, _, _| {});

        feed(&mut screen, b"!");
        let mut painted = Vec::new();
        screen.draw(age, |col, row, ch, _| painted.push((col, row, ch)));
        // Only the new glyph plus the old/new cursor cells repaint.
        assert!(painted.iter().any(|&(col, _, ch)| col == 5 && ch == Some('!')));
        assert!(painted.len() <= 3, "painted {painted:?}");
    }

    #[test]
    fn scroll_region_insert_delete() {
        let mut screen = Screen::new(4, 4);
        feed(&mut screen, b"a\r\nb\r\nc\r\nd");
        feed(&mut screen, b"\x1b[2;3r\x1b[2;1H\x1b[M");
        assert_eq!(row_text(&mut screen, 0), "a   ");
        assert_eq!(row_text(&mut screen, 1), "c   ");
        assert_eq!(row_text(&mut screen, 2), "    ");
        assert_eq!(row_text(&mut screen, 3), "d   ");
    }

    #[test]
    fn resize_preserves_top_left() {
        let mut screen = Screen::new(6, 3);
        feed(&mut screen, b"abcdef\r\n123");
        screen.resize(4, 2);
        assert_eq!(row_text(&mut screen, 0), "abcd");
        assert_eq!(row_text(&mut screen, 1), "123 ");
        assert_eq!(screen.cols(), 4);
    }

    #[test]
    fn osc_image_commands_are_collected() {
        let mut screen = Screen::new(4, 2);
        feed(&mut screen, b"\x1b]image:file=/tmp/logo.png;location=10,20\x07");
        feed(&mut screen, b"\x1b]box:color=0xFF0000;size=32,8;offset=1,2\x07");
        let gfx = screen.take_gfx();
        assert_eq!(
            gfx,
            vec![
                GfxCommand::Image {
                    path: "/tmp/logo.png".into(),
                    placement: Placement::Location(10, 20),
                    scale: 1,
                },
                GfxCommand::Box {
                    color: 0xFF0000,
                    size: (32, 8),
                    placement: Placement::Offset(1, 2),
                },
            ]
        );
        assert!(screen.take_gfx().is_empty());
    }

    #[test]
    fn delete_and_insert_chars() {
        let mut screen = Screen::new(6, 1);
        feed(&mut screen, b"abcdef\x1b[1;2H\x1b[2P");
        assert_eq!(row_text(&mut screen, 0), "adef  ");
        feed(&mut screen, b"\x1b[1;2H\x1b[1@");
        assert_eq!(row_text(&mut screen, 0), "a def ");
    }
}
