//! Sparse, scrollback-aware mirror of the host terminal grid.
//!
//! Rows are keyed by absolute index in the host's global history and exist in
//! three states: `loaded` (cells known), `pending` (requested, awaiting a
//! backfill reply), and `missing` (never requested). Cell writes are gated on
//! the host sequence number unless the update is authoritative (snapshot or
//! backfill), which replaces whatever is present. `row` and `row_segment`
//! updates stamp each cell with `seq + column`, so a later single-cell delta
//! at the same nominal sequence still compares strictly greater and cell
//! sequences stay monotone per coordinate.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::protocol::{Seq, Update, unpack_cell};

/// Style attribute bits, matching the wire bitfield.
pub mod attrs {
    pub const BOLD: u8 = 1 << 0;
    pub const ITALIC: u8 = 1 << 1;
    pub const UNDERLINE: u8 = 1 << 2;
    pub const STRIKE: u8 = 1 << 3;
    pub const INVERSE: u8 = 1 << 4;
    pub const BLINK: u8 = 1 << 5;
    pub const DIM: u8 = 1 << 6;
    pub const HIDDEN: u8 = 1 << 7;
}

/// Decoded form of a packed 32-bit color: the high byte selects the mode,
/// the low 24 bits carry the color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedColor {
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl PackedColor {
    pub fn decode(packed: u32) -> Option<Self> {
        match (packed >> 24) as u8 {
            0 => Some(PackedColor::Default),
            1 => Some(PackedColor::Indexed((packed & 0xFF) as u8)),
            2 => Some(PackedColor::Rgb(
                ((packed >> 16) & 0xFF) as u8,
                ((packed >> 8) & 0xFF) as u8,
                (packed & 0xFF) as u8,
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub style_id: u32,
    pub seq: Seq,
}

impl Cell {
    pub const fn blank() -> Self {
        Self {
            ch: ' ',
            style_id: 0,
            seq: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleDefinition {
    pub fg: u32,
    pub bg: u32,
    pub attrs: u8,
    pub seq: Seq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedRow {
    pub cells: Vec<Cell>,
    pub latest_seq: Seq,
}

impl LoadedRow {
    fn new(cols: usize) -> Self {
        Self {
            cells: vec![Cell::blank(); cols.max(1)],
            latest_seq: 0,
        }
    }

    fn ensure_cols(&mut self, cols: usize) {
        if self.cells.len() < cols {
            self.cells.resize(cols, Cell::blank());
        }
    }

    pub fn text(&self) -> String {
        self.cells.iter().map(|cell| cell.ch).collect()
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Loaded(Arc<LoadedRow>),
    Pending,
    Missing,
}

/// A row as handed to renderers. `Missing` and `Pending` placeholders are
/// materialized by the visible-window query and are read-only by contract.
#[derive(Debug, Clone)]
pub enum Row {
    Loaded { absolute: u64, row: Arc<LoadedRow> },
    Pending { absolute: u64 },
    Missing { absolute: u64 },
}

impl Row {
    pub fn absolute(&self) -> u64 {
        match self {
            Row::Loaded { absolute, .. }
            | Row::Pending { absolute }
            | Row::Missing { absolute } => *absolute,
        }
    }

    pub fn text(&self) -> Option<String> {
        match self {
            Row::Loaded { row, .. } => Some(row.text()),
            _ => None,
        }
    }
}

/// Immutable view for observers; rows and styles are shared, not copied.
#[derive(Debug, Clone)]
pub struct GridSnapshot {
    pub base_row: u64,
    pub cols: u32,
    pub rows: Vec<Row>,
    pub styles: HashMap<u32, StyleDefinition>,
    pub follow_tail: bool,
    pub history_trimmed: bool,
    pub viewport_top: u64,
    pub viewport_height: u32,
    pub cursor_row: Option<u64>,
    pub cursor_col: Option<u32>,
}

pub struct GridStore {
    base_row: u64,
    cols: u32,
    history_rows: u32,
    rows: BTreeMap<u64, Slot>,
    styles: HashMap<u32, StyleDefinition>,
    viewport_top: u64,
    viewport_height: u32,
    follow_tail: bool,
    history_trimmed: bool,
    cursor: Option<(u64, u32)>,
}

impl Default for GridStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GridStore {
    pub fn new() -> Self {
        Self {
            base_row: 0,
            cols: 0,
            history_rows: 0,
            rows: BTreeMap::new(),
            styles: HashMap::new(),
            viewport_top: 0,
            viewport_height: 0,
            follow_tail: true,
            history_trimmed: false,
            cursor: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn base_row(&self) -> u64 {
        self.base_row
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn follow_tail(&self) -> bool {
        self.follow_tail
    }

    pub fn history_trimmed(&self) -> bool {
        self.history_trimmed
    }

    pub fn viewport(&self) -> (u64, u32) {
        (self.viewport_top, self.viewport_height)
    }

    /// One past the highest known absolute row.
    pub fn end_row(&self) -> u64 {
        self.rows
            .keys()
            .next_back()
            .map(|key| key + 1)
            .unwrap_or(self.base_row)
            .max(self.base_row)
    }

    /// Declares the absolute index of the first retained row. Raising the
    /// base discards everything below it.
    pub fn set_base_row(&mut self, base: u64) {
        if base > self.base_row {
            let dropped: Vec<u64> = self.rows.range(..base).map(|(key, _)| *key).collect();
            if !dropped.is_empty() {
                for key in dropped {
                    self.rows.remove(&key);
                }
                self.history_trimmed = true;
            }
        }
        self.base_row = base;
        self.clamp_viewport();
    }

    /// Fixes the column count and retained history depth. Shrinking history
    /// evicts the oldest rows.
    pub fn set_grid_size(&mut self, history_rows: u32, cols: u32) {
        self.cols = cols;
        self.history_rows = history_rows;
        if history_rows > 0 {
            let end = self.end_row();
            let span = end.saturating_sub(self.base_row);
            if span > history_rows as u64 {
                self.set_base_row(end - history_rows as u64);
            }
        }
        self.clamp_viewport();
    }

    /// Clamps the top to `[base_row, end_row]` and records the height.
    /// Pure with respect to row content.
    pub fn set_viewport(&mut self, top: u64, height: u32) {
        self.viewport_top = top;
        self.viewport_height = height;
        self.clamp_viewport();
    }

    pub fn set_follow_tail(&mut self, on: bool) {
        self.follow_tail = on;
    }

    pub fn set_cursor(&mut self, row: Option<u64>, col: Option<u32>) {
        self.cursor = match (row, col) {
            (Some(row), Some(col)) => Some((row, col)),
            _ => None,
        };
    }

    fn clamp_viewport(&mut self) {
        let max_top = self.end_row();
        self.viewport_top = self.viewport_top.clamp(self.base_row, max_top);
    }

    /// Applies updates in array order. Authoritative updates replace current
    /// content regardless of stored sequences; others must strictly exceed
    /// the per-cell sequence to win.
    pub fn apply_updates(&mut self, updates: &[Update], authoritative: bool) {
        for update in updates {
            match update {
                Update::Cell {
                    row,
                    col,
                    seq,
                    cell,
                } => {
                    self.write_cell(*row as u64, *col as usize, *seq, *cell, authoritative);
                }
                Update::Rect {
                    rows,
                    cols,
                    seq,
                    cell,
                } => {
                    for row in rows[0]..rows[1] {
                        for col in cols[0]..cols[1] {
                            self.write_cell(row as u64, col as usize, *seq, *cell, authoritative);
                        }
                    }
                }
                Update::Row { row, seq, cells } => {
                    self.write_row(*row as u64, *seq, cells, 0, true, authoritative);
                }
                Update::RowSegment {
                    row,
                    start_col,
                    seq,
                    cells,
                } => {
                    self.write_row(
                        *row as u64,
                        *seq,
                        cells,
                        *start_col as usize,
                        false,
                        authoritative,
                    );
                }
                Update::Trim { start, count, seq } => {
                    self.apply_trim(*start as u64, *count as u64, *seq);
                }
                Update::Style {
                    id,
                    seq,
                    fg,
                    bg,
                    attrs,
                } => {
                    self.apply_style(*id, *seq, *fg, *bg, *attrs, authoritative);
                }
            }
        }
    }

    fn loaded_row_mut(&mut self, absolute: u64, min_cols: usize) -> Option<&mut LoadedRow> {
        if absolute < self.base_row {
            return None;
        }
        if min_cols as u64 > self.cols as u64 {
            self.cols = min_cols as u32;
        }
        let cols = (self.cols as usize).max(min_cols);
        let slot = self
            .rows
            .entry(absolute)
            .or_insert_with(|| Slot::Loaded(Arc::new(LoadedRow::new(cols))));
        if !matches!(slot, Slot::Loaded(_)) {
            *slot = Slot::Loaded(Arc::new(LoadedRow::new(cols)));
        }
        let Slot::Loaded(row) = slot else {
            return None;
        };
        let row = Arc::make_mut(row);
        row.ensure_cols(cols);
        Some(row)
    }

    fn write_cell(&mut self, absolute: u64, col: usize, seq: Seq, cell: u64, authoritative: bool) {
        let Ok((ch, style_id)) = unpack_cell(cell) else {
            debug_assert!(false, "codec admitted an invalid cell");
            return;
        };
        let Some(row) = self.loaded_row_mut(absolute, col + 1) else {
            return;
        };
        let target = &mut row.cells[col];
        if authoritative || seq > target.seq {
            *target = Cell { ch, style_id, seq };
            row.latest_seq = row.latest_seq.max(seq);
        }
    }

    fn write_row(
        &mut self,
        absolute: u64,
        seq: Seq,
        cells: &[u64],
        start_col: usize,
        clear_rest: bool,
        authoritative: bool,
    ) {
        let min_cols = start_col + cells.len();
        let total_cols = (self.cols as usize).max(min_cols).max(1);
        let Some(row) = self.loaded_row_mut(absolute, total_cols) else {
            return;
        };
        let mut max_seq = row.latest_seq;
        for (offset, packed) in cells.iter().enumerate() {
            let Ok((ch, style_id)) = unpack_cell(*packed) else {
                debug_assert!(false, "codec admitted an invalid cell");
                continue;
            };
            let col = start_col + offset;
            let eff_seq = seq + col as u64;
            let target = &mut row.cells[col];
            if authoritative || eff_seq > target.seq {
                *target = Cell {
                    ch,
                    style_id,
                    seq: eff_seq,
                };
                max_seq = max_seq.max(eff_seq);
            }
        }
        if clear_rest {
            for col in min_cols..row.cells.len() {
                let eff_seq = seq + col as u64;
                let target = &mut row.cells[col];
                if authoritative || eff_seq > target.seq {
                    *target = Cell {
                        ch: ' ',
                        style_id: 0,
                        seq: eff_seq,
                    };
                    max_seq = max_seq.max(eff_seq);
                }
            }
        }
        row.latest_seq = max_seq;
    }

    fn apply_trim(&mut self, start: u64, count: u64, seq: Seq) {
        if count == 0 {
            return;
        }
        let end = start.saturating_add(count);
        let removed: Vec<u64> = self
            .rows
            .range(start..end)
            .map(|(key, _)| *key)
            .collect();
        let mut changed = !removed.is_empty();
        for key in removed {
            self.rows.remove(&key);
        }
        if end > self.base_row {
            self.set_base_row(end);
            changed = true;
        }
        if changed {
            self.history_trimmed = true;
            tracing::trace!(target = "client::grid", start, count, seq, "history trimmed");
        }
        self.clamp_viewport();
    }

    fn apply_style(&mut self, id: u32, seq: Seq, fg: u32, bg: u32, attrs: u8, authoritative: bool) {
        match self.styles.get_mut(&id) {
            Some(existing) if !authoritative && seq <= existing.seq => {}
            Some(existing) => {
                *existing = StyleDefinition { fg, bg, attrs, seq };
            }
            None => {
                self.styles
                    .insert(id, StyleDefinition { fg, bg, attrs, seq });
            }
        }
    }

    pub fn style(&self, id: u32) -> Option<&StyleDefinition> {
        self.styles.get(&id)
    }

    /// Marks unrequested rows in the range as awaiting a backfill reply.
    /// Loaded rows are untouched.
    pub fn mark_pending(&mut self, start: u64, count: u32) {
        for absolute in start..start.saturating_add(count as u64) {
            if absolute < self.base_row {
                continue;
            }
            let slot = self.rows.entry(absolute).or_insert(Slot::Missing);
            if matches!(slot, Slot::Missing) {
                *slot = Slot::Pending;
            }
        }
    }

    /// Reverts pending rows to missing, making them eligible for re-request.
    pub fn mark_missing(&mut self, start: u64, count: u32) {
        for absolute in start..start.saturating_add(count as u64) {
            if let Some(slot) = self.rows.get_mut(&absolute) {
                if matches!(slot, Slot::Pending) {
                    *slot = Slot::Missing;
                }
            }
        }
    }

    pub fn is_loaded(&self, absolute: u64) -> bool {
        matches!(self.rows.get(&absolute), Some(Slot::Loaded(_)))
    }

    fn is_missing(&self, absolute: u64) -> bool {
        match self.rows.get(&absolute) {
            None => true,
            Some(Slot::Missing) => true,
            Some(_) => false,
        }
    }

    /// First contiguous run of missing rows within `[start, end)`, as
    /// `(start, len)`. Pending rows break runs but are never included.
    pub fn first_missing_run(&self, start: u64, end: u64) -> Option<(u64, u32)> {
        let start = start.max(self.base_row);
        let mut run_start: Option<u64> = None;
        let mut len: u32 = 0;
        for absolute in start..end {
            if self.is_missing(absolute) {
                if run_start.is_none() {
                    run_start = Some(absolute);
                    len = 0;
                }
                len = len.saturating_add(1);
            } else if let Some(found) = run_start {
                return Some((found, len));
            }
        }
        run_start.map(|found| (found, len))
    }

    pub fn snapshot(&self) -> GridSnapshot {
        let rows = self
            .rows
            .iter()
            .map(|(absolute, slot)| match slot {
                Slot::Loaded(row) => Row::Loaded {
                    absolute: *absolute,
                    row: row.clone(),
                },
                Slot::Pending => Row::Pending {
                    absolute: *absolute,
                },
                Slot::Missing => Row::Missing {
                    absolute: *absolute,
                },
            })
            .collect();
        GridSnapshot {
            base_row: self.base_row,
            cols: self.cols,
            rows,
            styles: self.styles.clone(),
            follow_tail: self.follow_tail,
            history_trimmed: self.history_trimmed,
            viewport_top: self.viewport_top,
            viewport_height: self.viewport_height,
            cursor_row: self.cursor.map(|(row, _)| row),
            cursor_col: self.cursor.map(|(_, col)| col),
        }
    }

    fn tail_rows(&self, take: usize) -> Vec<Row> {
        let mut rows: Vec<Row> = self
            .rows
            .iter()
            .rev()
            .filter_map(|(absolute, slot)| match slot {
                Slot::Loaded(row) => Some(Row::Loaded {
                    absolute: *absolute,
                    row: row.clone(),
                }),
                _ => None,
            })
            .take(take)
            .collect();
        rows.reverse();
        rows
    }

    /// The ordered rows a renderer should draw, at most `limit` of them.
    ///
    /// Follow-tail pins to the most recent loaded rows; an unset viewport
    /// falls back to the tail; otherwise the viewport window is returned
    /// with `missing`/`pending` placeholders filling the gaps.
    pub fn visible_rows(&self, limit: usize) -> Vec<Row> {
        if self.follow_tail && self.viewport_height >= 1 {
            return self.tail_rows((self.viewport_height as usize).min(limit));
        }
        if self.viewport_height < 1 {
            return self.tail_rows(limit);
        }
        let span = (self.viewport_height as usize).min(limit) as u64;
        let mut rows = Vec::with_capacity(span as usize);
        for absolute in self.viewport_top..self.viewport_top.saturating_add(span) {
            let row = match self.rows.get(&absolute) {
                Some(Slot::Loaded(row)) => Row::Loaded {
                    absolute,
                    row: row.clone(),
                },
                Some(Slot::Pending) => Row::Pending { absolute },
                Some(Slot::Missing) | None => Row::Missing { absolute },
            };
            rows.push(row);
        }
        rows
    }

    /// Diagnostic row text with trailing whitespace trimmed.
    pub fn row_text(&self, absolute: u64) -> Option<String> {
        match self.rows.get(&absolute)? {
            Slot::Loaded(row) => Some(row.text().trim_end().to_string()),
            _ => None,
        }
    }
}
