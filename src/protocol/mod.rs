use serde::{Deserialize, Serialize};

pub mod wire;

pub use wire::{
    WireError, decode_client_frame, decode_host_frame, encode_client_frame, encode_host_frame,
};

/// Sequence number assigned by the host to every grid write.
pub type Seq = u64;

/// Categorical priority of snapshot traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Lane {
    Foreground = 0,
    Recent = 1,
    History = 2,
}

impl Lane {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Lane::Foreground),
            1 => Some(Lane::Recent),
            2 => Some(Lane::History),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneBudget {
    pub lane: Lane,
    pub max_updates: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub snapshot_budgets: Vec<LaneBudget>,
    pub delta_budget: u32,
    pub heartbeat_ms: u32,
    pub initial_snapshot_lines: u32,
}

/// One grid mutation carried by `snapshot`, `delta`, or `history_backfill`.
///
/// A `cell` value packs `code_point << 32 | style_id`; see [`pack_cell`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Update {
    Cell {
        row: u32,
        col: u32,
        seq: Seq,
        cell: u64,
    },
    Rect {
        rows: [u32; 2],
        cols: [u32; 2],
        seq: Seq,
        cell: u64,
    },
    Row {
        row: u32,
        seq: Seq,
        cells: Vec<u64>,
    },
    RowSegment {
        row: u32,
        start_col: u32,
        seq: Seq,
        cells: Vec<u64>,
    },
    Trim {
        start: u32,
        count: u32,
        seq: Seq,
    },
    Style {
        id: u32,
        seq: Seq,
        fg: u32,
        bg: u32,
        attrs: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    Heartbeat {
        seq: Seq,
        timestamp_ms: u64,
    },
    Hello {
        subscription: u64,
        max_seq: Seq,
        config: SyncConfig,
    },
    Grid {
        viewport_rows: u32,
        cols: u32,
        history_rows: u32,
        base_row: u64,
    },
    Snapshot {
        subscription: u64,
        lane: Lane,
        watermark: Seq,
        has_more: bool,
        updates: Vec<Update>,
    },
    SnapshotComplete {
        subscription: u64,
        lane: Lane,
    },
    Delta {
        subscription: u64,
        watermark: Seq,
        has_more: bool,
        updates: Vec<Update>,
    },
    HistoryBackfill {
        subscription: u64,
        request_id: u64,
        start_row: u64,
        count: u32,
        updates: Vec<Update>,
        more: bool,
    },
    InputAck {
        seq: Seq,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Input {
        seq: Seq,
        data: Vec<u8>,
    },
    Resize {
        cols: u32,
        rows: u32,
    },
    RequestBackfill {
        subscription: u64,
        request_id: u64,
        start_row: u64,
        count: u32,
    },
}

/// Packs a character and style id into the 64-bit wire cell.
pub fn pack_cell(ch: char, style_id: u32) -> u64 {
    ((ch as u32 as u64) << 32) | style_id as u64
}

/// Splits a wire cell; fails when the high word is not a Unicode scalar.
pub fn unpack_cell(cell: u64) -> Result<(char, u32), WireError> {
    let code_point = (cell >> 32) as u32;
    let style_id = cell as u32;
    let ch = char::from_u32(code_point)
        .ok_or(WireError::InvalidData("cell code point out of range"))?;
    Ok((ch, style_id))
}
