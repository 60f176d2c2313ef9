//! Binary layout of host and client frames.
//!
//! Every numeric field is fixed-width big-endian: sequences are `u64`,
//! row/col indices and lengths are `u32`, and each frame starts with a
//! one-byte discriminator. Decoding is strict: truncated buffers, unknown
//! tags, over-long length prefixes, and trailing bytes are all errors, so
//! `decode(encode(frame)) == frame` and `encode(decode(bytes)) == bytes`
//! hold for every well-formed value.

use super::{ClientFrame, HostFrame, Lane, LaneBudget, SyncConfig, Update};

const HOST_KIND_HEARTBEAT: u8 = 0x01;
const HOST_KIND_HELLO: u8 = 0x02;
const HOST_KIND_GRID: u8 = 0x03;
const HOST_KIND_SNAPSHOT: u8 = 0x04;
const HOST_KIND_SNAPSHOT_COMPLETE: u8 = 0x05;
const HOST_KIND_DELTA: u8 = 0x06;
const HOST_KIND_HISTORY_BACKFILL: u8 = 0x07;
const HOST_KIND_INPUT_ACK: u8 = 0x08;
const HOST_KIND_SHUTDOWN: u8 = 0x09;

const CLIENT_KIND_INPUT: u8 = 0x10;
const CLIENT_KIND_RESIZE: u8 = 0x11;
const CLIENT_KIND_REQUEST_BACKFILL: u8 = 0x12;

const UPDATE_KIND_CELL: u8 = 0x01;
const UPDATE_KIND_RECT: u8 = 0x02;
const UPDATE_KIND_ROW: u8 = 0x03;
const UPDATE_KIND_SEGMENT: u8 = 0x04;
const UPDATE_KIND_TRIM: u8 = 0x05;
const UPDATE_KIND_STYLE: u8 = 0x06;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),
    #[error("unknown update tag: {0:#04x}")]
    UnknownUpdateTag(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

pub fn encode_host_frame(frame: &HostFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    match frame {
        HostFrame::Heartbeat { seq, timestamp_ms } => {
            buf.push(HOST_KIND_HEARTBEAT);
            write_u64(&mut buf, *seq);
            write_u64(&mut buf, *timestamp_ms);
        }
        HostFrame::Hello {
            subscription,
            max_seq,
            config,
        } => {
            buf.push(HOST_KIND_HELLO);
            write_u64(&mut buf, *subscription);
            write_u64(&mut buf, *max_seq);
            encode_sync_config(&mut buf, config);
        }
        HostFrame::Grid {
            viewport_rows,
            cols,
            history_rows,
            base_row,
        } => {
            buf.push(HOST_KIND_GRID);
            write_u32(&mut buf, *viewport_rows);
            write_u32(&mut buf, *cols);
            write_u32(&mut buf, *history_rows);
            write_u64(&mut buf, *base_row);
        }
        HostFrame::Snapshot {
            subscription,
            lane,
            watermark,
            has_more,
            updates,
        } => {
            buf.push(HOST_KIND_SNAPSHOT);
            write_u64(&mut buf, *subscription);
            buf.push(lane.as_u8());
            write_u64(&mut buf, *watermark);
            buf.push(*has_more as u8);
            encode_updates(&mut buf, updates);
        }
        HostFrame::SnapshotComplete { subscription, lane } => {
            buf.push(HOST_KIND_SNAPSHOT_COMPLETE);
            write_u64(&mut buf, *subscription);
            buf.push(lane.as_u8());
        }
        HostFrame::Delta {
            subscription,
            watermark,
            has_more,
            updates,
        } => {
            buf.push(HOST_KIND_DELTA);
            write_u64(&mut buf, *subscription);
            write_u64(&mut buf, *watermark);
            buf.push(*has_more as u8);
            encode_updates(&mut buf, updates);
        }
        HostFrame::HistoryBackfill {
            subscription,
            request_id,
            start_row,
            count,
            updates,
            more,
        } => {
            buf.push(HOST_KIND_HISTORY_BACKFILL);
            write_u64(&mut buf, *subscription);
            write_u64(&mut buf, *request_id);
            write_u64(&mut buf, *start_row);
            write_u32(&mut buf, *count);
            encode_updates(&mut buf, updates);
            buf.push(*more as u8);
        }
        HostFrame::InputAck { seq } => {
            buf.push(HOST_KIND_INPUT_ACK);
            write_u64(&mut buf, *seq);
        }
        HostFrame::Shutdown => buf.push(HOST_KIND_SHUTDOWN),
    }
    buf
}

pub fn decode_host_frame(bytes: &[u8]) -> Result<HostFrame, WireError> {
    let mut cursor = Cursor::new(bytes);
    let kind = cursor.read_u8()?;
    let frame = match kind {
        HOST_KIND_HEARTBEAT => HostFrame::Heartbeat {
            seq: cursor.read_u64()?,
            timestamp_ms: cursor.read_u64()?,
        },
        HOST_KIND_HELLO => {
            let subscription = cursor.read_u64()?;
            let max_seq = cursor.read_u64()?;
            let config = decode_sync_config(&mut cursor)?;
            HostFrame::Hello {
                subscription,
                max_seq,
                config,
            }
        }
        HOST_KIND_GRID => HostFrame::Grid {
            viewport_rows: cursor.read_u32()?,
            cols: cursor.read_u32()?,
            history_rows: cursor.read_u32()?,
            base_row: cursor.read_u64()?,
        },
        HOST_KIND_SNAPSHOT => {
            let subscription = cursor.read_u64()?;
            let lane = decode_lane(&mut cursor)?;
            let watermark = cursor.read_u64()?;
            let has_more = cursor.read_bool()?;
            let updates = decode_updates(&mut cursor)?;
            HostFrame::Snapshot {
                subscription,
                lane,
                watermark,
                has_more,
                updates,
            }
        }
        HOST_KIND_SNAPSHOT_COMPLETE => HostFrame::SnapshotComplete {
            subscription: cursor.read_u64()?,
            lane: decode_lane(&mut cursor)?,
        },
        HOST_KIND_DELTA => {
            let subscription = cursor.read_u64()?;
            let watermark = cursor.read_u64()?;
            let has_more = cursor.read_bool()?;
            let updates = decode_updates(&mut cursor)?;
            HostFrame::Delta {
                subscription,
                watermark,
                has_more,
                updates,
            }
        }
        HOST_KIND_HISTORY_BACKFILL => {
            let subscription = cursor.read_u64()?;
            let request_id = cursor.read_u64()?;
            let start_row = cursor.read_u64()?;
            let count = cursor.read_u32()?;
            let updates = decode_updates(&mut cursor)?;
            let more = cursor.read_bool()?;
            HostFrame::HistoryBackfill {
                subscription,
                request_id,
                start_row,
                count,
                updates,
                more,
            }
        }
        HOST_KIND_INPUT_ACK => HostFrame::InputAck {
            seq: cursor.read_u64()?,
        },
        HOST_KIND_SHUTDOWN => HostFrame::Shutdown,
        other => return Err(WireError::UnknownFrameType(other)),
    };
    cursor.finish()?;
    Ok(frame)
}

pub fn encode_client_frame(frame: &ClientFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    match frame {
        ClientFrame::Input { seq, data } => {
            buf.push(CLIENT_KIND_INPUT);
            write_u64(&mut buf, *seq);
            write_u32(&mut buf, data.len() as u32);
            buf.extend_from_slice(data);
        }
        ClientFrame::Resize { cols, rows } => {
            buf.push(CLIENT_KIND_RESIZE);
            write_u32(&mut buf, *cols);
            write_u32(&mut buf, *rows);
        }
        ClientFrame::RequestBackfill {
            subscription,
            request_id,
            start_row,
            count,
        } => {
            buf.push(CLIENT_KIND_REQUEST_BACKFILL);
            write_u64(&mut buf, *subscription);
            write_u64(&mut buf, *request_id);
            write_u64(&mut buf, *start_row);
            write_u32(&mut buf, *count);
        }
    }
    buf
}

pub fn decode_client_frame(bytes: &[u8]) -> Result<ClientFrame, WireError> {
    let mut cursor = Cursor::new(bytes);
    let kind = cursor.read_u8()?;
    let frame = match kind {
        CLIENT_KIND_INPUT => {
            let seq = cursor.read_u64()?;
            let len = cursor.read_u32()? as usize;
            let data = cursor.read_bytes(len)?.to_vec();
            ClientFrame::Input { seq, data }
        }
        CLIENT_KIND_RESIZE => ClientFrame::Resize {
            cols: cursor.read_u32()?,
            rows: cursor.read_u32()?,
        },
        CLIENT_KIND_REQUEST_BACKFILL => ClientFrame::RequestBackfill {
            subscription: cursor.read_u64()?,
            request_id: cursor.read_u64()?,
            start_row: cursor.read_u64()?,
            count: cursor.read_u32()?,
        },
        other => return Err(WireError::UnknownFrameType(other)),
    };
    cursor.finish()?;
    Ok(frame)
}

fn encode_updates(buf: &mut Vec<u8>, updates: &[Update]) {
    write_u32(buf, updates.len() as u32);
    for update in updates {
        match update {
            Update::Cell {
                row,
                col,
                seq,
                cell,
            } => {
                buf.push(UPDATE_KIND_CELL);
                write_u32(buf, *row);
                write_u32(buf, *col);
                write_u64(buf, *seq);
                write_u64(buf, *cell);
            }
            Update::Rect {
                rows,
                cols,
                seq,
                cell,
            } => {
                buf.push(UPDATE_KIND_RECT);
                write_u32(buf, rows[0]);
                write_u32(buf, rows[1]);
                write_u32(buf, cols[0]);
                write_u32(buf, cols[1]);
                write_u64(buf, *seq);
                write_u64(buf, *cell);
            }
            Update::Row { row, seq, cells } => {
                buf.push(UPDATE_KIND_ROW);
                write_u32(buf, *row);
                write_u64(buf, *seq);
                write_u32(buf, cells.len() as u32);
                for cell in cells {
                    write_u64(buf, *cell);
                }
            }
            Update::RowSegment {
                row,
                start_col,
                seq,
                cells,
            } => {
                buf.push(UPDATE_KIND_SEGMENT);
                write_u32(buf, *row);
                write_u32(buf, *start_col);
                write_u64(buf, *seq);
                write_u32(buf, cells.len() as u32);
                for cell in cells {
                    write_u64(buf, *cell);
                }
            }
            Update::Trim { start, count, seq } => {
                buf.push(UPDATE_KIND_TRIM);
                write_u32(buf, *start);
                write_u32(buf, *count);
                write_u64(buf, *seq);
            }
            Update::Style {
                id,
                seq,
                fg,
                bg,
                attrs,
            } => {
                buf.push(UPDATE_KIND_STYLE);
                write_u32(buf, *id);
                write_u64(buf, *seq);
                write_u32(buf, *fg);
                write_u32(buf, *bg);
                write_u32(buf, u32::from(*attrs));
            }
        }
    }
}

fn decode_updates(cursor: &mut Cursor<'_>) -> Result<Vec<Update>, WireError> {
    let count = cursor.read_u32()? as usize;
    // An update is at least five bytes; a count implying more data than the
    // buffer holds is corrupt, not merely short.
    if count > cursor.remaining() {
        return Err(WireError::InvalidData("update count exceeds buffer"));
    }
    let mut updates = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = cursor.read_u8()?;
        let update = match tag {
            UPDATE_KIND_CELL => Update::Cell {
                row: cursor.read_u32()?,
                col: cursor.read_u32()?,
                seq: cursor.read_u64()?,
                cell: cursor.read_cell()?,
            },
            UPDATE_KIND_RECT => Update::Rect {
                rows: [cursor.read_u32()?, cursor.read_u32()?],
                cols: [cursor.read_u32()?, cursor.read_u32()?],
                seq: cursor.read_u64()?,
                cell: cursor.read_cell()?,
            },
            UPDATE_KIND_ROW => {
                let row = cursor.read_u32()?;
                let seq = cursor.read_u64()?;
                let cells = decode_cells(cursor)?;
                Update::Row { row, seq, cells }
            }
            UPDATE_KIND_SEGMENT => {
                let row = cursor.read_u32()?;
                let start_col = cursor.read_u32()?;
                let seq = cursor.read_u64()?;
                let cells = decode_cells(cursor)?;
                Update::RowSegment {
                    row,
                    start_col,
                    seq,
                    cells,
                }
            }
            UPDATE_KIND_TRIM => Update::Trim {
                start: cursor.read_u32()?,
                count: cursor.read_u32()?,
                seq: cursor.read_u64()?,
            },
            UPDATE_KIND_STYLE => {
                let id = cursor.read_u32()?;
                let seq = cursor.read_u64()?;
                let fg = cursor.read_u32()?;
                let bg = cursor.read_u32()?;
                let attrs = cursor.read_u32()?;
                let attrs = u8::try_from(attrs)
                    .map_err(|_| WireError::InvalidData("style attrs out of range"))?;
                Update::Style {
                    id,
                    seq,
                    fg,
                    bg,
                    attrs,
                }
            }
            other => return Err(WireError::UnknownUpdateTag(other)),
        };
        updates.push(update);
    }
    Ok(updates)
}

fn decode_cells(cursor: &mut Cursor<'_>) -> Result<Vec<u64>, WireError> {
    let len = cursor.read_u32()? as usize;
    if len.saturating_mul(8) > cursor.remaining() {
        return Err(WireError::InvalidData("cell count exceeds buffer"));
    }
    let mut cells = Vec::with_capacity(len);
    for _ in 0..len {
        cells.push(cursor.read_cell()?);
    }
    Ok(cells)
}

fn encode_sync_config(buf: &mut Vec<u8>, config: &SyncConfig) {
    write_u32(buf, config.snapshot_budgets.len() as u32);
    for LaneBudget { lane, max_updates } in &config.snapshot_budgets {
        buf.push(lane.as_u8());
        write_u32(buf, *max_updates);
    }
    write_u32(buf, config.delta_budget);
    write_u32(buf, config.heartbeat_ms);
    write_u32(buf, config.initial_snapshot_lines);
}

fn decode_sync_config(cursor: &mut Cursor<'_>) -> Result<SyncConfig, WireError> {
    let count = cursor.read_u32()? as usize;
    if count > cursor.remaining() {
        return Err(WireError::InvalidData("budget count exceeds buffer"));
    }
    let mut budgets = Vec::with_capacity(count);
    for _ in 0..count {
        let lane = decode_lane(cursor)?;
        let max_updates = cursor.read_u32()?;
        budgets.push(LaneBudget { lane, max_updates });
    }
    Ok(SyncConfig {
        snapshot_budgets: budgets,
        delta_budget: cursor.read_u32()?,
        heartbeat_ms: cursor.read_u32()?,
        initial_snapshot_lines: cursor.read_u32()?,
    })
}

fn decode_lane(cursor: &mut Cursor<'_>) -> Result<Lane, WireError> {
    let byte = cursor.read_u8()?;
    Lane::from_u8(byte).ok_or(WireError::InvalidData("invalid lane"))
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        if self.pos >= self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let slice = self.read_bytes(4)?;
        Ok(u32::from_be_bytes(slice.try_into().expect("4 bytes")))
    }

    fn read_u64(&mut self) -> Result<u64, WireError> {
        let slice = self.read_bytes(8)?;
        Ok(u64::from_be_bytes(slice.try_into().expect("8 bytes")))
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidData("invalid boolean")),
        }
    }

    fn read_cell(&mut self) -> Result<u64, WireError> {
        let cell = self.read_u64()?;
        if char::from_u32((cell >> 32) as u32).is_none() {
            return Err(WireError::InvalidData("cell code point out of range"));
        }
        Ok(cell)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn finish(&self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(WireError::TrailingBytes(extra)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pack_cell;

    fn round_trip_host(frame: HostFrame) {
        let encoded = encode_host_frame(&frame);
        let decoded = decode_host_frame(&encoded).expect("decode");
        assert_eq!(frame, decoded);
        assert_eq!(encode_host_frame(&decoded), encoded);
    }

    #[test]
    fn encode_decode_heartbeat() {
        round_trip_host(HostFrame::Heartbeat {
            seq: 42,
            timestamp_ms: 1234,
        });
    }

    #[test]
    fn encode_decode_hello() {
        round_trip_host(HostFrame::Hello {
            subscription: 7,
            max_seq: 9000,
            config: SyncConfig {
                snapshot_budgets: vec![
                    LaneBudget {
                        lane: Lane::Foreground,
                        max_updates: 8,
                    },
                    LaneBudget {
                        lane: Lane::History,
                        max_updates: 16,
                    },
                ],
                delta_budget: 128,
                heartbeat_ms: 250,
                initial_snapshot_lines: 8,
            },
        });
    }

    #[test]
    fn encode_decode_grid() {
        round_trip_host(HostFrame::Grid {
            viewport_rows: 24,
            cols: 80,
            history_rows: 5000,
            base_row: 1190,
        });
    }

    #[test]
    fn encode_decode_snapshot_with_updates() {
        round_trip_host(HostFrame::Snapshot {
            subscription: 1,
            lane: Lane::Foreground,
            watermark: 55,
            has_more: true,
            updates: vec![
                Update::Cell {
                    row: 3,
                    col: 4,
                    seq: 10,
                    cell: pack_cell('x', 2),
                },
                Update::Row {
                    row: 5,
                    seq: 12,
                    cells: vec![pack_cell('a', 0), pack_cell('b', 0)],
                },
                Update::RowSegment {
                    row: 6,
                    start_col: 2,
                    seq: 13,
                    cells: vec![pack_cell('!', 1); 4],
                },
                Update::Style {
                    id: 7,
                    seq: 14,
                    fg: 0x0100_00FF,
                    bg: 0x0200_33AA,
                    attrs: 0b1010_1010,
                },
                Update::Trim {
                    start: 1,
                    count: 2,
                    seq: 15,
                },
            ],
        });
    }

    #[test]
    fn encode_decode_history_backfill() {
        round_trip_host(HostFrame::HistoryBackfill {
            subscription: 4,
            request_id: 2,
            start_row: 5,
            count: 2,
            updates: vec![Update::Rect {
                rows: [5, 7],
                cols: [0, 80],
                seq: 1,
                cell: pack_cell(' ', 0),
            }],
            more: true,
        });
    }

    #[test]
    fn encode_decode_client_frames() {
        for frame in [
            ClientFrame::Input {
                seq: 99,
                data: vec![1, 2, 3, 4],
            },
            ClientFrame::Resize { cols: 80, rows: 24 },
            ClientFrame::RequestBackfill {
                subscription: 3,
                request_id: 17,
                start_row: 4096,
                count: 512,
            },
        ] {
            let encoded = encode_client_frame(&frame);
            let decoded = decode_client_frame(&encoded).expect("decode");
            assert_eq!(frame, decoded);
            assert_eq!(encode_client_frame(&decoded), encoded);
        }
    }

    #[test]
    fn truncated_input_is_rejected() {
        let encoded = encode_host_frame(&HostFrame::InputAck { seq: 7 });
        for len in 0..encoded.len() {
            assert_eq!(
                decode_host_frame(&encoded[..len]),
                Err(WireError::UnexpectedEof),
                "prefix of {len} bytes should not decode"
            );
        }
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        assert_eq!(
            decode_host_frame(&[0x7F]),
            Err(WireError::UnknownFrameType(0x7F))
        );
        assert_eq!(
            decode_client_frame(&[0x02]),
            Err(WireError::UnknownFrameType(0x02))
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = encode_host_frame(&HostFrame::Shutdown);
        encoded.push(0x00);
        assert_eq!(decode_host_frame(&encoded), Err(WireError::TrailingBytes(1)));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        // Input frame claiming 1024 payload bytes but carrying none.
        let mut bytes = vec![CLIENT_KIND_INPUT];
        bytes.extend_from_slice(&1u64.to_be_bytes());
        bytes.extend_from_slice(&1024u32.to_be_bytes());
        assert_eq!(decode_client_frame(&bytes), Err(WireError::UnexpectedEof));
    }

    #[test]
    fn invalid_cell_code_point_is_rejected() {
        let frame = HostFrame::Delta {
            subscription: 1,
            watermark: 2,
            has_more: false,
            updates: vec![Update::Cell {
                row: 0,
                col: 0,
                seq: 3,
                cell: 0xD800u64 << 32,
            }],
        };
        let encoded = encode_host_frame(&frame);
        assert_eq!(
            decode_host_frame(&encoded),
            Err(WireError::InvalidData("cell code point out of range"))
        );
    }
}
