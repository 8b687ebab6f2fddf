//! On-disk node blocks for the history tree.
//!
//! The history file is a header followed by fixed-size node blocks,
//! appended in seal order. Each block carries a self-describing header
//! (`node_id`, `parent_id`, time range, interval count, payload length,
//! CRC32 of the payload) and a packed array of interval records.
//!
//! Interval record layout, little-endian:
//!
//! ```text
//! quark(4) start(8) end(8) value_tag(1) value_bytes(..)
//! ```

use crate::error::{Result, StateError};
use crate::types::{Interval, Quark, StateValue, Timestamp};

/// Magic bytes identifying a state history file.
pub const FILE_MAGIC: &[u8; 4] = b"SHT\0";

/// Current file format version. Written once at creation, checked on open.
pub const FILE_VERSION: u8 = 1;

/// File header: magic + version + reserved + block size + max children
/// + history start time.
pub const FILE_HEADER_SIZE: usize = 4 + 1 + 3 + 4 + 4 + 8;

/// Node block header: node_id + parent_id + min_start + max_end
/// + interval_count + data_len + checksum.
pub const NODE_HEADER_SIZE: usize = 4 + 4 + 8 + 8 + 4 + 4 + 4;

/// Parent id of a root node.
pub const NO_PARENT: i32 = -1;

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_STR: u8 = 4;

/// Bytes one interval record occupies inside a node's payload section.
pub fn record_size(interval: &Interval) -> usize {
    let value_size = match &interval.value {
        StateValue::Null => 0,
        StateValue::Int(_) => 4,
        StateValue::Long(_) | StateValue::Double(_) => 8,
        StateValue::Str(s) => 2 + s.len(),
    };
    4 + 8 + 8 + 1 + value_size
}

/// One node of the history tree.
///
/// While open (building), the node accumulates intervals and its end time
/// is unbounded; sealing fixes the end and makes the node eligible for
/// flushing. A flushed node is never rewritten.
#[derive(Debug, Clone)]
pub struct HtNode {
    pub node_id: u32,
    pub parent_id: i32,
    /// Earliest timestamp this node covers.
    pub start: Timestamp,
    /// Latest timestamp this node covers. Only meaningful once sealed.
    pub end: Timestamp,
    /// Intervals in this node, sorted by end time.
    pub intervals: Vec<Interval>,
    data_size: usize,
    /// Children linked under this node so far. Writer-side bookkeeping,
    /// not serialized; readers rebuild child links from parent ids.
    pub child_count: u32,
    sealed: bool,
}

impl HtNode {
    pub fn new(node_id: u32, parent_id: i32, start: Timestamp) -> Self {
        Self {
            node_id,
            parent_id,
            start,
            end: start,
            intervals: Vec::new(),
            data_size: 0,
            child_count: 0,
            sealed: false,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Payload bytes still available in a block of `block_size`.
    pub fn free_space(&self, block_size: usize) -> usize {
        block_size - NODE_HEADER_SIZE - self.data_size
    }

    /// Whether this node's time range covers `t`. An open node extends to
    /// infinity on the right.
    pub fn covers(&self, t: Timestamp) -> bool {
        self.start <= t && (!self.sealed || t <= self.end)
    }

    /// Add an interval, keeping the list sorted by end time. The caller
    /// has already checked free space and time fit.
    pub fn add(&mut self, interval: Interval) {
        self.data_size += record_size(&interval);
        if interval.end > self.end {
            self.end = interval.end;
        }
        let idx = self
            .intervals
            .partition_point(|iv| iv.end <= interval.end);
        self.intervals.insert(idx, interval);
    }

    /// Fix the node's end time. Called when the node is split off or the
    /// whole tree is closed.
    pub fn seal(&mut self, end: Timestamp) {
        debug_assert!(end >= self.end, "sealing before the last interval end");
        self.end = end;
        self.sealed = true;
    }

    /// Find the interval covering `t` for `quark` in this node, if any.
    pub fn find(&self, quark: Quark, t: Timestamp) -> Option<&Interval> {
        // Records are sorted by end: everything before the partition point
        // ends before t and cannot cover it.
        let from = self.intervals.partition_point(|iv| iv.end < t);
        self.intervals[from..]
            .iter()
            .find(|iv| iv.quark == quark && iv.contains(t))
    }

    /// Serialize into one full zero-padded block.
    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.data_size);
        for iv in &self.intervals {
            encode_record(&mut data, iv);
        }
        debug_assert_eq!(data.len(), self.data_size);

        if NODE_HEADER_SIZE + data.len() > block_size {
            return Err(StateError::InvalidFormat(format!(
                "node {} payload ({} bytes) exceeds block size {}",
                self.node_id,
                data.len(),
                block_size
            )));
        }

        let mut block = vec![0u8; block_size];
        block[0..4].copy_from_slice(&self.node_id.to_le_bytes());
        block[4..8].copy_from_slice(&self.parent_id.to_le_bytes());
        block[8..16].copy_from_slice(&self.start.0.to_le_bytes());
        block[16..24].copy_from_slice(&self.end.0.to_le_bytes());
        block[24..28].copy_from_slice(&(self.intervals.len() as u32).to_le_bytes());
        block[28..32].copy_from_slice(&(data.len() as u32).to_le_bytes());
        block[32..36].copy_from_slice(&crc32fast::hash(&data).to_le_bytes());
        block[NODE_HEADER_SIZE..NODE_HEADER_SIZE + data.len()].copy_from_slice(&data);
        Ok(block)
    }

    /// Deserialize a node from one full block, verifying its checksum and
    /// self-description.
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < NODE_HEADER_SIZE {
            return Err(StateError::InvalidFormat(
                "block smaller than node header".into(),
            ));
        }

        let node_id = u32::from_le_bytes(block[0..4].try_into().unwrap());
        let parent_id = i32::from_le_bytes(block[4..8].try_into().unwrap());
        let start = Timestamp(i64::from_le_bytes(block[8..16].try_into().unwrap()));
        let end = Timestamp(i64::from_le_bytes(block[16..24].try_into().unwrap()));
        let interval_count = u32::from_le_bytes(block[24..28].try_into().unwrap()) as usize;
        let data_len = u32::from_le_bytes(block[28..32].try_into().unwrap()) as usize;
        let checksum = u32::from_le_bytes(block[32..36].try_into().unwrap());

        let corrupt = |reason: String| StateError::CorruptNode { node_id, reason };

        if start > end {
            return Err(corrupt(format!("time range {start}..{end} is inverted")));
        }
        if NODE_HEADER_SIZE + data_len > block.len() {
            return Err(corrupt(format!(
                "payload length {data_len} exceeds block size"
            )));
        }
        let data = &block[NODE_HEADER_SIZE..NODE_HEADER_SIZE + data_len];
        let computed = crc32fast::hash(data);
        if computed != checksum {
            return Err(corrupt(format!(
                "checksum mismatch: stored {checksum:#010x}, computed {computed:#010x}"
            )));
        }

        let mut intervals = Vec::with_capacity(interval_count);
        let mut pos = 0usize;
        for _ in 0..interval_count {
            let (interval, used) = decode_record(&data[pos..])
                .map_err(|reason| corrupt(format!("record at offset {pos}: {reason}")))?;
            pos += used;
            intervals.push(interval);
        }
        if pos != data_len {
            return Err(corrupt(format!(
                "payload length mismatch: described {data_len}, decoded {pos}"
            )));
        }

        Ok(Self {
            node_id,
            parent_id,
            start,
            end,
            intervals,
            data_size: data_len,
            child_count: 0,
            sealed: true,
        })
    }
}

fn encode_record(out: &mut Vec<u8>, interval: &Interval) {
    out.extend_from_slice(&interval.quark.0.to_le_bytes());
    out.extend_from_slice(&interval.start.0.to_le_bytes());
    out.extend_from_slice(&interval.end.0.to_le_bytes());
    match &interval.value {
        StateValue::Null => out.push(TAG_NULL),
        StateValue::Int(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&v.to_le_bytes());
        }
        StateValue::Long(v) => {
            out.push(TAG_LONG);
            out.extend_from_slice(&v.to_le_bytes());
        }
        StateValue::Double(v) => {
            out.push(TAG_DOUBLE);
            out.extend_from_slice(&v.to_le_bytes());
        }
        StateValue::Str(s) => {
            out.push(TAG_STR);
            out.extend_from_slice(&(s.len() as u16).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
    }
}

fn decode_record(data: &[u8]) -> std::result::Result<(Interval, usize), String> {
    const FIXED: usize = 4 + 8 + 8 + 1;
    if data.len() < FIXED {
        return Err("record header past end of payload".into());
    }
    let quark = Quark(u32::from_le_bytes(data[0..4].try_into().unwrap()));
    let start = Timestamp(i64::from_le_bytes(data[4..12].try_into().unwrap()));
    let end = Timestamp(i64::from_le_bytes(data[12..20].try_into().unwrap()));
    let tag = data[20];
    let rest = &data[FIXED..];

    let (value, used) = match tag {
        TAG_NULL => (StateValue::Null, 0),
        TAG_INT => {
            let bytes: [u8; 4] = rest
                .get(0..4)
                .ok_or("int value past end of payload")?
                .try_into()
                .unwrap();
            (StateValue::Int(i32::from_le_bytes(bytes)), 4)
        }
        TAG_LONG => {
            let bytes: [u8; 8] = rest
                .get(0..8)
                .ok_or("long value past end of payload")?
                .try_into()
                .unwrap();
            (StateValue::Long(i64::from_le_bytes(bytes)), 8)
        }
        TAG_DOUBLE => {
            let bytes: [u8; 8] = rest
                .get(0..8)
                .ok_or("double value past end of payload")?
                .try_into()
                .unwrap();
            (StateValue::Double(f64::from_le_bytes(bytes)), 8)
        }
        TAG_STR => {
            let len_bytes: [u8; 2] = rest
                .get(0..2)
                .ok_or("string length past end of payload")?
                .try_into()
                .unwrap();
            let len = u16::from_le_bytes(len_bytes) as usize;
            let bytes = rest
                .get(2..2 + len)
                .ok_or("string value past end of payload")?;
            let s = std::str::from_utf8(bytes).map_err(|e| format!("invalid utf-8: {e}"))?;
            (StateValue::Str(s.to_string()), 2 + len)
        }
        other => return Err(format!("unknown value tag {other}")),
    };

    if start > end {
        return Err(format!("interval range {start}..{end} is inverted"));
    }
    Ok((Interval::new(quark, start, end, value), FIXED + used))
}

/// Serialize the file header.
pub fn encode_file_header(block_size: u32, max_children: u32, start: Timestamp) -> Vec<u8> {
    let mut header = vec![0u8; FILE_HEADER_SIZE];
    header[0..4].copy_from_slice(FILE_MAGIC);
    header[4] = FILE_VERSION;
    // bytes 5..8 reserved
    header[8..12].copy_from_slice(&block_size.to_le_bytes());
    header[12..16].copy_from_slice(&max_children.to_le_bytes());
    header[16..24].copy_from_slice(&start.0.to_le_bytes());
    header
}

/// Parsed file header fields.
pub struct FileHeader {
    pub block_size: u32,
    pub max_children: u32,
    pub start: Timestamp,
}

/// Parse and validate the file header.
pub fn decode_file_header(header: &[u8]) -> Result<FileHeader> {
    if header.len() < FILE_HEADER_SIZE {
        return Err(StateError::InvalidFormat("file shorter than header".into()));
    }
    if &header[0..4] != FILE_MAGIC {
        return Err(StateError::InvalidFormat("bad magic bytes".into()));
    }
    if header[4] != FILE_VERSION {
        return Err(StateError::UnsupportedFormatVersion {
            got: header[4],
            expected: FILE_VERSION,
        });
    }
    let block_size = u32::from_le_bytes(header[8..12].try_into().unwrap());
    let max_children = u32::from_le_bytes(header[12..16].try_into().unwrap());
    if block_size as usize <= NODE_HEADER_SIZE {
        return Err(StateError::InvalidFormat(format!(
            "block size {block_size} too small"
        )));
    }
    Ok(FileHeader {
        block_size,
        max_children,
        start: Timestamp(i64::from_le_bytes(header[16..24].try_into().unwrap())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_intervals() -> Vec<Interval> {
        vec![
            Interval::new(Quark(0), Timestamp(0), Timestamp(9), StateValue::Int(1)),
            Interval::new(Quark(1), Timestamp(0), Timestamp(14), StateValue::Null),
            Interval::new(
                Quark(0),
                Timestamp(10),
                Timestamp(20),
                StateValue::Str("running".into()),
            ),
            Interval::new(Quark(2), Timestamp(5), Timestamp(20), StateValue::Double(0.5)),
        ]
    }

    #[test]
    fn test_node_roundtrip() {
        let mut node = HtNode::new(3, 1, Timestamp(0));
        for iv in sample_intervals() {
            node.add(iv);
        }
        node.seal(Timestamp(25));

        let block = node.encode(4096).unwrap();
        assert_eq!(block.len(), 4096);
        let decoded = HtNode::decode(&block).unwrap();
        assert_eq!(decoded.node_id, 3);
        assert_eq!(decoded.parent_id, 1);
        assert_eq!(decoded.start, Timestamp(0));
        assert_eq!(decoded.end, Timestamp(25));
        assert_eq!(decoded.intervals, node.intervals);
    }

    #[test]
    fn test_intervals_sorted_by_end() {
        let mut node = HtNode::new(0, NO_PARENT, Timestamp(0));
        for iv in sample_intervals() {
            node.add(iv);
        }
        let ends: Vec<i64> = node.intervals.iter().map(|iv| iv.end.0).collect();
        let mut sorted = ends.clone();
        sorted.sort_unstable();
        assert_eq!(ends, sorted);
    }

    #[test]
    fn test_find_filters_by_quark_and_time() {
        let mut node = HtNode::new(0, NO_PARENT, Timestamp(0));
        for iv in sample_intervals() {
            node.add(iv);
        }
        let found = node.find(Quark(0), Timestamp(12)).unwrap();
        assert_eq!(found.value, StateValue::Str("running".into()));
        assert!(node.find(Quark(0), Timestamp(21)).is_none());
        assert!(node.find(Quark(9), Timestamp(5)).is_none());
    }

    #[test]
    fn test_corrupt_checksum_detected() {
        let mut node = HtNode::new(7, NO_PARENT, Timestamp(0));
        for iv in sample_intervals() {
            node.add(iv);
        }
        node.seal(Timestamp(25));
        let mut block = node.encode(4096).unwrap();
        // Flip one payload byte.
        block[NODE_HEADER_SIZE + 2] ^= 0xff;
        let result = HtNode::decode(&block);
        assert!(matches!(
            result,
            Err(StateError::CorruptNode { node_id: 7, .. })
        ));
    }

    #[test]
    fn test_file_header_roundtrip() {
        let header = encode_file_header(65536, 50, Timestamp(1000));
        let parsed = decode_file_header(&header).unwrap();
        assert_eq!(parsed.block_size, 65536);
        assert_eq!(parsed.max_children, 50);
        assert_eq!(parsed.start, Timestamp(1000));
    }

    #[test]
    fn test_file_header_version_mismatch() {
        let mut header = encode_file_header(65536, 50, Timestamp(0));
        header[4] = FILE_VERSION + 1;
        let result = decode_file_header(&header);
        assert!(matches!(
            result,
            Err(StateError::UnsupportedFormatVersion { .. })
        ));
    }

    #[test]
    fn test_free_space_accounting() {
        let mut node = HtNode::new(0, NO_PARENT, Timestamp(0));
        let before = node.free_space(4096);
        let iv = Interval::new(Quark(0), Timestamp(0), Timestamp(5), StateValue::Long(9));
        let size = record_size(&iv);
        node.add(iv);
        assert_eq!(node.free_space(4096), before - size);
    }
}
