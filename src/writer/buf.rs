use byteorder::{BigEndian, ByteOrder};

use crate::event::{CapNo, PayloadSize, Tag, Timestamp};

/// Bytes taken by `tag:16, timestamp:64`.
pub(crate) const EVENT_HEADER_BYTES: usize = 2 + 8;
/// Bytes taken by the length field of a variable-sized event.
pub(crate) const SIZE_FIELD_BYTES: usize = 2;
/// On-wire size of a whole block marker event.
pub(crate) const BLOCK_MARKER_BYTES: usize = EVENT_HEADER_BYTES + 4 + 8 + 2;

/// A fixed-capacity event buffer owned by a single producer.
///
/// Holds a write cursor and, once the data section starts, the offset of
/// the currently open block marker. All integers go out big-endian. The
/// primitive writers never check for room; callers go through
/// [`has_room`][Self::has_room] / [`has_room_variable`][Self::has_room_variable]
/// first so that an event is either written whole or not at all.
pub(crate) struct EventsBuf {
    data: Box<[u8]>,
    pos: usize,
    marker: Option<usize>,
    capno: CapNo,
}

impl EventsBuf {
    pub fn new(capacity: usize, capno: CapNo) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            pos: 0,
            marker: None,
            capno,
        }
    }

    pub fn capno(&self) -> CapNo {
        self.capno
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// The written prefix, ready to be flushed.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    pub fn reset(&mut self) {
        self.pos = 0;
        self.marker = None;
    }

    /// Room for a fixed-size event with the declared payload of `tag`.
    pub fn has_room(&self, tag: Tag) -> bool {
        let payload = match tag.size() {
            PayloadSize::Fixed(n) => n as usize,
            PayloadSize::Variable => {
                debug_assert!(false, "variable tag {tag:?} needs has_room_variable");
                return false;
            }
        };
        self.pos + EVENT_HEADER_BYTES + payload <= self.data.len()
    }

    /// Room for a variable-size event carrying `payload_bytes` of payload.
    pub fn has_room_variable(&self, payload_bytes: usize) -> bool {
        self.pos + EVENT_HEADER_BYTES + SIZE_FIELD_BYTES + payload_bytes <= self.data.len()
    }

    /// Room for `n` raw bytes; used while the header is being emitted.
    pub fn has_raw_room(&self, n: usize) -> bool {
        self.pos + n <= self.data.len()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data[self.pos] = v;
        self.pos += 1;
    }

    pub fn put_u16(&mut self, v: u16) {
        BigEndian::write_u16(&mut self.data[self.pos..self.pos + 2], v);
        self.pos += 2;
    }

    pub fn put_u32(&mut self, v: u32) {
        BigEndian::write_u32(&mut self.data[self.pos..self.pos + 4], v);
        self.pos += 4;
    }

    pub fn put_u64(&mut self, v: u64) {
        BigEndian::write_u64(&mut self.data[self.pos..self.pos + 8], v);
        self.pos += 8;
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    /// `tag:16, timestamp:64`.
    pub fn put_event_header(&mut self, tag: Tag, ts: Timestamp) {
        self.put_u16(tag as u16);
        self.put_u64(ts);
    }

    /// Opens a block for this producer's events, closing any block still
    /// open. Size and end timestamp are zero placeholders until
    /// [`close_block`][Self::close_block] patches them.
    pub fn open_block(&mut self, now: Timestamp) {
        self.close_block(now);
        debug_assert!(self.has_raw_room(BLOCK_MARKER_BYTES));
        let at = self.pos;
        self.put_event_header(Tag::BlockMarker, now);
        self.put_u32(0);
        self.put_u64(0);
        self.put_u16(self.capno);
        self.marker = Some(at);
    }

    /// Patches the open block marker with the block's total byte count
    /// and `now` as its end timestamp.
    pub fn close_block(&mut self, now: Timestamp) {
        if let Some(at) = self.marker.take() {
            let field = at + EVENT_HEADER_BYTES;
            BigEndian::write_u32(&mut self.data[field..field + 4], (self.pos - at) as u32);
            BigEndian::write_u64(&mut self.data[field + 4..field + 12], now);
        }
    }
}
