//! # Framing Ring Buffer
//!
//! This module provides the growable circular buffer that turns the serial
//! byte stream back into packets. The read loop appends raw chunks as they
//! arrive; the dispatch task pulls out complete packets.
//!
//! ## Design Principles
//!
//! 1. **Never drops bytes**: a write that does not fit grows the storage
//!    (doubling) and linearises the occupied region.
//!
//! 2. **Chunk boundaries are irrelevant**: a packet may straddle any number
//!    of writes, and one write may carry several packets.
//!
//! 3. **Resynchronisation**: bytes in front of the first magic header are
//!    garbage and are discarded together with the next extracted packet.
//!
//! 4. **No errors**: the buffer only ever answers "not enough data yet".
//!
//! ## Memory Layout
//!
//! ```text
//! ┌──────────┬──────────────────────────────┬─────────────────┐
//! │   free   │ garbage │ 68 00 L C payload… │      free       │
//! └──────────┴──────────────────────────────┴─────────────────┘
//!            ▲                              ▲
//!          tail                           head
//! ```
//!
//! The buffer is not synchronised itself. The link manager keeps it behind a
//! single mutex shared by the read loop (writer) and the dispatch task
//! (reader).

use core::cell::Cell;
use core::fmt;

use log::{debug, trace};

use crate::protocol::{Packet, HEADER_LEN, MIN_SCAN_LEN, PACKET_MAGIC};

/// Default capacity: 4KB holds many 45 byte location packets
pub const DEFAULT_CAPACITY: usize = 4096;

/// Growable ring buffer with variable-length packet extraction
///
/// # Example
///
/// ```rust
/// use serial_link::buffer::FramingBuffer;
///
/// let mut buffer = FramingBuffer::new();
///
/// // A packet split across two reads
/// buffer.write(&[0xFF, 0x68, 0x00]);
/// assert_eq!(buffer.has_complete_packet(), None);
///
/// buffer.write(&[0x01, 0x55]);
/// assert_eq!(buffer.has_complete_packet(), Some(4));
///
/// let packet = buffer.read_packet().unwrap();
/// assert_eq!(packet.as_bytes(), &[0x68, 0x00, 0x01, 0x55]);
/// assert!(buffer.is_empty());
/// ```
pub struct FramingBuffer {
    /// Backing storage, its length is the capacity
    data: Vec<u8>,
    /// Write position
    head: usize,
    /// Read position
    tail: usize,
    /// Occupied bytes
    size: usize,
    /// Offsets below this (relative to `tail`) are known not to start a header
    scan_from: Cell<usize>,
}

/// Location of a complete packet relative to `tail`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Located {
    offset: usize,
    len: usize,
}

impl FramingBuffer {
    /// Create a buffer with [`DEFAULT_CAPACITY`]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a buffer with the given initial capacity
    ///
    /// A zero capacity is bumped to one byte; the buffer grows on demand.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!("FramingBuffer created with capacity: {}", capacity);
        Self {
            data: vec![0u8; capacity],
            head: 0,
            tail: 0,
            size: 0,
            scan_from: Cell::new(0),
        }
    }

    /// Total capacity of the backing storage
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of occupied bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Number of bytes that can be written without growing
    #[inline]
    pub fn free(&self) -> usize {
        self.capacity() - self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.size == self.capacity()
    }

    /// Append bytes, growing the storage when needed
    ///
    /// Always writes the whole slice and returns its length.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }

        let needed = self.size + bytes.len();
        if needed > self.capacity() {
            self.grow(needed);
        }

        let capacity = self.capacity();
        let to_end = bytes.len().min(capacity - self.head);
        self.data[self.head..self.head + to_end].copy_from_slice(&bytes[..to_end]);
        if to_end < bytes.len() {
            // Wrap around to the start of the storage
            let rest = bytes.len() - to_end;
            self.data[..rest].copy_from_slice(&bytes[to_end..]);
        }

        self.head = (self.head + bytes.len()) % capacity;
        self.size += bytes.len();

        trace!(
            "Written {} bytes, buffer size: {}/{}",
            bytes.len(),
            self.size,
            capacity
        );
        bytes.len()
    }

    /// Total length of the first complete packet, if one is buffered
    ///
    /// Scans for the magic header from the oldest byte. Returns `None` when
    /// no header is present, when the header's length field is not yet
    /// available, or when the packet's tail has not arrived.
    pub fn has_complete_packet(&self) -> Option<usize> {
        self.locate().map(|found| found.len)
    }

    /// Extract the first complete packet
    ///
    /// Garbage bytes in front of the packet are discarded with it. Returns
    /// `None` without touching the buffer when no complete packet exists.
    pub fn read_packet(&mut self) -> Option<Packet> {
        let found = self.locate()?;

        let mut bytes = vec![0u8; found.len];
        self.copy_out(found.offset, &mut bytes);
        self.consume(found.offset + found.len);

        trace!(
            "Read packet of {} bytes (skipped {}), remaining: {}/{}",
            found.len,
            found.offset,
            self.size,
            self.capacity()
        );
        Some(Packet::from_framed(bytes))
    }

    /// Read exactly `len` bytes from the front, or nothing
    pub fn read_exact(&mut self, len: usize) -> Option<Vec<u8>> {
        if self.size < len {
            trace!("Insufficient data: need {}, have {}", len, self.size);
            return None;
        }

        let mut bytes = vec![0u8; len];
        self.copy_out(0, &mut bytes);
        self.consume(len);
        Some(bytes)
    }

    /// Drain every buffered byte in arrival order
    pub fn read_all(&mut self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.size];
        self.copy_out(0, &mut bytes);
        self.consume(self.size);
        bytes
    }

    /// Reset to empty, keeping the current storage
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.size = 0;
        self.scan_from.set(0);
        debug!("FramingBuffer cleared");
    }

    /// Find the first header and check that its packet is complete
    fn locate(&self) -> Option<Located> {
        if self.size < MIN_SCAN_LEN {
            return None;
        }

        let last_candidate = self.size - MIN_SCAN_LEN;
        let mut offset = self.scan_from.get();
        while offset <= last_candidate {
            if self.byte_at(offset) == PACKET_MAGIC[0] && self.byte_at(offset + 1) == PACKET_MAGIC[1]
            {
                // Everything before a header can be skipped on the next scan
                self.scan_from.set(offset);

                let len = self.byte_at(offset + 2) as usize + HEADER_LEN;
                if self.size - offset >= len {
                    return Some(Located { offset, len });
                }
                return None;
            }
            offset += 1;
        }

        // Candidates past `last_candidate` still lack their length byte
        self.scan_from.set(last_candidate + 1);
        None
    }

    #[inline]
    fn byte_at(&self, offset: usize) -> u8 {
        self.data[(self.tail + offset) % self.capacity()]
    }

    /// The occupied region as (up to) two contiguous slices
    fn occupied(&self) -> (&[u8], &[u8]) {
        let end = self.tail + self.size;
        if end <= self.capacity() {
            (&self.data[self.tail..end], &[])
        } else {
            (&self.data[self.tail..], &self.data[..end - self.capacity()])
        }
    }

    /// Copy `out.len()` bytes starting `offset` bytes after `tail`
    fn copy_out(&self, offset: usize, out: &mut [u8]) {
        let capacity = self.capacity();
        let start = (self.tail + offset) % capacity;
        let to_end = out.len().min(capacity - start);
        out[..to_end].copy_from_slice(&self.data[start..start + to_end]);
        if to_end < out.len() {
            let rest = out.len() - to_end;
            out[to_end..].copy_from_slice(&self.data[..rest]);
        }
    }

    fn consume(&mut self, len: usize) {
        debug_assert!(len <= self.size);
        self.tail = (self.tail + len) % self.capacity();
        self.size -= len;
        self.scan_from.set(0);

        if self.size == 0 {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Grow to at least `min_capacity`, doubling, with data moved to the front
    fn grow(&mut self, min_capacity: usize) {
        let mut capacity = self.capacity();
        while capacity < min_capacity {
            capacity *= 2;
        }

        let mut data = vec![0u8; capacity];
        let (first, second) = self.occupied();
        data[..first.len()].copy_from_slice(first);
        data[first.len()..self.size].copy_from_slice(second);

        self.data = data;
        self.tail = 0;
        self.head = self.size;
        debug!("FramingBuffer expanded to {} bytes", capacity);
    }
}

impl Default for FramingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FramingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FramingBuffer[capacity={}, size={}, head={}, tail={}, free={}]",
            self.capacity(),
            self.size,
            self.head,
            self.tail,
            self.free()
        )
    }
}

impl fmt::Debug for FramingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const POWER_ON: [u8; 4] = [0x68, 0x00, 0x01, 0x55];
    const ID_QUERY: [u8; 7] = [0x68, 0x00, 0x04, 0x02, 0x01, 0x02, 0x03];

    fn location_packet() -> Vec<u8> {
        let mut packet = vec![0x68, 0x00, 0x2A, 0xCC];
        packet.extend((4..45).map(|i| (i - 4) as u8));
        packet
    }

    #[test]
    fn test_new_buffer_is_empty() {
        let buffer = FramingBuffer::new();
        assert!(buffer.is_empty());
        assert!(!buffer.is_full());
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.capacity(), DEFAULT_CAPACITY);
        assert_eq!(buffer.has_complete_packet(), None);
    }

    #[test]
    fn test_single_packet() {
        let mut buffer = FramingBuffer::with_capacity(1024);
        assert_eq!(buffer.write(&POWER_ON), 4);
        assert_eq!(buffer.has_complete_packet(), Some(4));

        let packet = buffer.read_packet().unwrap();
        assert_eq!(packet.as_bytes(), &POWER_ON);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_location_packet() {
        let mut buffer = FramingBuffer::with_capacity(1024);
        let packet = location_packet();

        buffer.write(&packet[..32]);
        assert_eq!(buffer.has_complete_packet(), None);

        buffer.write(&packet[32..]);
        assert_eq!(buffer.has_complete_packet(), Some(45));

        let read = buffer.read_packet().unwrap();
        assert_eq!(read.as_bytes(), packet.as_slice());
        assert_eq!(&read.as_bytes()[..4], &[0x68, 0x00, 0x2A, 0xCC]);
    }

    #[test]
    fn test_every_split_point() {
        let packet = location_packet();
        for split in 1..packet.len() {
            let mut buffer = FramingBuffer::with_capacity(16);
            buffer.write(&packet[..split]);
            assert_eq!(buffer.has_complete_packet(), None, "split at {}", split);
            assert!(buffer.read_packet().is_none());

            buffer.write(&packet[split..]);
            assert_eq!(buffer.has_complete_packet(), Some(packet.len()));
            assert_eq!(buffer.read_packet().unwrap().as_bytes(), packet.as_slice());
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_three_packets_in_one_write() {
        let mut buffer = FramingBuffer::with_capacity(1024);
        let location = location_packet();

        let mut stream = Vec::new();
        stream.extend_from_slice(&POWER_ON);
        stream.extend_from_slice(&ID_QUERY);
        stream.extend_from_slice(&location);
        buffer.write(&stream);

        let mut commands = Vec::new();
        while buffer.has_complete_packet().is_some() {
            let packet = buffer.read_packet().unwrap();
            commands.push(packet.command_code().unwrap());
        }

        assert_eq!(commands, vec![0x55, 0x02, 0xCC]);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_garbage_before_header_is_skipped() {
        let mut buffer = FramingBuffer::new();
        buffer.write(&[0xFF, 0xFE, 0xFD]);
        buffer.write(&POWER_ON);

        assert_eq!(buffer.has_complete_packet(), Some(4));
        assert_eq!(buffer.read_packet().unwrap().as_bytes(), &POWER_ON);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_short_buffers_never_report() {
        let mut buffer = FramingBuffer::new();
        buffer.write(&[0x68, 0x00, 0x01]);
        assert_eq!(buffer.has_complete_packet(), None);

        let mut buffer = FramingBuffer::new();
        buffer.write(&[0x01, 0x02, 0x68, 0x00]);
        // Header found but the length byte has not arrived
        assert_eq!(buffer.has_complete_packet(), None);

        buffer.write(&[0x01]);
        assert_eq!(buffer.has_complete_packet(), None);
        buffer.write(&[0x55]);
        assert_eq!(buffer.has_complete_packet(), Some(4));
    }

    #[test]
    fn test_garbage_only_accumulates() {
        let mut buffer = FramingBuffer::with_capacity(8);
        for _ in 0..10 {
            buffer.write(&[0x11, 0x22, 0x33]);
            assert_eq!(buffer.has_complete_packet(), None);
        }
        assert_eq!(buffer.len(), 30);
        assert!(buffer.capacity() >= 30);

        // A late header after lots of garbage is still found
        buffer.write(&POWER_ON);
        assert_eq!(buffer.read_packet().unwrap().as_bytes(), &POWER_ON);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_header_split_across_scan_hint() {
        let mut buffer = FramingBuffer::new();
        buffer.write(&[0x10, 0x20, 0x30, 0x40, 0x68]);
        assert_eq!(buffer.has_complete_packet(), None);

        buffer.write(&[0x00, 0x01, 0x55]);
        assert_eq!(buffer.has_complete_packet(), Some(4));
    }

    #[test]
    fn test_wrap_around_extraction() {
        let mut buffer = FramingBuffer::with_capacity(8);
        buffer.write(&[0xAA; 6]);
        assert_eq!(buffer.read_exact(5).unwrap(), vec![0xAA; 5]);

        // Header lands in the last two slots, length and command wrap
        buffer.write(&POWER_ON);
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.has_complete_packet(), Some(4));
        assert_eq!(buffer.read_packet().unwrap().as_bytes(), &POWER_ON);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_growth_preserves_wrapped_data() {
        let mut buffer = FramingBuffer::with_capacity(4);
        buffer.write(&[1, 2, 3]);
        assert_eq!(buffer.read_exact(2).unwrap(), vec![1, 2]);
        buffer.write(&[4, 5, 6]);
        assert!(buffer.is_full());

        buffer.write(&[7, 8, 9]);
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.read_all(), vec![3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buffer = FramingBuffer::with_capacity(4);
        buffer.write(&[0u8; 20]);
        let capacity = buffer.capacity();

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), capacity);
        assert!(buffer.read_all().is_empty());
    }

    #[test]
    fn test_zero_length_packet() {
        let mut buffer = FramingBuffer::new();
        buffer.write(&[0x68, 0x00, 0x00, 0x68, 0x00, 0x01, 0x55]);

        let first = buffer.read_packet().unwrap();
        assert_eq!(first.as_bytes(), &[0x68, 0x00, 0x00]);
        assert_eq!(buffer.read_packet().unwrap().as_bytes(), &POWER_ON);
    }

    #[test]
    fn test_status_line() {
        let mut buffer = FramingBuffer::with_capacity(16);
        buffer.write(&[1, 2, 3]);
        assert_eq!(
            buffer.to_string(),
            "FramingBuffer[capacity=16, size=3, head=3, tail=0, free=13]"
        );
    }

    proptest! {
        #[test]
        fn prop_read_all_preserves_order(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            cuts in proptest::collection::vec(any::<usize>(), 0..32),
            capacity in 1usize..64,
        ) {
            let mut points: Vec<usize> = cuts
                .iter()
                .map(|cut| if data.is_empty() { 0 } else { cut % data.len() })
                .collect();
            points.push(0);
            points.push(data.len());
            points.sort_unstable();

            let mut buffer = FramingBuffer::with_capacity(capacity);
            for window in points.windows(2) {
                let chunk = &data[window[0]..window[1]];
                prop_assert_eq!(buffer.write(chunk), chunk.len());
            }

            prop_assert_eq!(buffer.len(), data.len());
            prop_assert_eq!(buffer.read_all(), data);
            prop_assert!(buffer.is_empty());
        }

        #[test]
        fn prop_packets_survive_any_chunking(
            payloads in proptest::collection::vec(
                (any::<u8>(), proptest::collection::vec(1u8..0x68, 0..40)),
                1..8,
            ),
            chunk in 1usize..17,
        ) {
            let packets: Vec<Packet> = payloads
                .iter()
                .map(|(command, payload)| Packet::encode(*command, payload).unwrap())
                .collect();
            let stream: Vec<u8> = packets.iter().flat_map(|p| p.as_bytes().to_vec()).collect();

            let mut buffer = FramingBuffer::with_capacity(8);
            let mut extracted = Vec::new();
            for piece in stream.chunks(chunk) {
                buffer.write(piece);
                while buffer.has_complete_packet().is_some() {
                    extracted.push(buffer.read_packet().unwrap());
                }
            }

            prop_assert_eq!(extracted, packets);
            prop_assert!(buffer.is_empty());
        }
    }
}
