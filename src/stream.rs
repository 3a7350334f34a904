//! Command-stream builder
//!
//! Accumulates encoded words, relocation entries and readback requests,
//! then hands the whole batch to a [`SubmitBackend`] and blocks until the
//! device has consumed it. Misuse of the reserve/emit discipline is a
//! caller bug and panics: a malformed stream cannot be recovered without
//! a device reset, so there is nothing sensible to return.

use thiserror::Error;
use tracing::trace;

use crate::device::{BoAccess, BufferObject, DeviceError};
use crate::protocol::{load_state_header, regs};
use crate::uapi;

/// Word capacity the tools allocate for their streams.
pub const DEFAULT_CAPACITY_WORDS: usize = 0x300;

/// One deferred address patch: the word at `word_index` receives the
/// buffer's device address at submission time.
pub struct RelocEntry {
    pub word_index: usize,
    pub bo: BufferObject,
    pub access: BoAccess,
}

/// One hardware readback: after the stream's state loads execute, the
/// device copies `reg` into `bo` at `offset`, with the multiplexer
/// selector `select_reg`/`select_value` armed when `flags` carries
/// [`uapi::READBACK_PERF`].
pub struct ReadbackEntry {
    pub bo: BufferObject,
    pub offset: u32,
    pub reg: u32,
    pub select_reg: u32,
    pub select_value: u32,
    pub flags: u32,
}

/// Borrowed view of a complete stream handed to the backend.
pub struct StreamBatch<'a> {
    pub words: &'a [u32],
    pub relocs: &'a [RelocEntry],
    pub readbacks: &'a [ReadbackEntry],
}

/// The single synchronization primitive of the exerciser: submit the
/// batch and return only once the device signals completion.
pub trait SubmitBackend {
    fn submit_and_wait(&mut self, batch: StreamBatch<'_>) -> Result<(), DeviceError>;
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid stream capacity: {0} words")]
    InvalidCapacity(usize),
}

/// Bounded, append-only command stream bound to a backend.
pub struct CommandStream<B: SubmitBackend> {
    backend: B,
    capacity: usize,
    words: Vec<u32>,
    relocs: Vec<RelocEntry>,
    readbacks: Vec<ReadbackEntry>,
    /// Words still owed against the open reservation; zero when closed.
    reserved: usize,
}

impl<B: SubmitBackend> CommandStream<B> {
    pub fn new(backend: B, capacity: usize) -> Result<Self, StreamError> {
        if capacity == 0 || capacity > uapi::FE_STREAM_MAX_WORDS {
            return Err(StreamError::InvalidCapacity(capacity));
        }
        Ok(Self {
            backend,
            capacity,
            words: Vec::with_capacity(capacity),
            relocs: Vec::new(),
            readbacks: Vec::new(),
            reserved: 0,
        })
    }

    /// Guarantee room for the next `n` emissions.
    pub fn reserve(&mut self, n: usize) {
        assert_eq!(
            self.reserved, 0,
            "reserve({}) while {} reserved words are unconsumed",
            n, self.reserved
        );
        assert!(
            self.words.len() + n <= self.capacity,
            "stream capacity exceeded: {} + {} > {}",
            self.words.len(),
            n,
            self.capacity
        );
        self.reserved = n;
    }

    /// Append one word against the open reservation.
    pub fn emit(&mut self, word: u32) {
        assert!(self.reserved > 0, "emit without an open reservation");
        self.words.push(word);
        self.reserved -= 1;
    }

    /// Append a placeholder word and record that it must be patched with
    /// the buffer's device address at submission time.
    pub fn reloc(&mut self, bo: &BufferObject, access: BoAccess) {
        assert!(self.reserved > 0, "reloc without an open reservation");
        self.relocs.push(RelocEntry {
            word_index: self.words.len(),
            bo: bo.clone(),
            access,
        });
        self.words.push(0);
        self.reserved -= 1;
    }

    /// Record a hardware readback of `reg` into `bo` at byte `offset`.
    pub fn readback(
        &mut self,
        bo: &BufferObject,
        offset: u32,
        reg: u32,
        select_reg: u32,
        select_value: u32,
        flags: u32,
    ) {
        assert_eq!(self.reserved, 0, "readback inside an open reservation");
        assert!(
            (offset as usize) + 4 <= bo.len(),
            "readback destination out of range"
        );
        self.readbacks.push(ReadbackEntry {
            bo: bo.clone(),
            offset,
            reg,
            select_reg,
            select_value,
            flags,
        });
    }

    /// Submit the accumulated stream, block until the device completes
    /// it, and clear the stream for reuse.
    pub fn finish(&mut self) -> Result<(), DeviceError> {
        assert_eq!(self.reserved, 0, "finish with an open reservation");
        trace!(
            words = self.words.len(),
            relocs = self.relocs.len(),
            readbacks = self.readbacks.len(),
            "submitting stream"
        );
        let result = self.backend.submit_and_wait(StreamBatch {
            words: &self.words,
            relocs: &self.relocs,
            readbacks: &self.readbacks,
        });
        self.words.clear();
        self.relocs.clear();
        self.readbacks.clear();
        result
    }

    #[cfg(test)]
    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }

    #[cfg(test)]
    pub(crate) fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    // -------------------------------------------------------------------------
    // Register-access protocol
    // -------------------------------------------------------------------------

    /// Load one immediate value into a state register.
    pub fn set_state(&mut self, addr: u32, value: u32) {
        assert_eq!(addr & 0x3, 0, "state address 0x{:05x} not word aligned", addr);
        self.reserve(2);
        self.emit(load_state_header((addr >> 2) as u16, 1));
        self.emit(value);
    }

    /// Load a buffer's device address into a state register.
    pub fn set_state_from_bo(&mut self, addr: u32, bo: &BufferObject, access: BoAccess) {
        assert_eq!(addr & 0x3, 0, "state address 0x{:05x} not word aligned", addr);
        self.reserve(2);
        self.emit(load_state_header((addr >> 2) as u16, 1));
        self.reloc(bo, access);
    }

    /// Sample one multiplexed debug register: arm the selector, request
    /// the readback into `dest` offset 0, and run the stream to
    /// completion. Selector write and readback travel in the same stream
    /// so no other GPU activity can reorder between them.
    pub fn read_register(
        &mut self,
        dest: &BufferObject,
        reg: u32,
        select_reg: u32,
        select_value: u32,
    ) -> Result<(), DeviceError> {
        self.set_state(select_reg, select_value);
        self.readback(dest, 0, reg, select_reg, select_value, uapi::READBACK_PERF);
        self.finish()
    }

    /// Kick the resolve engine. Must be the last state-affecting write
    /// before the stream is finished; the hardware starts the moment it
    /// processes the magic value.
    pub fn trigger_resolve(&mut self) {
        self.set_state(regs::RS_KICKER, crate::protocol::RS_KICKER_MAGIC);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_load_state;
    use crate::testing::RecordingBackend;

    fn stream() -> CommandStream<RecordingBackend> {
        CommandStream::new(RecordingBackend::default(), DEFAULT_CAPACITY_WORDS).unwrap()
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            CommandStream::new(RecordingBackend::default(), 0),
            Err(StreamError::InvalidCapacity(0))
        ));
    }

    #[test]
    fn set_state_encodes_header_and_value() {
        let mut s = stream();
        s.set_state(regs::YUV_WINDOW_SIZE, 4 << 16 | 4);
        s.finish().unwrap();

        let batch = &s.backend.batches[0];
        assert_eq!(batch.words.len(), 2);
        assert_eq!(decode_load_state(batch.words[0]), Some((regs::YUV_WINDOW_SIZE, 1)));
        assert_eq!(batch.words[1], 0x0004_0004);
    }

    #[test]
    fn reloc_leaves_placeholder_and_records_offset() {
        let mut s = stream();
        let bo = BufferObject::host(9, 64);
        s.set_state_from_bo(regs::YUV_PLANE0_ADDRESS, &bo, BoAccess::Read);
        s.finish().unwrap();

        let batch = &s.backend.batches[0];
        assert_eq!(batch.words[1], 0);
        assert_eq!(batch.relocs, vec![(1, 9, BoAccess::Read)]);
    }

    #[test]
    fn finish_clears_stream_for_reuse() {
        let mut s = stream();
        s.set_state(regs::YUV_CONFIG, 0);
        s.finish().unwrap();
        assert!(s.is_empty());
        s.set_state(regs::YUV_CONFIG, 1);
        s.finish().unwrap();
        assert_eq!(s.backend.batches.len(), 2);
        assert_eq!(s.backend.batches[1].words.len(), 2);
    }

    #[test]
    fn read_register_orders_selector_before_readback() {
        let mut s = stream();
        let dest = BufferObject::host(3, 4);
        s.read_register(&dest, 0x448, 0x474, 5 << 16).unwrap();

        let batch = &s.backend.batches[0];
        assert_eq!(decode_load_state(batch.words[0]), Some((0x474, 1)));
        assert_eq!(batch.words[1], 5 << 16);
        let rb = &batch.readbacks[0];
        assert_eq!((rb.reg, rb.select_reg, rb.select_value), (0x448, 0x474, 5 << 16));
        assert_eq!(rb.offset, 0);
        assert_eq!(rb.flags, uapi::READBACK_PERF);
    }

    #[test]
    fn read_register_deposits_backend_value() {
        let mut s = stream();
        s.backend.script_readbacks([0x1234_5678]);
        let dest = BufferObject::host(3, 4);
        s.read_register(&dest, 0x448, 0x474, 0).unwrap();
        assert_eq!(dest.read_u32(0), 0x1234_5678);
    }

    #[test]
    #[should_panic(expected = "unconsumed")]
    fn double_reserve_panics() {
        let mut s = stream();
        s.reserve(2);
        s.emit(0);
        s.reserve(2);
    }

    #[test]
    #[should_panic(expected = "without an open reservation")]
    fn emit_without_reserve_panics() {
        let mut s = stream();
        s.emit(0);
    }

    #[test]
    #[should_panic(expected = "open reservation")]
    fn finish_with_open_reservation_panics() {
        let mut s = stream();
        s.reserve(2);
        s.emit(0);
        let _ = s.finish();
    }

    #[test]
    #[should_panic(expected = "capacity exceeded")]
    fn reserve_past_capacity_panics() {
        let mut s = CommandStream::new(RecordingBackend::default(), 4).unwrap();
        s.set_state(regs::YUV_CONFIG, 0);
        s.set_state(regs::YUV_CONFIG, 0);
        s.reserve(2);
    }

    #[test]
    #[should_panic(expected = "not word aligned")]
    fn unaligned_state_address_panics() {
        let mut s = stream();
        s.set_state(0x1601, 0);
    }

    #[test]
    #[should_panic(expected = "destination out of range")]
    fn readback_past_destination_panics() {
        let mut s = stream();
        let dest = BufferObject::host(3, 4);
        s.readback(&dest, 4, 0x448, 0x474, 0, uapi::READBACK_PERF);
    }
}
