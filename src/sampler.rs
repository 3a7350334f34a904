//! Performance-counter sampler
//!
//! Drives the select-then-read protocol across the fixed table of debug
//! modules and renders the sampled counters as a live terminal grid,
//! highlighting cells that changed since the previous iteration.

use std::fmt::Write as _;
use std::io::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::device::{BufferObject, DeviceError};
use crate::stream::{CommandStream, SubmitBackend};

const CLEAR_SCREEN: &str = "\x1b[H\x1b[J";
const COLOR_CHANGED: &str = "\x1b[1;33m";
const COLOR_HEAD: &str = "\x1b[1;37;100m";
const COLOR_RESET: &str = "\x1b[0m";

/// Static descriptor of one hardware module's debug-register window.
/// Counters sit behind a 16-way multiplexer: `select_reg` picks the slot
/// (a 4-bit field at `select_shift`), `read_reg` exposes the selected
/// value. `signature` is the value an idle module is expected to report.
pub struct DebugModule {
    pub name: &'static str,
    pub select_reg: u32,
    pub select_shift: u32,
    pub read_reg: u32,
    pub count: u32,
    pub signature: u32,
}

pub const MODULE_COUNT: usize = 10;
pub const MAX_SLOTS: usize = 16;
/// Slot 15 is reserved as the counter-clearing read and skipped unless
/// reset mode is on.
pub const LIVE_SLOTS: usize = MAX_SLOTS - 1;

/// The ten module windows, selector fields spread across three shared
/// control registers.
pub const DEBUG_MODULES: [DebugModule; MODULE_COUNT] = [
    DebugModule { name: "RA", select_reg: 0x474, select_shift: 16, read_reg: 0x448, count: 16, signature: 0x1234_4321 },
    DebugModule { name: "TX", select_reg: 0x474, select_shift: 24, read_reg: 0x44C, count: 16, signature: 0x1221_1221 },
    DebugModule { name: "FE", select_reg: 0x470, select_shift: 0, read_reg: 0x450, count: 16, signature: 0xBABE_F00D },
    DebugModule { name: "PE", select_reg: 0x470, select_shift: 16, read_reg: 0x454, count: 16, signature: 0xBABE_F00D },
    DebugModule { name: "DE", select_reg: 0x470, select_shift: 8, read_reg: 0x458, count: 16, signature: 0xBABE_F00D },
    DebugModule { name: "SH", select_reg: 0x470, select_shift: 24, read_reg: 0x45C, count: 16, signature: 0xDEAD_BEEF },
    DebugModule { name: "PA", select_reg: 0x474, select_shift: 0, read_reg: 0x460, count: 16, signature: 0x0000_AAAA },
    DebugModule { name: "SE", select_reg: 0x474, select_shift: 8, read_reg: 0x464, count: 16, signature: 0x5E5E_5E5E },
    DebugModule { name: "MC", select_reg: 0x478, select_shift: 0, read_reg: 0x468, count: 16, signature: 0x1234_5678 },
    DebugModule { name: "HI", select_reg: 0x478, select_shift: 8, read_reg: 0x46C, count: 16, signature: 0xAAAA_AAAA },
];

// The selector field is 4 bits wide per module.
const _: () = {
    let mut i = 0;
    while i < MODULE_COUNT {
        assert!(DEBUG_MODULES[i].count <= MAX_SLOTS as u32);
        i += 1;
    }
};

/// Samples every module's live slots once per iteration and keeps the
/// previous iteration's table for change highlighting.
pub struct CounterSampler<'a, B: SubmitBackend> {
    stream: &'a mut CommandStream<B>,
    dest: BufferObject,
    counters: [[u32; MAX_SLOTS]; MODULE_COUNT],
    prev: [[u32; MAX_SLOTS]; MODULE_COUNT],
    has_prev: bool,
    reset_after_read: bool,
}

impl<'a, B: SubmitBackend> CounterSampler<'a, B> {
    /// `dest` is the 4-byte scratch buffer every readback lands in.
    pub fn new(stream: &'a mut CommandStream<B>, dest: BufferObject, reset_after_read: bool) -> Self {
        Self {
            stream,
            dest,
            counters: [[0; MAX_SLOTS]; MODULE_COUNT],
            prev: [[0; MAX_SLOTS]; MODULE_COUNT],
            has_prev: false,
            reset_after_read,
        }
    }

    /// Sample all modules into the current table. One full submit/wait
    /// round trip per slot: the selector is a single shared register per
    /// module, so slots cannot be batched without racing the multiplexer.
    pub fn sample_iteration(&mut self) -> Result<(), DeviceError> {
        for (mid, module) in DEBUG_MODULES.iter().enumerate() {
            let live = (module.count - 1) as usize;
            for slot in 0..live {
                self.sample_slot(mid, module, slot)?;
            }
            if self.reset_after_read {
                self.sample_slot(mid, module, MAX_SLOTS - 1)?;
            }
        }
        Ok(())
    }

    fn sample_slot(&mut self, mid: usize, module: &DebugModule, slot: usize) -> Result<(), DeviceError> {
        self.stream.read_register(
            &self.dest,
            module.read_reg,
            module.select_reg,
            (slot as u32) << module.select_shift,
        )?;
        self.counters[mid][slot] = self.dest.read_u32(0);
        Ok(())
    }

    /// Promote the current table to "previous" for the next iteration.
    pub fn advance(&mut self) {
        self.prev = self.counters;
        self.has_prev = true;
    }

    /// Render the counter grid. A cell is highlighted iff a previous
    /// iteration exists and the value differs from it.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = write!(out, "{}  ", COLOR_HEAD);
        for module in &DEBUG_MODULES {
            let _ = write!(out, "   {:<2}    ", module.name);
        }
        let _ = writeln!(out, "{}", COLOR_RESET);

        for slot in 0..MAX_SLOTS {
            let _ = write!(out, "{}{:01x}{} ", COLOR_HEAD, slot, COLOR_RESET);
            for mid in 0..MODULE_COUNT {
                let value = self.counters[mid][slot];
                let changed = self.has_prev && value != self.prev[mid][slot];
                let color = if changed { COLOR_CHANGED } else { "" };
                let _ = write!(out, "{}{:08x}{} ", color, value, COLOR_RESET);
            }
            out.push('\n');
        }
        out
    }

    /// Sample/render/sleep until `stop` is raised or `max_iterations`
    /// (used by tests) runs out.
    pub fn run(
        &mut self,
        interval: Duration,
        stop: &AtomicBool,
        max_iterations: Option<u64>,
    ) -> Result<(), DeviceError> {
        let mut iterations = 0u64;
        loop {
            if stop.load(Ordering::Relaxed) {
                debug!("stop flag raised, leaving sampling loop");
                return Ok(());
            }
            self.sample_iteration()?;
            print!("{}{}", CLEAR_SCREEN, self.render());
            let _ = io::stdout().flush();

            iterations += 1;
            if max_iterations.is_some_and(|max| iterations >= max) {
                return Ok(());
            }

            std::thread::sleep(interval);
            self.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_load_state;
    use crate::stream::{CommandStream, DEFAULT_CAPACITY_WORDS};
    use crate::testing::RecordingBackend;

    fn sampler_parts() -> (CommandStream<RecordingBackend>, BufferObject) {
        let stream = CommandStream::new(RecordingBackend::default(), DEFAULT_CAPACITY_WORDS).unwrap();
        (stream, BufferObject::host(1, 4))
    }

    #[test]
    fn iteration_issues_150_gated_readbacks() {
        let (mut stream, dest) = sampler_parts();
        let mut sampler = CounterSampler::new(&mut stream, dest, false);
        sampler.sample_iteration().unwrap();

        let backend = sampler.stream.backend();
        assert_eq!(backend.readback_count(), MODULE_COUNT * LIVE_SLOTS);
        assert_eq!(backend.batches.len(), MODULE_COUNT * LIVE_SLOTS);

        for (i, batch) in backend.batches.iter().enumerate() {
            let module = &DEBUG_MODULES[i / LIVE_SLOTS];
            let slot = (i % LIVE_SLOTS) as u32;

            // Selector write precedes the readback within the same stream.
            assert_eq!(
                decode_load_state(batch.words[0]),
                Some((module.select_reg, 1))
            );
            assert_eq!(batch.words[1], slot << module.select_shift);

            let rb = &batch.readbacks[0];
            assert_eq!(rb.reg, module.read_reg);
            assert_eq!(rb.select_value, slot << module.select_shift);
        }
    }

    #[test]
    fn reset_mode_additionally_samples_slot_15() {
        let (mut stream, dest) = sampler_parts();
        let mut sampler = CounterSampler::new(&mut stream, dest, true);
        sampler.sample_iteration().unwrap();

        let backend = sampler.stream.backend();
        assert_eq!(backend.readback_count(), MODULE_COUNT * MAX_SLOTS);
        // The 16th batch of the first module carries the clearing slot.
        let batch = &backend.batches[LIVE_SLOTS];
        assert_eq!(batch.words[1], 15 << DEBUG_MODULES[0].select_shift);
    }

    #[test]
    fn sampled_values_land_in_the_table() {
        let (mut stream, dest) = sampler_parts();
        stream.backend_mut().script_readbacks((0..150).map(|v| 0x100 + v));
        let mut sampler = CounterSampler::new(&mut stream, dest, false);
        sampler.sample_iteration().unwrap();

        assert_eq!(sampler.counters[0][0], 0x100);
        assert_eq!(sampler.counters[0][14], 0x100 + 14);
        assert_eq!(sampler.counters[9][14], 0x100 + 149);
        // Slot 15 is never written in normal mode.
        assert_eq!(sampler.counters[0][15], 0);
    }

    #[test]
    fn first_iteration_renders_without_highlights() {
        let (mut stream, dest) = sampler_parts();
        stream.backend_mut().script_readbacks([7; 150]);
        let mut sampler = CounterSampler::new(&mut stream, dest, false);
        sampler.sample_iteration().unwrap();

        assert!(!sampler.render().contains(COLOR_CHANGED));
    }

    #[test]
    fn changed_cells_highlight_on_later_iterations() {
        let (mut stream, dest) = sampler_parts();
        let mut sampler = CounterSampler::new(&mut stream, dest, false);
        sampler.sample_iteration().unwrap();
        sampler.advance();

        // Second iteration: exactly one cell changes.
        sampler.counters[3][2] = 0xCAFE;
        let rendered = sampler.render();
        assert_eq!(rendered.matches(COLOR_CHANGED).count(), 1);
        assert!(rendered.contains(&format!("{}{:08x}{}", COLOR_CHANGED, 0xCAFEu32, COLOR_RESET)));

        // Unchanged next iteration renders clean again.
        sampler.advance();
        assert!(!sampler.render().contains(COLOR_CHANGED));
    }

    #[test]
    fn run_honors_iteration_limit_and_stop_flag() {
        let (mut stream, dest) = sampler_parts();
        let mut sampler = CounterSampler::new(&mut stream, dest, false);
        let stop = AtomicBool::new(false);
        sampler.run(Duration::ZERO, &stop, Some(2)).unwrap();
        assert_eq!(sampler.stream.backend().batches.len(), 2 * MODULE_COUNT * LIVE_SLOTS);
        assert!(sampler.has_prev);

        let stopped = AtomicBool::new(true);
        let before = sampler.stream.backend().batches.len();
        sampler.run(Duration::ZERO, &stopped, None).unwrap();
        assert_eq!(sampler.stream.backend().batches.len(), before);
    }

    #[test]
    fn module_table_shape() {
        assert_eq!(DEBUG_MODULES.len(), MODULE_COUNT);
        for module in &DEBUG_MODULES {
            assert_eq!(module.count as usize, MAX_SLOTS);
            assert_eq!(module.select_reg & 0x3, 0);
            assert_eq!(module.read_reg & 0x3, 0);
        }
    }
}
