//! Recording submit backend for unit tests.
//!
//! Captures every batch a stream submits and services readback requests
//! from a scripted value queue, standing in for the kernel and device.

use std::collections::VecDeque;

use crate::device::{BoAccess, DeviceError};
use crate::stream::{StreamBatch, SubmitBackend};

pub struct RecordedReadback {
    pub bo_handle: u32,
    pub offset: u32,
    pub reg: u32,
    pub select_reg: u32,
    pub select_value: u32,
    pub flags: u32,
}

pub struct RecordedBatch {
    pub words: Vec<u32>,
    /// (word index, buffer handle, declared access) per relocation.
    pub relocs: Vec<(usize, u32, BoAccess)>,
    pub readbacks: Vec<RecordedReadback>,
}

/// Backend that completes every submission immediately. Readback
/// destinations receive the next scripted value, or zero once the
/// script runs dry.
#[derive(Default)]
pub struct RecordingBackend {
    pub batches: Vec<RecordedBatch>,
    script: VecDeque<u32>,
}

impl RecordingBackend {
    pub fn script_readbacks(&mut self, values: impl IntoIterator<Item = u32>) {
        self.script.extend(values);
    }

    /// Total readback requests observed across all batches.
    pub fn readback_count(&self) -> usize {
        self.batches.iter().map(|b| b.readbacks.len()).sum()
    }
}

impl SubmitBackend for RecordingBackend {
    fn submit_and_wait(&mut self, batch: StreamBatch<'_>) -> Result<(), DeviceError> {
        for rb in batch.readbacks {
            let value = self.script.pop_front().unwrap_or(0);
            rb.bo.write_u32(rb.offset as usize, value);
        }
        self.batches.push(RecordedBatch {
            words: batch.words.to_vec(),
            relocs: batch
                .relocs
                .iter()
                .map(|r| (r.word_index, r.bo.handle(), r.access))
                .collect(),
            readbacks: batch
                .readbacks
                .iter()
                .map(|r| RecordedReadback {
                    bo_handle: r.bo.handle(),
                    offset: r.offset,
                    reg: r.reg,
                    select_reg: r.select_reg,
                    select_value: r.select_value,
                    flags: r.flags,
                })
                .collect(),
        });
        Ok(())
    }
}
