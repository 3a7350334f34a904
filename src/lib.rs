//! GPU command-stream exerciser
//!
//! Builds hardware command streams, submits them to an etnaviv-style DRM
//! device, and synchronously reads back what the GPU wrote into shared
//! memory. Two tools sit on the same primitive: `etna-watch` samples the
//! debug/performance counters of ten hardware modules into a live grid,
//! and `etna-yuv-test` drives the resolve engine through three YUV
//! layouts and verifies the RGBA output against known-correct pixels.

pub mod config;
pub mod device;
pub mod formats;
pub mod protocol;
pub mod resolve;
pub mod sampler;
pub mod stream;
pub mod uapi;

#[cfg(test)]
pub(crate) mod testing;
