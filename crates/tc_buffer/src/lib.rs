//! The hand-off primitives between the stages of the streaming
//! reconstruction pipeline.
//!
//! Every cross-stage boundary is one of:
//!
//! * [`BoundedQueue`]: a multi-producer/multi-consumer queue with an
//!   optional drop-oldest-when-full policy, used for frame ingest and the
//!   projection preview.
//! * [`TripleBuffer`]: a single-latest-value hand-off between one
//!   producer and one consumer (sinograms, preview volumes). The producer
//!   and the consumer each *own* their working value and exchange it with
//!   the shared ready slot by swap, so neither ever blocks the other
//!   while touching its own side.
//! * [`MemoryBuffer`]: the group assembler, mapping incoming frame
//!   indices to chunk slots, filling rows of a 3-D tensor (downsampling
//!   on the way in) and signalling when a whole group is ready.
//! * [`SliceBuffer`]: a triple-buffered map of reconstructed slices,
//!   with the on-demand variant clearing ready flags on every swap so
//!   consumers only ever observe freshly produced slices.

mod memory;
mod queue;
mod slice;
mod triple;

pub use memory::MemoryBuffer;
pub use queue::BoundedQueue;
pub use slice::{SliceBuffer, SliceEntry, SliceMap};
pub use triple::TripleBuffer;
