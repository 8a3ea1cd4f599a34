//! The acquisition side of the pipeline: a client that consumes the
//! detector's framed byte stream, classifies frames into darks, flats and
//! projections, and feeds the bounded ingest queue the pipeline consumes
//! from.

mod codec;
mod tcp_client;

pub use codec::{FrameMeta, ImageAttributes, read_message, write_frame, write_message};
pub use tcp_client::{SocketMode, TcpDaqClient};

use ndarray::Array2;

use tc_types::{ProjectionType, RawPixel};

/// One detector frame, classified and decoded.
#[derive(Clone, Debug)]
pub struct Projection {
    pub kind: ProjectionType,
    /// Monotonically increasing frame index.
    pub index: usize,
    pub data: Array2<RawPixel>,
}

/// The contract between the application and whatever feeds it frames.
///
/// Implementations own their worker threads; `next` is the single pull
/// point the consume stage drains.
pub trait DaqClient: Send + Sync {
    /// Spawns the receive workers. Idempotent after the first call.
    fn start(&self);

    fn start_acquiring(&self);

    fn stop_acquiring(&self);

    /// Blocks briefly (~100 ms) for the next frame; `None` on timeout.
    fn next(&self) -> Option<Projection>;

    /// Number of receive workers.
    fn concurrency(&self) -> usize;
}
