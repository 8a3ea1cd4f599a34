//! The tomocast reconstruction server.
//!
//! [`Application`] owns the streaming pipeline: frames arrive through a
//! [`tc_daq::DaqClient`], are grouped and preprocessed into sinograms,
//! reconstructed into a preview volume and steerable slices, and fanned
//! out to visualization clients through the RPC surface in [`rpc`].

mod application;
mod monitor;
mod projection_mediator;
pub mod rpc;
mod rpc_server;
mod slice_mediator;

pub use application::{Application, ConfigError};
pub use monitor::Monitor;
pub use projection_mediator::ProjectionMediator;
pub use rpc_server::RpcServer;
pub use slice_mediator::SliceMediator;
