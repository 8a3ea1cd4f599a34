//! The request/response surface visualization clients speak.
//!
//! Requests and replies are `bincode`-encoded enums behind a four-byte
//! protocol magic; the transport (see [`crate::RpcServer`]) moves them as
//! length-framed messages over TCP. The recon stream payload is a tagged
//! union: either a slice or a volume message.

use serde::{Deserialize, Serialize};

use tc_types::{Orientation, ScanMode, ServerState};

const MAGIC: [u8; 4] = *b"TC00";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RpcRequest {
    SetServerState {
        state: ServerState,
    },
    SetScanMode {
        mode: ScanMode,
        update_interval: u32,
    },
    SetDownsampling {
        col: u32,
        row: u32,
    },
    SetRampFilter {
        name: String,
    },
    /// Choose which projection within the sampling stride is previewed.
    SetProjection {
        id: u64,
    },
    GetProjectionData,
    SetSlice {
        timestamp: u64,
        orientation: Orientation,
    },
    SetVolume {
        required: bool,
    },
    GetReconData,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RpcReply {
    Ack,
    Projection(Option<ProjectionData>),
    Recon(Vec<ReconData>),
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectionData {
    pub id: u64,
    pub col_count: u32,
    pub row_count: u32,
    /// Raw little-endian `u16` pixels.
    pub data: Vec<u8>,
}

/// One message of the reconstruction stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReconData {
    Slice {
        timestamp: u64,
        col_count: u32,
        row_count: u32,
        /// Raw little-endian `f32` pixels.
        data: Vec<u8>,
    },
    Volume {
        col_count: u32,
        row_count: u32,
        slice_count: u32,
        /// Raw little-endian `f32` voxels.
        data: Vec<u8>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RpcDecodeError {
    #[error("message didn't start with the correct prefix")]
    BadMagic,
    #[error("bincode: {0}")]
    Encoding(#[from] bincode::Error),
}

pub fn encode<T: Serialize>(msg: &T) -> Vec<u8> {
    let mut bytes = MAGIC.to_vec();
    bincode::serialize_into(&mut bytes, msg).expect("rpc types always serialize");
    bytes
}

pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, RpcDecodeError> {
    let payload = data
        .strip_prefix(&MAGIC)
        .ok_or(RpcDecodeError::BadMagic)?;
    Ok(bincode::deserialize(payload)?)
}
