use std::io;
use std::net::TcpStream;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use ndarray::Array2;
use parking_lot::Mutex;

use tc_buffer::BoundedQueue;
use tc_log::{error, info, warn};
use tc_types::{DAQ_BUFFER_SIZE, DAQ_MONITOR_EVERY, ProjectionType, RawPixel};

use crate::codec::{FrameMeta, read_message};
use crate::{DaqClient, Projection};

/// How the upstream delivers frames. A pull socket owns the stream; a
/// subscribe socket shares a broadcast. Both reduce to reading framed
/// message pairs here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketMode {
    Pull,
    Sub,
}

impl FromStr for SocketMode {
    type Err = UnsupportedSocketMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull" => Ok(Self::Pull),
            "sub" => Ok(Self::Sub),
            _ => Err(UnsupportedSocketMode(s.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unsupported socket type: {0}")]
pub struct UnsupportedSocketMode(String);

/// Receives the detector stream over TCP with `concurrency` workers
/// sharing one mutex-guarded socket.
///
/// Each worker atomically receives a metadata/data message pair, parses
/// and validates it, and enqueues the classified frame on the bounded
/// ingest queue. Malformed metadata, unknown scan indices and shape
/// mismatches are logged and dropped; the stream continues.
pub struct TcpDaqClient {
    socket: Arc<Mutex<TcpStream>>,
    queue: Arc<BoundedQueue<Projection>>,
    running: Arc<AtomicBool>,
    started: AtomicBool,
    shared: Arc<WorkerShared>,
    concurrency: usize,
}

struct WorkerShared {
    acquiring: AtomicBool,
    /// First-observed frame shape (rows, cols); later frames must match.
    expected_shape: Mutex<Option<(usize, usize)>>,
    projections_received: AtomicUsize,
}

impl TcpDaqClient {
    /// Connects to the data server; fails fast if it is unreachable.
    pub fn connect(endpoint: &str, mode: SocketMode, concurrency: usize) -> io::Result<Self> {
        let socket = TcpStream::connect(endpoint)?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        match mode {
            SocketMode::Sub => info!("Connected to data server (PUB-SUB) at {endpoint}"),
            SocketMode::Pull => info!("Connected to data server (PUSH-PULL) at {endpoint}"),
        }

        Ok(Self::from_socket(socket, concurrency))
    }

    /// Wraps an already-connected socket; used by the loopback tests.
    pub fn from_socket(socket: TcpStream, concurrency: usize) -> Self {
        Self {
            socket: Arc::new(Mutex::new(socket)),
            queue: Arc::new(BoundedQueue::new(DAQ_BUFFER_SIZE)),
            running: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            shared: Arc::new(WorkerShared {
                acquiring: AtomicBool::new(false),
                expected_shape: Mutex::new(None),
                projections_received: AtomicUsize::new(0),
            }),
            concurrency,
        }
    }

    fn try_receive_frame(
        socket: &Mutex<TcpStream>,
        running: &AtomicBool,
        shared: &WorkerShared,
    ) -> Option<Projection> {
        let keep_going = || running.load(Ordering::Relaxed);

        // One lock spans the metadata message and its paired data message.
        let (meta, payload) = {
            let mut stream = socket.lock();
            let meta = match read_message(&mut *stream, &keep_going) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return None,
                Err(err) => {
                    error!("Failed to receive metadata: {err}");
                    return None;
                }
            };
            let payload = match read_message(&mut *stream, &keep_going) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return None,
                Err(err) => {
                    error!("Failed to receive frame data: {err}");
                    return None;
                }
            };
            (meta, payload)
        };

        let meta: FrameMeta = match serde_json::from_slice(&meta) {
            Ok(meta) => meta,
            Err(err) => {
                error!("Failed to parse metadata: {err}");
                return None;
            }
        };

        let kind = ProjectionType::from_scan_index(meta.image_attributes.scan_index);
        if kind == ProjectionType::Unknown {
            warn!(
                "Unknown scan index: {}, frame dropped",
                meta.image_attributes.scan_index
            );
            return None;
        }

        let [num_rows, num_cols] = meta.shape;
        {
            let mut expected = shared.expected_shape.lock();
            match *expected {
                Some((rows, cols)) => {
                    if (num_rows, num_cols) != (rows, cols) {
                        warn!(
                            "Received image data with a different shape. Current: {num_rows} x {num_cols}, before: {rows} x {cols}"
                        );
                        return None;
                    }
                }
                None => *expected = Some((num_rows, num_cols)),
            }
        }

        if payload.len() != num_rows * num_cols * size_of::<RawPixel>() {
            warn!(
                "Pixel payload size {} does not match shape {num_rows} x {num_cols}, frame dropped",
                payload.len()
            );
            return None;
        }

        let pixels: Vec<RawPixel> = payload
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        let data = Array2::from_shape_vec((num_rows, num_cols), pixels)
            .expect("length checked against shape above");

        if kind == ProjectionType::Projection {
            let received = shared.projections_received.fetch_add(1, Ordering::Relaxed) + 1;
            if received % DAQ_MONITOR_EVERY == 0 {
                info!("# of projections received: {received}");
            }
        } else {
            // A dark or a flat marks the start of a new scan.
            shared.projections_received.store(0, Ordering::Relaxed);
        }

        Some(Projection {
            kind,
            index: meta.frame as usize,
            data,
        })
    }
}

impl DaqClient for TcpDaqClient {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("DAQ client is already running!");
            return;
        }

        info!("Starting DAQ client (concurrency = {})", self.concurrency);
        self.running.store(true, Ordering::SeqCst);

        for _ in 0..self.concurrency {
            let queue = self.queue.clone();
            let running = self.running.clone();
            let shared = self.shared.clone();
            let socket = self.socket.clone();

            std::thread::spawn(move || {
                while running.load(Ordering::Relaxed) {
                    if !shared.acquiring.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_millis(100));
                        continue;
                    }

                    let Some(mut projection) = Self::try_receive_frame(&socket, &running, &shared)
                    else {
                        continue;
                    };

                    while running.load(Ordering::Relaxed) {
                        match queue.try_push(projection) {
                            Ok(()) => break,
                            Err(rejected) => {
                                // Full: back-pressure the upstream by not
                                // receiving for a while.
                                projection = rejected;
                                std::thread::sleep(Duration::from_millis(100));
                            }
                        }
                    }
                }
            });
        }
    }

    fn start_acquiring(&self) {
        self.shared.acquiring.store(true, Ordering::SeqCst);
    }

    fn stop_acquiring(&self) {
        self.shared.acquiring.store(false, Ordering::SeqCst);
    }

    fn next(&self) -> Option<Projection> {
        self.queue.wait_pop(Duration::from_millis(100))
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }
}

impl Drop for TcpDaqClient {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ImageAttributes, write_frame, write_message};

    use std::net::TcpListener;

    fn loopback_client(concurrency: usize) -> (TcpDaqClient, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_side = TcpStream::connect(addr).unwrap();
        client_side
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (
            TcpDaqClient::from_socket(client_side, concurrency),
            server_side,
        )
    }

    fn meta(frame: u64, shape: [usize; 2], scan_index: i64) -> FrameMeta {
        FrameMeta {
            frame,
            shape,
            image_attributes: ImageAttributes { scan_index },
        }
    }

    #[test]
    fn test_receives_classified_frames() {
        let (client, mut server) = loopback_client(2);
        client.start();
        client.start_acquiring();

        write_frame(&mut server, &meta(0, [2, 3], 0), &[0; 6]).unwrap();
        write_frame(&mut server, &meta(1, [2, 3], 1), &[1; 6]).unwrap();
        write_frame(&mut server, &meta(2, [2, 3], 2), &[2, 3, 4, 5, 6, 7]).unwrap();

        let mut got = Vec::new();
        while got.len() < 3 {
            if let Some(projection) = client.next() {
                got.push(projection);
            }
        }
        got.sort_by_key(|p| p.index);

        assert_eq!(got[0].kind, ProjectionType::Dark);
        assert_eq!(got[1].kind, ProjectionType::Flat);
        assert_eq!(got[2].kind, ProjectionType::Projection);
        assert_eq!(got[2].data.dim(), (2, 3));
        assert_eq!(got[2].data[[1, 2]], 7);
    }

    #[test]
    fn test_drops_unknown_scan_index_and_shape_mismatch() {
        let (client, mut server) = loopback_client(1);
        client.start();
        client.start_acquiring();

        write_frame(&mut server, &meta(0, [2, 3], 7), &[0; 6]).unwrap();
        write_frame(&mut server, &meta(1, [2, 3], 2), &[1; 6]).unwrap();
        // Shape differs from the first accepted frame:
        write_frame(&mut server, &meta(2, [3, 3], 2), &[2; 9]).unwrap();
        write_frame(&mut server, &meta(3, [2, 3], 2), &[3; 6]).unwrap();

        let mut got = Vec::new();
        for _ in 0..20 {
            if let Some(projection) = client.next() {
                got.push(projection.index);
            }
            if got.len() == 2 {
                break;
            }
        }
        assert_eq!(got, [1, 3]);
    }

    #[test]
    fn test_rejects_malformed_metadata() {
        let (client, mut server) = loopback_client(1);
        client.start();
        client.start_acquiring();

        write_message(&mut server, b"{not json").unwrap();
        write_message(&mut server, &[0; 12]).unwrap();
        write_frame(&mut server, &meta(0, [2, 3], 2), &[1; 6]).unwrap();

        let mut got = None;
        for _ in 0..20 {
            if let Some(projection) = client.next() {
                got = Some(projection.index);
                break;
            }
        }
        assert_eq!(got, Some(0));
    }

    #[test]
    fn test_does_not_receive_while_not_acquiring() {
        let (client, mut server) = loopback_client(1);
        client.start();

        write_frame(&mut server, &meta(0, [2, 3], 2), &[1; 6]).unwrap();
        assert!(client.next().is_none());

        client.start_acquiring();
        let mut got = None;
        for _ in 0..20 {
            if let Some(projection) = client.next() {
                got = Some(projection.index);
                break;
            }
        }
        assert_eq!(got, Some(0));
    }
}
