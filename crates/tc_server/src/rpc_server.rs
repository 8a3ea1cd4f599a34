use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tc_daq::{read_message, write_message};
use tc_log::{debug, info, warn};
use tc_types::RpcServerConfig;

use crate::Application;
use crate::rpc::{self, RpcReply, RpcRequest};

/// Serves the request/response surface over length-framed TCP.
///
/// One thread accepts connections; each connection gets its own worker
/// reading requests and writing replies until the peer hangs up or the
/// server shuts down. A malformed request is answered with an error
/// status and the connection continues.
pub struct RpcServer;

impl RpcServer {
    /// Binds and starts serving; returns the bound address (useful when
    /// the configured port is 0).
    pub fn start(
        app: Arc<Application>,
        config: RpcServerConfig,
    ) -> io::Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        let local_addr = listener.local_addr()?;
        info!("Starting RPC services at {local_addr}");

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                if app.is_closing() {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let app = app.clone();
                        std::thread::spawn(move || handle_connection(&app, stream));
                    }
                    Err(err) => warn!("Failed to accept RPC connection: {err}"),
                }
            }
        });
        Ok(local_addr)
    }
}

fn handle_connection(app: &Application, mut stream: TcpStream) {
    if let Ok(peer) = stream.peer_addr() {
        debug!("New RPC connection from {peer}");
    }
    if stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .is_err()
    {
        return;
    }

    let keep_going = || !app.is_closing();
    while !app.is_closing() {
        let message = match read_message(&mut stream, &keep_going) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                debug!("RPC connection closed: {err}");
                break;
            }
        };

        let reply = match rpc::decode::<RpcRequest>(&message) {
            Ok(request) => dispatch(app, request),
            Err(err) => RpcReply::Error(err.to_string()),
        };

        if write_message(&mut stream, &rpc::encode(&reply)).is_err() {
            break;
        }
    }
}

fn dispatch(app: &Application, request: RpcRequest) -> RpcReply {
    match request {
        RpcRequest::SetServerState { state } => {
            app.on_state_changed(state);
            RpcReply::Ack
        }
        RpcRequest::SetScanMode {
            mode,
            update_interval,
        } => {
            app.set_scan_mode(mode, update_interval);
            RpcReply::Ack
        }
        RpcRequest::SetDownsampling { col, row } => {
            app.set_downsampling(col, row);
            RpcReply::Ack
        }
        RpcRequest::SetRampFilter { name } => {
            app.set_ramp_filter(&name);
            RpcReply::Ack
        }
        RpcRequest::SetProjection { id } => {
            app.set_projection_req(id as usize);
            RpcReply::Ack
        }
        RpcRequest::GetProjectionData => {
            RpcReply::Projection(app.get_projection_data(Duration::from_millis(100)))
        }
        RpcRequest::SetSlice {
            timestamp,
            orientation,
        } => {
            app.set_slice(timestamp, orientation);
            RpcReply::Ack
        }
        RpcRequest::SetVolume { required } => {
            app.set_volume(required);
            RpcReply::Ack
        }
        RpcRequest::GetReconData => RpcReply::Recon(app.get_recon_data()),
    }
}
