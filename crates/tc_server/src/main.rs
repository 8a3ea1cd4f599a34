//! The tomocast reconstruction server binary.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use tc_daq::{SocketMode, TcpDaqClient};
use tc_imgproc::{FilterFactory as _, RampFilterFactory};
use tc_recon::FbpReconstructorFactory;
use tc_server::Application;
use tc_types::{
    BeamShape, ImageprocParams, PaganinParams, RampFilterParams, RpcServerConfig, ServerState,
};

/// Live 3D tomographic reconstruction server.
#[derive(Parser, Debug)]
#[command(name = "tomocast", version, about)]
struct Args {
    /// Start data processing automatically, without waiting for a trigger
    /// from the GUI client.
    #[arg(long)]
    auto_processing: bool,

    /// Hostname of the DAQ data server.
    #[arg(long, default_value = "localhost", help_heading = "Connection")]
    daq_host: String,

    /// Socket port of the DAQ data server.
    #[arg(long, default_value_t = 9667, help_heading = "Connection")]
    daq_port: u16,

    /// Socket type of the DAQ data server. Options: sub/pull.
    #[arg(long, default_value = "pull", help_heading = "Connection")]
    daq_socket: String,

    /// Port of the RPC server.
    #[arg(long, default_value_t = 9971, help_heading = "Connection")]
    rpc_port: u16,

    /// Detector width in pixels.
    #[arg(long, default_value_t = 2016, help_heading = "Geometry")]
    cols: usize,

    /// Detector height in pixels.
    #[arg(long, default_value_t = 1200, help_heading = "Geometry")]
    rows: usize,

    /// Downsampling factor along both the row and the column. Overridden
    /// by `downsample-col` / `downsample-row` where given.
    #[arg(long, default_value_t = 1, help_heading = "Geometry")]
    downsample: u32,

    /// Downsampling factor along the column.
    #[arg(long, help_heading = "Geometry")]
    downsample_col: Option<u32>,

    /// Downsampling factor along the row.
    #[arg(long, help_heading = "Geometry")]
    downsample_row: Option<u32>,

    /// Number of projections per scan.
    #[arg(long, default_value_t = 128, help_heading = "Geometry")]
    angles: usize,

    /// Switch to cone-beam geometry.
    #[arg(long, help_heading = "Geometry")]
    cone_beam: bool,

    /// Source-to-origin distance of the cone beam.
    #[arg(long, default_value_t = 0.0, help_heading = "Geometry")]
    source2origin: f32,

    /// Origin-to-detector distance of the cone beam.
    #[arg(long, default_value_t = 0.0, help_heading = "Geometry")]
    origin2detector: f32,

    /// Minimal X-coordinate of the reconstructed volume.
    #[arg(long, help_heading = "Geometry")]
    minx: Option<f32>,

    /// Maximal X-coordinate of the reconstructed volume.
    #[arg(long, help_heading = "Geometry")]
    maxx: Option<f32>,

    /// Minimal Y-coordinate of the reconstructed volume.
    #[arg(long, help_heading = "Geometry")]
    miny: Option<f32>,

    /// Maximal Y-coordinate of the reconstructed volume.
    #[arg(long, help_heading = "Geometry")]
    maxy: Option<f32>,

    /// Minimal Z-coordinate of the reconstructed volume.
    #[arg(long, help_heading = "Geometry")]
    minz: Option<f32>,

    /// Maximal Z-coordinate of the reconstructed volume.
    #[arg(long, help_heading = "Geometry")]
    maxz: Option<f32>,

    /// Switch to the Paganin phase-retrieval filter.
    #[arg(long, help_heading = "Preprocessing")]
    retrieve_phase: bool,

    /// Supported filters are: shepp (Shepp-Logan), ramlak (Ram-Lak).
    #[arg(long, default_value = "shepp", help_heading = "Preprocessing")]
    ramp_filter: String,

    /// Size of the square reconstructed slice in pixels. Defaults to the
    /// detector columns, expanded for the reconstruction backend.
    #[arg(long, help_heading = "Reconstruction")]
    slice_size: Option<usize>,

    /// Size of the cubic reconstructed volume for preview.
    #[arg(long, help_heading = "Reconstruction")]
    preview_size: Option<usize>,

    /// Number of required dark images.
    #[arg(long, default_value_t = 10, help_heading = "Reconstruction")]
    darks: usize,

    /// Number of required flat images.
    #[arg(long, default_value_t = 10, help_heading = "Reconstruction")]
    flats: usize,

    /// Detector pixel size.
    #[arg(long, default_value_t = 1.0, help_heading = "Paganin")]
    pixel_size: f32,

    /// X-ray wavelength.
    #[arg(long, default_value_t = 1.239_841_9e-9, help_heading = "Paganin")]
    lambda: f32,

    /// Refractive index decrement of the sample material.
    #[arg(long, default_value_t = 1e-8, help_heading = "Paganin")]
    delta: f32,

    /// Absorption index of the sample material.
    #[arg(long, default_value_t = 1e-10, help_heading = "Paganin")]
    beta: f32,

    /// Sample-detector propagation distance.
    #[arg(long, default_value_t = 40.0, help_heading = "Paganin")]
    distance: f32,

    /// Maximum number of projection groups cached in the memory buffer.
    #[arg(long, default_value_t = 10, help_heading = "Pipeline")]
    raw_buffer_size: usize,

    /// Number of threads used for image processing.
    #[arg(long, help_heading = "Pipeline")]
    imageproc_threads: Option<usize>,

    /// Drop stale projection groups instead of back-pressuring the DAQ
    /// stream when the pipeline falls behind.
    #[arg(long, help_heading = "Pipeline")]
    no_wait_on_slowness: bool,
}

fn main() -> anyhow::Result<()> {
    tc_log::setup_logging();

    let args = Args::parse();

    anyhow::ensure!(args.raw_buffer_size > 0, "raw-buffer-size must be positive");
    for (name, min, max) in [
        ("x", args.minx, args.maxx),
        ("y", args.miny, args.maxy),
        ("z", args.minz, args.maxz),
    ] {
        if let (Some(min), Some(max)) = (min, max) {
            anyhow::ensure!(
                min < max,
                "invalid {name} bounding box: min ({min}) must be smaller than max ({max})"
            );
        }
    }

    let downsampling_row = args.downsample_row.unwrap_or(args.downsample).max(1);
    let downsampling_col = args.downsample_col.unwrap_or(args.downsample).max(1);

    let ramp_filter_factory = RampFilterFactory;
    // Fail fast on an unknown filter name instead of at the first scan.
    ramp_filter_factory
        .create(&args.ramp_filter, 8, 1, 1)
        .context("invalid --ramp-filter")?;

    let socket_mode: SocketMode = args
        .daq_socket
        .parse()
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    let endpoint = format!("{}:{}", args.daq_host, args.daq_port);
    let daq_client = TcpDaqClient::connect(
        &endpoint,
        socket_mode,
        Application::default_daq_concurrency(),
    )
    .with_context(|| format!("failed to connect to the DAQ server at {endpoint}"))?;

    let imageproc_params = ImageprocParams {
        num_threads: args
            .imageproc_threads
            .unwrap_or_else(Application::default_imageproc_concurrency),
        downsampling_col,
        downsampling_row,
        disable_negative_log: false,
        ramp_filter: RampFilterParams {
            name: args.ramp_filter.clone(),
        },
    };

    let app = Application::new(
        args.raw_buffer_size,
        imageproc_params,
        Box::new(daq_client),
        Arc::new(ramp_filter_factory),
        Box::new(FbpReconstructorFactory),
        RpcServerConfig {
            port: args.rpc_port,
        },
    );

    app.set_flat_field_params(args.darks, args.flats);
    if args.retrieve_phase {
        app.set_paganin_params(PaganinParams {
            pixel_size: args.pixel_size,
            lambda: args.lambda,
            delta: args.delta,
            beta: args.beta,
            distance: args.distance,
        });
    }
    app.set_projection_geometry(
        if args.cone_beam {
            BeamShape::Cone
        } else {
            BeamShape::Parallel
        },
        args.cols,
        args.rows,
        1.0,
        1.0,
        args.source2origin,
        args.origin2detector,
        args.angles,
    );
    app.set_recon_geometry(
        args.slice_size,
        args.preview_size,
        args.minx,
        args.maxx,
        args.miny,
        args.maxy,
        args.minz,
        args.maxz,
    );
    app.set_pipeline_policy(!args.no_wait_on_slowness);

    app.spin(if args.auto_processing {
        ServerState::Processing
    } else {
        ServerState::Ready
    })
}
