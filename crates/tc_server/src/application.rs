use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use ndarray::{Array2, Array3};
use parking_lot::{Condvar, Mutex};

use tc_buffer::{MemoryBuffer, SliceEntry, SliceMap, TripleBuffer};
use tc_daq::{DaqClient, Projection};
use tc_imgproc::{FilterFactory, Preprocessor, compute_reciprocal, downsample};
use tc_log::{debug, error, info, warn, warn_once};
use tc_recon::{Reconstructor, ReconstructorFactory};
use tc_types::{
    BeamShape, ImageprocParams, MAX_NUM_DARKS, MAX_NUM_FLATS, Orientation, PaganinParams,
    ProjectionGeometry, ProjectionType, RawPixel, RpcServerConfig, ScanMode, ServerState,
    VolumeGeometry, default_angles, expand_data_size_for_gpu, valid_scan_update_interval,
};

use crate::monitor::Monitor;
use crate::projection_mediator::ProjectionMediator;
use crate::rpc::{ProjectionData, ReconData};
use crate::rpc_server::RpcServer;
use crate::slice_mediator::SliceMediator;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("minimum of volume coordinate must be smaller than maximum of volume coordinate")]
    InvalidVolumeBoundary,
    #[error(transparent)]
    UnknownFilter(#[from] tc_imgproc::UnknownFilter),
}

fn parse_volume_boundary(
    min_val: Option<f32>,
    max_val: Option<f32>,
    size: usize,
) -> Result<(f32, f32), ConfigError> {
    let min_v = min_val.unwrap_or(-(size as f32) / 2.0);
    let max_v = max_val.unwrap_or(size as f32 / 2.0);
    if min_v >= max_v {
        return Err(ConfigError::InvalidVolumeBoundary);
    }
    Ok((min_v, max_v))
}

struct FlatFieldState {
    darks: Vec<Array2<RawPixel>>,
    flats: Vec<Array2<RawPixel>>,
    /// Downsampled averages; behind `Arc` so the preprocessing stage can
    /// use them without holding this lock.
    dark_avg: Arc<Array2<f32>>,
    reciprocal: Arc<Array2<f32>>,
    computed: bool,
    required_darks: usize,
    required_flats: usize,
}

struct Geometry {
    proj_geom: ProjectionGeometry,
    slice_size: Option<usize>,
    volume_size: Option<usize>,
    min_x: Option<f32>,
    max_x: Option<f32>,
    min_y: Option<f32>,
    max_y: Option<f32>,
    min_z: Option<f32>,
    max_z: Option<f32>,
}

struct GpuState {
    recon: Option<Box<dyn Reconstructor>>,
    buffer_index: usize,
    sino_uploaded: bool,
    /// `[slices, rows, cols]` of the preview volume.
    volume_shape: (usize, usize, usize),
    /// `[rows, group, cols]` expected of each uploaded chunk.
    sino_shape: (usize, usize, usize),
}

/// The pipeline controller: owns every stage, the state machine, the
/// back-pressure policy and the parameter surface the RPC adapter calls
/// into.
pub struct Application {
    raw_buffer: MemoryBuffer,
    flat_field: Mutex<FlatFieldState>,
    sino_buffer: TripleBuffer<Array3<f32>>,
    volume_buffer: TripleBuffer<Array3<f32>>,

    proj_mediator: ProjectionMediator,
    slice_mediator: SliceMediator,

    preproc: Mutex<Preprocessor>,
    /// Set when the ramp-filter choice changed; the preprocessing stage
    /// swaps filters between chunks, never mid-chunk.
    filter_changed: AtomicBool,
    imgproc_params: Mutex<ImageprocParams>,
    paganin_params: Mutex<Option<PaganinParams>>,

    geometry: Mutex<Geometry>,
    volume_required: AtomicBool,

    recon_factory: Box<dyn ReconstructorFactory>,
    gpu: Mutex<GpuState>,
    gpu_cv: Condvar,
    sino_initialized: AtomicBool,

    server_state: AtomicU8,
    scan_mode: Mutex<(ScanMode, u32)>,
    group_size: AtomicUsize,
    pipeline_wait_on_slowness: AtomicBool,

    monitor: Mutex<Monitor>,
    daq_client: Box<dyn DaqClient>,
    rpc_config: RpcServerConfig,
    closing: AtomicBool,

    // Consumer-owned front values of the fan-out buffers.
    volume_front: Mutex<Array3<f32>>,
    all_slices_front: Mutex<SliceMap>,
    ondemand_front: Mutex<SliceMap>,
}

impl Application {
    pub fn default_imageproc_concurrency() -> usize {
        let n = std::thread::available_parallelism().map_or(1, |n| n.get());
        if n > 2 { n / 2 } else { 1 }
    }

    pub fn default_daq_concurrency() -> usize {
        2
    }

    pub fn new(
        raw_buffer_size: usize,
        imageproc_params: ImageprocParams,
        daq_client: Box<dyn DaqClient>,
        ramp_filter_factory: Arc<dyn FilterFactory>,
        recon_factory: Box<dyn ReconstructorFactory>,
        rpc_config: RpcServerConfig,
    ) -> Arc<Self> {
        let preproc = Preprocessor::new(ramp_filter_factory, imageproc_params.num_threads);

        Arc::new(Self {
            raw_buffer: MemoryBuffer::new(raw_buffer_size),
            flat_field: Mutex::new(FlatFieldState {
                darks: Vec::new(),
                flats: Vec::new(),
                dark_avg: Arc::new(Array2::zeros((0, 0))),
                reciprocal: Arc::new(Array2::zeros((0, 0))),
                computed: false,
                required_darks: 10,
                required_flats: 10,
            }),
            sino_buffer: TripleBuffer::new(Array3::zeros((0, 0, 0))),
            volume_buffer: TripleBuffer::new(Array3::zeros((0, 0, 0))),
            proj_mediator: ProjectionMediator::default(),
            slice_mediator: SliceMediator::new(),
            preproc: Mutex::new(preproc),
            filter_changed: AtomicBool::new(false),
            imgproc_params: Mutex::new(imageproc_params),
            paganin_params: Mutex::new(None),
            geometry: Mutex::new(Geometry {
                proj_geom: ProjectionGeometry::default(),
                slice_size: None,
                volume_size: None,
                min_x: None,
                max_x: None,
                min_y: None,
                max_y: None,
                min_z: None,
                max_z: None,
            }),
            volume_required: AtomicBool::new(true),
            recon_factory,
            gpu: Mutex::new(GpuState {
                recon: None,
                buffer_index: 0,
                sino_uploaded: false,
                volume_shape: (0, 0, 0),
                sino_shape: (0, 0, 0),
            }),
            gpu_cv: Condvar::new(),
            sino_initialized: AtomicBool::new(false),
            server_state: AtomicU8::new(ServerState::Unknown as u8),
            scan_mode: Mutex::new((ScanMode::Discrete, tc_types::MIN_SCAN_UPDATE_INTERVAL)),
            group_size: AtomicUsize::new(0),
            pipeline_wait_on_slowness: AtomicBool::new(true),
            monitor: Mutex::new(Monitor::default()),
            daq_client,
            rpc_config,
            closing: AtomicBool::new(false),
            volume_front: Mutex::new(Array3::zeros((0, 0, 0))),
            all_slices_front: Mutex::new(SliceMap::new()),
            ondemand_front: Mutex::new(SliceMap::new()),
        })
    }

    // ------------------------------------------------------------------
    // Parameters

    pub fn set_projection_geometry(
        &self,
        beam_shape: BeamShape,
        col_count: usize,
        row_count: usize,
        pixel_width: f32,
        pixel_height: f32,
        source2origin: f32,
        origin2detector: f32,
        num_angles: usize,
    ) {
        self.geometry.lock().proj_geom = ProjectionGeometry {
            beam_shape,
            col_count,
            row_count,
            pixel_width,
            pixel_height,
            source2origin,
            origin2detector,
            angles: default_angles(num_angles),
        };
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_recon_geometry(
        &self,
        slice_size: Option<usize>,
        volume_size: Option<usize>,
        min_x: Option<f32>,
        max_x: Option<f32>,
        min_y: Option<f32>,
        max_y: Option<f32>,
        min_z: Option<f32>,
        max_z: Option<f32>,
    ) {
        let mut geometry = self.geometry.lock();
        geometry.slice_size = slice_size;
        geometry.volume_size = volume_size;
        geometry.min_x = min_x;
        geometry.max_x = max_x;
        geometry.min_y = min_y;
        geometry.max_y = max_y;
        geometry.min_z = min_z;
        geometry.max_z = max_z;
        // Initialization is delayed until processing starts.
    }

    pub fn set_paganin_params(&self, params: PaganinParams) {
        *self.paganin_params.lock() = Some(params);
    }

    pub fn set_flat_field_params(&self, num_darks: usize, num_flats: usize) {
        let mut flat_field = self.flat_field.lock();
        flat_field.required_darks = num_darks.min(MAX_NUM_DARKS);
        flat_field.required_flats = num_flats.min(MAX_NUM_FLATS);
    }

    pub fn set_pipeline_policy(&self, wait_on_slowness: bool) {
        self.pipeline_wait_on_slowness
            .store(wait_on_slowness, Ordering::Relaxed);
    }

    pub fn set_downsampling(&self, col: u32, row: u32) {
        {
            let mut params = self.imgproc_params.lock();
            params.downsampling_col = col.max(1);
            params.downsampling_row = row.max(1);
        }
        // A resolution change invalidates the reciprocal.
        self.flat_field.lock().computed = false;
        debug!("Set projection downsampling: {col} / {row}");
    }

    pub fn set_ramp_filter(&self, filter_name: &str) {
        self.imgproc_params.lock().ramp_filter.name = filter_name.to_owned();
        self.filter_changed.store(true, Ordering::Release);
        debug!("Set ramp filter: {filter_name}");
    }

    pub fn set_projection_req(&self, id: usize) {
        self.proj_mediator.set_id(id);
    }

    pub fn set_slice(&self, timestamp: u64, orientation: Orientation) {
        self.slice_mediator.update(timestamp, orientation);
    }

    pub fn set_volume(&self, required: bool) {
        self.volume_required.store(required, Ordering::Relaxed);
    }

    pub fn set_scan_mode(&self, mode: ScanMode, update_interval: u32) {
        let state = self.server_state();
        if state != ServerState::Ready && state != ServerState::Unknown {
            warn!("Scan mode can only be changed while the server is READY");
            return;
        }
        if mode == ScanMode::Continuous && !valid_scan_update_interval(update_interval) {
            warn!("Invalid scan update interval: {update_interval}");
            return;
        }

        *self.scan_mode.lock() = (mode, update_interval);
        match mode {
            ScanMode::Discrete => debug!("Set scan mode: discrete"),
            ScanMode::Continuous => {
                debug!("Set scan mode: continuous, update interval {update_interval}");
            }
        }
    }

    // ------------------------------------------------------------------
    // State machine

    pub fn server_state(&self) -> ServerState {
        ServerState::from_u8(self.server_state.load(Ordering::Acquire))
    }

    fn set_server_state(&self, state: ServerState) {
        self.server_state.store(state as u8, Ordering::Release);
    }

    pub fn on_state_changed(&self, state: ServerState) {
        match state {
            ServerState::Acquiring => self.start_acquiring(),
            ServerState::Processing => self.start_processing(),
            ServerState::Ready => match self.server_state() {
                ServerState::Acquiring => self.stop_acquiring(),
                ServerState::Processing => self.stop_processing(),
                _ => self.set_server_state(ServerState::Ready),
            },
            ServerState::Unknown => warn!("Ignoring request for server state UNKNOWN"),
        }
    }

    pub fn start_acquiring(&self) {
        match self.server_state() {
            ServerState::Acquiring => {
                warn!("Server already in state ACQUIRING");
                return;
            }
            ServerState::Processing => {
                warn!("Server already in state PROCESSING");
                return;
            }
            _ => {}
        }

        self.init_params();
        self.daq_client.start_acquiring();
        self.set_server_state(ServerState::Acquiring);
        info!("Start acquiring data");

        self.reset_monitor();
    }

    pub fn stop_acquiring(&self) {
        if self.server_state() != ServerState::Acquiring {
            warn!("Server not in state ACQUIRING");
            return;
        }

        self.daq_client.stop_acquiring();
        self.set_server_state(ServerState::Ready);
        info!("Stop acquiring data");

        self.proj_mediator.reset();
        self.monitor.lock().summarize();
    }

    pub fn start_processing(&self) {
        match self.server_state() {
            ServerState::Processing => {
                warn!("Server already in state PROCESSING");
                return;
            }
            ServerState::Acquiring => {
                warn!("Server already in state ACQUIRING");
                return;
            }
            _ => {}
        }

        if let Err(err) = self.init() {
            error!("Failed to initialize processing: {err}");
            return;
        }

        self.daq_client.start_acquiring();
        self.set_server_state(ServerState::Processing);
        info!("Start acquiring and processing data:");

        let (mode, update_interval) = *self.scan_mode.lock();
        match mode {
            ScanMode::Continuous => {
                info!("- Scan mode: continuous");
                info!("- Update interval: {update_interval}");
            }
            ScanMode::Discrete => info!("- Scan mode: discrete"),
        }

        self.reset_monitor();
    }

    pub fn stop_processing(&self) {
        if self.server_state() != ServerState::Processing {
            warn!("Server not in state PROCESSING");
            return;
        }

        self.daq_client.stop_acquiring();
        self.set_server_state(ServerState::Ready);
        info!("Stop acquiring and processing data");

        self.proj_mediator.reset();
        self.monitor.lock().summarize();
    }

    fn reset_monitor(&self) {
        let (frame_bytes, group_size) = {
            let geometry = self.geometry.lock();
            (
                geometry.proj_geom.row_count
                    * geometry.proj_geom.col_count
                    * size_of::<RawPixel>(),
                self.group_size.load(Ordering::Relaxed),
            )
        };
        *self.monitor.lock() = Monitor::new(frame_bytes * group_size);
    }

    // ------------------------------------------------------------------
    // Initialization

    fn init(&self) -> Result<(), ConfigError> {
        info!("Initial parameters for real-time 3D tomographic reconstruction:");

        self.init_params();

        let (downsampling_col, downsampling_row, imgproc_params) = {
            let params = self.imgproc_params.lock();
            (
                params.downsampling_col,
                params.downsampling_row,
                params.clone(),
            )
        };
        let (col_count, row_count, angle_count) = {
            let geometry = self.geometry.lock();
            (
                geometry.proj_geom.col_count / downsampling_col as usize,
                geometry.proj_geom.row_count / downsampling_row as usize,
                geometry.proj_geom.angles.len(),
            )
        };

        self.maybe_init_flat_field_buffer(row_count, col_count);

        let paganin = self.paganin_params.lock().clone();
        self.preproc
            .lock()
            .init(col_count, row_count, &imgproc_params, paganin.as_ref())?;
        self.filter_changed.store(false, Ordering::Release);

        self.maybe_init_recon_buffer(col_count, row_count);
        self.init_reconstructor(col_count, row_count)?;

        info!("- Number of projection images per tomogram: {angle_count}");
        info!(
            "- Projection image size: {col_count} ({downsampling_col}) x {row_count} ({downsampling_row})"
        );
        Ok(())
    }

    fn init_params(&self) {
        let (mode, update_interval) = *self.scan_mode.lock();
        let group_size = match mode {
            ScanMode::Continuous => update_interval as usize,
            ScanMode::Discrete => self.geometry.lock().proj_geom.angles.len(),
        };
        self.group_size.store(group_size, Ordering::Relaxed);
        self.proj_mediator.set_filter(group_size as i64, 0);

        self.sino_initialized.store(false, Ordering::Relaxed);
        let mut gpu = self.gpu.lock();
        gpu.buffer_index = 0;
        gpu.sino_uploaded = false;
    }

    fn init_reconstructor(&self, col_count: usize, row_count: usize) -> Result<(), ConfigError> {
        let geometry = self.geometry.lock();
        let (min_x, max_x) = parse_volume_boundary(geometry.min_x, geometry.max_x, col_count)?;
        let (min_y, max_y) = parse_volume_boundary(geometry.min_y, geometry.max_y, col_count)?;
        let (min_z, max_z) = parse_volume_boundary(geometry.min_z, geometry.max_z, row_count)?;

        let s_size = geometry
            .slice_size
            .unwrap_or_else(|| expand_data_size_for_gpu(col_count, 64));
        let p_size = geometry.volume_size.unwrap_or(128);
        let half_slice_height = 0.5 * (max_z - min_z) / p_size as f32;
        let z0 = 0.5 * (max_z + min_z);

        let slice_geom = VolumeGeometry {
            col_count: s_size,
            row_count: s_size,
            slice_count: 1,
            min_x,
            max_x,
            min_y,
            max_y,
            min_z: z0 - half_slice_height,
            max_z: z0 + half_slice_height,
        };
        let volume_geom = VolumeGeometry {
            col_count: p_size,
            row_count: p_size,
            slice_count: p_size,
            min_x,
            max_x,
            min_y,
            max_y,
            min_z: min_y,
            max_z: max_y,
        };

        self.slice_mediator.resize((s_size, s_size));

        let (mode, _) = *self.scan_mode.lock();
        let double_buffering = mode == ScanMode::Discrete;
        let proj_geom = ProjectionGeometry {
            col_count,
            row_count,
            ..geometry.proj_geom.clone()
        };
        drop(geometry);

        let recon = self
            .recon_factory
            .create(&proj_geom, &slice_geom, &volume_geom, double_buffering);

        let group_size = self.group_size.load(Ordering::Relaxed);
        let mut gpu = self.gpu.lock();
        gpu.recon = Some(recon);
        gpu.buffer_index = 0;
        gpu.sino_uploaded = false;
        gpu.volume_shape = (p_size, p_size, p_size);
        gpu.sino_shape = (row_count, group_size, col_count);
        Ok(())
    }

    fn maybe_init_flat_field_buffer(&self, row_count: usize, col_count: usize) {
        let mut flat_field = self.flat_field.lock();

        // Each processing run starts with a fresh calibration.
        if !flat_field.darks.is_empty() || !flat_field.flats.is_empty() {
            flat_field.darks.clear();
            flat_field.flats.clear();
            debug!("Dark and flat image buffers reset");
        }

        if flat_field.dark_avg.dim() != (row_count, col_count) {
            flat_field.dark_avg = Arc::new(Array2::zeros((row_count, col_count)));
            flat_field.reciprocal = Arc::new(Array2::zeros((row_count, col_count)));
            debug!("Reciprocal buffer resized");
        }

        flat_field.computed = false;
    }

    fn maybe_init_recon_buffer(&self, col_count: usize, row_count: usize) {
        let group_size = self.group_size.load(Ordering::Relaxed);
        if self.raw_buffer.shape() != (group_size, row_count, col_count) {
            self.raw_buffer.resize((group_size, row_count, col_count));
            debug!("Reconstruction buffers resized");
        }
        self.raw_buffer.reset();
    }

    // ------------------------------------------------------------------
    // Stage threads

    /// Starts all stage threads, opens the DAQ stream and the RPC
    /// endpoint, then parks until shutdown.
    pub fn spin(self: &Arc<Self>, initial_state: ServerState) -> anyhow::Result<()> {
        self.start_reconstructing();
        self.start_uploading();
        self.start_preprocessing();
        self.start_consuming();

        self.daq_client.start();

        match initial_state {
            ServerState::Acquiring => self.start_acquiring(),
            ServerState::Processing => self.start_processing(),
            ServerState::Ready => self.set_server_state(ServerState::Ready),
            ServerState::Unknown => {
                anyhow::bail!("cannot start the reconstruction server in state UNKNOWN")
            }
        }

        RpcServer::start(self.clone(), self.rpc_config)?;

        while !self.is_closing() {
            std::thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    }

    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn start_consuming(self: &Arc<Self>) {
        for _ in 0..2 * self.daq_client.concurrency() {
            let app = self.clone();
            std::thread::spawn(move || app.consume());
        }
    }

    fn consume(&self) {
        while !self.is_closing() {
            let Some(projection) = self.daq_client.next() else {
                continue;
            };

            match projection.kind {
                ProjectionType::Projection => {
                    if self.server_state() == ServerState::Processing {
                        self.push_projection(&projection);
                    }
                    self.proj_mediator.emplace(projection);
                    self.monitor.lock().count_projection();
                }
                ProjectionType::Dark => {
                    {
                        let mut flat_field = self.flat_field.lock();
                        if self.server_state() == ServerState::Processing {
                            self.maybe_reset_dark_and_flat_acquisition(&mut flat_field);
                            if flat_field.darks.len() >= MAX_NUM_DARKS {
                                warn_once!(
                                    "Received more than {MAX_NUM_DARKS} dark images, extra images dropped"
                                );
                            } else {
                                flat_field.darks.push(projection.data);
                                if flat_field.darks.len() == flat_field.required_darks {
                                    debug!(
                                        "Collected {} darks",
                                        flat_field.required_darks
                                    );
                                }
                            }
                        }
                    }
                    self.monitor.lock().count_dark();
                }
                ProjectionType::Flat => {
                    {
                        let mut flat_field = self.flat_field.lock();
                        if self.server_state() == ServerState::Processing {
                            self.maybe_reset_dark_and_flat_acquisition(&mut flat_field);
                            if flat_field.flats.len() >= MAX_NUM_FLATS {
                                warn_once!(
                                    "Received more than {MAX_NUM_FLATS} flat images, extra images dropped"
                                );
                            } else {
                                flat_field.flats.push(projection.data);
                                if flat_field.flats.len() == flat_field.required_flats {
                                    debug!(
                                        "Collected {} flats",
                                        flat_field.required_flats
                                    );
                                }
                            }
                        }
                    }
                    self.monitor.lock().count_flat();
                }
                ProjectionType::Unknown => warn!("Unexpected projection type"),
            }
        }
    }

    fn push_projection(&self, projection: &Projection) {
        if self.pipeline_wait_on_slowness.load(Ordering::Relaxed) {
            // Hold the frame back until the preprocessing stage has taken
            // the pending chunk, pushing the pressure upstream.
            while self.raw_buffer.has_ready()
                && !self.is_closing()
                && self.server_state() == ServerState::Processing
            {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        if self.raw_buffer.occupied() == 0 {
            self.monitor.lock().reset_timer();
        }

        let (rows, cols) = projection.data.dim();
        let data = projection
            .data
            .as_slice()
            .expect("frames are standard layout");
        self.raw_buffer.fill(projection.index, data, (rows, cols));
    }

    fn maybe_reset_dark_and_flat_acquisition(&self, flat_field: &mut FlatFieldState) {
        if flat_field.computed {
            self.raw_buffer.reset();
            flat_field.darks.clear();
            flat_field.flats.clear();
            flat_field.computed = false;
            info!("Re-collecting dark and flat images");
        }
    }

    fn try_compute_reciprocal(&self, flat_field: &mut FlatFieldState) -> bool {
        if flat_field.darks.is_empty() && flat_field.flats.is_empty() {
            self.raw_buffer.reset();
            warn!("Send dark and flat images first! Received projections ignored.");
            return false;
        }

        info!(
            "Computing reciprocal for flat field correction with {} darks and {} flats ...",
            flat_field.darks.len(),
            flat_field.flats.len()
        );

        let src_shape = flat_field
            .darks
            .first()
            .or_else(|| flat_field.flats.first())
            .map(|image| image.dim())
            .expect("at least one calibration image");
        let (dark_avg, reciprocal) =
            compute_reciprocal(&flat_field.darks, &flat_field.flats, src_shape);

        let (ds_row, ds_col) = {
            let params = self.imgproc_params.lock();
            (
                params.downsampling_row as usize,
                params.downsampling_col as usize,
            )
        };
        let dst_shape = (src_shape.0 / ds_row, src_shape.1 / ds_col);
        let mut dark_avg_ds = Array2::zeros(dst_shape);
        downsample(&dark_avg, &mut dark_avg_ds);
        let mut reciprocal_ds = Array2::zeros(dst_shape);
        downsample(&reciprocal, &mut reciprocal_ds);

        flat_field.dark_avg = Arc::new(dark_avg_ds);
        flat_field.reciprocal = Arc::new(reciprocal_ds);
        flat_field.computed = true;
        info!("Reciprocal computed!");
        true
    }

    pub fn start_preprocessing(self: &Arc<Self>) {
        let app = self.clone();
        std::thread::spawn(move || {
            let mut raw = Array3::zeros((0, 0, 0));
            let mut sino_back = Array3::zeros((0, 0, 0));

            while !app.is_closing() {
                if app.server_state() != ServerState::Processing {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }

                if !app
                    .raw_buffer
                    .fetch_into(&mut raw, Some(Duration::from_millis(100)))
                {
                    continue;
                }

                let (dark_avg, reciprocal) = {
                    let mut flat_field = app.flat_field.lock();
                    if !flat_field.computed && !app.try_compute_reciprocal(&mut flat_field) {
                        continue;
                    }
                    (
                        flat_field.dark_avg.clone(),
                        flat_field.reciprocal.clone(),
                    )
                };

                let (group_size, row_count, col_count) = raw.dim();
                if dark_avg.dim() != (row_count, col_count) {
                    warn_once!(
                        "Projection resolution {row_count} x {col_count} does not match the reciprocal; dropping data until re-initialization"
                    );
                    continue;
                }

                if app.filter_changed.swap(false, Ordering::AcqRel) {
                    let params = app.imgproc_params.lock().clone();
                    let paganin = app.paganin_params.lock().clone();
                    if let Err(err) =
                        app.preproc
                            .lock()
                            .init(col_count, row_count, &params, paganin.as_ref())
                    {
                        error!("Failed to swap ramp filter: {err}");
                    }
                }

                info!("Preprocessing - started");

                if sino_back.dim() != (row_count, group_size, col_count) {
                    sino_back = Array3::zeros((row_count, group_size, col_count));
                }
                app.preproc
                    .lock()
                    .process(&mut raw, &mut sino_back, &dark_avg, &reciprocal);

                if app.sino_buffer.prepare(&mut sino_back) {
                    warn!("Sinogram data dropped due to slowness of downstream pipeline");
                }

                info!("Preprocessing - finished");
            }
        });
    }

    pub fn start_uploading(self: &Arc<Self>) {
        let app = self.clone();
        std::thread::spawn(move || {
            let mut sino_front = Array3::zeros((0, 0, 0));

            while !app.is_closing() {
                if app.server_state() != ServerState::Processing {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }

                if !app
                    .sino_buffer
                    .fetch(&mut sino_front, Some(Duration::from_millis(100)))
                {
                    continue;
                }

                info!("Uploading sinograms to GPU - started");
                let (mode, _) = *app.scan_mode.lock();
                {
                    let mut gpu = app.gpu.lock();
                    if gpu.sino_shape != sino_front.dim() {
                        debug!("Dropping sinogram chunk of outdated shape");
                        continue;
                    }
                    let GpuState {
                        recon,
                        buffer_index,
                        sino_uploaded,
                        ..
                    } = &mut *gpu;
                    let Some(recon) = recon.as_mut() else {
                        continue;
                    };

                    if mode == ScanMode::Discrete {
                        let inactive = 1 - *buffer_index;
                        recon.upload_sinograms(inactive, &sino_front);
                        *buffer_index = inactive;
                    } else {
                        recon.upload_sinograms(*buffer_index, &sino_front);
                    }
                    *sino_uploaded = true;
                }

                app.sino_initialized.store(true, Ordering::Relaxed);
                info!("Uploading sinograms to GPU - finished");
                app.gpu_cv.notify_one();
            }
        });
    }

    pub fn start_reconstructing(self: &Arc<Self>) {
        let app = self.clone();
        std::thread::spawn(move || {
            let mut volume_back = Array3::zeros((0, 0, 0));

            while !app.is_closing() {
                {
                    let mut gpu = app.gpu.lock();
                    if !gpu.sino_uploaded {
                        let _ = app
                            .gpu_cv
                            .wait_for(&mut gpu, Duration::from_millis(10));
                    }

                    if gpu.sino_uploaded {
                        if volume_back.dim() != gpu.volume_shape {
                            volume_back = Array3::zeros(gpu.volume_shape);
                        }
                        let GpuState {
                            recon,
                            buffer_index,
                            sino_uploaded,
                            ..
                        } = &mut *gpu;
                        let Some(recon) = recon.as_mut() else {
                            continue;
                        };

                        if app.volume_required.load(Ordering::Relaxed) {
                            info!("Reconstruction (volume and slices) - started");
                            recon.reconstruct_volume(*buffer_index, &mut volume_back);
                        } else {
                            info!("Reconstruction (slices) - started");
                        }

                        app.slice_mediator.recon_all(recon.as_mut(), *buffer_index);
                        *sino_uploaded = false;
                    } else {
                        if !app.sino_initialized.load(Ordering::Relaxed) {
                            continue;
                        }
                        let GpuState {
                            recon,
                            buffer_index,
                            ..
                        } = &mut *gpu;
                        let Some(recon) = recon.as_mut() else {
                            continue;
                        };
                        app.slice_mediator
                            .recon_on_demand(recon.as_mut(), *buffer_index);
                        continue;
                    }
                }

                info!("Reconstruction - finished");
                app.monitor.lock().count_tomogram();

                if app.volume_buffer.prepare(&mut volume_back) {
                    debug!("Reconstructed volume dropped due to slowness of clients");
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Data fan-out

    pub fn has_volume(&self) -> bool {
        self.volume_required.load(Ordering::Relaxed)
    }

    pub fn get_projection_data(&self, timeout: Duration) -> Option<ProjectionData> {
        let projection = self.proj_mediator.wait_pop(timeout)?;
        let angle_count = self.geometry.lock().proj_geom.angles.len().max(1);
        let (rows, cols) = projection.data.dim();
        let data = projection
            .data
            .as_slice()
            .expect("frames are standard layout");
        Some(ProjectionData {
            id: (projection.index % angle_count) as u64,
            col_count: cols as u32,
            row_count: rows as u32,
            data: bytemuck::cast_slice(data).to_vec(),
        })
    }

    pub fn get_volume_data(&self, timeout: Duration) -> Option<ReconData> {
        let mut front = self.volume_front.lock();
        if !self.volume_buffer.fetch(&mut front, Some(timeout)) {
            return None;
        }
        let (slices, rows, cols) = front.dim();
        let data = front.as_slice().expect("volumes are standard layout");
        Some(ReconData::Volume {
            col_count: cols as u32,
            row_count: rows as u32,
            slice_count: slices as u32,
            data: bytemuck::cast_slice(data).to_vec(),
        })
    }

    pub fn get_slice_data(&self, timeout: Duration) -> Vec<ReconData> {
        let mut front = self.all_slices_front.lock();
        if !self
            .slice_mediator
            .all_slices()
            .fetch_into(&mut front, Some(timeout))
        {
            return Vec::new();
        }
        front.values().map(slice_packet).collect()
    }

    pub fn get_on_demand_slice_data(&self, timeout: Duration) -> Vec<ReconData> {
        let mut front = self.ondemand_front.lock();
        if !self
            .slice_mediator
            .on_demand_slices()
            .fetch_into(&mut front, Some(timeout))
        {
            return Vec::new();
        }
        front
            .values()
            .filter(|entry| entry.ready)
            .map(|entry| slice_packet(entry))
            .collect()
    }

    /// One pull of the reconstruction stream: the preview volume plus all
    /// slices when a new tomogram is available, otherwise any freshly
    /// produced on-demand slices.
    pub fn get_recon_data(&self) -> Vec<ReconData> {
        // Do not block long: slice requests need to stay responsive.
        if let Some(volume) = self.get_volume_data(Duration::ZERO) {
            let slices = self.get_slice_data(Duration::from_millis(100));
            let mut out = Vec::new();
            if self.has_volume() {
                out.push(volume);
                debug!("Preview data sent");
            }
            out.extend(slices);
            out
        } else {
            self.get_on_demand_slice_data(Duration::from_millis(10))
        }
    }

    // ------------------------------------------------------------------
    // Introspection, used by the RPC adapter and the tests.

    pub fn num_darks(&self) -> usize {
        self.flat_field.lock().darks.len()
    }

    pub fn num_flats(&self) -> usize {
        self.flat_field.lock().flats.len()
    }

    /// `(dark_avg, reciprocal, computed)` at the downsampled resolution.
    pub fn reciprocal(&self) -> (Arc<Array2<f32>>, Arc<Array2<f32>>, bool) {
        let flat_field = self.flat_field.lock();
        (
            flat_field.dark_avg.clone(),
            flat_field.reciprocal.clone(),
            flat_field.computed,
        )
    }

    pub fn raw_buffer(&self) -> &MemoryBuffer {
        &self.raw_buffer
    }

    pub fn sino_buffer(&self) -> &TripleBuffer<Array3<f32>> {
        &self.sino_buffer
    }

    pub fn slice_mediator(&self) -> &SliceMediator {
        &self.slice_mediator
    }

    pub fn num_angles(&self) -> usize {
        self.geometry.lock().proj_geom.angles.len()
    }

    pub fn num_tomograms(&self) -> usize {
        self.monitor.lock().num_tomograms()
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        self.close();
    }
}

fn slice_packet(entry: &SliceEntry) -> ReconData {
    let (rows, cols) = entry.data.dim();
    let data = entry.data.as_slice().expect("slices are standard layout");
    ReconData::Slice {
        timestamp: entry.timestamp,
        col_count: cols as u32,
        row_count: rows as u32,
        data: bytemuck::cast_slice(data).to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_volume_boundary() {
        assert_eq!(parse_volume_boundary(None, None, 128).unwrap(), (-64.0, 64.0));
        assert_eq!(
            parse_volume_boundary(Some(-1.0), Some(3.0), 128).unwrap(),
            (-1.0, 3.0)
        );
        assert!(parse_volume_boundary(Some(2.0), Some(2.0), 128).is_err());
        assert!(parse_volume_boundary(Some(2.0), Some(-2.0), 128).is_err());
    }
}
