use std::{
    collections::{HashMap, VecDeque},
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Form, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::{services::ServeDir, set_header::SetResponseHeader};
use tracing::{info, warn};

use s31_common::{
    config::DeviceConfig,
    frame::{
        ADJ_CURRENT_CYCLE_COMPLETE, ADJ_POWER_CYCLE_COMPLETE, ADJ_PULSE_OVERFLOW,
        ADJ_VOLTAGE_CYCLE_COMPLETE,
    },
    nvram::NV_SIZE,
    pages, Board, BootReason, ConfigError, Device, Eeprom, FormFields, FrameFields, MeterPort,
    NvError, Nvram,
};

const FIRMWARE: &str = concat!("s31-switch ", env!("CARGO_PKG_VERSION"), " (host)");
const SIM_LINE_VOLTS: f64 = 120.0;
const SIM_KV: u32 = 1_920_000;
const SIM_KI: u32 = 1_000_000;
const SIM_KP: u32 = 5_000_000;
const IMMUTABLE_ASSET: &str = "public, max-age=86400, immutable";

type HostDevice = Device<SimBoard, SimMeter, FileNvram, FileEeprom>;

#[derive(Clone)]
struct AppState {
    device: Arc<Mutex<HostDevice>>,
    env: Arc<SimEnv>,
}

/// Runtime knobs for the simulator, read once from the environment.
struct SimEnv {
    data_dir: PathBuf,
    watts: f64,
    fram: bool,
    relay: Arc<AtomicBool>,
    line: Arc<std::sync::Mutex<VecDeque<u8>>>,
}

impl SimEnv {
    fn from_env() -> Self {
        let data_dir = std::env::var("S31_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.s31"));
        let watts = std::env::var("S31_SIM_WATTS")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|watts| *watts >= 0.0)
            .unwrap_or(60.0);
        let fram = std::env::var_os("S31_NO_FRAM").is_none();

        Self {
            data_dir,
            watts,
            fram,
            relay: Arc::new(AtomicBool::new(false)),
            line: Arc::new(std::sync::Mutex::new(VecDeque::new())),
        }
    }

    fn boot(&self, reason: BootReason) -> anyhow::Result<HostDevice> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;

        let nv = if self.fram {
            Some(FileNvram::open(&self.data_dir.join("fram.bin"))?)
        } else {
            None
        };
        let eeprom = FileEeprom::open(self.data_dir.join("eeprom.bin"))?;
        let board = SimBoard {
            relay: self.relay.clone(),
            led: false,
        };
        let meter = SimMeter {
            line: self.line.clone(),
        };

        let mut device = Device::boot(board, meter, nv, eeprom, reason, monotonic_ms())
            .context("device boot failed")?;
        device.wait_for_network(|| true);
        device.on_got_ip();
        device.on_time_synced(Utc::now().timestamp(), monotonic_ms());
        device.finish_setup();
        Ok(device)
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // The simulated front-end restarts its pulse counter with the process.
    let env = Arc::new(SimEnv::from_env());
    let device = env.boot(BootReason::PowerOn)?;
    info!(
        "simulated switch `{}` up: load {} W, fram {}",
        device.config().hostname,
        env.watts,
        if env.fram { "present" } else { "absent" }
    );

    let app_state = AppState {
        device: Arc::new(Mutex::new(device)),
        env,
    };

    spawn_meter_simulator(app_state.env.clone());
    spawn_main_loop(app_state.clone());

    let web_root = std::env::var("S31_WEB_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("web"));
    let app = router(app_state, &web_root);

    let port = std::env::var("S31_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind switch server at {addr}"))?;

    info!("switch listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(app_state: AppState, web_root: &Path) -> Router {
    let assets = SetResponseHeader::overriding(
        ServeDir::new(web_root).precompressed_gzip(),
        header::CACHE_CONTROL,
        HeaderValue::from_static(IMMUTABLE_ASSET),
    );

    Router::new()
        .route("/", get(handle_root))
        .route("/on", get(handle_on))
        .route("/off", get(handle_off))
        .route("/powercycle", get(handle_power_cycle))
        .route("/config", get(handle_config))
        .route("/save", post(handle_save))
        .route("/schedule", get(handle_schedule))
        .route("/schedulesave", post(handle_schedule_save))
        .route("/reboot", get(handle_reboot).post(handle_reboot))
        .route("/data.txt", get(handle_data))
        .route("/status.json", get(handle_status_json))
        .fallback_service(assets)
        .with_state(app_state)
}

/// Emits one frame per second for the configured load while the relay is
/// closed, advancing the CF pulse counter like the real front-end.
fn spawn_meter_simulator(env: Arc<SimEnv>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut pulses: u16 = 0;
        let mut overflow = false;
        let mut carry = 0.0f64;

        loop {
            interval.tick().await;
            let watts = if env.relay.load(Ordering::Relaxed) {
                env.watts
            } else {
                0.0
            };

            carry += watts * 1e6 / f64::from(SIM_KP);
            let whole = carry.floor();
            carry -= whole;
            let (next, wrapped) = pulses.overflowing_add(whole as u16);
            pulses = next;
            if wrapped {
                overflow = !overflow;
            }

            let frame = sim_frame(watts, pulses, overflow);
            match env.line.lock() {
                Ok(mut line) => line.extend(frame),
                Err(err) => warn!("meter line poisoned: {err}"),
            }
        }
    });
}

fn sim_frame(watts: f64, pulses: u16, overflow: bool) -> [u8; 24] {
    let period = |coefficient: u32, value: f64| {
        if value > 0.0 {
            (f64::from(coefficient) / value).round().min(f64::from(0xFF_FFFFu32)) as u32
        } else {
            0
        }
    };
    let mut adjustment =
        ADJ_VOLTAGE_CYCLE_COMPLETE | ADJ_CURRENT_CYCLE_COMPLETE | ADJ_POWER_CYCLE_COMPLETE;
    if overflow {
        adjustment |= ADJ_PULSE_OVERFLOW;
    }
    FrameFields {
        kv: SIM_KV,
        tv: period(SIM_KV, SIM_LINE_VOLTS),
        ki: SIM_KI,
        ti: period(SIM_KI, watts / SIM_LINE_VOLTS),
        kp: SIM_KP,
        tp: period(SIM_KP, watts),
        adjustment,
        pulses,
        ..FrameFields::default()
    }
    .encode()
}

fn spawn_main_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(20));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let mut device = app_state.device.lock().await;
            device.run_due(monotonic_ms(), Utc::now().timestamp());
            device.end_loop_turn();
        }
    });
}

async fn handle_root(State(state): State<AppState>) -> impl IntoResponse {
    let device = state.device.lock().await;
    Html(pages::status_page(
        &device.status(Utc::now().timestamp()),
        FIRMWARE,
    ))
}

async fn handle_on(State(state): State<AppState>) -> impl IntoResponse {
    set_relay(state, true).await
}

async fn handle_off(State(state): State<AppState>) -> impl IntoResponse {
    set_relay(state, false).await
}

async fn set_relay(state: AppState, on: bool) -> Html<String> {
    let mut device = state.device.lock().await;
    device.set_relay(on);
    info!("relay switched {} over http", if on { "on" } else { "off" });
    Html(pages::relay_page(&device.config().hostname, on))
}

async fn handle_power_cycle(State(state): State<AppState>) -> impl IntoResponse {
    let mut device = state.device.lock().await;
    let cycled = tokio::task::block_in_place(|| device.power_cycle());
    Html(pages::power_cycle_page(&device.config().hostname, cycled))
}

async fn handle_config(State(state): State<AppState>) -> impl IntoResponse {
    let device = state.device.lock().await;
    Html(pages::config_page(device.config()))
}

async fn handle_save(
    State(state): State<AppState>,
    Form(fields): Form<HashMap<String, String>>,
) -> Response {
    let form: FormFields = fields.into_iter().collect();
    let mut device = state.device.lock().await;
    match device.apply_settings(&form) {
        Ok(change) => {
            info!("settings saved for `{}`", device.config().hostname);
            if change.any() {
                info!(?change, "network settings changed; no radio to re-apply them to");
            }
            Html(pages::saved_page(&device.config().hostname)).into_response()
        }
        Err(err) => save_failed(device.config(), &err),
    }
}

async fn handle_schedule(State(state): State<AppState>) -> impl IntoResponse {
    let device = state.device.lock().await;
    Html(pages::schedule_page(device.config()))
}

async fn handle_schedule_save(
    State(state): State<AppState>,
    Form(fields): Form<HashMap<String, String>>,
) -> Response {
    let form: FormFields = fields.into_iter().collect();
    let mut device = state.device.lock().await;
    match device.apply_schedule(&form) {
        Ok(()) => Html(pages::saved_page(&device.config().hostname)).into_response(),
        Err(err) => save_failed(device.config(), &err),
    }
}

/// Flushes the NV header, then boots a fresh device context from the
/// persisted images in place of a hardware restart.
async fn handle_reboot(State(state): State<AppState>) -> Response {
    let mut device = state.device.lock().await;
    let hostname = device.config().hostname.clone();
    device.prepare_shutdown();

    match state.env.boot(BootReason::Software) {
        Ok(fresh) => {
            *device = fresh;
            info!("simulated restart complete");
            Html(pages::reboot_page(&hostname)).into_response()
        }
        Err(err) => {
            warn!("simulated restart failed: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(pages::error_page(&hostname, "Restart failed")),
            )
                .into_response()
        }
    }
}

async fn handle_data(State(state): State<AppState>) -> impl IntoResponse {
    let csv = state.device.lock().await.history_csv();
    (
        [
            (header::CONTENT_TYPE, "text/plain"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        csv,
    )
}

async fn handle_status_json(State(state): State<AppState>) -> Response {
    let status = state
        .device
        .lock()
        .await
        .status(Utc::now().timestamp());
    match pages::status_json(&status) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => {
            warn!("status serialization failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn save_failed(config: &DeviceConfig, err: &ConfigError) -> Response {
    warn!("failed to persist configuration: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(pages::error_page(
            &config.hostname,
            "Failed to save configuration",
        )),
    )
        .into_response()
}

/// Relay and LED state of the simulated board. The relay is shared with the
/// meter simulator so an open relay reads zero load.
struct SimBoard {
    relay: Arc<AtomicBool>,
    led: bool,
}

impl Board for SimBoard {
    fn set_relay(&mut self, on: bool) {
        self.relay.store(on, Ordering::Relaxed);
    }

    fn button_pressed(&mut self) -> bool {
        false
    }

    fn set_led(&mut self, on: bool) {
        self.led = on;
    }

    fn toggle_led(&mut self) {
        self.led = !self.led;
    }

    fn ap_mode(&self) -> bool {
        false
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

struct SimMeter {
    line: Arc<std::sync::Mutex<VecDeque<u8>>>,
}

impl MeterPort for SimMeter {
    fn read_byte(&mut self) -> Option<u8> {
        self.line.lock().ok()?.pop_front()
    }
}

/// FRAM image kept in a sparse file; every write goes straight to disk.
struct FileNvram {
    file: File,
}

impl FileNvram {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open fram image {}", path.display()))?;
        file.set_len(u64::from(NV_SIZE))
            .with_context(|| format!("failed to size fram image {}", path.display()))?;
        Ok(Self { file })
    }

    fn check(offset: u32, len: usize) -> Result<(), NvError> {
        if u64::from(offset) + len as u64 > u64::from(NV_SIZE) {
            return Err(NvError::OutOfRange { offset, len });
        }
        Ok(())
    }
}

impl Nvram for FileNvram {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), NvError> {
        Self::check(offset, buf.len())?;
        self.file
            .seek(SeekFrom::Start(u64::from(offset)))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|err| NvError::Bus(err.to_string()))
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), NvError> {
        Self::check(offset, data.len())?;
        self.file
            .seek(SeekFrom::Start(u64::from(offset)))
            .and_then(|_| self.file.write_all(data))
            .map_err(|err| NvError::Bus(err.to_string()))
    }
}

/// Emulated EEPROM window: edits stay in memory until `commit` rewrites the
/// backing file, as the flash-emulated part does.
struct FileEeprom {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl FileEeprom {
    fn open(path: PathBuf) -> anyhow::Result<Self> {
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Ok(Self { path, bytes })
    }

    fn window(&mut self, end: usize) {
        if end > self.bytes.len() {
            self.bytes.resize(end, 0xFF);
        }
    }
}

impl Eeprom for FileEeprom {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), ConfigError> {
        let end = offset + buf.len();
        self.window(end);
        buf.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), ConfigError> {
        let end = offset + data.len();
        self.window(end);
        self.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ConfigError> {
        std::fs::write(&self.path, &self.bytes)
            .map_err(|err| ConfigError::Eeprom(format!("{}: {err}", self.path.display())))
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
