use core::convert::TryInto;
use std::{
    ffi::CString,
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        delay::{FreeRtos, BLOCK, NON_BLOCK},
        gpio::{AnyIOPin, AnyOutputPin, IOPin, Input, Output, OutputPin, PinDriver, Pull},
        i2c::{I2cConfig, I2cDriver},
        prelude::Peripherals,
        reset::ResetReason,
        uart::{config::Config as UartConfig, UartDriver},
        units::Hertz,
    },
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SntpConf},
    wifi::EspWifi,
};
use log::{info, warn};

use s31_common::{
    config::{DeviceConfig, DEFAULT_HOSTNAME},
    nvram::NV_SIZE,
    pages, Board, BootReason, ConfigError, Device, Eeprom, FormFields, MeterPort, NvError, Nvram,
    SettingsChange,
};

const FIRMWARE: &str = concat!("s31-switch ", env!("CARGO_PKG_VERSION"));
const NVS_NAMESPACE: &str = "s31";
const NVS_CONFIG_KEY: &str = "config";
const FRAM_ADDR: u8 = 0x50;
const FRAM_WRITE_CHUNK: usize = 32;
const METER_BAUD: u32 = 4_800;
const FRAM_BAUD: u32 = 1_000_000;
const MAX_HTTP_BODY: usize = 2048;
const LOOP_SLEEP_MS: u32 = 10;
const RECONNECT_RETRY_MS: u64 = 5_000;
const REBOOT_GRACE_MS: u64 = 500;
const WEB_MOUNT: &str = "/web";
const IMMUTABLE_ASSET: &str = "public, max-age=86400, immutable";

type EspDevice = Device<EspBoard, UartMeter, I2cFram, NvsEeprom>;
type SharedDevice = Arc<Mutex<EspDevice>>;
type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

/// Radio and time client, shared with the handlers that re-apply settings.
#[derive(Clone)]
struct Network {
    wifi: Arc<Mutex<EspWifi<'static>>>,
    sntp: Arc<Mutex<Option<EspSntp<'static>>>>,
}

/// Relay on GPIO12 (high = closed), LED on GPIO13 (low = lit), push button on
/// GPIO0 (low = pressed).
struct EspBoard {
    relay: PinDriver<'static, AnyOutputPin, Output>,
    led: PinDriver<'static, AnyOutputPin, Output>,
    button: PinDriver<'static, AnyIOPin, Input>,
    led_on: bool,
    ap_mode: bool,
}

impl Board for EspBoard {
    fn set_relay(&mut self, on: bool) {
        let result = if on {
            self.relay.set_high()
        } else {
            self.relay.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive relay: {err}");
        }
    }

    fn button_pressed(&mut self) -> bool {
        self.button.is_low()
    }

    fn set_led(&mut self, on: bool) {
        let result = if on {
            self.led.set_low()
        } else {
            self.led.set_high()
        };
        match result {
            Ok(()) => self.led_on = on,
            Err(err) => warn!("failed to drive status LED: {err}"),
        }
    }

    fn toggle_led(&mut self) {
        self.set_led(!self.led_on);
    }

    fn ap_mode(&self) -> bool {
        self.ap_mode
    }

    fn delay_ms(&mut self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }
}

/// Receive side of the metering UART, polled without blocking.
struct UartMeter {
    uart: UartDriver<'static>,
}

impl MeterPort for UartMeter {
    fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.uart.read(&mut byte, NON_BLOCK) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }
}

/// 32 KiB I²C FRAM with a two-byte big-endian memory address.
struct I2cFram {
    i2c: I2cDriver<'static>,
}

impl I2cFram {
    /// Returns the part only if it acknowledges a read at offset 0.
    fn probe(i2c: I2cDriver<'static>) -> Option<Self> {
        let mut fram = Self { i2c };
        let mut byte = [0u8; 1];
        match fram.read(0, &mut byte) {
            Ok(()) => Some(fram),
            Err(err) => {
                info!("no fram at {FRAM_ADDR:#04x}: {err}");
                None
            }
        }
    }

    fn check(offset: u32, len: usize) -> Result<(), NvError> {
        if offset as usize + len > NV_SIZE as usize {
            return Err(NvError::OutOfRange { offset, len });
        }
        Ok(())
    }
}

impl Nvram for I2cFram {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), NvError> {
        Self::check(offset, buf.len())?;
        let address = (offset as u16).to_be_bytes();
        self.i2c
            .write_read(FRAM_ADDR, &address, buf, BLOCK)
            .map_err(|err| NvError::Bus(err.to_string()))
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), NvError> {
        Self::check(offset, data.len())?;
        let mut packet = Vec::with_capacity(2 + FRAM_WRITE_CHUNK);
        for (index, chunk) in data.chunks(FRAM_WRITE_CHUNK).enumerate() {
            let address = (offset as usize + index * FRAM_WRITE_CHUNK) as u16;
            packet.clear();
            packet.extend_from_slice(&address.to_be_bytes());
            packet.extend_from_slice(chunk);
            self.i2c
                .write(FRAM_ADDR, &packet, BLOCK)
                .map_err(|err| NvError::Bus(err.to_string()))?;
        }
        Ok(())
    }
}

/// Byte window over one NVS blob; `commit` writes the whole window back.
struct NvsEeprom {
    nvs: EspNvs<NvsDefault>,
    bytes: Vec<u8>,
}

impl NvsEeprom {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .context("failed to open NVS namespace")?;
        let mut buffer = vec![0u8; DeviceConfig::LEN];
        let bytes = match nvs.get_blob(NVS_CONFIG_KEY, &mut buffer) {
            Ok(Some(stored)) => stored.to_vec(),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("failed to read stored configuration: {err}");
                Vec::new()
            }
        };
        Ok(Self { nvs, bytes })
    }

    fn window(&mut self, end: usize) {
        if end > self.bytes.len() {
            self.bytes.resize(end, 0xFF);
        }
    }
}

impl Eeprom for NvsEeprom {
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
        self.nvs
            .set_blob(NVS_CONFIG_KEY, &self.bytes)
            .map(|_| ())
            .map_err(|err| ConfigError::Eeprom(err.to_string()))
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let mut button = PinDriver::input(pins.gpio0.downgrade())?;
    button.set_pull(Pull::Up)?;
    let board = EspBoard {
        relay: PinDriver::output(pins.gpio12.downgrade_output())?,
        led: PinDriver::output(pins.gpio13.downgrade_output())?,
        button,
        led_on: false,
        ap_mode: false,
    };

    let uart_config = UartConfig::default().baudrate(Hertz(METER_BAUD));
    let uart = UartDriver::new(
        peripherals.uart0,
        pins.gpio1,
        pins.gpio3,
        Option::<AnyIOPin>::None,
        Option::<AnyIOPin>::None,
        &uart_config,
    )
    .context("failed to open metering UART")?;

    let i2c_config = I2cConfig::new().baudrate(Hertz(FRAM_BAUD));
    let fram = match I2cDriver::new(peripherals.i2c0, pins.gpio4, pins.gpio5, &i2c_config) {
        Ok(i2c) => I2cFram::probe(i2c),
        Err(err) => {
            warn!("failed to open I2C bus: {err}");
            None
        }
    };

    let eeprom = NvsEeprom::open(nvs_partition.clone())?;
    let mut device = Device::boot(
        board,
        UartMeter { uart },
        fram,
        eeprom,
        boot_reason(),
        monotonic_ms(),
    )
    .context("device boot failed")?;

    let station = device
        .config()
        .station_credentials(option_env!("WIFI_SSID"), option_env!("WIFI_PASS"));
    let mut wifi = EspWifi::new(peripherals.modem, sys_loop, Some(nvs_partition))?;
    set_hostname(&mut wifi, &device.config().hostname);
    ntp_from_dhcp(device.config().ntp_server.trim().is_empty());
    let connected = match &station {
        Some((ssid, psk)) => match start_station(&mut wifi, ssid, psk) {
            Ok(()) => device.wait_for_network(|| wifi.is_up().unwrap_or(false)),
            Err(err) => {
                warn!("wifi station rejected: {err:#}");
                false
            }
        },
        None => false,
    };
    if let (true, Some((ssid, _))) = (connected, &station) {
        info!("wifi connected to `{ssid}`");
        device.on_got_ip();
    } else {
        warn!("wifi station unavailable; starting open AP `{DEFAULT_HOSTNAME}`");
        start_access_point(&mut wifi)?;
        device.board_mut().ap_mode = true;
    }

    let ntp_server = device.config().ntp_server.clone();
    mount_web_assets();
    device.finish_setup();

    let device: SharedDevice = Arc::new(Mutex::new(device));
    let network = Network {
        sntp: Arc::new(Mutex::new(Some(start_sntp(&ntp_server, device.clone())?))),
        wifi: Arc::new(Mutex::new(wifi)),
    };
    // Keep the server alive for the program lifetime.
    let _server = create_http_server(device.clone(), network)?;
    main_loop(device, connected)
}

fn boot_reason() -> BootReason {
    match ResetReason::get() {
        ResetReason::PowerOn => BootReason::PowerOn,
        ResetReason::Software => BootReason::Software,
        ResetReason::Panic => BootReason::Panic,
        ResetReason::InterruptWatchdog
        | ResetReason::TaskWatchdog
        | ResetReason::OtherWatchdog => BootReason::Watchdog,
        ResetReason::Brownout => BootReason::Brownout,
        ResetReason::ExternalPin => BootReason::External,
        ResetReason::DeepSleep => BootReason::DeepSleep,
        _ => BootReason::Unknown,
    }
}

fn set_hostname(wifi: &mut EspWifi<'static>, hostname: &str) {
    if let Err(err) = wifi.sta_netif_mut().set_hostname(hostname) {
        warn!("failed to set hostname `{hostname}`: {err}");
    }
}

/// With no configured server, the DHCP lease's NTP option supplies one.
/// Takes effect from the next lease.
fn ntp_from_dhcp(enable: bool) {
    unsafe { esp_idf_svc::sys::esp_sntp_servermode_dhcp(enable) };
}

fn start_station(wifi: &mut EspWifi<'static>, ssid: &str, psk: &str) -> anyhow::Result<()> {
    let auth_method = if psk.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    let _ = wifi.disconnect();
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: psk
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.connect()?;
    info!("wifi started, connecting to `{ssid}`");
    Ok(())
}

fn start_access_point(wifi: &mut EspWifi<'static>) -> anyhow::Result<()> {
    let _ = wifi.disconnect();
    let _ = wifi.stop();
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: DEFAULT_HOSTNAME
            .try_into()
            .map_err(|_| anyhow!("AP SSID too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    Ok(())
}

fn start_sntp(server: &str, device: SharedDevice) -> anyhow::Result<EspSntp<'static>> {
    let mut conf = SntpConf::default();
    let server = server.trim();
    if !server.is_empty() {
        let leaked: &'static str = Box::leak(server.to_string().into_boxed_str());
        conf.servers[0] = leaked;
    }

    let sntp = EspSntp::new_with_callback(&conf, move |since_epoch: Duration| {
        let unix = since_epoch.as_secs() as i64;
        match device.lock() {
            Ok(mut device) => device.on_time_synced(unix, monotonic_ms()),
            Err(err) => warn!("device lock poisoned in sntp callback: {err}"),
        }
    })
    .context("failed to start SNTP")?;
    info!("SNTP initialized");
    Ok(sntp)
}

/// Mounts the SPIFFS partition holding favicon and chart assets.
fn mount_web_assets() {
    let Ok(base_path) = CString::new(WEB_MOUNT) else {
        return;
    };
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 4,
        format_if_mount_failed: false,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK {
        // The VFS keeps the base path pointer.
        core::mem::forget(base_path);
        info!("web assets mounted at {WEB_MOUNT}");
    } else {
        warn!("web assets unavailable: esp_err_t={rc}");
    }
}

fn main_loop(device: SharedDevice, mut connected: bool) -> anyhow::Result<()> {
    let mut last_reconnect_ms = 0_u64;

    loop {
        let now_ms = monotonic_ms();
        let unix = Utc::now().timestamp();

        let sleep_ms = {
            let mut device = lock(&device)?;
            device.run_due(now_ms, unix);

            if !device.board().ap_mode {
                let up = is_wifi_station_connected();
                if up && !connected {
                    info!("wifi station reassociated");
                    device.on_got_ip();
                } else if !up
                    && (connected || now_ms.saturating_sub(last_reconnect_ms) >= RECONNECT_RETRY_MS)
                    && device.on_disconnected()
                {
                    last_reconnect_ms = now_ms;
                    let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
                    if rc != esp_idf_svc::sys::ESP_OK {
                        warn!("wifi reconnect failed: esp_err_t={rc}");
                    }
                }
                connected = up;
            }

            device.end_loop_turn();
            device.next_deadline().map_or(LOOP_SLEEP_MS, |due| {
                due.saturating_sub(now_ms).min(u64::from(LOOP_SLEEP_MS)) as u32
            })
        };

        FreeRtos::delay_ms(sleep_ms.max(1));
    }
}

/// Pushes saved network settings to the running radio and SNTP client.
/// A new SSID or PSK only takes effect at boot while the AP is up.
fn reapply_network(
    change: SettingsChange,
    config: &DeviceConfig,
    ap_mode: bool,
    network: &Network,
    device: &SharedDevice,
) -> anyhow::Result<()> {
    if change.hostname || change.station {
        let mut wifi = network
            .wifi
            .lock()
            .map_err(|_| anyhow!("wifi lock poisoned"))?;
        if change.hostname {
            set_hostname(&mut wifi, &config.hostname);
        }
        if change.station && !ap_mode {
            match config.station_credentials(option_env!("WIFI_SSID"), option_env!("WIFI_PASS")) {
                Some((ssid, psk)) => start_station(&mut wifi, &ssid, &psk)?,
                None => warn!("no station credentials; keeping current association"),
            }
        } else if change.station {
            info!("station credentials saved; joining after restart");
        }
    }

    if change.ntp_server {
        let server = config.ntp_server.trim();
        ntp_from_dhcp(server.is_empty());
        let mut sntp = network
            .sntp
            .lock()
            .map_err(|_| anyhow!("sntp lock poisoned"))?;
        // Only one SNTP client may exist at a time.
        *sntp = None;
        *sntp = Some(start_sntp(server, device.clone())?);
    }
    Ok(())
}

fn create_http_server(
    device: SharedDevice,
    network: Network,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            let status = lock(&device)?.status(Utc::now().timestamp());
            write_html(req, 200, &pages::status_page(&status, FIRMWARE))
        })?;
    }

    for (path, on) in [("/on", true), ("/off", false)] {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            let body = {
                let mut device = lock(&device)?;
                device.set_relay(on);
                pages::relay_page(&device.config().hostname, on)
            };
            write_html(req, 200, &body)
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>("/powercycle", Method::Get, move |req| {
            let body = {
                let mut device = lock(&device)?;
                let cycled = device.power_cycle();
                pages::power_cycle_page(&device.config().hostname, cycled)
            };
            write_html(req, 200, &body)
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>("/config", Method::Get, move |req| {
            let body = pages::config_page(lock(&device)?.config());
            write_html(req, 200, &body)
        })?;
    }

    {
        let device = device.clone();
        let network = network.clone();
        server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
            let form = read_form(&mut req)?;
            let (result, config, ap_mode) = {
                let mut device = lock(&device)?;
                let result = device.apply_settings(&form);
                (result, device.config().clone(), device.board().ap_mode)
            };
            let hostname = &config.hostname;
            match result {
                Ok(change) => {
                    if let Err(err) = reapply_network(change, &config, ap_mode, &network, &device) {
                        warn!("failed to re-apply network settings: {err:#}");
                    }
                    write_html(req, 200, &pages::saved_page(hostname))
                }
                Err(err) => {
                    warn!("failed to persist configuration: {err}");
                    let body = pages::error_page(hostname, "Failed to save configuration");
                    write_html(req, 500, &body)
                }
            }
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>("/schedule", Method::Get, move |req| {
            let body = pages::schedule_page(lock(&device)?.config());
            write_html(req, 200, &body)
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>("/schedulesave", Method::Post, move |mut req| {
            let form = read_form(&mut req)?;
            let (result, hostname) = {
                let mut device = lock(&device)?;
                let result = device.apply_schedule(&form);
                (result, device.config().hostname.clone())
            };
            match result {
                Ok(()) => write_html(req, 200, &pages::saved_page(&hostname)),
                Err(err) => {
                    warn!("failed to persist schedule: {err}");
                    let body = pages::error_page(&hostname, "Failed to save schedule");
                    write_html(req, 500, &body)
                }
            }
        })?;
    }

    // The config page's reboot form posts; a bare GET also works.
    for method in [Method::Get, Method::Post] {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>("/reboot", method, move |req| {
            let hostname = {
                let mut device = lock(&device)?;
                device.prepare_shutdown();
                device.config().hostname.clone()
            };
            write_html(req, 200, &pages::reboot_page(&hostname))?;
            thread::spawn(|| {
                thread::sleep(Duration::from_millis(REBOOT_GRACE_MS));
                unsafe { esp_idf_svc::sys::esp_restart() };
            });
            Ok(())
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>("/data.txt", Method::Get, move |req| {
            let csv = lock(&device)?.history_csv();
            req.into_response(
                200,
                Some("OK"),
                &[("Content-Type", "text/plain"), ("Cache-Control", "no-store")],
            )?
            .write_all(csv.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>("/status.json", Method::Get, move |req| {
            let status = lock(&device)?.status(Utc::now().timestamp());
            let body = pages::status_json(&status)?;
            req.into_response(
                200,
                Some("OK"),
                &[("Content-Type", "application/json; charset=utf-8")],
            )?
            .write_all(&body)?;
            Ok(())
        })?;
    }

    for (path, content_type) in [
        ("/favicon.ico", "image/x-icon"),
        ("/dygraph.min.js", "application/javascript"),
        ("/dygraph.css", "text/css"),
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            serve_asset(req, path, content_type)
        })?;
    }

    Ok(server)
}

/// Sends the `.gz` sibling when the client advertises gzip and one exists.
fn serve_asset(req: HttpRequest<'_, '_>, path: &str, content_type: &str) -> anyhow::Result<()> {
    let gzip = req
        .header("Accept-Encoding")
        .is_some_and(|value| value.starts_with("gzip"));
    let plain = format!("{WEB_MOUNT}{path}");
    let compressed = format!("{plain}.gz");

    let (body, encoding) = match gzip.then(|| std::fs::read(&compressed)) {
        Some(Ok(body)) => (body, Some("gzip")),
        _ => match std::fs::read(&plain) {
            Ok(body) => (body, None),
            Err(_) => {
                req.into_status_response(404)?.write_all(b"Not found")?;
                return Ok(());
            }
        },
    };

    let mut headers = vec![
        ("Content-Type", content_type),
        ("Cache-Control", IMMUTABLE_ASSET),
    ];
    if let Some(encoding) = encoding {
        headers.push(("Content-Encoding", encoding));
    }
    req.into_response(200, Some("OK"), &headers)?.write_all(&body)?;
    Ok(())
}

fn lock(device: &SharedDevice) -> anyhow::Result<std::sync::MutexGuard<'_, EspDevice>> {
    device.lock().map_err(|_| anyhow!("device lock poisoned"))
}

fn read_form(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<FormFields> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(FormFields::parse(&String::from_utf8_lossy(&body)))
}

fn write_html(req: HttpRequest<'_, '_>, status: u16, body: &str) -> anyhow::Result<()> {
    req.into_response(status, None, &[("Content-Type", "text/html; charset=utf-8")])?
        .write_all(body.as_bytes())?;
    Ok(())
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
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
