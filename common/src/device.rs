//! The single owned device context. Every periodic callback and every HTTP
//! action is a method here, so the binaries only wire hardware and transport
//! to it.

use std::collections::VecDeque;

use log::{debug, error, info, warn};

use crate::button::{Button, ButtonEvent, SAMPLE_PERIOD_MS};
use crate::config::{ConfigError, ConfigStore, DeviceConfig, Eeprom};
use crate::dispatch::Dispatcher;
use crate::energy::{EnergyAccumulator, PowerAverage};
use crate::form::FormFields;
use crate::frame::{Frame, FrameError, FrameSync};
use crate::nvram::{LogEntry, NvStore, Nvram};
use crate::pages;
use crate::rng::Drand48;
use crate::schedule::{RelayCommand, Scheduler};
use crate::state::StateFlags;
use crate::tz::TimeZone;
use crate::types::{BootReason, Readings, StatusSnapshot};

pub const METER_PERIOD_MS: u64 = 1_000;
pub const AP_LED_PERIOD_MS: u64 = 1_000;
pub const SCHEDULE_PERIOD_MS: u64 = 1_000;
pub const HEADER_FLUSH_PERIOD_MS: u64 = 5_000;
pub const LOG_APPEND_PERIOD_MS: u64 = 10_000;

pub const POWER_CYCLE_OFF_MS: u32 = 1_000;
pub const CONNECT_BLINKS: u32 = 20;
pub const CONNECT_BLINK_MS: u32 = 300;

/// Network-facing fields touched by a settings save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsChange {
    pub hostname: bool,
    pub station: bool,
    pub ntp_server: bool,
}

impl SettingsChange {
    pub fn any(&self) -> bool {
        self.hostname || self.station || self.ntp_server
    }
}

/// GPIO side of the switch. `set_led(true)` lights the LED regardless of
/// the pin's polarity.
pub trait Board {
    fn set_relay(&mut self, on: bool);
    fn button_pressed(&mut self) -> bool;
    fn set_led(&mut self, on: bool);
    fn toggle_led(&mut self);
    fn ap_mode(&self) -> bool;
    fn delay_ms(&mut self, ms: u32);
}

/// Receive side of the metering UART.
pub trait MeterPort {
    /// Next received byte, without blocking.
    fn read_byte(&mut self) -> Option<u8>;
}

impl MeterPort for VecDeque<u8> {
    fn read_byte(&mut self) -> Option<u8> {
        self.pop_front()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Button,
    Meter,
    ApLed,
    Schedule,
    HeaderFlush,
    LogAppend,
}

pub struct Device<B, M, N, E> {
    board: B,
    meter: M,
    nv: Option<NvStore<N>>,
    config: ConfigStore<E>,
    tz: TimeZone,
    flags: StateFlags,
    boot_reason: BootReason,
    boot_time: Option<i64>,
    sync: FrameSync,
    energy: EnergyAccumulator,
    average: PowerAverage,
    readings: Readings,
    last_frame_error: Option<FrameError>,
    button: Button,
    scheduler: Scheduler,
    rng: Drand48,
    dispatcher: Dispatcher<Task>,
}

impl<B: Board, M: MeterPort, N: Nvram, E: Eeprom> Device<B, M, N, E> {
    /// Loads the configuration, drives the relay to its boot state, opens
    /// the FRAM (if any) and registers the periodic callbacks.
    pub fn boot(
        mut board: B,
        meter: M,
        nv: Option<N>,
        eeprom: E,
        boot_reason: BootReason,
        now_ms: u64,
    ) -> Result<Self, ConfigError> {
        let config = ConfigStore::load(eeprom)?;

        let mut flags = StateFlags::empty();
        flags.set(StateFlags::RELAY, config.config().relay_on_boot);
        board.set_relay(flags.contains(StateFlags::RELAY));

        let mut energy = EnergyAccumulator::default();
        let nv = match nv.map(NvStore::open) {
            Some(Ok(mut store)) => {
                flags.insert(StateFlags::FRAM_PRESENT);
                let header = *store.header();
                energy = EnergyAccumulator::new(header.ovflow, header.restored_pulses);
                if boot_reason == BootReason::PowerOn {
                    let (ovflow, restored) = store.restore_after_power_on();
                    energy = EnergyAccumulator::new(ovflow, restored);
                }
                info!(
                    "fram: {} history entries, ovflow {}, restored pulses {}",
                    store.len(),
                    energy.ovflow(),
                    energy.restored_pulses()
                );
                Some(store)
            }
            Some(Err(err)) => {
                warn!("fram unavailable, history disabled: {err}");
                None
            }
            None => {
                info!("no fram detected, history disabled");
                None
            }
        };

        let tz = config.config().time_zone();

        let mut dispatcher = Dispatcher::new();
        dispatcher.every(SAMPLE_PERIOD_MS, now_ms, Task::Button);
        dispatcher.every(METER_PERIOD_MS, now_ms, Task::Meter);
        dispatcher.every(AP_LED_PERIOD_MS, now_ms, Task::ApLed);
        dispatcher.every(SCHEDULE_PERIOD_MS, now_ms, Task::Schedule);
        if nv.is_some() {
            dispatcher.every(HEADER_FLUSH_PERIOD_MS, now_ms, Task::HeaderFlush);
            dispatcher.every(LOG_APPEND_PERIOD_MS, now_ms, Task::LogAppend);
        }

        info!(
            "boot: reason {}, relay {}",
            boot_reason.as_str(),
            if flags.contains(StateFlags::RELAY) { "on" } else { "off" }
        );

        Ok(Self {
            board,
            meter,
            nv,
            config,
            tz,
            flags,
            boot_reason,
            boot_time: None,
            sync: FrameSync::new(),
            energy,
            average: PowerAverage::default(),
            readings: Readings::default(),
            last_frame_error: None,
            button: Button::default(),
            scheduler: Scheduler::new(),
            rng: Drand48::default(),
            dispatcher,
        })
    }

    /// Blinks the LED while waiting for the station to associate. Returns
    /// whether the link came up.
    pub fn wait_for_network(&mut self, mut connected: impl FnMut() -> bool) -> bool {
        for _ in 0..CONNECT_BLINKS {
            if connected() {
                return true;
            }
            self.board.set_led(true);
            self.board.delay_ms(CONNECT_BLINK_MS);
            self.board.set_led(false);
            self.board.delay_ms(CONNECT_BLINK_MS);
        }
        connected()
    }

    /// LED on signals that setup has completed.
    pub fn finish_setup(&mut self) {
        self.board.set_led(true);
    }

    /// Runs every callback that is due and returns the ones that ran.
    pub fn run_due(&mut self, now_ms: u64, unix: i64) -> Vec<Task> {
        let due = self.dispatcher.poll(now_ms);
        for task in &due {
            match task {
                Task::Button => self.sample_button(),
                Task::Meter => self.drain_meter(),
                Task::ApLed => self.blink_ap_led(),
                Task::Schedule => self.schedule_tick(unix),
                Task::HeaderFlush => self.flush_header(),
                Task::LogAppend => self.append_log(unix),
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.dispatcher.next_deadline()
    }

    pub fn sample_button(&mut self) {
        let pressed = self.board.button_pressed();
        match self.button.sample(pressed, &mut self.flags) {
            Some(ButtonEvent::Toggle) => {
                let on = !self.flags.contains(StateFlags::RELAY);
                info!("button: relay {}", if on { "on" } else { "off" });
                self.set_relay(on);
            }
            Some(ButtonEvent::FactoryReset) => {
                warn!("button held for 10 s: restoring factory configuration");
                if let Err(err) = self.config.factory_reset() {
                    error!("factory reset failed: {err}");
                }
                self.tz = self.config.config().time_zone();
            }
            None => {}
        }
    }

    /// Consumes received bytes up to the first complete frame.
    pub fn drain_meter(&mut self) {
        let mut raw = None;
        while let Some(byte) = self.meter.read_byte() {
            if let Some(frame) = self.sync.push(byte) {
                raw = Some(frame);
                break;
            }
        }

        let Some(raw) = raw else {
            self.last_frame_error = Some(FrameError::Timeout);
            return;
        };

        match Frame::parse(&raw) {
            Ok(frame) => {
                let measurement = frame.measure(&self.config.config().calibration);
                self.energy.record(&measurement);
                self.readings = Readings {
                    voltage: measurement.voltage,
                    current: measurement.current,
                    power: measurement.power,
                    energy_kwh: self.energy.kwh(),
                };
                if let Some(nv) = self.nv.as_mut() {
                    nv.set_counters(self.energy.ovflow(), self.energy.pulses());
                    self.average.add(measurement.power);
                }
                self.last_frame_error = None;
            }
            Err(err) => {
                debug!("meter frame rejected: {err}");
                self.last_frame_error = Some(err);
            }
        }
    }

    pub fn blink_ap_led(&mut self) {
        if self.board.ap_mode() {
            self.board.toggle_led();
        }
    }

    /// Weekly schedule, evaluated only once wall-clock time is known.
    pub fn schedule_tick(&mut self, unix: i64) {
        if !self.config.config().schedule_enabled || !self.flags.contains(StateFlags::NTP_GOT_TIME)
        {
            return;
        }
        let relay_on = self.flags.contains(StateFlags::RELAY);
        let command = self.scheduler.tick(
            unix,
            &self.tz,
            &self.config.config().schedule,
            relay_on,
            &mut self.rng,
        );
        match command {
            Some(RelayCommand::On) => self.set_relay(true),
            Some(RelayCommand::Off) => self.set_relay(false),
            None => {}
        }
    }

    pub fn flush_header(&mut self) {
        if let Some(nv) = self.nv.as_mut() {
            if let Err(err) = nv.flush_header() {
                warn!("nv header flush failed: {err}");
            }
        }
    }

    /// Appends the mean power since the previous entry. Skipped until the
    /// clock has been set.
    pub fn append_log(&mut self, unix: i64) {
        if !self.flags.contains(StateFlags::NTP_GOT_TIME) {
            return;
        }
        let Some(nv) = self.nv.as_mut() else {
            return;
        };
        let entry = LogEntry {
            time: unix,
            power: self.average.take(self.readings.power) as f32,
        };
        if let Err(err) = nv.append(entry) {
            warn!("nv log append failed: {err}");
        }
    }

    pub fn set_relay(&mut self, on: bool) {
        self.board.set_relay(on);
        self.flags.set(StateFlags::RELAY, on);
    }

    /// Off for one second, then on again. Only acts when the relay is on.
    pub fn power_cycle(&mut self) -> bool {
        if !self.flags.contains(StateFlags::RELAY) {
            return false;
        }
        info!("power cycling load");
        self.board.set_relay(false);
        self.board.delay_ms(POWER_CYCLE_OFF_MS);
        self.board.set_relay(true);
        true
    }

    /// Called on every time sync. The first one fixes the boot time and
    /// seeds the schedule jitter generator.
    pub fn on_time_synced(&mut self, unix: i64, now_ms: u64) {
        if self.boot_time.is_none() && !self.flags.contains(StateFlags::NTP_GOT_TIME) {
            let boot_time = unix - (now_ms / 1000) as i64;
            self.boot_time = Some(boot_time);
            self.rng = Drand48::seed(boot_time);
            info!("time synced, boot time {boot_time}");
        }
        self.flags.insert(StateFlags::NTP_GOT_TIME);
    }

    pub fn on_got_ip(&mut self) {
        self.flags.insert(StateFlags::GOT_IP_ADDRESS);
    }

    /// Returns whether the station should try to reassociate.
    pub fn on_disconnected(&mut self) -> bool {
        self.flags.remove(StateFlags::GOT_IP_ADDRESS);
        let config = self.config.config();
        !self.flags.contains(StateFlags::OTA_OR_REBOOT)
            && !config.ssid.is_empty()
            && !config.psk.is_empty()
    }

    /// Entry to any restart or firmware-update path.
    pub fn prepare_shutdown(&mut self) {
        self.flags.insert(StateFlags::OTA_OR_REBOOT);
        self.flush_header();
    }

    pub fn end_loop_turn(&mut self) {
        self.flags.remove(StateFlags::OTA_OR_REBOOT);
    }

    /// Saves the settings form and reports which network-facing fields
    /// changed, so the caller can re-apply them to the radio and SNTP.
    pub fn apply_settings(&mut self, form: &FormFields) -> Result<SettingsChange, ConfigError> {
        let before = self.config.config().clone();
        self.config.config_mut().apply_settings_form(form);
        self.config.save()?;
        let after = self.config.config();
        self.tz = after.time_zone();
        Ok(SettingsChange {
            hostname: before.hostname != after.hostname,
            station: before.ssid != after.ssid || before.psk != after.psk,
            ntp_server: before.ntp_server != after.ntp_server,
        })
    }

    pub fn apply_schedule(&mut self, form: &FormFields) -> Result<(), ConfigError> {
        self.config.config_mut().apply_schedule_form(form);
        self.config.save()
    }

    pub fn config(&self) -> &DeviceConfig {
        self.config.config()
    }

    pub fn time_zone(&self) -> &TimeZone {
        &self.tz
    }

    pub fn flags(&self) -> StateFlags {
        self.flags
    }

    pub fn readings(&self) -> &Readings {
        &self.readings
    }

    pub fn energy(&self) -> &EnergyAccumulator {
        &self.energy
    }

    pub fn last_frame_error(&self) -> Option<FrameError> {
        self.last_frame_error
    }

    pub fn boot_reason(&self) -> BootReason {
        self.boot_reason
    }

    pub fn nv_store(&self) -> Option<&NvStore<N>> {
        self.nv.as_ref()
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn meter_mut(&mut self) -> &mut M {
        &mut self.meter
    }

    pub fn uptime_seconds(&self, unix: i64) -> i64 {
        match self.boot_time {
            Some(boot) if self.flags.contains(StateFlags::NTP_GOT_TIME) => unix - boot,
            _ => 0,
        }
    }

    /// Oldest-first power history; empty without FRAM.
    pub fn history(&mut self) -> Vec<LogEntry> {
        let Some(nv) = self.nv.as_mut() else {
            return Vec::new();
        };
        let mut entries = Vec::with_capacity(usize::from(nv.len()));
        for entry in nv.entries() {
            match entry {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!("nv log read failed: {err}");
                    break;
                }
            }
        }
        entries
    }

    pub fn history_csv(&mut self) -> String {
        let entries = self.history();
        pages::history_csv(&entries, &self.tz)
    }

    pub fn status(&self, unix: i64) -> StatusSnapshot {
        let config = self.config.config();
        StatusSnapshot {
            hostname: config.hostname.clone(),
            local_time: self.tz.local(unix).format("%Y-%m-%d %H:%M:%S").to_string(),
            voltage: self.readings.voltage,
            current: self.readings.current,
            power: self.readings.power,
            apparent_power: self.readings.apparent_power(),
            reactive_power: self.readings.reactive_power(),
            power_factor: self.readings.power_factor(),
            energy_kwh: self.readings.energy_kwh,
            relay_on: self.flags.contains(StateFlags::RELAY),
            uptime_seconds: self.uptime_seconds(unix),
            boot_reason: self.boot_reason.as_str(),
            fram_present: self.flags.contains(StateFlags::FRAM_PRESENT),
            schedule_enabled: config.schedule_enabled,
            time_synced: self.flags.contains(StateFlags::NTP_GOT_TIME),
            got_ip: self.flags.contains(StateFlags::GOT_IP_ADDRESS),
            ap_mode: self.board.ap_mode(),
            history_entries: self.nv.as_ref().map_or(0, |nv| nv.len()),
            last_frame_error: self.last_frame_error.map(|err| err.to_string()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{MemEeprom, SIGNATURE};
    use crate::frame::{FrameFields, ADJ_PULSE_OVERFLOW};
    use crate::nvram::{MemNvram, NvHeader};
    use crate::schedule::DaySchedule;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default)]
    pub struct TestBoard {
        pub relay: bool,
        pub relay_writes: Vec<bool>,
        pub pressed: bool,
        pub led: bool,
        pub ap: bool,
        pub delays: Vec<u32>,
    }

    impl Board for TestBoard {
        fn set_relay(&mut self, on: bool) {
            self.relay = on;
            self.relay_writes.push(on);
        }

        fn button_pressed(&mut self) -> bool {
            self.pressed
        }

        fn set_led(&mut self, on: bool) {
            self.led = on;
        }

        fn toggle_led(&mut self) {
            self.led = !self.led;
        }

        fn ap_mode(&self) -> bool {
            self.ap
        }

        fn delay_ms(&mut self, ms: u32) {
            self.delays.push(ms);
        }
    }

    type TestDevice = Device<TestBoard, VecDeque<u8>, MemNvram, MemEeprom>;

    fn eeprom_with(config: &DeviceConfig) -> MemEeprom {
        MemEeprom::from_bytes(config.to_bytes())
    }

    fn utc_config() -> DeviceConfig {
        DeviceConfig {
            timezone: "UTC0".into(),
            ..DeviceConfig::default()
        }
    }

    fn boot_with(config: &DeviceConfig, nv: Option<MemNvram>, reason: BootReason) -> TestDevice {
        Device::boot(
            TestBoard::default(),
            VecDeque::new(),
            nv,
            eeprom_with(config),
            reason,
            0,
        )
        .unwrap()
    }

    fn nv_with_header(ovflow: u32, pulses: u16, restored_pulses: u16) -> MemNvram {
        let mut nv = MemNvram::default();
        let mut header = NvHeader {
            ovflow,
            pulses,
            restored_pulses,
            ..NvHeader::fresh()
        };
        header.crc = header.compute_crc();
        nv.write(0, &header.to_bytes()).unwrap();
        nv
    }

    fn frame(watts_period: u32, pulses: u16, overflow: bool) -> [u8; 24] {
        FrameFields {
            kv: 1_200_000,
            tv: 10_000,
            ki: 10_000,
            ti: 10_000,
            kp: 5_264_000,
            tp: watts_period,
            adjustment: FrameFields::default().adjustment
                | if overflow { ADJ_PULSE_OVERFLOW } else { 0 },
            pulses,
            ..FrameFields::default()
        }
        .encode()
    }

    #[test]
    fn relay_follows_boot_policy() {
        let config = DeviceConfig {
            relay_on_boot: true,
            ..utc_config()
        };
        let device = boot_with(&config, None, BootReason::Software);
        assert!(device.board().relay);
        assert!(device.flags().contains(StateFlags::RELAY));
        assert!(!device.flags().contains(StateFlags::FRAM_PRESENT));
    }

    #[test]
    fn blank_eeprom_boots_with_defaults() {
        let device: TestDevice = Device::boot(
            TestBoard::default(),
            VecDeque::new(),
            None,
            MemEeprom::new(512),
            BootReason::PowerOn,
            0,
        )
        .unwrap();
        assert_eq!(device.config().signature, SIGNATURE);
        assert_eq!(device.config().hostname, "S31");
        assert!(!device.board().relay);
    }

    #[test]
    fn power_on_reset_folds_pulses() {
        let device = boot_with(
            &utc_config(),
            Some(nv_with_header(5, 60_000, 10_000)),
            BootReason::PowerOn,
        );
        assert_eq!(device.energy().ovflow(), 6);
        assert_eq!(device.energy().restored_pulses(), 4464);
    }

    #[test]
    fn software_restart_keeps_counters() {
        let device = boot_with(
            &utc_config(),
            Some(nv_with_header(5, 60_000, 10_000)),
            BootReason::Software,
        );
        assert_eq!(device.energy().ovflow(), 5);
        assert_eq!(device.energy().restored_pulses(), 10_000);
    }

    #[test]
    fn meter_frames_update_readings_and_header() {
        let mut device = boot_with(&utc_config(), Some(MemNvram::default()), BootReason::Software);
        device.meter_mut().extend([0x00, 0x13]);
        device.meter_mut().extend(frame(43_866, 1000, false));

        device.run_due(1_000, 0);
        let readings = *device.readings();
        assert!((readings.voltage - f64::from(1.01f32) * 120.0).abs() < 1e-6);
        assert!((readings.power - 5_264_000.0 / 43_866.0).abs() < 1e-6);
        assert_eq!(device.last_frame_error(), None);
        assert_eq!(device.nv_store().unwrap().header().pulses, 1000);

        device.meter_mut().extend(frame(43_866, 20, true));
        device.run_due(2_000, 0);
        assert_eq!(device.energy().ovflow(), 1);
        assert_eq!(device.nv_store().unwrap().header().ovflow, 1);
    }

    #[test]
    fn corrupt_frame_leaves_readings_untouched() {
        let mut device = boot_with(&utc_config(), None, BootReason::Software);
        device.meter_mut().extend(frame(43_866, 1000, false));
        device.run_due(1_000, 0);
        let before = *device.readings();

        let mut bad = frame(20_000, 1500, true);
        bad[23] ^= 0xFF;
        device.meter_mut().extend(bad);
        device.run_due(2_000, 0);

        assert_eq!(*device.readings(), before);
        assert_eq!(device.energy().ovflow(), 0);
        assert_eq!(device.last_frame_error(), Some(FrameError::Crc));

        device.run_due(3_000, 0);
        assert_eq!(device.last_frame_error(), Some(FrameError::Timeout));
    }

    #[test]
    fn button_press_toggles_relay() {
        let mut device = boot_with(&utc_config(), None, BootReason::Software);
        device.run_due(100, 0);
        device.board_mut().pressed = true;
        device.run_due(200, 0);
        assert!(device.board().relay);
        device.run_due(300, 0);
        device.board_mut().pressed = false;
        device.run_due(400, 0);
        device.board_mut().pressed = true;
        device.run_due(500, 0);
        assert!(!device.board().relay);
        assert_eq!(device.board().relay_writes, vec![false, true, false]);
    }

    #[test]
    fn long_press_restores_factory_configuration() {
        let config = DeviceConfig {
            hostname: "heater".into(),
            ..utc_config()
        };
        let mut device = boot_with(&config, None, BootReason::Software);
        device.board_mut().pressed = true;
        for tick in 1..=100 {
            device.run_due(tick * 100, 0);
        }
        assert_eq!(*device.config(), DeviceConfig::default());
    }

    #[test]
    fn history_waits_for_clock_and_averages_power() {
        let mut device = boot_with(&utc_config(), Some(MemNvram::default()), BootReason::Software);
        for second in 1..=10u64 {
            device.meter_mut().extend(frame(52_640, 0, false));
            device.run_due(second * 1_000, 1_700_000_000 + second as i64);
        }
        assert_eq!(device.nv_store().unwrap().len(), 0);

        device.on_time_synced(1_700_000_020, 20_000);
        assert_eq!(device.uptime_seconds(1_700_000_030), 30);
        for second in 11..=20u64 {
            device.meter_mut().extend(frame(52_640, 0, false));
            device.run_due(second * 1_000, 1_700_000_000 + second as i64);
        }

        let history = device.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].time, 1_700_000_020);
        assert!((history[0].power - 100.0).abs() < 1e-3);
        assert_eq!(
            device.history_csv(),
            "Date,Power\n2023-11-14 22:13:40,100.00\n"
        );
    }

    #[test]
    fn header_flush_persists_counters_every_five_seconds() {
        let mut nv = MemNvram::default();
        let mut device = Device::boot(
            TestBoard::default(),
            VecDeque::new(),
            Some(&mut nv),
            eeprom_with(&utc_config()),
            BootReason::Software,
            0,
        )
        .unwrap();
        device.meter_mut().extend(frame(43_866, 777, false));
        device.run_due(1_000, 0);
        assert_eq!(device.nv_store().unwrap().header().pulses, 777);

        let ran = device.run_due(4_000, 0);
        assert!(!ran.contains(&Task::HeaderFlush));
        let ran = device.run_due(HEADER_FLUSH_PERIOD_MS, 0);
        assert!(ran.contains(&Task::HeaderFlush));
        drop(device);

        let mut raw = [0u8; NvHeader::LEN];
        raw.copy_from_slice(&nv.as_bytes()[..NvHeader::LEN]);
        let header = NvHeader::from_bytes(&raw);
        assert_eq!(header.pulses, 777);
        assert_eq!(header.crc, header.compute_crc());

        let store = NvStore::open(&mut nv).unwrap();
        assert!(!store.reinitialized());
        assert_eq!(store.header().pulses, 777);
    }

    #[test]
    fn settings_save_reports_network_changes() {
        let mut device = boot_with(&utc_config(), None, BootReason::Software);
        let change = device
            .apply_settings(&FormFields::parse("name=S31&ssid=none&psk=none"))
            .unwrap();
        assert!(!change.any());

        let change = device
            .apply_settings(&FormFields::parse("name=porch&ssid=home&ntp=pool.ntp.org"))
            .unwrap();
        assert_eq!(
            change,
            SettingsChange {
                hostname: true,
                station: true,
                ntp_server: true,
            }
        );
        assert_eq!(device.config().hostname, "porch");

        let change = device.apply_settings(&FormFields::parse("psk=secret")).unwrap();
        assert_eq!(
            change,
            SettingsChange {
                station: true,
                ..SettingsChange::default()
            }
        );
    }

    #[test]
    fn no_fram_registers_no_persistence_callbacks() {
        let mut device = boot_with(&utc_config(), None, BootReason::Software);
        let ran = device.run_due(10_000, 0);
        assert!(!ran.contains(&Task::HeaderFlush));
        assert!(!ran.contains(&Task::LogAppend));
        assert!(ran.contains(&Task::Meter));
    }

    #[test]
    fn schedule_switches_relay_once_time_is_known() {
        let mut config = DeviceConfig {
            schedule_enabled: true,
            ..utc_config()
        };
        // 2023-11-14 is a Tuesday.
        config.schedule.days[2] = DaySchedule {
            on_enabled: true,
            on_hour: 22,
            on_minute: 14,
            ..DaySchedule::default()
        };
        let mut device = boot_with(&config, None, BootReason::Software);
        let at = 1_700_000_040; // 22:14:00Z

        device.schedule_tick(at);
        assert!(!device.board().relay);

        device.on_time_synced(at, 1_000);
        device.schedule_tick(at);
        assert!(device.board().relay);
    }

    #[test]
    fn power_cycle_only_when_on() {
        let mut device = boot_with(&utc_config(), None, BootReason::Software);
        assert!(!device.power_cycle());

        device.set_relay(true);
        assert!(device.power_cycle());
        assert_eq!(device.board().relay_writes, vec![false, true, false, true]);
        assert_eq!(device.board().delays, vec![POWER_CYCLE_OFF_MS]);
        assert!(device.flags().contains(StateFlags::RELAY));
    }

    #[test]
    fn shutdown_flushes_and_blocks_reconnect() {
        let config = DeviceConfig {
            ssid: "home".into(),
            psk: "secret".into(),
            ..utc_config()
        };
        let mut device = boot_with(&config, Some(MemNvram::default()), BootReason::Software);
        device.on_got_ip();
        assert!(device.flags().contains(StateFlags::GOT_IP_ADDRESS));

        device.prepare_shutdown();
        assert!(!device.on_disconnected());
        assert!(!device.flags().contains(StateFlags::GOT_IP_ADDRESS));

        device.end_loop_turn();
        assert!(device.on_disconnected());
    }

    #[test]
    fn connect_blink_gives_up_after_twenty_cycles() {
        let mut device = boot_with(&utc_config(), None, BootReason::Software);
        assert!(!device.wait_for_network(|| false));
        assert_eq!(device.board().delays.len(), 40);

        let mut polls = 0;
        assert!(device.wait_for_network(|| {
            polls += 1;
            polls > 2
        }));
    }

    #[test]
    fn ap_led_blinks_only_in_ap_mode() {
        let mut device = boot_with(&utc_config(), None, BootReason::Software);
        device.blink_ap_led();
        assert!(!device.board().led);
        device.board_mut().ap = true;
        device.blink_ap_led();
        assert!(device.board().led);
    }
}
