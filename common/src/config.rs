use log::warn;
use thiserror::Error;

use crate::form::FormFields;
use crate::schedule::{DayOfWeek, DaySchedule, WeeklySchedule};
use crate::tz::TimeZone;

pub const SIGNATURE: u32 = 0x1a2b_3b4e;
pub const DEFAULT_HOSTNAME: &str = "S31";
pub const DEFAULT_TIMEZONE: &str = "EST5EDT,M3.2.0,M11.1.0";
/// Factory value of the SSID and PSK fields.
pub const UNSET_CREDENTIAL: &str = "none";

const HOSTNAME_LEN: usize = 32;
const SSID_LEN: usize = 64;
const PSK_LEN: usize = 64;
const NTP_LEN: usize = 64;
const TIMEZONE_LEN: usize = 32;

/// Longest SSID an 802.11 station can join; the record field is wider.
const STATION_SSID_MAX: usize = 32;

const CFG_RELAY_ON_BOOT: u8 = 0x01;
const CFG_SCHEDULE: u8 = 0x02;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("eeprom error: {0}")]
    Eeprom(String),
    #[error("configuration record truncated: {0} bytes")]
    TooShort(usize),
}

/// Multiplicative corrections applied to the front-end's V, I and P.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub voltage: f32,
    pub current: f32,
    pub power: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            voltage: 1.01,
            current: 0.995,
            power: 1.00,
        }
    }
}

/// The persisted settings record. Serialized field by field into a packed
/// 309-byte little-endian layout at EEPROM offset 0.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub signature: u32,
    pub hostname: String,
    pub ssid: String,
    pub psk: String,
    pub ntp_server: String,
    pub timezone: String,
    pub calibration: Calibration,
    pub relay_on_boot: bool,
    pub schedule_enabled: bool,
    pub on_delay: u8,
    pub schedule: WeeklySchedule,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            signature: SIGNATURE,
            hostname: DEFAULT_HOSTNAME.to_string(),
            ssid: UNSET_CREDENTIAL.to_string(),
            psk: UNSET_CREDENTIAL.to_string(),
            ntp_server: String::new(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            calibration: Calibration::default(),
            relay_on_boot: false,
            schedule_enabled: false,
            on_delay: 0,
            schedule: WeeklySchedule::default(),
        }
    }
}

impl DeviceConfig {
    pub const LEN: usize = 4
        + HOSTNAME_LEN
        + SSID_LEN
        + PSK_LEN
        + NTP_LEN
        + TIMEZONE_LEN
        + 12
        + 2
        + 7 * DaySchedule::LEN;

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.relay_on_boot {
            flags |= CFG_RELAY_ON_BOOT;
        }
        if self.schedule_enabled {
            flags |= CFG_SCHEDULE;
        }
        flags
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.signature.to_le_bytes());
        put_str(&mut out, &self.hostname, HOSTNAME_LEN);
        put_str(&mut out, &self.ssid, SSID_LEN);
        put_str(&mut out, &self.psk, PSK_LEN);
        put_str(&mut out, &self.ntp_server, NTP_LEN);
        put_str(&mut out, &self.timezone, TIMEZONE_LEN);
        for factor in [
            self.calibration.voltage,
            self.calibration.current,
            self.calibration.power,
        ] {
            out.extend_from_slice(&factor.to_le_bytes());
        }
        out.push(self.flags());
        out.push(self.on_delay);
        for day in &self.schedule.days {
            out.extend_from_slice(&day.to_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.len() < Self::LEN {
            return Err(ConfigError::TooShort(bytes.len()));
        }
        let mut r = Reader { bytes, pos: 0 };

        let signature = u32::from_le_bytes(r.array());
        let hostname = r.string(HOSTNAME_LEN);
        let ssid = r.string(SSID_LEN);
        let psk = r.string(PSK_LEN);
        let ntp_server = r.string(NTP_LEN);
        let timezone = r.string(TIMEZONE_LEN);
        let calibration = Calibration {
            voltage: f32::from_le_bytes(r.array()),
            current: f32::from_le_bytes(r.array()),
            power: f32::from_le_bytes(r.array()),
        };
        let [flags, on_delay] = r.array();
        let mut schedule = WeeklySchedule::default();
        for day in &mut schedule.days {
            *day = DaySchedule::from_bytes(&r.array());
        }

        Ok(Self {
            signature,
            hostname,
            ssid,
            psk,
            ntp_server,
            timezone,
            calibration,
            relay_on_boot: flags & CFG_RELAY_ON_BOOT != 0,
            schedule_enabled: flags & CFG_SCHEDULE != 0,
            on_delay,
            schedule,
        })
    }

    /// Credentials to join with. A field still holding its factory value
    /// takes the build-time default instead; no SSID at all means AP mode.
    pub fn station_credentials(
        &self,
        build_ssid: Option<&str>,
        build_psk: Option<&str>,
    ) -> Option<(String, String)> {
        let pick = |stored: &str, fallback: Option<&str>| {
            if stored.is_empty() || stored == UNSET_CREDENTIAL {
                fallback.unwrap_or_default().to_string()
            } else {
                stored.to_string()
            }
        };
        let ssid = pick(&self.ssid, build_ssid);
        let psk = pick(&self.psk, build_psk);
        (!ssid.is_empty()).then_some((ssid, psk))
    }

    /// Timezone in effect; an unparsable stored rule falls back to UTC.
    pub fn time_zone(&self) -> TimeZone {
        TimeZone::parse(&self.timezone).unwrap_or_else(|err| {
            warn!("{err}; using UTC");
            TimeZone::default()
        })
    }

    /// Applies the settings form. Absent text fields and unparsable numbers
    /// keep their stored value; absent checkboxes clear their flag.
    pub fn apply_settings_form(&mut self, form: &FormFields) {
        for (name, field, len) in [
            ("name", &mut self.hostname, HOSTNAME_LEN),
            ("ssid", &mut self.ssid, STATION_SSID_MAX + 1),
            ("psk", &mut self.psk, PSK_LEN),
            ("ntp", &mut self.ntp_server, NTP_LEN),
        ] {
            if let Some(value) = form.get(name) {
                *field = truncate(value.trim(), len - 1).to_string();
            }
        }

        if let Some(value) = form.get("tz") {
            let value = truncate(value.trim(), TIMEZONE_LEN - 1);
            match TimeZone::parse(value) {
                Ok(_) => self.timezone = value.to_string(),
                Err(err) => warn!("settings: {err}; keeping '{}'", self.timezone),
            }
        }

        for (name, factor) in [
            ("vf", &mut self.calibration.voltage),
            ("if", &mut self.calibration.current),
            ("pf", &mut self.calibration.power),
        ] {
            if let Some(value) = form.get(name) {
                match value.trim().parse::<f32>() {
                    Ok(parsed) if parsed.is_finite() => *factor = parsed,
                    _ => warn!("settings: ignoring {name}='{value}'"),
                }
            }
        }

        self.relay_on_boot = form.contains("relay");
        self.schedule_enabled = form.contains("sched");
    }

    /// Applies the weekly schedule form (`on<i>`/`off<i>` as `HH:MM`,
    /// checkboxes `eon<i>`, `eof<i>`, `r<i>`).
    pub fn apply_schedule_form(&mut self, form: &FormFields) {
        for day in DayOfWeek::ALL {
            let i = day.index();
            let entry = self.schedule.day_mut(day);

            if let Some((hour, minute)) = form.get(&format!("on{i}")).and_then(parse_hh_mm) {
                if (0..=23).contains(&hour) {
                    entry.on_hour = hour as u8;
                }
                if (0..=59).contains(&minute) {
                    entry.on_minute = minute as u8;
                }
            }
            if let Some((hour, minute)) = form.get(&format!("off{i}")).and_then(parse_hh_mm) {
                if (0..=23).contains(&hour) {
                    entry.off_hour = hour as u8;
                }
                if (0..=59).contains(&minute) {
                    entry.off_minute = minute as u8;
                }
            }

            entry.on_enabled = form.contains(&format!("eon{i}"));
            entry.off_enabled = form.contains(&format!("eof{i}"));
            entry.randomize = form.contains(&format!("r{i}"));
        }
    }
}

fn parse_hh_mm(value: &str) -> Option<(i32, i32)> {
    let mut parts = value.trim().split(':');
    let hour = parts.next()?.trim().parse().ok()?;
    let minute = parts.next()?.trim().parse().ok()?;
    Some((hour, minute))
}

fn truncate(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

fn put_str(out: &mut Vec<u8>, value: &str, len: usize) {
    let value = truncate(value, len - 1).as_bytes();
    out.extend_from_slice(value);
    out.resize(out.len() + len - value.len(), 0);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, len: usize) -> &[u8] {
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        slice
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N));
        out
    }

    fn string(&mut self, len: usize) -> String {
        let raw = self.take(len);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }
}

/// Byte-addressable emulated EEPROM window.
pub trait Eeprom {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), ConfigError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), ConfigError>;
    fn commit(&mut self) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemEeprom {
    bytes: Vec<u8>,
    commits: usize,
}

impl MemEeprom {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0xFF; size],
            commits: 0,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, commits: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn commits(&self) -> usize {
        self.commits
    }
}

impl Eeprom for MemEeprom {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), ConfigError> {
        let end = offset + buf.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0xFF);
        }
        buf.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), ConfigError> {
        let end = offset + data.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0xFF);
        }
        self.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ConfigError> {
        self.commits += 1;
        Ok(())
    }
}

/// Loads, persists and resets the [`DeviceConfig`] record.
#[derive(Debug)]
pub struct ConfigStore<E> {
    eeprom: E,
    config: DeviceConfig,
    reset_on_load: bool,
}

impl<E: Eeprom> ConfigStore<E> {
    pub fn load(mut eeprom: E) -> Result<Self, ConfigError> {
        let mut raw = vec![0u8; DeviceConfig::LEN];
        eeprom.read(0, &mut raw)?;
        let stored = DeviceConfig::from_bytes(&raw)?;

        let mut store = Self {
            eeprom,
            config: stored,
            reset_on_load: false,
        };

        if store.config.signature != SIGNATURE {
            warn!(
                "config signature {:#010x} invalid; restoring factory defaults",
                store.config.signature
            );
            store.reset_on_load = true;
            store.factory_reset()?;
        }
        Ok(store)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut DeviceConfig {
        &mut self.config
    }

    /// True when `load` found no valid record.
    pub fn reset_on_load(&self) -> bool {
        self.reset_on_load
    }

    pub fn save(&mut self) -> Result<(), ConfigError> {
        self.config.signature = SIGNATURE;
        self.eeprom.write(0, &self.config.to_bytes())?;
        self.eeprom.commit()
    }

    pub fn factory_reset(&mut self) -> Result<(), ConfigError> {
        self.config = DeviceConfig::default();
        self.save()
    }

    pub fn into_inner(self) -> E {
        self.eeprom
    }
}
