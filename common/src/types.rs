use serde::Serialize;

/// Live line measurements plus the cumulative energy total.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Readings {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy_kwh: f64,
}

impl Readings {
    pub fn apparent_power(&self) -> f64 {
        self.voltage * self.current
    }

    pub fn reactive_power(&self) -> f64 {
        let apparent = self.apparent_power();
        let squared = apparent * apparent - self.power * self.power;
        if squared > 0.0 {
            squared.sqrt()
        } else {
            0.0
        }
    }

    pub fn power_factor(&self) -> f64 {
        if self.voltage > 0.0 && self.current > 0.0 {
            self.power / self.voltage / self.current
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootReason {
    PowerOn,
    Software,
    Watchdog,
    Panic,
    Brownout,
    External,
    DeepSleep,
    Unknown,
}

impl BootReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PowerOn => "Power On",
            Self::Software => "Software/System restart",
            Self::Watchdog => "Watchdog",
            Self::Panic => "Exception",
            Self::Brownout => "Brownout",
            Self::External => "External System",
            Self::DeepSleep => "Deep-Sleep Wake",
            Self::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub hostname: String,
    #[serde(rename = "localTime")]
    pub local_time: String,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    #[serde(rename = "apparentPower")]
    pub apparent_power: f64,
    #[serde(rename = "reactivePower")]
    pub reactive_power: f64,
    #[serde(rename = "powerFactor")]
    pub power_factor: f64,
    #[serde(rename = "energyKwh")]
    pub energy_kwh: f64,
    #[serde(rename = "relayOn")]
    pub relay_on: bool,
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: i64,
    #[serde(rename = "bootReason")]
    pub boot_reason: &'static str,
    #[serde(rename = "framPresent")]
    pub fram_present: bool,
    #[serde(rename = "scheduleEnabled")]
    pub schedule_enabled: bool,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "gotIp")]
    pub got_ip: bool,
    #[serde(rename = "apMode")]
    pub ap_mode: bool,
    #[serde(rename = "historyEntries")]
    pub history_entries: u16,
    #[serde(rename = "lastFrameError")]
    pub last_frame_error: Option<String>,
}
