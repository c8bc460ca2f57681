//! HTML and CSV bodies for the embedded web interface.

use std::fmt::Write as _;

use crate::config::DeviceConfig;
use crate::nvram::LogEntry;
use crate::schedule::DayOfWeek;
use crate::tz::TimeZone;
use crate::types::StatusSnapshot;

const STYLE: &str =
    "body { background-color: #cccccc; font-family: Arial, Helvetica, Sans-Serif; Color: #000088; }";

const HISTORY_SCRIPT: &str = r#"<script type="text/javascript">
      Dygraph.onDOMready(function onDOMready() {
        new Dygraph(document.getElementById('history'), 'data.txt', {
          title: 'Power history',
          width: 600,
          height: 300,
          legend: 'always',
          showRangeSelector: true,
        });
      });</script>"#;

pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&#39;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// `D days HH:MM:SS`
pub fn format_uptime(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{} days {:02}:{:02}:{:02}",
        seconds / 86_400,
        (seconds / 3600) % 24,
        (seconds / 60) % 60,
        seconds % 60
    )
}

fn head(hostname: &str, refresh: Option<(u32, &str)>, extra: &str) -> String {
    let refresh = refresh
        .map(|(secs, url)| format!("<meta http-equiv='Refresh' content='{secs}; url={url}'>"))
        .unwrap_or_default();
    format!(
        "<html lang='en'><head><meta charset='UTF-8'>{refresh}<title>{name}</title>\
         <style>{STYLE}</style>\
         <link rel='icon' type='image/x-icon' href='/favicon.ico'>{extra}</head>\n",
        name = escape(hostname)
    )
}

fn message_page(hostname: &str, message: &str, refresh_secs: u32) -> String {
    format!(
        "{}<body>\n<h1>Switch {}</h1>{message}<br>\n</body>\n</html>",
        head(hostname, Some((refresh_secs, "/")), ""),
        escape(hostname)
    )
}

pub fn status_page(status: &StatusSnapshot, firmware: &str) -> String {
    let name = escape(&status.hostname);
    let graph_assets = if status.fram_present {
        "<script src='dygraph.min.js'></script>\
         <link rel='stylesheet' type='text/css' href='dygraph.css'>\
         <style>.dygraph-legend {text-align: right;background: none;}</style>"
    } else {
        ""
    };

    let mut body = head(&status.hostname, Some((60, "/")), graph_assets);
    let _ = write!(
        body,
        "<body>\n<h1>Switch {name}</h1>{time}<p>\
         {v:.2}V {i:.3}A<br>{p:.2}W<br>{va:.2}VA<br>{vars:.2}VAR<br>PF={pf:.1}<br>{kwh:.6}kWh<br>",
        time = escape(&status.local_time),
        v = status.voltage,
        i = status.current,
        p = status.power,
        va = status.apparent_power,
        vars = status.reactive_power,
        pf = status.power_factor,
        kwh = status.energy_kwh,
    );

    if status.relay_on {
        body.push_str("<p>Plug is on, turn <a href='/off'>Off</a>");
        body.push_str("<p><a href='/powercycle'>Load Power Cycle</a>");
    } else {
        body.push_str("<p>Plug is off, turn <a href='/on'>On</a>");
    }
    if status.fram_present {
        body.push_str("<div id='history'></div>");
    }
    body.push_str("<p><a href='/config'>Configuration</a>");
    if status.schedule_enabled {
        body.push_str("<p><a href='/schedule'>Schedule</a>");
    }

    let _ = write!(
        body,
        "<p><font size=1>Uptime: {}<br>Firmware: {}<br>Boot reason: {}</font>",
        format_uptime(status.uptime_seconds),
        escape(firmware),
        status.boot_reason
    );
    if status.fram_present {
        body.push_str(HISTORY_SCRIPT);
    }
    body.push_str("</body></html>");
    body
}

pub fn relay_page(hostname: &str, on: bool) -> String {
    message_page(hostname, if on { "Relay is on" } else { "Relay is off" }, 1)
}

pub fn power_cycle_page(hostname: &str, cycling: bool) -> String {
    message_page(
        hostname,
        if cycling { "Power cycling" } else { "Not powercycling" },
        1,
    )
}

pub fn saved_page(hostname: &str) -> String {
    message_page(hostname, "Saved", 1)
}

pub fn reboot_page(hostname: &str) -> String {
    message_page(hostname, "Rebooting", 10)
}

pub fn error_page(hostname: &str, message: &str) -> String {
    message_page(hostname, &escape(message), 5)
}

fn checked(on: bool) -> &'static str {
    if on {
        "checked"
    } else {
        ""
    }
}

pub fn config_page(config: &DeviceConfig) -> String {
    let name = escape(&config.hostname);
    let row = |label: &str, input: String| {
        format!("<tr><td width='40%'>{label}:</td><td>{input}</td></tr>\n")
    };
    let text = |field: &str, value: &str, max: usize| {
        format!(
            "<input name='{field}' type='text' value='{}' size='31' maxlength='{max}'>",
            escape(value)
        )
    };
    let factor = |field: &str, value: f32| {
        format!(
            "<input name='{field}' type='text' value='{value:5.3}' size='31' \
             pattern='^[0-1]\\.[0-9]{{1,3}}$' title='float with up to 3 decimals'>"
        )
    };
    let checkbox = |field: &str, on: bool| {
        format!("<input name='{field}' type='checkbox' value='true' {}>", checked(on))
    };

    let mut body = head(&config.hostname, None, "");
    let _ = write!(
        body,
        "<body>\n<h1>Switch {name}</h1>\
         <form method='post' action='/save' name='Configuration'>\n\
         <table border=0 width='520' cellspacing=4 cellpadding=0>\n"
    );
    body.push_str(&row("Name", text("name", &config.hostname, 31)));
    body.push_str(&row("SSID", text("ssid", &config.ssid, 32)));
    body.push_str(&row("WPA Pass Phrase", text("psk", &config.psk, 63)));
    body.push_str(&row("NTP Server", text("ntp", &config.ntp_server, 63)));
    body.push_str(&row("Timezone", text("tz", &config.timezone, 31)));
    body.push_str(&row("On at boot", checkbox("relay", config.relay_on_boot)));
    body.push_str(&row("Schedule", checkbox("sched", config.schedule_enabled)));
    body.push_str(&row("Correction factor V", factor("vf", config.calibration.voltage)));
    body.push_str(&row("Correction factor I", factor("if", config.calibration.current)));
    body.push_str(&row("Correction factor P", factor("pf", config.calibration.power)));
    body.push_str(
        "</table><p><input name='Save' type='submit' value='Save'/>\n<br></form>\
         <form method='post' action='/reboot' name='Reboot'>\n\
         <input name='Reboot' type='submit' value='Reboot'/>\n<br></form>\n</body>\n</html>",
    );
    body
}

pub fn schedule_page(config: &DeviceConfig) -> String {
    let mut body = head(&config.hostname, None, "");
    let _ = write!(
        body,
        "<body>\n<h1>Switch {}</h1>\
         <form method='post' action='/schedulesave' name='Schedule'>\n\
         <table border=0 width='520' cellspacing=4 cellpadding=0>\n",
        escape(&config.hostname)
    );

    for day in DayOfWeek::ALL {
        let i = day.index();
        let entry = config.schedule.day(day);
        let _ = write!(
            body,
            "<tr><td><b>{name}:</b></td></tr>\n\
             <tr><td>on:<input name='eon{i}' type='checkbox' value='true' {eon}>\
             <input name='on{i}' type='time' value='{on_h:02}:{on_m:02}'></td>\
             <td>off:<input name='eof{i}' type='checkbox' value='true' {eof}>\
             <input name='off{i}' type='time' value='{off_h:02}:{off_m:02}'></td>\
             <td>Randomize:<input name='r{i}' type='checkbox' value='true' {r}></td></tr>\n\
             <tr><td>&nbsp;</td></tr>",
            name = day.name(),
            eon = checked(entry.on_enabled),
            on_h = entry.on_hour,
            on_m = entry.on_minute,
            eof = checked(entry.off_enabled),
            off_h = entry.off_hour,
            off_m = entry.off_minute,
            r = checked(entry.randomize),
        );
    }

    body.push_str(
        "</table><p><input name='Save' type='submit' value='Save'>\n</form></body></html>",
    );
    body
}

/// `Date,Power` header, then one `YYYY-MM-DD HH:MM:SS,W.WW` line per entry
/// in local time.
pub fn history_csv(entries: &[LogEntry], tz: &TimeZone) -> String {
    let mut out = String::with_capacity(16 + entries.len() * 28);
    out.push_str("Date,Power\n");
    for entry in entries {
        let _ = writeln!(
            out,
            "{},{:.2}",
            tz.local(entry.time).format("%Y-%m-%d %H:%M:%S"),
            entry.power
        );
    }
    out
}

pub fn status_json(status: &StatusSnapshot) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(status)
}
