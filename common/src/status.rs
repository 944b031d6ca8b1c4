use chrono::DateTime;

use crate::types::{ChannelState, ControllerStatus};

pub fn format_uptime(secs: i64) -> String {
    let secs = secs.max(0);
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    format!("{days} days, {hours:02} hours, {minutes:02} minutes, {seconds:02} seconds")
}

pub fn format_local_time(epoch: i64, offset: i64) -> String {
    epoch
        .checked_add(offset)
        .and_then(|local| DateTime::from_timestamp(local, 0))
        .map(|local| local.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}

fn state_cell(state: Option<ChannelState>) -> &'static str {
    match state {
        Some(ChannelState::On) => "<td class=\"on\">ON</td>",
        Some(ChannelState::Off) => "<td class=\"off\">OFF</td>",
        None => "<td>-</td>",
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn render_status_page(status: &ControllerStatus) -> String {
    let mut page = String::with_capacity(4096);
    page.push_str(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <meta http-equiv=\"refresh\" content=\"15\">\
         <title>Porssari relay controller</title>\
         <style>body{font-family:sans-serif;margin:1.5em}table{border-collapse:collapse;margin-bottom:1.5em}\
         td,th{border:1px solid #bbb;padding:.3em .8em;text-align:left}.on{background:#c8f7c5}.off{background:#eee}</style>\
         </head><body><h1>Porssari relay controller</h1>",
    );

    page.push_str("<h2>System</h2><table>");
    let last_fetch = match (status.last_fetch_status, status.last_fetch_code) {
        (Some(fetch), Some(code)) => format!("{} ({code})", fetch.as_str()),
        (Some(fetch), None) => fetch.as_str().to_string(),
        (None, _) => "-".to_string(),
    };
    let rows = [
        ("Device", escape(&status.device_id)),
        ("Client", escape(&status.client_version)),
        ("Phase", status.phase.as_str().to_string()),
        ("Connectivity", status.connectivity.as_str().to_string()),
        ("Clock synced", status.time_synced.to_string()),
        ("Local time", status.local_time.clone()),
        ("Uptime", status.uptime.clone()),
        ("Last fetch", last_fetch),
        ("Last request", status.last_request.to_string()),
        ("Output mode", status.output_mode.as_str().to_string()),
    ];
    for (label, value) in rows {
        page.push_str(&format!("<tr><th>{label}</th><td>{value}</td></tr>"));
    }
    page.push_str("</table>");

    page.push_str("<h2>Channels</h2><table><tr><th>#</th><th>Output</th><th>Target</th><th>State</th><th>Last applied</th></tr>");
    for channel in &status.channels {
        let applied = channel
            .last_applied
            .map_or_else(|| "-".to_string(), |stamp| stamp.to_string());
        page.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td>{}<td>{applied}</td></tr>",
            channel.id,
            channel.kind,
            escape(&channel.target),
            state_cell(channel.state),
        ));
    }
    page.push_str("</table>");

    page.push_str("<h2>Schedule</h2>");
    match &status.schedule {
        Some(schedule) => {
            page.push_str(&format!(
                "<p>Version {}, issued {}, valid until {} ({} h left)</p>",
                schedule.json_version, schedule.issued_at, schedule.valid_until, schedule.hours_left
            ));
            page.push_str("<table><tr><th>Channel</th><th>Time</th><th>State</th></tr>");
            for upcoming in &schedule.upcoming {
                page.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td>{}</tr>",
                    upcoming.channel,
                    upcoming.local_time,
                    state_cell(Some(upcoming.state)),
                ));
            }
            page.push_str("</table>");
        }
        None => page.push_str("<p>No schedule received yet.</p>"),
    }

    page.push_str("</body></html>");
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ChannelStatus, Connectivity, CyclePhase, FetchStatus, OutputMode, ScheduleSummary,
        UpcomingTransition,
    };

    #[test]
    fn uptime_is_zero_padded() {
        assert_eq!(format_uptime(0), "0 days, 00 hours, 00 minutes, 00 seconds");
        assert_eq!(
            format_uptime(2 * 86_400 + 3 * 3_600 + 4 * 60 + 5),
            "2 days, 03 hours, 04 minutes, 05 seconds"
        );
    }

    #[test]
    fn local_time_applies_offset() {
        assert_eq!(format_local_time(1_700_000_000, 7_200), "00:13:20");
        assert_eq!(format_local_time(0, -3_600), "23:00:00");
        assert_eq!(format_local_time(1_700_000_000, i64::MAX), "--:--:--");
    }

    #[test]
    fn page_lists_channels_and_schedule() {
        let status = ControllerStatus {
            device_id: "aabb<script>".into(),
            client_version: "Rust-0.1.0".into(),
            phase: CyclePhase::SteadyState,
            connectivity: Connectivity::Station,
            time_synced: true,
            now_epoch: 1_700_000_000,
            local_time: "00:13:20".into(),
            uptime_secs: 60,
            uptime: format_uptime(60),
            last_fetch_status: Some(FetchStatus::Unchanged),
            last_fetch_code: Some(304),
            last_request: 1_699_999_000,
            output_mode: OutputMode::Schedule,
            schedule: Some(ScheduleSummary {
                issued_at: 1_699_999_000,
                valid_until: 1_700_086_400,
                remaining_secs: 86_400,
                hours_left: 24,
                json_version: 2,
                upcoming: vec![UpcomingTransition {
                    channel: 1,
                    at: 1_700_003_600,
                    local_time: "01:13:20".into(),
                    state: ChannelState::On,
                }],
            }),
            channels: vec![ChannelStatus {
                id: 1,
                kind: "GPIO",
                target: "pin 21".into(),
                state: Some(ChannelState::Off),
                last_applied: Some(1_699_999_500),
            }],
        };

        let page = render_status_page(&status);

        assert!(page.contains("aabb&lt;script&gt;"));
        assert!(page.contains("UNCHANGED (304)"));
        assert!(page.contains("<td class=\"off\">OFF</td>"));
        assert!(page.contains("<td>01:13:20</td><td class=\"on\">ON</td>"));
        assert!(page.contains("24 h left"));
    }
}
