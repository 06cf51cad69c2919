//! Builds the human-readable `GET_STATUS` report.

use crate::registry::{ClientId, ClientInfo};
use std::net::SocketAddr;

const BANNER_WIDTH: usize = 50;

fn banner(text: &str) -> String {
    let decorated = format!(" {text} ");
    let fill = BANNER_WIDTH.saturating_sub(decorated.chars().count());
    let left = fill / 2;
    let right = fill - left;
    format!("{}{}{}", ":".repeat(left), decorated, ":".repeat(right))
}

fn format_elapsed(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{hours:02}h{minutes:02}m{secs:02}s")
}

/// Render the full status report string for `GET_STATUS`.
pub fn build_status(
    server_addr: SocketAddr,
    pid: i64,
    mut clients: Vec<(ClientId, ClientInfo, bool)>,
    collected: u64,
    total: u64,
) -> String {
    clients.sort_by_key(|(id, ..)| *id);

    let mut lines = Vec::new();
    lines.push(banner(&format!(
        "Status ({}:{}/{pid})",
        server_addr.ip(),
        server_addr.port()
    )));

    if clients.is_empty() {
        lines.push("No client connected right now.".to_string());
    } else {
        for (id, info, alive) in &clients {
            let marker = if *alive { ' ' } else { '+' };
            let resource = info.current_resource_id.as_deref().unwrap_or("-");
            let elapsed = (chrono::Local::now() - info.start_time).num_seconds();
            lines.push(format!(
                "#{id} {marker} {name} ({ip}:{port}/{clientpid}): {resource} since {since} [{collected} collected in {elapsed}]",
                name = info.name,
                ip = info.addr.ip(),
                port = info.addr.port(),
                clientpid = info.pid,
                since = info.last_update_time.format("%d/%m/%Y %H:%M:%S"),
                collected = info.collected_count,
                elapsed = format_elapsed(elapsed),
            ));
        }
    }

    let pct = if total == 0 {
        0.0
    } else {
        (collected as f64 / total as f64) * 100.0
    };
    lines.push(banner(&format!("Status ({pct:.1}% collected)")));

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn empty_registry_reports_no_clients() {
        let status = build_status(addr(), 123, vec![], 0, 2);
        assert!(status.contains("No client connected right now."));
        assert!(status.starts_with(':'));
    }

    #[test]
    fn includes_a_line_per_client_with_liveness_marker() {
        let info = ClientInfo::new("worker-a".into(), addr(), 77);
        let status = build_status(addr(), 1, vec![(1, info.clone(), true)], 1, 2);
        assert!(status.contains("#1"));
        assert!(status.contains("worker-a"));
        assert!(status.contains("50.0% collected"));

        let dead = build_status(addr(), 1, vec![(2, info, false)], 1, 2);
        assert!(dead.contains("#2 +"));
    }

    #[test]
    fn elapsed_formats_as_hhmmss() {
        assert_eq!(format_elapsed(3723), "01h02m03s");
        assert_eq!(format_elapsed(5), "00h00m05s");
    }

    #[test]
    fn banner_pads_to_fixed_width() {
        let line = banner("Status (x)");
        assert_eq!(line.chars().count(), BANNER_WIDTH);
    }
}
