//! Operator-facing status text

use std::fmt::Write as _;

use crate::messages::{NO_ECHO_CM, Occupancy, Reading, Snapshot};

/// Inner width of the report box, in characters.
const WIDTH: usize = 36;

fn top() -> String {
    format!("╔{}╗", "═".repeat(WIDTH))
}

fn divider() -> String {
    format!("╠{}╣", "═".repeat(WIDTH))
}

fn bottom() -> String {
    format!("╚{}╝", "═".repeat(WIDTH))
}

fn row(text: &str) -> String {
    format!("║{:<width$}║", text, width = WIDTH)
}

fn place_row(reading: &Reading) -> String {
    let label = match reading.occupancy {
        Occupancy::Occupied => "[OCCUPIED]",
        Occupancy::Free => "[FREE    ]",
    };
    let distance = if reading.distance_cm >= NO_ECHO_CM {
        "No Object".to_string()
    } else {
        format!("{:>5.1} cm", reading.distance_cm)
    };
    row(&format!(" Place {}: {} - {}", reading.place, label, distance))
}

/// Render the boxed status report for one sampling pass.
pub fn render(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", top());
    let _ = writeln!(out, "{}", row("      PARKING STATUS REPORT"));
    let _ = writeln!(out, "{}", divider());
    for reading in snapshot.readings() {
        let _ = writeln!(out, "{}", place_row(reading));
    }
    let _ = writeln!(out, "{}", divider());
    let _ = writeln!(
        out,
        "{}",
        row(&format!(
            " FREE: {} | OCCUPIED: {} | TOTAL: {}",
            snapshot.free(),
            snapshot.occupied(),
            snapshot.total()
        ))
    );
    let _ = writeln!(
        out,
        "{}",
        row(&format!(" Availability: {}%", snapshot.availability()))
    );
    let _ = write!(out, "{}", bottom());
    out
}

/// Startup banner naming this device and its broker.
pub fn render_banner(client_id: &str, broker: &str) -> String {
    [
        top(),
        row("   SMART PARKING SYSTEM"),
        divider(),
        row(&format!(" Client ID: {}", client_id)),
        row(&format!(" Broker: {}", broker)),
        bottom(),
    ]
    .join("\n")
}
