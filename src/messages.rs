use serde_derive::Serialize;

pub const SPACE_COUNT: usize = 4;

/// Distance reported when no echo arrives before the timeout.
pub const NO_ECHO_CM: f32 = 999.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Occupancy {
    Free,
    Occupied,
}

impl Occupancy {
    pub fn is_occupied(self) -> bool {
        self == Occupancy::Occupied
    }
}

/// One space's result from a sampling pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    /// 1-based space number.
    pub place: u8,
    pub distance_cm: f32,
    pub occupancy: Occupancy,
}

/// All four readings of one complete sampling pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    readings: [Reading; SPACE_COUNT],
}

impl Snapshot {
    pub fn new(readings: [Reading; SPACE_COUNT]) -> Self {
        Snapshot { readings }
    }

    pub fn readings(&self) -> &[Reading; SPACE_COUNT] {
        &self.readings
    }

    pub fn total(&self) -> usize {
        SPACE_COUNT
    }

    pub fn occupied(&self) -> usize {
        self.readings
            .iter()
            .filter(|r| r.occupancy.is_occupied())
            .count()
    }

    pub fn free(&self) -> usize {
        self.total() - self.occupied()
    }

    /// Share of free spaces as a whole percentage.
    pub fn availability(&self) -> u8 {
        (self.free() as f32 * 100.0 / self.total() as f32).round() as u8
    }
}

/// Retained JSON document published on the status topic.
#[derive(Debug, Serialize)]
pub struct StatusMessage {
    pub device: String,
    pub free: usize,
    pub occupied: usize,
    pub availability: u8,
    pub places: Vec<PlaceMessage>,
}

#[derive(Debug, Serialize)]
pub struct PlaceMessage {
    pub place: u8,
    pub distance: f64,
    pub occupied: bool,
}

impl StatusMessage {
    pub fn from_snapshot(device: &str, snapshot: &Snapshot) -> Self {
        StatusMessage {
            device: device.to_string(),
            free: snapshot.free(),
            occupied: snapshot.occupied(),
            availability: snapshot.availability(),
            places: snapshot
                .readings()
                .iter()
                .map(|r| PlaceMessage {
                    place: r.place,
                    distance: one_decimal(r.distance_cm),
                    occupied: r.occupancy.is_occupied(),
                })
                .collect(),
        }
    }
}

fn one_decimal(value: f32) -> f64 {
    (f64::from(value) * 10.0).round() / 10.0
}

/// A message received on the control topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
