use crate::messages::{NO_ECHO_CM, Occupancy};

/// A space is occupied when something sits closer than `threshold_cm`.
/// Non-positive readings and the no-echo sentinel count as free.
pub fn classify(distance_cm: f32, threshold_cm: f32) -> Occupancy {
    if distance_cm > 0.0 && distance_cm < threshold_cm && distance_cm < NO_ECHO_CM {
        Occupancy::Occupied
    } else {
        Occupancy::Free
    }
}
