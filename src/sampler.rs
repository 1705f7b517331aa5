use std::time::Duration;

use crate::hardware::{Delay, EchoInput, Level, OutputPin};
use crate::messages::NO_ECHO_CM;

const SETTLE_US: u64 = 2;
const TRIGGER_PULSE_US: u64 = 10;

/// Trigger and echo lines of one ultrasonic sensor.
pub struct Sensor<O, E> {
    pub trigger: O,
    pub echo: E,
}

pub struct Sampler<D> {
    delay: D,
    echo_timeout: Duration,
    cm_per_us: f32,
}

impl<D: Delay> Sampler<D> {
    pub fn new(delay: D, echo_timeout: Duration, cm_per_us: f32) -> Self {
        Sampler {
            delay,
            echo_timeout,
            cm_per_us,
        }
    }

    /// Fire one measurement and return the distance in centimeters, or
    /// [`NO_ECHO_CM`] when nothing echoes back before the timeout.
    pub fn measure<O: OutputPin, E: EchoInput>(&mut self, sensor: &mut Sensor<O, E>) -> f32 {
        sensor.trigger.set_level(Level::Low);
        self.delay.delay_us(SETTLE_US);
        sensor.trigger.set_level(Level::High);
        self.delay.delay_us(TRIGGER_PULSE_US);
        sensor.trigger.set_level(Level::Low);

        match sensor.echo.pulse_in(self.echo_timeout) {
            Some(width) if !width.is_zero() => {
                (width.as_secs_f64() * 1e6) as f32 * self.cm_per_us
            }
            _ => NO_ECHO_CM,
        }
    }

    pub fn pause(&mut self, gap: Duration) {
        self.delay.delay_us(gap.as_micros() as u64);
    }
}
