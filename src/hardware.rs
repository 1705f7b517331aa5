//! Pin abstractions and the simulated board

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use anyhow::bail;
use log::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// A digital output such as a trigger line or an indicator LED.
pub trait OutputPin {
    fn set_level(&mut self, level: Level);
}

/// The echo line of an ultrasonic sensor.
pub trait EchoInput {
    /// Block until a high pulse has been seen and return its width, or `None`
    /// if no complete pulse arrives within `timeout`.
    fn pulse_in(&mut self, timeout: Duration) -> Option<Duration>;
}

/// Blocking delays for pulse-level timing.
pub trait Delay {
    fn delay_us(&mut self, us: u64);
}

/// Hands out pins by number. Each pin can be claimed once.
pub trait Board {
    type Output: OutputPin;
    type Echo: EchoInput;
    type Delay: Delay;

    fn output(&mut self, pin: u8) -> anyhow::Result<Self::Output>;
    fn echo(&mut self, pin: u8) -> anyhow::Result<Self::Echo>;
    fn delay(&self) -> Self::Delay;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay_us(&mut self, us: u64) {
        std::thread::sleep(Duration::from_micros(us));
    }
}

/// Board that synthesizes echo pulses from fixed distances.
///
/// Output levels are kept in shared cells so they can be inspected through
/// [`SimBoard::level`] after the pins have been handed out.
pub struct SimBoard {
    cm_per_us: f32,
    echoes: HashMap<u8, f32>,
    outputs: HashMap<u8, Rc<Cell<Level>>>,
    claimed: Vec<u8>,
}

impl SimBoard {
    /// `echoes` maps an echo pin to the distance in front of its sensor.
    pub fn new(cm_per_us: f32, echoes: HashMap<u8, f32>) -> Self {
        SimBoard {
            cm_per_us,
            echoes,
            outputs: HashMap::new(),
            claimed: Vec::new(),
        }
    }

    #[allow(dead_code)]
    pub fn level(&self, pin: u8) -> Option<Level> {
        self.outputs.get(&pin).map(|cell| cell.get())
    }

    fn claim(&mut self, pin: u8) -> anyhow::Result<()> {
        if self.claimed.contains(&pin) {
            bail!("GPIO{} is already in use", pin);
        }
        self.claimed.push(pin);
        Ok(())
    }
}

impl Board for SimBoard {
    type Output = SimOutput;
    type Echo = SimEcho;
    type Delay = StdDelay;

    fn output(&mut self, pin: u8) -> anyhow::Result<SimOutput> {
        self.claim(pin)?;
        let level = Rc::new(Cell::new(Level::Low));
        self.outputs.insert(pin, level.clone());
        Ok(SimOutput { pin, level })
    }

    fn echo(&mut self, pin: u8) -> anyhow::Result<SimEcho> {
        self.claim(pin)?;
        Ok(SimEcho {
            pin,
            cm_per_us: self.cm_per_us,
            distance_cm: self.echoes.get(&pin).copied().unwrap_or(0.0),
        })
    }

    fn delay(&self) -> StdDelay {
        StdDelay
    }
}

pub struct SimOutput {
    pin: u8,
    level: Rc<Cell<Level>>,
}

impl OutputPin for SimOutput {
    fn set_level(&mut self, level: Level) {
        if self.level.replace(level) != level {
            debug!("GPIO{} -> {:?}", self.pin, level);
        }
    }
}

pub struct SimEcho {
    pin: u8,
    cm_per_us: f32,
    distance_cm: f32,
}

impl EchoInput for SimEcho {
    fn pulse_in(&mut self, timeout: Duration) -> Option<Duration> {
        if self.distance_cm <= 0.0 || self.cm_per_us <= 0.0 {
            debug!("GPIO{}: nothing in range", self.pin);
            std::thread::sleep(timeout);
            return None;
        }
        let width = Duration::from_secs_f64(f64::from(self.distance_cm / self.cm_per_us) / 1e6);
        if width > timeout {
            debug!("GPIO{}: echo of {:?} exceeds timeout", self.pin, width);
            std::thread::sleep(timeout);
            return None;
        }
        // the line stays high for the width of the echo
        std::thread::sleep(width);
        Some(width)
    }
}
