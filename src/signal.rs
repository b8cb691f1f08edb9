//! Synthetic angle sources used to exercise downstream consumers. A
//! generator only proposes candidates; whether a candidate is sent is up to
//! the [`RateGovernedEmitter`](crate::emitter::RateGovernedEmitter).

use crate::emitter::ChannelKey;
use crate::tp2::{MAX_ANGLE, MIN_ANGLE};

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use std::{collections::HashMap, f64::consts::PI, fmt, str::FromStr, time::Duration};

/// Peak of the uniform jitter added to every sine sample.
pub const SINE_JITTER: f64 = 2.0;

/// Which waveform a transmission session produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalMode {
    /// A jittered sine, one random shape per channel
    Sine,
    /// One random value per channel, held for the whole session
    Constant,
    /// A fresh uniform value on every sample
    Noise,
}

impl fmt::Display for SignalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalMode::Sine => write!(f, "sine"),
            SignalMode::Constant => write!(f, "constant"),
            SignalMode::Noise => write!(f, "noise"),
        }
    }
}

impl FromStr for SignalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sine" => Ok(SignalMode::Sine),
            "constant" | "const" => Ok(SignalMode::Constant),
            "noise" | "random" => Ok(SignalMode::Noise),
            other => Err(format!("unknown signal mode {other:?}")),
        }
    }
}

/// Shape of one channel's sine, drawn once per transmission session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SineParams {
    /// Peak deviation from `offset`, in degrees
    pub amplitude: f64,
    /// Length of one cycle
    pub period_secs: f64,
    /// Starting point of the cycle
    pub phase_radians: f64,
    /// Centre of the oscillation, in degrees
    pub offset: f64,
}

impl SineParams {
    /// Draws a shape that stays mostly inside the angle range.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            amplitude: rng.gen_range(20.0..120.0),
            period_secs: rng.gen_range(2.0..10.0),
            phase_radians: rng.gen_range(0.0..2.0 * PI),
            offset: rng.gen_range(-30.0..30.0),
        }
    }

    /// The sample at `t` seconds, with `jitter` added before clamping.
    pub fn at(&self, t: f64, jitter: f64) -> i32 {
        let raw = self.amplitude * (2.0 * PI * t / self.period_secs + self.phase_radians).sin()
            + self.offset
            + jitter;
        clamp_angle(raw)
    }
}

/// Clamps to the TP2 angle range and truncates toward zero.
pub fn clamp_angle(value: f64) -> i32 {
    value.clamp(MIN_ANGLE as f64, MAX_ANGLE as f64) as i32
}

/// Produces candidate values for a set of channels in one mode.
#[derive(Debug)]
pub struct SignalGenerator<R: Rng> {
    mode: SignalMode,
    rng: R,
    sines: HashMap<ChannelKey, SineParams>,
    constants: HashMap<ChannelKey, i32>,
}

impl<R: Rng> SignalGenerator<R> {
    /// Draws the per-channel parameters for `channels` up front.
    pub fn new(mode: SignalMode, channels: impl IntoIterator<Item = ChannelKey>, rng: R) -> Self {
        let mut generator = Self {
            mode,
            rng,
            sines: HashMap::new(),
            constants: HashMap::new(),
        };
        for key in channels {
            generator.prepare(key);
        }
        generator
    }

    /// Waveform this generator produces.
    pub fn mode(&self) -> SignalMode {
        self.mode
    }

    fn prepare(&mut self, key: ChannelKey) {
        let rng = &mut self.rng;
        match self.mode {
            SignalMode::Sine => {
                self.sines.entry(key).or_insert_with(|| SineParams::random(rng));
            }
            SignalMode::Constant => {
                self.constants.entry(key).or_insert_with(|| rng.gen_range(-90..=90));
            }
            SignalMode::Noise => {}
        }
    }

    /// The shape of `key`'s sine, if this is a sine generator.
    pub fn sine_params(&self, key: ChannelKey) -> Option<&SineParams> {
        self.sines.get(&key)
    }

    /// A candidate for `key`, `elapsed` after the session started.
    pub fn sample(&mut self, key: ChannelKey, elapsed: Duration) -> i32 {
        self.prepare(key);
        match self.mode {
            SignalMode::Sine => {
                let jitter = self.rng.gen_range(-SINE_JITTER..=SINE_JITTER);
                self.sines[&key].at(elapsed.as_secs_f64(), jitter)
            }
            SignalMode::Constant => self.constants[&key],
            SignalMode::Noise => self.rng.gen_range(MIN_ANGLE..=MAX_ANGLE),
        }
    }
}
