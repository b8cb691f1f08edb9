//! The transmit worker's jobs.
//!
//! A job runs on the session's transmit thread until its [`CancelToken`] is
//! cancelled or a send is rejected. It never writes to the channel itself;
//! every frame goes through the session's [`CommandSender`].

use crate::cancel::CancelToken;
use crate::emitter::{Decision, RateGovernedEmitter, RatePolicy, RoundRobin};
use crate::error::SessionError;
use crate::frame_codec::{CanFrame, Command};
use crate::session::{CommandSender, EventSink, SessionEvent};
use crate::signal::{SignalGenerator, SignalMode};
use crate::tp2::{self, AngleMagnitude, GroupId};

use log::{debug, info};
use rand::{rngs::StdRng, SeedableRng};

use std::time::{Duration, Instant};

/// Delay between two synthetic ticks.
pub const DEFAULT_TICK: Duration = Duration::from_millis(20);

/// Repeats are never sent faster than this.
pub const MIN_REPEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Synthetic signals on a set of channels, gated by a [`RatePolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticPlan {
    /// Waveform
    pub mode: SignalMode,
    /// Magnitudes to drive, per group
    pub selection: Vec<(GroupId, Vec<AngleMagnitude>)>,
    /// Gate applied to every candidate
    pub policy: RatePolicy,
    /// Delay between round-robin ticks
    pub tick: Duration,
    /// Seed for the signal parameters, drawn from entropy when unset
    pub seed: Option<u64>,
}

impl SyntheticPlan {
    /// A plan with the default tick, using the faster single-channel
    /// policy when only one group is selected.
    pub fn new(mode: SignalMode, selection: Vec<(GroupId, Vec<AngleMagnitude>)>) -> Self {
        let policy = if selection.len() == 1 {
            RatePolicy::single_channel()
        } else {
            RatePolicy::multi_channel()
        };
        Self {
            mode,
            selection,
            policy,
            tick: DEFAULT_TICK,
            seed: None,
        }
    }
}

/// What the transmit worker does.
#[derive(Debug, Clone, PartialEq)]
pub enum TransmitJob {
    /// Rate-governed synthetic angles
    Synthetic(SyntheticPlan),
    /// The same frame over and over
    Repeat {
        /// Frame to send
        frame: CanFrame,
        /// Delay between two sends, at least [MIN_REPEAT_INTERVAL]
        interval: Duration,
    },
}

impl TransmitJob {
    /// A repeat job, with `interval` raised to [`MIN_REPEAT_INTERVAL`].
    pub fn repeat(frame: CanFrame, interval: Duration) -> Self {
        TransmitJob::Repeat {
            frame,
            interval: interval.max(MIN_REPEAT_INTERVAL),
        }
    }
}

/// Runs `job` until `cancel` fires or a send fails.
pub fn run(
    job: TransmitJob,
    sender: &CommandSender,
    events: &EventSink,
    cancel: &CancelToken,
) -> Result<(), SessionError> {
    match job {
        TransmitJob::Synthetic(plan) => run_synthetic(plan, sender, events, cancel),
        TransmitJob::Repeat { frame, interval } => run_repeat(&frame, interval, sender, cancel),
    }
}

fn run_synthetic(
    plan: SyntheticPlan,
    sender: &CommandSender,
    events: &EventSink,
    cancel: &CancelToken,
) -> Result<(), SessionError> {
    let mut schedule = RoundRobin::new(plan.selection);
    if schedule.is_empty() {
        info!("Nothing selected, not transmitting");
        return Ok(());
    }

    let rng = match plan.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let channels: Vec<_> = schedule.channels().collect();
    let mut signal = SignalGenerator::new(plan.mode, channels.iter().copied(), rng);
    let mut emitter = RateGovernedEmitter::new(plan.policy);

    info!("Transmitting {} on {} channels", plan.mode, channels.len());
    let started = Instant::now();

    while !cancel.is_cancelled() {
        for key in schedule.tick() {
            let now = Instant::now();
            let candidate = signal.sample(key, now.duration_since(started));
            match emitter.consider(key, candidate, now) {
                Decision::Emit(trigger) => {
                    let (group, magnitude) = key;
                    sender.send_frame(tp2::angle_frame(group, magnitude, candidate)?)?;
                    debug!("Group {group} {magnitude} = {candidate} ({trigger})");
                    events.notify(SessionEvent::Emitted {
                        key,
                        value: candidate,
                        trigger,
                    });
                }
                Decision::Suppress(_) => {}
            }
        }
        spin_sleep::sleep(plan.tick);
    }
    info!("Transmission stopped");
    Ok(())
}

fn run_repeat(
    frame: &CanFrame,
    interval: Duration,
    sender: &CommandSender,
    cancel: &CancelToken,
) -> Result<(), SessionError> {
    info!("Repeating {} every {interval:?}", Command::Send(frame.clone()));
    while !cancel.is_cancelled() {
        sender.send_frame(frame.clone())?;
        if !cancel.sleep(interval) {
            break;
        }
    }
    Ok(())
}
