//! Decides when a synthetic angle is worth putting on the bus.
//!
//! Every (group, magnitude) channel keeps the value and time of its last
//! transmission. A new candidate is sent when it moved far enough from the
//! last sent value or when the last transmission is getting old, but never
//! faster than the per-channel floor and never beyond the global budget.
//! Candidates that are not sent are dropped, not queued.

use crate::tp2::{AngleMagnitude, GroupId};

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fmt,
    time::{Duration, Instant},
};

/// A single transmitted channel.
pub type ChannelKey = (GroupId, AngleMagnitude);

const BUDGET_WINDOW: Duration = Duration::from_secs(1);

/// The knobs of the change / timeout / rate-cap policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    /// Minimum change from the last sent value that triggers a send
    pub change_threshold: u32,
    /// Age of the last send that triggers a refresh
    pub max_staleness: Duration,
    /// Per-channel floor between two sends
    pub min_interval: Duration,
    /// Emissions allowed across all channels in any one second
    pub max_sends_per_second: Option<u32>,
}

impl RatePolicy {
    /// Floor used when several channels transmit at once.
    pub const MULTI_CHANNEL_MIN_INTERVAL: Duration = Duration::from_millis(500);
    /// Floor used when a single group is driven.
    pub const SINGLE_CHANNEL_MIN_INTERVAL: Duration = Duration::from_millis(250);

    /// The stricter policy, for many concurrent channels.
    pub fn multi_channel() -> Self {
        Self {
            change_threshold: 5,
            max_staleness: Duration::from_secs(2),
            min_interval: Self::MULTI_CHANNEL_MIN_INTERVAL,
            max_sends_per_second: Some(20),
        }
    }

    /// The faster policy, for one group.
    pub fn single_channel() -> Self {
        Self {
            min_interval: Self::SINGLE_CHANNEL_MIN_INTERVAL,
            ..Self::multi_channel()
        }
    }
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self::multi_channel()
    }
}

/// Why a candidate was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Nothing was sent on this channel yet
    FirstSample,
    /// The value moved by at least the change threshold
    Change,
    /// The last send is older than the staleness limit
    Timeout,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::FirstSample => write!(f, "first"),
            Trigger::Change => write!(f, "change"),
            Trigger::Timeout => write!(f, "timeout"),
        }
    }
}

/// Why a candidate was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// Neither the change rule nor the timeout rule fired
    NoTrigger,
    /// A rule fired but the channel sent too recently
    RateCap,
    /// A rule fired but the global budget is spent
    GlobalBudget,
}

/// Outcome of [`RateGovernedEmitter::consider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Transmit now
    Emit(Trigger),
    /// Drop the candidate
    Suppress(Suppression),
}

impl Decision {
    /// True for [`Decision::Emit`].
    pub fn is_emit(&self) -> bool {
        matches!(self, Decision::Emit(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct EmitterState {
    last_sent_value: i32,
    last_sent_at: Instant,
}

/// Per-channel send bookkeeping for one transmission session.
#[derive(Debug, Clone)]
pub struct RateGovernedEmitter {
    policy: RatePolicy,
    channels: HashMap<ChannelKey, EmitterState>,
    recent: VecDeque<Instant>,
}

impl RateGovernedEmitter {
    /// An emitter with no send history.
    pub fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            channels: HashMap::new(),
            recent: VecDeque::new(),
        }
    }

    /// The policy this emitter enforces.
    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    /// Pretends `value` was sent on `key` at `at`.
    pub fn prime(&mut self, key: ChannelKey, value: i32, at: Instant) {
        self.channels.insert(
            key,
            EmitterState {
                last_sent_value: value,
                last_sent_at: at,
            },
        );
    }

    /// Value and time of the last send on `key`.
    pub fn last_sent(&self, key: ChannelKey) -> Option<(i32, Instant)> {
        self.channels
            .get(&key)
            .map(|s| (s.last_sent_value, s.last_sent_at))
    }

    /// Evaluates `candidate` for `key` at `now`. On [`Decision::Emit`] the
    /// caller is expected to transmit, the channel state has already been
    /// updated. On suppression nothing changes.
    pub fn consider(&mut self, key: ChannelKey, candidate: i32, now: Instant) -> Decision {
        let trigger = match self.channels.get(&key) {
            None => Trigger::FirstSample,
            Some(state) => {
                let since = now.saturating_duration_since(state.last_sent_at);
                let trigger = if candidate.abs_diff(state.last_sent_value) >= self.policy.change_threshold {
                    Trigger::Change
                } else if since >= self.policy.max_staleness {
                    Trigger::Timeout
                } else {
                    return Decision::Suppress(Suppression::NoTrigger);
                };
                if since < self.policy.min_interval {
                    return Decision::Suppress(Suppression::RateCap);
                }
                trigger
            }
        };

        if !self.budget_allows(now) {
            return Decision::Suppress(Suppression::GlobalBudget);
        }

        self.prime(key, candidate, now);
        self.recent.push_back(now);
        Decision::Emit(trigger)
    }

    fn budget_allows(&mut self, now: Instant) -> bool {
        let Some(max) = self.policy.max_sends_per_second else {
            return true;
        };
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) >= BUDGET_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.len() < max as usize
    }
}

/// Visits the selected channels so that each tick checks exactly one
/// magnitude per group, cycling through each group's magnitudes on
/// successive ticks.
///
/// The group checked first moves up by one on every tick. When the global
/// budget is nearly spent the first group of a tick gets the free slot, so a
/// fixed order would starve the high groups.
#[derive(Debug, Clone)]
pub struct RoundRobin {
    lanes: Vec<Lane>,
    start: usize,
}

#[derive(Debug, Clone)]
struct Lane {
    group: GroupId,
    magnitudes: Vec<AngleMagnitude>,
    cursor: usize,
}

impl RoundRobin {
    /// Groups with no magnitude selected are dropped, duplicates merged.
    pub fn new<I, M>(selection: I) -> Self
    where
        I: IntoIterator<Item = (GroupId, M)>,
        M: IntoIterator<Item = AngleMagnitude>,
    {
        let mut merged: BTreeMap<GroupId, BTreeSet<AngleMagnitude>> = BTreeMap::new();
        for (group, magnitudes) in selection {
            merged.entry(group).or_default().extend(magnitudes);
        }

        let lanes = merged
            .into_iter()
            .filter(|(_, m)| !m.is_empty())
            .map(|(group, magnitudes)| Lane {
                group,
                magnitudes: magnitudes.into_iter().collect(),
                cursor: 0,
            })
            .collect();
        Self { lanes, start: 0 }
    }

    /// True when no group has a magnitude selected.
    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Every selected channel.
    pub fn channels(&self) -> impl Iterator<Item = ChannelKey> + '_ {
        self.lanes
            .iter()
            .flat_map(|lane| lane.magnitudes.iter().map(move |m| (lane.group, *m)))
    }

    /// The channels to check on this tick, one per group, starting one
    /// group further along than the previous tick.
    pub fn tick(&mut self) -> Vec<ChannelKey> {
        if self.lanes.is_empty() {
            return Vec::new();
        }

        let (head, tail) = self.lanes.split_at_mut(self.start);
        let keys = tail
            .iter_mut()
            .chain(head.iter_mut())
            .map(|lane| {
                let magnitude = lane.magnitudes[lane.cursor];
                lane.cursor = (lane.cursor + 1) % lane.magnitudes.len();
                (lane.group, magnitude)
            })
            .collect();
        self.start = (self.start + 1) % self.lanes.len();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(group: u8, magnitude: AngleMagnitude) -> ChannelKey {
        (GroupId::new(group).unwrap(), magnitude)
    }

    fn ms(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn rate_cap_holds_back_a_change() {
        let t0 = Instant::now();
        let k = key(0, AngleMagnitude::Roll);
        let mut emitter = RateGovernedEmitter::new(RatePolicy::multi_channel());
        emitter.prime(k, 0, t0);

        assert_eq!(
            emitter.consider(k, 10, ms(t0, 100)),
            Decision::Suppress(Suppression::RateCap)
        );
        assert_eq!(emitter.last_sent(k), Some((0, t0)));

        assert_eq!(emitter.consider(k, 10, ms(t0, 600)), Decision::Emit(Trigger::Change));
        assert_eq!(emitter.last_sent(k), Some((10, ms(t0, 600))));
    }

    #[test]
    fn timeout_refreshes_an_unchanged_value() {
        let t0 = Instant::now();
        let k = key(1, AngleMagnitude::Pitch);
        let mut emitter = RateGovernedEmitter::new(RatePolicy::multi_channel());
        emitter.prime(k, 42, t0);

        assert_eq!(
            emitter.consider(k, 42, ms(t0, 1900)),
            Decision::Suppress(Suppression::NoTrigger)
        );
        assert_eq!(emitter.consider(k, 42, ms(t0, 2100)), Decision::Emit(Trigger::Timeout));
    }

    #[test]
    fn small_changes_do_not_trigger() {
        let t0 = Instant::now();
        let k = key(2, AngleMagnitude::Orientation);
        let mut emitter = RateGovernedEmitter::new(RatePolicy::multi_channel());
        emitter.prime(k, -10, t0);

        assert_eq!(
            emitter.consider(k, -6, ms(t0, 1000)),
            Decision::Suppress(Suppression::NoTrigger)
        );
        assert_eq!(emitter.consider(k, -15, ms(t0, 1000)), Decision::Emit(Trigger::Change));
    }

    #[test]
    fn first_sample_goes_out_immediately() {
        let t0 = Instant::now();
        let mut emitter = RateGovernedEmitter::new(RatePolicy::single_channel());
        let k = key(3, AngleMagnitude::Roll);
        assert_eq!(emitter.consider(k, 7, t0), Decision::Emit(Trigger::FirstSample));
        assert_eq!(
            emitter.consider(k, 70, ms(t0, 200)),
            Decision::Suppress(Suppression::RateCap)
        );
        assert!(emitter.consider(k, 70, ms(t0, 250)).is_emit());
    }

    #[test]
    fn channels_are_independent() {
        let t0 = Instant::now();
        let mut emitter = RateGovernedEmitter::new(RatePolicy::multi_channel());
        let roll = key(0, AngleMagnitude::Roll);
        let pitch = key(0, AngleMagnitude::Pitch);

        assert!(emitter.consider(roll, 0, t0).is_emit());
        assert!(emitter.consider(pitch, 0, ms(t0, 10)).is_emit());
        assert_eq!(
            emitter.consider(roll, 50, ms(t0, 20)),
            Decision::Suppress(Suppression::RateCap)
        );
    }

    #[test]
    fn global_budget_caps_all_channels() {
        let t0 = Instant::now();
        let policy = RatePolicy {
            max_sends_per_second: Some(3),
            ..RatePolicy::multi_channel()
        };
        let mut emitter = RateGovernedEmitter::new(policy);

        for g in 0..3 {
            assert!(emitter.consider(key(g, AngleMagnitude::Roll), 0, ms(t0, g as u64)).is_emit());
        }
        assert_eq!(
            emitter.consider(key(3, AngleMagnitude::Roll), 0, ms(t0, 10)),
            Decision::Suppress(Suppression::GlobalBudget)
        );
        assert_eq!(emitter.last_sent(key(3, AngleMagnitude::Roll)), None);
        assert!(emitter.consider(key(3, AngleMagnitude::Roll), 0, ms(t0, 1000)).is_emit());
    }

    #[test]
    fn round_robin_one_magnitude_per_group_per_tick() {
        let g = |n| GroupId::new(n).unwrap();
        let mut rr = RoundRobin::new(vec![
            (g(4), vec![AngleMagnitude::Roll]),
            (g(1), vec![AngleMagnitude::Orientation, AngleMagnitude::Roll]),
            (g(6), vec![]),
        ]);

        assert_eq!(rr.channels().count(), 3);
        assert_eq!(
            rr.tick(),
            vec![(g(1), AngleMagnitude::Roll), (g(4), AngleMagnitude::Roll)]
        );
        assert_eq!(
            rr.tick(),
            vec![(g(4), AngleMagnitude::Roll), (g(1), AngleMagnitude::Orientation)]
        );
        assert_eq!(
            rr.tick(),
            vec![(g(1), AngleMagnitude::Roll), (g(4), AngleMagnitude::Roll)]
        );
    }

    #[test]
    fn round_robin_rotates_the_first_group() {
        let mut rr = RoundRobin::new(GroupId::all().map(|g| (g, vec![AngleMagnitude::Roll])));
        let firsts: Vec<u8> = (0..10).map(|_| rr.tick()[0].0.into()).collect();
        assert_eq!(firsts, vec![0, 1, 2, 3, 4, 5, 6, 7, 0, 1]);
    }

    #[test]
    fn global_budget_is_shared_fairly_between_groups() {
        use crate::signal::{SignalGenerator, SignalMode};
        use rand::{rngs::StdRng, SeedableRng};

        for mode in [SignalMode::Sine, SignalMode::Noise] {
            let t0 = Instant::now();
            let mut rr = RoundRobin::new(GroupId::all().map(|g| (g, AngleMagnitude::ALL.to_vec())));
            let mut emitter = RateGovernedEmitter::new(RatePolicy::multi_channel());
            let mut signal = SignalGenerator::new(mode, rr.channels(), StdRng::seed_from_u64(7));
            let mut per_group = [0u32; 8];

            for tick in 0..500u64 {
                let now = ms(t0, tick * 20);
                let elapsed = now - t0;
                for key in rr.tick() {
                    let candidate = signal.sample(key, elapsed);
                    if emitter.consider(key, candidate, now).is_emit() {
                        per_group[key.0.index()] += 1;
                    }
                }
            }

            let most = *per_group.iter().max().unwrap();
            let least = *per_group.iter().min().unwrap();
            assert!(per_group.iter().sum::<u32>() <= 20 * 10 + 20, "{mode:?} {per_group:?}");
            assert!(least * 10 >= most * 6, "{mode:?} {per_group:?}");
        }
    }

    #[test]
    fn empty_selection() {
        let mut rr = RoundRobin::new(Vec::<(GroupId, Vec<AngleMagnitude>)>::new());
        assert!(rr.is_empty());
        assert!(rr.tick().is_empty());
    }
}
