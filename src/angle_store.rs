//! The last known angle of every (group, magnitude) pair.
//!
//! The store is plain state. The session's reader worker is its only writer
//! (through [`AngleStore::apply`] and [`AngleStore::reset`]); everyone else
//! reads a [`GroupRow`] snapshot. Updates are last-write-wins: if the
//! transport ever delivered frames out of order, an older value could
//! overwrite a fresher one. The bridge delivers in order, so this is
//! accepted as a known limitation.

use crate::tp2::{AngleMagnitude, AngleUpdate, GroupId, GROUP_COUNT};

use std::time::{Duration, Instant};

/// Age after which a value is no longer considered current.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(2);

/// Freshness of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// Updated within the freshness window
    Fresh,
    /// Last update is older than the freshness window
    Stale,
    /// Never updated since the last reset
    Never,
}

/// What the store knows about one (group, magnitude) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AngleRecord {
    /// The decoded value text of the most recent report
    pub last_value: Option<String>,
    /// When the most recent report arrived
    pub last_update: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
struct GroupRecord {
    angles: [AngleRecord; 3],
    any: Option<Instant>,
}

/// Per-group, per-magnitude angle state.
#[derive(Debug, Clone)]
pub struct AngleStore {
    groups: [GroupRecord; GROUP_COUNT],
    stale_after: Duration,
}

impl Default for AngleStore {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl AngleStore {
    /// An empty store with the given freshness window.
    pub fn new(stale_after: Duration) -> Self {
        Self {
            groups: Default::default(),
            stale_after,
        }
    }

    /// Records `update`. No ordering check is made against what is
    /// already stored.
    pub fn apply(&mut self, update: &AngleUpdate) {
        let group = &mut self.groups[update.group.index()];
        group.angles[update.magnitude.index()] = AngleRecord {
            last_value: Some(update.value.clone()),
            last_update: Some(update.observed_at),
        };
        group.any = Some(update.observed_at);
    }

    /// Forgets everything, for all groups.
    pub fn reset(&mut self) {
        self.groups = Default::default();
    }

    /// Last value and arrival time of one angle.
    pub fn record(&self, group: GroupId, magnitude: AngleMagnitude) -> &AngleRecord {
        &self.groups[group.index()].angles[magnitude.index()]
    }

    /// When any magnitude of `group` was last updated.
    pub fn last_any(&self, group: GroupId) -> Option<Instant> {
        self.groups[group.index()].any
    }

    fn classify(&self, last_update: Option<Instant>, now: Instant) -> Staleness {
        match last_update {
            None => Staleness::Never,
            Some(t) if now.saturating_duration_since(t) > self.stale_after => Staleness::Stale,
            Some(_) => Staleness::Fresh,
        }
    }

    /// Freshness of one angle at `now`.
    pub fn staleness(&self, group: GroupId, magnitude: AngleMagnitude, now: Instant) -> Staleness {
        self.classify(self.record(group, magnitude).last_update, now)
    }

    /// A group is stale only when none of its three magnitudes is fresh,
    /// and `Never` when none of them was ever updated.
    pub fn group_staleness(&self, group: GroupId, now: Instant) -> Staleness {
        combine(AngleMagnitude::ALL.map(|m| self.staleness(group, m, now)))
    }

    /// An owned view of all 8 groups as of `now`.
    pub fn snapshot(&self, now: Instant) -> Vec<GroupRow> {
        GroupId::all()
            .map(|group| {
                let cells = AngleMagnitude::ALL.map(|magnitude| {
                    let record = self.record(group, magnitude);
                    AngleCell {
                        magnitude,
                        value: record.last_value.clone(),
                        elapsed: record.last_update.map(|t| now.saturating_duration_since(t)),
                        staleness: self.classify(record.last_update, now),
                    }
                });
                GroupRow {
                    group,
                    staleness: combine(cells.clone().map(|c| c.staleness)),
                    since_any: self.last_any(group).map(|t| now.saturating_duration_since(t)),
                    cells,
                }
            })
            .collect()
    }
}

fn combine(states: [Staleness; 3]) -> Staleness {
    if states.iter().all(|s| *s == Staleness::Never) {
        Staleness::Never
    } else if states.iter().any(|s| *s == Staleness::Fresh) {
        Staleness::Fresh
    } else {
        Staleness::Stale
    }
}

/// One magnitude of a [`GroupRow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AngleCell {
    /// Which angle
    pub magnitude: AngleMagnitude,
    /// Last received text, if any
    pub value: Option<String>,
    /// Time since the last update
    pub elapsed: Option<Duration>,
    /// Fresh, stale or never seen
    pub staleness: Staleness,
}

impl AngleCell {
    /// `elapsed` formatted for display, or `never`.
    pub fn elapsed_text(&self) -> String {
        self.elapsed
            .map(human_elapsed)
            .unwrap_or_else(|| "never".to_owned())
    }
}

/// Snapshot of one group, as shown in the operator's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRow {
    /// Which group
    pub group: GroupId,
    /// Roll, Pitch, Orientation
    pub cells: [AngleCell; 3],
    /// Time since any magnitude of the group was updated
    pub since_any: Option<Duration>,
    /// Aggregate freshness, see [`AngleStore::group_staleness`]
    pub staleness: Staleness,
}

/// Formats an elapsed time as `Ns`, `Nm Ss` or `Nh Nm`, truncating.
pub fn human_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(group: u8, magnitude: AngleMagnitude, value: &str, at: Instant) -> AngleUpdate {
        AngleUpdate {
            group: GroupId::new(group).unwrap(),
            magnitude,
            value: value.to_owned(),
            observed_at: at,
        }
    }

    #[test]
    fn apply_and_read_back() {
        let t0 = Instant::now();
        let mut store = AngleStore::default();
        let g0 = GroupId::new(0).unwrap();

        assert_eq!(store.staleness(g0, AngleMagnitude::Roll, t0), Staleness::Never);
        store.apply(&update(0, AngleMagnitude::Roll, "-34", t0));

        let record = store.record(g0, AngleMagnitude::Roll);
        assert_eq!(record.last_value.as_deref(), Some("-34"));
        assert_eq!(record.last_update, Some(t0));
        assert_eq!(store.last_any(g0), Some(t0));
        assert_eq!(store.staleness(g0, AngleMagnitude::Roll, t0), Staleness::Fresh);
        assert_eq!(store.staleness(g0, AngleMagnitude::Pitch, t0), Staleness::Never);
    }

    #[test]
    fn staleness_window() {
        let t0 = Instant::now();
        let mut store = AngleStore::default();
        let g1 = GroupId::new(1).unwrap();
        store.apply(&update(1, AngleMagnitude::Pitch, "12", t0));

        let at = |ms| t0 + Duration::from_millis(ms);
        assert_eq!(store.staleness(g1, AngleMagnitude::Pitch, at(2000)), Staleness::Fresh);
        assert_eq!(store.staleness(g1, AngleMagnitude::Pitch, at(2001)), Staleness::Stale);
    }

    #[test]
    fn group_is_fresh_while_one_magnitude_is() {
        let t0 = Instant::now();
        let mut store = AngleStore::default();
        let g2 = GroupId::new(2).unwrap();
        store.apply(&update(2, AngleMagnitude::Roll, "5", t0));

        let one_second_later = t0 + Duration::from_secs(1);
        assert_eq!(store.group_staleness(g2, one_second_later), Staleness::Fresh);

        store.apply(&update(2, AngleMagnitude::Orientation, "9", t0));
        assert_eq!(
            store.group_staleness(g2, t0 + Duration::from_secs(3)),
            Staleness::Stale
        );
        assert_eq!(
            store.group_staleness(GroupId::new(3).unwrap(), t0),
            Staleness::Never
        );
    }

    #[test]
    fn last_write_wins() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let mut store = AngleStore::default();
        let g4 = GroupId::new(4).unwrap();

        store.apply(&update(4, AngleMagnitude::Roll, "10", t1));
        store.apply(&update(4, AngleMagnitude::Roll, "20", t0));

        let record = store.record(g4, AngleMagnitude::Roll);
        assert_eq!(record.last_value.as_deref(), Some("20"));
        assert_eq!(record.last_update, Some(t0));
    }

    #[test]
    fn reset_clears_everything() {
        let t0 = Instant::now();
        let mut store = AngleStore::default();
        for g in 0..8 {
            store.apply(&update(g, AngleMagnitude::Pitch, "1", t0));
        }
        store.reset();
        for row in store.snapshot(t0) {
            assert_eq!(row.staleness, Staleness::Never);
            assert_eq!(row.since_any, None);
            assert!(row.cells.iter().all(|c| c.value.is_none()));
        }
    }

    #[test]
    fn snapshot_rows() {
        let t0 = Instant::now();
        let mut store = AngleStore::default();
        store.apply(&update(6, AngleMagnitude::Orientation, "67", t0));

        let rows = store.snapshot(t0 + Duration::from_secs(75));
        assert_eq!(rows.len(), GROUP_COUNT);

        let row = &rows[6];
        assert_eq!(row.group.index(), 6);
        assert_eq!(row.staleness, Staleness::Stale);
        let cell = &row.cells[AngleMagnitude::Orientation.index()];
        assert_eq!(cell.value.as_deref(), Some("67"));
        assert_eq!(cell.elapsed_text(), "1m 15s");
        assert_eq!(row.cells[0].elapsed_text(), "never");
    }

    #[test]
    fn elapsed_formatting_truncates() {
        assert_eq!(human_elapsed(Duration::from_millis(59_999)), "59s");
        assert_eq!(human_elapsed(Duration::from_secs(60)), "1m 0s");
        assert_eq!(human_elapsed(Duration::from_secs(3599)), "59m 59s");
        assert_eq!(human_elapsed(Duration::from_secs(3600)), "1h 0m");
        assert_eq!(human_elapsed(Duration::from_secs(7322)), "2h 2m");
    }
}
