//! Poll scheduling: tier cadences, dependency closure and range batching.

use std::collections::{BTreeSet, HashSet};

use strum::{EnumCount, IntoEnumIterator};

use crate::catalog::{ActiveCatalog, Tier};
use crate::metrics::DERIVED_METRICS;
use crate::value::{Duration, Instant};

/// Modbus FC03 allows at most 125 registers per request.
pub const MODBUS_MAX_READ_WORDS: u16 = 125;

/// Per-tier refresh intervals, clamped to the 1 s..1 h window the device
/// setup allows.
#[derive(Debug, Clone, Copy)]
pub struct TierIntervals([Duration; Tier::COUNT]);

impl TierIntervals {
    pub fn defaults() -> Self {
        let mut intervals = [Duration::secs(0); Tier::COUNT];
        for tier in Tier::iter() {
            intervals[tier as usize] = tier.default_interval();
        }
        Self(intervals)
    }

    pub fn set(&mut self, tier: Tier, interval: Duration) {
        let clamped = interval
            .max(Duration::secs(1))
            .min(Duration::secs(3600));
        self.0[tier as usize] = clamped;
    }

    pub fn get(&self, tier: Tier) -> Duration {
        self.0[tier as usize]
    }
}

impl Default for TierIntervals {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Which logical names currently have an active consumer. Dependency-flagged
/// registers and derived-metric inputs are polled regardless; this set only
/// gates everything else.
#[derive(Debug, Clone)]
pub struct ConsumerSet {
    all: bool,
    names: HashSet<String>,
}

impl ConsumerSet {
    /// Every consumer active. Individual `disable` calls have no effect in
    /// this state; start from `none` to track an explicit set.
    pub fn all() -> Self {
        Self {
            all: true,
            names: HashSet::new(),
        }
    }

    pub fn none() -> Self {
        Self {
            all: false,
            names: HashSet::new(),
        }
    }

    pub fn enable(&mut self, name: &str) {
        self.names.insert(name.to_owned());
    }

    pub fn disable(&mut self, name: &str) {
        self.names.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.all || self.names.contains(name)
    }
}

/// An address-contiguous run satisfiable by one range read. `members` are
/// catalog indices; words read for coalescing holes are discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollGroup {
    pub start: u16,
    pub count: u16,
    pub members: Vec<usize>,
}

impl PollGroup {
    pub fn end(&self) -> u16 {
        self.start + self.count
    }
}

/// Decides, per external tick, which register ranges to read.
pub struct Scheduler {
    intervals: TierIntervals,
    last_poll: [Option<Instant>; Tier::COUNT],
    coalesce_gap: u16,
    max_batch: u16,
}

impl Scheduler {
    pub fn new(intervals: TierIntervals, coalesce_gap: u16, max_batch: u16) -> Self {
        Self {
            intervals,
            last_poll: [None; Tier::COUNT],
            coalesce_gap,
            max_batch: max_batch.min(MODBUS_MAX_READ_WORDS),
        }
    }

    pub fn intervals(&self) -> &TierIntervals {
        &self.intervals
    }

    pub fn set_interval(&mut self, tier: Tier, interval: Duration) {
        self.intervals.set(tier, interval);
    }

    /// A tier is due when it has never been polled or its interval elapsed
    /// since the last fully successful poll.
    pub fn due_tiers(&self, now: Instant) -> [bool; Tier::COUNT] {
        let mut due = [false; Tier::COUNT];
        for tier in Tier::iter() {
            let i = tier as usize;
            due[i] = match self.last_poll[i] {
                None => true,
                Some(last) => now
                    .checked_duration_since(last)
                    .is_some_and(|d| d >= self.intervals.get(tier)),
            };
        }
        due
    }

    /// Record a fully successful poll of `tier`. A tier whose members failed
    /// stays due, so retry happens on the next natural tick.
    pub fn mark_polled(&mut self, tier: Tier, now: Instant) {
        self.last_poll[tier as usize] = Some(now);
    }

    /// Compute the poll groups for this tick.
    ///
    /// A register is selected when its tier is due and it either has an
    /// active consumer or carries the dependency flag. On top of that, every
    /// input of an active derived metric is selected as soon as any one of
    /// the metric's input tiers is due, so the whole input set refreshes at
    /// its fastest member cadence.
    pub fn select(
        &self,
        catalog: &ActiveCatalog,
        active: &ConsumerSet,
        now: Instant,
    ) -> Vec<PollGroup> {
        let due = self.due_tiers(now);

        let mut picked: BTreeSet<usize> = BTreeSet::new();
        for (i, reg) in catalog.iter().enumerate() {
            if !reg.def.access.readable() || !due[reg.def.tier as usize] {
                continue;
            }
            if active.contains(reg.name()) || reg.def.dependency {
                picked.insert(i);
            }
        }

        for metric in DERIVED_METRICS.iter().filter(|m| active.contains(m.name)) {
            let inputs: Vec<usize> = metric
                .inputs
                .iter()
                .filter_map(|n| catalog.index_of(n))
                .filter(|&i| catalog.by_index(i).def.access.readable())
                .collect();
            if inputs
                .iter()
                .any(|&i| due[catalog.by_index(i).def.tier as usize])
            {
                picked.extend(inputs);
            }
        }

        self.batch(catalog, &picked)
    }

    /// Merge selected registers into range reads. Runs are extended across
    /// holes strictly smaller than `coalesce_gap` words; readable registers
    /// sitting in a bridged hole ride along as members, which is how a
    /// slow-tier register inside a fast tier's address range ends up
    /// refreshed at the fast cadence. A lone register wider than `max_batch`
    /// is still read whole; the cap only limits merging.
    fn batch(&self, catalog: &ActiveCatalog, picked: &BTreeSet<usize>) -> Vec<PollGroup> {
        let mut groups: Vec<PollGroup> = Vec::new();
        let mut cur: Option<PollGroup> = None;
        let mut fillers: Vec<usize> = Vec::new();

        for (i, reg) in catalog.iter().enumerate() {
            if !reg.def.access.readable() {
                continue;
            }
            if !picked.contains(&i) {
                if cur.is_some() {
                    fillers.push(i);
                }
                continue;
            }
            let opened = PollGroup {
                start: reg.address,
                count: reg.words(),
                members: vec![i],
            };
            cur = match cur.take() {
                None => Some(opened),
                Some(mut group) => {
                    let end = group.end();
                    let gap = reg.address - end;
                    let span = reg.end() - group.start;
                    if gap < self.coalesce_gap && span <= self.max_batch {
                        group.count = reg.end() - group.start;
                        for &f in &fillers {
                            let filler = catalog.by_index(f);
                            if filler.address >= end && filler.end() <= group.end() {
                                group.members.push(f);
                            }
                        }
                        group.members.push(i);
                        Some(group)
                    } else {
                        groups.push(group);
                        Some(opened)
                    }
                }
            };
            fillers.clear();
        }
        if let Some(group) = cur {
            groups.push(group);
        }
        for group in &mut groups {
            group.members.sort_unstable();
        }
        groups
    }
}
