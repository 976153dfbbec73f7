//! Slot assignment
//!
//! Turns a [`ScheduleConfig`] plus the set of already-occupied slots into
//! concrete `(platform, time)` assignments. Everything here is pure; the
//! queue persists the result.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{ConfigError, Result};
use crate::schedule::ScheduleConfig;
use crate::types::{Platform, Task};

/// Slots held by non-terminal tasks, per platform.
#[derive(Debug, Clone, Default)]
pub struct Occupancy {
    slots: HashMap<Platform, BTreeSet<DateTime<Utc>>>,
}

impl Occupancy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from tasks, ignoring posted and failed ones.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut occupancy = Self::new();
        for task in tasks {
            if !task.state.is_terminal() {
                occupancy.insert(task.platform, task.scheduled_time);
            }
        }
        occupancy
    }

    pub fn insert(&mut self, platform: Platform, at: DateTime<Utc>) -> bool {
        self.slots.entry(platform).or_default().insert(at)
    }

    pub fn remove(&mut self, platform: Platform, at: DateTime<Utc>) -> bool {
        self.slots
            .get_mut(&platform)
            .map(|set| set.remove(&at))
            .unwrap_or(false)
    }

    pub fn is_taken(&self, platform: Platform, at: DateTime<Utc>) -> bool {
        self.slots
            .get(&platform)
            .map(|set| set.contains(&at))
            .unwrap_or(false)
    }

    /// Local dates (in the schedule's timezone) already holding a slot.
    fn taken_dates(&self, platform: Platform, schedule: &ScheduleConfig) -> BTreeSet<NaiveDate> {
        self.slots
            .get(&platform)
            .map(|set| set.iter().map(|at| schedule.local_date(*at)).collect())
            .unwrap_or_default()
    }
}

/// One new task's place in the timetable.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotAssignment {
    /// Index into the caller's list of media items
    pub item: usize,
    pub platform: Platform,
    pub scheduled_time: DateTime<Utc>,
}

/// Up to `count` free slots on `platform` strictly after `after`.
///
/// With `one_per_day`, days that already hold a task are skipped and at most
/// one slot per day is returned.
pub fn free_slots(
    schedule: &ScheduleConfig,
    platform: Platform,
    occupancy: &Occupancy,
    after: DateTime<Utc>,
    count: usize,
) -> Vec<DateTime<Utc>> {
    let mut taken_dates = if schedule.one_per_day() {
        occupancy.taken_dates(platform, schedule)
    } else {
        BTreeSet::new()
    };

    let mut free = Vec::with_capacity(count);
    for slot in schedule.slots_after(after) {
        if free.len() == count {
            break;
        }
        if occupancy.is_taken(platform, slot) {
            continue;
        }
        if schedule.one_per_day() {
            // insert() is false when the day is already used
            if !taken_dates.insert(schedule.local_date(slot)) {
                continue;
            }
        }
        free.push(slot);
    }
    free
}

/// Assign `items` media items a slot on every platform in `platforms`.
///
/// Slots are taken in ascending order; the order in which items receive them
/// is shuffled independently for each platform. `occupancy` is updated with
/// the new slots.
pub fn assign_slots<R: Rng + ?Sized>(
    schedule: &ScheduleConfig,
    items: usize,
    platforms: &[Platform],
    occupancy: &mut Occupancy,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Result<Vec<SlotAssignment>> {
    let mut assignments = Vec::with_capacity(items * platforms.len());
    if items == 0 {
        return Ok(assignments);
    }

    for platform in platforms {
        let slots = free_slots(schedule, *platform, occupancy, now, items);
        check_capacity(items, slots.len())?;

        let mut order: Vec<usize> = (0..items).collect();
        order.shuffle(rng);

        for (item, slot) in order.into_iter().zip(slots) {
            occupancy.insert(*platform, slot);
            assignments.push(SlotAssignment {
                item,
                platform: *platform,
                scheduled_time: slot,
            });
        }
    }

    Ok(assignments)
}

/// The first free slot on `platform` strictly after `after`.
pub fn next_free_slot(
    schedule: &ScheduleConfig,
    platform: Platform,
    occupancy: &Occupancy,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    free_slots(schedule, platform, occupancy, after, 1)
        .into_iter()
        .next()
        .ok_or_else(|| ConfigError::NoAvailableSlot.into())
}

/// New times for `movable` tasks: the first free slots from `now`, handed
/// out in random order per platform.
///
/// `occupancy` must not contain the movable tasks' current slots.
pub fn reshuffle<R: Rng + ?Sized>(
    schedule: &ScheduleConfig,
    movable: &[Task],
    occupancy: &mut Occupancy,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Result<Vec<(String, DateTime<Utc>)>> {
    let mut by_platform: HashMap<Platform, Vec<&Task>> = HashMap::new();
    for task in movable {
        by_platform.entry(task.platform).or_default().push(task);
    }

    let mut platforms: Vec<Platform> = by_platform.keys().copied().collect();
    platforms.sort();

    let mut plan = Vec::with_capacity(movable.len());
    for platform in platforms {
        let mut tasks = by_platform.remove(&platform).unwrap_or_default();
        let slots = free_slots(schedule, platform, occupancy, now, tasks.len());
        check_capacity(tasks.len(), slots.len())?;

        tasks.shuffle(rng);
        for (task, slot) in tasks.into_iter().zip(slots) {
            occupancy.insert(platform, slot);
            plan.push((task.id.clone(), slot));
        }
    }
    Ok(plan)
}

fn check_capacity(needed: usize, found: usize) -> Result<()> {
    if found == 0 {
        return Err(ConfigError::NoAvailableSlot.into());
    }
    if found < needed {
        return Err(ConfigError::InsufficientSlots { needed, found }.into());
    }
    Ok(())
}
