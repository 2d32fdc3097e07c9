use cinder_error::{DbError, Result};
use tracing::{debug, warn};

use super::{SlotId, ThreadType};
use crate::config::{METER_MAX, MeterConfig};
use crate::scheduler::{Scheduler, SchedulerState};

/// Number of utility threads of a category allowed to run.
///
/// With no foreground activity, half the pool may run once the meter is above
/// low water. Otherwise the allowance scales linearly from zero at the
/// foreground threshold up to the whole pool at `METER_MAX`.
pub fn compute_max_allowed(
    pool_size: usize,
    meter: u32,
    config: &MeterConfig,
    foreground_active: usize,
) -> usize {
    let meter = meter.min(METER_MAX);
    if foreground_active == 0 {
        return if meter > config.low_water {
            pool_size.div_ceil(2)
        } else {
            0
        };
    }
    if meter <= config.foreground {
        return 0;
    }

    let above = (meter - config.foreground) as usize;
    let range = (METER_MAX - config.foreground) as usize;
    (pool_size * above).div_ceil(range).min(pool_size)
}

impl Scheduler {
    fn meter_config(&self, ty: ThreadType) -> Result<&MeterConfig> {
        match ty {
            ThreadType::Master => Ok(&self.config.master_meter),
            ThreadType::Recovery => Ok(&self.config.recovery_meter),
            other => Err(DbError::new("Thread type has no activity meter")
                .with_field("type", format!("{other:?}"))),
        }
    }

    pub fn meter(&self, ty: ThreadType) -> Result<u32> {
        self.meter_config(ty)?;
        Ok(self.lock().slots.meters[ty.index()])
    }

    /// Raise the urgency of a utility category. Crossing high water wakes the
    /// utility threads.
    pub fn increment_meter(&self, ty: ThreadType, delta: u32) -> Result<()> {
        let high_water = self.meter_config(ty)?.high_water;
        let mut state = self.lock();
        let meter = &mut state.slots.meters[ty.index()];
        let prev = *meter;
        *meter = meter.saturating_add(delta).min(METER_MAX);
        let curr = *meter;

        if prev <= high_water && curr > high_water {
            debug!(?ty, meter = curr, "meter crossed high water");
            self.release_utilities_locked(&mut state);
        }
        Ok(())
    }

    pub fn decrement_meter(&self, ty: ThreadType, delta: u32) -> Result<()> {
        self.meter_config(ty)?;
        let mut state = self.lock();
        let meter = &mut state.slots.meters[ty.index()];
        *meter = meter.saturating_sub(delta);
        Ok(())
    }

    /// Number of utility threads of `ty` currently allowed to run.
    pub fn max_allowed(&self, ty: ThreadType) -> Result<usize> {
        self.meter_config(ty)?;
        let state = self.lock();
        Ok(self.max_allowed_locked(&state, ty))
    }

    pub(crate) fn max_allowed_locked(&self, state: &SchedulerState, ty: ThreadType) -> usize {
        let Ok(config) = self.meter_config(ty) else {
            return 0;
        };
        let slots = &state.slots;
        let foreground = [
            ThreadType::Worker,
            ThreadType::Communication,
            ThreadType::Client,
        ]
        .iter()
        .map(|t| slots.counts(*t).active)
        .sum();

        compute_max_allowed(
            slots.counts(ty).created,
            slots.meters[ty.index()],
            config,
            foreground,
        )
    }

    /// The calling utility thread, already counted as active, may keep running.
    pub(crate) fn utility_may_run(&self, ty: ThreadType) -> bool {
        let state = self.lock();
        state.slots.counts(ty).active <= self.max_allowed_locked(&state, ty)
    }

    /// Park an idle utility thread, unless its category is urgent and admits
    /// it.
    ///
    /// The admission check and marking the slot suspended happen under one
    /// lock acquisition, so a high water crossing can't slip in between.
    /// Returns true if the thread was parked.
    pub fn utility_idle_or_suspend(&self, slot: SlotId, ty: ThreadType) -> Result<bool> {
        let high_water = self.meter_config(ty)?.high_water;
        let event = {
            let mut state = self.lock();
            if state.shutdown {
                return Ok(false);
            }
            let admitted = state.slots.counts(ty).active <= self.max_allowed_locked(&state, ty);
            if admitted && state.slots.meters[ty.index()] > high_water {
                return Ok(false);
            }
            state.slots.suspend(slot)?
        };
        event.wait();
        Ok(true)
    }

    /// Wake suspended utility threads up to what each category allows.
    pub fn release_utilities(&self) -> usize {
        let mut state = self.lock();
        self.release_utilities_locked(&mut state)
    }

    pub(crate) fn release_utilities_locked(&self, state: &mut SchedulerState) -> usize {
        let mut released = 0;
        for ty in ThreadType::UTILITY {
            let allowed = self.max_allowed_locked(state, ty);
            let active = state.slots.counts(ty).active;
            if allowed > active {
                released += state.slots.release(ty, allowed - active);
            }
        }
        released
    }

    /// Wake every suspended utility thread once, regardless of the meters.
    pub fn boost_background(&self) -> usize {
        let mut state = self.lock();
        self.boost_background_locked(&mut state)
    }

    pub(crate) fn boost_background_locked(&self, state: &mut SchedulerState) -> usize {
        let mut released = 0;
        for ty in ThreadType::UTILITY {
            released += state.slots.release(ty, usize::MAX);
        }
        state.stats.priority_boosts += 1;
        warn!(released, "boosting background threads after long client wait");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter_config() -> MeterConfig {
        MeterConfig {
            low_water: 200,
            high_water: 800,
            foreground: 500,
        }
    }

    #[test]
    fn idle_server_allows_half_above_low_water() {
        let config = meter_config();
        assert_eq!(0, compute_max_allowed(5, 200, &config, 0));
        assert_eq!(3, compute_max_allowed(5, 201, &config, 0));
        assert_eq!(2, compute_max_allowed(4, 1000, &config, 0));
    }

    #[test]
    fn busy_server_scales_from_foreground() {
        let config = meter_config();
        assert_eq!(0, compute_max_allowed(4, 0, &config, 2));
        assert_eq!(0, compute_max_allowed(4, 500, &config, 2));
        assert_eq!(1, compute_max_allowed(4, 501, &config, 2));
        assert_eq!(2, compute_max_allowed(4, 750, &config, 2));
        assert_eq!(4, compute_max_allowed(4, 1000, &config, 2));
        assert_eq!(4, compute_max_allowed(4, u32::MAX, &config, 2));
    }

    #[test]
    fn full_foreground_threshold_allows_nothing() {
        let config = MeterConfig {
            low_water: 0,
            high_water: 1000,
            foreground: 1000,
        };
        assert_eq!(0, compute_max_allowed(8, 1000, &config, 1));
    }

    #[test]
    fn monotone_in_meter() {
        let config = meter_config();
        for pool in 0..6 {
            for foreground in 0..3 {
                let mut prev = 0;
                for meter in 0..=METER_MAX {
                    let allowed = compute_max_allowed(pool, meter, &config, foreground);
                    assert!(allowed >= prev, "pool={pool} meter={meter}");
                    assert!(allowed <= pool);
                    if foreground > 0 && meter <= config.foreground {
                        assert_eq!(0, allowed);
                    }
                    prev = allowed;
                }
            }
        }
    }
}
