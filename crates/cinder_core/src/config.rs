use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use cinder_error::{DbError, Result};
use serde::Serialize;

/// Upper bound of every activity meter.
pub const METER_MAX: u32 = 1000;

pub const DEFAULT_CHECK_INTERVAL: u64 = 16;
pub const DEFAULT_ROUND_ROBIN_LIMIT: u64 = 4096;
pub const DEFAULT_PARALLELIZE_LIMIT: u64 = 1 << 20;
pub const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(50);
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PRIORITY_BOOST_AFTER: Duration = Duration::from_secs(2);

/// Thresholds for a single utility thread category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MeterConfig {
    /// With no foreground activity, utility threads only run once the meter is
    /// above this value.
    pub low_water: u32,
    /// Crossing this value wakes utility threads of the category.
    pub high_water: u32,
    /// With foreground activity, nothing runs at or below this value.
    pub foreground: u32,
}

impl Default for MeterConfig {
    fn default() -> Self {
        MeterConfig {
            low_water: 200,
            high_water: 800,
            foreground: 500,
        }
    }
}

impl MeterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.high_water > METER_MAX || self.foreground > METER_MAX {
            return Err(DbError::new(format!(
                "Meter thresholds cannot be greater than {METER_MAX}"
            ))
            .with_field("high_water", self.high_water)
            .with_field("foreground", self.foreground));
        }
        if self.low_water >= self.high_water {
            return Err(DbError::new("Meter low water must be less than high water")
                .with_field("low_water", self.low_water)
                .with_field("high_water", self.high_water));
        }
        Ok(())
    }
}

/// Configuration for the scheduler and the server thread governor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerConfig {
    /// Number of steps between stop checks in the run loop.
    pub check_interval: u64,
    /// Steps a thread may take in one turn before it's rotated.
    pub round_robin_limit: u64,
    /// Lifetime steps after which the parallelization hook fires.
    pub parallelize_limit: u64,
    pub lock_wait_timeout: Duration,
    pub monitor_interval: Duration,
    /// How long a client may wait before background threads get boosted.
    pub priority_boost_after: Duration,
    pub worker_threads: usize,
    pub master_meter: MeterConfig,
    pub recovery_meter: MeterConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            check_interval: DEFAULT_CHECK_INTERVAL,
            round_robin_limit: DEFAULT_ROUND_ROBIN_LIMIT,
            parallelize_limit: DEFAULT_PARALLELIZE_LIMIT,
            lock_wait_timeout: DEFAULT_LOCK_WAIT_TIMEOUT,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            priority_boost_after: DEFAULT_PRIORITY_BOOST_AFTER,
            worker_threads: num_cpus::get(),
            master_meter: MeterConfig::default(),
            recovery_meter: MeterConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn set_from_str(&mut self, name: &str, value: &str) -> Result<()> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        (func.set)(value, self)
    }

    pub fn get_as_string(&self, name: &str) -> Result<String> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        Ok((func.get)(self))
    }

    pub fn reset(&mut self, name: &str) -> Result<()> {
        let def_conf = Self::default();

        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        let val = (func.get)(&def_conf);
        (func.set)(&val, self)
    }

    /// Names and descriptions of every setting, sorted by name.
    pub fn settings() -> Vec<(&'static str, &'static str)> {
        let mut settings: Vec<_> = GET_SET_FUNCTIONS
            .iter()
            .map(|(name, funcs)| (*name, funcs.description))
            .collect();
        settings.sort_unstable();
        settings
    }

    /// Check values that depend on each other.
    ///
    /// Individual settings are validated when set, this catches configs built
    /// directly through struct fields.
    pub fn validate(&self) -> Result<()> {
        CheckInterval::validate_value(self.check_interval)?;
        RoundRobinLimit::validate_value(self.round_robin_limit)?;
        WorkerThreads::validate_value(self.worker_threads)?;
        if self.parallelize_limit == 0 {
            return Err(DbError::new("Parallelize limit must be greater than zero"));
        }
        if self.monitor_interval.is_zero() {
            return Err(DbError::new("Monitor interval must be greater than zero"));
        }
        self.master_meter.validate()?;
        self.recovery_meter.validate()?;
        Ok(())
    }
}

struct SettingFunctions {
    description: &'static str,
    set: fn(value: &str, conf: &mut SchedulerConfig) -> Result<()>,
    get: fn(conf: &SchedulerConfig) -> String,
}

impl SettingFunctions {
    const fn new<S: SchedulerSetting>() -> Self {
        SettingFunctions {
            description: S::DESCRIPTION,
            set: S::set_from_str as _,
            get: S::get_as_string as _,
        }
    }
}

fn insert_setting<S: SchedulerSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<CheckInterval>(&mut map);
    insert_setting::<RoundRobinLimit>(&mut map);
    insert_setting::<ParallelizeLimit>(&mut map);
    insert_setting::<LockWaitTimeout>(&mut map);
    insert_setting::<MonitorInterval>(&mut map);
    insert_setting::<PriorityBoostAfter>(&mut map);
    insert_setting::<WorkerThreads>(&mut map);
    insert_setting::<MasterMeterLowWater>(&mut map);
    insert_setting::<MasterMeterHighWater>(&mut map);
    insert_setting::<MasterMeterForeground>(&mut map);

    map
});

pub trait SchedulerSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_str(value: &str, conf: &mut SchedulerConfig) -> Result<()>;
    fn get_as_string(conf: &SchedulerConfig) -> String;
}

fn parse_u64(name: &str, value: &str) -> Result<u64> {
    value.trim().parse::<u64>().map_err(|e| {
        DbError::with_source(format!("Invalid value for '{name}'"), Box::new(e))
            .with_field("value", value)
    })
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    Ok(Duration::from_millis(parse_u64(name, value)?))
}

fn parse_meter(name: &str, value: &str) -> Result<u32> {
    let val = parse_u64(name, value)?;
    if val > METER_MAX as u64 {
        return Err(DbError::new(format!(
            "Meter thresholds cannot be greater than {METER_MAX}"
        ))
        .with_field("setting", name));
    }
    Ok(val as u32)
}

pub struct CheckInterval;

impl CheckInterval {
    pub fn validate_value(val: u64) -> Result<()> {
        if val == 0 {
            return Err(DbError::new("Check interval must be greater than zero"));
        }
        Ok(())
    }
}

impl SchedulerSetting for CheckInterval {
    const NAME: &'static str = "check_interval";
    const DESCRIPTION: &'static str = "Number of steps between checks for a reason to stop";

    fn set_from_str(value: &str, conf: &mut SchedulerConfig) -> Result<()> {
        let val = parse_u64(Self::NAME, value)?;
        Self::validate_value(val)?;
        conf.check_interval = val;
        Ok(())
    }

    fn get_as_string(conf: &SchedulerConfig) -> String {
        conf.check_interval.to_string()
    }
}

pub struct RoundRobinLimit;

impl RoundRobinLimit {
    pub fn validate_value(val: u64) -> Result<()> {
        if val == 0 {
            return Err(DbError::new("Round robin limit must be greater than zero"));
        }
        Ok(())
    }
}

impl SchedulerSetting for RoundRobinLimit {
    const NAME: &'static str = "round_robin_limit";
    const DESCRIPTION: &'static str =
        "Steps a query thread may take before handing control to other queued work";

    fn set_from_str(value: &str, conf: &mut SchedulerConfig) -> Result<()> {
        let val = parse_u64(Self::NAME, value)?;
        Self::validate_value(val)?;
        conf.round_robin_limit = val;
        Ok(())
    }

    fn get_as_string(conf: &SchedulerConfig) -> String {
        conf.round_robin_limit.to_string()
    }
}

pub struct ParallelizeLimit;

impl SchedulerSetting for ParallelizeLimit {
    const NAME: &'static str = "parallelize_limit";
    const DESCRIPTION: &'static str = "Lifetime steps after which a query thread may be split";

    fn set_from_str(value: &str, conf: &mut SchedulerConfig) -> Result<()> {
        let val = parse_u64(Self::NAME, value)?;
        if val == 0 {
            return Err(DbError::new("Parallelize limit must be greater than zero"));
        }
        conf.parallelize_limit = val;
        Ok(())
    }

    fn get_as_string(conf: &SchedulerConfig) -> String {
        conf.parallelize_limit.to_string()
    }
}

pub struct LockWaitTimeout;

impl SchedulerSetting for LockWaitTimeout {
    const NAME: &'static str = "lock_wait_timeout_ms";
    const DESCRIPTION: &'static str = "Milliseconds a transaction may wait for a lock";

    fn set_from_str(value: &str, conf: &mut SchedulerConfig) -> Result<()> {
        conf.lock_wait_timeout = parse_millis(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &SchedulerConfig) -> String {
        conf.lock_wait_timeout.as_millis().to_string()
    }
}

pub struct MonitorInterval;

impl SchedulerSetting for MonitorInterval {
    const NAME: &'static str = "monitor_interval_ms";
    const DESCRIPTION: &'static str = "Milliseconds between lock wait monitor passes";

    fn set_from_str(value: &str, conf: &mut SchedulerConfig) -> Result<()> {
        let val = parse_millis(Self::NAME, value)?;
        if val.is_zero() {
            return Err(DbError::new("Monitor interval must be greater than zero"));
        }
        conf.monitor_interval = val;
        Ok(())
    }

    fn get_as_string(conf: &SchedulerConfig) -> String {
        conf.monitor_interval.as_millis().to_string()
    }
}

pub struct PriorityBoostAfter;

impl SchedulerSetting for PriorityBoostAfter {
    const NAME: &'static str = "priority_boost_after_ms";
    const DESCRIPTION: &'static str =
        "Milliseconds a client may be blocked before idle background threads are woken";

    fn set_from_str(value: &str, conf: &mut SchedulerConfig) -> Result<()> {
        conf.priority_boost_after = parse_millis(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &SchedulerConfig) -> String {
        conf.priority_boost_after.as_millis().to_string()
    }
}

const MIN_WORKER_THREADS: usize = 1;
const MAX_WORKER_THREADS: usize = 512;

pub struct WorkerThreads;

impl WorkerThreads {
    pub fn validate_value(val: usize) -> Result<()> {
        if val < MIN_WORKER_THREADS {
            return Err(DbError::new(format!(
                "Worker thread count cannot be less than {MIN_WORKER_THREADS}"
            )));
        }

        if val > MAX_WORKER_THREADS {
            return Err(DbError::new(format!(
                "Worker thread count cannot be greater than {MAX_WORKER_THREADS}"
            )));
        }

        Ok(())
    }
}

impl SchedulerSetting for WorkerThreads {
    const NAME: &'static str = "worker_threads";
    const DESCRIPTION: &'static str = "Number of OS threads in the worker pool";

    fn set_from_str(value: &str, conf: &mut SchedulerConfig) -> Result<()> {
        let val = parse_u64(Self::NAME, value)? as usize;
        Self::validate_value(val)?;
        conf.worker_threads = val;
        Ok(())
    }

    fn get_as_string(conf: &SchedulerConfig) -> String {
        conf.worker_threads.to_string()
    }
}

pub struct MasterMeterLowWater;

impl SchedulerSetting for MasterMeterLowWater {
    const NAME: &'static str = "master_meter_low_water";
    const DESCRIPTION: &'static str =
        "Master meter level above which background work runs on an idle server";

    fn set_from_str(value: &str, conf: &mut SchedulerConfig) -> Result<()> {
        conf.master_meter.low_water = parse_meter(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &SchedulerConfig) -> String {
        conf.master_meter.low_water.to_string()
    }
}

pub struct MasterMeterHighWater;

impl SchedulerSetting for MasterMeterHighWater {
    const NAME: &'static str = "master_meter_high_water";
    const DESCRIPTION: &'static str = "Master meter level that wakes background threads";

    fn set_from_str(value: &str, conf: &mut SchedulerConfig) -> Result<()> {
        conf.master_meter.high_water = parse_meter(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &SchedulerConfig) -> String {
        conf.master_meter.high_water.to_string()
    }
}

pub struct MasterMeterForeground;

impl SchedulerSetting for MasterMeterForeground {
    const NAME: &'static str = "master_meter_foreground";
    const DESCRIPTION: &'static str =
        "Master meter level at or below which background work yields to user work";

    fn set_from_str(value: &str, conf: &mut SchedulerConfig) -> Result<()> {
        conf.master_meter.foreground = parse_meter(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &SchedulerConfig) -> String {
        conf.master_meter.foreground.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_test_config() -> SchedulerConfig {
        SchedulerConfig {
            worker_threads: 4,
            ..Default::default()
        }
    }

    #[test]
    fn set_and_get() {
        let mut conf = new_test_config();

        conf.set_from_str("check_interval", "4").unwrap();
        assert_eq!(4, conf.check_interval);
        assert_eq!("4", conf.get_as_string("check_interval").unwrap());

        conf.set_from_str("lock_wait_timeout_ms", "250").unwrap();
        assert_eq!(Duration::from_millis(250), conf.lock_wait_timeout);
        assert_eq!("250", conf.get_as_string("lock_wait_timeout_ms").unwrap());
    }

    #[test]
    fn reset_restores_default() {
        let mut conf = new_test_config();

        conf.set_from_str("round_robin_limit", "7").unwrap();
        conf.reset("round_robin_limit").unwrap();
        assert_eq!(DEFAULT_ROUND_ROBIN_LIMIT, conf.round_robin_limit);
    }

    #[test]
    fn unknown_setting() {
        let mut conf = new_test_config();
        conf.set_from_str("does_not_exist", "1").unwrap_err();
        conf.get_as_string("does_not_exist").unwrap_err();
    }

    #[test]
    fn invalid_values() {
        let mut conf = new_test_config();
        conf.set_from_str("check_interval", "0").unwrap_err();
        conf.set_from_str("check_interval", "abc").unwrap_err();
        conf.set_from_str("worker_threads", "0").unwrap_err();
        conf.set_from_str("master_meter_foreground", "1001").unwrap_err();

        // Failed sets leave the old value.
        assert_eq!(DEFAULT_CHECK_INTERVAL, conf.check_interval);
    }

    #[test]
    fn validate_meter_ordering() {
        let mut conf = new_test_config();
        conf.validate().unwrap();

        conf.set_from_str("master_meter_low_water", "900").unwrap();
        conf.validate().unwrap_err();
    }

    #[test]
    fn settings_listed() {
        let settings = SchedulerConfig::settings();
        assert!(settings.iter().any(|(name, _)| *name == "check_interval"));
        assert!(settings.windows(2).all(|w| w[0].0 < w[1].0));
    }
}
