//! Runtime configuration for the Ares VM.

use hashbrown::HashMap;

/// Tuning knobs for one VM instance. Field defaults match the documented
/// collector and timer behavior; embedders override what they need.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Collector goal: ratio of total heap to live data, as a percentage.
    pub gc_goal_percent: u32,

    /// Percentage of newly-allocated bytes the collector must reclaim per tick.
    pub gc_step_multiplier: u32,

    /// Bytes allocated between mandatory collector steps.
    pub gc_step_size: usize,

    /// Per-category byte limits; absent categories are unlimited.
    pub category_limits: HashMap<u8, usize>,

    /// Ceiling on the frame-stack depth of one task.
    pub call_depth_limit: usize,

    /// Floor for the timer catch-up threshold, in seconds.
    pub timer_catchup_floor: f64,

    /// Timer catch-up threshold as a multiple of the timer interval.
    pub timer_catchup_factor: f64,

    /// Recursion ceiling for the persistence graph walk.
    pub persist_depth_limit: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            gc_goal_percent: 200,
            gc_step_multiplier: 200,
            gc_step_size: 16 * 1024,
            category_limits: HashMap::new(),
            call_depth_limit: 200,
            timer_catchup_floor: 2.0,
            timer_catchup_factor: 2.0,
            persist_depth_limit: 2048,
        }
    }
}

impl VmConfig {
    /// Sets a byte limit for one memory category.
    pub fn with_category_limit(mut self, category: u8, bytes: usize) -> Self {
        self.category_limits.insert(category, bytes);
        self
    }
}
