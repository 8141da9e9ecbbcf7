/// Concurrency for the next auto-scaling tick.
///
/// Additive hill-climb: one step up while jobs are waiting faster than they
/// are being worked, one step down once the queues are empty, never outside
/// `[min, max]`. An out-of-range `current` is clamped first.
pub fn next_concurrency(current: usize, min: usize, max: usize, waiting: u64, active: u64) -> usize {
    let current = current.clamp(min, max);
    if waiting > active && current < max {
        current + 1
    } else if waiting == 0 && current > min {
        current - 1
    } else {
        current
    }
}
