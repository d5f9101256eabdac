use std::time::Duration;

use rand::Rng;

/// Base delay after the first failure, in seconds
pub const PERIOD: u64 = 60;
pub const COEFF: u64 = 2;
/// Upper bound of the delay, in seconds
pub const MAX: u64 = 3600;

/// Upper bound of the jittered delay after `n` consecutive failures
pub fn ceiling(n: u32) -> Duration {
    if n == 0 {
        return Duration::ZERO;
    }
    let exp = COEFF.saturating_pow(n - 1);
    Duration::from_secs(PERIOD.saturating_mul(exp).min(MAX))
}

/// Random delay in `[0, ceiling(n))`; zero when nothing failed
pub fn exponential_delay(n: u32) -> Duration {
    let ceiling = ceiling(n);
    if ceiling.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..ceiling.as_millis() as u64))
}
