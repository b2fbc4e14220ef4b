//! Bounded retry/backoff helpers shared by delivery and teardown paths.

use std::time::Duration;

/// Capped exponential backoff schedule.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
	pub base_ms: u64,
	pub cap_ms: u64,
}

impl Backoff {
	pub const fn new(base_ms: u64, cap_ms: u64) -> Self {
		Self { base_ms, cap_ms }
	}

	/// Delay before retrying after the given 1-based failed attempt.
	pub fn delay(&self, attempt: u32) -> Duration {
		let shift = attempt.saturating_sub(1).min(16);
		let ms = self.base_ms.saturating_mul(1_u64 << shift).min(self.cap_ms);
		Duration::from_millis(ms)
	}
}

/// Linear schedule used by the outer QR delivery loop.
pub fn linear_delay(base: Duration, attempt: u32) -> Duration {
	base.saturating_mul(attempt)
}
