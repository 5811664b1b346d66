/// Process-wide monotonic clock.
///
/// Every timestamp in a report is nanoseconds since one shared origin. The
/// origin is offset by one so a stored `0` can always mean "not set".

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

pub fn now_nanos() -> u64 {
    let origin = *ORIGIN.get_or_init(Instant::now);
    u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX - 1) + 1
}
