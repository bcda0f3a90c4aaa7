/*! Time representation and clocks.

Time is represented as an integral number of seconds plus a fractional part,
kept normalized so the fraction always lies in `[0, 1)`. This matches the
sub-nanosecond resolution radio hardware reports its own time in: the full
seconds are exact, and the fraction retains a full double's precision.

Two clocks share this representation. [MonoClock] is the primary,
monotonic reference; a pluggable [TimeKeeper] lets the radio's hardware
clock drive it. [WallClock] is derived from the monotonic clock by an
atomically-updated `(offset, skew)` transformation:

```text
wall = t0 + offset + skew * (mono - t0)
```

Offset and skew updates are individually atomic but deliberately not
consistent with each other; readers may observe one old and one new value.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, RwLock};

use std::ops::{Add, AddAssign, Div, Mul, Neg, Rem, Sub, SubAssign};
use std::sync::Arc;

/// Normalize a (full, frac) pair so that `0 <= frac < 1`.
fn normalize(full: i64, frac: f64) -> (i64, f64) {
    let int_frac = frac as i64;
    let mut full = full + int_frac;
    let mut frac = frac - int_frac as f64;

    if frac < 0.0 {
        full -= 1;
        frac += 1.0;
    }

    (full, frac)
}

/// A point in time, represented as whole seconds plus a fraction in `[0, 1)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct TimePoint {
    full: i64,
    frac: f64,
}

impl Eq for TimePoint {}

impl Ord for TimePoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.partial_cmp(other).expect("TimePoint is never NaN")
    }
}

impl TimePoint {
    pub const ZERO: TimePoint = TimePoint { full: 0, frac: 0.0 };

    pub fn new(full: i64, frac: f64) -> Self {
        let (full, frac) = normalize(full, frac);
        TimePoint { full, frac }
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self::new(0, secs)
    }

    /// Whole seconds.
    pub fn full(&self) -> i64 {
        self.full
    }

    /// Fractional seconds, in `[0, 1)`.
    pub fn frac(&self) -> f64 {
        self.frac
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.full as f64 + self.frac
    }
}

/// A signed span of time, same representation as [TimePoint].
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct TimeDelta {
    full: i64,
    frac: f64,
}

impl TimeDelta {
    pub const ZERO: TimeDelta = TimeDelta { full: 0, frac: 0.0 };

    pub fn new(full: i64, frac: f64) -> Self {
        let (full, frac) = normalize(full, frac);
        TimeDelta { full, frac }
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self::new(0, secs)
    }

    pub fn from_millis(ms: i64) -> Self {
        Self::new(0, ms as f64 * 1e-3)
    }

    pub fn full(&self) -> i64 {
        self.full
    }

    pub fn frac(&self) -> f64 {
        self.frac
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.full as f64 + self.frac
    }

    pub fn as_std(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.as_secs_f64().max(0.0))
    }
}

impl Add<TimeDelta> for TimePoint {
    type Output = TimePoint;

    fn add(self, rhs: TimeDelta) -> TimePoint {
        TimePoint::new(self.full + rhs.full, self.frac + rhs.frac)
    }
}

impl AddAssign<TimeDelta> for TimePoint {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl Sub<TimeDelta> for TimePoint {
    type Output = TimePoint;

    fn sub(self, rhs: TimeDelta) -> TimePoint {
        TimePoint::new(self.full - rhs.full, self.frac - rhs.frac)
    }
}

impl SubAssign<TimeDelta> for TimePoint {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        *self = *self - rhs;
    }
}

impl Sub<TimePoint> for TimePoint {
    type Output = TimeDelta;

    fn sub(self, rhs: TimePoint) -> TimeDelta {
        TimeDelta::new(self.full - rhs.full, self.frac - rhs.frac)
    }
}

impl Add<TimeDelta> for TimeDelta {
    type Output = TimeDelta;

    fn add(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta::new(self.full + rhs.full, self.frac + rhs.frac)
    }
}

impl Sub<TimeDelta> for TimeDelta {
    type Output = TimeDelta;

    fn sub(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta::new(self.full - rhs.full, self.frac - rhs.frac)
    }
}

impl Neg for TimeDelta {
    type Output = TimeDelta;

    fn neg(self) -> TimeDelta {
        TimeDelta::new(-self.full, -self.frac)
    }
}

impl Mul<f64> for TimeDelta {
    type Output = TimeDelta;

    fn mul(self, rhs: f64) -> TimeDelta {
        TimeDelta::new(0, self.as_secs_f64() * rhs)
    }
}

impl Div<f64> for TimeDelta {
    type Output = TimeDelta;

    fn div(self, rhs: f64) -> TimeDelta {
        TimeDelta::new(0, self.as_secs_f64() / rhs)
    }
}

impl Rem<TimeDelta> for TimeDelta {
    type Output = TimeDelta;

    fn rem(self, rhs: TimeDelta) -> TimeDelta {
        let x = rhs.as_secs_f64();
        TimeDelta::new(0, ((self.full as f64 % x) + (self.frac % x)) % x)
    }
}

/// A source of "now" that overrides the default monotonic clock, so the
/// radio's hardware time can drive the system clock.
pub trait TimeKeeper: Send + Sync {
    fn now(&self) -> TimePoint;
}

static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
static TIME_KEEPER: RwLock<Option<Arc<dyn TimeKeeper>>> = RwLock::new(None);
static T0: Mutex<TimePoint> = Mutex::new(TimePoint::ZERO);

/// The monotonic clock.
pub struct MonoClock;

impl MonoClock {
    /// The current monotonic time.
    pub fn now() -> TimePoint {
        if let Some(keeper) = TIME_KEEPER.read().unwrap().as_ref() {
            return keeper.now();
        }

        let epoch = *EPOCH.get_or_init(std::time::Instant::now);
        let elapsed = epoch.elapsed();

        TimePoint::new(elapsed.as_secs() as i64, elapsed.subsec_nanos() as f64 * 1e-9)
    }

    /// Time origin used by the wall-clock transformation.
    pub fn t0() -> TimePoint {
        *T0.lock().unwrap()
    }

    /// Install a time keeper and re-anchor the time origin.
    pub fn set_time_keeper(keeper: Arc<dyn TimeKeeper>) {
        let t0 = keeper.now();

        *TIME_KEEPER.write().unwrap() = Some(keeper);
        *T0.lock().unwrap() = t0;
    }

    pub fn reset_time_keeper() {
        *TIME_KEEPER.write().unwrap() = None;
    }
}

static WALL_OFFSET: AtomicU64 = AtomicU64::new(0);
// f64 bits of 1.0
static WALL_SKEW: AtomicU64 = AtomicU64::new(0x3ff0000000000000);

/// The wall clock, slaved to the monotonic clock by an offset and skew.
pub struct WallClock;

impl WallClock {
    pub fn offset() -> TimeDelta {
        TimeDelta::from_secs_f64(f64::from_bits(WALL_OFFSET.load(Ordering::Acquire)))
    }

    pub fn set_offset(offset: TimeDelta) {
        WALL_OFFSET.store(offset.as_secs_f64().to_bits(), Ordering::Release);
    }

    pub fn skew() -> f64 {
        f64::from_bits(WALL_SKEW.load(Ordering::Acquire))
    }

    pub fn set_skew(skew: f64) {
        WALL_SKEW.store(skew.to_bits(), Ordering::Release);
    }

    pub fn now() -> TimePoint {
        Self::to_wall_time(MonoClock::now())
    }

    /// The wall-clock time corresponding to a monotonic time.
    pub fn to_wall_time(t: TimePoint) -> TimePoint {
        let t0 = MonoClock::t0();

        t0 + Self::offset() + (t - t0) * Self::skew()
    }

    /// The monotonic time corresponding to a wall-clock time.
    pub fn to_mono_time(t: TimePoint) -> TimePoint {
        let t0 = MonoClock::t0();

        t0 + (t - t0 - Self::offset()) / Self::skew()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization() {
        let t = TimePoint::new(1, 1.5);
        assert_eq!(t.full(), 2);
        assert!((t.frac() - 0.5).abs() < 1e-12);

        let t = TimePoint::new(1, -0.25);
        assert_eq!(t.full(), 0);
        assert!((t.frac() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn point_arithmetic() {
        let a = TimePoint::new(10, 0.75);
        let b = TimePoint::new(12, 0.25);
        let d = b - a;

        assert_eq!(d.full(), 1);
        assert!((d.frac() - 0.5).abs() < 1e-12);

        let c = a + d;
        assert_eq!(c.full(), b.full());
        assert!((c.frac() - b.frac()).abs() < 1e-12);

        // Subtraction normalizes the fraction back into [0, 1)
        let e = a - TimeDelta::from_secs_f64(0.9);
        assert_eq!(e.full(), 9);
        assert!(e.frac() >= 0.0 && e.frac() < 1.0);
    }

    #[test]
    fn ordering() {
        let a = TimePoint::new(5, 0.1);
        let b = TimePoint::new(5, 0.2);
        let c = TimePoint::new(6, 0.0);

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn monotonic() {
        let a = MonoClock::now();
        let b = MonoClock::now();
        assert!(a <= b);
    }

    #[test]
    fn delta_modulo() {
        let slot = TimeDelta::from_secs_f64(0.010);
        let t = TimeDelta::from_secs_f64(0.025);
        let r = t % slot;

        assert!((r.as_secs_f64() - 0.005).abs() < 1e-9);
    }
}
