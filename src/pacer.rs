// Frame pacer - CPU-side submission rate limiter
//
// Keeps a monotonic tick schedule independent of GPU presentation pacing.
// Falling behind skips the missed ticks instead of replaying them in a
// burst. Coarse sleep covers most of the wait, a short spin the remainder.

use std::time::{Duration, Instant};

/// How much of the wait is spun instead of slept, for precision.
const SPIN_MARGIN: Duration = Duration::from_millis(1);

pub struct FramePacer {
    interval: Option<Duration>,
    next_tick: Option<Instant>,
}

impl FramePacer {
    /// `target_fps` of `None` (or a non-positive rate) runs uncapped.
    pub fn new(target_fps: Option<f64>) -> Self {
        let mut pacer = Self {
            interval: None,
            next_tick: None,
        };
        pacer.set_rate(target_fps);
        pacer
    }

    /// Re-target the rate at runtime. The schedule restarts from the next
    /// call to `wait`.
    pub fn set_rate(&mut self, target_fps: Option<f64>) {
        self.interval = target_fps
            .filter(|fps| *fps > 0.0)
            .map(|fps| Duration::from_secs_f64(1.0 / fps));
        self.next_tick = None;
    }

    pub fn uncapped(&self) -> bool {
        self.interval.is_none()
    }

    /// Block until the next scheduled tick, then advance the schedule.
    pub fn wait(&mut self) {
        let Some(deadline) = self.schedule(Instant::now()) else {
            return;
        };

        // Coarse sleep, leaving a margin for the OS timer slop
        loop {
            let now = Instant::now();
            if now + SPIN_MARGIN >= deadline {
                break;
            }
            std::thread::sleep(deadline - now - SPIN_MARGIN);
        }
        // Spin out the remainder
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }

    /// Advance the schedule and return the deadline to wait for, if any.
    ///
    /// Returns `None` when uncapped, on the first tick, and when the caller
    /// is more than one interval behind schedule. In the last case the
    /// missed ticks are dropped and the schedule re-anchors at `now`.
    fn schedule(&mut self, now: Instant) -> Option<Instant> {
        let interval = self.interval?;

        let Some(deadline) = self.next_tick else {
            self.next_tick = Some(now + interval);
            return None;
        };

        if now > deadline + interval {
            // Behind by more than one tick: skip the missed ones
            self.next_tick = Some(now + interval);
            return None;
        }

        self.next_tick = Some(deadline + interval);
        Some(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(10);

    fn pacer_100fps() -> FramePacer {
        FramePacer::new(Some(100.0))
    }

    #[test]
    fn uncapped_never_schedules() {
        let mut pacer = FramePacer::new(None);
        let now = Instant::now();
        assert!(pacer.uncapped());
        assert_eq!(pacer.schedule(now), None);
        assert_eq!(pacer.schedule(now + TICK), None);

        let mut zero = FramePacer::new(Some(0.0));
        assert!(zero.uncapped());
    }

    #[test]
    fn steady_ticks_average_to_the_interval() {
        let mut pacer = pacer_100fps();
        let start = Instant::now();
        assert_eq!(pacer.schedule(start), None);

        // Caller keeps up exactly; deadlines must advance by one interval each
        let mut previous = None;
        for i in 1..=100u32 {
            let now = start + TICK * (i - 1) + Duration::from_millis(1);
            let deadline = pacer.schedule(now).expect("on-schedule tick");
            assert_eq!(deadline, start + TICK * i);
            if let Some(prev) = previous {
                assert_eq!(deadline - prev, TICK);
            }
            previous = Some(deadline);
        }
    }

    #[test]
    fn long_stall_skips_ticks_without_a_burst() {
        let mut pacer = pacer_100fps();
        let start = Instant::now();
        pacer.schedule(start);

        // Stall for ten intervals past the first deadline
        let late = start + TICK * 11;
        assert_eq!(pacer.schedule(late), None, "missed ticks are dropped");

        // The schedule re-anchors: the next deadline lies in the future,
        // not at any of the missed points
        let next = pacer.schedule(late + Duration::from_millis(1)).unwrap();
        assert_eq!(next, late + TICK);
    }

    #[test]
    fn slightly_late_caller_still_gets_the_deadline() {
        let mut pacer = pacer_100fps();
        let start = Instant::now();
        pacer.schedule(start);

        // Half an interval late: within tolerance, keep the cadence
        let deadline = pacer.schedule(start + TICK + TICK / 2).unwrap();
        assert_eq!(deadline, start + TICK);
    }

    #[test]
    fn retargeting_restarts_the_schedule() {
        let mut pacer = pacer_100fps();
        let start = Instant::now();
        pacer.schedule(start);
        pacer.schedule(start + Duration::from_millis(1)).unwrap();

        pacer.set_rate(Some(50.0));
        assert_eq!(pacer.schedule(start + TICK * 2), None, "fresh schedule");
        let deadline = pacer.schedule(start + TICK * 2 + Duration::from_millis(1)).unwrap();
        assert_eq!(deadline, start + TICK * 2 + Duration::from_millis(20));

        pacer.set_rate(None);
        assert!(pacer.uncapped());
        assert_eq!(pacer.schedule(start + TICK * 3), None);
    }
}
