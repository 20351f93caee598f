use std::time::{Duration, Instant};

/// Admits at most one frame per `1 / target_fps`. Frames arriving sooner are
/// shed, never queued.
#[derive(Clone, Debug)]
pub struct FrameScheduler {
    interval: Duration,
    last_admitted: Option<Instant>,
}

impl FrameScheduler {
    pub fn new(target_fps: u32) -> Self {
        let interval = if target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / target_fps as f64)
        };
        Self {
            interval,
            last_admitted: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a frame that arrived at `arrival` goes on to the pipeline.
    pub fn admit(&mut self, arrival: Instant) -> bool {
        if let Some(last) = self.last_admitted {
            if arrival.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_admitted = Some(arrival);
        true
    }

    /// Forget the last admission, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.last_admitted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheds_frames_inside_interval() {
        let start = Instant::now();
        let mut scheduler = FrameScheduler::new(5);
        assert!(scheduler.admit(start));
        assert!(!scheduler.admit(start + Duration::from_millis(50)));
        assert!(!scheduler.admit(start + Duration::from_millis(199)));
        assert!(scheduler.admit(start + Duration::from_millis(200)));
        // Out-of-order arrival never admits.
        assert!(!scheduler.admit(start));
    }

    #[test]
    fn admissions_bounded_by_ceil_rate_in_any_window() {
        let start = Instant::now();
        let fps = 5u32;
        let mut scheduler = FrameScheduler::new(fps);
        // 30 fps camera for 3 seconds.
        let admitted: Vec<Duration> = (0..90u64)
            .map(|i| Duration::from_micros(i * 33_333))
            .filter(|offset| scheduler.admit(start + *offset))
            .collect();
        assert!(!admitted.is_empty());

        for window_ms in [150u64, 450, 1_000, 1_300] {
            let window = Duration::from_millis(window_ms);
            let bound = (fps as f64 * window.as_secs_f64()).ceil() as usize;
            for (i, from) in admitted.iter().enumerate() {
                let count = admitted[i..]
                    .iter()
                    .take_while(|t| **t < *from + window)
                    .count();
                assert!(count <= bound, "{} admitted in {:?}", count, window);
            }
        }
    }

    #[test]
    fn reset_admits_immediately() {
        let start = Instant::now();
        let mut scheduler = FrameScheduler::new(1);
        assert!(scheduler.admit(start));
        scheduler.reset();
        assert!(scheduler.admit(start + Duration::from_millis(10)));
    }
}
