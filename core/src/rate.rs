use std::time::{Duration, Instant};

pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Bytes per second between two `(time, done)` samples.
pub fn bytes_per_second(prev: (Instant, u64), now: (Instant, u64)) -> Option<u64> {
    let elapsed = now.0.checked_duration_since(prev.0)?.as_secs_f64();
    if elapsed <= 0.0 {
        return None;
    }
    let delta = now.1.saturating_sub(prev.1);
    Some((delta as f64 / elapsed) as u64)
}

/// Derives a transfer rate from progress samples, ignoring samples that arrive
/// sooner than `min_interval` after the last accepted one.
#[derive(Debug, Clone)]
pub struct SpeedSampler {
    min_interval: Duration,
    last: Option<(Instant, u64)>,
    speed: Option<u64>,
}

impl Default for SpeedSampler {
    fn default() -> Self {
        Self::new(MIN_SAMPLE_INTERVAL)
    }
}

impl SpeedSampler {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
            speed: None,
        }
    }

    pub fn sample(&mut self, at: Instant, done: u64) -> Option<u64> {
        let Some(last) = self.last else {
            self.last = Some((at, done));
            return None;
        };
        if at.saturating_duration_since(last.0) < self.min_interval {
            return self.speed;
        }
        if done < last.1 {
            // Progress restarted (fallback resume); start over from here.
            self.last = Some((at, done));
            self.speed = None;
            return None;
        }
        self.speed = bytes_per_second(last, (at, done));
        self.last = Some((at, done));
        self.speed
    }

    pub fn speed(&self) -> Option<u64> {
        self.speed
    }

    /// Seconds left at the current speed.
    pub fn eta_secs(&self, done: u64, total: u64) -> Option<u64> {
        let speed = self.speed.filter(|speed| *speed > 0)?;
        Some(total.saturating_sub(done) / speed)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

pub fn format_duration(mut seconds: u64) -> String {
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_samples_do_not_update_speed() {
        let start = Instant::now();
        let mut sampler = SpeedSampler::default();
        assert_eq!(sampler.sample(start, 0), None);
        assert_eq!(sampler.sample(start + Duration::from_millis(200), 50_000), None);

        let speed = sampler.sample(start + Duration::from_secs(2), 200_000);
        assert_eq!(speed, Some(100_000));

        // A burst 100ms later keeps the previous estimate.
        assert_eq!(
            sampler.sample(start + Duration::from_millis(2100), 900_000),
            Some(100_000)
        );
        assert_eq!(sampler.eta_secs(200_000, 1_200_000), Some(10));
    }

    #[test]
    fn progress_reset_restarts_sampling() {
        let start = Instant::now();
        let mut sampler = SpeedSampler::default();
        sampler.sample(start, 5_000);
        assert_eq!(sampler.sample(start + Duration::from_secs(1), 1_000), None);
        assert_eq!(sampler.speed(), None);
    }

    #[test]
    fn formats_sizes_and_durations() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.50KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00MB");
        assert_eq!(format_duration(75), "01:15");
        assert_eq!(format_duration(3725), "01:02:05");
    }
}
