// Licensed under the Apache-2.0 license

use chrono::{DateTime, Utc};

/// Counters of the current (or last) flashing run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashStatistics {
    pub total_firmwares: usize,
    pub completed_firmwares: usize,
    pub truncated_firmwares: usize,
    pub total_bytes: u64,
    pub written_bytes: u64,
    pub error_count: u32,
    pub verify_warnings: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    /// Bytes per second over the whole run.
    pub throughput: u64,
}

impl FlashStatistics {
    pub fn begin(&mut self, total_firmwares: usize, total_bytes: u64) {
        *self = FlashStatistics {
            total_firmwares,
            total_bytes,
            start_time: Some(Utc::now()),
            ..Default::default()
        };
    }

    pub fn finish(&mut self) {
        let end = Utc::now();
        if let Some(start) = self.start_time {
            self.elapsed_ms = (end - start).num_milliseconds().max(0) as u64;
        }
        self.throughput = if self.elapsed_ms > 0 {
            self.written_bytes * 1000 / self.elapsed_ms
        } else {
            self.written_bytes
        };
        self.end_time = Some(end);
    }

    /// Percentage of all bytes of the run written so far.
    pub fn percent_written(&self) -> u8 {
        percent(self.written_bytes, self.total_bytes)
    }
}

pub(crate) fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_and_finish() {
        let mut stats = FlashStatistics {
            error_count: 3,
            ..Default::default()
        };
        stats.begin(2, 0x2000);
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.total_firmwares, 2);
        assert!(stats.start_time.is_some());

        stats.written_bytes = 0x1000;
        assert_eq!(stats.percent_written(), 50);
        stats.finish();
        assert!(stats.end_time.unwrap() >= stats.start_time.unwrap());
        assert!(stats.throughput > 0);
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(5, 3), 100);
    }
}
