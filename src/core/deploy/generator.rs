use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::core::device;
use crate::core::error::Result;
use crate::log_status;

/// Bucket count of the time-phased generator. Must never change between
/// releases: a resumed campaign re-derives its bucket assignment from
/// the device ids, and a different count would reshuffle devices across
/// already-processed buckets.
pub const BUCKET_COUNT: u64 = 16_384;

/// Wall-clock source, injected so campaign timing is testable.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> f64;
    fn sleep(&self, seconds: f64);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    fn sleep(&self, seconds: f64) {
        if seconds > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(seconds));
        }
    }
}

/// Produces the target devices of one activity in scheduled chunks.
/// `wait` blocks until the chunk most recently yielded is due.
pub trait ChunkGenerator: Send {
    fn next_chunk(&mut self) -> Option<Vec<String>>;
    fn wait(&mut self);
}

/// Emits the whole target set at once. With `gated` set, the emission
/// is refused when the deploy start is closer than the safety buffer,
/// because the activity could not finish in time.
pub struct ImmediateGenerator {
    devices: Vec<String>,
    start_time: f64,
    safety_buffer: f64,
    gated: bool,
    emitted: bool,
    clock: Arc<dyn Clock>,
}

impl ImmediateGenerator {
    pub fn new(
        devices: Vec<String>,
        start_time: f64,
        safety_buffer: f64,
        gated: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ImmediateGenerator {
            devices,
            start_time,
            safety_buffer,
            gated,
            emitted: false,
            clock,
        }
    }
}

impl ChunkGenerator for ImmediateGenerator {
    fn next_chunk(&mut self) -> Option<Vec<String>> {
        if self.emitted {
            return None;
        }
        self.emitted = true;
        if self.gated {
            let lead = self.start_time - self.clock.now_unix();
            if lead <= self.safety_buffer {
                log_status!(
                    "deploy",
                    "only {:.0}s lead before the deploy start, skipping {} device(s)",
                    lead,
                    self.devices.len()
                );
                return None;
            }
        }
        Some(std::mem::take(&mut self.devices))
    }

    fn wait(&mut self) {}
}

/// Spreads the target set over the deploy span. Devices map to one of
/// `BUCKET_COUNT` time buckets by their id, so the schedule of a device
/// is stable across runs and phases.
pub struct OvertimeGenerator {
    buckets: Vec<Vec<String>>,
    cursor: usize,
    yielded_cursor: usize,
    deploy_start: f64,
    phase_start: f64,
    span: f64,
    safety_buffer: f64,
    gated: bool,
    clock: Arc<dyn Clock>,
}

impl OvertimeGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        devices: &[String],
        deploy_start: f64,
        phase_start: f64,
        span: f64,
        safety_buffer: f64,
        gated: bool,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut buckets = vec![Vec::new(); BUCKET_COUNT as usize];
        for id in devices {
            let bucket = (device::id_to_u64(id)? % BUCKET_COUNT) as usize;
            buckets[bucket].push(id.clone());
        }
        let occupied: Vec<usize> = buckets.iter().map(Vec::len).filter(|&n| n > 0).collect();
        log_status!(
            "deploy",
            "{} device(s) over {} bucket(s), sizes {}..{}",
            devices.len(),
            occupied.len(),
            occupied.iter().min().copied().unwrap_or(0),
            occupied.iter().max().copied().unwrap_or(0)
        );
        Ok(OvertimeGenerator {
            buckets,
            cursor: 0,
            yielded_cursor: 0,
            deploy_start,
            phase_start,
            span,
            safety_buffer,
            gated,
            clock,
        })
    }

    fn bucket_time(&self, cursor: usize, base: f64) -> f64 {
        base + (cursor as f64) * self.span / (BUCKET_COUNT as f64)
    }
}

impl ChunkGenerator for OvertimeGenerator {
    fn next_chunk(&mut self) -> Option<Vec<String>> {
        while self.cursor < self.buckets.len() {
            let cursor = self.cursor;
            self.cursor += 1;
            if self.buckets[cursor].is_empty() {
                continue;
            }
            if self.gated {
                let lead = self.bucket_time(cursor, self.deploy_start) - self.clock.now_unix();
                if lead <= self.safety_buffer {
                    log_status!(
                        "deploy",
                        "only {:.0}s lead before bucket {} deploys, stopping",
                        lead,
                        cursor
                    );
                    self.cursor = self.buckets.len();
                    return None;
                }
            }
            self.yielded_cursor = cursor;
            return Some(std::mem::take(&mut self.buckets[cursor]));
        }
        None
    }

    fn wait(&mut self) {
        let target = self.bucket_time(self.yielded_cursor, self.phase_start);
        let delay = target - self.clock.now_unix();
        if delay > 0.0 {
            log_status!(
                "deploy",
                "waiting {:.0}s for bucket {}",
                delay,
                self.yielded_cursor
            );
            self.clock.sleep(delay);
        }
    }
}

/// Adapts a generator's chunks to the executor's batch size: small
/// chunks accumulate to at least `min_size`, and the first `skip`
/// devices of the stream are dropped so a resumed campaign does not
/// repeat work.
pub struct ResizedChunks<G> {
    inner: G,
    min_size: usize,
    skip: usize,
    done: bool,
}

impl<G: ChunkGenerator> ResizedChunks<G> {
    pub fn new(inner: G, min_size: usize, skip: usize) -> Self {
        ResizedChunks {
            inner,
            min_size: min_size.max(1),
            skip,
            done: false,
        }
    }

    pub fn next_batch(&mut self) -> Option<Vec<String>> {
        if self.done {
            return None;
        }
        let mut batch = Vec::new();
        loop {
            match self.inner.next_chunk() {
                Some(chunk) => {
                    batch.extend(chunk);
                    if self.skip > 0 {
                        let drained = self.skip.min(batch.len());
                        batch.drain(..drained);
                        self.skip -= drained;
                    }
                    if self.skip == 0 && batch.len() >= self.min_size {
                        self.inner.wait();
                        return Some(batch);
                    }
                }
                None => {
                    self.done = true;
                    if batch.is_empty() {
                        return None;
                    }
                    self.inner.wait();
                    return Some(batch);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockClock {
        now: Mutex<f64>,
        slept: Mutex<Vec<f64>>,
    }

    impl MockClock {
        fn at(now: f64) -> Arc<Self> {
            Arc::new(MockClock {
                now: Mutex::new(now),
                slept: Mutex::new(Vec::new()),
            })
        }

        fn slept(&self) -> Vec<f64> {
            self.slept.lock().unwrap().clone()
        }
    }

    impl Clock for MockClock {
        fn now_unix(&self) -> f64 {
            *self.now.lock().unwrap()
        }

        fn sleep(&self, seconds: f64) {
            *self.now.lock().unwrap() += seconds;
            self.slept.lock().unwrap().push(seconds);
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("00000000{i:04x}")).collect()
    }

    #[test]
    fn immediate_emits_everything_once() {
        let clock = MockClock::at(0.0);
        let mut gen = ImmediateGenerator::new(ids(5), 10_000.0, 900.0, true, clock);
        assert_eq!(gen.next_chunk().unwrap().len(), 5);
        assert!(gen.next_chunk().is_none());
    }

    #[test]
    fn immediate_gate_refuses_late_start() {
        let clock = MockClock::at(9_500.0);
        let mut gen = ImmediateGenerator::new(ids(5), 10_000.0, 900.0, true, clock);
        assert!(gen.next_chunk().is_none());
    }

    #[test]
    fn ungated_immediate_ignores_the_clock() {
        let clock = MockClock::at(99_999.0);
        let mut gen = ImmediateGenerator::new(ids(5), 10_000.0, 900.0, false, clock);
        assert_eq!(gen.next_chunk().unwrap().len(), 5);
    }

    #[test]
    fn overtime_assignment_is_deterministic() {
        let devices = ids(50);
        let collect = |mut gen: OvertimeGenerator| {
            let mut out = Vec::new();
            while let Some(chunk) = gen.next_chunk() {
                out.push(chunk);
            }
            out
        };
        let a = collect(
            OvertimeGenerator::new(&devices, 0.0, 0.0, 3600.0, 0.0, false, MockClock::at(0.0))
                .unwrap(),
        );
        let b = collect(
            OvertimeGenerator::new(&devices, 0.0, 0.0, 3600.0, 0.0, false, MockClock::at(500.0))
                .unwrap(),
        );
        assert_eq!(a, b);
        assert_eq!(a.iter().map(Vec::len).sum::<usize>(), 50);
    }

    #[test]
    fn overtime_wait_targets_the_phase_start() {
        let clock = MockClock::at(0.0);
        let devices = vec![format!("{:012x}", BUCKET_COUNT / 2)];
        let mut gen = OvertimeGenerator::new(
            &devices,
            0.0,
            100.0,
            200.0,
            0.0,
            false,
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .unwrap();
        assert_eq!(gen.next_chunk().unwrap(), devices);
        gen.wait();
        // phase start 100 plus half the 200s span.
        assert_eq!(clock.slept(), vec![200.0]);
    }

    #[test]
    fn overtime_gate_stops_when_lead_time_is_gone() {
        let clock = MockClock::at(50_000.0);
        let mut gen =
            OvertimeGenerator::new(&ids(10), 0.0, 0.0, 3600.0, 900.0, true, clock).unwrap();
        assert!(gen.next_chunk().is_none());
    }

    struct ListGenerator {
        chunks: Vec<Vec<String>>,
    }

    impl ChunkGenerator for ListGenerator {
        fn next_chunk(&mut self) -> Option<Vec<String>> {
            if self.chunks.is_empty() {
                None
            } else {
                Some(self.chunks.remove(0))
            }
        }

        fn wait(&mut self) {}
    }

    #[test]
    fn resize_accumulates_to_the_minimum() {
        let inner = ListGenerator {
            chunks: ids(7).chunks(1).map(|c| c.to_vec()).collect(),
        };
        let mut resized = ResizedChunks::new(inner, 3, 0);
        assert_eq!(resized.next_batch().unwrap().len(), 3);
        assert_eq!(resized.next_batch().unwrap().len(), 3);
        assert_eq!(resized.next_batch().unwrap().len(), 1);
        assert!(resized.next_batch().is_none());
    }

    #[test]
    fn resize_skip_resumes_mid_stream() {
        let all = ids(10);
        let inner = ListGenerator {
            chunks: all.chunks(2).map(|c| c.to_vec()).collect(),
        };
        let mut resized = ResizedChunks::new(inner, 4, 5);
        let mut seen = Vec::new();
        while let Some(batch) = resized.next_batch() {
            seen.extend(batch);
        }
        assert_eq!(seen, all[5..].to_vec());
    }
}
