use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::info;

use crate::metrics::{MetricSink, Record};
use crate::shutdown::ShutdownListener;

#[derive(Debug, Default)]
pub struct ThroughputCounter(AtomicU64);

impl ThroughputCounter {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// Emits one tick per `period` with the messages received since the last.
pub async fn report(
    counter: Arc<ThroughputCounter>,
    sink: MetricSink,
    period: Duration,
    mut shutdown: ShutdownListener,
) {
    let mut interval = time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = interval.tick() => {
                let count = counter.take();
                info!("Throughput: {} msg/s", count);
                sink.record(Record::throughput(count));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricKind, SinkOutputs};
    use crate::shutdown::Shutdown;

    #[test]
    fn take_resets_the_count() {
        let counter = ThroughputCounter::default();
        counter.hit();
        counter.hit();
        assert_eq!(counter.take(), 2);
        assert_eq!(counter.take(), 0);
    }

    #[tokio::test]
    async fn ticks_are_written_per_period() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("throughput.csv");
        let (sink, handle) =
            MetricSink::spawn(SinkOutputs::new().with(MetricKind::Throughput, Some(path.clone())));

        let counter = Arc::new(ThroughputCounter::default());
        for _ in 0..7 {
            counter.hit();
        }
        let shutdown = Shutdown::new();
        let task = tokio::spawn(report(
            counter.clone(),
            sink,
            Duration::from_millis(50),
            shutdown.listener(),
        ));
        time::sleep(Duration::from_millis(130)).await;
        shutdown.trigger();
        task.await.unwrap();
        handle.close().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<_> = content.lines().skip(1).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].ends_with(",7"));
        assert!(rows[1].ends_with(",0"));
    }
}
