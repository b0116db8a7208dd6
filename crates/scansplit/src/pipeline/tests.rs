use super::{
    Pipeline, PipelineHandle, Source, StageState, chunk::ChunkStage, lifecycle::StageMonitor,
};
use crate::{
    Batch, Error, MemoryQueue, PipelineConfig, Protocol, Queue, QueueError, RetryPolicy, Target,
    WorkUnit,
};
use core::{num::NonZeroUsize, time::Duration};
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep, timeout},
};
use tokio_util::sync::CancellationToken;

type PushHook = Box<dyn Fn(usize) + Send + Sync>;

/// How [`RecordingQueue::depth`] answers.
#[derive(Default)]
enum DepthProbe {
    #[default]
    Immediate,
    /// Answers after a delay.
    Slow(Duration),
    /// Never answers.
    Hung,
    /// Fails this many times, then answers immediately.
    Failing(AtomicUsize),
}

/// Records every push with its timestamp. Can be told to fail, to report a
/// fixed depth, to misbehave on depth probes, or to run a hook after the n-th
/// successful push.
#[derive(Default)]
struct RecordingQueue {
    pushes: Mutex<Vec<(Instant, WorkUnit)>>,
    failures_left: AtomicUsize,
    always_fail: bool,
    depth: AtomicUsize,
    probe: DepthProbe,
    closes: AtomicUsize,
    on_push: Mutex<Option<PushHook>>,
}

impl RecordingQueue {
    fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    fn flaky(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    fn probing(probe: DepthProbe) -> Self {
        Self {
            probe,
            ..Self::default()
        }
    }

    fn push_count(&self) -> usize {
        self.pushes.lock().len()
    }

    fn units(&self) -> Vec<WorkUnit> {
        self.pushes.lock().iter().map(|(_, u)| u.clone()).collect()
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Queue for RecordingQueue {
    async fn push(&self, _topic: &str, unit: &WorkUnit) -> Result<(), QueueError> {
        if self.always_fail {
            return Err(QueueError::Unavailable("broker down".to_owned()));
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QueueError::Rejected("try again".to_owned()));
        }

        let n = {
            let mut pushes = self.pushes.lock();
            pushes.push((Instant::now(), unit.clone()));
            pushes.len()
        };
        if let Some(hook) = self.on_push.lock().as_ref() {
            hook(n);
        }
        Ok(())
    }

    async fn depth(&self, _topic: &str) -> Result<usize, QueueError> {
        match &self.probe {
            DepthProbe::Immediate => {}
            DepthProbe::Slow(delay) => sleep(*delay).await,
            DepthProbe::Hung => core::future::pending::<()>().await,
            DepthProbe::Failing(left) => {
                if left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(QueueError::Unavailable("depth unknown".to_owned()));
                }
            }
        }
        Ok(self.depth.load(Ordering::SeqCst))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn targets(n: usize) -> Vec<Target> {
    (0..n).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect()
}

fn config(protocols: &[&str], ports: &str) -> PipelineConfig {
    PipelineConfig {
        ports: ports.parse().unwrap(),
        protocols: protocols.iter().map(|p| p.parse().unwrap()).collect(),
        admission_poll_interval: Duration::from_millis(5),
        retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        },
        ..PipelineConfig::default()
    }
}

fn assert_all_closed<Q: Queue>(handle: &PipelineHandle<Q>) {
    let states = handle.stage_states();
    assert!(!states.is_empty());
    for (name, state) in states {
        assert_eq!(state, StageState::Closed, "stage {name} not closed");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn million_targets_split_into_ten_ordered_batches() {
    let cancel = CancellationToken::new();
    let (src_tx, src_rx) = mpsc::channel(1024);
    let (out_tx, mut out_rx) = mpsc::channel(2);

    let source = Source::new(
        (0..1_000_000).map(|i: u32| i.to_string()).collect(),
        cancel.clone(),
    );
    let chunker = ChunkStage::new(
        NonZeroUsize::new(100_000).unwrap(),
        |batch: Batch<Target>| batch,
        cancel,
    );
    tokio::spawn(source.run(src_tx, StageMonitor::detached()));
    tokio::spawn(chunker.run(src_rx, out_tx, StageMonitor::detached()));

    let mut batches = 0;
    let mut next = 0_u32;
    while let Some(batch) = out_rx.recv().await {
        assert_eq!(batch.len(), 100_000);
        for target in &batch {
            assert_eq!(*target, next.to_string());
            next += 1;
        }
        batches += 1;
    }
    assert_eq!(batches, 10);
    assert_eq!(next, 1_000_000);
}

#[tokio::test]
async fn thousand_ports_split_into_three_full_and_one_short() {
    let queue = Arc::new(RecordingQueue::default());
    let config = PipelineConfig {
        port_chunk_size: 300,
        ..config(&["tcp"], "1-1000")
    };

    let report = Pipeline::run(targets(3), config, Arc::clone(&queue))
        .await
        .unwrap();

    let lens: Vec<_> = queue
        .units()
        .iter()
        .map(|u| u.ports.as_ref().map(Vec::len).unwrap())
        .collect();
    assert_eq!(lens, vec![300, 300, 300, 100]);
    assert_eq!(report.target_batches, 1);
    assert_eq!(report.port_batches, 4);
    assert!(!report.cancelled);
}

#[tokio::test]
async fn port_scoped_and_portless_units_per_combination() {
    let queue = Arc::new(RecordingQueue::default());
    let config = PipelineConfig {
        target_chunk_size: 2,
        ..config(&["tcp", "icmp"], "22,80")
    };

    let report = Pipeline::run(targets(4), config, Arc::clone(&queue))
        .await
        .unwrap();

    let units = queue.units();
    assert_eq!(units.len(), 4);
    for batch in targets(4).chunks(2) {
        let matching: Vec<_> = units.iter().filter(|u| u.targets == batch).collect();
        assert_eq!(matching.len(), 2);
        let tcp = matching.iter().find(|u| u.protocol == "tcp").unwrap();
        let icmp = matching.iter().find(|u| u.protocol == "icmp").unwrap();
        assert_eq!(tcp.ports, Some(vec![22, 80]));
        assert_eq!(icmp.ports, None);
    }
    assert_eq!(report.delivered.get("tcp"), Some(&2));
    assert_eq!(report.delivered.get("icmp"), Some(&2));
}

#[tokio::test]
async fn portless_units_do_not_multiply_with_port_chunks() {
    let queue = Arc::new(RecordingQueue::default());
    let config = PipelineConfig {
        target_chunk_size: 8,
        port_chunk_size: 3,
        ..config(&["tcp", "icmp"], "1-10")
    };

    let report = Pipeline::run(targets(8), config, Arc::clone(&queue))
        .await
        .unwrap();

    assert_eq!(report.delivered.get("tcp"), Some(&4));
    assert_eq!(report.delivered.get("icmp"), Some(&1));
    assert_eq!(report.units_emitted, 5);
}

#[tokio::test]
async fn every_combination_is_delivered_exactly_once() {
    let queue = Arc::new(RecordingQueue::default());
    let config = PipelineConfig {
        target_chunk_size: 5,
        port_chunk_size: 30,
        handoff_capacity: 1,
        ..config(&["tcp", "udp", "icmp"], "1-100")
    };
    let input = targets(37);

    let pipeline = Pipeline::spawn(input.clone(), config, Arc::clone(&queue)).unwrap();
    let handle = pipeline.handle();
    let report = pipeline.wait().await.unwrap();

    assert_eq!(report.target_batches, 8);
    assert_eq!(report.port_batches, 32);
    assert_eq!(report.units_emitted, 72);
    assert_eq!(
        report.delivered,
        BTreeMap::from([
            ("icmp".to_owned(), 8),
            ("tcp".to_owned(), 32),
            ("udp".to_owned(), 32),
        ])
    );
    assert_all_closed(&handle);

    let units = queue.units();
    for protocol in ["tcp", "udp"] {
        let mut seen = HashSet::new();
        for unit in units.iter().filter(|u| u.protocol == protocol) {
            assert!(unit.targets.len() <= 5 && unit.ports.as_ref().unwrap().len() <= 30);
            for target in &unit.targets {
                for port in unit.ports.as_ref().unwrap() {
                    assert!(seen.insert((target.clone(), *port)), "duplicate probe");
                }
            }
        }
        assert_eq!(seen.len(), 37 * 100);
    }

    let icmp_targets: Vec<_> = units
        .iter()
        .filter(|u| u.protocol == "icmp")
        .flat_map(|u| u.targets.clone())
        .collect();
    assert_eq!(icmp_targets, input);
    assert_eq!(queue.closes(), 1);
}

#[tokio::test]
async fn cancel_after_two_pushes_stops_promptly() {
    let queue = Arc::new(RecordingQueue::default());
    let config = PipelineConfig {
        target_chunk_size: 1,
        ..config(&["icmp"], "80")
    };

    let pipeline = Pipeline::spawn(targets(10), config, Arc::clone(&queue)).unwrap();
    let handle = pipeline.handle();
    *queue.on_push.lock() = Some(Box::new(move |n| {
        if n == 2 {
            handle.cancel();
        }
    }));

    let report = timeout(Duration::from_secs(5), pipeline.wait())
        .await
        .expect("wait should return promptly after cancellation")
        .unwrap();
    let returned_at = Instant::now();

    assert!(report.cancelled);
    assert_eq!(queue.push_count(), 2);
    assert_eq!(report.total_delivered(), 2);

    sleep(Duration::from_millis(50)).await;
    let pushes = queue.pushes.lock();
    assert_eq!(pushes.len(), 2);
    assert!(pushes.iter().all(|(at, _)| *at <= returned_at));
}

#[tokio::test(start_paused = true)]
async fn sink_holds_back_at_watermark() {
    let queue = Arc::new(MemoryQueue::new());
    let config = PipelineConfig {
        target_chunk_size: 1,
        watermark: 3,
        ..config(&["icmp"], "80")
    };

    let pipeline = Pipeline::spawn(targets(20), config, Arc::clone(&queue)).unwrap();
    let handle = pipeline.handle();

    sleep(Duration::from_millis(200)).await;
    assert_eq!(queue.len("icmp"), 3);
    assert!(!handle.is_cancelled());

    let consumer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut consumed = 0;
            let mut max_depth = 0;
            loop {
                max_depth = max_depth.max(queue.len("icmp"));
                let Some(_) = queue.recv("icmp").await else {
                    break;
                };
                consumed += 1;
                sleep(Duration::from_millis(1)).await;
            }
            (consumed, max_depth)
        })
    };

    let report = pipeline.wait().await.unwrap();
    assert_eq!(report.total_delivered(), 20);

    let (consumed, max_depth) = consumer.await.unwrap();
    assert_eq!(consumed, 20);
    assert!(max_depth <= 3, "depth {max_depth} exceeded watermark");
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_run() {
    let queue = Arc::new(RecordingQueue::failing());
    let pipeline = Pipeline::spawn(targets(50), config(&["icmp"], "80"), Arc::clone(&queue)).unwrap();
    let handle = pipeline.handle();

    let err = pipeline.wait().await.unwrap_err();
    match err {
        Error::PushFailed {
            topic,
            attempts,
            source,
        } => {
            assert_eq!(topic, "icmp");
            assert_eq!(attempts, 3);
            assert_eq!(source, QueueError::Unavailable("broker down".to_owned()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(handle.is_cancelled());
    assert_eq!(queue.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_without_duplicates() {
    let queue = Arc::new(RecordingQueue::flaky(2));
    let config = PipelineConfig {
        target_chunk_size: 1,
        ..config(&["icmp"], "80")
    };

    let report = Pipeline::run(targets(5), config, Arc::clone(&queue))
        .await
        .unwrap();

    assert_eq!(report.total_delivered(), 5);
    let delivered: Vec<_> = queue.units().into_iter().flat_map(|u| u.targets).collect();
    assert_eq!(delivered, targets(5));
}

#[tokio::test(start_paused = true)]
async fn tidy_twice_cleans_up_once() {
    let queue = Arc::new(RecordingQueue::default());
    queue.depth.store(usize::MAX, Ordering::SeqCst);

    let pipeline = Pipeline::spawn(targets(100), config(&["tcp", "icmp"], "1-1024"), Arc::clone(&queue))
        .unwrap();
    let handle = pipeline.handle();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.push_count(), 0);

    handle.tidy().await;
    let after_first = (handle.is_cancelled(), queue.closes());
    handle.tidy().await;
    pipeline.tidy().await;
    assert_eq!((handle.is_cancelled(), queue.closes()), after_first);
    assert_eq!(after_first, (true, 1));
    assert!(handle.stage_states().is_empty());

    let report = timeout(Duration::from_secs(5), pipeline.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.total_delivered(), 0);
    assert_eq!(queue.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_depth_probe_prevents_push() {
    let queue = Arc::new(RecordingQueue::probing(DepthProbe::Slow(
        Duration::from_millis(100),
    )));
    let config = PipelineConfig {
        target_chunk_size: 1,
        ..config(&["icmp"], "80")
    };

    let pipeline = Pipeline::spawn(targets(5), config, Arc::clone(&queue)).unwrap();
    let handle = pipeline.handle();

    sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let report = timeout(Duration::from_secs(5), pipeline.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.total_delivered(), 0);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(queue.push_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn tidy_unblocks_a_hung_depth_probe() {
    let queue = Arc::new(RecordingQueue::probing(DepthProbe::Hung));
    let pipeline =
        Pipeline::spawn(targets(5), config(&["tcp", "icmp"], "1-10"), Arc::clone(&queue))
            .unwrap();
    let handle = pipeline.handle();

    sleep(Duration::from_millis(10)).await;
    handle.tidy().await;

    let report = timeout(Duration::from_secs(30), pipeline.wait())
        .await
        .expect("wait should return once tidied")
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(queue.push_count(), 0);
    assert_eq!(queue.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_depth_probes_use_the_retry_budget() {
    let queue = Arc::new(RecordingQueue::probing(DepthProbe::Failing(
        AtomicUsize::new(usize::MAX),
    )));
    let pipeline = Pipeline::spawn(targets(3), config(&["icmp"], "80"), Arc::clone(&queue)).unwrap();

    match pipeline.wait().await.unwrap_err() {
        Error::PushFailed {
            attempts, source, ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(source, QueueError::Unavailable("depth unknown".to_owned()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(queue.push_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_depth_failures_are_retried() {
    let queue = Arc::new(RecordingQueue::probing(DepthProbe::Failing(
        AtomicUsize::new(2),
    )));
    let config = PipelineConfig {
        target_chunk_size: 1,
        ..config(&["icmp"], "80")
    };

    let report = Pipeline::run(targets(4), config, Arc::clone(&queue))
        .await
        .unwrap();

    assert_eq!(report.total_delivered(), 4);
    assert_eq!(queue.push_count(), 4);
}

#[tokio::test]
async fn natural_completion_closes_every_stage() {
    let queue = Arc::new(MemoryQueue::new());
    let pipeline = Pipeline::spawn(targets(10), config(&["tcp", "icmp"], "1-10"), Arc::clone(&queue))
        .unwrap();
    let handle = pipeline.handle();

    let report = pipeline.wait().await.unwrap();
    assert!(!report.cancelled);
    assert_all_closed(&handle);
    assert!(queue.is_closed());

    // Tidy after a clean drain has nothing left to release.
    handle.tidy().await;
    assert_eq!(queue.drain("tcp").len(), 1);
}

#[tokio::test]
async fn rejects_empty_input_and_bad_config() {
    let queue = Arc::new(MemoryQueue::new());
    let err = Pipeline::spawn(Vec::new(), config(&["icmp"], "80"), Arc::clone(&queue))
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidConfig { .. }));

    let bad = PipelineConfig {
        protocols: vec![Protocol::with_ports("tcp")],
        ..PipelineConfig::default()
    };
    let err = Pipeline::spawn(targets(1), bad, queue).err().unwrap();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}
