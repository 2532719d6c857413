//! Integration test: RenderTaskScheduler
//!
//! Drives the scheduler against an in-process submit backend whose queues
//! can be paused, so completion order is under test control.
//!
//! Run with: cargo test -p rgfx-core --test scheduler_test

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use rgfx_core::sync::{self, Submission};
use rgfx_core::{
    BatchState, CmdBatchDesc, FrameId, FrameListener, GfxError, Handle, HandleRegistry, QueueType,
    RenderTaskScheduler, SchedulerConfig, SemaphoreDep, SubmitBackend, SubmitMode,
};
use rgfx_protocol::ResourceType;

// ── Mock backend ────────────────────────────────────────────────────────

struct QueuedWork {
    waits: Vec<SemaphoreDep>,
    signals: Vec<SemaphoreDep>,
    fence: Option<Handle>,
}

#[derive(Default)]
struct MockState {
    values: HashMap<Handle, u64>,
    paused: [bool; QueueType::COUNT],
    queued: [VecDeque<QueuedWork>; QueueType::COUNT],
    submitted: Vec<(QueueType, Vec<Handle>)>,
}

impl MockState {
    fn reached(&self, dep: &SemaphoreDep) -> bool {
        self.values.get(&dep.semaphore).copied().unwrap_or(0) >= dep.value
    }

    /// Retire queued work in FIFO order per queue until nothing moves.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            for q in 0..QueueType::COUNT {
                while !self.paused[q] {
                    let ready = match self.queued[q].front() {
                        Some(work) => work.waits.iter().all(|d| self.reached(d)),
                        None => false,
                    };
                    if !ready {
                        break;
                    }
                    let Some(work) = self.queued[q].pop_front() else { break };
                    for signal in &work.signals {
                        let value = self.values.entry(signal.semaphore).or_insert(0);
                        *value = (*value).max(signal.value);
                    }
                    if let Some(fence) = work.fence {
                        self.values.insert(fence, 1);
                    }
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }
}

struct MockBackend {
    timeline: bool,
    handles: HandleRegistry<()>,
    state: Mutex<MockState>,
    changed: Condvar,
}

impl MockBackend {
    fn new(timeline: bool) -> Arc<Self> {
        Arc::new(Self {
            timeline,
            handles: HandleRegistry::new("mock", 1024),
            state: Mutex::new(MockState::default()),
            changed: Condvar::new(),
        })
    }

    fn command_buffer(&self) -> Handle {
        self.handles.allocate(ResourceType::CommandBuffer, ())
    }

    fn set_paused(&self, queue: QueueType, paused: bool) {
        let mut state = self.state.lock();
        state.paused[queue.index()] = paused;
        state.pump();
        self.changed.notify_all();
    }

    fn submissions(&self) -> Vec<(QueueType, Vec<Handle>)> {
        self.state.lock().submitted.clone()
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&MockState) -> bool) -> bool {
        let mut state = self.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        while !done(&state) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return done(&state);
            }
        }
        true
    }
}

impl SubmitBackend for MockBackend {
    fn supports_timeline(&self) -> bool {
        self.timeline
    }

    fn create_semaphore(&self) -> Result<Handle, GfxError> {
        Ok(self.handles.allocate(ResourceType::Semaphore, ()))
    }

    fn submit(&self, submission: &Submission<'_>) -> Result<(), GfxError> {
        let mut state = self.state.lock();
        state
            .submitted
            .push((submission.queue, submission.command_buffers.to_vec()));
        state.queued[submission.queue.index()].push_back(QueuedWork {
            waits: submission.waits.to_vec(),
            signals: submission.signals.to_vec(),
            fence: submission.fence,
        });
        state.pump();
        self.changed.notify_all();
        Ok(())
    }

    fn signaled_value(&self, semaphore: Handle) -> u64 {
        self.state.lock().values.get(&semaphore).copied().unwrap_or(0)
    }

    fn wait(&self, deps: &[SemaphoreDep], timeout: Duration) -> bool {
        self.wait_until(timeout, |state| deps.iter().all(|d| state.reached(d)))
    }

    fn create_fence(&self) -> Result<Handle, GfxError> {
        Ok(self.handles.allocate(ResourceType::Semaphore, ()))
    }

    fn is_fence_signaled(&self, fence: Handle) -> bool {
        self.signaled_value(fence) >= 1
    }

    fn wait_fence(&self, fence: Handle, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.values.get(&fence).copied().unwrap_or(0) >= 1)
    }
}

fn scheduler(backend: &Arc<MockBackend>, max_frames: u32, max_pending_batches: u32) -> RenderTaskScheduler {
    RenderTaskScheduler::new(
        backend.clone(),
        SchedulerConfig { max_frames, max_pending_batches },
    )
}

fn submit_one(
    sched: &RenderTaskScheduler,
    backend: &MockBackend,
    desc: CmdBatchDesc,
    mode: SubmitMode,
) -> rgfx_core::BatchId {
    let batch = sched.begin_cmd_batch(desc).expect("begin batch");
    let exe = sched.reserve_cmd_buffer(batch).expect("reserve");
    sched
        .commit_cmd_buffer(batch, exe, backend.command_buffer())
        .expect("commit");
    sched.end_recording_and_submit(batch, mode).expect("submit");
    batch
}

const SHORT: Duration = Duration::from_millis(30);
const LONG: Duration = Duration::from_secs(5);

// ── Frames ──────────────────────────────────────────────────────────────

#[test]
fn test_frames_in_flight_bound() {
    let backend = MockBackend::new(true);
    let sched = scheduler(&backend, 2, 4);

    for expected in 1..=2u64 {
        let frame = sched.begin_frame().expect("begin");
        assert_eq!(frame.unique(), expected);
        submit_one(&sched, &backend, CmdBatchDesc::new(QueueType::Graphics), SubmitMode::Immediately);
        sched.end_frame().expect("end");
    }
    assert_eq!(sched.frames_in_flight(), 2);

    // Frame 3 reuses frame 1's slot, which has not been retired.
    match sched.begin_frame() {
        Err(e) => assert!(e.is_validation(), "unexpected error {:?}", e),
        Ok(f) => panic!("begin_frame should fail, got {}", f),
    }

    assert_eq!(sched.wait_next_frame(LONG).expect("wait").map(|f| f.unique()), Some(1));
    assert_eq!(sched.begin_frame().expect("begin").unique(), 3);
}

#[test]
fn test_wait_next_frame_retires_one_per_call() {
    let backend = MockBackend::new(true);
    let sched = scheduler(&backend, 2, 4);

    // First cycle: nothing old enough to retire.
    sched.begin_frame().expect("begin");
    sched.end_frame().expect("end");
    assert_eq!(sched.wait_next_frame(LONG).expect("wait"), None);

    sched.begin_frame().expect("begin");
    sched.end_frame().expect("end");
    assert_eq!(sched.wait_next_frame(LONG).expect("wait").map(|f| f.unique()), Some(1));
    assert_eq!(sched.wait_next_frame(LONG).expect("wait"), None);
    assert_eq!(sched.frames_in_flight(), 1);
}

#[test]
fn test_wait_next_frame_timeout_has_no_side_effects() {
    let backend = MockBackend::new(true);
    let sched = scheduler(&backend, 2, 4);
    backend.set_paused(QueueType::Graphics, true);

    sched.begin_frame().expect("begin");
    let batch = submit_one(&sched, &backend, CmdBatchDesc::new(QueueType::Graphics), SubmitMode::Immediately);
    sched.end_frame().expect("end");
    sched.begin_frame().expect("begin");
    sched.end_frame().expect("end");

    match sched.wait_next_frame(SHORT) {
        Err(GfxError::Timeout(_)) => {}
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert_eq!(sched.frames_in_flight(), 2);
    assert_eq!(sched.batch_state(batch), Some(BatchState::Submitted));

    backend.set_paused(QueueType::Graphics, false);
    assert_eq!(sched.wait_next_frame(LONG).expect("wait").map(|f| f.unique()), Some(1));
    // Recycled with its frame.
    assert_eq!(sched.batch_state(batch), None);
    assert!(sched.is_batch_completed(batch));
}

#[test]
fn test_frame_listeners_notified() {
    #[derive(Default)]
    struct Counter {
        begun: AtomicUsize,
        retired: AtomicUsize,
    }
    impl FrameListener for Counter {
        fn on_begin_frame(&self, _frame: FrameId) {
            self.begun.fetch_add(1, Ordering::SeqCst);
        }
        fn on_frame_retired(&self, _frame: FrameId) {
            self.retired.fetch_add(1, Ordering::SeqCst);
        }
    }

    let backend = MockBackend::new(true);
    let sched = scheduler(&backend, 1, 4);
    let counter = Arc::new(Counter::default());
    sched.add_listener(counter.clone());

    for _ in 0..3 {
        sched.begin_frame().expect("begin");
        sched.end_frame().expect("end");
        sched.wait_next_frame(LONG).expect("wait");
    }
    assert_eq!(counter.begun.load(Ordering::SeqCst), 3);
    assert_eq!(counter.retired.load(Ordering::SeqCst), 3);
}

// ── Batches ─────────────────────────────────────────────────────────────

#[test]
fn test_submit_requires_all_reserved_committed() {
    let backend = MockBackend::new(true);
    let sched = scheduler(&backend, 2, 4);
    sched.begin_frame().expect("begin");

    let batch = sched.begin_cmd_batch(CmdBatchDesc::new(QueueType::Graphics)).expect("batch");
    let first = sched.reserve_cmd_buffer(batch).expect("reserve");
    let second = sched.reserve_cmd_buffer(batch).expect("reserve");
    assert_eq!((first, second), (0, 1));

    let late = backend.command_buffer();
    let early = backend.command_buffer();
    sched.commit_cmd_buffer(batch, second, late).expect("commit");

    let err = sched
        .end_recording_and_submit(batch, SubmitMode::Immediately)
        .expect_err("uncommitted slot must fail");
    assert!(err.is_validation());
    assert_eq!(sched.batch_state(batch), Some(BatchState::Recording));
    assert!(backend.submissions().is_empty());

    sched.commit_cmd_buffer(batch, first, early).expect("commit");
    sched
        .end_recording_and_submit(batch, SubmitMode::Immediately)
        .expect("submit");

    // Execution order follows reservation order, not commit order.
    assert_eq!(backend.submissions(), vec![(QueueType::Graphics, vec![early, late])]);
    assert!(sched.wait_batch(batch, LONG));
    assert_eq!(sched.batch_state(batch), Some(BatchState::Completed));
}

#[test]
fn test_pending_batch_limit() {
    let backend = MockBackend::new(true);
    let sched = scheduler(&backend, 2, 2);
    sched.begin_frame().expect("begin");

    sched.begin_cmd_batch(CmdBatchDesc::new(QueueType::AsyncTransfer)).expect("first");
    sched.begin_cmd_batch(CmdBatchDesc::new(QueueType::AsyncTransfer)).expect("second");
    match sched.begin_cmd_batch(CmdBatchDesc::new(QueueType::AsyncTransfer)) {
        Err(GfxError::ResourceExhausted(_)) => {}
        other => panic!("expected ResourceExhausted, got {:?}", other),
    }
    // Other queues have their own budget.
    sched.begin_cmd_batch(CmdBatchDesc::new(QueueType::Graphics)).expect("graphics");
}

#[test]
fn test_batch_requires_recording_frame() {
    let backend = MockBackend::new(true);
    let sched = scheduler(&backend, 2, 4);
    let err = sched
        .begin_cmd_batch(CmdBatchDesc::new(QueueType::Graphics))
        .expect_err("no frame");
    assert!(err.is_validation());
}

#[test]
fn test_skip_and_end_frame_cancel() {
    let backend = MockBackend::new(true);
    let sched = scheduler(&backend, 2, 4);
    sched.begin_frame().expect("begin");

    let skipped = sched.begin_cmd_batch(CmdBatchDesc::new(QueueType::Graphics)).expect("batch");
    sched.skip_cmd_batch(skipped).expect("skip");
    assert_eq!(sched.batch_state(skipped), None);
    assert!(sched.reserve_cmd_buffer(skipped).is_err());

    let abandoned = sched
        .begin_cmd_batch(CmdBatchDesc::new(QueueType::AsyncCompute).label("abandoned"))
        .expect("batch");
    sched.reserve_cmd_buffer(abandoned).expect("reserve");

    let completion = sched.end_frame().expect("end");
    assert!(completion.is_empty());
    assert!(backend.submissions().is_empty());
    assert!(sched.end_recording_and_submit(abandoned, SubmitMode::Immediately).is_err());
    assert_eq!(sched.batch_state(abandoned), None);
}

#[test]
fn test_deferred_batches_keep_invocation_order() {
    let backend = MockBackend::new(true);
    let sched = scheduler(&backend, 2, 4);
    sched.begin_frame().expect("begin");

    let a = submit_one(&sched, &backend, CmdBatchDesc::new(QueueType::Graphics), SubmitMode::Deferred);
    assert!(backend.submissions().is_empty());
    assert_eq!(sched.batch_state(a), Some(BatchState::Submitted));

    let b = submit_one(&sched, &backend, CmdBatchDesc::new(QueueType::Graphics), SubmitMode::Immediately);
    let c = submit_one(&sched, &backend, CmdBatchDesc::new(QueueType::Graphics), SubmitMode::Deferred);
    assert_eq!(backend.submissions().len(), 2);

    let completion = sched.end_frame().expect("end");
    assert_eq!(backend.submissions().len(), 3);
    assert_eq!(
        completion.queue(QueueType::Graphics),
        Some(sched.batch_semaphore(c).expect("semaphore"))
    );
    for batch in [a, b, c] {
        assert!(sched.wait_batch(batch, LONG));
    }
}

// ── Cross-queue dependency ──────────────────────────────────────────────

fn cross_queue_wait(timeline: bool) {
    let backend = MockBackend::new(timeline);
    let sched = scheduler(&backend, 2, 4);
    sched.begin_frame().expect("begin");

    backend.set_paused(QueueType::Graphics, true);
    let b1 = submit_one(&sched, &backend, CmdBatchDesc::new(QueueType::Graphics), SubmitMode::Immediately);
    let b1_done = sched.batch_semaphore(b1).expect("semaphore");

    let b2 = submit_one(
        &sched,
        &backend,
        CmdBatchDesc::new(QueueType::AsyncCompute).wait_on(b1_done),
        SubmitMode::Immediately,
    );

    assert!(!sched.wait_batch(b2, SHORT));
    assert!(!sched.is_batch_completed(b2));

    let resumer = {
        let backend = backend.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            backend.set_paused(QueueType::Graphics, false);
        })
    };
    assert!(sched.wait_batch(b2, LONG));
    resumer.join().expect("resumer thread panicked");

    assert!(sched.is_batch_completed(b1));
    assert!(sched.is_batch_completed(b2));
    sched.end_frame().expect("end");
    sched.wait_all(LONG).expect("wait all");
}

#[test]
fn test_cross_queue_wait_timeline() {
    cross_queue_wait(true);
}

#[test]
fn test_cross_queue_wait_emulated_timeline() {
    cross_queue_wait(false);
}

#[test]
fn test_output_dependency_signalled() {
    let backend = MockBackend::new(true);
    let sched = scheduler(&backend, 2, 4);
    sched.begin_frame().expect("begin");

    let external = backend.create_semaphore().expect("semaphore");
    let batch = sched.begin_cmd_batch(CmdBatchDesc::new(QueueType::AsyncTransfer)).expect("batch");
    sched
        .add_output_dependency(batch, SemaphoreDep::new(external, 7))
        .expect("output dep");
    sched.end_recording_and_submit(batch, SubmitMode::Immediately).expect("submit");

    assert!(backend.wait(&[SemaphoreDep::new(external, 7)], LONG));
    assert_eq!(backend.signaled_value(external), 7);
}

#[test]
fn test_deadline_clamps_unbounded_timeouts() {
    let start = std::time::Instant::now();
    let far = sync::deadline(Duration::MAX);
    assert!(far >= start + sync::MAX_WAIT);
    let near = sync::deadline(Duration::from_millis(5));
    assert!(near < start + Duration::from_secs(60));
}
