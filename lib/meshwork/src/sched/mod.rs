//! Automation scheduler: cooperative periodic loops over the mesh state.
//!
//! All tasks run on one thread, so two ticks of the same task can never
//! overlap. A tick that overruns its interval makes the next tick start
//! immediately and bumps the task's skew counter. Reactive tasks
//! additionally receive typed mesh events between ticks.

pub mod cron;
pub mod filter;
pub mod tasks;
pub mod trigger;

pub use filter::NodeFilter;
pub use trigger::TriggerPattern;

use crate::events::MeshEvent;
use crate::session::RadioSession;
use crate::state::{AuditEntry, MeshState};
use ferrite::logging;
use ferrite::time::timestamp_millis;
use ferrite::NodeNum;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Shared environment handed to every task.
pub struct TaskContext {
    pub session: Arc<RadioSession>,
    pub log: logging::Logger,
}

impl TaskContext {
    #[inline]
    pub fn state(&self) -> &Arc<MeshState> {
        self.session.state()
    }

    /// Appends one audit trail entry for a task action.
    pub fn audit(&self, task: &str, target: Option<NodeNum>, outcome: &str, detail: Option<String>) {
        self.state().append_audit(AuditEntry {
            timestamp: timestamp_millis(),
            task: task.to_string(),
            target,
            outcome: outcome.to_string(),
            detail,
        });
    }
}

pub trait AutomationTask: Send {
    fn name(&self) -> &'static str;

    /// Current interval between ticks, or `None` while the task is
    /// disabled. Read from settings so changes apply without restart.
    fn schedule(&self, ctx: &TaskContext) -> Option<Duration>;

    fn tick(&mut self, ctx: &TaskContext);

    /// Reactive hook; called between ticks for every mesh event.
    fn on_event(&mut self, _ctx: &TaskContext, _event: &MeshEvent) {}
}

struct TaskSlot {
    task: Box<dyn AutomationTask>,
    next_due: Option<Instant>,
    skew: u64,
    ticks: u64,
}

pub struct Scheduler {
    ctx: TaskContext,
    slots: Vec<TaskSlot>,
    log: logging::Logger,
}

impl Scheduler {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(ctx: TaskContext, log: L) -> Scheduler {
        let sched_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Scheduler {
            ctx,
            slots: Vec::new(),
            log: sched_log,
        }
    }

    /// Registers the full production task set.
    pub fn with_default_tasks<'a, L: Into<Option<&'a logging::Logger>>>(
        ctx: TaskContext,
        log: L,
    ) -> Scheduler {
        let mut scheduler = Scheduler::new(ctx, log);

        scheduler.register(Box::new(tasks::traceroute::AutoTraceroute::new()));
        scheduler.register(Box::new(tasks::timesync::AutoTimeSync::new()));
        scheduler.register(Box::new(tasks::keyrepair::AutoKeyRepair::new()));
        scheduler.register(Box::new(tasks::adminscan::RemoteAdminScanner::new()));
        scheduler.register(Box::new(tasks::announce::AutoAnnounce::new()));
        scheduler.register(Box::new(tasks::welcome::AutoWelcome::new()));
        scheduler.register(Box::new(tasks::responder::AutoResponder::new()));
        scheduler.register(Box::new(tasks::timers::TimerTriggers::new()));
        scheduler.register(Box::new(tasks::geofence::GeofenceTriggers::new()));
        scheduler.register(Box::new(tasks::maintenance::Maintenance::new()));

        scheduler
    }

    pub fn register(&mut self, task: Box<dyn AutomationTask>) {
        logging::debug!(self.log, "task registered";
                        "context" => "register",
                        "task" => task.name());

        self.slots.push(TaskSlot {
            task,
            next_due: None,
            skew: 0,
            ticks: 0,
        });
    }

    /// Runs every due task once. Ticks are strictly sequential.
    pub fn step(&mut self, now: Instant) {
        for slot in &mut self.slots {
            let interval = match slot.task.schedule(&self.ctx) {
                Some(interval) => interval,
                None => {
                    // Disabled tasks forget their cursor so re-enabling
                    // fires promptly.
                    slot.next_due = None;
                    continue;
                }
            };

            let due = slot.next_due.map_or(true, |due| now >= due);

            if !due {
                continue;
            }

            let started = Instant::now();
            slot.task.tick(&self.ctx);
            let elapsed = started.elapsed();

            slot.ticks += 1;

            if elapsed > interval {
                slot.skew += 1;
                slot.next_due = Some(Instant::now());

                logging::warn!(self.log, "task tick overran its interval";
                               "context" => "step",
                               "task" => slot.task.name(),
                               "elapsed_ms" => elapsed.as_millis() as u64,
                               "skew" => slot.skew);
            } else {
                slot.next_due = Some(started + interval);
            }
        }
    }

    /// Fans one mesh event out to every task.
    pub fn dispatch(&mut self, event: &MeshEvent) {
        for slot in &mut self.slots {
            slot.task.on_event(&self.ctx, event);
        }
    }

    pub fn skew_of(&self, name: &str) -> u64 {
        self.slots
            .iter()
            .find(|slot| slot.task.name() == name)
            .map_or(0, |slot| slot.skew)
    }

    pub fn ticks_of(&self, name: &str) -> u64 {
        self.slots
            .iter()
            .find(|slot| slot.task.name() == name)
            .map_or(0, |slot| slot.ticks)
    }

    /// Spawns the scheduler loop. The stop flag is checked between
    /// submissions, never mid-submission.
    pub fn run(
        mut self,
        events: Receiver<MeshEvent>,
        stop: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || loop {
                if stop.load(Ordering::SeqCst) {
                    return;
                }

                // Drain events first so reactive tasks observe traffic
                // promptly, then run due periodic work.
                match events.recv_timeout(Duration::from_millis(500)) {
                    Ok(event) => {
                        self.dispatch(&event);

                        while let Ok(event) = events.try_recv() {
                            if stop.load(Ordering::SeqCst) {
                                return;
                            }
                            self.dispatch(&event);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }

                if stop.load(Ordering::SeqCst) {
                    return;
                }

                self.step(Instant::now());
            })
            .expect("Error spawning scheduler thread")
    }
}

#[cfg(test)]
mod sched_tests {
    use super::*;
    use crate::testutil::{complete_capture, harness, teardown, wait_for_ready};
    use std::sync::Mutex;

    struct RecordingTask {
        name: &'static str,
        interval: Duration,
        work: Duration,
        spans: Arc<Mutex<Vec<(Instant, Instant)>>>,
    }

    impl AutomationTask for RecordingTask {
        fn name(&self) -> &'static str {
            self.name
        }

        fn schedule(&self, _ctx: &TaskContext) -> Option<Duration> {
            Some(self.interval)
        }

        fn tick(&mut self, _ctx: &TaskContext) {
            let start = Instant::now();
            thread::sleep(self.work);
            self.spans.lock().unwrap().push((start, Instant::now()));
        }
    }

    fn test_ctx() -> (TaskContext, crate::testutil::Harness) {
        let mut h = harness();
        complete_capture(&mut h.remote);
        wait_for_ready(&h);

        let ctx = TaskContext {
            session: h.session.clone(),
            log: logging::discard(),
        };

        (ctx, h)
    }

    #[test]
    fn test_ticks_never_overlap_even_when_overrunning() {
        let (ctx, h) = test_ctx();
        let spans = Arc::new(Mutex::new(Vec::new()));

        let mut scheduler = Scheduler::new(ctx, None);
        scheduler.register(Box::new(RecordingTask {
            name: "slow",
            interval: Duration::from_millis(10),
            work: Duration::from_millis(40),
            spans: spans.clone(),
        }));

        for _ in 0..4 {
            scheduler.step(Instant::now());
        }

        let spans = spans.lock().unwrap();
        assert_eq!(spans.len(), 4);

        for pair in spans.windows(2) {
            // Each tick starts only after the previous one ended.
            assert!(pair[1].0 >= pair[0].1);
        }

        // Every tick overran the 10ms interval.
        assert_eq!(scheduler.skew_of("slow"), 4);

        teardown(h);
    }

    #[test]
    fn test_interval_respected_when_fast() {
        let (ctx, h) = test_ctx();
        let spans = Arc::new(Mutex::new(Vec::new()));

        let mut scheduler = Scheduler::new(ctx, None);
        scheduler.register(Box::new(RecordingTask {
            name: "fast",
            interval: Duration::from_secs(3600),
            work: Duration::from_millis(1),
            spans: spans.clone(),
        }));

        let now = Instant::now();
        scheduler.step(now);
        scheduler.step(now + Duration::from_millis(5));

        // Second step was before the next due time: one tick only.
        assert_eq!(spans.lock().unwrap().len(), 1);
        assert_eq!(scheduler.skew_of("fast"), 0);
        assert_eq!(scheduler.ticks_of("fast"), 1);

        teardown(h);
    }

    struct CountingTask {
        enabled: Arc<Mutex<bool>>,
        count: Arc<Mutex<usize>>,
    }

    impl AutomationTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn schedule(&self, _ctx: &TaskContext) -> Option<Duration> {
            if *self.enabled.lock().unwrap() {
                Some(Duration::from_secs(3600))
            } else {
                None
            }
        }

        fn tick(&mut self, _ctx: &TaskContext) {
            *self.count.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_disabled_task_never_ticks() {
        let (ctx, h) = test_ctx();
        let enabled = Arc::new(Mutex::new(false));
        let count = Arc::new(Mutex::new(0));

        let mut scheduler = Scheduler::new(ctx, None);
        scheduler.register(Box::new(CountingTask {
            enabled: enabled.clone(),
            count: count.clone(),
        }));

        scheduler.step(Instant::now());
        assert_eq!(*count.lock().unwrap(), 0);

        *enabled.lock().unwrap() = true;
        scheduler.step(Instant::now());
        assert_eq!(*count.lock().unwrap(), 1);

        teardown(h);
    }
}
