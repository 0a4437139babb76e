//! Update scheduler: a priority queue of per-source update tasks, drained
//! by a bounded pool of workers, driven by the five strategies in
//! [`strategy`].

pub mod strategy;

use crate::error::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tracing::{info, warn};

const DEFAULT_MAX_CONCURRENT_UPDATES: usize = 3;
const DURATION_WINDOW: usize = 100;
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// What the scheduler actually does when a source comes due: fetch,
/// parse, cache and merge. Implemented by the process wiring layer (C12),
/// which owns the C2-C5 components this touches.
#[async_trait]
pub trait UpdateExecutor: Send + Sync {
    async fn execute(&self, source_id: &str, cancelled: Arc<AtomicBool>) -> Result<(), CoreError>;
}

struct UpdateTask {
    source: String,
    priority: Priority,
    scheduled_time: DateTime<Utc>,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for UpdateTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.scheduled_time == other.scheduled_time
    }
}
impl Eq for UpdateTask {}

impl Ord for UpdateTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Priority first (BinaryHeap is a max-heap, so higher priority
        // should compare greater); then earlier scheduled time wins, so
        // its comparison is reversed relative to natural DateTime order.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.scheduled_time.cmp(&self.scheduled_time))
    }
}
impl PartialOrd for UpdateTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
struct CanonicalEntry {
    priority: Priority,
    scheduled_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub recent_durations: VecDeque<Duration>,
}

impl SchedulerStats {
    fn record_duration(&mut self, duration: Duration) {
        self.recent_durations.push_back(duration);
        if self.recent_durations.len() > DURATION_WINDOW {
            self.recent_durations.pop_front();
        }
    }
}

enum Command {
    Enqueue {
        source: String,
        priority: Priority,
        scheduled_time: DateTime<Utc>,
    },
    UpdateAll {
        priority: Priority,
        sources: Vec<String>,
    },
    Cancel {
        source: String,
    },
    Start,
    Pause,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Running,
    Paused,
}

#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Command>,
}

impl Scheduler {
    pub fn spawn(executor: Arc<dyn UpdateExecutor>, max_concurrent: Option<usize>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT_UPDATES)));
        let stats = Arc::new(parking_lot::Mutex::new(SchedulerStats::default()));
        tokio::spawn(run_scheduler(rx, executor, semaphore, stats));
        Self { tx }
    }

    pub fn enqueue(&self, source: impl Into<String>, priority: Priority) {
        let _ = self.tx.send(Command::Enqueue {
            source: source.into(),
            priority,
            scheduled_time: Utc::now(),
        });
    }

    pub fn update_all(&self, priority: Priority, sources: Vec<String>) {
        let _ = self.tx.send(Command::UpdateAll { priority, sources });
    }

    pub fn cancel(&self, source: impl Into<String>) {
        let _ = self.tx.send(Command::Cancel { source: source.into() });
    }

    pub fn start(&self) {
        let _ = self.tx.send(Command::Start);
    }

    pub fn pause(&self) {
        let _ = self.tx.send(Command::Pause);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}

async fn run_scheduler(
    mut rx: mpsc::UnboundedReceiver<Command>,
    executor: Arc<dyn UpdateExecutor>,
    semaphore: Arc<Semaphore>,
    stats: Arc<parking_lot::Mutex<SchedulerStats>>,
) {
    let mut heap: BinaryHeap<UpdateTask> = BinaryHeap::new();
    let mut canonical: HashMap<String, CanonicalEntry> = HashMap::new();
    let mut cancelled_flags: HashMap<String, Arc<AtomicBool>> = HashMap::new();
    let mut run_state = RunState::Stopped;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    None => return,
                    Some(Command::Enqueue { source, priority, scheduled_time }) => {
                        enqueue(&mut heap, &mut canonical, &mut cancelled_flags, source, priority, scheduled_time);
                        stats.lock().scheduled += 1;
                    }
                    Some(Command::UpdateAll { priority, sources }) => {
                        for source in sources {
                            enqueue(&mut heap, &mut canonical, &mut cancelled_flags, source, priority, Utc::now());
                            stats.lock().scheduled += 1;
                        }
                    }
                    Some(Command::Cancel { source }) => {
                        if let Some(flag) = cancelled_flags.get(&source) {
                            flag.store(true, AtomicOrdering::SeqCst);
                        }
                    }
                    Some(Command::Start) => run_state = RunState::Running,
                    Some(Command::Pause) => run_state = RunState::Paused,
                    Some(Command::Stop) => run_state = RunState::Stopped,
                }
            }
            _ = ticker.tick() => {
                if run_state != RunState::Running {
                    continue;
                }
                let now = Utc::now();
                while let Some(task) = pop_ready(&mut heap, &mut canonical, now) {
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            // No capacity right now; put the task back and
                            // wait for the next tick.
                            heap.push(task);
                            break;
                        }
                    };
                    let executor = executor.clone();
                    let stats = stats.clone();
                    let source = task.source.clone();
                    let cancelled = task.cancelled.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let started = std::time::Instant::now();
                        let outcome = executor.execute(&source, cancelled).await;
                        let mut stats = stats.lock();
                        stats.record_duration(started.elapsed());
                        match outcome {
                            Ok(()) => {
                                stats.completed += 1;
                                info!(source = %source, "rule source update completed");
                            }
                            Err(err) => {
                                stats.failed += 1;
                                warn!(source = %source, error = %err, "rule source update failed");
                            }
                        }
                    });
                }
            }
        }
    }
}

fn enqueue(
    heap: &mut BinaryHeap<UpdateTask>,
    canonical: &mut HashMap<String, CanonicalEntry>,
    cancelled_flags: &mut HashMap<String, Arc<AtomicBool>>,
    source: String,
    priority: Priority,
    scheduled_time: DateTime<Utc>,
) {
    let should_enqueue = match canonical.get(&source) {
        Some(existing) if existing.priority >= priority => false,
        _ => true,
    };
    if !should_enqueue {
        return;
    }
    canonical.insert(
        source.clone(),
        CanonicalEntry {
            priority,
            scheduled_time,
        },
    );
    let cancelled = cancelled_flags
        .entry(source.clone())
        .or_insert_with(|| Arc::new(AtomicBool::new(false)))
        .clone();
    cancelled.store(false, AtomicOrdering::SeqCst);
    heap.push(UpdateTask {
        source,
        priority,
        scheduled_time,
        cancelled,
    });
}

fn pop_ready(
    heap: &mut BinaryHeap<UpdateTask>,
    canonical: &mut HashMap<String, CanonicalEntry>,
    now: DateTime<Utc>,
) -> Option<UpdateTask> {
    loop {
        let top_due = matches!(heap.peek(), Some(task) if task.scheduled_time <= now);
        if !top_due {
            return None;
        }
        let task = heap.pop()?;
        match canonical.get(&task.source) {
            Some(entry) if entry.priority == task.priority && entry.scheduled_time == task.scheduled_time => {
                canonical.remove(&task.source);
                return Some(task);
            }
            _ => continue, // superseded by a later, higher-priority enqueue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(source: &str, priority: Priority, offset_secs: i64) -> UpdateTask {
        UpdateTask {
            source: source.to_string(),
            priority,
            scheduled_time: Utc::now() + chrono::Duration::seconds(offset_secs),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn higher_priority_pops_first() {
        let mut heap = BinaryHeap::new();
        heap.push(task("a", Priority::Low, 0));
        heap.push(task("b", Priority::High, 0));
        heap.push(task("c", Priority::Normal, 0));
        assert_eq!(heap.pop().unwrap().source, "b");
        assert_eq!(heap.pop().unwrap().source, "c");
        assert_eq!(heap.pop().unwrap().source, "a");
    }

    #[test]
    fn earlier_scheduled_time_breaks_priority_tie() {
        let mut heap = BinaryHeap::new();
        heap.push(task("later", Priority::Normal, 50));
        heap.push(task("sooner", Priority::Normal, 1));
        assert_eq!(heap.pop().unwrap().source, "sooner");
    }

    #[test]
    fn duplicate_enqueue_collapses_to_higher_priority() {
        let mut heap = BinaryHeap::new();
        let mut canonical = HashMap::new();
        let mut flags = HashMap::new();
        enqueue(&mut heap, &mut canonical, &mut flags, "a".into(), Priority::Low, Utc::now());
        enqueue(&mut heap, &mut canonical, &mut flags, "a".into(), Priority::High, Utc::now());

        let now = Utc::now() + chrono::Duration::seconds(1);
        let popped = pop_ready(&mut heap, &mut canonical, now).unwrap();
        assert_eq!(popped.priority, Priority::High);
        assert!(pop_ready(&mut heap, &mut canonical, now).is_none());
    }

    #[test]
    fn pop_ready_respects_not_yet_due_tasks() {
        let mut heap = BinaryHeap::new();
        let mut canonical = HashMap::new();
        let mut flags = HashMap::new();
        enqueue(&mut heap, &mut canonical, &mut flags, "future".into(), Priority::High, Utc::now() + chrono::Duration::seconds(60));

        assert!(pop_ready(&mut heap, &mut canonical, Utc::now()).is_none());
    }
}
