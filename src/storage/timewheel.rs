//! Delay Scheduler and Hashed Time Wheel
//!
//! The database never sleeps on a key. When a TTL is set it hands a named
//! callback to a [`DelayScheduler`], and the scheduler runs it once the deadline
//! has passed. Re-scheduling under the same name replaces the pending callback,
//! and `cancel` drops it.
//!
//! ## Time Wheel
//!
//! [`TimeWheel`] is the production scheduler. Tasks live in a ring of slots;
//! a background Tokio task advances one slot per tick and fires whatever is
//! due in it. A task further away than one revolution carries a `circle`
//! count that is decremented on each pass.
//!
//! ```text
//!            position
//!               │
//!       ┌───┬───▼───┬───┬───┬───┬───┬───┐
//!       │ 0 │ 1 │ 2 │ 3 │ 4 │ 5 │ 6 │ 7 │   one slot per tick
//!       └───┴───┴─┬─┴───┴───┴───┴───┴───┘
//!                 │
//!          {"expire:0:a": circle 0, "expire:3:b": circle 2}
//! ```
//!
//! Callers talk to the wheel through an unbounded channel, so scheduling from
//! synchronous code (while holding key locks) never blocks. Due callbacks run
//! on Tokio's blocking pool because they take blocking locks themselves.

use bytes::Bytes;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

/// A callback run by the scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run named callbacks at an absolute time.
pub trait DelayScheduler: Send + Sync {
    /// Runs `task` at or after `at`. Replaces any pending task named `name`.
    fn schedule_at(&self, at: SystemTime, name: Bytes, task: Task);

    /// Drops the pending task named `name`, if any.
    fn cancel(&self, name: &[u8]);
}

/// Configuration for the time wheel.
#[derive(Debug, Clone)]
pub struct TimeWheelConfig {
    /// Duration of one tick (default: 10ms)
    pub interval: Duration,

    /// Number of slots in one revolution (default: 1024)
    pub slots: usize,
}

impl Default for TimeWheelConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10),
            slots: 1024,
        }
    }
}

enum Command {
    Schedule { delay: Duration, name: Bytes, task: Task },
    Cancel { name: Bytes },
}

struct Pending {
    circle: usize,
    task: Task,
}

/// The slot ring, free of any runtime so it can be driven tick by tick.
struct Wheel {
    interval: Duration,
    slots: Vec<HashMap<Bytes, Pending>>,
    /// task name -> slot holding it
    locations: HashMap<Bytes, usize>,
    /// Slot fired by the next tick.
    position: usize,
}

impl Wheel {
    fn new(interval: Duration, slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            interval: interval.max(Duration::from_millis(1)),
            slots: (0..slots).map(|_| HashMap::new()).collect(),
            locations: HashMap::new(),
            position: 0,
        }
    }

    /// Ticks needed for `delay` to elapse, rounded up so tasks never fire early.
    fn ticks_for(&self, delay: Duration) -> usize {
        let interval = self.interval.as_nanos();
        delay.as_nanos().div_ceil(interval) as usize
    }

    fn add(&mut self, delay: Duration, name: Bytes, task: Task) {
        self.remove(&name);

        let ticks = self.ticks_for(delay);
        let slot = (self.position + ticks) % self.slots.len();
        let circle = ticks / self.slots.len();

        self.slots[slot].insert(name.clone(), Pending { circle, task });
        self.locations.insert(name, slot);
    }

    fn remove(&mut self, name: &[u8]) -> bool {
        match self.locations.remove(name) {
            Some(slot) => self.slots[slot].remove(name).is_some(),
            None => false,
        }
    }

    /// Advances one tick and returns the tasks that became due.
    fn advance(&mut self) -> Vec<Task> {
        let slot = &mut self.slots[self.position];
        let due: Vec<Bytes> = slot
            .iter_mut()
            .filter_map(|(name, pending)| {
                if pending.circle == 0 {
                    Some(name.clone())
                } else {
                    pending.circle -= 1;
                    None
                }
            })
            .collect();

        let mut tasks = Vec::with_capacity(due.len());
        for name in due {
            if let Some(pending) = slot.remove(&name) {
                self.locations.remove(&name);
                tasks.push(pending.task);
            }
        }

        self.position = (self.position + 1) % self.slots.len();
        tasks
    }

    fn len(&self) -> usize {
        self.locations.len()
    }
}

/// A handle to the running time wheel.
///
/// When this handle is dropped, the wheel task stops and pending tasks are
/// discarded.
#[derive(Debug)]
pub struct TimeWheel {
    commands: mpsc::UnboundedSender<Command>,
    shutdown_tx: watch::Sender<bool>,
}

impl TimeWheel {
    /// Starts the wheel as a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: TimeWheelConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            interval_ms = config.interval.as_millis(),
            slots = config.slots,
            "Time wheel started"
        );
        tokio::spawn(wheel_loop(config, commands_rx, shutdown_rx));

        Self {
            commands,
            shutdown_tx,
        }
    }

    /// Runs `task` after `delay`. Replaces any pending task named `name`.
    pub fn schedule_after(&self, delay: Duration, name: Bytes, task: Task) {
        let _ = self.commands.send(Command::Schedule { delay, name, task });
    }

    /// Stops the wheel.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl DelayScheduler for TimeWheel {
    fn schedule_at(&self, at: SystemTime, name: Bytes, task: Task) {
        let delay = at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        self.schedule_after(delay, name, task);
    }

    fn cancel(&self, name: &[u8]) {
        let _ = self.commands.send(Command::Cancel {
            name: Bytes::copy_from_slice(name),
        });
    }
}

impl Drop for TimeWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The wheel's driving loop.
async fn wheel_loop(
    config: TimeWheelConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut wheel = Wheel::new(config.interval, config.slots);
    let mut ticker = tokio::time::interval(wheel.interval);
    // catching up in a burst would fire tasks ahead of their deadline
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let due = wheel.advance();
                if !due.is_empty() {
                    trace!(fired = due.len(), pending = wheel.len(), "Time wheel tick");
                }
                for task in due {
                    tokio::task::spawn_blocking(task);
                }
            }
            command = commands.recv() => match command {
                Some(Command::Schedule { delay, name, task }) => wheel.add(delay, name, task),
                Some(Command::Cancel { name }) => {
                    wheel.remove(&name);
                }
                None => {
                    debug!("Time wheel handle dropped");
                    return;
                }
            },
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!(discarded = wheel.len(), "Time wheel stopped");
                    return;
                }
            }
        }
    }
}
