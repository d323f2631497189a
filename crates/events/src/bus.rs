use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::event::{Event, EventKind};

/// Error type listeners return to report a failed delivery.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Observer of published events. Runs on a bus worker thread.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &Event) -> Result<(), ListenerError>;
}

impl<F> Listener for F
where
    F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_event(&self, event: &Event) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Errors from event bus construction.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event bus needs at least one worker")]
    NoWorkers,
    #[error("failed to spawn event worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub workers: usize,
    /// How long shutdown waits for queued and in-flight deliveries.
    pub shutdown_grace: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Running totals, readable at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    /// Events refused because the bus was shutting down.
    pub dropped: u64,
    pub delivered: u64,
    pub listener_failures: u64,
    /// Queued deliveries skipped after the shutdown grace period ran out.
    pub cancelled: u64,
}

/// Result of [`EventBus::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every queued delivery finished inside the grace period.
    pub drained: bool,
    /// Deliveries still queued when the grace period ran out.
    pub cancelled: usize,
    /// Workers still busy in a listener when shutdown returned.
    pub detached_workers: usize,
}

type ListenerRef = Arc<dyn Listener>;

struct Job {
    event: Event,
    listeners: Vec<ListenerRef>,
}

#[derive(Default)]
struct Delivery {
    queued: usize,
    in_flight: usize,
    cancelled: bool,
}

/// State shared with worker threads. Workers never hold the bus itself, so
/// dropping the last bus handle closes the queue and lets them exit.
struct Shared {
    queue: Mutex<mpsc::Receiver<Job>>,
    delivery: Mutex<Delivery>,
    idle: Condvar,
    delivered: AtomicU64,
    failures: AtomicU64,
    cancelled: AtomicU64,
}

struct Inner {
    config: BusConfig,
    listeners: RwLock<BTreeMap<EventKind, Vec<ListenerRef>>>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    published: AtomicU64,
    dropped: AtomicU64,
    shared: Arc<Shared>,
}

/// Typed publish/subscribe bus with asynchronous delivery.
///
/// Cloning is cheap; all clones share one listener registry and worker pool.
///
/// # Invariants
/// - Listeners for a kind run in registration order for each event.
/// - `publish` never runs listener code on the caller's thread.
/// - A failing or panicking listener affects only its own delivery.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Start a bus with the given worker pool.
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        if config.workers == 0 {
            return Err(BusError::NoWorkers);
        }
        let (sender, receiver) = mpsc::channel::<Job>();
        let shared = Arc::new(Shared {
            queue: Mutex::new(receiver),
            delivery: Mutex::new(Delivery::default()),
            idle: Condvar::new(),
            delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("event-worker-{index}"))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }
        tracing::info!(workers = config.workers, "event bus started");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                listeners: RwLock::new(BTreeMap::new()),
                sender: Mutex::new(Some(sender)),
                workers: Mutex::new(workers),
                shutting_down: AtomicBool::new(false),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                shared,
            }),
        })
    }

    /// Start a bus with two workers and a five second shutdown grace.
    pub fn with_defaults() -> Result<Self, BusError> {
        Self::new(BusConfig::default())
    }

    /// Register `listener` for `kind`. Registration order is delivery order.
    pub fn subscribe(&self, kind: EventKind, listener: impl Listener + 'static) {
        self.subscribe_arc(kind, Arc::new(listener));
    }

    pub fn subscribe_arc(&self, kind: EventKind, listener: Arc<dyn Listener>) {
        let mut listeners = write(&self.inner.listeners);
        let entry = listeners.entry(kind).or_default();
        entry.push(listener);
        tracing::debug!(%kind, count = entry.len(), "listener subscribed");
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        read(&self.inner.listeners).get(&kind).map_or(0, Vec::len)
    }

    /// Queue `event` for delivery. Returns `false` if the bus is shutting down
    /// and the event was dropped.
    pub fn publish(&self, event: Event) -> bool {
        let kind = event.kind();
        let sender = lock(&self.inner.sender);
        let Some(sender) = sender.as_ref() else {
            return self.drop_event(kind);
        };
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return self.drop_event(kind);
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let listeners = read(&self.inner.listeners)
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        if listeners.is_empty() {
            return true;
        }

        lock(&self.inner.shared.delivery).queued += 1;
        if sender.send(Job { event, listeners }).is_err() {
            let mut delivery = lock(&self.inner.shared.delivery);
            delivery.queued -= 1;
            self.inner.shared.idle.notify_all();
            tracing::warn!(%kind, "event queue closed; dropping event");
            return false;
        }
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BusStats {
        let shared = &self.inner.shared;
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            delivered: shared.delivered.load(Ordering::Relaxed),
            listener_failures: shared.failures.load(Ordering::Relaxed),
            cancelled: shared.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting events, wait up to the grace period for queued
    /// deliveries, then cancel whatever is still queued. Clears the listener
    /// registry. Later calls return an empty report.
    pub fn shutdown(&self) -> ShutdownReport {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport {
                drained: true,
                ..ShutdownReport::default()
            };
        }
        tracing::info!("shutting down event bus");

        // Closing the channel lets idle workers exit once the queue is empty.
        lock(&self.inner.sender).take();

        let shared = &self.inner.shared;
        let deadline = Instant::now() + self.inner.config.shutdown_grace;
        let mut delivery = lock(&shared.delivery);
        while delivery.queued + delivery.in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            delivery = shared
                .idle
                .wait_timeout(delivery, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        let drained = delivery.queued + delivery.in_flight == 0;
        let cancelled = delivery.queued;
        if !drained {
            delivery.cancelled = true;
            tracing::warn!(
                cancelled,
                in_flight = delivery.in_flight,
                "event bus grace period expired; cancelling queued deliveries"
            );
        }
        drop(delivery);

        let mut detached_workers = 0;
        let handles: Vec<_> = lock(&self.inner.workers).drain(..).collect();
        for handle in handles {
            if drained || handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!("event worker panicked");
                }
            } else {
                detached_workers += 1;
            }
        }
        if detached_workers > 0 {
            tracing::warn!(detached_workers, "event workers still busy; detaching");
        }

        write(&self.inner.listeners).clear();
        tracing::info!(drained, cancelled, "event bus shut down");
        ShutdownReport {
            drained,
            cancelled,
            detached_workers,
        }
    }

    fn drop_event(&self, kind: EventKind) -> bool {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%kind, "event bus shutting down; dropping event");
        false
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let next = lock(&shared.queue).recv();
        let Ok(job) = next else {
            break;
        };
        {
            let mut delivery = lock(&shared.delivery);
            delivery.queued -= 1;
            if delivery.cancelled {
                shared.cancelled.fetch_add(1, Ordering::Relaxed);
                shared.idle.notify_all();
                continue;
            }
            delivery.in_flight += 1;
        }

        deliver(shared, &job);

        let mut delivery = lock(&shared.delivery);
        delivery.in_flight -= 1;
        shared.idle.notify_all();
    }
}

fn deliver(shared: &Shared, job: &Job) {
    let kind = job.event.kind();
    for listener in &job.listeners {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&job.event)));
        match outcome {
            Ok(Ok(())) => {
                shared.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(error)) => {
                shared.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%kind, %error, "event listener failed");
            }
            Err(payload) => {
                shared.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%kind, reason = panic_message(payload.as_ref()), "event listener panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meetup_common::PlayerId;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::channel;

    fn login() -> Event {
        Event::player_login(PlayerId::new(), "ash")
    }

    fn single_worker(grace: Duration) -> EventBus {
        EventBus::new(BusConfig {
            workers: 1,
            shutdown_grace: grace,
        })
        .unwrap()
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = BusConfig {
            workers: 0,
            ..BusConfig::default()
        };
        assert!(matches!(EventBus::new(config), Err(BusError::NoWorkers)));
    }

    #[test]
    fn failing_listener_does_not_starve_others() {
        let bus = EventBus::with_defaults().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::PlayerLogin, |_: &Event| -> Result<(), ListenerError> {
            Err("always fails".into())
        });
        let counter = Arc::clone(&seen);
        bus.subscribe(EventKind::PlayerLogin, move |_: &Event| -> Result<(), ListenerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        for _ in 0..20 {
            assert!(bus.publish(login()));
        }
        let report = bus.shutdown();

        assert!(report.drained);
        assert_eq!(seen.load(Ordering::SeqCst), 20);
        let stats = bus.stats();
        assert_eq!(stats.listener_failures, 20);
        assert_eq!(stats.delivered, 20);
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let bus = single_worker(Duration::from_secs(5));
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::PlayerLogout, |_: &Event| -> Result<(), ListenerError> {
            panic!("listener blew up")
        });
        let counter = Arc::clone(&seen);
        bus.subscribe(EventKind::PlayerLogout, move |_: &Event| -> Result<(), ListenerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        for _ in 0..3 {
            bus.publish(Event::player_logout(PlayerId::new(), "brock"));
        }
        bus.shutdown();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = single_worker(Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(EventKind::PlayerLogin, move |_: &Event| -> Result<(), ListenerError> {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }
        bus.publish(login());
        bus.shutdown();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn only_matching_kind_is_delivered() {
        let bus = EventBus::with_defaults().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus.subscribe(EventKind::PlayerLogout, move |_: &Event| -> Result<(), ListenerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.publish(login());
        bus.shutdown();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn publish_does_not_wait_for_listeners() {
        let bus = single_worker(Duration::from_secs(5));
        let (release_tx, release_rx) = channel::<()>();
        let release_rx = Mutex::new(release_rx);
        bus.subscribe(EventKind::PlayerLogin, move |_: &Event| -> Result<(), ListenerError> {
            let _ = release_rx.lock().unwrap().recv();
            Ok(())
        });

        let started = Instant::now();
        for _ in 0..5 {
            assert!(bus.publish(login()));
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        for _ in 0..5 {
            release_tx.send(()).unwrap();
        }
        assert!(bus.shutdown().drained);
    }

    #[test]
    fn events_after_shutdown_are_dropped() {
        let bus = EventBus::with_defaults().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus.subscribe(EventKind::PlayerLogin, move |_: &Event| -> Result<(), ListenerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.shutdown();

        assert!(!bus.publish(login()));
        assert_eq!(bus.stats().dropped, 1);
        assert_eq!(bus.listener_count(EventKind::PlayerLogin), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let bus = EventBus::with_defaults().unwrap();
        let first = bus.shutdown();
        let second = bus.clone().shutdown();
        assert!(first.drained);
        assert_eq!(second, ShutdownReport { drained: true, ..ShutdownReport::default() });
    }

    #[test]
    fn stuck_listener_is_cancelled_after_grace() {
        let bus = single_worker(Duration::from_millis(100));
        let (release_tx, release_rx) = channel::<()>();
        let release_rx = Mutex::new(release_rx);
        bus.subscribe(EventKind::PlayerLogin, move |_: &Event| -> Result<(), ListenerError> {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            Ok(())
        });

        for _ in 0..4 {
            bus.publish(login());
        }
        // Let the worker pick up the first job so it is in flight.
        thread::sleep(Duration::from_millis(50));
        let report = bus.shutdown();

        assert!(!report.drained);
        assert_eq!(report.cancelled, 3);
        assert_eq!(report.detached_workers, 1);

        release_tx.send(()).unwrap();
    }
}
