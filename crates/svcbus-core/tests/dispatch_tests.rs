//! Integration tests for the dispatch engine
//!
//! Every dispatcher thread owns its own runtime, so these are plain tests
//! that block on bounded waits.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use svcbus_core::{
    consumer_fn, AppContext, Component, ComponentEntry, ComponentError, ComponentThread,
    DispatchRegistry, Dispatcher, DispatcherThread, Event, EventConsumer, IdleBody, NoOpSink,
    Priority, ProxyBinding, SvcbusConfig, SvcbusError, SvcbusResult, ThreadState, WaitTimeout,
};

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

const WAIT: WaitTimeout = WaitTimeout::After(Duration::from_secs(10));

fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn started_thread(name: &str, registry: &Arc<DispatchRegistry>) -> DispatcherThread {
    let thread = DispatcherThread::new(name, registry);
    thread.start(IdleBody).unwrap();
    assert!(thread.wait_ready(WAIT));
    thread
}

/// Payload that counts how often it is dropped
struct Tracked {
    id: u64,
    drops: Arc<AtomicUsize>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Blocks the dispatcher until the test releases it
struct Gate;

fn gate_consumer(release: mpsc::Receiver<()>) -> impl EventConsumer<Gate> {
    consumer_fn(move |_: Gate, _: &mut Dispatcher| {
        let _ = release.recv_timeout(Duration::from_secs(10));
    })
}

// ----------------------------------------------------------------------------
// Delivery Guarantees
// ----------------------------------------------------------------------------

#[test]
fn test_at_most_one_delivery_under_concurrent_posts() {
    const POSTERS: u64 = 4;
    const PER_POSTER: u64 = 2_500;

    let registry = DispatchRegistry::new();
    let thread = started_thread("stress", &registry);

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let handled = Arc::new(AtomicUsize::new(0));
    let duplicates = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));

    {
        let seen = seen.clone();
        let handled = handled.clone();
        let duplicates = duplicates.clone();
        thread
            .dispatcher()
            .register_consumer::<Tracked, _>(consumer_fn(move |event: Tracked, _: &mut Dispatcher| {
                if !seen.lock().unwrap().insert(event.id) {
                    duplicates.fetch_add(1, Ordering::SeqCst);
                }
                handled.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
    }

    let posters: Vec<_> = (0..POSTERS)
        .map(|poster| {
            let handle = thread.dispatcher();
            let drops = drops.clone();
            std::thread::spawn(move || {
                for i in 0..PER_POSTER {
                    let priority = match i % 3 {
                        0 => Priority::Low,
                        1 => Priority::Normal,
                        _ => Priority::High,
                    };
                    let payload = Tracked {
                        id: poster * PER_POSTER + i,
                        drops: drops.clone(),
                    };
                    assert!(handle.post(Event::new(payload).with_priority(priority)));
                }
            })
        })
        .collect();
    for poster in posters {
        poster.join().unwrap();
    }

    let total = (POSTERS * PER_POSTER) as usize;
    assert!(wait_for(|| handled.load(Ordering::SeqCst) == total));
    assert!(thread.shutdown(WAIT));

    assert_eq!(handled.load(Ordering::SeqCst), total);
    assert_eq!(duplicates.load(Ordering::SeqCst), 0);
    assert_eq!(seen.lock().unwrap().len(), total);
    assert_eq!(drops.load(Ordering::SeqCst), total);
}

#[test]
fn test_same_source_order_and_priority_bands() {
    let registry = DispatchRegistry::new();
    let thread = started_thread("ordering", &registry);
    let handle = thread.dispatcher();

    let (release, gate) = mpsc::channel();
    handle.register_consumer::<Gate, _>(gate_consumer(gate)).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let record = order.clone();
    handle
        .register_consumer::<(Priority, u32), _>(consumer_fn(
            move |value: (Priority, u32), _: &mut Dispatcher| {
                record.lock().unwrap().push(value);
            },
        ))
        .unwrap();

    // Hold the dispatcher so everything below is queued before dispatch
    assert!(handle.post(Event::new(Gate).with_priority(Priority::Critical)));
    for i in 0..3u32 {
        for priority in [Priority::Low, Priority::Normal, Priority::High, Priority::Critical] {
            assert!(handle.post(Event::new((priority, i)).with_priority(priority)));
        }
    }
    release.send(()).unwrap();

    assert!(wait_for(|| order.lock().unwrap().len() == 12));
    let expected: Vec<(Priority, u32)> = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        .into_iter()
        .flat_map(|priority| (0..3u32).map(move |i| (priority, i)))
        .collect();
    assert_eq!(*order.lock().unwrap(), expected);

    assert!(thread.shutdown(WAIT));
}

#[test]
fn test_exit_discards_queued_events_without_running_them() {
    let registry = DispatchRegistry::new();
    let thread = started_thread("graceful", &registry);
    let handle = thread.dispatcher();

    let (release, gate) = mpsc::channel();
    handle.register_consumer::<Gate, _>(gate_consumer(gate)).unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    handle
        .register_consumer::<Tracked, _>(consumer_fn(move |_: Tracked, _: &mut Dispatcher| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    assert!(handle.post(Event::new(Gate)));
    for id in 0..100 {
        let payload = Tracked {
            id,
            drops: drops.clone(),
        };
        assert!(handle.post(Event::new(payload)));
    }

    thread.trigger_exit();
    thread.trigger_exit();
    // The gate may already be gone if it was discarded with the rest
    let _ = release.send(());

    assert!(thread.wait_completion(WAIT));
    assert_eq!(thread.state(), ThreadState::Stopped);
    assert_eq!(handled.load(Ordering::SeqCst), 0);
    assert_eq!(drops.load(Ordering::SeqCst), 100);

    let late = Tracked {
        id: 100,
        drops: drops.clone(),
    };
    assert!(!handle.post(Event::new(late)));
    assert_eq!(drops.load(Ordering::SeqCst), 101);
}

// ----------------------------------------------------------------------------
// Consumers
// ----------------------------------------------------------------------------

struct EvenOnly {
    processed: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl EventConsumer<u32> for EvenOnly {
    fn preprocess(&mut self, event: &u32) -> bool {
        event % 2 == 0
    }

    async fn process_event(&mut self, event: u32, _dispatcher: &mut Dispatcher) {
        self.processed.lock().unwrap().push(event);
    }
}

#[test]
fn test_preprocess_gate_drops_rejected_events() {
    let registry = DispatchRegistry::new();
    let thread = started_thread("gate", &registry);
    let processed = Arc::new(Mutex::new(Vec::new()));

    let handle = thread.dispatcher();
    handle
        .register_consumer(EvenOnly {
            processed: processed.clone(),
        })
        .unwrap();
    for value in 0..10u32 {
        assert!(handle.post(Event::new(value)));
    }

    assert!(wait_for(|| processed.lock().unwrap().len() == 5));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(*processed.lock().unwrap(), vec![0, 2, 4, 6, 8]);
    assert!(thread.shutdown(WAIT));
}

#[test]
fn test_unbound_events_go_to_first_consumer_bound_events_to_theirs() {
    let registry = DispatchRegistry::new();
    let thread = started_thread("binding", &registry);
    let handle = thread.dispatcher();

    let log = Arc::new(Mutex::new(Vec::new()));
    let first_log = log.clone();
    let second_log = log.clone();
    handle
        .register_consumer::<&'static str, _>(consumer_fn(move |e: &'static str, _: &mut Dispatcher| {
            first_log.lock().unwrap().push(("first", e));
        }))
        .unwrap();
    let second = handle
        .register_consumer::<&'static str, _>(consumer_fn(move |e: &'static str, _: &mut Dispatcher| {
            second_log.lock().unwrap().push(("second", e));
        }))
        .unwrap();

    assert!(handle.post(Event::new("unbound")));
    assert!(handle.post(Event::new("bound").for_consumer(second)));

    assert!(wait_for(|| log.lock().unwrap().len() == 2));
    assert_eq!(
        *log.lock().unwrap(),
        vec![("first", "unbound"), ("second", "bound")]
    );

    // A bound consumer that is gone drops the event
    assert!(handle.unregister_consumer(second));
    assert!(handle.post(Event::new("orphan").for_consumer(second)));
    assert!(handle.post(Event::new("after")));
    assert!(wait_for(|| log.lock().unwrap().len() == 3));
    assert_eq!(log.lock().unwrap()[2], ("first", "after"));

    assert!(thread.shutdown(WAIT));
}

#[test]
fn test_handler_can_post_and_register_on_own_dispatcher() {
    let registry = DispatchRegistry::new();
    let thread = started_thread("reentrant", &registry);
    let handle = thread.dispatcher();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    handle
        .register_consumer::<u8, _>(consumer_fn(move |value: u8, dispatcher: &mut Dispatcher| {
            let counter = counter.clone();
            dispatcher.register_consumer::<u16, _>(consumer_fn(move |_: u16, _: &mut Dispatcher| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
            assert!(dispatcher.emit(u16::from(value)));
        }))
        .unwrap();

    assert!(handle.post(Event::new(7u8)));
    assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
    assert!(thread.shutdown(WAIT));
}

// ----------------------------------------------------------------------------
// Registry Routing
// ----------------------------------------------------------------------------

struct Ping(u32);

#[test]
fn test_registry_routes_by_name_and_by_unique_type() {
    let registry = DispatchRegistry::new();
    let alpha = started_thread("alpha", &registry);
    let beta = started_thread("beta", &registry);
    let received = Arc::new(Mutex::new(Vec::new()));

    let alpha_log = received.clone();
    alpha
        .dispatcher()
        .register_consumer::<Ping, _>(consumer_fn(move |ping: Ping, d: &mut Dispatcher| {
            alpha_log.lock().unwrap().push((d.name().to_string(), ping.0));
        }))
        .unwrap();
    assert!(wait_for(|| registry.event_consumer_thread::<Ping>().is_some()));

    // Exactly one dispatcher has a consumer: route by type
    assert!(registry.post_event(Event::new(Ping(1))));
    assert!(wait_for(|| received.lock().unwrap().len() == 1));

    let beta_log = received.clone();
    beta.dispatcher()
        .register_consumer::<Ping, _>(consumer_fn(move |ping: Ping, d: &mut Dispatcher| {
            beta_log.lock().unwrap().push((d.name().to_string(), ping.0));
        }))
        .unwrap();
    assert!(wait_for(|| registry.event_consumer_thread::<Ping>().is_none()));

    // Two candidates: type lookup is ambiguous, names still work
    assert!(!registry.post_event(Event::new(Ping(2))));
    assert!(registry.post_event(Event::new(Ping(3)).to_thread("beta")));
    assert!(registry.post_event(Event::new(Ping(4)).to_dispatcher(alpha.dispatcher())));

    assert!(wait_for(|| received.lock().unwrap().len() == 3));
    let mut log = received.lock().unwrap().clone();
    log.sort();
    assert_eq!(
        log,
        vec![
            ("alpha".to_string(), 1),
            ("alpha".to_string(), 4),
            ("beta".to_string(), 3)
        ]
    );
    assert_eq!(registry.dropped_events(), 1);

    assert!(alpha.shutdown(WAIT));
    assert!(beta.shutdown(WAIT));
    assert!(registry.thread_names().is_empty());
}

// ----------------------------------------------------------------------------
// Component Threads
// ----------------------------------------------------------------------------

type Journal = Arc<Mutex<Vec<String>>>;

struct Recorder {
    role: String,
    journal: Journal,
}

impl Recorder {
    fn note(&self, step: &str) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}:{}", step, self.role));
    }
}

struct RecordingProxy {
    journal: Journal,
}

impl ProxyBinding for RecordingProxy {
    fn proxy_name(&self) -> &str {
        "recording"
    }

    fn stop_proxy(&mut self) {
        self.journal.lock().unwrap().push("proxy:stop".to_string());
    }
}

#[async_trait]
impl Component for Recorder {
    fn role_name(&self) -> &str {
        &self.role
    }

    async fn startup(&mut self, dispatcher: &mut Dispatcher) -> SvcbusResult<()> {
        self.note("start");
        if self.role == "first" {
            dispatcher.bind_proxy(Box::new(RecordingProxy {
                journal: self.journal.clone(),
            }));
        }
        Ok(())
    }

    async fn notify_shutdown(&mut self, _dispatcher: &mut Dispatcher) {
        self.note("notify");
    }

    async fn shutdown(&mut self, _dispatcher: &mut Dispatcher) {
        self.note("stop");
    }
}

fn recording_entry(role: &str, thread: &str, journal: &Journal) -> ComponentEntry {
    let create_journal = journal.clone();
    let delete_journal = journal.clone();
    ComponentEntry::new(role, thread, move |entry, _| {
        create_journal
            .lock()
            .unwrap()
            .push(format!("create:{}", entry.role_name));
        Ok(Box::new(Recorder {
            role: entry.role_name.clone(),
            journal: create_journal.clone(),
        }) as Box<dyn Component>)
    })
    .with_delete(move |component, entry| {
        delete_journal
            .lock()
            .unwrap()
            .push(format!("delete:{}", entry.role_name));
        drop(component);
    })
}

#[test]
fn test_component_lifecycle_order() {
    let registry = DispatchRegistry::new();
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let entries = vec![
        recording_entry("first", "components", &journal),
        recording_entry("second", "components", &journal),
    ];

    let thread = ComponentThread::new("components", entries, &registry);
    thread.start().unwrap();
    assert_eq!(thread.state(), ThreadState::Running);
    assert!(thread.shutdown(WAIT));

    let expected: Vec<String> = [
        "create:first",
        "create:second",
        "start:first",
        "start:second",
        "proxy:stop",
        "notify:first",
        "notify:second",
        "stop:first",
        "stop:second",
        "delete:first",
        "delete:second",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    assert_eq!(*journal.lock().unwrap(), expected);
}

#[test]
fn test_thread_without_components_fails_to_start() {
    let registry = DispatchRegistry::new();
    let thread = ComponentThread::new("empty", Vec::new(), &registry);

    assert!(matches!(
        thread.start(),
        Err(SvcbusError::Component(ComponentError::NoComponents { .. }))
    ));
    assert_eq!(thread.state(), ThreadState::Idle);
    assert!(thread.dispatcher().is_null());
}

#[test]
fn test_thread_whose_factories_all_fail_never_runs() {
    let registry = DispatchRegistry::new();
    let entry = ComponentEntry::new("broken", "broken-thread", |_, _| {
        Err(SvcbusError::config_error("factory unavailable"))
    });

    let thread = ComponentThread::new("broken-thread", vec![entry], &registry);
    assert!(thread.start().is_err());
    assert_eq!(thread.state(), ThreadState::Stopped);
}

// ----------------------------------------------------------------------------
// Application Context
// ----------------------------------------------------------------------------

struct PingComponent {
    hits: Arc<AtomicUsize>,
}

#[async_trait]
impl Component for PingComponent {
    fn role_name(&self) -> &str {
        "pinger"
    }

    async fn startup(&mut self, dispatcher: &mut Dispatcher) -> SvcbusResult<()> {
        let hits = self.hits.clone();
        dispatcher.register_consumer::<Ping, _>(consumer_fn(move |_: Ping, _: &mut Dispatcher| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
        Ok(())
    }
}

#[test]
fn test_app_context_starts_threads_and_routes_events() {
    let context = AppContext::init(SvcbusConfig::testing(), Arc::new(NoOpSink));
    let hits = Arc::new(AtomicUsize::new(0));
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));

    let component_hits = hits.clone();
    context
        .register_component(ComponentEntry::new("pinger", "ping-thread", move |_, _| {
            Ok(Box::new(PingComponent {
                hits: component_hits.clone(),
            }) as Box<dyn Component>)
        }))
        .unwrap();
    context
        .register_component(recording_entry("first", "journal-thread", &journal))
        .unwrap();
    assert!(context
        .register_component(recording_entry("first", "elsewhere", &journal))
        .is_err());

    assert_eq!(context.start_component_threads().unwrap(), 2);
    let pinger = context.event_consumer_thread::<Ping>().unwrap();
    assert_eq!(pinger.name(), "ping-thread");

    assert!(context.post_event(Event::new(Ping(1))));
    assert!(context.post_event(Event::new(Ping(2)).to_thread("ping-thread")));
    assert!(wait_for(|| hits.load(Ordering::SeqCst) == 2));

    context.shutdown();
    assert!(context.dispatcher("ping-thread").is_none());
    assert!(!context.post_event(Event::new(Ping(3))));
    assert!(journal.lock().unwrap().contains(&"delete:first".to_string()));
}
