// src/watchdog.rs
//
// Watchdog controller: drives a line transport on a background blocking task,
// tracks the time of last received data, and emits DataReceived /
// TimeoutFired / ErrorOccurred events to a consumer channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::config::MonitorConfig;
use crate::io::serial::SerialTransport;
use crate::io::{now_us, LineConnection, LineResult, LineTransport, MonitorEvent, MonitorState};

/// Monitor loop cadence. Each tick polls for a line and evaluates the idle timeout.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How long `stop()` waits for the loop to exit before abandoning the join.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Channel the watchdog pushes events into. Unbounded so a slow consumer
/// can never stall the monitor loop.
pub type EventSender = mpsc::UnboundedSender<MonitorEvent>;

/// Watches one line-oriented device at a time.
///
/// State machine: `Idle -> Starting -> Running -> Stopping -> Idle`, with a
/// transient `Faulted` on unrecoverable error. Each `start()` opens a fresh
/// session with its own generation; no timeout state leaks across sessions.
pub struct LineWatchdog {
    transport: Arc<dyn LineTransport>,
    events_tx: EventSender,
    state: MonitorState,
    generation: u64,
    cancel_flag: Arc<AtomicBool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl LineWatchdog {
    pub fn new(transport: Arc<dyn LineTransport>, events_tx: EventSender) -> Self {
        Self {
            transport,
            events_tx,
            state: MonitorState::Idle,
            generation: 0,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        }
    }

    /// Watchdog over a real serial port
    pub fn serial(events_tx: EventSender) -> Self {
        Self::new(Arc::new(SerialTransport), events_tx)
    }

    /// Current controller state. A loop that exited on its own (read error)
    /// is an implicit stop and reads as `Idle`.
    pub fn state(&self) -> MonitorState {
        if self.state == MonitorState::Running && !self.loop_alive() {
            return MonitorState::Idle;
        }
        self.state.clone()
    }

    /// Generation of the current (or most recent) session. Consumers compare
    /// this against `MonitorEvent::generation()` to discard stale events.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn loop_alive(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Start monitoring. Validation failures are returned synchronously;
    /// everything after that (open failure, read errors, timeouts) arrives
    /// asynchronously on the event channel.
    ///
    /// Calling `start` while a session is running is a caller error — `stop`
    /// first.
    pub async fn start(&mut self, config: MonitorConfig) -> Result<(), String> {
        if self.state == MonitorState::Running && self.loop_alive() {
            return Err("Watchdog is already running".to_string());
        }
        config.validate()?;

        self.state = MonitorState::Starting;
        self.generation += 1;
        let generation = self.generation;
        // Fresh flag per session: a prior loop detached by stop() still holds
        // its own cancelled flag, so a restart can never un-cancel it
        self.cancel_flag = Arc::new(AtomicBool::new(false));

        // Open on the blocking pool; serial opens can stall on some drivers
        let transport = self.transport.clone();
        let open_config = config.clone();
        let opened = tokio::task::spawn_blocking(move || transport.open(&open_config))
            .await
            .map_err(|e| format!("Open task panicked: {}", e))?;

        let conn = match opened {
            Ok(conn) => conn,
            Err(message) => {
                tlog!("[watchdog] {}", message);
                self.state = MonitorState::Faulted;
                let _ = self
                    .events_tx
                    .send(MonitorEvent::ErrorOccurred { generation, message });
                self.state = MonitorState::Idle;
                return Ok(());
            }
        };

        let cancel_flag = self.cancel_flag.clone();
        let events_tx = self.events_tx.clone();
        let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
        let device = config.device.clone();

        let handle = tokio::task::spawn_blocking(move || {
            run_monitor_loop(conn, idle_timeout, generation, cancel_flag, events_tx);
            tlog!("[watchdog] Monitor loop for {} exited", device);
        });
        self.task_handle = Some(handle);
        self.state = MonitorState::Running;

        tlog!(
            "[watchdog] Monitoring {} at {} baud (idle timeout: {} s, generation: {})",
            config.device, config.baud_rate, config.idle_timeout_secs, generation
        );
        Ok(())
    }

    /// Stop monitoring. Safe to call from any task and when already stopped.
    ///
    /// Best-effort join: the caller is blocked for at most `STOP_GRACE`; a
    /// loop stuck inside a read is abandoned and finishes detached, closing
    /// the connection on its way out. Stale events from a detached loop are
    /// fenced off by the generation tag.
    pub async fn stop(&mut self) {
        if self.task_handle.is_none() {
            self.state = MonitorState::Idle;
            return;
        }

        self.state = MonitorState::Stopping;
        self.cancel_flag.store(true, Ordering::Relaxed);

        if let Some(handle) = self.task_handle.take() {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                tlog!(
                    "[watchdog] Monitor loop did not exit within {:?}, detaching",
                    STOP_GRACE
                );
            }
        }

        self.state = MonitorState::Idle;
        tlog!("[watchdog] Stopped (generation: {})", self.generation);
    }
}

/// Blocking monitor loop. Owns the connection for the session lifetime and
/// closes it on every exit path.
fn run_monitor_loop(
    mut conn: Box<dyn LineConnection>,
    idle_timeout: Duration,
    generation: u64,
    cancel_flag: Arc<AtomicBool>,
    events_tx: EventSender,
) {
    // Session baseline: the clock starts at open, not at first data
    let mut last_received = Instant::now();
    let mut last_received_us = now_us();

    while !cancel_flag.load(Ordering::Relaxed) {
        match conn.poll_line() {
            Ok(LineResult::Line(text)) => {
                last_received = Instant::now();
                last_received_us = now_us();
                let _ = events_tx.send(MonitorEvent::DataReceived {
                    generation,
                    text,
                    timestamp_us: last_received_us,
                });
            }
            Ok(LineResult::NoData) => {}
            Err(message) => {
                // Read errors are fatal for the session; no retry
                let _ = events_tx.send(MonitorEvent::ErrorOccurred { generation, message });
                break;
            }
        }

        // Timeout check runs every tick, independent of the poll outcome
        let elapsed = last_received.elapsed();
        if timeout_due(elapsed, idle_timeout) {
            let _ = events_tx.send(MonitorEvent::TimeoutFired {
                generation,
                last_received_us,
                silent_ms: elapsed.as_millis() as u64,
            });
            // Re-arm: one event per silence episode, not one per tick
            last_received = Instant::now();
            last_received_us = now_us();
        }

        std::thread::sleep(TICK_INTERVAL);
    }

    conn.close();
}

/// Strict comparison: silence of exactly the idle timeout does not fire;
/// the episode fires on the next evaluated tick.
fn timeout_due(elapsed: Duration, idle_timeout: Duration) -> bool {
    elapsed > idle_timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc::UnboundedReceiver;

    // ------------------------------------------------------------------
    // Scripted transports (no hardware)
    // ------------------------------------------------------------------

    /// Delivers each line once its offset (ms since open) has elapsed.
    /// An empty script is a device that never sends anything.
    struct ScriptedTransport {
        script: Vec<(u64, &'static str)>,
    }

    impl ScriptedTransport {
        fn silent() -> Self {
            Self { script: Vec::new() }
        }

        fn with_lines(script: Vec<(u64, &'static str)>) -> Self {
            Self { script }
        }
    }

    impl LineTransport for ScriptedTransport {
        fn open(&self, _config: &MonitorConfig) -> Result<Box<dyn LineConnection>, String> {
            Ok(Box::new(ScriptedConnection {
                script: self.script.clone(),
                opened: Instant::now(),
                next: 0,
                closed: false,
            }))
        }
    }

    struct ScriptedConnection {
        script: Vec<(u64, &'static str)>,
        opened: Instant,
        next: usize,
        closed: bool,
    }

    impl LineConnection for ScriptedConnection {
        fn poll_line(&mut self) -> Result<LineResult, String> {
            assert!(!self.closed, "poll after close");
            if let Some(&(offset_ms, text)) = self.script.get(self.next) {
                if self.opened.elapsed() >= Duration::from_millis(offset_ms) {
                    self.next += 1;
                    return Ok(LineResult::Line(text.to_string()));
                }
            }
            Ok(LineResult::NoData)
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    struct FailingOpenTransport;

    impl LineTransport for FailingOpenTransport {
        fn open(&self, config: &MonitorConfig) -> Result<Box<dyn LineConnection>, String> {
            Err(format!("Failed to open {}: no such device", config.device))
        }
    }

    /// Connection that dies with a read error on the first poll.
    struct ReadErrorTransport;

    impl LineTransport for ReadErrorTransport {
        fn open(&self, _config: &MonitorConfig) -> Result<Box<dyn LineConnection>, String> {
            Ok(Box::new(ReadErrorConnection))
        }
    }

    struct ReadErrorConnection;

    impl LineConnection for ReadErrorConnection {
        fn poll_line(&mut self) -> Result<LineResult, String> {
            Err("Read error on /dev/ttyTEST: input/output error".to_string())
        }

        fn close(&mut self) {}
    }

    /// Connection stuck inside its read far beyond the stop grace period.
    struct StuckTransport;

    impl LineTransport for StuckTransport {
        fn open(&self, _config: &MonitorConfig) -> Result<Box<dyn LineConnection>, String> {
            Ok(Box::new(StuckConnection))
        }
    }

    struct StuckConnection;

    impl LineConnection for StuckConnection {
        fn poll_line(&mut self) -> Result<LineResult, String> {
            std::thread::sleep(Duration::from_secs(3));
            Ok(LineResult::NoData)
        }

        fn close(&mut self) {}
    }

    /// First open yields a connection whose first poll blocks past the stop
    /// grace period, then counts every later poll on a shared counter so a
    /// loop that outlives its session stays visible. Later opens are silent.
    struct DetachingTransport {
        opens: AtomicUsize,
        stale_polls: Arc<AtomicUsize>,
    }

    impl DetachingTransport {
        fn new(stale_polls: Arc<AtomicUsize>) -> Self {
            Self {
                opens: AtomicUsize::new(0),
                stale_polls,
            }
        }
    }

    impl LineTransport for DetachingTransport {
        fn open(&self, _config: &MonitorConfig) -> Result<Box<dyn LineConnection>, String> {
            if self.opens.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Box::new(SlowThenCountingConnection {
                    polled: false,
                    stale_polls: self.stale_polls.clone(),
                }))
            } else {
                Ok(Box::new(ScriptedConnection {
                    script: Vec::new(),
                    opened: Instant::now(),
                    next: 0,
                    closed: false,
                }))
            }
        }
    }

    struct SlowThenCountingConnection {
        polled: bool,
        stale_polls: Arc<AtomicUsize>,
    }

    impl LineConnection for SlowThenCountingConnection {
        fn poll_line(&mut self) -> Result<LineResult, String> {
            if !self.polled {
                self.polled = true;
                std::thread::sleep(Duration::from_millis(1800));
            } else {
                self.stale_polls.fetch_add(1, Ordering::SeqCst);
            }
            Ok(LineResult::NoData)
        }

        fn close(&mut self) {}
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn test_config() -> MonitorConfig {
        MonitorConfig::new("/dev/ttyTEST", 9600, 1)
    }

    fn watchdog_with(
        transport: impl LineTransport + 'static,
    ) -> (LineWatchdog, UnboundedReceiver<MonitorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LineWatchdog::new(Arc::new(transport), tx), rx)
    }

    /// Drain events until the window closes.
    async fn collect_events(
        rx: &mut UnboundedReceiver<MonitorEvent>,
        window: Duration,
    ) -> Vec<MonitorEvent> {
        let deadline = tokio::time::Instant::now() + window;
        let mut events = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(ev)) => events.push(ev),
                _ => break,
            }
        }
        events
    }

    // ------------------------------------------------------------------
    // Timeout policy (pure)
    // ------------------------------------------------------------------

    #[test]
    fn test_exact_boundary_does_not_fire() {
        let idle = Duration::from_secs(5);
        assert!(!timeout_due(Duration::from_secs(5), idle));
        assert!(timeout_due(Duration::from_secs(5) + Duration::from_millis(1), idle));
        assert!(!timeout_due(Duration::from_millis(4999), idle));
    }

    // ------------------------------------------------------------------
    // Controller behaviour
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_silent_device_fires_once_per_idle_window() {
        let (mut wd, mut rx) = watchdog_with(ScriptedTransport::silent());
        wd.start(test_config()).await.unwrap();

        // 1 s idle timeout: expect fires at ~1.05 s and ~2.1 s, not a third
        let events = collect_events(&mut rx, Duration::from_millis(2600)).await;
        wd.stop().await;

        let timeouts: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::TimeoutFired { .. }))
            .collect();
        assert_eq!(timeouts.len(), 2, "events: {:?}", events);
        for ev in &timeouts {
            if let MonitorEvent::TimeoutFired { silent_ms, .. } = ev {
                assert!(*silent_ms > 1000);
            }
        }
    }

    #[tokio::test]
    async fn test_steady_data_never_times_out() {
        let transport = ScriptedTransport::with_lines(vec![
            (300, "tick 1"),
            (600, "tick 2"),
            (900, "tick 3"),
            (1200, "tick 4"),
        ]);
        let (mut wd, mut rx) = watchdog_with(transport);
        wd.start(test_config()).await.unwrap();

        // All gaps < 1 s, and only 0.6 s of trailing silence
        let events = collect_events(&mut rx, Duration::from_millis(1800)).await;
        wd.stop().await;

        let texts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::DataReceived { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["tick 1", "tick 2", "tick 3", "tick 4"]);
        assert!(
            !events.iter().any(|e| matches!(e, MonitorEvent::TimeoutFired { .. })),
            "events: {:?}",
            events
        );
    }

    #[tokio::test]
    async fn test_line_resets_baseline_then_timeout_references_it() {
        let transport = ScriptedTransport::with_lines(vec![(300, "ping")]);
        let (mut wd, mut rx) = watchdog_with(transport);
        wd.start(test_config()).await.unwrap();

        // "ping" at ~0.3 s, then silence: timeout fires ~1.35 s, second would be ~2.4 s
        let events = collect_events(&mut rx, Duration::from_millis(1900)).await;
        wd.stop().await;

        assert_eq!(events.len(), 2, "events: {:?}", events);
        let received_us = match &events[0] {
            MonitorEvent::DataReceived { text, timestamp_us, .. } => {
                assert_eq!(text, "ping");
                *timestamp_us
            }
            other => panic!("expected DataReceived first, got {:?}", other),
        };
        match &events[1] {
            MonitorEvent::TimeoutFired { last_received_us, .. } => {
                assert_eq!(*last_received_us, received_us);
            }
            other => panic!("expected TimeoutFired second, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_failure_reports_error_and_returns_to_idle() {
        let (mut wd, mut rx) = watchdog_with(FailingOpenTransport);

        // Runtime faults come back on the channel, not as Err
        wd.start(test_config()).await.unwrap();
        assert_eq!(wd.state(), MonitorState::Idle);

        let events = collect_events(&mut rx, Duration::from_millis(200)).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            MonitorEvent::ErrorOccurred { message, .. } => {
                assert!(message.contains("Failed to open"));
            }
            other => panic!("expected ErrorOccurred, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_error_is_fatal_and_implicitly_stops() {
        let (mut wd, mut rx) = watchdog_with(ReadErrorTransport);
        wd.start(test_config()).await.unwrap();

        let events = collect_events(&mut rx, Duration::from_millis(400)).await;
        assert_eq!(events.len(), 1, "read errors are not retried");
        assert!(matches!(events[0], MonitorEvent::ErrorOccurred { .. }));

        // The dead loop reads as an implicit stop
        assert_eq!(wd.state(), MonitorState::Idle);
        wd.stop().await;
        assert_eq!(wd.state(), MonitorState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_synchronously() {
        let (mut wd, mut rx) = watchdog_with(ScriptedTransport::silent());
        let config = MonitorConfig::new("/dev/ttyTEST", 0, 1);
        assert!(wd.start(config).await.is_err());
        assert_eq!(wd.state(), MonitorState::Idle);
        assert!(collect_events(&mut rx, Duration::from_millis(100)).await.is_empty());
    }

    #[tokio::test]
    async fn test_start_while_running_is_caller_error() {
        let (mut wd, _rx) = watchdog_with(ScriptedTransport::silent());
        wd.start(test_config()).await.unwrap();
        assert_eq!(wd.state(), MonitorState::Running);

        let err = wd.start(test_config()).await.unwrap_err();
        assert!(err.contains("already running"));

        wd.stop().await;
        assert_eq!(wd.state(), MonitorState::Idle);
    }

    #[tokio::test]
    async fn test_restart_creates_fresh_session_generation() {
        let transport = ScriptedTransport::with_lines(vec![(50, "hello")]);
        let (mut wd, mut rx) = watchdog_with(transport);

        wd.start(test_config()).await.unwrap();
        let first = collect_events(&mut rx, Duration::from_millis(400)).await;
        wd.stop().await;

        wd.start(test_config()).await.unwrap();
        let second = collect_events(&mut rx, Duration::from_millis(400)).await;
        wd.stop().await;

        // Each session re-delivers its own line under a new generation, and
        // the fresh baseline means no timeout leaks across the restart
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert!(matches!(first[0], MonitorEvent::DataReceived { .. }));
        assert!(matches!(second[0], MonitorEvent::DataReceived { .. }));
        assert!(second[0].generation() > first[0].generation());
        assert_eq!(second[0].generation(), wd.generation());
    }

    #[tokio::test]
    async fn test_stop_join_is_bounded() {
        let (mut wd, _rx) = watchdog_with(StuckTransport);
        wd.start(test_config()).await.unwrap();

        // Loop is stuck in a 3 s read; stop must give up after the 1 s grace
        // period and detach rather than wait for it. This pins the reference
        // best-effort semantics — stop() is not a hard join.
        let begin = Instant::now();
        wd.stop().await;
        let took = begin.elapsed();
        assert!(took < Duration::from_secs(2), "stop took {:?}", took);
        assert_eq!(wd.state(), MonitorState::Idle);
    }

    #[tokio::test]
    async fn test_restart_does_not_resurrect_detached_loop() {
        let stale_polls = Arc::new(AtomicUsize::new(0));
        let (mut wd, _rx) = watchdog_with(DetachingTransport::new(stale_polls.clone()));
        wd.start(test_config()).await.unwrap();

        // Session 1 is stuck in a 1.8 s read; stop() detaches it after the
        // 1 s grace with its cancel flag set
        wd.stop().await;

        // Restarting hands session 2 a fresh flag — it must not un-cancel
        // the detached loop, which exits at its next flag check
        wd.start(test_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(
            stale_polls.load(Ordering::SeqCst),
            0,
            "detached session-1 loop kept polling after restart"
        );
        wd.stop().await;
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_a_noop() {
        let (mut wd, _rx) = watchdog_with(ScriptedTransport::silent());
        wd.stop().await;
        assert_eq!(wd.state(), MonitorState::Idle);
    }
}
