//! Connection state machine driving the supervised VPN client.
//!
//! `ConnectionMonitor::start` validates the config, spawns the client and
//! hands the process to a dedicated worker task. The worker polls output in
//! bounded waits, classifies each line, and publishes state changes,
//! the resolved address and significant events to subscribers. `stop` is a
//! message to the worker, so the process handle is never shared.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::classify::{classify, extract_address, Address, Event, EventTag};
use crate::config::MonitorConfig;
use crate::sink::{self, ConsoleMirror, LogSink, StdoutMirror, OVPN_SOURCE};
use crate::supervisor::{ProcessSupervisor, ReadOutcome, SupervisorError};
use crate::validate::{self, ValidateError};
use crate::watchdog::Watchdog;

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    InvalidConfig(String),
    Spawn(String),
    /// Output ended before an address was assigned.
    StreamClosed,
    /// The client exited before an address was assigned.
    ProcessExited(Option<i32>),
    /// No output within the idle timeout.
    Unresponsive,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            FailureReason::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            FailureReason::StreamClosed => f.write_str("stream closed"),
            FailureReason::ProcessExited(Some(code)) => {
                write!(f, "process exited with code {code}")
            }
            FailureReason::ProcessExited(None) => f.write_str("process killed by signal"),
            FailureReason::Unresponsive => f.write_str("no response"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Starting,
    Connected(Address),
    Failed(FailureReason),
    Stopped,
}

impl ConnectionState {
    /// `Starting` or `Connected`: a process belongs to this attempt.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Starting | ConnectionState::Connected(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_) | ConnectionState::Stopped)
    }

    /// Transitions only move forward within an attempt. `Stopped` is
    /// reachable from anywhere; `Starting` only from idle or terminal states.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Stopped) => true,
            (Idle | Failed(_) | Stopped, Starting) => true,
            (Starting, Connected(_) | Failed(_)) => true,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Starting => "starting",
            ConnectionState::Connected(_) => "connected",
            ConnectionState::Failed(_) => "failed",
            ConnectionState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected(addr) => write!(f, "connected ({addr})"),
            ConnectionState::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Pushed to subscribers as the attempt progresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    State(ConnectionState),
    Address(Address),
    /// A significant output line.
    Event(Event),
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MonitorStatus {
    pub state: ConnectionState,
    pub address: Option<Address>,
    pub pid: Option<u32>,
    pub alive: bool,
    pub exit_code: Option<i32>,
}

/// Errors returned by `ConnectionMonitor::start`. Config and spawn failures
/// are also published as a `Failed` state.
#[derive(Debug)]
pub enum StartError {
    AlreadyActive(ConnectionState),
    InvalidConfig(ValidateError),
    Spawn(SupervisorError),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::AlreadyActive(state) => {
                write!(f, "connection attempt already in progress ({state})")
            }
            StartError::InvalidConfig(e) => write!(f, "{e}"),
            StartError::Spawn(e) => write!(f, "failed to start OpenVPN: {e}"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::AlreadyActive(_) => None,
            StartError::InvalidConfig(e) => Some(e),
            StartError::Spawn(e) => Some(e),
        }
    }
}

/// State and subscriber list shared between the monitor and its worker.
struct Shared {
    status: watch::Sender<MonitorStatus>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Notification>>>,
}

impl Shared {
    fn new() -> Self {
        let (status, _) = watch::channel(MonitorStatus::default());
        Self {
            status,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, notification: Notification) {
        let mut subs = match self.subscribers.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Apply a state change if the machine allows it. Returns whether the
    /// state changed; repeating the current state is a silent no-op.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut rejected_from = None;
        let changed = self.status.send_if_modified(|s| {
            if s.state == next {
                return false;
            }
            if !s.state.can_transition_to(&next) {
                rejected_from = Some(s.state.clone());
                return false;
            }
            if let ConnectionState::Connected(addr) = &next {
                s.address = Some(addr.clone());
            }
            s.state = next.clone();
            true
        });

        if let Some(from) = rejected_from {
            tracing::warn!(from = %from, to = %next, "ignored invalid state transition");
        }
        if changed {
            tracing::info!(state = %next, "connection state changed");
            self.notify(Notification::State(next));
        }
        changed
    }

    fn update(&self, f: impl FnOnce(&mut MonitorStatus) -> bool) {
        self.status.send_if_modified(f);
    }
}

enum Control {
    Stop { done: oneshot::Sender<()> },
}

/// Caller-facing handle: `start`, `stop`, and subscriptions.
pub struct ConnectionMonitor {
    shared: Arc<Shared>,
    log_sink: Option<Arc<dyn LogSink>>,
    console: Arc<dyn ConsoleMirror>,
    control: Option<mpsc::Sender<Control>>,
    worker: Option<JoinHandle<()>>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            log_sink: None,
            console: Arc::new(StdoutMirror),
            control: None,
            worker: None,
        }
    }

    /// Use `sink` instead of the file named by `[log] file`.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    #[allow(dead_code)]
    pub fn with_console(mut self, console: Arc<dyn ConsoleMirror>) -> Self {
        self.console = console;
        self
    }

    /// Receive every notification published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = match self.shared.subscribers.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.push(tx);
        rx
    }

    #[allow(dead_code)]
    pub fn watch(&self) -> watch::Receiver<MonitorStatus> {
        self.shared.status.subscribe()
    }

    pub fn status(&self) -> MonitorStatus {
        self.shared.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.borrow().state.clone()
    }

    pub fn address(&self) -> Option<Address> {
        self.shared.status.borrow().address.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.status.borrow().alive
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.shared.status.borrow().exit_code
    }

    /// Begin a new attempt. Valid from `Idle` or a terminal state; clears the
    /// previous address. Must be called inside a Tokio runtime.
    pub fn start(&mut self, config: &MonitorConfig) -> Result<(), StartError> {
        let current = self.state();
        if current.is_active() {
            return Err(StartError::AlreadyActive(current));
        }
        // The previous worker has already released its process.
        self.control = None;
        self.worker = None;

        self.shared.update(|s| {
            s.address = None;
            s.pid = None;
            s.alive = false;
            s.exit_code = None;
            true
        });
        self.shared.transition(ConnectionState::Starting);

        if let Err(e) = validate::validate(&config.vpn.config_file) {
            tracing::debug!(error = %e, "config validation failed");
            self.shared
                .transition(ConnectionState::Failed(FailureReason::InvalidConfig(e.to_string())));
            return Err(StartError::InvalidConfig(e));
        }

        let log_sink = match &self.log_sink {
            Some(sink) => sink.clone(),
            None => sink::from_path(config.log.file.as_deref()),
        };
        let mut supervisor = ProcessSupervisor::new(
            config.vpn.kill_fallback.clone(),
            config.monitor.shutdown_grace(),
        );
        let pid = match supervisor.spawn(&config.launch_command()) {
            Ok(pid) => pid,
            Err(e) => {
                tracing::debug!(error = %e, "failed to start OpenVPN");
                let message = format!("Failed to start OpenVPN: {e}");
                log_sink.record(Utc::now(), OVPN_SOURCE, &message);
                self.shared
                    .transition(ConnectionState::Failed(FailureReason::Spawn(e.to_string())));
                return Err(StartError::Spawn(e));
            }
        };
        self.shared.update(|s| {
            s.pid = Some(pid);
            s.alive = true;
            true
        });

        let (control_tx, control_rx) = mpsc::channel(4);
        let worker = Worker {
            supervisor,
            control: control_rx,
            shared: self.shared.clone(),
            log_sink,
            console: self.console.clone(),
            markers: config.monitor.important_events.clone(),
            poll_interval: config.monitor.poll_interval(),
            watchdog: Watchdog::new(config.monitor.idle_timeout()),
            connected: false,
        };

        self.control = Some(control_tx);
        self.worker = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Terminate the client and move to `Stopped`. Valid from any state and
    /// idempotent.
    pub async fn stop(&mut self) {
        if let Some(control) = self.control.take() {
            let (done_tx, done_rx) = oneshot::channel();
            if control.send(Control::Stop { done: done_tx }).await.is_ok() {
                // Err means the worker finished on its own first.
                let _ = done_rx.await;
            }
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "monitor worker did not finish cleanly");
            }
        }
        self.shared.transition(ConnectionState::Stopped);
    }
}

enum Step {
    Control(Option<Control>),
    Output(ReadOutcome),
}

/// Owns the supervised process for one attempt.
struct Worker {
    supervisor: ProcessSupervisor,
    control: mpsc::Receiver<Control>,
    shared: Arc<Shared>,
    log_sink: Arc<dyn LogSink>,
    console: Arc<dyn ConsoleMirror>,
    markers: Vec<String>,
    poll_interval: Duration,
    watchdog: Watchdog,
    connected: bool,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                control = self.control.recv() => Step::Control(control),
                outcome = self.supervisor.read_line(self.poll_interval) => Step::Output(outcome),
            };

            let timed_out = match step {
                Step::Control(Some(Control::Stop { done })) => {
                    tracing::info!("stop requested");
                    self.finish(ConnectionState::Stopped).await;
                    let _ = done.send(());
                    return;
                }
                Step::Control(None) => {
                    tracing::debug!("monitor dropped, shutting down worker");
                    self.finish(ConnectionState::Stopped).await;
                    return;
                }
                Step::Output(ReadOutcome::Line(line)) => {
                    self.watchdog.touch();
                    self.handle_line(&line);
                    false
                }
                Step::Output(ReadOutcome::Timeout) => true,
                Step::Output(ReadOutcome::Eof) => {
                    let next = if self.connected {
                        ConnectionState::Stopped
                    } else {
                        ConnectionState::Failed(FailureReason::StreamClosed)
                    };
                    tracing::info!(connected = self.connected, "VPN output stream closed");
                    self.finish(next).await;
                    return;
                }
            };

            if let Some(next) = self.check_health(timed_out) {
                self.finish(next).await;
                return;
            }
        }
    }

    /// Liveness and idle-timeout checks, run once per poll.
    fn check_health(&mut self, timed_out: bool) -> Option<ConnectionState> {
        let alive = self.supervisor.is_alive();
        let exit_code = self.supervisor.exit_code();
        self.shared.update(|s| {
            let changed = s.alive != alive || s.exit_code != exit_code;
            s.alive = alive;
            s.exit_code = exit_code;
            changed
        });

        // An exit only counts once the buffered output has been drained.
        if !alive && timed_out {
            tracing::info!(exit_code = ?exit_code, "VPN client exited");
            return Some(if self.connected {
                ConnectionState::Stopped
            } else {
                ConnectionState::Failed(FailureReason::ProcessExited(exit_code))
            });
        }

        if !self.connected && self.watchdog.is_stale() {
            tracing::warn!(
                timeout_ms = self.watchdog.timeout().as_millis() as u64,
                "OpenVPN process not responding"
            );
            return Some(ConnectionState::Failed(FailureReason::Unresponsive));
        }

        None
    }

    fn handle_line(&mut self, line: &str) {
        self.console.mirror(line);

        let event = classify(line);
        let tag = event.tag;
        if self.is_significant(&event) {
            self.log_sink.record(event.timestamp, OVPN_SOURCE, line);
            self.shared.notify(Notification::Event(event));
        }

        if tag == EventTag::PushReply && !self.connected {
            if let Some(address) = extract_address(line) {
                tracing::info!(address = %address, "VPN IP address assigned");
                self.connected = true;
                self.shared
                    .transition(ConnectionState::Connected(address.clone()));
                self.shared.notify(Notification::Address(address));
            }
        }
    }

    fn is_significant(&self, event: &Event) -> bool {
        event.tag != EventTag::Unclassified
            && self.markers.iter().any(|m| event.line.contains(m.as_str()))
    }

    /// Release the process, then publish the final state.
    async fn finish(&mut self, next: ConnectionState) {
        let released = self.supervisor.pid().is_some();
        let exit_code = self.supervisor.terminate().await;
        if released {
            self.log_sink
                .record(Utc::now(), OVPN_SOURCE, "VPN connection stopped");
        }
        self.shared.update(|s| {
            s.alive = false;
            if exit_code.is_some() {
                s.exit_code = exit_code;
            }
            true
        });
        self.shared.transition(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::path::Path;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);
    const PUSH_LINE: &str = "Tue Jan 1 PUSH_REPLY,ifconfig 10.8.0.6 255.255.255.0";

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<(String, String)>>,
    }

    impl MemorySink {
        fn records(&self) -> Vec<(String, String)> {
            self.records.lock().unwrap().clone()
        }
    }

    impl LogSink for MemorySink {
        fn record(&self, _timestamp: DateTime<Utc>, source: &str, message: &str) {
            self.records
                .lock()
                .unwrap()
                .push((source.to_string(), message.to_string()));
        }
    }

    #[derive(Default)]
    struct CaptureMirror {
        lines: Mutex<Vec<String>>,
    }

    impl ConsoleMirror for CaptureMirror {
        fn mirror(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }
    }

    struct Harness {
        dir: TempDir,
        monitor: ConnectionMonitor,
        sink: Arc<MemorySink>,
        mirror: Arc<CaptureMirror>,
        rx: mpsc::UnboundedReceiver<Notification>,
    }

    impl Harness {
        fn new() -> Self {
            let sink = Arc::new(MemorySink::default());
            let mirror = Arc::new(CaptureMirror::default());
            let monitor = ConnectionMonitor::new()
                .with_log_sink(sink.clone())
                .with_console(mirror.clone());
            let rx = monitor.subscribe();
            Self {
                dir: tempfile::tempdir().unwrap(),
                monitor,
                sink,
                mirror,
                rx,
            }
        }

        /// A config whose file is a shell script standing in for the VPN
        /// client. The comment carries the directive validation looks for.
        fn config(&self, name: &str, body: &str) -> MonitorConfig {
            let path = self.dir.path().join(name);
            std::fs::write(&path, format!("# remote vpn.example.com 1194\n{body}\n")).unwrap();
            script_config(&path)
        }

        fn fallback_log(&self) -> std::path::PathBuf {
            self.dir.path().join("fallback.log")
        }

        /// Collect notifications until a state matching `done` arrives.
        async fn wait_for_state(
            &mut self,
            done: impl Fn(&ConnectionState) -> bool,
        ) -> Vec<Notification> {
            let mut seen = Vec::new();
            let result = tokio::time::timeout(WAIT, async {
                while let Some(n) = self.rx.recv().await {
                    let matched = matches!(&n, Notification::State(s) if done(s));
                    seen.push(n);
                    if matched {
                        return;
                    }
                }
            })
            .await;
            assert!(result.is_ok(), "timed out waiting for state; saw {seen:?}");
            seen
        }
    }

    fn script_config(path: &Path) -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.vpn.config_file = path.to_path_buf();
        config.vpn.binary = "sh".to_string();
        config.vpn.elevation = String::new();
        config.vpn.kill_fallback = Vec::new();
        config.monitor.poll_interval_ms = 50;
        config.monitor.shutdown_grace_ms = 500;
        config
    }

    fn states(seen: &[Notification]) -> Vec<ConnectionState> {
        seen.iter()
            .filter_map(|n| match n {
                Notification::State(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn addr(text: &str) -> Address {
        Address::parse(text).unwrap()
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        let connected = Connected(addr("10.8.0.6"));
        let failed = Failed(FailureReason::StreamClosed);

        assert!(Idle.can_transition_to(&Starting));
        assert!(!Idle.can_transition_to(&connected));
        assert!(!Idle.can_transition_to(&failed));

        assert!(Starting.can_transition_to(&connected));
        assert!(Starting.can_transition_to(&failed));
        assert!(!Starting.can_transition_to(&Starting));
        assert!(!Starting.can_transition_to(&Idle));

        assert!(!connected.can_transition_to(&Starting));
        assert!(!connected.can_transition_to(&failed));
        assert!(!connected.can_transition_to(&Connected(addr("10.8.0.7"))));

        assert!(failed.can_transition_to(&Starting));
        assert!(!failed.can_transition_to(&connected));
        assert!(Stopped.can_transition_to(&Starting));

        for state in [Idle, Starting, connected.clone(), failed.clone(), Stopped] {
            assert!(state.can_transition_to(&Stopped), "{state} -> stopped");
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Idle.to_string(), "idle");
        assert_eq!(
            ConnectionState::Connected(addr("10.8.0.6")).to_string(),
            "connected (10.8.0.6)"
        );
        assert_eq!(
            ConnectionState::Failed(FailureReason::Unresponsive).to_string(),
            "failed (no response)"
        );
        assert_eq!(
            FailureReason::ProcessExited(Some(1)).to_string(),
            "process exited with code 1"
        );
        assert_eq!(FailureReason::StreamClosed.to_string(), "stream closed");
    }

    #[test]
    fn test_shared_rejects_invalid_transition() {
        let shared = Shared::new();
        assert!(!shared.transition(ConnectionState::Connected(addr("10.8.0.6"))));
        assert_eq!(shared.status.borrow().state, ConnectionState::Idle);
        assert!(shared.transition(ConnectionState::Starting));
        assert!(!shared.transition(ConnectionState::Starting));
    }

    #[tokio::test]
    async fn test_push_reply_connects_and_logs_once() {
        let mut h = Harness::new();
        let config = h.config("client.ovpn", &format!("echo '{PUSH_LINE}'\nexec sleep 30"));

        h.monitor.start(&config).unwrap();
        let seen = h
            .wait_for_state(|s| matches!(s, ConnectionState::Connected(_)))
            .await;

        assert_eq!(
            states(&seen),
            vec![
                ConnectionState::Starting,
                ConnectionState::Connected(addr("10.8.0.6")),
            ]
        );
        assert_eq!(h.monitor.address(), Some(addr("10.8.0.6")));
        assert!(h.monitor.is_alive());
        assert_eq!(
            h.sink.records(),
            vec![("OVPN".to_string(), PUSH_LINE.to_string())]
        );
        assert_eq!(*h.mirror.lines.lock().unwrap(), vec![PUSH_LINE.to_string()]);

        h.monitor.stop().await;
        assert_eq!(h.monitor.state(), ConnectionState::Stopped);
        assert!(!h.monitor.is_alive());
        assert_eq!(
            h.sink.records(),
            vec![
                ("OVPN".to_string(), PUSH_LINE.to_string()),
                ("OVPN".to_string(), "VPN connection stopped".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_address_and_event_notifications() {
        let mut h = Harness::new();
        let config = h.config("client.ovpn", &format!("echo '{PUSH_LINE}'\nexec sleep 30"));

        h.monitor.start(&config).unwrap();
        h.wait_for_state(|s| matches!(s, ConnectionState::Connected(_)))
            .await;
        // Address follows the state change.
        let next = tokio::time::timeout(WAIT, h.rx.recv()).await.unwrap();
        assert_eq!(next, Some(Notification::Address(addr("10.8.0.6"))));

        h.monitor.stop().await;
    }

    #[tokio::test]
    async fn test_significant_event_notified_before_connect() {
        let mut h = Harness::new();
        let config = h.config(
            "client.ovpn",
            &format!("echo 'TCP connection established with [AF_INET]203.0.113.7:443'\necho '{PUSH_LINE}'\nexec sleep 30"),
        );

        h.monitor.start(&config).unwrap();
        let seen = h
            .wait_for_state(|s| matches!(s, ConnectionState::Connected(_)))
            .await;
        let tags: Vec<EventTag> = seen
            .iter()
            .filter_map(|n| match n {
                Notification::Event(e) => Some(e.tag),
                _ => None,
            })
            .collect();
        assert_eq!(tags, vec![EventTag::TcpEstablished, EventTag::PushReply]);

        h.monitor.stop().await;
    }

    #[tokio::test]
    async fn test_unclassified_lines_mirrored_not_logged() {
        let mut h = Harness::new();
        let config = h.config(
            "client.ovpn",
            &format!("echo 'OpenVPN 2.6.8 x86_64-pc-linux-gnu'\necho '{PUSH_LINE}'\nexec sleep 30"),
        );

        h.monitor.start(&config).unwrap();
        h.wait_for_state(|s| matches!(s, ConnectionState::Connected(_)))
            .await;

        assert_eq!(
            *h.mirror.lines.lock().unwrap(),
            vec![
                "OpenVPN 2.6.8 x86_64-pc-linux-gnu".to_string(),
                PUSH_LINE.to_string()
            ]
        );
        assert_eq!(h.sink.records().len(), 1);

        h.monitor.stop().await;
    }

    #[tokio::test]
    async fn test_configured_markers_narrow_logging() {
        let mut h = Harness::new();
        let mut config = h.config(
            "client.ovpn",
            &format!("echo 'Initialization Sequence Completed'\necho '{PUSH_LINE}'\nexec sleep 30"),
        );
        config.monitor.important_events = vec!["PUSH_REPLY".to_string()];

        h.monitor.start(&config).unwrap();
        h.wait_for_state(|s| matches!(s, ConnectionState::Connected(_)))
            .await;

        assert_eq!(
            h.sink.records(),
            vec![("OVPN".to_string(), PUSH_LINE.to_string())]
        );
        h.monitor.stop().await;
    }

    #[tokio::test]
    async fn test_later_push_reply_does_not_change_address() {
        let mut h = Harness::new();
        let config = h.config(
            "client.ovpn",
            "echo 'PUSH_REPLY,ifconfig 10.8.0.6 255.255.255.0'\n\
             echo 'PUSH_REPLY,ifconfig 10.8.0.99 255.255.255.0'\n\
             echo 'Initialization Sequence Completed'\n\
             exec sleep 30",
        );

        h.monitor.start(&config).unwrap();
        h.wait_for_state(|s| matches!(s, ConnectionState::Connected(_)))
            .await;

        // Wait until the trailing line has been processed.
        tokio::time::timeout(WAIT, async {
            while h.sink.records().len() < 3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(h.monitor.address(), Some(addr("10.8.0.6")));
        assert_eq!(
            h.monitor.state(),
            ConnectionState::Connected(addr("10.8.0.6"))
        );
        let messages: Vec<String> = h.sink.records().into_iter().map(|(_, m)| m).collect();
        assert!(messages[1].contains("10.8.0.99"));

        h.monitor.stop().await;
    }

    #[tokio::test]
    async fn test_auth_failed_then_eof_fails() {
        let mut h = Harness::new();
        let config = h.config("client.ovpn", "echo 'AUTH_FAILED'");

        h.monitor.start(&config).unwrap();
        let seen = h.wait_for_state(ConnectionState::is_terminal).await;

        assert!(matches!(
            states(&seen).last(),
            Some(ConnectionState::Failed(
                FailureReason::StreamClosed | FailureReason::ProcessExited(_)
            ))
        ));
        assert!(!h.monitor.is_alive());
        assert_eq!(h.monitor.address(), None);
        assert_eq!(
            h.sink.records(),
            vec![
                ("OVPN".to_string(), "AUTH_FAILED".to_string()),
                ("OVPN".to_string(), "VPN connection stopped".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_exit_with_open_stream_reports_exit_code() {
        let mut h = Harness::new();
        // The background sleep keeps the pipe open after the shell exits.
        let config = h.config("client.ovpn", "(sleep 2 &)\necho starting\nexit 3");

        h.monitor.start(&config).unwrap();
        let seen = h.wait_for_state(ConnectionState::is_terminal).await;

        assert_eq!(
            states(&seen).last(),
            Some(&ConnectionState::Failed(FailureReason::ProcessExited(Some(3))))
        );
        assert_eq!(h.monitor.exit_code(), Some(3));
        assert!(!h.monitor.is_alive());
    }

    #[tokio::test]
    async fn test_eof_after_connect_stops() {
        let mut h = Harness::new();
        let config = h.config("client.ovpn", &format!("echo '{PUSH_LINE}'"));

        h.monitor.start(&config).unwrap();
        let seen = h.wait_for_state(ConnectionState::is_terminal).await;

        assert_eq!(
            states(&seen),
            vec![
                ConnectionState::Starting,
                ConnectionState::Connected(addr("10.8.0.6")),
                ConnectionState::Stopped,
            ]
        );
        // The address stays readable after the attempt ends.
        assert_eq!(h.monitor.address(), Some(addr("10.8.0.6")));
    }

    #[tokio::test]
    async fn test_idle_timeout_fails_and_terminates_once() {
        let mut h = Harness::new();
        let mut config = h.config("client.ovpn", "echo 'starting up'\nexec sleep 30");
        config.monitor.idle_timeout_ms = 300;
        config.vpn.kill_fallback = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo kill >> {}", h.fallback_log().display()),
        ];

        h.monitor.start(&config).unwrap();
        let seen = h.wait_for_state(ConnectionState::is_terminal).await;

        assert_eq!(
            states(&seen).last(),
            Some(&ConnectionState::Failed(FailureReason::Unresponsive))
        );
        assert!(!h.monitor.is_alive());
        let kills = std::fs::read_to_string(h.fallback_log()).unwrap();
        assert_eq!(kills.lines().count(), 1);

        // Stopping a finished attempt does not terminate again.
        h.monitor.stop().await;
        assert_eq!(h.monitor.state(), ConnectionState::Stopped);
        let kills = std::fs::read_to_string(h.fallback_log()).unwrap();
        assert_eq!(kills.lines().count(), 1);
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_start_failure_is_returned_not_logged_as_error() {
        let buf = SharedBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::ERROR)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ovpn");
        std::fs::write(&path, "cipher AES-256-GCM").unwrap();
        let mut monitor = ConnectionMonitor::new().with_log_sink(Arc::new(sink::NullSink));

        let result = tracing::subscriber::with_default(subscriber, || {
            monitor.start(&script_config(&path))
        });

        assert!(matches!(result, Err(StartError::InvalidConfig(_))));
        let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(output.is_empty(), "unexpected error output: {output}");
    }

    #[tokio::test]
    async fn test_invalid_config_fails_without_spawning() {
        let mut h = Harness::new();
        let path = h.dir.path().join("bad.ovpn");
        std::fs::write(&path, "cipher AES-256-GCM").unwrap();

        let err = h.monitor.start(&script_config(&path)).unwrap_err();
        assert!(matches!(err, StartError::InvalidConfig(_)));

        let status = h.monitor.status();
        assert!(matches!(
            status.state,
            ConnectionState::Failed(FailureReason::InvalidConfig(_))
        ));
        assert_eq!(status.pid, None);
        assert!(!status.alive);
        assert!(h.mirror.lines.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_error_fails() {
        let mut h = Harness::new();
        let mut config = h.config("client.ovpn", "true");
        config.vpn.binary = "nonexistent-openvpn-xyz".to_string();

        let err = h.monitor.start(&config).unwrap_err();
        assert!(matches!(err, StartError::Spawn(_)));
        assert!(err.to_string().contains("failed to start OpenVPN"));
        assert!(matches!(
            h.monitor.state(),
            ConnectionState::Failed(FailureReason::Spawn(_))
        ));
        let records = h.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "OVPN");
        assert!(records[0].1.starts_with("Failed to start OpenVPN: "));
    }

    #[tokio::test]
    async fn test_start_while_active_is_rejected() {
        let mut h = Harness::new();
        let config = h.config("client.ovpn", "exec sleep 30");

        h.monitor.start(&config).unwrap();
        let pid = h.monitor.status().pid;
        assert!(pid.is_some());

        let err = h.monitor.start(&config).unwrap_err();
        assert!(matches!(err, StartError::AlreadyActive(ConnectionState::Starting)));
        assert_eq!(h.monitor.status().pid, pid);

        h.monitor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_twice_stays_stopped() {
        let mut h = Harness::new();
        let config = h.config("client.ovpn", "exec sleep 30");

        h.monitor.start(&config).unwrap();
        h.monitor.stop().await;
        assert_eq!(h.monitor.state(), ConnectionState::Stopped);
        assert!(!h.monitor.is_alive());

        h.monitor.stop().await;
        assert_eq!(h.monitor.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_from_idle() {
        let mut monitor = ConnectionMonitor::new();
        assert_eq!(monitor.state(), ConnectionState::Idle);
        monitor.stop().await;
        assert_eq!(monitor.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_clears_address() {
        let mut h = Harness::new();
        let first = h.config("first.ovpn", &format!("echo '{PUSH_LINE}'\nexec sleep 30"));
        h.monitor.start(&first).unwrap();
        h.wait_for_state(|s| matches!(s, ConnectionState::Connected(_)))
            .await;
        h.monitor.stop().await;
        assert_eq!(h.monitor.address(), Some(addr("10.8.0.6")));

        let second = h.config(
            "second.ovpn",
            "sleep 0.2\necho 'PUSH_REPLY,ifconfig 10.8.0.7 255.255.255.0'\nexec sleep 30",
        );
        h.monitor.start(&second).unwrap();
        assert_eq!(h.monitor.state(), ConnectionState::Starting);
        assert_eq!(h.monitor.address(), None);

        h.wait_for_state(|s| matches!(s, ConnectionState::Connected(_)))
            .await;
        assert_eq!(h.monitor.address(), Some(addr("10.8.0.7")));
        h.monitor.stop().await;
    }

    #[tokio::test]
    async fn test_watch_tracks_status() {
        let mut h = Harness::new();
        let mut watcher = h.monitor.watch();
        let config = h.config("client.ovpn", &format!("echo '{PUSH_LINE}'\nexec sleep 30"));

        h.monitor.start(&config).unwrap();
        let status = tokio::time::timeout(
            WAIT,
            watcher.wait_for(|s| matches!(s.state, ConnectionState::Connected(_))),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(status.address, Some(addr("10.8.0.6")));
        assert!(status.pid.is_some());
        assert!(status.alive);

        h.monitor.stop().await;
    }
}
