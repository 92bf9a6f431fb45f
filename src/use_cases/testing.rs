// Synthetic runner implementations for driving the manager and adapter in
// tests without real engine processes.

use crate::use_cases::runner::{RunnerControl, RunnerError, RunnerEvent, RunnerOpts, RunnerSpawner};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Control half of a [`FakeRunnerSpawner`] battle. Records interactions and
/// lets tests emit engine events by hand.
pub struct FakeRunnerControl {
    events: mpsc::Sender<RunnerEvent>,
    sent_packets: Mutex<Vec<Vec<u8>>>,
    close_calls: AtomicUsize,
    fail_sends: AtomicBool,
    exited: AtomicBool,
}

impl FakeRunnerControl {
    /// Packets forwarded through `send_packet`, in order.
    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        self.sent_packets.lock().expect("fake runner poisoned").clone()
    }

    pub fn sent_packet_strings(&self) -> Vec<String> {
        self.sent_packets()
            .into_iter()
            .map(|data| String::from_utf8_lossy(&data).into_owned())
            .collect()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Make every subsequent `send_packet` fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Emit a raw runner event as if the engine produced it.
    pub async fn emit(&self, event: RunnerEvent) {
        let _ = self.events.send(event).await;
    }

    /// Emit the terminal exit event exactly once.
    pub async fn emit_exit(&self) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(RunnerEvent::Exited).await;
        }
    }
}

#[async_trait]
impl RunnerControl for FakeRunnerControl {
    async fn send_packet(&self, data: Vec<u8>) -> Result<(), RunnerError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RunnerError::NotRunning);
        }
        self.sent_packets
            .lock()
            .expect("fake runner poisoned")
            .push(data);
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        // Closing synthesises the engine shutting down and the socket
        // closing; repeated closes still yield a single exit.
        self.emit_exit().await;
    }
}

/// One spawned fake battle, exposed to tests.
#[derive(Clone)]
pub struct FakeBattle {
    pub opts: RunnerOpts,
    pub control: Arc<FakeRunnerControl>,
}

#[derive(Default)]
struct SpawnerState {
    battles: Vec<FakeBattle>,
    fail_next_start: Option<String>,
    manual_start: bool,
}

/// Spawner that fabricates runner behaviour: by default every battle starts
/// immediately and closes cleanly.
#[derive(Default)]
pub struct FakeRunnerSpawner {
    state: Mutex<SpawnerState>,
}

impl FakeRunnerSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next spawn with the given details instead of starting.
    pub fn fail_next_start(&self, details: &str) {
        self.state
            .lock()
            .expect("fake spawner poisoned")
            .fail_next_start = Some(details.to_string());
    }

    /// Do not emit `Started` automatically; the test drives it via `emit`.
    pub fn manual_start(&self) {
        self.state.lock().expect("fake spawner poisoned").manual_start = true;
    }

    pub fn battles(&self) -> Vec<FakeBattle> {
        self.state
            .lock()
            .expect("fake spawner poisoned")
            .battles
            .clone()
    }

    pub fn battle(&self, index: usize) -> FakeBattle {
        self.battles()[index].clone()
    }
}

#[async_trait]
impl RunnerSpawner for FakeRunnerSpawner {
    async fn spawn(
        &self,
        opts: RunnerOpts,
        events: mpsc::Sender<RunnerEvent>,
    ) -> Arc<dyn RunnerControl> {
        let control = Arc::new(FakeRunnerControl {
            events: events.clone(),
            sent_packets: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        });

        let (fail, manual_start, engine_addr) = {
            let mut state = self.state.lock().expect("fake spawner poisoned");
            let fail = state.fail_next_start.take();
            state.battles.push(FakeBattle {
                opts: opts.clone(),
                control: control.clone(),
            });
            let addr: SocketAddr = ([127, 0, 0, 1], opts.autohost_port).into();
            (fail, state.manual_start, addr)
        };

        if let Some(details) = fail {
            control.emit(RunnerEvent::Error { details }).await;
            control.emit_exit().await;
        } else if !manual_start {
            control.emit(RunnerEvent::Started { engine_addr }).await;
        }

        control
    }
}
