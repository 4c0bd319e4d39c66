//! In-memory connectors and channels for unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::session::CommandResult;
use crate::session::Session;
use crate::transport::Channel;
use crate::transport::ChannelEvent;
use crate::transport::Connect;
use crate::transport::ConnectError;
use crate::transport::Transport;

// Counting -------------------------------------------------------------------

/// Fails the first `failures` connects, then hands out transports whose
/// channels exit 0 without output.
#[derive(Clone)]
pub struct CountingConnector {
    pub dials: Arc<AtomicUsize>,
    failures: usize,
    fail: fn() -> ConnectError,
    opened: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl CountingConnector {
    pub fn failing_then_ok(failures: usize, fail: fn() -> ConnectError) -> Self {
        Self {
            dials: Arc::default(),
            failures,
            fail,
            opened: Arc::default(),
        }
    }

    pub fn refused() -> ConnectError {
        ConnectError::Dial {
            addr: "test:22".into(),
            source: Arc::new(io::Error::from(io::ErrorKind::ConnectionRefused)),
        }
    }

    pub fn denied() -> ConnectError {
        ConnectError::Auth {
            user: "root".into(),
            addr: "test:22".into(),
            detail: "password: denied".into(),
        }
    }

    /// Marks every transport handed out so far as dropped by the remote.
    pub fn close_all(&self) {
        for closed in self.opened.lock().unwrap().iter() {
            closed.store(true, Ordering::SeqCst);
        }
    }

    pub fn all_closed(&self) -> bool {
        let opened = self.opened.lock().unwrap();
        !opened.is_empty() && opened.iter().all(|closed| closed.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Connect for CountingConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ConnectError> {
        let dial = self.dials.fetch_add(1, Ordering::SeqCst);
        if dial < self.failures {
            return Err((self.fail)());
        }
        let closed = Arc::new(AtomicBool::new(false));
        self.opened.lock().unwrap().push(closed.clone());
        Ok(Arc::new(CountingTransport { closed }))
    }
}

struct CountingTransport {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn open_channel(&self) -> Result<Box<dyn Channel>> {
        anyhow::ensure!(!self.is_closed(), "transport closed");
        Ok(Box::new(CannedChannel::new(CommandResult::default())))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// Gated ----------------------------------------------------------------------

/// Channels that take `hold` to finish, tracking how many run at once and
/// which control calls they receive.
#[derive(Clone)]
pub struct GatedConnector {
    hold: Duration,
    pub started: Arc<AtomicUsize>,
    pub active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
    signals: Arc<Mutex<Vec<&'static str>>>,
}

impl GatedConnector {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            started: Arc::default(),
            active: Arc::default(),
            max_active: Arc::default(),
            signals: Arc::default(),
        }
    }

    pub fn signals(&self) -> Vec<&'static str> {
        self.signals.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connect for GatedConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ConnectError> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Transport for GatedConnector {
    async fn open_channel(&self) -> Result<Box<dyn Channel>> {
        Ok(Box::new(GatedChannel {
            owner: self.clone(),
            running: false,
            done: false,
        }))
    }

    fn is_closed(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct GatedChannel {
    owner: GatedConnector,
    running: bool,
    done: bool,
}

#[async_trait]
impl Channel for GatedChannel {
    async fn exec(&mut self, _command: &str) -> Result<()> {
        self.owner.started.fetch_add(1, Ordering::SeqCst);
        let now = self.owner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.owner.max_active.fetch_max(now, Ordering::SeqCst);
        self.running = true;
        Ok(())
    }

    async fn send_stdin(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn wait(&mut self) -> Option<ChannelEvent> {
        if self.done {
            return None;
        }
        tokio::time::sleep(self.owner.hold).await;
        self.done = true;
        Some(ChannelEvent::Exit(0))
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.owner.signals.lock().unwrap().push("interrupt");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.owner.signals.lock().unwrap().push("close");
        Ok(())
    }
}

impl Drop for GatedChannel {
    fn drop(&mut self) {
        if self.running {
            self.owner.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// Stuck ----------------------------------------------------------------------

/// Connects at once, but its channels never finish opening.
#[derive(Clone, Copy)]
pub struct StuckConnector;

#[async_trait]
impl Connect for StuckConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ConnectError> {
        Ok(Arc::new(Self))
    }
}

#[async_trait]
impl Transport for StuckConnector {
    async fn open_channel(&self) -> Result<Box<dyn Channel>> {
        std::future::pending().await
    }

    fn is_closed(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// Scripted -------------------------------------------------------------------

/// Answers each execution with the next queued result and records what was
/// sent.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    replies: Arc<Mutex<VecDeque<CommandResult>>>,
    seen: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl ScriptedConnector {
    /// Queues a reply with the given exit status and stdout.
    pub fn reply(self, exit_status: u32, stdout: &str) -> Self {
        self.reply_with(CommandResult {
            exit_status,
            stdout: stdout.as_bytes().to_vec(),
            ..CommandResult::default()
        })
    }

    pub fn reply_with(self, result: CommandResult) -> Self {
        self.replies.lock().unwrap().push_back(result);
        self
    }

    /// Scripts executed so far.
    pub fn scripts(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(script, _)| script.clone())
            .collect()
    }

    /// Stdin sent with each execution.
    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, stdin)| stdin.clone())
            .collect()
    }

    pub fn session(&self) -> Session {
        Session::builder().connector(Arc::new(self.clone())).build()
    }
}

#[async_trait]
impl Connect for ScriptedConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ConnectError> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Transport for ScriptedConnector {
    async fn open_channel(&self) -> Result<Box<dyn Channel>> {
        Ok(Box::new(ScriptedChannel {
            owner: self.clone(),
            script: String::new(),
            events: VecDeque::new(),
        }))
    }

    fn is_closed(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct ScriptedChannel {
    owner: ScriptedConnector,
    script: String,
    events: VecDeque<ChannelEvent>,
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn exec(&mut self, command: &str) -> Result<()> {
        let reply = self
            .owner
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no reply queued for: {command}"))?;
        self.script = command.to_owned();
        self.events = CannedChannel::new(reply).events;
        Ok(())
    }

    async fn send_stdin(&mut self, data: &[u8]) -> Result<()> {
        self.owner
            .seen
            .lock()
            .unwrap()
            .push((std::mem::take(&mut self.script), data.to_vec()));
        Ok(())
    }

    async fn wait(&mut self) -> Option<ChannelEvent> {
        self.events.pop_front()
    }

    async fn interrupt(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// Canned ---------------------------------------------------------------------

/// Replays a fixed result as channel events.
struct CannedChannel {
    events: VecDeque<ChannelEvent>,
}

impl CannedChannel {
    fn new(result: CommandResult) -> Self {
        let mut events = VecDeque::new();
        if !result.stdout.is_empty() {
            events.push_back(ChannelEvent::Stdout(result.stdout));
        }
        if !result.stderr.is_empty() {
            events.push_back(ChannelEvent::Stderr(result.stderr));
        }
        events.push_back(ChannelEvent::Exit(result.exit_status));
        Self { events }
    }
}

#[async_trait]
impl Channel for CannedChannel {
    async fn exec(&mut self, _command: &str) -> Result<()> {
        Ok(())
    }

    async fn send_stdin(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn wait(&mut self) -> Option<ChannelEvent> {
        self.events.pop_front()
    }

    async fn interrupt(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
