//! In-memory collaborators and a scripted shell launcher for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::VboxError;
use crate::identity::{IdentityService, UserRecord};
use crate::store::{ObjectMeta, ObjectStore};
use crate::suggest::{SuggestionRequest, SuggestionService};
use crate::terminal::{ShellLauncher, ShellProcess, ShellSpec, SpawnedShell};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Object store backed by a sorted map, counting every call.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, String>>,
    failing_deletes: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    put_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objects<'a>(objects: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let store = Self::new();
        lock(&store.objects).extend(
            objects
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        store
    }

    pub fn body(&self, key: &str) -> Option<String> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    /// Make every later delete of `key` fail.
    pub fn fail_deletes_of(&self, key: &str) {
        lock(&self.failing_deletes).insert(key.to_string());
    }

    /// Make every later call fail as if storage were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), VboxError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(VboxError::UpstreamUnavailable("storage offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, VboxError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(lock(&self.objects)
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, body)| ObjectMeta {
                key: key.clone(),
                size: body.len() as u64,
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, VboxError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.body(key))
    }

    async fn put(&self, key: &str, body: &str) -> Result<(), VboxError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        lock(&self.objects).insert(key.to_string(), body.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), VboxError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if lock(&self.failing_deletes).contains(key) {
            return Err(VboxError::UpstreamUnavailable(format!("delete of {key} refused")));
        }
        lock(&self.objects).remove(key);
        Ok(())
    }
}

/// Identity service with a fixed user table.
#[derive(Default)]
pub struct MemoryIdentity {
    users: Mutex<HashMap<String, UserRecord>>,
    generations: Mutex<Vec<String>>,
    unavailable: AtomicBool,
}

impl MemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, user: UserRecord) -> Self {
        self.insert(user);
        self
    }

    pub fn insert(&self, user: UserRecord) {
        lock(&self.users).insert(user.id.clone(), user);
    }

    /// Users whose generations were recorded, in order.
    pub fn generations(&self) -> Vec<String> {
        lock(&self.generations).clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityService for MemoryIdentity {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, VboxError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(VboxError::UpstreamUnavailable("identity offline".into()));
        }
        Ok(lock(&self.users).get(user_id).cloned())
    }

    async fn record_generation(&self, user_id: &str) -> Result<(), VboxError> {
        lock(&self.generations).push(user_id.to_string());
        Ok(())
    }
}

/// Suggestion service answering every request with the same text.
pub struct StaticSuggestions {
    reply: String,
    delay: Duration,
}

impl StaticSuggestions {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SuggestionService for StaticSuggestions {
    async fn suggest(&self, _request: &SuggestionRequest) -> Result<String, VboxError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.reply.clone())
    }
}

#[derive(Default)]
struct FakeShellState {
    input: Vec<u8>,
    size: Option<(u16, u16)>,
    resizes: usize,
    output: Option<std_mpsc::Sender<Vec<u8>>>,
    exit: Option<std_mpsc::Sender<Option<u32>>>,
}

impl FakeShellState {
    fn finish(&mut self, exit_code: Option<u32>) {
        self.output = None;
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(exit_code);
        }
    }
}

struct FakeShell {
    spec: ShellSpec,
    state: Arc<Mutex<FakeShellState>>,
}

/// Launcher whose shells echo nothing on their own; tests script their output
/// and exit through the launcher, indexed by spawn order.
#[derive(Default)]
pub struct FakeLauncher {
    shells: Mutex<Vec<FakeShell>>,
    kills: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_count(&self) -> usize {
        lock(&self.shells).len()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn spawned(&self) -> Vec<ShellSpec> {
        lock(&self.shells).iter().map(|s| s.spec.clone()).collect()
    }

    pub fn input_of(&self, index: usize) -> Vec<u8> {
        self.with_state(index, |s| s.input.clone()).unwrap_or_default()
    }

    pub fn size_of(&self, index: usize) -> Option<(u16, u16)> {
        self.with_state(index, |s| s.size).flatten()
    }

    pub fn resize_count(&self, index: usize) -> usize {
        self.with_state(index, |s| s.resizes).unwrap_or(0)
    }

    /// Make shell `index` print `data`.
    pub fn emit_output(&self, index: usize, data: &str) {
        self.with_state(index, |s| {
            if let Some(output) = &s.output {
                let _ = output.send(data.as_bytes().to_vec());
            }
        });
    }

    /// Make shell `index` exit on its own.
    pub fn exit(&self, index: usize, exit_code: Option<u32>) {
        self.with_state(index, |s| s.finish(exit_code));
    }

    fn with_state<R>(&self, index: usize, f: impl FnOnce(&mut FakeShellState) -> R) -> Option<R> {
        let shells = lock(&self.shells);
        let shell = shells.get(index)?;
        let mut state = lock(&shell.state);
        Some(f(&mut state))
    }
}

impl ShellLauncher for FakeLauncher {
    fn spawn(&self, spec: &ShellSpec) -> Result<SpawnedShell, VboxError> {
        let (output_tx, output_rx) = std_mpsc::channel();
        let (exit_tx, exit_rx) = std_mpsc::channel();
        let state = Arc::new(Mutex::new(FakeShellState {
            output: Some(output_tx),
            exit: Some(exit_tx),
            ..Default::default()
        }));
        lock(&self.shells).push(FakeShell {
            spec: spec.clone(),
            state: state.clone(),
        });
        Ok(SpawnedShell {
            process: Box::new(FakeProcess {
                state,
                kills: self.kills.clone(),
            }),
            output: Box::new(ChannelReader {
                rx: output_rx,
                buffered: Vec::new(),
            }),
            wait: Box::new(move || exit_rx.recv().ok().flatten()),
        })
    }
}

struct FakeProcess {
    state: Arc<Mutex<FakeShellState>>,
    kills: Arc<AtomicUsize>,
}

impl ShellProcess for FakeProcess {
    fn write_input(&mut self, data: &[u8]) -> io::Result<()> {
        lock(&self.state).input.extend_from_slice(data);
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), VboxError> {
        let mut state = lock(&self.state);
        state.size = Some((cols, rows));
        state.resizes += 1;
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), VboxError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        lock(&self.state).finish(None);
        Ok(())
    }
}

struct ChannelReader {
    rx: std_mpsc::Receiver<Vec<u8>>,
    buffered: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffered.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.buffered = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.buffered.len());
        buf[..n].copy_from_slice(&self.buffered[..n]);
        self.buffered.drain(..n);
        Ok(n)
    }
}
