//! Shell terminals of a box, each backed by a PTY and shared by its collaborators.

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vbox_protocol::{
    ConnectionId, DEFAULT_TERMINAL_COLS, DEFAULT_TERMINAL_ROWS, ServerEvent, TerminalId,
};

use crate::error::VboxError;

pub const DEFAULT_MAX_TERMINALS: usize = 4;

/// Program started in every new terminal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ShellCommand {
    fn default() -> Self {
        Self {
            program: "bash".to_string(),
            args: Vec::new(),
        }
    }
}

/// Everything needed to start one shell.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub command: ShellCommand,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Control side of a running shell.
pub trait ShellProcess: Send {
    fn write_input(&mut self, data: &[u8]) -> io::Result<()>;
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), VboxError>;
    fn terminate(&mut self) -> Result<(), VboxError>;
}

/// A freshly started shell: its control handle, its output stream, and a
/// blocking wait for its exit code.
pub struct SpawnedShell {
    pub process: Box<dyn ShellProcess>,
    pub output: Box<dyn Read + Send>,
    pub wait: Box<dyn FnOnce() -> Option<u32> + Send>,
}

pub trait ShellLauncher: Send + Sync {
    fn spawn(&self, spec: &ShellSpec) -> Result<SpawnedShell, VboxError>;
}

/// Starts shells on a native pseudo-terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtyLauncher;

struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl ShellLauncher for PtyLauncher {
    fn spawn(&self, spec: &ShellSpec) -> Result<SpawnedShell, VboxError> {
        let pty_pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| VboxError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.command.program);
        cmd.args(&spec.command.args);
        cmd.cwd(&spec.cwd);
        cmd.env("TERM", "xterm");

        let mut child = pty_pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| VboxError::Pty(e.to_string()))?;
        drop(pty_pair.slave);

        let killer = child.clone_killer();
        let output = pty_pair
            .master
            .try_clone_reader()
            .map_err(|e| VboxError::Pty(e.to_string()))?;
        let writer = pty_pair
            .master
            .take_writer()
            .map_err(|e| VboxError::Pty(e.to_string()))?;

        Ok(SpawnedShell {
            process: Box::new(PtyProcess {
                master: pty_pair.master,
                writer,
                killer,
            }),
            output,
            wait: Box::new(move || child.wait().ok().map(|status| status.exit_code())),
        })
    }
}

impl ShellProcess for PtyProcess {
    fn write_input(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), VboxError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| VboxError::Pty(e.to_string()))
    }

    fn terminate(&mut self) -> Result<(), VboxError> {
        match self.killer.kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(VboxError::Io(e)),
        }
    }
}

/// Produced by the per-terminal reader threads, consumed by the box session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Output {
        id: TerminalId,
        generation: u64,
        data: String,
    },
    Exited {
        id: TerminalId,
        generation: u64,
        exit_code: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Running,
    Exited { exit_code: Option<u32> },
}

struct Terminal {
    generation: u64,
    process: Box<dyn ShellProcess>,
    state: TerminalState,
    subscribers: BTreeSet<ConnectionId>,
}

/// The terminals of one box.
///
/// Exited terminals stay registered (and count against the cap) until closed.
pub struct TerminalMultiplexer {
    launcher: Arc<dyn ShellLauncher>,
    command: ShellCommand,
    cwd: PathBuf,
    max_terminals: usize,
    terminals: HashMap<TerminalId, Terminal>,
    events: mpsc::UnboundedSender<TerminalEvent>,
    next_generation: u64,
}

impl TerminalMultiplexer {
    pub fn new(
        launcher: Arc<dyn ShellLauncher>,
        command: ShellCommand,
        max_terminals: usize,
        events: mpsc::UnboundedSender<TerminalEvent>,
    ) -> Self {
        Self {
            launcher,
            command,
            cwd: std::env::temp_dir(),
            max_terminals,
            terminals: HashMap::new(),
            events,
            next_generation: 0,
        }
    }

    /// Directory new shells start in.
    pub fn set_working_dir(&mut self, cwd: &Path) {
        self.cwd = cwd.to_path_buf();
    }

    pub fn len(&self) -> usize {
        self.terminals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terminals.is_empty()
    }

    pub fn state(&self, id: &str) -> Option<TerminalState> {
        self.terminals.get(id).map(|t| t.state)
    }

    /// Start a shell registered as `id`, streaming to `subscribers`.
    pub fn create(
        &mut self,
        id: &str,
        subscribers: impl IntoIterator<Item = ConnectionId>,
    ) -> Result<(), VboxError> {
        if self.terminals.contains_key(id) {
            return Err(VboxError::InvalidRequest(format!("terminal {id} already exists")));
        }
        if self.terminals.len() >= self.max_terminals {
            return Err(VboxError::TerminalQuota(self.max_terminals));
        }

        let spec = ShellSpec {
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            cols: DEFAULT_TERMINAL_COLS,
            rows: DEFAULT_TERMINAL_ROWS,
        };
        let SpawnedShell {
            mut process,
            output,
            wait,
        } = self.launcher.spawn(&spec)?;

        self.next_generation += 1;
        let generation = self.next_generation;
        spawn_pumps(id.to_string(), generation, output, wait, self.events.clone());

        if let Err(e) = process.write_input(b"clear\r") {
            debug!(terminal = id, "initial clear failed: {e}");
        }

        self.terminals.insert(
            id.to_string(),
            Terminal {
                generation,
                process,
                state: TerminalState::Running,
                subscribers: subscribers.into_iter().collect(),
            },
        );
        info!(terminal = id, cwd = %self.cwd.display(), "terminal created");
        Ok(())
    }

    /// Forward keystrokes. Unknown or exited terminals ignore input.
    pub fn write(&mut self, id: &str, data: &[u8]) {
        let Some(terminal) = self.terminals.get_mut(id) else {
            debug!(terminal = id, "input for unknown terminal dropped");
            return;
        };
        if terminal.state != TerminalState::Running {
            return;
        }
        if let Err(e) = terminal.process.write_input(data) {
            debug!(terminal = id, "terminal write failed: {e}");
        }
    }

    pub fn resize(&mut self, id: &str, cols: u16, rows: u16) -> Result<(), VboxError> {
        let terminal = self
            .terminals
            .get_mut(id)
            .ok_or_else(|| VboxError::TerminalNotFound(id.to_string()))?;
        if terminal.state != TerminalState::Running {
            return Ok(());
        }
        terminal.process.resize(cols, rows)
    }

    /// Resize every running terminal. Returns how many were resized.
    pub fn resize_all(&mut self, cols: u16, rows: u16) -> usize {
        let mut resized = 0;
        for (id, terminal) in self.terminals.iter_mut() {
            if terminal.state != TerminalState::Running {
                continue;
            }
            match terminal.process.resize(cols, rows) {
                Ok(()) => resized += 1,
                Err(e) => warn!(terminal = %id, "resize failed: {e}"),
            }
        }
        resized
    }

    /// Terminate and unregister one terminal.
    pub fn close(&mut self, id: &str) -> Result<(), VboxError> {
        let mut terminal = self
            .terminals
            .remove(id)
            .ok_or_else(|| VboxError::TerminalNotFound(id.to_string()))?;
        shut_down(id, &mut terminal);
        info!(terminal = id, "terminal closed");
        Ok(())
    }

    /// Terminate and unregister every terminal. Returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        let closed = self.terminals.len();
        for (id, mut terminal) in self.terminals.drain() {
            shut_down(&id, &mut terminal);
        }
        if closed > 0 {
            info!(closed, "terminals closed");
        }
        closed
    }

    /// Stream every existing terminal to `connection` as well.
    pub fn subscribe_all(&mut self, connection: &str) {
        for terminal in self.terminals.values_mut() {
            terminal.subscribers.insert(connection.to_string());
        }
    }

    pub fn unsubscribe_all(&mut self, connection: &str) {
        for terminal in self.terminals.values_mut() {
            terminal.subscribers.remove(connection);
        }
    }

    /// Resolve a reader-thread event into its recipients and wire event.
    /// Events from closed or replaced terminals resolve to nothing.
    pub fn route(&mut self, event: TerminalEvent) -> Option<(Vec<ConnectionId>, ServerEvent)> {
        match event {
            TerminalEvent::Output {
                id,
                generation,
                data,
            } => {
                let terminal = self.terminals.get(&id).filter(|t| t.generation == generation)?;
                let recipients = terminal.subscribers.iter().cloned().collect();
                Some((recipients, ServerEvent::TerminalResponse { id, data }))
            }
            TerminalEvent::Exited {
                id,
                generation,
                exit_code,
            } => {
                let terminal = self
                    .terminals
                    .get_mut(&id)
                    .filter(|t| t.generation == generation)?;
                terminal.state = TerminalState::Exited { exit_code };
                info!(terminal = %id, ?exit_code, "terminal exited");
                let recipients = terminal.subscribers.iter().cloned().collect();
                Some((recipients, ServerEvent::TerminalExited { id, exit_code }))
            }
        }
    }
}

impl Drop for TerminalMultiplexer {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn shut_down(id: &str, terminal: &mut Terminal) {
    if terminal.state == TerminalState::Running
        && let Err(e) = terminal.process.terminate()
    {
        warn!(terminal = id, "terminate failed: {e}");
    }
}

fn spawn_pumps(
    id: TerminalId,
    generation: u64,
    output: Box<dyn Read + Send>,
    wait: Box<dyn FnOnce() -> Option<u32> + Send>,
    events: mpsc::UnboundedSender<TerminalEvent>,
) {
    let output_events = events.clone();
    let output_id = id.clone();
    std::thread::spawn(move || pump_output(output_id, generation, output, output_events));
    std::thread::spawn(move || {
        let exit_code = wait();
        let _ = events.send(TerminalEvent::Exited {
            id,
            generation,
            exit_code,
        });
    });
}

fn pump_output(
    id: TerminalId,
    generation: u64,
    mut reader: Box<dyn Read + Send>,
    events: mpsc::UnboundedSender<TerminalEvent>,
) {
    let mut buf = [0u8; 8192];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                if let Some(data) = take_utf8(&mut pending) {
                    let event = TerminalEvent::Output {
                        id: id.clone(),
                        generation,
                        data,
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(terminal = %id, "pty read ended: {e}");
                break;
            }
        }
    }
    if !pending.is_empty() {
        let _ = events.send(TerminalEvent::Output {
            id,
            generation,
            data: String::from_utf8_lossy(&pending).into_owned(),
        });
    }
}

/// Split off the longest decodable prefix, holding back an incomplete
/// trailing sequence for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> Option<String> {
    let ready = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    if ready == 0 {
        return None;
    }
    let chunk: Vec<u8> = pending.drain(..ready).collect();
    Some(String::from_utf8_lossy(&chunk).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLauncher;

    fn multiplexer(max: usize) -> (
        TerminalMultiplexer,
        Arc<FakeLauncher>,
        mpsc::UnboundedReceiver<TerminalEvent>,
    ) {
        let launcher = Arc::new(FakeLauncher::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let mux = TerminalMultiplexer::new(launcher.clone(), ShellCommand::default(), max, tx);
        (mux, launcher, rx)
    }

    #[test]
    fn create_starts_shell_with_defaults() {
        let (mut mux, launcher, _rx) = multiplexer(4);
        mux.create("t1", ["c1".to_string()]).unwrap();
        let spawned = launcher.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].command.program, "bash");
        assert_eq!((spawned[0].cols, spawned[0].rows), (100, 24));
        assert_eq!(spawned[0].cwd, std::env::temp_dir());
        assert_eq!(launcher.input_of(0), b"clear\r");
        assert_eq!(mux.state("t1"), Some(TerminalState::Running));
    }

    #[test]
    fn shells_start_in_working_dir() {
        let (mut mux, launcher, _rx) = multiplexer(4);
        let dir = tempfile::tempdir().unwrap();
        mux.set_working_dir(dir.path());
        mux.create("t1", []).unwrap();
        assert_eq!(launcher.spawned()[0].cwd, dir.path());
    }

    #[test]
    fn cap_and_duplicate_ids_rejected() {
        let (mut mux, launcher, _rx) = multiplexer(2);
        mux.create("t1", []).unwrap();
        assert!(matches!(
            mux.create("t1", []).unwrap_err(),
            VboxError::InvalidRequest(_)
        ));
        mux.create("t2", []).unwrap();
        assert!(matches!(
            mux.create("t3", []).unwrap_err(),
            VboxError::TerminalQuota(2)
        ));
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[test]
    fn write_ignores_unknown_terminals() {
        let (mut mux, launcher, _rx) = multiplexer(4);
        mux.create("t1", []).unwrap();
        mux.write("t1", b"ls\r");
        mux.write("nope", b"rm -rf /\r");
        assert_eq!(launcher.input_of(0), b"clear\rls\r");
    }

    #[test]
    fn resize_targets_one_or_all() {
        let (mut mux, launcher, _rx) = multiplexer(4);
        mux.create("t1", []).unwrap();
        mux.create("t2", []).unwrap();
        mux.resize("t1", 120, 40).unwrap();
        assert!(matches!(
            mux.resize("t9", 1, 1).unwrap_err(),
            VboxError::TerminalNotFound(_)
        ));
        assert_eq!(mux.resize_all(80, 30), 2);
        assert_eq!(launcher.size_of(0), Some((80, 30)));
        assert_eq!(launcher.resize_count(0), 2);
        assert_eq!(launcher.resize_count(1), 1);
    }

    #[test]
    fn close_terminates_and_unregisters() {
        let (mut mux, launcher, _rx) = multiplexer(4);
        mux.create("t1", []).unwrap();
        mux.create("t2", []).unwrap();
        mux.close("t1").unwrap();
        assert!(mux.state("t1").is_none());
        assert!(matches!(
            mux.close("t1").unwrap_err(),
            VboxError::TerminalNotFound(_)
        ));
        assert_eq!(mux.close_all(), 1);
        assert_eq!(launcher.kill_count(), 2);
        assert!(mux.is_empty());
    }

    #[tokio::test]
    async fn output_is_routed_to_subscribers() {
        let (mut mux, launcher, mut rx) = multiplexer(4);
        mux.create("t1", ["c1".to_string()]).unwrap();
        mux.subscribe_all("c2");
        launcher.emit_output(0, "hello\r\n");

        let event = rx.recv().await.unwrap();
        let (recipients, wire) = mux.route(event).unwrap();
        assert_eq!(recipients, vec!["c1".to_string(), "c2".to_string()]);
        assert_eq!(
            wire,
            ServerEvent::TerminalResponse {
                id: "t1".into(),
                data: "hello\r\n".into()
            }
        );
    }

    #[tokio::test]
    async fn exit_keeps_terminal_registered() {
        let (mut mux, launcher, mut rx) = multiplexer(1);
        mux.create("t1", ["c1".to_string()]).unwrap();
        launcher.exit(0, Some(0));

        let event = loop {
            let event = rx.recv().await.unwrap();
            if matches!(event, TerminalEvent::Exited { .. }) {
                break event;
            }
        };
        let (_, wire) = mux.route(event).unwrap();
        assert_eq!(
            wire,
            ServerEvent::TerminalExited {
                id: "t1".into(),
                exit_code: Some(0)
            }
        );
        assert_eq!(mux.state("t1"), Some(TerminalState::Exited { exit_code: Some(0) }));
        mux.write("t1", b"ignored");
        assert_eq!(launcher.input_of(0), b"clear\r");
        assert!(matches!(
            mux.create("t2", []).unwrap_err(),
            VboxError::TerminalQuota(1)
        ));
    }

    #[test]
    fn stale_events_are_dropped() {
        let (mut mux, _launcher, _rx) = multiplexer(4);
        mux.create("t1", []).unwrap();
        mux.close("t1").unwrap();
        mux.create("t1", []).unwrap();
        let stale = TerminalEvent::Output {
            id: "t1".into(),
            generation: 1,
            data: "old".into(),
        };
        assert!(mux.route(stale).is_none());
    }

    #[test]
    fn utf8_split_across_reads() {
        let mut pending = "héllo".as_bytes()[..2].to_vec();
        assert_eq!(take_utf8(&mut pending).as_deref(), Some("h"));
        assert_eq!(pending.len(), 1);
        pending.extend_from_slice(&"héllo".as_bytes()[2..]);
        assert_eq!(take_utf8(&mut pending).as_deref(), Some("éllo"));
        assert!(pending.is_empty());
    }
}
