//! Run modes
//!
//! Three arrangements share one command protocol:
//! - `Daemon`: one process, all sessions in one registry, "coordinator"
//!   commands applied directly to the local sessions.
//! - `ForkDaemon`: a coordinator that forks one worker per accepted
//!   connection and talks to each over an IPC channel pair.
//! - `Inetd`: a single session on stdin, no listener at all.
//!
//! All loops are readiness-driven: nonblocking descriptors registered with
//! a poller, re-armed each iteration with write interest only while output
//! is queued.

use std::ffi::CString;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execv, fork, ForkResult, Pid};
use polling::{Event, Events, Poller};
use tracing::{debug, error, info, warn};

use crate::auth::MemoryStore;
use crate::command::{self, Action, Ctx};
use crate::config::{Config, RunMode};
use crate::error::{GatewayError, Result};
use crate::ipc::channel::{IpcChannel, ReadOutcome};
use crate::ipc::child::{ChildDisposition, ChildLink};
use crate::ipc::master::{self, Disposition, WorkerRecord, WorkerTable};
use crate::line;
use crate::registry::Registry;
use crate::session::{IoStatus, Session, Status};
use crate::takeover;

/// Startup parameters that are not part of the config file
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    /// Where the config came from, for reloads and restarts
    pub config_path: Option<PathBuf>,
    /// Hand-off file left by a restarting coordinator
    pub state_file: Option<PathBuf>,
}

pub fn run(cfg: Config, opts: RunOptions) -> Result<()> {
    match cfg.run_mode {
        RunMode::Daemon => run_daemon(cfg, opts),
        RunMode::ForkDaemon => run_forkdaemon(cfg, opts),
        RunMode::Inetd => run_inetd(cfg, opts),
    }
}

const TICK: Duration = Duration::from_secs(1);

fn rearm(poller: &Poller, fd: RawFd, key: usize, want_write: bool) {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let event = if want_write {
        Event::all(key)
    } else {
        Event::readable(key)
    };
    let _ = poller.modify(&borrowed, event);
}

fn register(poller: &Poller, fd: RawFd, key: usize) -> std::io::Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    unsafe { poller.add(&borrowed, Event::readable(key)) }
}

// ---- single-process modes ----

const LISTENER_KEY: usize = usize::MAX;

fn run_daemon(cfg: Config, opts: RunOptions) -> Result<()> {
    let listener = TcpListener::bind(cfg.listen_addr()).map_err(|source| GatewayError::Bind {
        addr: cfg.listen_addr(),
        source,
    })?;
    listener.set_nonblocking(true)?;
    info!(addr = %cfg.listen_addr(), "listening");
    serve_local(cfg, opts, Some(listener), Registry::new(), false)
}

fn run_inetd(cfg: Config, opts: RunOptions) -> Result<()> {
    // Safety: inetd hands us the accepted connection as fd 0 and nothing
    // else in this process reads stdin.
    let stream = unsafe { TcpStream::from_raw_fd(0) };
    let host = peer_host(&stream);
    let session = Session::from_stream(stream, cfg.hostname.clone(), host)?;
    let mut reg = Registry::new();
    reg.insert(session);
    serve_local(cfg, opts, None, reg, true)
}

fn peer_host(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn serve_local(
    mut cfg: Config,
    opts: RunOptions,
    listener: Option<TcpListener>,
    mut reg: Registry,
    exit_when_empty: bool,
) -> Result<()> {
    let mut store = MemoryStore::new(cfg.accounts.clone());
    let poller = Poller::new()?;
    let mut events = Events::new();

    if let Some(listener) = &listener {
        register(&poller, listener.as_raw_fd(), LISTENER_KEY)?;
    }
    for id in reg.ids() {
        if let Some(fd) = reg.get(id).and_then(|s| s.raw_fd()) {
            register(&poller, fd, id)?;
        }
    }

    let mut accepting = true;
    loop {
        check_pings(&mut reg, &cfg);
        sweep_closed(&mut reg, &mut store, &cfg, &poller);
        if exit_when_empty && reg.is_empty() {
            return Ok(());
        }

        events.clear();
        if poller.wait(&mut events, Some(TICK)).is_err() {
            continue;
        }

        let mut signals = LoopSignals::default();
        for event in events.iter() {
            match event.key {
                LISTENER_KEY => {
                    if let Some(listener) = listener.as_ref().filter(|_| accepting) {
                        accept_local(listener, &mut reg, &cfg, &poller);
                        rearm(&poller, listener.as_raw_fd(), LISTENER_KEY, false);
                    }
                }
                id => {
                    if event.readable {
                        let mut ctx = Ctx {
                            cfg: &cfg,
                            store: &mut store,
                        };
                        session_input(&mut reg, &mut ctx, id, &poller, &mut signals);
                    }
                }
            }
        }

        // Reload outside the event loop so handlers saw a stable config.
        if signals.rehash {
            reload_config(&mut cfg, &mut store, opts.config_path.as_deref());
        }
        if signals.deaf && accepting {
            accepting = false;
            if let Some(listener) = &listener {
                info!("no longer accepting new connections");
                let borrowed = unsafe { BorrowedFd::borrow_raw(listener.as_raw_fd()) };
                let _ = poller.delete(&borrowed);
            }
        }

        flush_and_rearm(&mut reg, &poller);
        if signals.shutdown {
            return Ok(());
        }
    }
}

#[derive(Default)]
struct LoopSignals {
    shutdown: bool,
    rehash: bool,
    deaf: bool,
}

fn accept_local(listener: &TcpListener, reg: &mut Registry, cfg: &Config, poller: &Poller) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                let host = addr.ip().to_string();
                match Session::from_stream(stream, cfg.hostname.clone(), host) {
                    Ok(session) => {
                        let id = reg.insert(session);
                        let fd = reg.get(id).and_then(|s| s.raw_fd());
                        if let Some(fd) = fd {
                            if let Err(e) = register(poller, fd, id) {
                                warn!(error = %e, "could not watch new connection");
                                reg.remove(id);
                            } else {
                                debug!(session = id, "accepted connection");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping connection at accept"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Read and dispatch everything one session has buffered
fn session_input(
    reg: &mut Registry,
    ctx: &mut Ctx,
    id: usize,
    poller: &Poller,
    signals: &mut LoopSignals,
) {
    let status = match reg.get_mut(id) {
        Some(session) => session.read_ready(),
        None => return,
    };
    if status == IoStatus::Closed {
        drop_session(reg, ctx, id, poller);
        return;
    }

    let lines = reg
        .get_mut(id)
        .map(|s| s.take_lines())
        .unwrap_or_default();
    for raw in lines {
        let Some(argv) = line::parse(&raw) else { continue };
        let actions = match reg.get_mut(id) {
            Some(session) => command::dispatch(session, ctx, &argv),
            None => break,
        };
        apply_local_actions(reg, ctx, id, actions, poller, signals);
        if signals.shutdown {
            return;
        }
    }
}

/// Interpret handler actions against the local registry. This is the
/// single-process stand-in for the coordinator.
fn apply_local_actions(
    reg: &mut Registry,
    ctx: &mut Ctx,
    from: usize,
    actions: Vec<Action>,
    poller: &Poller,
    signals: &mut LoopSignals,
) {
    for action in actions {
        match action {
            Action::Close => {
                // Flushed and removed by the next sweep.
            }
            Action::Forward(argv) => {
                forward_local(reg, ctx, from, &argv, signals);
            }
            Action::IdentifyRequest { nick, password } => {
                let result = takeover::handle_identify(reg, ctx, from, &nick, &password);
                apply_takeover_result(reg, ctx, from, result, poller, signals);
            }
            Action::TakeoverAnswer(accept) => {
                let result = takeover::handle_answer(reg, ctx, from, accept);
                apply_takeover_result(reg, ctx, from, result, poller, signals);
            }
        }
        if signals.shutdown {
            return;
        }
    }
}

fn apply_takeover_result(
    reg: &mut Registry,
    ctx: &mut Ctx,
    from: usize,
    result: takeover::TakeoverResult,
    poller: &Poller,
    signals: &mut LoopSignals,
) {
    if let Some(rewired) = result.rewired {
        if let Some(fd) = reg.get(rewired).and_then(|s| s.raw_fd()) {
            if register(poller, fd, rewired).is_err() {
                warn!(session = rewired, "could not watch adopted socket");
            }
        }
    }
    // `removed` sessions already left the registry; their sockets drop out
    // of the poll set when the descriptor closes.
    apply_local_actions(reg, ctx, from, result.actions, poller, signals);
}

/// The coordinator commands, applied directly to local sessions
fn forward_local(
    reg: &mut Registry,
    ctx: &mut Ctx,
    from: usize,
    argv: &[String],
    signals: &mut LoopSignals,
) {
    let Some(cmd) = argv.first() else {
        return;
    };
    match cmd.to_ascii_lowercase().as_str() {
        // Worker-table announcements have no meaning when the sessions
        // are already in front of us.
        "client" | "nick" | "password" => {}
        "rehash" => {
            signals.rehash = true;
        }
        "deaf" => {
            signals.deaf = true;
        }
        "wallops" | "wall" | "opmsg" => {
            let Some(text) = argv.get(1) else { return };
            let gate = match cmd.to_ascii_lowercase().as_str() {
                "wallops" => 'w',
                "wall" => 's',
                _ => 'o',
            };
            for id in reg.ids() {
                if id == from {
                    continue;
                }
                if let Some(session) = reg.get_mut(id) {
                    if !session.umode.contains(gate) {
                        continue;
                    }
                    let prefix = format!(":{}", session.server_name);
                    if gate == 'w' {
                        session.write_argv(&[&prefix, "WALLOPS", text]);
                    } else {
                        let nick = session.nick_or_star().to_string();
                        session.write_argv(&[&prefix, "NOTICE", &nick, text]);
                    }
                }
            }
        }
        "kill" => {
            let Some(target) = argv.get(1) else { return };
            let reason = argv.get(2).map(String::as_str).unwrap_or("Killed");
            for id in reg.ids() {
                let matched = reg.get(id).is_some_and(|s| {
                    s.nick.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(target))
                });
                if matched {
                    if let Some(session) = reg.get_mut(id) {
                        session.write_argv(&["ERROR", &format!("Closing link: {reason}")]);
                        session.status.insert(Status::SHUTDOWN);
                    }
                }
            }
        }
        "die" => {
            info!("shutdown requested");
            for id in reg.ids() {
                if let Some(session) = reg.get_mut(id) {
                    session.write_argv(&["ERROR", "Server going down"]);
                    session.flush();
                }
            }
            signals.shutdown = true;
        }
        "restart" => {
            // Live client sockets cannot cross an exec without a worker
            // process to hold them.
            if let Some(session) = reg.get_mut(from) {
                session.usermsg(
                    &ctx.cfg.service_nick,
                    &ctx.cfg.control_channel,
                    "Restart is only available in the forked run mode.",
                );
            }
        }
        other => {
            debug!(cmd = other, "ignoring unknown forwarded command");
        }
    }
}

fn drop_session(reg: &mut Registry, ctx: &mut Ctx, id: usize, poller: &Poller) {
    if let Some(session) = reg.remove(id) {
        debug!(session = id, nick = ?session.nick, "connection closed");
    }
    let result = takeover::handle_peer_gone(reg, ctx, id);
    let mut signals = LoopSignals::default();
    apply_local_actions(reg, ctx, id, result.actions, poller, &mut signals);
}

fn check_pings(reg: &mut Registry, cfg: &Config) {
    let timeout = Duration::from_secs(cfg.ping_timeout);
    for id in reg.ids() {
        let Some(session) = reg.get_mut(id) else { continue };
        let silent = session.last_pong.elapsed();
        if silent > timeout {
            session.write_argv(&["ERROR", "Closing link: Ping timeout"]);
            session.status.insert(Status::SHUTDOWN);
        } else if silent > timeout / 2 && !session.ping_sent {
            session.ping_sent = true;
            let name = session.server_name.clone();
            session.write_argv(&["PING", &name]);
        }
    }
}

fn sweep_closed(reg: &mut Registry, store: &mut MemoryStore, cfg: &Config, poller: &Poller) {
    for id in reg.ids() {
        let done = reg.get_mut(id).is_some_and(|session| {
            if session.status.contains(Status::SHUTDOWN) {
                session.flush();
                true
            } else {
                false
            }
        });
        if done {
            let mut ctx = Ctx {
                cfg,
                store: &mut *store,
            };
            drop_session(reg, &mut ctx, id, poller);
        }
    }
}

fn flush_and_rearm(reg: &mut Registry, poller: &Poller) {
    for id in reg.ids() {
        let Some(session) = reg.get_mut(id) else { continue };
        if session.has_output() {
            session.flush();
        }
        if let Some(fd) = session.raw_fd() {
            let want_write = session.has_output();
            rearm(poller, fd, id, want_write);
        }
    }
}

fn reload_config(cfg: &mut Config, store: &mut MemoryStore, path: Option<&Path>) {
    match Config::load(path) {
        Ok(mut fresh) => {
            // Listener-shaping settings only apply at startup.
            fresh.interface = cfg.interface.clone();
            fresh.port = cfg.port;
            fresh.run_mode = cfg.run_mode;
            *store = MemoryStore::new(fresh.accounts.clone());
            *cfg = fresh;
            info!("configuration reloaded");
        }
        Err(e) => error!(error = %e, "configuration reload failed, keeping the old one"),
    }
}

// ---- coordinator + forked workers ----

const UDS_KEY: usize = usize::MAX - 1;

fn run_forkdaemon(cfg: Config, opts: RunOptions) -> Result<()> {
    let listener = TcpListener::bind(cfg.listen_addr()).map_err(|source| GatewayError::Bind {
        addr: cfg.listen_addr(),
        source,
    })?;
    listener.set_nonblocking(true)?;
    info!(addr = %cfg.listen_addr(), "listening (forking per connection)");

    let uds = match &cfg.ipc_socket {
        Some(path) => {
            let _ = std::fs::remove_file(path);
            let uds = UnixListener::bind(path).map_err(|source| GatewayError::IpcSocket {
                path: path.clone(),
                source,
            })?;
            uds.set_nonblocking(true)?;
            Some(uds)
        }
        None => None,
    };

    let mut table = WorkerTable::new();
    let poller = Poller::new()?;
    let mut events = Events::new();
    register(&poller, listener.as_raw_fd(), LISTENER_KEY)?;
    if let Some(uds) = &uds {
        register(&poller, uds.as_raw_fd(), UDS_KEY)?;
    }

    // A restarted coordinator inherits its workers through the hand-off
    // file and asks them to re-announce themselves.
    if let Some(path) = &opts.state_file {
        match master::load_state(path) {
            Ok(workers) => {
                info!(count = workers.len(), "resuming inherited workers");
                for (pid, fd) in workers {
                    // Safety: the hand-off file lists descriptors this
                    // process inherited across exec and nothing else uses.
                    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                    let chan = IpcChannel::from_owned_fd(owned)?;
                    let pid = (pid.as_raw() != 0).then_some(pid);
                    let id = table.insert(WorkerRecord::new(pid, chan));
                    if let Some(record) = table.get(id) {
                        register(&poller, record.chan.raw_fd(), id)?;
                    }
                }
                table.greet_all();
            }
            Err(e) => warn!(error = %e, "could not resume workers from the hand-off file"),
        }
    }

    let mut accepting = true;
    loop {
        reap_workers(&mut table);

        events.clear();
        if poller.wait(&mut events, Some(TICK)).is_err() {
            continue;
        }

        for event in events.iter() {
            match event.key {
                LISTENER_KEY if !accepting => {}
                LISTENER_KEY => loop {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            match spawn_worker(&cfg, &opts, stream, addr.ip().to_string())? {
                                Spawned::Parent(record) => {
                                    let id = table.insert(record);
                                    if let Some(record) = table.get(id) {
                                        if register(&poller, record.chan.raw_fd(), id).is_err() {
                                            table.remove(id);
                                        }
                                    }
                                }
                                Spawned::ChildDone(result) => return result,
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            break;
                        }
                    }
                },
                UDS_KEY => {
                    if let Some(uds) = &uds {
                        while let Ok((stream, _)) = uds.accept() {
                            match IpcChannel::from_stream(stream) {
                                Ok(chan) => {
                                    let id = table.insert(WorkerRecord::new(None, chan));
                                    if let Some(record) = table.get_mut(id) {
                                        let _ = record.chan.send(&["hello"]);
                                    }
                                    if let Some(record) = table.get(id) {
                                        if register(&poller, record.chan.raw_fd(), id).is_err() {
                                            table.remove(id);
                                        }
                                    }
                                }
                                Err(e) => warn!(error = %e, "bad IPC connection"),
                            }
                        }
                        rearm(&poller, uds.as_raw_fd(), UDS_KEY, false);
                    }
                }
                id => match worker_input(&mut table, id) {
                    Disposition::Continue => {}
                    Disposition::Shutdown => return Ok(()),
                    Disposition::Restart => return restart_coordinator(&mut table, &opts),
                    Disposition::Deaf => {
                        accepting = false;
                        let borrowed = unsafe { BorrowedFd::borrow_raw(listener.as_raw_fd()) };
                        let _ = poller.delete(&borrowed);
                    }
                },
            }
        }

        if accepting {
            rearm(&poller, listener.as_raw_fd(), LISTENER_KEY, false);
        }
        for id in table.ids() {
            let flushed = table
                .get_mut(id)
                .map(|record| record.chan.flush().is_ok())
                .unwrap_or(true);
            if !flushed {
                table.remove(id);
                continue;
            }
            if let Some(record) = table.get(id) {
                rearm(&poller, record.chan.raw_fd(), id, record.chan.has_output());
            }
        }
    }
}

enum Spawned {
    Parent(WorkerRecord),
    /// We are the forked worker and it has finished
    ChildDone(Result<()>),
}

fn spawn_worker(
    cfg: &Config,
    opts: &RunOptions,
    stream: TcpStream,
    host: String,
) -> Result<Spawned> {
    let (parent_end, child_end) = IpcChannel::pair()?;
    // Safety: single-threaded at this point; the child only runs its own
    // session loop and never touches the coordinator's state.
    match unsafe { fork() }.map_err(GatewayError::Fork)? {
        ForkResult::Parent { child } => {
            drop(child_end);
            drop(stream);
            debug!(pid = child.as_raw(), "forked worker");
            Ok(Spawned::Parent(WorkerRecord::new(Some(child), parent_end)))
        }
        ForkResult::Child => {
            drop(parent_end);
            let result = run_worker(cfg.clone(), opts.clone(), stream, host, child_end);
            if let Err(e) = &result {
                error!(error = %e, "worker failed");
            }
            Ok(Spawned::ChildDone(result))
        }
    }
}

fn reap_workers(table: &mut WorkerTable) {
    loop {
        match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(pid) = status.pid() {
                    debug!(pid = pid.as_raw(), "worker exited");
                    table.remove_by_pid(pid);
                } else {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

fn worker_input(table: &mut WorkerTable, id: usize) -> Disposition {
    // Deaf leaves the coordinator running, so keep draining what this
    // worker already sent before reporting it.
    let mut pending = Disposition::Continue;
    loop {
        let outcome = match table.get_mut(id) {
            Some(record) => record.chan.read_message(),
            None => return pending,
        };
        match outcome {
            Ok(ReadOutcome::Message { argv, fd }) => {
                match table.handle_message(id, &argv, fd) {
                    Disposition::Continue => {}
                    Disposition::Deaf => pending = Disposition::Deaf,
                    other => return other,
                }
            }
            Ok(ReadOutcome::Again) => return pending,
            Ok(ReadOutcome::Closed) | Err(_) => {
                table.remove(id);
                return pending;
            }
        }
    }
}

/// Re-exec the coordinator, leaving the hand-off file for the new image
fn restart_coordinator(table: &mut WorkerTable, opts: &RunOptions) -> Result<()> {
    let state_path = std::env::temp_dir().join(format!("gatewire-{}.state", std::process::id()));
    table.save_state(&state_path)?;
    info!(path = %state_path.display(), "re-executing with live workers");

    let exe = std::env::current_exe()?;
    let to_cstring = |s: &std::ffi::OsStr| {
        CString::new(s.as_bytes())
            .map_err(|_| GatewayError::Config("argument contains a NUL byte".to_string()))
    };
    let mut args = vec![to_cstring(exe.as_os_str())?];
    if let Some(config) = &opts.config_path {
        args.push(to_cstring("--config".as_ref())?);
        args.push(to_cstring(config.as_os_str())?);
    }
    args.push(to_cstring("--state-file".as_ref())?);
    args.push(to_cstring(state_path.as_os_str())?);

    execv(&args[0], &args).map_err(GatewayError::Exec)?;
    unreachable!("execv returned without an error")
}

// ---- worker process ----

const CLIENT_KEY: usize = 0;
const IPC_KEY: usize = 1;

fn run_worker(
    mut cfg: Config,
    opts: RunOptions,
    stream: TcpStream,
    host: String,
    chan: IpcChannel,
) -> Result<()> {
    let mut store = MemoryStore::new(cfg.accounts.clone());
    let mut session = Session::from_stream(stream, cfg.hostname.clone(), host)?;
    let mut link = ChildLink::new(chan);

    let poller = Poller::new()?;
    let mut events = Events::new();
    let Some(client_fd) = session.raw_fd() else {
        return Ok(());
    };
    register(&poller, client_fd, CLIENT_KEY)?;
    register(&poller, link.chan.raw_fd(), IPC_KEY)?;

    loop {
        let timeout = Duration::from_secs(cfg.ping_timeout);
        let silent = session.last_pong.elapsed();
        if silent > timeout {
            session.write_argv(&["ERROR", "Closing link: Ping timeout"]);
            session.flush();
            return Ok(());
        } else if silent > timeout / 2 && !session.ping_sent {
            session.ping_sent = true;
            let name = session.server_name.clone();
            session.write_argv(&["PING", &name]);
        }

        events.clear();
        if poller.wait(&mut events, Some(TICK)).is_err() {
            continue;
        }

        for event in events.iter() {
            match event.key {
                CLIENT_KEY if event.readable => {
                    if session.read_ready() == IoStatus::Closed {
                        session.drop_socket();
                        // Mid-handoff the counterpart still needs the
                        // done/fail answer; stay alive for it.
                        if matches!(session.takeover, crate::session::Takeover::AuthPending { .. })
                        {
                            continue;
                        }
                        return Ok(());
                    }
                    for raw in session.take_lines() {
                        let Some(argv) = line::parse(&raw) else { continue };
                        let mut ctx = Ctx {
                            cfg: &cfg,
                            store: &mut store,
                        };
                        let actions = command::dispatch(&mut session, &mut ctx, &argv);
                        match link.deliver_actions(&mut session, &mut ctx, actions)? {
                            ChildDisposition::Exit => {
                                session.flush();
                                return Ok(());
                            }
                            ChildDisposition::Rewired => {
                                rewire_client(&poller, &session)?;
                            }
                            _ => {}
                        }
                    }
                }
                IPC_KEY if event.readable => loop {
                    match link.chan.read_message() {
                        Ok(ReadOutcome::Message { argv, fd }) => {
                            let mut ctx = Ctx {
                                cfg: &cfg,
                                store: &mut store,
                            };
                            match link.handle_message(&mut session, &mut ctx, &argv, fd)? {
                                ChildDisposition::Exit => {
                                    session.flush();
                                    return Ok(());
                                }
                                ChildDisposition::Rewired => {
                                    rewire_client(&poller, &session)?;
                                }
                                ChildDisposition::Rehash => {
                                    reload_config(&mut cfg, &mut store, opts.config_path.as_deref());
                                }
                                ChildDisposition::Continue => {}
                            }
                        }
                        Ok(ReadOutcome::Again) => break,
                        Ok(ReadOutcome::Closed) | Err(_) => {
                            // Coordinator gone; the session cannot outlive it.
                            session.write_argv(&["ERROR", "Server going down"]);
                            session.flush();
                            return Ok(());
                        }
                    }
                },
                _ => {}
            }
        }

        if session.status.contains(Status::SHUTDOWN) {
            session.flush();
            return Ok(());
        }
        if session.has_output() && session.flush() == IoStatus::Closed {
            return Ok(());
        }
        if let Some(fd) = session.raw_fd() {
            rearm(&poller, fd, CLIENT_KEY, session.has_output());
        }
        if link.chan.flush().is_err() {
            return Ok(());
        }
        rearm(&poller, link.chan.raw_fd(), IPC_KEY, link.chan.has_output());
    }
}

/// After adopting a descriptor the old one is already closed; watch the
/// replacement under the same key.
fn rewire_client(poller: &Poller, session: &Session) -> Result<()> {
    if let Some(fd) = session.raw_fd() {
        register(poller, fd, CLIENT_KEY)?;
    }
    Ok(())
}
