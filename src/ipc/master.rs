//! Coordinator-side worker table and command handling
//!
//! Each worker process gets one record holding its IPC channel and a
//! cached copy of its session's identity, mirrored through the `client`,
//! `nick` and `password` announcements. The cache is what lets the
//! coordinator pair takeover participants without ever seeing session
//! state directly.
//!
//! A write failure on one worker's channel removes that record only;
//! nothing a single worker does may take the coordinator down, except the
//! explicit `die` command from an operator.

use std::io::Write;
use std::os::fd::{OwnedFd, RawFd};
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::ipc::channel::IpcChannel;

pub struct WorkerRecord {
    /// None for workers that connected over the IPC socket instead of
    /// being forked by this process
    pub pid: Option<Pid>,
    pub chan: IpcChannel,
    pub host: Option<String>,
    pub nick: Option<String>,
    pub realname: Option<String>,
    pub password: Option<String>,
    /// Takeover pairing back-reference; symmetric while set
    pub peer: Option<usize>,
}

impl WorkerRecord {
    pub fn new(pid: Option<Pid>, chan: IpcChannel) -> Self {
        Self {
            pid,
            chan,
            host: None,
            nick: None,
            realname: None,
            password: None,
            peer: None,
        }
    }
}

/// What the surrounding process should do after handling one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// Operator asked the whole service to stop
    Shutdown,
    /// Operator asked for a re-exec with live connections kept
    Restart,
    /// Operator asked to stop accepting new connections
    Deaf,
}

#[derive(Default)]
pub struct WorkerTable {
    slots: Vec<Option<WorkerRecord>>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: WorkerRecord) -> usize {
        match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(record);
                free
            }
            None => {
                self.slots.push(Some(record));
                self.slots.len() - 1
            }
        }
    }

    pub fn get(&self, id: usize) -> Option<&WorkerRecord> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut WorkerRecord> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    pub fn ids(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a record, failing any takeover it was part of
    pub fn remove(&mut self, id: usize) -> Option<WorkerRecord> {
        let record = self.slots.get_mut(id).and_then(Option::take)?;
        if let Some(peer) = record.peer {
            if let Some(other) = self.get_mut(peer) {
                other.peer = None;
                let _ = other.chan.send(&["takeover", "fail"]);
            }
        }
        Some(record)
    }

    pub fn remove_by_pid(&mut self, pid: Pid) -> Option<WorkerRecord> {
        let id = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|r| r.pid == Some(pid)))?;
        self.remove(id)
    }

    /// Send to one worker; on failure drop its record and report false
    fn send_or_drop<S: AsRef<str>>(&mut self, id: usize, argv: &[S]) -> bool {
        let ok = self
            .get_mut(id)
            .map(|record| record.chan.send(argv).is_ok())
            .unwrap_or(false);
        if !ok {
            warn!(worker = id, "dropping worker after a failed write");
            self.remove(id);
        }
        ok
    }

    fn broadcast<S: AsRef<str>>(&mut self, argv: &[S], skip: Option<usize>) {
        for id in self.ids() {
            if Some(id) == skip {
                continue;
            }
            self.send_or_drop(id, argv);
        }
    }

    /// Handle one message from worker `from`
    pub fn handle_message(
        &mut self,
        from: usize,
        argv: &[String],
        fd: Option<OwnedFd>,
    ) -> Disposition {
        let Some(cmd) = argv.first() else {
            return Disposition::Continue;
        };
        match cmd.to_ascii_lowercase().as_str() {
            "client" if argv.len() >= 4 => {
                if let Some(record) = self.get_mut(from) {
                    record.host = Some(argv[1].clone());
                    record.nick = Some(argv[2].clone());
                    record.realname = Some(argv[3].clone());
                }
            }
            "nick" if argv.len() >= 2 => {
                if let Some(record) = self.get_mut(from) {
                    record.nick = Some(argv[1].clone());
                }
            }
            "password" if argv.len() >= 2 => {
                if let Some(record) = self.get_mut(from) {
                    record.password = Some(argv[1].clone());
                }
            }
            "die" => {
                info!("shutdown requested over IPC");
                self.broadcast(&["die"], None);
                return Disposition::Shutdown;
            }
            "restart" => {
                info!("restart requested over IPC");
                return Disposition::Restart;
            }
            "deaf" => {
                info!("no longer accepting new connections");
                return Disposition::Deaf;
            }
            "rehash" => {
                self.broadcast(&["rehash"], None);
            }
            "wallops" | "wall" | "opmsg" if argv.len() >= 2 => {
                let relay = vec![cmd.to_ascii_lowercase(), argv[1].clone()];
                self.broadcast(&relay, Some(from));
            }
            "kill" if argv.len() >= 2 => {
                let reason = argv.get(2).cloned().unwrap_or_else(|| "Killed".to_string());
                let relay = vec!["kill".to_string(), argv[1].clone(), reason];
                self.broadcast(&relay, Some(from));
            }
            "takeover" if argv.len() >= 2 => {
                return self.takeover_message(from, &argv[1..], fd);
            }
            other => {
                debug!(worker = from, cmd = other, "ignoring unknown IPC command");
            }
        }
        Disposition::Continue
    }

    /// Relay leg of the takeover exchange.
    ///
    /// `init` pairs the requester with a matching record; `auth` moves the
    /// duplicated descriptor across, but only after re-checking that both
    /// cached (nick, password) pairs still agree; `done`/`fail` are passed
    /// to the peer and clear the pairing. Anything inconsistent resolves
    /// as a failure to whoever is still reachable.
    fn takeover_message(
        &mut self,
        from: usize,
        args: &[String],
        fd: Option<OwnedFd>,
    ) -> Disposition {
        match args[0].to_ascii_lowercase().as_str() {
            "init" if args.len() >= 3 => {
                let nick = args[1].clone();
                let password = args[2].clone();
                let target = self.ids().into_iter().find(|&id| {
                    id != from
                        && self.get(id).is_some_and(|r| {
                            r.peer.is_none()
                                && r.nick.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(&nick))
                                && r.password.as_deref() == Some(password.as_str())
                        })
                });
                let Some(target) = target else {
                    self.send_or_drop(from, &["takeover", "no"]);
                    return Disposition::Continue;
                };
                debug!(new = from, old = target, "takeover pairing");
                if let Some(record) = self.get_mut(from) {
                    record.peer = Some(target);
                    // The requester identifies only after the exchange
                    // resolves, so the credential it presented here is the
                    // one the auth leg gets checked against.
                    record.password = Some(password.clone());
                }
                if let Some(record) = self.get_mut(target) {
                    record.peer = Some(from);
                }
                if !self.send_or_drop(target, &["takeover", "init", &nick, &password]) {
                    self.fail_pairing(from);
                }
            }
            "auth" if args.len() >= 3 => {
                let Some(fd) = fd else {
                    self.fail_pairing(from);
                    return Disposition::Continue;
                };
                let Some(peer) = self.get(from).and_then(|r| r.peer) else {
                    return Disposition::Continue;
                };
                let consistent = match (self.get(from), self.get(peer)) {
                    (Some(a), Some(b)) => {
                        b.peer == Some(from)
                            && a.nick
                                .as_deref()
                                .zip(b.nick.as_deref())
                                .is_some_and(|(x, y)| x.eq_ignore_ascii_case(y))
                            && a.password.is_some()
                            && a.password == b.password
                            && a.nick.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(&args[1]))
                    }
                    _ => false,
                };
                if !consistent {
                    warn!(old = from, new = peer, "takeover auth with inconsistent credentials");
                    self.fail_pairing(from);
                    return Disposition::Continue;
                }
                let relay = ["takeover", "auth", args[1].as_str(), args[2].as_str()];
                let sent = self
                    .get_mut(peer)
                    .map(|record| record.chan.send_with_fd(&relay, fd).is_ok())
                    .unwrap_or(false);
                if !sent {
                    self.remove(peer);
                }
            }
            "done" => {
                if let Some(peer) = self.get_mut(from).and_then(|r| r.peer.take()) {
                    if let Some(record) = self.get_mut(peer) {
                        record.peer = None;
                        let _ = record.chan.send(&["takeover", "done"]);
                    }
                }
            }
            "fail" => {
                self.fail_pairing(from);
            }
            _ => {}
        }
        Disposition::Continue
    }

    /// Clear a pairing from either end, telling both sides
    fn fail_pairing(&mut self, id: usize) {
        let peer = self.get_mut(id).and_then(|r| r.peer.take());
        self.send_or_drop(id, &["takeover", "fail"]);
        if let Some(peer) = peer {
            if let Some(record) = self.get_mut(peer) {
                record.peer = None;
            }
            self.send_or_drop(peer, &["takeover", "fail"]);
        }
    }

    /// Ask every worker to re-announce itself (used after a restart)
    pub fn greet_all(&mut self) {
        self.broadcast(&["hello"], None);
    }

    /// Write the restart hand-off file: worker count, then one `pid fd`
    /// line per worker. Channel descriptors get their close-on-exec flag
    /// cleared so they survive the re-exec.
    pub fn save_state(&mut self, path: &Path) -> Result<()> {
        let mut out = String::new();
        out.push_str(&format!("{}\n", self.len()));
        for id in self.ids() {
            let Some(record) = self.get(id) else { continue };
            let pid = record.pid.map(|p| p.as_raw()).unwrap_or(0);
            let fd = record.chan.raw_fd();
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(std::io::Error::from)?;
            out.push_str(&format!("{pid} {fd}\n"));
        }
        let mut file = std::fs::File::create(path)?;
        file.write_all(out.as_bytes())?;
        Ok(())
    }
}

/// Read and delete the hand-off file left by a restarting coordinator
pub fn load_state(path: &Path) -> Result<Vec<(Pid, RawFd)>> {
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines();
    let count: usize = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .ok_or_else(|| GatewayError::StateFile {
            path: path.to_path_buf(),
        })?;
    let mut workers = Vec::with_capacity(count);
    for line in lines.take(count) {
        let mut parts = line.split_whitespace();
        let pid: i32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| GatewayError::StateFile {
                path: path.to_path_buf(),
            })?;
        let fd: RawFd = parts
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| GatewayError::StateFile {
                path: path.to_path_buf(),
            })?;
        workers.push((Pid::from_raw(pid), fd));
    }
    std::fs::remove_file(path)?;
    if workers.len() != count {
        return Err(GatewayError::StateFile {
            path: path.to_path_buf(),
        });
    }
    Ok(workers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::channel::ReadOutcome;

    struct TestWorker {
        id: usize,
        remote: IpcChannel,
    }

    fn add_worker(table: &mut WorkerTable, nick: &str, password: Option<&str>) -> TestWorker {
        let (local, remote) = IpcChannel::pair().unwrap();
        let id = table.insert(WorkerRecord::new(None, local));
        let announce = vec![
            "client".to_string(),
            "host.example".to_string(),
            nick.to_string(),
            nick.to_string(),
        ];
        table.handle_message(id, &announce, None);
        if let Some(pw) = password {
            let msg = vec!["password".to_string(), pw.to_string()];
            table.handle_message(id, &msg, None);
        }
        TestWorker { id, remote }
    }

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn expect_message(chan: &mut IpcChannel) -> Vec<String> {
        match chan.read_message().unwrap() {
            ReadOutcome::Message { argv, .. } => argv,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn announcements_fill_the_record() {
        let mut table = WorkerTable::new();
        let w = add_worker(&mut table, "bob", Some("sekrit"));
        let record = table.get(w.id).unwrap();
        assert_eq!(record.nick.as_deref(), Some("bob"));
        assert_eq!(record.host.as_deref(), Some("host.example"));
        assert_eq!(record.password.as_deref(), Some("sekrit"));

        table.handle_message(w.id, &argv(&["nick", "robert"]), None);
        assert_eq!(table.get(w.id).unwrap().nick.as_deref(), Some("robert"));
    }

    #[test]
    fn wallops_fans_out_to_everyone_but_the_sender() {
        let mut table = WorkerTable::new();
        let mut sender = add_worker(&mut table, "op", None);
        let mut other = add_worker(&mut table, "bob", None);

        table.handle_message(sender.id, &argv(&["WALLOPS", "hello all"]), None);
        assert_eq!(expect_message(&mut other.remote), vec!["wallops", "hello all"]);
        assert!(matches!(sender.remote.read_message().unwrap(), ReadOutcome::Again));
    }

    #[test]
    fn one_broken_worker_does_not_stop_the_fanout() {
        let mut table = WorkerTable::new();
        let sender = add_worker(&mut table, "op", None);
        let broken = add_worker(&mut table, "bob", None);
        let mut healthy = add_worker(&mut table, "eve", None);

        drop(broken.remote);
        table.handle_message(sender.id, &argv(&["wall", "notice"]), None);

        assert!(table.get(broken.id).is_none());
        assert!(table.get(healthy.id).is_some());
        assert_eq!(expect_message(&mut healthy.remote), vec!["wall", "notice"]);
    }

    #[test]
    fn deaf_and_die_report_their_dispositions() {
        let mut table = WorkerTable::new();
        let w = add_worker(&mut table, "op", None);
        assert_eq!(
            table.handle_message(w.id, &argv(&["deaf"]), None),
            Disposition::Deaf
        );
        assert_eq!(
            table.handle_message(w.id, &argv(&["die"]), None),
            Disposition::Shutdown
        );
    }

    #[test]
    fn takeover_init_pairs_matching_credentials() {
        let mut table = WorkerTable::new();
        let mut old = add_worker(&mut table, "bob", Some("sekrit"));
        let new = add_worker(&mut table, "bob", Some("sekrit"));

        table.handle_message(new.id, &argv(&["takeover", "init", "bob", "sekrit"]), None);
        assert_eq!(table.get(new.id).unwrap().peer, Some(old.id));
        assert_eq!(table.get(old.id).unwrap().peer, Some(new.id));
        assert_eq!(
            expect_message(&mut old.remote),
            vec!["takeover", "init", "bob", "sekrit"]
        );
    }

    #[test]
    fn takeover_init_without_a_match_is_answered_no() {
        let mut table = WorkerTable::new();
        let mut new = add_worker(&mut table, "bob", Some("sekrit"));
        let _other = add_worker(&mut table, "bob", Some("different"));

        table.handle_message(new.id, &argv(&["takeover", "init", "bob", "sekrit"]), None);
        assert_eq!(expect_message(&mut new.remote), vec!["takeover", "no"]);
        assert_eq!(table.get(new.id).unwrap().peer, None);
    }

    #[test]
    fn takeover_auth_relays_before_the_new_side_identifies() {
        let mut table = WorkerTable::new();
        let mut old = add_worker(&mut table, "bob", Some("sekrit"));

        // The new connection has logged in but not identified; the
        // coordinator has no password announcement from it yet.
        let (local, mut new_remote) = IpcChannel::pair().unwrap();
        let new_id = table.insert(WorkerRecord::new(None, local));
        table.handle_message(new_id, &argv(&["client", "host.example", "bob", "bob"]), None);

        table.handle_message(new_id, &argv(&["takeover", "init", "bob", "sekrit"]), None);
        assert_eq!(
            expect_message(&mut old.remote),
            vec!["takeover", "init", "bob", "sekrit"]
        );

        let (dup, _peer_end) = std::os::unix::net::UnixStream::pair().unwrap();
        table.handle_message(
            old.id,
            &argv(&["takeover", "auth", "bob", "sekrit"]),
            Some(OwnedFd::from(dup)),
        );

        let (relayed, fd) = match new_remote.read_message().unwrap() {
            ReadOutcome::Message { argv, fd } => (argv, fd),
            other => panic!("expected message, got {other:?}"),
        };
        assert_eq!(relayed, vec!["takeover", "auth", "bob", "sekrit"]);
        assert!(fd.is_some());
    }

    #[test]
    fn takeover_auth_is_refused_when_the_cache_disagrees() {
        let mut table = WorkerTable::new();
        let mut old = add_worker(&mut table, "bob", Some("sekrit"));
        let mut new = add_worker(&mut table, "bob", Some("sekrit"));
        table.handle_message(new.id, &argv(&["takeover", "init", "bob", "sekrit"]), None);
        let _ = expect_message(&mut old.remote);

        // Old side re-identifies under a different password mid-exchange.
        table.handle_message(old.id, &argv(&["password", "changed"]), None);

        let (dup, _peer_end) = std::os::unix::net::UnixStream::pair().unwrap();
        table.handle_message(
            old.id,
            &argv(&["takeover", "auth", "bob", "sekrit"]),
            Some(OwnedFd::from(dup)),
        );

        assert_eq!(expect_message(&mut old.remote), vec!["takeover", "fail"]);
        assert_eq!(expect_message(&mut new.remote), vec!["takeover", "fail"]);
        assert_eq!(table.get(old.id).unwrap().peer, None);
        assert_eq!(table.get(new.id).unwrap().peer, None);
    }

    #[test]
    fn removing_a_paired_worker_fails_the_survivor() {
        let mut table = WorkerTable::new();
        let mut old = add_worker(&mut table, "bob", Some("sekrit"));
        let new = add_worker(&mut table, "bob", Some("sekrit"));
        table.handle_message(new.id, &argv(&["takeover", "init", "bob", "sekrit"]), None);
        let _ = expect_message(&mut old.remote);

        table.remove(new.id);
        assert_eq!(expect_message(&mut old.remote), vec!["takeover", "fail"]);
        assert_eq!(table.get(old.id).unwrap().peer, None);
    }

    #[test]
    fn state_file_round_trips() {
        let mut table = WorkerTable::new();
        let (local, _remote) = IpcChannel::pair().unwrap();
        let fd = local.raw_fd();
        table.insert(WorkerRecord {
            pid: Some(Pid::from_raw(4321)),
            ..WorkerRecord::new(None, local)
        });

        let path = std::env::temp_dir().join(format!("gatewire-state-{}", std::process::id()));
        table.save_state(&path).unwrap();
        let workers = load_state(&path).unwrap();
        assert_eq!(workers, vec![(Pid::from_raw(4321), fd)]);
        assert!(!path.exists());
    }
}
