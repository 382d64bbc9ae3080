//! Per-connection session state machine
//!
//! A `Session` owns one client socket, its input/output buffers, and the
//! registration state that gates command dispatch. Sockets are always
//! nonblocking; reads and writes report `IoStatus::Again` instead of
//! blocking so the event loop can re-register and resume on readiness.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Instant;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::command::{Action, Ctx};
use crate::line;
use crate::numeric::*;
use crate::root;

/// Registration status bitset; states are not mutually exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(u8);

impl Status {
    pub const AUTHORIZED: Status = Status(1);
    pub const LOGGED_IN: Status = Status(2);
    pub const IDENTIFIED: Status = Status(4);
    pub const SHUTDOWN: Status = Status(8);

    pub fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Status) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Status) {
        self.0 &= !other.0;
    }
}

/// Result of a nonblocking read or write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Progress was made
    Ready,
    /// Nothing to do right now; retry on the next readiness event
    Again,
    /// The peer is gone; tear the session down
    Closed,
}

/// SASL negotiation progress
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SaslState {
    #[default]
    Idle,
    /// Mechanism accepted, waiting for the client payload
    AwaitingPayload,
}

/// One-shot secure-credential prompt armed by the control service and
/// consumed by the next OPER command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSecret {
    Identify,
    Register,
}

/// Takeover pairing state for this session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Takeover {
    #[default]
    Idle,
    /// New side: takeover question sent, identify deferred until the answer
    AwaitingReply {
        nick: String,
        password: String,
        peer: Option<usize>,
    },
    /// Old side: the client has been asked whether to hand over its link
    Offered { peer: Option<usize> },
    /// Old side: socket duplicated and sent, waiting for done/fail
    AuthPending { peer: Option<usize> },
}

pub struct Session {
    /// Registry slot id; 0 until inserted
    pub id: usize,
    stream: Option<TcpStream>,
    /// Name this gateway presents in reply prefixes
    pub server_name: String,
    pub status: Status,
    pub nick: Option<String>,
    pub user: Option<String>,
    pub realname: Option<String>,
    /// Client host as seen at accept time
    pub host: String,
    /// Stashed PASS value, cleared once consumed
    pub password: Option<String>,
    pub umode: String,
    pub away: Option<String>,
    pub channels: Vec<String>,
    pub watches: HashSet<String>,
    pub last_pong: Instant,
    /// A liveness PING is outstanding
    pub ping_sent: bool,
    pub cap_negotiating: bool,
    pub caps: Vec<String>,
    pub sasl: SaslState,
    /// Credentials verified over SASL before login, applied at login time
    pub sasl_identity: Option<(String, String)>,
    pub pending_secret: Option<PendingSecret>,
    pub takeover: Takeover,
    /// Takeover accepted: stop forwarding anything to our own client
    pub desynced: bool,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
}

impl Session {
    pub fn from_stream(
        stream: TcpStream,
        server_name: String,
        host: String,
    ) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(Some(stream), server_name, host))
    }

    /// A session without a socket; used by tests and one-shot teardown
    pub fn detached(server_name: String) -> Self {
        Self::new(None, server_name, "localhost".to_string())
    }

    fn new(stream: Option<TcpStream>, server_name: String, host: String) -> Self {
        Self {
            id: 0,
            stream,
            server_name,
            status: Status::default(),
            nick: None,
            user: None,
            realname: None,
            host,
            password: None,
            umode: String::new(),
            away: None,
            channels: Vec::new(),
            watches: HashSet::new(),
            last_pong: Instant::now(),
            ping_sent: false,
            cap_negotiating: false,
            caps: Vec::new(),
            sasl: SaslState::default(),
            sasl_identity: None,
            pending_secret: None,
            takeover: Takeover::default(),
            desynced: false,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Duplicate the client socket for a descriptor hand-off
    pub fn dup_socket(&self) -> std::io::Result<OwnedFd> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| std::io::Error::other("session has no socket"))?;
        Ok(OwnedFd::from(stream.try_clone()?))
    }

    /// Swap the client socket for an adopted one (takeover, new side)
    pub fn adopt_socket(&mut self, fd: OwnedFd) -> std::io::Result<()> {
        let stream = TcpStream::from(fd);
        stream.set_nonblocking(true)?;
        self.stream = Some(stream);
        self.desynced = false;
        Ok(())
    }

    pub fn drop_socket(&mut self) {
        self.stream = None;
    }

    pub fn is_oper(&self) -> bool {
        self.umode.contains('o')
    }

    pub fn nick_or_star(&self) -> &str {
        self.nick.as_deref().unwrap_or("*")
    }

    /// Full `nick!user@host` prefix for messages about this client
    pub fn prefix(&self) -> String {
        format!(
            "{}!{}@{}",
            self.nick_or_star(),
            self.user.as_deref().unwrap_or("*"),
            self.host
        )
    }

    // ---- buffered, nonblocking I/O ----

    /// Pull whatever the socket has into the input buffer
    pub fn read_ready(&mut self) -> IoStatus {
        let Some(stream) = self.stream.as_mut() else {
            return IoStatus::Closed;
        };
        let mut chunk = [0u8; 1024];
        match stream.read(&mut chunk) {
            Ok(0) => IoStatus::Closed,
            Ok(n) => {
                self.inbuf.extend_from_slice(&chunk[..n]);
                IoStatus::Ready
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => IoStatus::Again,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => IoStatus::Again,
            Err(_) => IoStatus::Closed,
        }
    }

    /// Extract complete lines from the input buffer, keeping any partial
    /// line for the next read
    pub fn take_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.inbuf.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.inbuf.drain(..=pos).collect();
            while raw.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
                raw.pop();
            }
            lines.push(String::from_utf8_lossy(&raw).into_owned());
        }
        lines
    }

    /// Queue one complete wire line (CRLF included) for the client
    pub fn write_raw(&mut self, mut wire: String) {
        if self.desynced || self.status.contains(Status::SHUTDOWN) {
            return;
        }
        if wire.len() > line::MAX_LINE {
            let mut cut = line::MAX_LINE - 2;
            while !wire.is_char_boundary(cut) {
                cut -= 1;
            }
            wire.truncate(cut);
            wire.push_str("\r\n");
        }
        self.outbuf.extend_from_slice(wire.as_bytes());
    }

    pub fn write_argv<S: AsRef<str>>(&mut self, argv: &[S]) {
        self.write_raw(line::build(argv));
    }

    /// Numeric reply: `:<server> <code> <nick|*> <args...>`
    pub fn reply(&mut self, code: u16, args: &[&str]) {
        let server = format!(":{}", self.server_name);
        let code = format!("{code:03}");
        let nick = self.nick_or_star().to_string();
        let mut argv: Vec<&str> = vec![&server, &code, &nick];
        argv.extend_from_slice(args);
        self.write_argv(&argv);
    }

    /// Service-user message into the control channel (or a pre-login notice)
    pub fn usermsg(&mut self, service: &str, channel: &str, text: &str) {
        for part in text.split('\n') {
            if self.status.contains(Status::LOGGED_IN) {
                let prefix = format!(":{service}!{service}@{}", self.server_name);
                self.write_argv(&[&prefix, "PRIVMSG", channel, part]);
            } else {
                let prefix = format!(":{}", self.server_name);
                let nick = self.nick_or_star().to_string();
                self.write_argv(&[&prefix, "NOTICE", &nick, part]);
            }
        }
    }

    pub fn has_output(&self) -> bool {
        !self.outbuf.is_empty()
    }

    #[cfg(test)]
    pub fn drain_output(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.outbuf)).into_owned()
    }

    /// Write as much buffered output as the socket will take
    pub fn flush(&mut self) -> IoStatus {
        let Some(stream) = self.stream.as_mut() else {
            self.outbuf.clear();
            return IoStatus::Closed;
        };
        while !self.outbuf.is_empty() {
            match stream.write(&self.outbuf) {
                Ok(0) => return IoStatus::Closed,
                Ok(n) => {
                    self.outbuf.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return IoStatus::Again,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return IoStatus::Closed,
            }
        }
        IoStatus::Ready
    }

    // ---- registration state machine ----

    /// Called whenever an identity field or gate changes; completes
    /// registration once NICK and USER are in and the secret gate is open
    pub fn check_login(&mut self, ctx: &mut Ctx) -> Vec<Action> {
        if self.status.contains(Status::LOGGED_IN) {
            return Vec::new();
        }
        if self.nick.is_none() || self.user.is_none() {
            return Vec::new();
        }
        if ctx.cfg.auth_password.is_some() && !self.status.contains(Status::AUTHORIZED) {
            return Vec::new();
        }
        if self.cap_negotiating {
            return Vec::new();
        }
        self.login(ctx)
    }

    /// Welcome burst, control-channel join, coordinator announcement
    fn login(&mut self, ctx: &mut Ctx) -> Vec<Action> {
        let nick = self.nick.clone().unwrap_or_default();
        let version = env!("CARGO_PKG_VERSION");
        let server = self.server_name.clone();

        self.reply(
            RPL_WELCOME,
            &[&format!("Welcome to the {server} gateway, {nick}")],
        );
        self.reply(
            RPL_YOURHOST,
            &[&format!("Your host is {server}, running gatewire {version}")],
        );
        self.reply(RPL_CREATED, &["This server was created just for you"]);
        self.reply(
            RPL_MYINFO,
            &[&server, &format!("gatewire-{version}"), "iosw", "nt"],
        );
        self.reply(
            RPL_ISUPPORT,
            &[
                "PREFIX=(ov)@+",
                "CHANTYPES=#&",
                "NICKLEN=24",
                "are supported by this server",
            ],
        );
        self.motd(ctx);

        self.status.insert(Status::LOGGED_IN);

        self.set_umode("+w", false);

        let channel = ctx.cfg.control_channel.clone();
        let service = ctx.cfg.service_nick.clone();
        self.join_channel(&channel, &service);

        self.usermsg(
            &service,
            &channel,
            "Welcome to the gateway. Talk to me in this channel to manage \
             your connection; start with \x02help\x02.",
        );

        let mut actions = vec![Action::Forward(vec![
            "client".to_string(),
            self.host.clone(),
            nick.clone(),
            self.realname.clone().unwrap_or_default(),
        ])];

        // A PASS value stashed because no server secret was configured is
        // replayed as an identify attempt now.
        if let Some(password) = self.password.take() {
            actions.extend(root::identify(self, ctx, Some(&password)));
        } else if let Some((sasl_nick, sasl_pass)) = self.sasl_identity.take() {
            if sasl_nick.eq_ignore_ascii_case(&nick) {
                actions.extend(root::identify(self, ctx, Some(&sasl_pass)));
            }
        }

        actions
    }

    pub fn motd(&mut self, ctx: &Ctx) {
        match ctx
            .cfg
            .motd_file
            .as_ref()
            .and_then(|p| std::fs::read_to_string(p).ok())
        {
            Some(text) => {
                let server = self.server_name.clone();
                self.reply(RPL_MOTDSTART, &[&format!("- {server} Message Of The Day -")]);
                for l in text.lines() {
                    self.reply(RPL_MOTD, &[&format!("- {l}")]);
                }
                self.reply(RPL_ENDOFMOTD, &["End of MOTD"]);
            }
            None => {
                self.reply(ERR_NOMOTD, &["No MOTD configured"]);
            }
        }
    }

    pub fn join_channel(&mut self, channel: &str, service_nick: &str) {
        if !self.channels.iter().any(|c| c.eq_ignore_ascii_case(channel)) {
            self.channels.push(channel.to_string());
        }
        let prefix = format!(":{}", self.prefix());
        self.write_argv(&[&prefix, "JOIN", channel]);
        let names = format!("@{} {}", service_nick, self.nick_or_star());
        self.reply(RPL_NAMREPLY, &["=", channel, &names]);
        self.reply(RPL_ENDOFNAMES, &[channel, "End of NAMES list"]);
    }

    /// Apply a +/- mode delta; unknown flags get a 501. Operator status can
    /// only be granted through OPER, never through MODE.
    pub fn set_umode(&mut self, delta: &str, allow_oper: bool) {
        const KNOWN: &str = "iosw";
        let mut adding = true;
        let mut changed = false;
        for c in delta.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                c if KNOWN.contains(c) => {
                    if c == 'o' && adding && !allow_oper {
                        continue;
                    }
                    if adding && !self.umode.contains(c) {
                        self.umode.push(c);
                        changed = true;
                    } else if !adding && self.umode.contains(c) {
                        self.umode.retain(|m| m != c);
                        changed = true;
                    }
                }
                _ => {
                    self.reply(ERR_UMODEUNKNOWNFLAG, &["Unknown MODE flag"]);
                }
            }
        }
        if changed {
            let prefix = format!(":{}", self.prefix());
            let nick = self.nick_or_star().to_string();
            let mode = format!("+{}", self.umode);
            self.write_argv(&[&prefix, "MODE", &nick, &mode]);
        }
    }

    /// Mark identified and tell the coordinator about the credential so
    /// takeover matching can see it
    pub fn complete_identify(
        &mut self,
        service: &str,
        channel: &str,
        password: &str,
    ) -> Vec<Action> {
        self.status.insert(Status::IDENTIFIED);
        // Kept for the takeover auth leg, which must present it again.
        self.password = Some(password.to_string());
        self.usermsg(service, channel, "Password accepted, you are now identified.");
        vec![Action::Forward(vec![
            "password".to_string(),
            password.to_string(),
        ])]
    }

    /// Resynchronization burst after adopting a socket mid-session:
    /// re-announce modes and channel membership on the new link
    pub fn resync(&mut self, ctx: &Ctx) {
        let prefix = format!(":{}", self.prefix());
        let nick = self.nick_or_star().to_string();
        if !self.umode.is_empty() {
            let mode = format!("+{}", self.umode);
            self.write_argv(&[&prefix, "MODE", &nick, &mode]);
        }
        let service = ctx.cfg.service_nick.clone();
        let channels = self.channels.clone();
        for channel in &channels {
            self.join_channel(channel, &service);
        }
        let channel = ctx.cfg.control_channel.clone();
        self.usermsg(
            &service,
            &channel,
            "Session taken over; you are talking over the adopted connection now.",
        );
    }

    // ---- CAP / SASL ----

    pub fn cap_command(&mut self, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
        let sub = args
            .first()
            .map(|s| s.to_ascii_uppercase())
            .unwrap_or_default();
        let server = format!(":{}", self.server_name);
        let nick = self.nick_or_star().to_string();
        match sub.as_str() {
            "LS" | "LIST" => {
                self.cap_negotiating = !self.status.contains(Status::LOGGED_IN);
                self.write_argv(&[&server, "CAP", &nick, &sub, "sasl"]);
                Vec::new()
            }
            "REQ" => {
                self.cap_negotiating = !self.status.contains(Status::LOGGED_IN);
                let requested = args.get(1).cloned().unwrap_or_default();
                let ok = requested
                    .split_whitespace()
                    .all(|cap| cap.trim_start_matches('-') == "sasl");
                let verdict = if ok { "ACK" } else { "NAK" };
                if ok {
                    for cap in requested.split_whitespace() {
                        if let Some(removed) = cap.strip_prefix('-') {
                            self.caps.retain(|c| c != removed);
                        } else if !self.caps.iter().any(|c| c == cap) {
                            self.caps.push(cap.to_string());
                        }
                    }
                }
                self.write_argv(&[&server, "CAP", &nick, verdict, &requested]);
                Vec::new()
            }
            "END" => {
                self.cap_negotiating = false;
                self.check_login(ctx)
            }
            _ => {
                self.write_argv(&[&server, "CAP", &nick, "NAK", &sub]);
                Vec::new()
            }
        }
    }

    pub fn authenticate_command(&mut self, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
        let arg = args.first().map(String::as_str).unwrap_or("");
        match (&self.sasl, arg) {
            (_, "*") => {
                self.sasl = SaslState::Idle;
                self.reply(ERR_SASLABORTED, &["SASL authentication aborted"]);
            }
            (SaslState::Idle, mech) if mech.eq_ignore_ascii_case("PLAIN") => {
                self.sasl = SaslState::AwaitingPayload;
                self.write_argv(&["AUTHENTICATE", "+"]);
            }
            (SaslState::Idle, _) => {
                self.reply(RPL_SASLMECHS, &["PLAIN", "are available SASL mechanisms"]);
                self.reply(ERR_SASLFAIL, &["SASL authentication failed"]);
            }
            (SaslState::AwaitingPayload, payload) => {
                self.sasl = SaslState::Idle;
                match decode_sasl_plain(payload) {
                    Some((nick, password)) if ctx.store.verify(&nick, &password) => {
                        let account = nick.clone();
                        let whoami = format!("{account}!{account}@{}", self.host);
                        self.reply(
                            RPL_LOGGEDIN,
                            &[
                                &whoami,
                                &account,
                                &format!("You are now logged in as {account}"),
                            ],
                        );
                        self.reply(RPL_SASLSUCCESS, &["SASL authentication successful"]);
                        self.sasl_identity = Some((nick, password));
                    }
                    _ => {
                        self.reply(ERR_SASLFAIL, &["SASL authentication failed"]);
                    }
                }
            }
        }
        Vec::new()
    }
}

fn decode_sasl_plain(payload: &str) -> Option<(String, String)> {
    let raw = BASE64.decode(payload).ok()?;
    let text = String::from_utf8(raw).ok()?;
    let mut parts = text.split('\0');
    let _authzid = parts.next()?;
    let authcid = parts.next()?;
    let password = parts.next()?;
    if authcid.is_empty() {
        return None;
    }
    Some((authcid.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryStore;
    use crate::config::Config;

    fn test_ctx(cfg: Config) -> (Config, MemoryStore) {
        let store = MemoryStore::new(cfg.accounts.clone());
        (cfg, store)
    }

    fn logged_in_session(cfg: &Config, store: &mut MemoryStore) -> Session {
        let mut session = Session::detached("gw.test".to_string());
        let mut ctx = Ctx { cfg, store };
        session.nick = Some("bob".to_string());
        session.user = Some("bob".to_string());
        session.realname = Some("Bob".to_string());
        let _ = session.check_login(&mut ctx);
        session.drain_output();
        session
    }

    #[test]
    fn login_requires_both_identity_commands() {
        let (cfg, mut store) = test_ctx(Config::default());
        let mut session = Session::detached("gw.test".to_string());
        let mut ctx = Ctx {
            cfg: &cfg,
            store: &mut store,
        };

        session.nick = Some("bob".to_string());
        assert!(session.check_login(&mut ctx).is_empty());
        assert!(!session.status.contains(Status::LOGGED_IN));

        session.user = Some("bob".to_string());
        session.realname = Some("Bob".to_string());
        let actions = session.check_login(&mut ctx);
        assert!(session.status.contains(Status::LOGGED_IN));

        // Exactly one client-connect announcement, naming bob.
        let forwards: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Forward(argv) if argv[0] == "client" => Some(argv),
                _ => None,
            })
            .collect();
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0][2], "bob");
    }

    #[test]
    fn welcome_burst_carries_001_through_005() {
        let (cfg, mut store) = test_ctx(Config::default());
        let mut session = Session::detached("gw.test".to_string());
        let mut ctx = Ctx {
            cfg: &cfg,
            store: &mut store,
        };
        session.nick = Some("bob".to_string());
        session.user = Some("bob".to_string());
        let _ = session.check_login(&mut ctx);
        let out = session.drain_output();
        for code in ["001", "002", "003", "004", "005"] {
            assert!(out.contains(&format!(":gw.test {code} bob")), "missing {code}: {out}");
        }
        assert!(out.contains("JOIN &gateway"));
    }

    #[test]
    fn auth_secret_gates_login() {
        let cfg = Config {
            auth_password: Some("hunter2".to_string()),
            ..Config::default()
        };
        let (cfg, mut store) = test_ctx(cfg);
        let mut session = Session::detached("gw.test".to_string());
        let mut ctx = Ctx {
            cfg: &cfg,
            store: &mut store,
        };
        session.nick = Some("bob".to_string());
        session.user = Some("bob".to_string());
        assert!(session.check_login(&mut ctx).is_empty());
        assert!(!session.status.contains(Status::LOGGED_IN));

        session.status.insert(Status::AUTHORIZED);
        let _ = session.check_login(&mut ctx);
        assert!(session.status.contains(Status::LOGGED_IN));
    }

    #[test]
    fn cap_negotiation_defers_login_until_end() {
        let (cfg, mut store) = test_ctx(Config::default());
        let mut session = Session::detached("gw.test".to_string());
        let mut ctx = Ctx {
            cfg: &cfg,
            store: &mut store,
        };
        let _ = session.cap_command(&mut ctx, &["LS".to_string()]);
        session.nick = Some("bob".to_string());
        session.user = Some("bob".to_string());
        assert!(session.check_login(&mut ctx).is_empty());
        assert!(!session.status.contains(Status::LOGGED_IN));

        let _ = session.cap_command(&mut ctx, &["END".to_string()]);
        assert!(session.status.contains(Status::LOGGED_IN));
    }

    #[test]
    fn sasl_plain_verifies_against_store() {
        let mut cfg = Config::default();
        cfg.accounts.insert("bob".to_string(), "sekrit".to_string());
        let (cfg, mut store) = test_ctx(cfg);
        let mut session = Session::detached("gw.test".to_string());
        let mut ctx = Ctx {
            cfg: &cfg,
            store: &mut store,
        };

        let _ = session.authenticate_command(&mut ctx, &["PLAIN".to_string()]);
        assert!(session.drain_output().contains("AUTHENTICATE +"));

        let payload = BASE64.encode(b"bob\0bob\0sekrit");
        let _ = session.authenticate_command(&mut ctx, &[payload]);
        let out = session.drain_output();
        assert!(out.contains("900"));
        assert!(out.contains("903"));
        assert_eq!(
            session.sasl_identity,
            Some(("bob".to_string(), "sekrit".to_string()))
        );

        let bad = BASE64.encode(b"bob\0bob\0wrong");
        let _ = session.authenticate_command(&mut ctx, &["PLAIN".to_string()]);
        session.drain_output();
        let _ = session.authenticate_command(&mut ctx, &[bad]);
        assert!(session.drain_output().contains("904"));
    }

    #[test]
    fn umode_rejects_unknown_flags_and_oper_grant() {
        let (cfg, mut store) = test_ctx(Config::default());
        let mut session = logged_in_session(&cfg, &mut store);
        session.set_umode("+x", false);
        assert!(session.drain_output().contains("501"));
        session.set_umode("+o", false);
        assert!(!session.is_oper());
        session.set_umode("+o", true);
        assert!(session.is_oper());
    }

    #[test]
    fn desynced_session_writes_nothing() {
        let (cfg, mut store) = test_ctx(Config::default());
        let mut session = logged_in_session(&cfg, &mut store);
        session.desynced = true;
        session.reply(RPL_VERSION, &["gatewire"]);
        assert!(!session.has_output());
    }

    #[test]
    fn take_lines_keeps_partial_input() {
        let mut session = Session::detached("gw.test".to_string());
        session.inbuf_extend(b"NICK bob\r\nUSER bob 0 * :Bo");
        assert_eq!(session.take_lines(), vec!["NICK bob"]);
        session.inbuf_extend(b"b\r\n");
        assert_eq!(session.take_lines(), vec!["USER bob 0 * :Bob"]);
    }
}

#[cfg(test)]
impl Session {
    pub fn inbuf_extend(&mut self, bytes: &[u8]) {
        self.inbuf.extend_from_slice(bytes);
    }
}
