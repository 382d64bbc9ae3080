//! Worker-side IPC handling
//!
//! A worker owns exactly one client session plus its channel to the
//! coordinator. `deliver_actions` turns handler actions into IPC traffic;
//! `handle_message` applies coordinator commands to the local session.
//! Both ends of the takeover exchange live here: the established side
//! answers the offer and ships its duplicated socket, the new side adopts
//! the descriptor it gets back.

use std::io;
use std::os::fd::OwnedFd;

use tracing::{debug, warn};

use crate::command::{Action, Ctx};
use crate::ipc::channel::IpcChannel;
use crate::session::{Session, Status, Takeover};

/// What the worker loop must do after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildDisposition {
    Continue,
    /// The session's socket changed; re-register it with the poller
    Rewired,
    /// Reload the configuration file
    Rehash,
    /// Flush and terminate this worker
    Exit,
}

pub struct ChildLink {
    pub chan: IpcChannel,
}

impl ChildLink {
    pub fn new(chan: IpcChannel) -> Self {
        Self { chan }
    }

    /// Announce the session to the coordinator. Sent at login and again
    /// whenever a restarted coordinator says `hello`.
    pub fn announce(&mut self, session: &Session) -> io::Result<()> {
        if !session.status.contains(Status::LOGGED_IN) {
            return Ok(());
        }
        self.chan.send(&[
            "client",
            &session.host,
            session.nick_or_star(),
            session.realname.as_deref().unwrap_or(""),
        ])?;
        if let Some(password) = &session.password {
            if session.status.contains(Status::IDENTIFIED) {
                self.chan.send(&["password", password])?;
            }
        }
        Ok(())
    }

    /// Interpret handler actions, sending whatever belongs on the wire
    pub fn deliver_actions(
        &mut self,
        session: &mut Session,
        ctx: &mut Ctx,
        actions: Vec<Action>,
    ) -> io::Result<ChildDisposition> {
        let mut disposition = ChildDisposition::Continue;
        for action in actions {
            match action {
                Action::Forward(argv) => {
                    self.chan.send(&argv)?;
                }
                Action::Close => {
                    disposition = ChildDisposition::Exit;
                }
                Action::IdentifyRequest { nick, password } => {
                    let next = self.identify_request(session, ctx, nick, password)?;
                    if next == ChildDisposition::Exit {
                        disposition = next;
                    }
                }
                Action::TakeoverAnswer(accept) => {
                    self.takeover_answer(session, ctx, accept)?;
                }
            }
        }
        Ok(disposition)
    }

    /// New side: ask the coordinator for a takeover before identifying
    fn identify_request(
        &mut self,
        session: &mut Session,
        ctx: &mut Ctx,
        nick: String,
        password: String,
    ) -> io::Result<ChildDisposition> {
        if ctx.cfg.allow_takeover && session.takeover == Takeover::Idle {
            self.chan
                .send(&["takeover", "init", &nick, &password])?;
            session.takeover = Takeover::AwaitingReply {
                nick,
                password,
                peer: None,
            };
            return Ok(ChildDisposition::Continue);
        }
        self.finish_identify(session, ctx, &password)
    }

    fn finish_identify(
        &mut self,
        session: &mut Session,
        ctx: &mut Ctx,
        password: &str,
    ) -> io::Result<ChildDisposition> {
        let service = ctx.cfg.service_nick.clone();
        let channel = ctx.cfg.control_channel.clone();
        let actions = session.complete_identify(&service, &channel, password);
        self.deliver_actions(session, ctx, actions)
    }

    /// Established side: the client answered the offer
    fn takeover_answer(
        &mut self,
        session: &mut Session,
        ctx: &mut Ctx,
        accept: bool,
    ) -> io::Result<()> {
        let Takeover::Offered { peer } = std::mem::take(&mut session.takeover) else {
            return Ok(());
        };
        if !accept {
            session.usermsg(
                &ctx.cfg.service_nick,
                &ctx.cfg.control_channel,
                "Keeping this connection.",
            );
            return self.chan.send(&["takeover", "fail"]);
        }
        let (Some(nick), Some(password)) = (session.nick.clone(), session.password.clone()) else {
            session.takeover = Takeover::Idle;
            return self.chan.send(&["takeover", "fail"]);
        };
        let dup = match session.dup_socket() {
            Ok(fd) => fd,
            Err(e) => {
                warn!(error = %e, "could not duplicate the client socket");
                session.takeover = Takeover::Idle;
                return self.chan.send(&["takeover", "fail"]);
            }
        };
        session.takeover = Takeover::AuthPending { peer };
        session.desynced = true;
        match self
            .chan
            .send_with_fd(&["takeover", "auth", &nick, &password], dup)
        {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "could not ship the duplicated socket");
                session.takeover = Takeover::Idle;
                session.desynced = false;
                self.chan.send(&["takeover", "fail"])
            }
        }
    }

    /// Apply one coordinator message to the local session
    pub fn handle_message(
        &mut self,
        session: &mut Session,
        ctx: &mut Ctx,
        argv: &[String],
        fd: Option<OwnedFd>,
    ) -> io::Result<ChildDisposition> {
        let Some(cmd) = argv.first() else {
            return Ok(ChildDisposition::Continue);
        };
        match cmd.to_ascii_lowercase().as_str() {
            "die" => {
                session.write_argv(&["ERROR", "Server going down"]);
                return Ok(ChildDisposition::Exit);
            }
            "rehash" => return Ok(ChildDisposition::Rehash),
            "wallops" if argv.len() >= 2 => {
                if session.umode.contains('w') {
                    let prefix = format!(":{}", session.server_name);
                    session.write_argv(&[&prefix, "WALLOPS", &argv[1]]);
                }
            }
            "wall" if argv.len() >= 2 => {
                if session.umode.contains('s') {
                    self.server_notice(session, &argv[1]);
                }
            }
            "opmsg" if argv.len() >= 2 => {
                if session.umode.contains('o') {
                    self.server_notice(session, &argv[1]);
                }
            }
            "kill" if argv.len() >= 2 => {
                if session
                    .nick
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(&argv[1]))
                {
                    let reason = argv.get(2).map(String::as_str).unwrap_or("Killed");
                    session.write_argv(&["ERROR", &format!("Closing link: {reason}")]);
                    return Ok(ChildDisposition::Exit);
                }
            }
            "hello" => {
                self.announce(session)?;
            }
            "takeover" if argv.len() >= 2 => {
                return self.takeover_message(session, ctx, &argv[1..], fd);
            }
            other => {
                debug!(cmd = other, "ignoring unknown coordinator command");
            }
        }
        Ok(ChildDisposition::Continue)
    }

    fn takeover_message(
        &mut self,
        session: &mut Session,
        ctx: &mut Ctx,
        args: &[String],
        fd: Option<OwnedFd>,
    ) -> io::Result<ChildDisposition> {
        match args[0].to_ascii_lowercase().as_str() {
            // Established side: a new connection wants this session.
            "init" if args.len() >= 3 => {
                let wanted = session.takeover == Takeover::Idle
                    && ctx.cfg.allow_takeover
                    && session.status.contains(Status::IDENTIFIED)
                    && session
                        .nick
                        .as_deref()
                        .is_some_and(|n| n.eq_ignore_ascii_case(&args[1]));
                if !wanted {
                    self.chan.send(&["takeover", "fail"])?;
                    return Ok(ChildDisposition::Continue);
                }
                session.takeover = Takeover::Offered { peer: None };
                session.usermsg(
                    &ctx.cfg.service_nick,
                    &ctx.cfg.control_channel,
                    "A new connection just identified as you. Type \x02yes\x02 \
                     to move this session to it, or \x02no\x02 to keep this \
                     connection.",
                );
            }
            // New side: no established session matched.
            "no" => {
                if let Takeover::AwaitingReply { password, .. } =
                    std::mem::take(&mut session.takeover)
                {
                    return self.finish_identify(session, ctx, &password);
                }
            }
            // New side: here is the established session's socket.
            "auth" if args.len() >= 3 => {
                let Takeover::AwaitingReply { nick, password, .. } =
                    std::mem::take(&mut session.takeover)
                else {
                    // Stale pairing; nothing to adopt.
                    return self.chan.send(&["takeover", "fail"]).map(|()| ChildDisposition::Continue);
                };
                let valid = fd.is_some()
                    && nick.eq_ignore_ascii_case(&args[1])
                    && password == args[2]
                    && ctx.store.verify(&nick, &password);
                let Some(fd) = fd.filter(|_| valid) else {
                    warn!("takeover auth failed local validation");
                    self.chan.send(&["takeover", "fail"])?;
                    return Ok(ChildDisposition::Continue);
                };
                if session.adopt_socket(fd).is_err() {
                    self.chan.send(&["takeover", "fail"])?;
                    return Ok(ChildDisposition::Continue);
                }
                session.resync(ctx);
                self.finish_identify(session, ctx, &password)?;
                self.chan.send(&["takeover", "done"])?;
                return Ok(ChildDisposition::Rewired);
            }
            // Established side: the other end owns the link now.
            "done" => {
                if matches!(session.takeover, Takeover::AuthPending { .. }) {
                    session.drop_socket();
                    return Ok(ChildDisposition::Exit);
                }
            }
            "fail" => match std::mem::take(&mut session.takeover) {
                Takeover::AwaitingReply { password, .. } => {
                    session.usermsg(
                        &ctx.cfg.service_nick,
                        &ctx.cfg.control_channel,
                        "Takeover failed; staying on this connection.",
                    );
                    return self.finish_identify(session, ctx, &password);
                }
                Takeover::Idle => {}
                _ => {
                    session.desynced = false;
                    session.usermsg(
                        &ctx.cfg.service_nick,
                        &ctx.cfg.control_channel,
                        "Takeover failed; keeping this connection.",
                    );
                }
            },
            _ => {}
        }
        Ok(ChildDisposition::Continue)
    }

    fn server_notice(&self, session: &mut Session, text: &str) {
        let prefix = format!(":{}", session.server_name);
        let nick = session.nick_or_star().to_string();
        session.write_argv(&[&prefix, "NOTICE", &nick, text]);
    }
}
