//! Takeover pairing for the single-process run modes
//!
//! When a new connection identifies under a nick that already has a live,
//! identified session, the established client is offered the chance to
//! hand its socket over. On acceptance the old socket is duplicated and
//! adopted by the new session, which resynchronizes state over the adopted
//! link; the old session is then freed. Every inconsistency resolves as a
//! failure that leaves both sessions usable, never as a crash.
//!
//! The forked run mode runs the same state machine with the coordinator
//! relaying messages between worker processes (see `ipc::master` and
//! `ipc::child`); here both sides live in one registry.

use tracing::{debug, warn};

use crate::command::{Action, Ctx};
use crate::registry::Registry;
use crate::session::Takeover;

/// What the event loop must do after a takeover step
#[derive(Default)]
pub struct TakeoverResult {
    pub actions: Vec<Action>,
    /// Session freed; drop its socket from the poller
    pub removed: Option<usize>,
    /// Session whose socket was swapped; re-register it
    pub rewired: Option<usize>,
}

impl TakeoverResult {
    fn plain(actions: Vec<Action>) -> Self {
        Self {
            actions,
            ..Self::default()
        }
    }
}

/// A session's credentials checked out. Either pair it with an existing
/// session under the same nick, or complete a normal identify.
pub fn handle_identify(
    reg: &mut Registry,
    ctx: &mut Ctx,
    me: usize,
    nick: &str,
    password: &str,
) -> TakeoverResult {
    let peer = if ctx.cfg.allow_takeover {
        reg.find_takeover_peer(me, nick)
    } else {
        None
    };

    let Some(peer) = peer else {
        return TakeoverResult::plain(complete(reg, ctx, me, password));
    };

    let Some((newcomer, established)) = reg.two_mut(me, peer) else {
        return TakeoverResult::plain(complete(reg, ctx, me, password));
    };
    debug!(nick, new = me, old = peer, "takeover offered");
    newcomer.takeover = Takeover::AwaitingReply {
        nick: nick.to_string(),
        password: password.to_string(),
        peer: Some(peer),
    };
    established.takeover = Takeover::Offered { peer: Some(me) };
    established.usermsg(
        &ctx.cfg.service_nick,
        &ctx.cfg.control_channel,
        "A new connection just identified as you. Type \x02yes\x02 to move \
         this session to it, or \x02no\x02 to keep this connection.",
    );
    newcomer.usermsg(
        &ctx.cfg.service_nick,
        &ctx.cfg.control_channel,
        "You already have a session open; asking it whether to hand over.",
    );
    TakeoverResult::default()
}

/// The established client answered the offer
pub fn handle_answer(
    reg: &mut Registry,
    ctx: &mut Ctx,
    old_id: usize,
    accept: bool,
) -> TakeoverResult {
    let Some(old) = reg.get_mut(old_id) else {
        return TakeoverResult::default();
    };
    let Takeover::Offered { peer } = std::mem::take(&mut old.takeover) else {
        return TakeoverResult::default();
    };
    let Some(new_id) = peer else {
        return TakeoverResult::default();
    };

    if !accept {
        old.usermsg(
            &ctx.cfg.service_nick,
            &ctx.cfg.control_channel,
            "Keeping this connection.",
        );
        return fail(reg, ctx, new_id, "The established session declined the takeover.");
    }

    // Accepted: duplicate the old socket and run the auth leg. Both sides
    // re-check the credential; any mismatch resolves as a failure.
    let dup = match reg.get_mut(old_id).and_then(|old| {
        old.takeover = Takeover::AuthPending { peer: Some(new_id) };
        old.desynced = true;
        old.dup_socket().ok()
    }) {
        Some(fd) => fd,
        None => {
            warn!(old = old_id, "takeover accept without a live socket");
            return fail_both(reg, ctx, old_id, new_id);
        }
    };

    let credentials = match reg.get_mut(new_id).map(|n| std::mem::take(&mut n.takeover)) {
        Some(Takeover::AwaitingReply { nick, password, .. }) => Some((nick, password)),
        _ => None,
    };
    let valid = credentials
        .as_ref()
        .is_some_and(|(nick, password)| ctx.store.verify(nick, password));
    if !valid {
        warn!(new = new_id, old = old_id, "takeover credential re-check failed");
        return fail_both(reg, ctx, old_id, new_id);
    }
    let (_, password) = credentials.unwrap_or_default();

    let adopted = reg
        .get_mut(new_id)
        .map(|newcomer| newcomer.adopt_socket(dup).is_ok())
        .unwrap_or(false);
    if !adopted {
        return fail_both(reg, ctx, old_id, new_id);
    }

    // Done: the new session owns the link; the old one is freed.
    debug!(new = new_id, old = old_id, "takeover complete");
    let mut actions = Vec::new();
    if let Some(newcomer) = reg.get_mut(new_id) {
        newcomer.resync(ctx);
        let service = ctx.cfg.service_nick.clone();
        let channel = ctx.cfg.control_channel.clone();
        actions.extend(newcomer.complete_identify(&service, &channel, &password));
    }
    reg.remove(old_id);
    TakeoverResult {
        actions,
        removed: Some(old_id),
        rewired: Some(new_id),
    }
}

/// Clear a dead pairing half. Called when one participant disconnects
/// mid-exchange; the survivor falls back to a normal session.
pub fn handle_peer_gone(reg: &mut Registry, ctx: &mut Ctx, gone: usize) -> TakeoverResult {
    let survivor = reg.ids().into_iter().find(|&id| {
        reg.get(id).is_some_and(|s| match &s.takeover {
            Takeover::AwaitingReply { peer, .. }
            | Takeover::Offered { peer }
            | Takeover::AuthPending { peer } => *peer == Some(gone),
            Takeover::Idle => false,
        })
    });
    let Some(id) = survivor else {
        return TakeoverResult::default();
    };
    match reg.get_mut(id).map(|s| std::mem::take(&mut s.takeover)) {
        Some(Takeover::AwaitingReply { .. }) => {
            fail(reg, ctx, id, "The established session went away; staying on this connection.")
        }
        Some(_) => {
            if let Some(s) = reg.get_mut(id) {
                s.desynced = false;
                s.usermsg(
                    &ctx.cfg.service_nick,
                    &ctx.cfg.control_channel,
                    "The connection asking to take over went away.",
                );
            }
            TakeoverResult::default()
        }
        None => TakeoverResult::default(),
    }
}

fn complete(reg: &mut Registry, ctx: &mut Ctx, id: usize, password: &str) -> Vec<Action> {
    let service = ctx.cfg.service_nick.clone();
    let channel = ctx.cfg.control_channel.clone();
    reg.get_mut(id)
        .map(|s| s.complete_identify(&service, &channel, password))
        .unwrap_or_default()
}

/// Tell the new side the exchange is off; it stays unidentified.
fn fail(reg: &mut Registry, ctx: &mut Ctx, new_id: usize, text: &str) -> TakeoverResult {
    if let Some(newcomer) = reg.get_mut(new_id) {
        newcomer.takeover = Takeover::Idle;
        newcomer.usermsg(&ctx.cfg.service_nick, &ctx.cfg.control_channel, text);
    }
    TakeoverResult::default()
}

fn fail_both(reg: &mut Registry, ctx: &mut Ctx, old_id: usize, new_id: usize) -> TakeoverResult {
    if let Some(old) = reg.get_mut(old_id) {
        old.takeover = Takeover::Idle;
        old.desynced = false;
        old.usermsg(
            &ctx.cfg.service_nick,
            &ctx.cfg.control_channel,
            "Takeover failed; keeping this connection.",
        );
    }
    fail(reg, ctx, new_id, "Takeover failed.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryStore;
    use crate::config::Config;
    use crate::session::{Session, Status};
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    struct Wired {
        session_id: usize,
        client: TcpStream,
    }

    fn wired_session(reg: &mut Registry, nick: &str, listener: &TcpListener) -> Wired {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let mut session =
            Session::from_stream(accepted, "gw.test".to_string(), "localhost".to_string()).unwrap();
        session.nick = Some(nick.to_string());
        session.user = Some(nick.to_string());
        session.status.insert(Status::LOGGED_IN);
        let session_id = reg.insert(session);
        client
            .set_read_timeout(Some(std::time::Duration::from_millis(500)))
            .unwrap();
        Wired { session_id, client }
    }

    fn fixture() -> (Config, MemoryStore) {
        let mut cfg = Config::default();
        cfg.accounts.insert("bob".to_string(), "sekrit".to_string());
        let store = MemoryStore::new(cfg.accounts.clone());
        (cfg, store)
    }

    fn read_available(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[test]
    fn identify_with_no_peer_completes_normally() {
        let (cfg, mut store) = fixture();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut reg = Registry::new();
        let new = wired_session(&mut reg, "bob", &listener);
        let mut ctx = Ctx { cfg: &cfg, store: &mut store };

        let result = handle_identify(&mut reg, &mut ctx, new.session_id, "bob", "sekrit");
        assert!(result.removed.is_none());
        let session = reg.get(new.session_id).unwrap();
        assert!(session.status.contains(Status::IDENTIFIED));
        assert!(
            result
                .actions
                .iter()
                .any(|a| matches!(a, Action::Forward(argv) if argv[0] == "password"))
        );
    }

    #[test]
    fn second_identify_offers_exactly_one_takeover() {
        let (cfg, mut store) = fixture();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut reg = Registry::new();
        let mut old = wired_session(&mut reg, "bob", &listener);
        let new = wired_session(&mut reg, "bob", &listener);
        let mut ctx = Ctx { cfg: &cfg, store: &mut store };

        let _ = handle_identify(&mut reg, &mut ctx, old.session_id, "bob", "sekrit");
        let result = handle_identify(&mut reg, &mut ctx, new.session_id, "bob", "sekrit");
        assert!(result.actions.is_empty());

        assert!(matches!(
            reg.get(old.session_id).unwrap().takeover,
            Takeover::Offered { peer: Some(p) } if p == new.session_id
        ));
        assert!(matches!(
            reg.get(new.session_id).unwrap().takeover,
            Takeover::AwaitingReply { .. }
        ));

        // Exactly one offer prompt on the established client's wire.
        reg.get_mut(old.session_id).unwrap().flush();
        let seen = read_available(&mut old.client);
        assert_eq!(seen.matches("yes\u{2}").count(), 1);
    }

    #[test]
    fn accepted_takeover_leaves_one_owner_of_the_link() {
        let (cfg, mut store) = fixture();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut reg = Registry::new();
        let mut old = wired_session(&mut reg, "bob", &listener);
        let new = wired_session(&mut reg, "bob", &listener);
        let mut ctx = Ctx { cfg: &cfg, store: &mut store };

        let _ = handle_identify(&mut reg, &mut ctx, old.session_id, "bob", "sekrit");
        let _ = handle_identify(&mut reg, &mut ctx, new.session_id, "bob", "sekrit");
        let result = handle_answer(&mut reg, &mut ctx, old.session_id, true);

        assert_eq!(result.removed, Some(old.session_id));
        assert_eq!(result.rewired, Some(new.session_id));
        assert!(reg.get(old.session_id).is_none());

        let survivor = reg.get_mut(new.session_id).unwrap();
        assert!(survivor.status.contains(Status::IDENTIFIED));
        assert_eq!(survivor.takeover, Takeover::Idle);

        // The resync burst lands on the old client's screen: its socket is
        // what the surviving session now writes to.
        survivor.flush();
        let seen = read_available(&mut old.client);
        assert!(seen.contains("taken over"), "resync missing: {seen}");
    }

    #[test]
    fn declined_takeover_keeps_both_sessions() {
        let (cfg, mut store) = fixture();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut reg = Registry::new();
        let old = wired_session(&mut reg, "bob", &listener);
        let new = wired_session(&mut reg, "bob", &listener);
        let mut ctx = Ctx { cfg: &cfg, store: &mut store };

        let _ = handle_identify(&mut reg, &mut ctx, old.session_id, "bob", "sekrit");
        let _ = handle_identify(&mut reg, &mut ctx, new.session_id, "bob", "sekrit");
        let result = handle_answer(&mut reg, &mut ctx, old.session_id, false);

        assert!(result.removed.is_none());
        assert_eq!(reg.get(old.session_id).unwrap().takeover, Takeover::Idle);
        let newcomer = reg.get(new.session_id).unwrap();
        assert_eq!(newcomer.takeover, Takeover::Idle);
        assert!(!newcomer.status.contains(Status::IDENTIFIED));
    }

    #[test]
    fn credential_mismatch_fails_and_changes_nothing() {
        let (cfg, mut store) = fixture();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut reg = Registry::new();
        let old = wired_session(&mut reg, "bob", &listener);
        let new = wired_session(&mut reg, "bob", &listener);
        let mut ctx = Ctx { cfg: &cfg, store: &mut store };

        let _ = handle_identify(&mut reg, &mut ctx, old.session_id, "bob", "sekrit");
        let _ = handle_identify(&mut reg, &mut ctx, new.session_id, "bob", "sekrit");

        // Simulate a stale credential cached on the new side.
        reg.get_mut(new.session_id).unwrap().takeover = Takeover::AwaitingReply {
            nick: "bob".to_string(),
            password: "stale".to_string(),
            peer: Some(old.session_id),
        };

        let result = handle_answer(&mut reg, &mut ctx, old.session_id, true);
        assert!(result.removed.is_none());

        let old_side = reg.get(old.session_id).unwrap();
        assert_eq!(old_side.takeover, Takeover::Idle);
        assert!(!old_side.desynced);
        let new_side = reg.get(new.session_id).unwrap();
        assert_eq!(new_side.takeover, Takeover::Idle);
        assert!(!new_side.status.contains(Status::IDENTIFIED));
    }

    #[test]
    fn takeover_disabled_means_plain_identify() {
        let (mut cfg, mut store) = fixture();
        cfg.allow_takeover = false;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut reg = Registry::new();
        let old = wired_session(&mut reg, "bob", &listener);
        let new = wired_session(&mut reg, "bob", &listener);
        let mut ctx = Ctx { cfg: &cfg, store: &mut store };

        let _ = handle_identify(&mut reg, &mut ctx, old.session_id, "bob", "sekrit");
        let _ = handle_identify(&mut reg, &mut ctx, new.session_id, "bob", "sekrit");
        assert_eq!(reg.get(old.session_id).unwrap().takeover, Takeover::Idle);
        assert!(reg.get(new.session_id).unwrap().status.contains(Status::IDENTIFIED));
    }

    #[test]
    fn disconnecting_peer_clears_the_pairing() {
        let (cfg, mut store) = fixture();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut reg = Registry::new();
        let old = wired_session(&mut reg, "bob", &listener);
        let new = wired_session(&mut reg, "bob", &listener);
        let mut ctx = Ctx { cfg: &cfg, store: &mut store };

        let _ = handle_identify(&mut reg, &mut ctx, old.session_id, "bob", "sekrit");
        let _ = handle_identify(&mut reg, &mut ctx, new.session_id, "bob", "sekrit");

        reg.remove(old.session_id);
        let _ = handle_peer_gone(&mut reg, &mut ctx, old.session_id);
        assert_eq!(reg.get(new.session_id).unwrap().takeover, Takeover::Idle);
    }
}
