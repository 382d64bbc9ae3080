//! Client command table and dispatcher
//!
//! Every client command lives in one static table entry carrying its flag
//! set, its minimum argument count, and its handler. `dispatch` checks the
//! preconditions in a fixed order so a command that is both too early and
//! short of arguments always gets the registration error, not the
//! parameter one.

use crate::auth::CredentialStore;
use crate::config::Config;
use crate::numeric::*;
use crate::root;
use crate::session::{PendingSecret, Session, Status};

/// Shared collaborators handed to every handler
pub struct Ctx<'a> {
    pub cfg: &'a Config,
    pub store: &'a mut dyn CredentialStore,
}

/// What a handler wants the surrounding run mode to do.
///
/// Handlers never talk to other processes or other sessions directly;
/// they queue replies on their own session and emit actions, which the
/// run-mode loop interprets exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Deliver this argument vector to the coordinator (the master
    /// process, or the in-process worker table in single-process modes)
    Forward(Vec<String>),
    /// Flush and drop this session
    Close,
    /// Credentials checked out locally; the coordinator decides whether
    /// this becomes a takeover offer or a plain identify
    IdentifyRequest { nick: String, password: String },
    /// The client answered a pending takeover offer
    TakeoverAnswer(bool),
}

type Handler = fn(&mut Session, &mut Ctx, &[String]) -> Vec<Action>;

/// Only valid before registration completes
const PRE_LOGIN: u8 = 1;
/// Only valid after registration completes
const LOGGED_IN: u8 = 2;
/// Requires operator status
const OPER_ONLY: u8 = 4;
/// Executed by the coordinator, not locally
const TO_MASTER: u8 = 8;

struct CommandSpec {
    name: &'static str,
    min_args: usize,
    flags: u8,
    handler: Handler,
}

static COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "PASS", min_args: 1, flags: PRE_LOGIN, handler: cmd_pass },
    CommandSpec { name: "USER", min_args: 4, flags: PRE_LOGIN, handler: cmd_user },
    CommandSpec { name: "NICK", min_args: 1, flags: 0, handler: cmd_nick },
    CommandSpec { name: "CAP", min_args: 1, flags: 0, handler: cmd_cap },
    CommandSpec { name: "AUTHENTICATE", min_args: 1, flags: PRE_LOGIN, handler: cmd_authenticate },
    CommandSpec { name: "QUIT", min_args: 0, flags: 0, handler: cmd_quit },
    CommandSpec { name: "PING", min_args: 0, flags: 0, handler: cmd_ping },
    CommandSpec { name: "PONG", min_args: 0, flags: LOGGED_IN, handler: cmd_pong },
    CommandSpec { name: "OPER", min_args: 2, flags: LOGGED_IN, handler: cmd_oper },
    CommandSpec { name: "MODE", min_args: 1, flags: LOGGED_IN, handler: cmd_mode },
    CommandSpec { name: "AWAY", min_args: 0, flags: LOGGED_IN, handler: cmd_away },
    CommandSpec { name: "USERHOST", min_args: 1, flags: LOGGED_IN, handler: cmd_userhost },
    CommandSpec { name: "ISON", min_args: 1, flags: LOGGED_IN, handler: cmd_ison },
    CommandSpec { name: "WATCH", min_args: 1, flags: LOGGED_IN, handler: cmd_watch },
    CommandSpec { name: "WHOIS", min_args: 1, flags: LOGGED_IN, handler: cmd_whois },
    CommandSpec { name: "WHOWAS", min_args: 1, flags: LOGGED_IN, handler: cmd_whowas },
    CommandSpec { name: "VERSION", min_args: 0, flags: LOGGED_IN, handler: cmd_version },
    CommandSpec { name: "MOTD", min_args: 0, flags: LOGGED_IN, handler: cmd_motd },
    CommandSpec { name: "NAMES", min_args: 0, flags: LOGGED_IN, handler: cmd_names },
    CommandSpec { name: "TOPIC", min_args: 1, flags: LOGGED_IN, handler: cmd_topic },
    CommandSpec { name: "JOIN", min_args: 1, flags: LOGGED_IN, handler: cmd_join },
    CommandSpec { name: "PART", min_args: 1, flags: LOGGED_IN, handler: cmd_part },
    CommandSpec { name: "INVITE", min_args: 2, flags: LOGGED_IN, handler: cmd_invite },
    CommandSpec { name: "PRIVMSG", min_args: 1, flags: LOGGED_IN, handler: cmd_privmsg },
    CommandSpec { name: "NOTICE", min_args: 1, flags: LOGGED_IN, handler: cmd_notice },
    CommandSpec { name: "REHASH", min_args: 0, flags: LOGGED_IN | OPER_ONLY, handler: cmd_rehash },
    CommandSpec { name: "WALLOPS", min_args: 1, flags: LOGGED_IN | OPER_ONLY | TO_MASTER, handler: cmd_master },
    CommandSpec { name: "WALL", min_args: 1, flags: LOGGED_IN | OPER_ONLY | TO_MASTER, handler: cmd_master },
    CommandSpec { name: "OPMSG", min_args: 1, flags: LOGGED_IN | OPER_ONLY | TO_MASTER, handler: cmd_master },
    CommandSpec { name: "KILL", min_args: 2, flags: LOGGED_IN | OPER_ONLY | TO_MASTER, handler: cmd_master },
    CommandSpec { name: "DEAF", min_args: 0, flags: LOGGED_IN | OPER_ONLY | TO_MASTER, handler: cmd_master },
    CommandSpec { name: "DIE", min_args: 0, flags: LOGGED_IN | OPER_ONLY | TO_MASTER, handler: cmd_master },
    CommandSpec { name: "RESTART", min_args: 0, flags: LOGGED_IN | OPER_ONLY | TO_MASTER, handler: cmd_master },
];

/// Run one parsed client line against the table.
///
/// Precondition order: registration state first, privilege second,
/// argument count third, coordinator forwarding last.
pub fn dispatch(session: &mut Session, ctx: &mut Ctx, argv: &[String]) -> Vec<Action> {
    let Some(cmd) = argv.first() else {
        return Vec::new();
    };
    let Some(spec) = COMMANDS
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(cmd))
    else {
        // Pre-login garbage is dropped silently.
        if session.status.contains(Status::LOGGED_IN) {
            session.reply(ERR_UNKNOWNCOMMAND, &[cmd, "Unknown command"]);
        }
        return Vec::new();
    };

    let logged_in = session.status.contains(Status::LOGGED_IN);
    if spec.flags & PRE_LOGIN != 0 && logged_in {
        session.reply(ERR_ALREADYREGISTERED, &["You may not reregister"]);
        return Vec::new();
    }
    if spec.flags & LOGGED_IN != 0 && !logged_in {
        session.reply(ERR_NOTREGISTERED, &["You have not registered"]);
        return Vec::new();
    }
    if spec.flags & OPER_ONLY != 0 && !session.is_oper() {
        session.reply(ERR_NOPRIVILEGES, &["Permission Denied - You're not an IRC operator"]);
        return Vec::new();
    }
    if argv.len() - 1 < spec.min_args {
        session.reply(ERR_NEEDMOREPARAMS, &[spec.name, "Not enough parameters"]);
        return Vec::new();
    }
    if spec.flags & TO_MASTER != 0 {
        return vec![Action::Forward(argv.to_vec())];
    }
    (spec.handler)(session, ctx, &argv[1..])
}

// ---- registration ----

fn cmd_pass(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let given = &args[0];
    match &ctx.cfg.auth_password {
        Some(secret) if secret == given => {
            session.status.insert(Status::AUTHORIZED);
            session.check_login(ctx)
        }
        Some(_) => {
            session.reply(ERR_PASSWDMISMATCH, &["Incorrect password"]);
            Vec::new()
        }
        None => {
            // No server secret configured; hold it for identify at login.
            session.password = Some(given.clone());
            Vec::new()
        }
    }
}

fn cmd_user(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    session.user = Some(args[0].clone());
    session.realname = Some(args[3].clone());
    session.check_login(ctx)
}

fn valid_nick(nick: &str) -> bool {
    const SPECIAL: &str = "[]\\`_^{|}";
    let mut chars = nick.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || SPECIAL.contains(first)) {
        return false;
    }
    nick.len() <= 24
        && chars.all(|c| c.is_ascii_alphanumeric() || SPECIAL.contains(c) || c == '-')
}

fn cmd_nick(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let nick = &args[0];
    if !valid_nick(nick) {
        session.reply(ERR_ERRONEUSNICKNAME, &[nick, "Erroneous nickname"]);
        return Vec::new();
    }
    if nick.eq_ignore_ascii_case(&ctx.cfg.service_nick) {
        session.reply(ERR_NICKNAMEINUSE, &[nick, "Nickname is already in use"]);
        return Vec::new();
    }
    if session.status.contains(Status::LOGGED_IN) {
        // Renaming invalidates the identified credential.
        let prefix = format!(":{}", session.prefix());
        session.status.remove(Status::IDENTIFIED);
        session.nick = Some(nick.clone());
        session.write_argv(&[&prefix, "NICK", nick]);
        return vec![Action::Forward(vec!["nick".to_string(), nick.clone()])];
    }
    session.nick = Some(nick.clone());
    // Forked workers mirror the nick to the coordinator so takeover
    // matching can find this session before login completes.
    let mut actions = vec![Action::Forward(vec!["nick".to_string(), nick.clone()])];
    actions.extend(session.check_login(ctx));
    actions
}

fn cmd_cap(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    session.cap_command(ctx, args)
}

fn cmd_authenticate(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    session.authenticate_command(ctx, args)
}

// ---- liveness ----

fn cmd_quit(session: &mut Session, _ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let reason = args.first().map(String::as_str).unwrap_or("Leaving");
    session.write_argv(&["ERROR", &format!("Closing link: {reason}")]);
    session.status.insert(Status::SHUTDOWN);
    vec![Action::Close]
}

fn cmd_ping(session: &mut Session, _ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let server = format!(":{}", session.server_name);
    let name = session.server_name.clone();
    match args.first() {
        Some(token) => session.write_argv(&[&server, "PONG", &name, token]),
        None => session.write_argv(&[&server, "PONG", &name]),
    }
    Vec::new()
}

fn cmd_pong(session: &mut Session, _ctx: &mut Ctx, _args: &[String]) -> Vec<Action> {
    session.last_pong = std::time::Instant::now();
    session.ping_sent = false;
    Vec::new()
}

// ---- privilege and modes ----

fn cmd_oper(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let secret = &args[1];

    // An armed control-service prompt consumes the OPER secret; this is
    // the no-echo path for sending passwords.
    if let Some(pending) = session.pending_secret.take() {
        return match pending {
            PendingSecret::Identify => root::identify(session, ctx, Some(secret)),
            PendingSecret::Register => root::register(session, ctx, Some(secret)),
        };
    }

    match &ctx.cfg.oper_password {
        Some(expected) if expected == secret => {
            session.set_umode("+o", true);
            session.reply(RPL_YOUREOPER, &["You are now an IRC operator"]);
        }
        _ => {
            session.reply(ERR_NOOPERHOST, &["Incorrect operator password"]);
        }
    }
    Vec::new()
}

fn cmd_mode(session: &mut Session, _ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let target = &args[0];
    if target.starts_with(['#', '&']) {
        if session.channels.iter().any(|c| c.eq_ignore_ascii_case(target)) {
            match args.get(1).map(String::as_str) {
                None => session.reply(RPL_CHANNELMODEIS, &[target, "+t"]),
                Some("+b" | "b") => {
                    session.reply(RPL_ENDOFBANLIST, &[target, "End of channel ban list"]);
                }
                Some(_) => {
                    session.reply(ERR_NOCHANMODES, &[target, "Channel modes are fixed here"]);
                }
            }
        } else {
            session.reply(ERR_NOSUCHCHANNEL, &[target, "No such channel"]);
        }
        return Vec::new();
    }
    if !target.eq_ignore_ascii_case(session.nick_or_star()) {
        session.reply(ERR_USERSDONTMATCH, &["Can't change mode for other users"]);
        return Vec::new();
    }
    match args.get(1) {
        Some(delta) => session.set_umode(delta, false),
        None => {
            let mode = format!("+{}", session.umode);
            session.reply(RPL_UMODEIS, &[&mode]);
        }
    }
    Vec::new()
}

fn cmd_away(session: &mut Session, _ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    match args.first().filter(|text| !text.is_empty()) {
        Some(text) => {
            session.away = Some(text.clone());
            session.reply(RPL_NOWAWAY, &["You have been marked as being away"]);
        }
        None => {
            session.away = None;
            session.reply(RPL_UNAWAY, &["You are no longer marked as being away"]);
        }
    }
    Vec::new()
}

// ---- presence queries ----

fn known_nick(session: &Session, cfg: &Config, nick: &str) -> bool {
    nick.eq_ignore_ascii_case(session.nick_or_star())
        || nick.eq_ignore_ascii_case(&cfg.service_nick)
}

fn cmd_userhost(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let mut entries = Vec::new();
    for nick in args {
        if nick.eq_ignore_ascii_case(session.nick_or_star()) {
            entries.push(format!("{}=+{}", nick, session.prefix()));
        } else if nick.eq_ignore_ascii_case(&ctx.cfg.service_nick) {
            entries.push(format!("{nick}=+{nick}@{}", session.server_name));
        }
    }
    let joined = entries.join(" ");
    session.reply(RPL_USERHOST, &[&joined]);
    Vec::new()
}

fn cmd_ison(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let online: Vec<&str> = args
        .iter()
        .flat_map(|arg| arg.split_whitespace())
        .filter(|nick| known_nick(session, ctx.cfg, nick))
        .collect();
    let joined = online.join(" ");
    session.reply(RPL_ISON, &[&joined]);
    Vec::new()
}

fn cmd_watch(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    for token in args {
        let (op, nick) = match token.split_at_checked(1) {
            Some(("+", nick)) if !nick.is_empty() => ('+', nick),
            Some(("-", nick)) if !nick.is_empty() => ('-', nick),
            _ => continue,
        };
        let key = nick.to_ascii_lowercase();
        if op == '+' {
            session.watches.insert(key);
            let code = if known_nick(session, ctx.cfg, nick) {
                RPL_NOWON
            } else {
                RPL_NOWOFF
            };
            session.reply(code, &[nick, "*", "*", "0", "is watched"]);
        } else {
            session.watches.remove(&key);
            session.reply(RPL_WATCHOFF, &[nick, "*", "*", "0", "stopped watching"]);
        }
    }
    Vec::new()
}

fn cmd_whois(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let nick = args[0].clone();
    if nick.eq_ignore_ascii_case(session.nick_or_star()) {
        let user = session.user.clone().unwrap_or_default();
        let host = session.host.clone();
        let realname = session.realname.clone().unwrap_or_default();
        session.reply(RPL_WHOISUSER, &[&nick, &user, &host, "*", &realname]);
        let server = session.server_name.clone();
        session.reply(RPL_WHOISSERVER, &[&nick, &server, "this gateway"]);
        if let Some(away) = session.away.clone() {
            session.reply(RPL_AWAY, &[&nick, &away]);
        }
    } else if nick.eq_ignore_ascii_case(&ctx.cfg.service_nick) {
        let server = session.server_name.clone();
        session.reply(RPL_WHOISUSER, &[&nick, &nick, &server, "*", "Gateway control service"]);
        session.reply(RPL_WHOISSERVER, &[&nick, &server, "this gateway"]);
    } else {
        session.reply(ERR_NOSUCHNICK, &[&nick, "No such nick"]);
    }
    session.reply(RPL_ENDOFWHOIS, &[&nick, "End of WHOIS"]);
    Vec::new()
}

fn cmd_whowas(session: &mut Session, _ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let nick = args[0].clone();
    session.reply(ERR_WASNOSUCHNICK, &[&nick, "There was no such nickname"]);
    session.reply(RPL_ENDOFWHOWAS, &[&nick, "End of WHOWAS"]);
    Vec::new()
}

// ---- server information ----

fn cmd_version(session: &mut Session, _ctx: &mut Ctx, _args: &[String]) -> Vec<Action> {
    let version = format!("gatewire-{}", env!("CARGO_PKG_VERSION"));
    let server = session.server_name.clone();
    session.reply(RPL_VERSION, &[&version, &server, ""]);
    Vec::new()
}

fn cmd_motd(session: &mut Session, ctx: &mut Ctx, _args: &[String]) -> Vec<Action> {
    session.motd(ctx);
    Vec::new()
}

fn names_reply(session: &mut Session, cfg: &Config, channel: &str) {
    let names = format!("@{} {}", cfg.service_nick, session.nick_or_star());
    session.reply(RPL_NAMREPLY, &["=", channel, &names]);
    session.reply(RPL_ENDOFNAMES, &[channel, "End of NAMES list"]);
}

fn cmd_names(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    match args.first() {
        Some(channel) => {
            let channel = channel.clone();
            names_reply(session, ctx.cfg, &channel);
        }
        None => {
            for channel in session.channels.clone() {
                names_reply(session, ctx.cfg, &channel);
            }
        }
    }
    Vec::new()
}

fn cmd_topic(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let channel = args[0].clone();
    if !session.channels.iter().any(|c| c.eq_ignore_ascii_case(&channel)) {
        session.reply(ERR_NOTONCHANNEL, &[&channel, "You're not on that channel"]);
        return Vec::new();
    }
    if args.len() > 1 {
        session.reply(ERR_CHANOPRIVSNEEDED, &[&channel, "Topic is fixed here"]);
        return Vec::new();
    }
    if channel.eq_ignore_ascii_case(&ctx.cfg.control_channel) {
        session.reply(RPL_TOPIC, &[&channel, "Gateway control channel"]);
    } else {
        session.reply(RPL_NOTOPIC, &[&channel, "No topic is set"]);
    }
    Vec::new()
}

// ---- channels ----

fn cmd_join(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    for channel in args[0].split(',') {
        if session.channels.iter().any(|c| c.eq_ignore_ascii_case(channel)) {
            continue;
        }
        if channel.eq_ignore_ascii_case(&ctx.cfg.control_channel) {
            let channel = channel.to_string();
            let service = ctx.cfg.service_nick.clone();
            session.join_channel(&channel, &service);
        } else if !channel.starts_with(['#', '&']) {
            session.reply(ERR_BADCHANNAME, &[channel, "Illegal channel name"]);
        } else {
            session.reply(ERR_NOSUCHCHANNEL, &[channel, "No such channel"]);
        }
    }
    Vec::new()
}

fn cmd_part(session: &mut Session, _ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let channel = args[0].clone();
    let Some(pos) = session
        .channels
        .iter()
        .position(|c| c.eq_ignore_ascii_case(&channel))
    else {
        session.reply(ERR_NOTONCHANNEL, &[&channel, "You're not on that channel"]);
        return Vec::new();
    };
    session.channels.remove(pos);
    let prefix = format!(":{}", session.prefix());
    session.write_argv(&[&prefix, "PART", &channel]);
    Vec::new()
}

fn cmd_invite(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    let nick = args[0].clone();
    let channel = args[1].clone();
    if !session.channels.iter().any(|c| c.eq_ignore_ascii_case(&channel)) {
        session.reply(ERR_NOTONCHANNEL, &[&channel, "You're not on that channel"]);
        return Vec::new();
    }
    if !known_nick(session, ctx.cfg, &nick) {
        session.reply(ERR_NOSUCHNICK, &[&nick, "No such nick"]);
        return Vec::new();
    }
    session.reply(RPL_INVITING, &[&nick, &channel]);
    Vec::new()
}

// ---- messaging ----

fn cmd_privmsg(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    message(session, ctx, args, true)
}

fn cmd_notice(session: &mut Session, ctx: &mut Ctx, args: &[String]) -> Vec<Action> {
    message(session, ctx, args, false)
}

fn message(session: &mut Session, ctx: &mut Ctx, args: &[String], wants_errors: bool) -> Vec<Action> {
    let target = args[0].clone();
    let Some(text) = args.get(1).filter(|t| !t.is_empty()) else {
        if wants_errors {
            session.reply(ERR_NOTEXTTOSEND, &["No text to send"]);
        }
        return Vec::new();
    };
    let to_service = target.eq_ignore_ascii_case(&ctx.cfg.service_nick)
        || target.eq_ignore_ascii_case(&ctx.cfg.control_channel);
    if to_service {
        let text = text.clone();
        return root::root_command(session, ctx, &text);
    }
    if wants_errors {
        session.reply(ERR_NOSUCHNICK, &[&target, "No such nick"]);
    }
    Vec::new()
}

// ---- coordinator-executed commands ----

fn cmd_rehash(session: &mut Session, ctx: &mut Ctx, _args: &[String]) -> Vec<Action> {
    let path = ctx
        .cfg
        .motd_file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".to_string());
    session.reply(RPL_REHASHING, &[&path, "Rehashing"]);
    vec![Action::Forward(vec!["rehash".to_string()])]
}

// TO_MASTER entries never reach their handler; dispatch forwards first.
fn cmd_master(_session: &mut Session, _ctx: &mut Ctx, _args: &[String]) -> Vec<Action> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryStore;
    use crate::line;

    struct Fixture {
        cfg: Config,
        store: MemoryStore,
        session: Session,
    }

    impl Fixture {
        fn new(cfg: Config) -> Self {
            let store = MemoryStore::new(cfg.accounts.clone());
            let session = Session::detached("gw.test".to_string());
            Self { cfg, store, session }
        }

        fn run(&mut self, raw: &str) -> Vec<Action> {
            let argv = line::parse(raw).unwrap();
            let mut ctx = Ctx {
                cfg: &self.cfg,
                store: &mut self.store,
            };
            dispatch(&mut self.session, &mut ctx, &argv)
        }

        fn login(&mut self) {
            self.run("NICK bob");
            self.run("USER bob 0 * :Bob");
            self.session.drain_output();
        }
    }

    #[test]
    fn nick_then_user_completes_registration() {
        let mut fx = Fixture::new(Config::default());
        let first = fx.run("NICK bob");
        assert!(!fx.session.status.contains(Status::LOGGED_IN));
        assert_eq!(
            first,
            vec![Action::Forward(vec!["nick".to_string(), "bob".to_string()])]
        );

        let actions = fx.run("USER bob 0 * :Bob the Builder");
        assert!(fx.session.status.contains(Status::LOGGED_IN));
        let client_announcements = actions
            .iter()
            .filter(|a| matches!(a, Action::Forward(argv) if argv[0] == "client"))
            .count();
        assert_eq!(client_announcements, 1);
    }

    #[test]
    fn precondition_order_puts_registration_before_params() {
        let mut fx = Fixture::new(Config::default());
        // OPER is post-login only and needs two arguments; the state error
        // must win.
        fx.run("OPER");
        assert!(fx.session.drain_output().contains("451"));

        fx.login();
        fx.run("OPER");
        assert!(fx.session.drain_output().contains("461"));
    }

    #[test]
    fn rename_clears_identified_and_announces() {
        let mut fx = Fixture::new(Config::default());
        fx.login();
        fx.session.status.insert(Status::IDENTIFIED);

        let actions = fx.run("NICK robert");
        assert!(!fx.session.status.contains(Status::IDENTIFIED));
        assert_eq!(fx.session.nick.as_deref(), Some("robert"));
        assert!(fx.session.drain_output().contains("NICK robert"));
        assert_eq!(
            actions,
            vec![Action::Forward(vec!["nick".to_string(), "robert".to_string()])]
        );
    }

    #[test]
    fn reregistration_is_rejected() {
        let mut fx = Fixture::new(Config::default());
        fx.login();
        fx.run("USER eve 0 * :Eve");
        assert!(fx.session.drain_output().contains("462"));
        assert_eq!(fx.session.user.as_deref(), Some("bob"));
    }

    #[test]
    fn unknown_commands_are_silent_before_login() {
        let mut fx = Fixture::new(Config::default());
        fx.run("BOGUS x y");
        assert!(!fx.session.has_output());

        fx.login();
        fx.run("BOGUS x y");
        assert!(fx.session.drain_output().contains("421"));
    }

    #[test]
    fn oper_only_commands_need_privileges() {
        let cfg = Config {
            oper_password: Some("opsecret".to_string()),
            ..Config::default()
        };
        let mut fx = Fixture::new(cfg);
        fx.login();

        fx.run("WALLOPS :hello all");
        assert!(fx.session.drain_output().contains("481"));

        fx.run("OPER bob wrong");
        assert!(fx.session.drain_output().contains("491"));
        assert!(!fx.session.is_oper());

        fx.run("OPER bob opsecret");
        let out = fx.session.drain_output();
        assert!(out.contains("381"));
        assert!(fx.session.is_oper());

        let actions = fx.run("WALLOPS :hello all");
        assert_eq!(
            actions,
            vec![Action::Forward(vec![
                "WALLOPS".to_string(),
                "hello all".to_string()
            ])]
        );
    }

    #[test]
    fn pass_checks_server_secret() {
        let cfg = Config {
            auth_password: Some("hunter2".to_string()),
            ..Config::default()
        };
        let mut fx = Fixture::new(cfg);
        fx.run("NICK bob");
        fx.run("USER bob 0 * :Bob");
        assert!(!fx.session.status.contains(Status::LOGGED_IN));

        fx.run("PASS wrong");
        assert!(fx.session.drain_output().contains("464"));

        fx.run("PASS hunter2");
        assert!(fx.session.status.contains(Status::LOGGED_IN));
    }

    #[test]
    fn pass_without_secret_is_stashed_and_replayed_as_identify() {
        let mut cfg = Config::default();
        cfg.accounts.insert("bob".to_string(), "sekrit".to_string());
        let mut fx = Fixture::new(cfg);
        fx.run("PASS sekrit");
        fx.run("NICK bob");
        let actions = fx.run("USER bob 0 * :Bob");
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, Action::IdentifyRequest { nick, password }
                    if nick == "bob" && password == "sekrit"))
        );
    }

    #[test]
    fn quit_shuts_the_session_down() {
        let mut fx = Fixture::new(Config::default());
        fx.login();
        let actions = fx.run("QUIT :bye");
        assert_eq!(actions, vec![Action::Close]);
        assert!(fx.session.status.contains(Status::SHUTDOWN));
    }

    #[test]
    fn mode_query_and_away_toggle() {
        let mut fx = Fixture::new(Config::default());
        fx.login();

        fx.run("MODE bob");
        assert!(fx.session.drain_output().contains("221"));

        fx.run("AWAY :out for lunch");
        assert!(fx.session.drain_output().contains("306"));
        assert_eq!(fx.session.away.as_deref(), Some("out for lunch"));

        fx.run("AWAY");
        assert!(fx.session.drain_output().contains("305"));
        assert!(fx.session.away.is_none());
    }

    #[test]
    fn privmsg_routes_to_the_control_service() {
        let mut fx = Fixture::new(Config::default());
        fx.login();
        fx.run("PRIVMSG root :help");
        let out = fx.session.drain_output();
        assert!(out.contains("NOTICE") || out.contains("PRIVMSG"));

        fx.run("PRIVMSG unknown :hi");
        assert!(fx.session.drain_output().contains("401"));

        fx.run("PRIVMSG root");
        assert!(fx.session.drain_output().contains("412"));
    }

    #[test]
    fn join_and_part_manage_membership() {
        let mut fx = Fixture::new(Config::default());
        fx.login();
        fx.run("PART &gateway");
        assert!(fx.session.drain_output().contains("PART &gateway"));
        assert!(fx.session.channels.is_empty());

        fx.run("JOIN &gateway");
        let out = fx.session.drain_output();
        assert!(out.contains("JOIN &gateway"));
        assert!(out.contains("353"));

        fx.run("JOIN #elsewhere");
        assert!(fx.session.drain_output().contains("403"));
    }
}
