//! Control-service commands
//!
//! Text sent to the service nick (or into the control channel) lands here
//! instead of being relayed anywhere. The service answers in kind, as
//! channel messages after login and notices before.

use crate::auth::RegisterError;
use crate::command::{Action, Ctx};
use crate::session::{PendingSecret, Session, Takeover};

/// Split a service-command line into words, honoring double quotes
pub fn tokenize(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in text.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Run one line of service-directed text
pub fn root_command(session: &mut Session, ctx: &mut Ctx, text: &str) -> Vec<Action> {
    let words = tokenize(text);
    let Some(cmd) = words.first().map(|w| w.to_ascii_lowercase()) else {
        return Vec::new();
    };

    // A pending takeover question eats yes/no answers before anything else.
    if matches!(session.takeover, Takeover::Offered { .. }) {
        match cmd.as_str() {
            "yes" => return vec![Action::TakeoverAnswer(true)],
            "no" => return vec![Action::TakeoverAnswer(false)],
            _ => {}
        }
    }

    match cmd.as_str() {
        "help" => {
            service_msg(
                session,
                ctx,
                "Commands: \x02help\x02, \x02identify\x02 [password], \
                 \x02register\x02 [password]. Without the password argument \
                 you will be asked to send it via OPER, which clients do \
                 not echo.",
            );
            Vec::new()
        }
        "identify" => identify(session, ctx, words.get(1).map(String::as_str)),
        "register" => register(session, ctx, words.get(1).map(String::as_str)),
        _ => {
            service_msg(
                session,
                ctx,
                &format!("Unknown command: {cmd}. Try \x02help\x02."),
            );
            Vec::new()
        }
    }
}

/// Check the client's password against the account store.
///
/// With `None`, arm a one-shot OPER prompt instead of reading the secret
/// from channel text. On success the decision between a plain identify and
/// a takeover offer belongs to the coordinator, so this only emits the
/// request.
pub fn identify(session: &mut Session, ctx: &mut Ctx, password: Option<&str>) -> Vec<Action> {
    let Some(password) = password else {
        session.pending_secret = Some(PendingSecret::Identify);
        service_msg(
            session,
            ctx,
            "Send your password with \x02/OPER anything <password>\x02; it will not be echoed.",
        );
        return Vec::new();
    };
    let nick = session.nick_or_star().to_string();
    if !ctx.store.exists(&nick) {
        service_msg(
            session,
            ctx,
            &format!("The nick {nick} is not registered. Use \x02register\x02 to claim it."),
        );
        return Vec::new();
    }
    if !ctx.store.verify(&nick, password) {
        service_msg(session, ctx, "Incorrect password.");
        return Vec::new();
    }
    vec![Action::IdentifyRequest {
        nick,
        password: password.to_string(),
    }]
}

/// Create an account for the current nick
pub fn register(session: &mut Session, ctx: &mut Ctx, password: Option<&str>) -> Vec<Action> {
    let Some(password) = password else {
        session.pending_secret = Some(PendingSecret::Register);
        service_msg(
            session,
            ctx,
            "Send the new password with \x02/OPER anything <password>\x02; it will not be echoed.",
        );
        return Vec::new();
    };
    let nick = session.nick_or_star().to_string();
    match ctx.store.register(&nick, password) {
        Ok(()) => {
            let service = ctx.cfg.service_nick.clone();
            let channel = ctx.cfg.control_channel.clone();
            service_msg(session, ctx, &format!("Account {nick} created."));
            session.complete_identify(&service, &channel, password)
        }
        Err(RegisterError::NickTaken) => {
            service_msg(
                session,
                ctx,
                &format!("The nick {nick} is already registered. Use \x02identify\x02 instead."),
            );
            Vec::new()
        }
        Err(RegisterError::BadPassword) => {
            service_msg(session, ctx, "That password is not acceptable.");
            Vec::new()
        }
    }
}

fn service_msg(session: &mut Session, ctx: &Ctx, text: &str) {
    let service = ctx.cfg.service_nick.clone();
    let channel = ctx.cfg.control_channel.clone();
    session.usermsg(&service, &channel, text);
}
