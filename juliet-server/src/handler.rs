//! Command handlers.

use crate::auth::PasswordValidator;
use crate::channel::is_valid_channel_name;
use crate::error::ServerError;
use crate::line::Line;
use crate::registry::Registry;
use crate::reply::{format_reply, Reply};
use crate::session::Session;
use chrono::{DateTime, Utc};
use juliet_protocol::Message;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Longest accepted nickname.
pub const MAX_NICKNAME: usize = 30;

/// Returns whether `nick` is a valid nickname.
pub fn is_valid_nickname(nick: &str) -> bool {
    let Some(first) = nick.chars().next() else {
        return false;
    };
    nick.len() <= MAX_NICKNAME
        && !first.is_ascii_digit()
        && first != '-'
        && nick
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "|`\\_{}[]-".contains(c))
}

fn is_channel_target(target: &str) -> bool {
    target.starts_with('#') || target.starts_with('&')
}

/// Server identity shown to clients.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub created: DateTime<Utc>,
    pub motd: Option<String>,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created: Utc::now(),
            motd: None,
        }
    }

    pub fn with_motd(mut self, motd: Option<String>) -> Self {
        self.motd = motd;
        self
    }
}

/// Command handler.
pub struct CommandHandler {
    info: ServerInfo,
    registry: Arc<Registry>,
    /// Required connection password.
    password: Option<PasswordValidator>,
    /// Channel messages bound for the radio link.
    uplink: Option<mpsc::UnboundedSender<Message>>,
    /// Sender id for uplinked messages. Falls back to the nickname.
    callsign: Option<String>,
}

impl CommandHandler {
    /// Creates a new command handler.
    pub fn new(info: ServerInfo, registry: Arc<Registry>) -> Self {
        Self {
            info,
            registry,
            password: None,
            uplink: None,
            callsign: None,
        }
    }

    /// Requires clients to send PASS with `password`.
    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(PasswordValidator::new(password));
        self
    }

    /// Relays channel traffic to `uplink`.
    pub fn with_uplink(mut self, uplink: mpsc::UnboundedSender<Message>) -> Self {
        self.uplink = Some(uplink);
        self
    }

    pub fn with_callsign(mut self, callsign: Option<String>) -> Self {
        self.callsign = callsign;
        self
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn requires_registration(command: &str) -> bool {
        !matches!(
            command,
            "NICK" | "USER" | "PASS" | "CAP" | "PING" | "PONG" | "QUIT"
        )
    }

    /// Handles one raw line from `session`, reporting errors to it.
    ///
    /// Lines arriving after the session closed are ignored.
    pub fn handle_line(&self, session: &Arc<Session>, text: &str) {
        if session.is_closed() {
            debug!("[{}] ignoring line after close", session.remote_addr);
            return;
        }
        let Some(line) = Line::parse(text) else {
            return;
        };
        debug!("[{}] << {}", session.remote_addr, text);

        if let Err(e) = self.handle(session, &line) {
            // NOTICE must never trigger automatic replies.
            if line.command != "NOTICE" || e.is_fatal() {
                self.report(session, &e);
            }
            if e.is_fatal() {
                warn!("[{}] closing session: {}", session.remote_addr, e);
                session.send("ERROR :Closing link");
                self.registry.disconnect(session, &e.to_string());
            }
        }
    }

    /// Handles a parsed command.
    pub fn handle(&self, session: &Arc<Session>, line: &Line) -> Result<(), ServerError> {
        if Self::requires_registration(&line.command) && !session.is_registered() {
            return Err(ServerError::NotRegistered);
        }

        match line.command.as_str() {
            "NICK" => self.handle_nick(session, line),
            "USER" => self.handle_user(session, line),
            "PASS" => self.handle_pass(session, line),
            "CAP" => Ok(()),
            "AWAY" => self.handle_away(session, line),
            "MOTD" => {
                self.send_motd(session);
                Ok(())
            }
            "PING" => self.handle_ping(session, line),
            "PONG" => {
                session.touch();
                Ok(())
            }
            "JOIN" => self.handle_join(session, line),
            "PART" => self.handle_part(session, line),
            "TOPIC" => self.handle_topic(session, line),
            "MODE" => self.handle_mode(session, line),
            "PRIVMSG" => self.handle_message(session, line, false),
            "NOTICE" => self.handle_message(session, line, true),
            "WHO" => self.handle_who(session, line),
            "QUIT" => {
                self.quit(session, line.arg(0).unwrap_or("Client quit"));
                Ok(())
            }
            other => Err(ServerError::UnknownCommand(other.to_string())),
        }
    }

    fn reply(&self, session: &Session, reply: Reply, params: &str) {
        session.send(format_reply(&self.info.name, reply, &session.target(), params));
    }

    fn report(&self, session: &Session, error: &ServerError) {
        if let Some(reply) = error.reply() {
            self.reply(session, reply, &error.to_string());
        }
    }

    fn handle_nick(&self, session: &Arc<Session>, line: &Line) -> Result<(), ServerError> {
        let nick = line
            .arg(0)
            .filter(|n| !n.is_empty())
            .ok_or(ServerError::NoNicknameGiven)?;
        if !is_valid_nickname(nick) {
            return Err(ServerError::ErroneousNickname(nick.to_string()));
        }

        let old_prefix = session.prefix();
        let previous = self.registry.claim_nickname(session, nick)?;

        if session.is_registered() {
            if previous.as_deref() != Some(nick) {
                info!("[{}] {} is now known as {}", session.remote_addr, old_prefix, nick);
                let line = format!(":{} NICK :{}", old_prefix, nick);
                session.send(line.as_str());
                self.notify_peers(session, &line);
            }
            return Ok(());
        }

        self.try_register(session)
    }

    fn handle_user(&self, session: &Arc<Session>, line: &Line) -> Result<(), ServerError> {
        if session.is_registered() || session.username().is_some() {
            return Err(ServerError::AlreadyRegistered);
        }
        let username = line
            .params
            .first()
            .map(String::as_str)
            .or(line.remarks.as_deref())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ServerError::NeedMoreParams("USER".to_string()))?;
        let realname = line.remarks.as_deref().or(line.arg(3));

        session.set_user(username, realname);
        self.try_register(session)
    }

    fn handle_pass(&self, session: &Session, line: &Line) -> Result<(), ServerError> {
        if session.is_registered() {
            return Err(ServerError::AlreadyRegistered);
        }
        let password = line
            .arg(0)
            .ok_or_else(|| ServerError::NeedMoreParams("PASS".to_string()))?;
        session.set_password(password);
        Ok(())
    }

    fn try_register(&self, session: &Session) -> Result<(), ServerError> {
        if !session.ready_to_register() {
            return Ok(());
        }

        if let Some(validator) = &self.password {
            let attempt = session.password().unwrap_or_default();
            if !validator.validate(&attempt) {
                return Err(ServerError::PasswordMismatch);
            }
        }

        if session.complete_registration() {
            self.send_welcome(session);
        }
        Ok(())
    }

    fn send_welcome(&self, session: &Session) {
        let nick = session.target();
        let user = session.username().unwrap_or_default();
        info!("[{}] registered {} ({})", session.remote_addr, nick, user);

        self.reply(
            session,
            Reply::Welcome,
            &format!(
                ":Welcome to the mesh IRC network {} -- {}@{}",
                nick,
                user,
                session.host()
            ),
        );
        self.reply(
            session,
            Reply::YourHost,
            &format!(
                ":Your host is {}, running juliet-{}",
                self.info.name, self.info.version
            ),
        );
        self.reply(
            session,
            Reply::Created,
            &format!(
                ":This server was created {}",
                self.info.created.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        );
        self.reply(
            session,
            Reply::MyInfo,
            &format!("{} juliet-{} o o", self.info.name, self.info.version),
        );
        self.send_motd(session);
    }

    fn send_motd(&self, session: &Session) {
        let Some(motd) = self.info.motd.as_deref().map(str::trim) else {
            self.report(session, &ServerError::NoMotd);
            return;
        };

        self.reply(
            session,
            Reply::MotdStart,
            &format!(":- {} Message of the day -", self.info.name),
        );
        for text in motd.lines() {
            self.reply(session, Reply::Motd, &format!(":- {}", text));
        }
        self.reply(session, Reply::EndOfMotd, ":End of /MOTD command.");
    }

    fn handle_away(&self, session: &Session, line: &Line) -> Result<(), ServerError> {
        match line.arg(0).filter(|a| !a.is_empty()) {
            Some(text) => {
                session.set_away(Some(text));
                self.reply(session, Reply::NowAway, ":You have been marked as being away");
            }
            None => {
                session.set_away(None);
                self.reply(
                    session,
                    Reply::UnAway,
                    ":You are no longer marked as being away",
                );
            }
        }
        Ok(())
    }

    fn handle_ping(&self, session: &Session, line: &Line) -> Result<(), ServerError> {
        let token = line
            .arg(0)
            .filter(|t| !t.is_empty())
            .ok_or(ServerError::NoOrigin)?;
        session.send(format!(
            ":{0} PONG {0} :{1}",
            self.info.name, token
        ));
        Ok(())
    }

    fn handle_join(&self, session: &Arc<Session>, line: &Line) -> Result<(), ServerError> {
        let names = line
            .arg(0)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ServerError::NeedMoreParams("JOIN".to_string()))?;
        let keys: Vec<&str> = line.arg(1).map(|k| k.split(',').collect()).unwrap_or_default();

        for (i, name) in names.split(',').enumerate() {
            let key = keys.get(i).copied().filter(|k| !k.is_empty());
            if let Err(e) = self.join_one(session, name, key) {
                self.report(session, &e);
            }
        }
        Ok(())
    }

    fn join_one(
        &self,
        session: &Arc<Session>,
        name: &str,
        key: Option<&str>,
    ) -> Result<(), ServerError> {
        if !is_valid_channel_name(name) {
            return Err(ServerError::BadChannelMask(name.to_string()));
        }

        let joined = self.registry.join_channel(name, key, session)?;
        if !joined.added {
            return Ok(());
        }
        let channel = joined.channel;
        if joined.created {
            debug!("channel {} created", channel.name());
        }

        channel.broadcast(&format!(":{} JOIN {}", session.prefix(), channel.name()));
        self.send_topic(session, channel.name(), channel.topic());
        self.send_names(session, channel.name(), &channel.nicknames());
        Ok(())
    }

    fn send_topic(&self, session: &Session, channel: &str, topic: Option<String>) {
        match topic {
            Some(topic) => self.reply(session, Reply::Topic, &format!("{} :{}", channel, topic)),
            None => self.reply(session, Reply::NoTopic, &format!("{} :No topic is set", channel)),
        }
    }

    fn send_names(&self, session: &Session, channel: &str, nicks: &[String]) {
        self.reply(
            session,
            Reply::NamReply,
            &format!("= {} :{}", channel, nicks.join(" ")),
        );
        self.reply(
            session,
            Reply::EndOfNames,
            &format!("{} :End of /NAMES list.", channel),
        );
    }

    fn handle_part(&self, session: &Arc<Session>, line: &Line) -> Result<(), ServerError> {
        let names = line
            .params
            .first()
            .ok_or_else(|| ServerError::NeedMoreParams("PART".to_string()))?;
        let reason = line.remarks.as_deref().or(line.arg(1));

        for name in names.split(',') {
            let result = self
                .registry
                .channel(name)
                .ok_or_else(|| ServerError::NoSuchChannel(name.to_string()))
                .and_then(|channel| {
                    if !channel.contains(&session.id) {
                        return Err(ServerError::NotOnChannel(channel.name().to_string()));
                    }
                    let part = match reason {
                        Some(reason) => {
                            format!(":{} PART {} :{}", session.prefix(), channel.name(), reason)
                        }
                        None => format!(":{} PART {}", session.prefix(), channel.name()),
                    };
                    channel.broadcast(&part);
                    self.registry.leave_channel(&channel, session);
                    Ok(())
                });
            if let Err(e) = result {
                self.report(session, &e);
            }
        }
        Ok(())
    }

    fn handle_topic(&self, session: &Session, line: &Line) -> Result<(), ServerError> {
        let name = line
            .params
            .first()
            .ok_or_else(|| ServerError::NeedMoreParams("TOPIC".to_string()))?;
        let channel = self
            .registry
            .channel(name)
            .ok_or_else(|| ServerError::NoSuchChannel(name.to_string()))?;
        if !channel.contains(&session.id) {
            return Err(ServerError::NotOnChannel(channel.name().to_string()));
        }

        match line.arg(1) {
            Some(topic) => {
                channel.set_topic(topic);
                channel.broadcast(&format!(
                    ":{} TOPIC {} :{}",
                    session.prefix(),
                    channel.name(),
                    topic
                ));
            }
            None => self.send_topic(session, channel.name(), channel.topic()),
        }
        Ok(())
    }

    fn handle_mode(&self, session: &Session, line: &Line) -> Result<(), ServerError> {
        let target = line
            .arg(0)
            .ok_or_else(|| ServerError::NeedMoreParams("MODE".to_string()))?;

        if is_channel_target(target) {
            let channel = self
                .registry
                .channel(target)
                .ok_or_else(|| ServerError::NoSuchChannel(target.to_string()))?;
            let modes = if channel.has_key() { "+k" } else { "+" };
            self.reply(
                session,
                Reply::ChannelModeIs,
                &format!("{} {}", channel.name(), modes),
            );
        } else {
            self.registry
                .find_by_nick(target)
                .ok_or_else(|| ServerError::NoSuchNick(target.to_string()))?;
            self.reply(session, Reply::UModeIs, "+");
        }
        Ok(())
    }

    fn handle_message(
        &self,
        session: &Session,
        line: &Line,
        notice: bool,
    ) -> Result<(), ServerError> {
        let command = if notice { "NOTICE" } else { "PRIVMSG" };
        let target = line
            .params
            .first()
            .ok_or_else(|| ServerError::NoRecipient(command.to_string()))?;
        let text = line
            .arg(1)
            .filter(|t| !t.is_empty())
            .ok_or(ServerError::NoTextToSend)?;

        if is_channel_target(target) {
            let channel = self
                .registry
                .channel(target)
                .ok_or_else(|| ServerError::NoSuchChannel(target.to_string()))?;
            if !channel.contains(&session.id) {
                return Err(ServerError::CannotSendToChan(channel.name().to_string()));
            }

            let out = format!(":{} {} {} :{}", session.prefix(), command, channel.name(), text);
            channel.notify(session, &out, false);
            self.relay(session, channel.name(), text);
        } else {
            let recipient = self
                .registry
                .find_by_nick(target)
                .ok_or_else(|| ServerError::NoSuchNick(target.to_string()))?;

            let nick = recipient.target();
            recipient.send(format!(":{} {} {} :{}", session.prefix(), command, nick, text));
            if !notice {
                if let Some(away) = recipient.away() {
                    self.reply(session, Reply::Away, &format!("{} :{}", nick, away));
                }
            }
        }
        Ok(())
    }

    /// Queues channel text for the radio link.
    fn relay(&self, session: &Session, channel: &str, text: &str) {
        let Some(uplink) = &self.uplink else {
            return;
        };
        let sender = self
            .callsign
            .clone()
            .unwrap_or_else(|| session.target());
        let message = Message::channel(channel, text).with_sender(sender);
        if uplink.send(message).is_err() {
            debug!("radio uplink closed, dropping message for {}", channel);
        }
    }

    fn handle_who(&self, session: &Session, line: &Line) -> Result<(), ServerError> {
        let mask = line.arg(0).filter(|m| !m.is_empty()).unwrap_or("*");

        let entries = if is_channel_target(mask) {
            match self.registry.channel(mask) {
                Some(channel) => {
                    let name = channel.name().to_string();
                    channel.members().into_iter().map(|m| (name.clone(), m)).collect()
                }
                None => Vec::new(),
            }
        } else {
            self.registry
                .find_by_nick(mask)
                .map(|m| vec![("*".to_string(), m)])
                .unwrap_or_default()
        };

        for (channel, member) in entries {
            let status = if member.away().is_some() { "G" } else { "H" };
            self.reply(
                session,
                Reply::WhoReply,
                &format!(
                    "{} {} {} {} {} {} :0 {}",
                    channel,
                    member.username().unwrap_or_default(),
                    member.host(),
                    self.info.name,
                    member.target(),
                    status,
                    member.realname().unwrap_or_default()
                ),
            );
        }
        self.reply(session, Reply::EndOfWho, &format!("{} :End of /WHO list.", mask));
        Ok(())
    }

    /// Ends the session at the client's request.
    pub fn quit(&self, session: &Session, reason: &str) {
        info!("[{}] {} quit: {}", session.remote_addr, session.target(), reason);
        session.send("ERROR :Closing link");
        self.registry.disconnect(session, reason);
    }

    /// Sends `line` once to every session sharing a channel with `session`.
    fn notify_peers(&self, session: &Session, line: &str) {
        let mut seen = HashSet::new();
        for name in session.channels() {
            if let Some(channel) = self.registry.channel(&name) {
                for member in channel.members() {
                    if member.id != session.id && seen.insert(member.id) {
                        member.send(line);
                    }
                }
            }
        }
    }
}
