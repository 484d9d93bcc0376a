//! Client mode.
//!
//! Instead of serving chat clients, juliet can log in to an existing chat
//! server as a bot and relay between the channels it joins and the radio.
//! Channel text from other users goes to the uplink; radio traffic is posted
//! to the matching channel as `<sender> text`.

use crate::bridge::{chat_lines, is_echo, route, UNKNOWN_SENDER};
use crate::config::ClientConfig;
use crate::error::ServerError;
use crate::handler::is_valid_nickname;
use crate::line::{Line, LineBuffer};
use crate::server::Server;
use juliet_protocol::message::sanitize_sender;
use juliet_protocol::Message;
use std::collections::HashSet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Relay bot for one chat server connection.
pub struct RelayClient {
    config: ClientConfig,
    nickname: String,
    callsign: Option<String>,
    relay_channel: String,
    /// Lower-cased names of the channels we are in.
    joined: HashSet<String>,
    welcomed: bool,
}

impl RelayClient {
    pub fn new(config: ClientConfig, relay_channel: impl Into<String>) -> Self {
        Self {
            nickname: config.nickname.clone(),
            config,
            callsign: None,
            relay_channel: relay_channel.into(),
            joined: HashSet::new(),
            welcomed: false,
        }
    }

    /// Sender id stamped on uplinked frames. Radio frames carrying it are
    /// not posted back to the channels.
    pub fn with_callsign(mut self, callsign: Option<&str>) -> Self {
        self.callsign = callsign.and_then(sanitize_sender);
        self
    }

    /// Current nickname, which may differ from the configured one after a
    /// collision.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn is_welcomed(&self) -> bool {
        self.welcomed
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.joined.contains(&channel.to_ascii_lowercase())
    }

    /// Lines that open the session.
    pub fn registration(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(3);
        if let Some(password) = &self.config.password {
            lines.push(format!("PASS {}", password));
        }
        lines.push(format!("NICK {}", self.nickname));
        lines.push(format!(
            "USER {} 0 * :{}",
            self.config.nickname, self.config.fullname
        ));
        lines
    }

    fn is_me(&self, prefix: Option<&str>) -> bool {
        prefix
            .and_then(|p| p.split('!').next())
            .is_some_and(|nick| nick.eq_ignore_ascii_case(&self.nickname))
    }

    /// Handles one line from the server.
    ///
    /// Lines to send back are pushed onto `replies`. Returns the radio
    /// message to uplink, if the line carried one. A KILL or ERROR from the
    /// server ends the link with [`ServerError::LinkClosed`].
    pub fn handle_line(
        &mut self,
        line: &Line,
        replies: &mut Vec<String>,
    ) -> Result<Option<Message>, ServerError> {
        match line.command.as_str() {
            "001" => {
                info!("Registered as {}", self.nickname);
                self.welcomed = true;
                for channel in &self.config.channels {
                    match &channel.key {
                        Some(key) => replies.push(format!("JOIN {} {}", channel.name, key)),
                        None => replies.push(format!("JOIN {}", channel.name)),
                    }
                }
            }
            "433" if !self.welcomed => {
                let next = format!("{}_", self.nickname);
                if !is_valid_nickname(&next) {
                    return Err(ServerError::LinkClosed(format!(
                        "no free nickname after {}",
                        self.nickname
                    )));
                }
                warn!("Nickname {} in use, trying {}", self.nickname, next);
                self.nickname = next;
                replies.push(format!("NICK {}", self.nickname));
            }
            "PING" => {
                let token = line.arg(0).unwrap_or(&self.nickname);
                replies.push(format!("PONG :{}", token));
            }
            "JOIN" if self.is_me(line.prefix.as_deref()) => {
                if let Some(channel) = line.arg(0) {
                    info!("Joined {}", channel);
                    self.joined.insert(channel.to_ascii_lowercase());
                }
            }
            "PART" if self.is_me(line.prefix.as_deref()) => {
                if let Some(channel) = line.arg(0) {
                    info!("Left {}", channel);
                    self.joined.remove(&channel.to_ascii_lowercase());
                }
            }
            "KICK" => {
                if let (Some(channel), Some(nick)) = (line.arg(0), line.arg(1)) {
                    if nick.eq_ignore_ascii_case(&self.nickname) {
                        warn!("Kicked from {}: {}", channel, line.arg(2).unwrap_or(""));
                        self.joined.remove(&channel.to_ascii_lowercase());
                    }
                }
            }
            "NICK" if self.is_me(line.prefix.as_deref()) => {
                if let Some(nick) = line.arg(0) {
                    self.nickname = nick.to_string();
                }
            }
            "PRIVMSG" => return Ok(self.uplink_message(line)),
            "KILL" => {
                let reason = line.remarks.clone().unwrap_or_else(|| "killed".to_string());
                return Err(ServerError::LinkClosed(reason));
            }
            "ERROR" => {
                let reason = line.arg(0).unwrap_or("closing link").to_string();
                return Err(ServerError::LinkClosed(reason));
            }
            _ => {}
        }
        Ok(None)
    }

    fn uplink_message(&self, line: &Line) -> Option<Message> {
        let (target, text) = (line.arg(0)?, line.arg(1)?);
        let nick = line.prefix.as_deref()?.split('!').next()?;
        if nick.eq_ignore_ascii_case(&self.nickname) {
            return None;
        }
        if !self.is_joined(target) {
            debug!("ignoring PRIVMSG to {} from {}", target, nick);
            return None;
        }

        let sender = self.callsign.as_deref().unwrap_or(nick);
        Some(Message::channel(target, text).with_sender(sender))
    }

    /// Renders a radio message as PRIVMSG lines for a channel we are in.
    pub fn render(&self, message: &Message) -> Vec<String> {
        if is_echo(message, self.callsign.as_deref()) {
            return Vec::new();
        }
        let (target, text) = route(message, &self.relay_channel);
        if !self.is_joined(target) {
            debug!("not in {}, dropping radio {} message", target, message.kind().name());
            return Vec::new();
        }

        let sender = message.sender().unwrap_or(UNKNOWN_SENDER);
        chat_lines(&text)
            .map(|line| format!("PRIVMSG {} :<{}> {}", target, sender, line))
            .collect()
    }

    /// Connects to the configured server and relays until the link drops or
    /// `shutdown` fires.
    pub async fn run(
        self,
        uplink: mpsc::UnboundedSender<Message>,
        downlink: mpsc::UnboundedReceiver<Message>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        info!(
            "Connecting to {}:{} as {}",
            self.config.host, self.config.port, self.nickname
        );
        let stream =
            TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        self.relay(stream, uplink, downlink, shutdown).await
    }

    /// Relays over an established connection.
    pub async fn relay(
        mut self,
        mut stream: TcpStream,
        uplink: mpsc::UnboundedSender<Message>,
        mut downlink: mpsc::UnboundedReceiver<Message>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        for line in self.registration() {
            Server::write_line(&mut stream, &line).await?;
        }

        let mut lines = LineBuffer::new();
        let mut buf = [0u8; 4096];
        let mut replies = Vec::new();

        loop {
            tokio::select! {
                biased;

                Some(message) = downlink.recv() => {
                    for line in self.render(&message) {
                        debug!(">> {}", line);
                        Server::write_line(&mut stream, &line).await?;
                    }
                }

                result = stream.read(&mut buf) => {
                    let n = result?;
                    if n == 0 {
                        info!("Connection closed by server");
                        return Ok(());
                    }
                    lines.extend(&buf[..n]);
                    while let Some(text) = lines.next_line() {
                        debug!("<< {}", text);
                        let Some(line) = Line::parse(&text) else {
                            warn!("invalid line from server: {}", text);
                            continue;
                        };
                        let outcome = self.handle_line(&line, &mut replies);
                        for reply in replies.drain(..) {
                            Server::write_line(&mut stream, &reply).await?;
                        }
                        if let Some(message) = outcome? {
                            if uplink.send(message).is_err() {
                                debug!("radio uplink closed, dropping channel message");
                            }
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("Leaving server");
                    Server::write_line(&mut stream, "QUIT :Shutting down").await?;
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientChannel;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, Lines};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::TcpListener;

    fn config(channels: &[(&str, Option<&str>)]) -> ClientConfig {
        ClientConfig {
            channels: channels
                .iter()
                .map(|(name, key)| ClientChannel {
                    name: name.to_string(),
                    key: key.map(str::to_string),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn feed(client: &mut RelayClient, text: &str) -> (Vec<String>, Option<Message>) {
        let mut replies = Vec::new();
        let line = Line::parse(text).unwrap();
        let message = client.handle_line(&line, &mut replies).unwrap();
        (replies, message)
    }

    #[test]
    fn test_registration_lines() {
        let client = RelayClient::new(config(&[]), "#radio");
        assert_eq!(
            client.registration(),
            vec!["NICK juliet", "USER juliet 0 * :Juliet Radio Bot"]
        );

        let mut cfg = config(&[]);
        cfg.password = Some("letmein".to_string());
        let client = RelayClient::new(cfg, "#radio");
        assert_eq!(client.registration()[0], "PASS letmein");
    }

    #[test]
    fn test_welcome_joins_channels() {
        let channels = [("#mesh", Some("k3y")), ("#radio", None)];
        let mut client = RelayClient::new(config(&channels), "#radio");
        let (replies, _) = feed(&mut client, ":irc.test 001 juliet :Welcome");
        assert!(client.is_welcomed());
        assert_eq!(replies, vec!["JOIN #mesh k3y", "JOIN #radio"]);

        assert!(!client.is_joined("#mesh"));
        feed(&mut client, ":juliet!bot@host JOIN #Mesh");
        assert!(client.is_joined("#mesh"));

        feed(&mut client, ":someone!x@host KICK #mesh juliet :bye");
        assert!(!client.is_joined("#mesh"));
    }

    #[test]
    fn test_nickname_collision() {
        let mut client = RelayClient::new(config(&[]), "#radio");
        let (replies, _) = feed(&mut client, ":irc.test 433 * juliet :Nickname is already in use");
        assert_eq!(replies, vec!["NICK juliet_"]);
        assert_eq!(client.nickname(), "juliet_");

        feed(&mut client, ":irc.test 001 juliet_ :Welcome");
        let (replies, _) = feed(&mut client, ":irc.test 433 juliet_ other :in use");
        assert!(replies.is_empty());

        let mut cfg = config(&[]);
        cfg.nickname = "n".repeat(30);
        let mut client = RelayClient::new(cfg, "#radio");
        let line = Line::parse(":irc.test 433 * nnn :in use").unwrap();
        assert!(matches!(
            client.handle_line(&line, &mut Vec::new()),
            Err(ServerError::LinkClosed(_))
        ));
    }

    #[test]
    fn test_ping_answered() {
        let mut client = RelayClient::new(config(&[]), "#radio");
        let (replies, _) = feed(&mut client, "PING :irc.test");
        assert_eq!(replies, vec!["PONG :irc.test"]);
    }

    #[test]
    fn test_channel_text_uplinked() {
        let mut client = RelayClient::new(config(&[("#mesh", None)]), "#radio");
        feed(&mut client, ":juliet!bot@host JOIN #mesh");

        let (_, message) = feed(&mut client, ":alice!a@host PRIVMSG #mesh :hello radio");
        let message = message.unwrap();
        assert_eq!(message.channel_name(), Some("#mesh"));
        assert_eq!(message.content(), "hello radio");
        assert_eq!(message.sender(), Some("alice"));

        // Own lines, private messages and unjoined channels stay local.
        assert!(feed(&mut client, ":juliet!bot@host PRIVMSG #mesh :echo").1.is_none());
        assert!(feed(&mut client, ":alice!a@host PRIVMSG juliet :psst").1.is_none());
        assert!(feed(&mut client, ":alice!a@host PRIVMSG #other :hi").1.is_none());
    }

    #[test]
    fn test_callsign_used_and_echo_skipped() {
        let mut client =
            RelayClient::new(config(&[("#mesh", None)]), "#radio").with_callsign(Some("N0CALL"));
        feed(&mut client, ":juliet!bot@host JOIN #mesh");

        let (_, message) = feed(&mut client, ":alice!a@host PRIVMSG #mesh :hi");
        assert_eq!(message.unwrap().sender(), Some("N0CALL"));

        let echo = Message::channel("#mesh", "hi").with_sender("N0CALL");
        assert!(client.render(&echo).is_empty());
    }

    #[test]
    fn test_render_radio_message() {
        let mut client = RelayClient::new(config(&[("#mesh", None)]), "#radio");
        feed(&mut client, ":juliet!bot@host JOIN #mesh");

        let msg = Message::channel("#mesh", "line one\nline two").with_sender("KD0ABC");
        assert_eq!(
            client.render(&msg),
            vec!["PRIVMSG #mesh :<KD0ABC> line one", "PRIVMSG #mesh :<KD0ABC> line two"]
        );

        // Relay channel not joined.
        assert!(client.render(&Message::text("plain")).is_empty());
    }

    #[test]
    fn test_kill_and_error_end_link() {
        let mut client = RelayClient::new(config(&[]), "#radio");
        let mut replies = Vec::new();

        let kill = Line::parse(":oper!o@host KILL juliet :go away").unwrap();
        assert!(matches!(
            client.handle_line(&kill, &mut replies),
            Err(ServerError::LinkClosed(reason)) if reason == "go away"
        ));

        let error = Line::parse("ERROR :Closing link").unwrap();
        assert!(matches!(
            client.handle_line(&error, &mut replies),
            Err(ServerError::LinkClosed(_))
        ));
    }

    async fn next(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> String {
        tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_relay_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut cfg = config(&[("#mesh", None)]);
        cfg.host = "127.0.0.1".to_string();
        cfg.port = addr.port();
        let client = RelayClient::new(cfg, "#radio").with_callsign(Some("N0CALL"));

        let (up_tx, mut up_rx) = mpsc::unbounded_channel();
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let task = tokio::spawn(client.run(up_tx, down_rx, stop_rx));

        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        assert_eq!(next(&mut lines).await, "NICK juliet");
        assert_eq!(next(&mut lines).await, "USER juliet 0 * :Juliet Radio Bot");

        write.write_all(b":irc.test 001 juliet :Welcome\r\n").await.unwrap();
        assert_eq!(next(&mut lines).await, "JOIN #mesh");

        write
            .write_all(
                b":juliet!bot@host JOIN #mesh\r\n\
                  :alice!a@host PRIVMSG #mesh :hello radio\r\n\
                  PING :irc.test\r\n",
            )
            .await
            .unwrap();
        assert_eq!(next(&mut lines).await, "PONG :irc.test");

        let uplinked = up_rx.recv().await.unwrap();
        assert_eq!(uplinked.channel_name(), Some("#mesh"));
        assert_eq!(uplinked.content(), "hello radio");
        assert_eq!(uplinked.sender(), Some("N0CALL"));

        down_tx
            .send(Message::channel("#mesh", "hi from afar").with_sender("KD0ABC"))
            .unwrap();
        assert_eq!(next(&mut lines).await, "PRIVMSG #mesh :<KD0ABC> hi from afar");

        stop_tx.send(()).unwrap();
        assert_eq!(next(&mut lines).await, "QUIT :Shutting down");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_ends_on_kill() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut cfg = config(&[]);
        cfg.host = "127.0.0.1".to_string();
        cfg.port = addr.port();

        let (up_tx, _up_rx) = mpsc::unbounded_channel();
        let (_down_tx, down_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = broadcast::channel(1);
        let task = tokio::spawn(RelayClient::new(cfg, "#radio").run(up_tx, down_rx, stop_rx));

        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(b":oper!o@host KILL juliet :maintenance\r\n")
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ServerError::LinkClosed(reason)) if reason == "maintenance"));
    }
}
