//! Server error types.
//!
//! Client-facing variants render as the parameter text of their numeric
//! reply, so `format_reply(server, e.reply()?, nick, &e.to_string())` yields
//! the full line.

use crate::reply::Reply;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] juliet_protocol::ProtocolError),

    #[error("{0} :No such nick/channel")]
    NoSuchNick(String),

    #[error("{0} :No such channel")]
    NoSuchChannel(String),

    #[error("{0} :Cannot send to channel")]
    CannotSendToChan(String),

    #[error(":No origin specified")]
    NoOrigin,

    #[error(":No recipient given ({0})")]
    NoRecipient(String),

    #[error(":No text to send")]
    NoTextToSend,

    #[error("{0} :Unknown command")]
    UnknownCommand(String),

    #[error(":MOTD File is missing")]
    NoMotd,

    #[error(":No nickname given")]
    NoNicknameGiven,

    #[error("{0} :Erroneous nickname")]
    ErroneousNickname(String),

    #[error("{0} :Nickname is already in use")]
    NicknameInUse(String),

    #[error("{0} :You're not on that channel")]
    NotOnChannel(String),

    #[error(":You have not registered")]
    NotRegistered,

    #[error("{0} :Not enough parameters")]
    NeedMoreParams(String),

    #[error(":You may not reregister")]
    AlreadyRegistered,

    #[error(":Password incorrect")]
    PasswordMismatch,

    #[error("{0} :Cannot join channel (+k)")]
    BadChannelKey(String),

    #[error("{0} :Bad channel mask")]
    BadChannelMask(String),

    #[error("session closed")]
    SessionClosed,

    #[error("link closed by server: {0}")]
    LinkClosed(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Numeric reply for errors that are reported to the client.
    pub fn reply(&self) -> Option<Reply> {
        let reply = match self {
            ServerError::Io(_)
            | ServerError::Protocol(_)
            | ServerError::SessionClosed
            | ServerError::LinkClosed(_)
            | ServerError::ShuttingDown => return None,
            ServerError::NoSuchNick(_) => Reply::ErrNoSuchNick,
            ServerError::NoSuchChannel(_) => Reply::ErrNoSuchChannel,
            ServerError::CannotSendToChan(_) => Reply::ErrCannotSendToChan,
            ServerError::NoOrigin => Reply::ErrNoOrigin,
            ServerError::NoRecipient(_) => Reply::ErrNoRecipient,
            ServerError::NoTextToSend => Reply::ErrNoTextToSend,
            ServerError::UnknownCommand(_) => Reply::ErrUnknownCommand,
            ServerError::NoMotd => Reply::ErrNoMotd,
            ServerError::NoNicknameGiven => Reply::ErrNoNicknameGiven,
            ServerError::ErroneousNickname(_) => Reply::ErrErroneousNickname,
            ServerError::NicknameInUse(_) => Reply::ErrNicknameInUse,
            ServerError::NotOnChannel(_) => Reply::ErrNotOnChannel,
            ServerError::NotRegistered => Reply::ErrNotRegistered,
            ServerError::NeedMoreParams(_) => Reply::ErrNeedMoreParams,
            ServerError::AlreadyRegistered => Reply::ErrAlreadyRegistered,
            ServerError::PasswordMismatch => Reply::ErrPasswordMismatch,
            ServerError::BadChannelKey(_) => Reply::ErrBadChannelKey,
            ServerError::BadChannelMask(_) => Reply::ErrBadChannelMask,
        };
        Some(reply)
    }

    /// Returns whether the connection must be closed after reporting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServerError::Io(_)
                | ServerError::PasswordMismatch
                | ServerError::LinkClosed(_)
                | ServerError::ShuttingDown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::format_reply;

    #[test]
    fn test_reply_line() {
        let err = ServerError::NicknameInUse("bob".to_string());
        let line = format_reply("irc.local", err.reply().unwrap(), "*", &err.to_string());
        assert_eq!(line, ":irc.local 433 * bob :Nickname is already in use");
    }

    #[test]
    fn test_internal_errors_have_no_reply() {
        let err = ServerError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(err.reply().is_none());
        assert!(err.is_fatal());
        assert!(ServerError::ShuttingDown.reply().is_none());
        assert!(ServerError::SessionClosed.reply().is_none());
        assert!(!ServerError::SessionClosed.is_fatal());
    }

    #[test]
    fn test_fatal() {
        assert!(ServerError::PasswordMismatch.is_fatal());
        assert!(ServerError::LinkClosed("killed".into()).is_fatal());
        assert!(ServerError::LinkClosed("killed".into()).reply().is_none());
        assert!(!ServerError::NoTextToSend.is_fatal());
        assert_eq!(
            ServerError::NeedMoreParams("JOIN".into()).reply(),
            Some(Reply::ErrNeedMoreParams)
        );
    }
}
