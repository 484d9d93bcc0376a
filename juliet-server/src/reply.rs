//! Numeric replies.

use std::fmt;

/// Numeric reply codes sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Reply {
    Welcome = 1,
    YourHost = 2,
    Created = 3,
    MyInfo = 4,
    UModeIs = 221,
    Away = 301,
    UnAway = 305,
    NowAway = 306,
    EndOfWho = 315,
    ChannelModeIs = 324,
    NoTopic = 331,
    Topic = 332,
    WhoReply = 352,
    NamReply = 353,
    EndOfNames = 366,
    Motd = 372,
    MotdStart = 375,
    EndOfMotd = 376,
    ErrNoSuchNick = 401,
    ErrNoSuchChannel = 403,
    ErrCannotSendToChan = 404,
    ErrNoOrigin = 409,
    ErrNoRecipient = 411,
    ErrNoTextToSend = 412,
    ErrUnknownCommand = 421,
    ErrNoMotd = 422,
    ErrNoNicknameGiven = 431,
    ErrErroneousNickname = 432,
    ErrNicknameInUse = 433,
    ErrNotOnChannel = 442,
    ErrNotRegistered = 451,
    ErrNeedMoreParams = 461,
    ErrAlreadyRegistered = 462,
    ErrPasswordMismatch = 464,
    ErrBadChannelKey = 475,
    ErrBadChannelMask = 476,
}

impl Reply {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn is_error(self) -> bool {
        self.code() >= 400
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.code())
    }
}

/// Formats `:{server} {code} {target} {params}`.
///
/// `target` is the client's nickname, or `*` before one is set.
pub fn format_reply(server: &str, reply: Reply, target: &str, params: &str) -> String {
    format!(":{} {} {} {}", server, reply, target, params)
}
