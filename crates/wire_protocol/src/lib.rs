// PBX wire protocol: parsing client command lines, serializing server
// notification lines.
//
// Can be used outside of libpbx, e.g. to write clients.

const CMD_PICKUP: &str = "pickup";
const CMD_HANGUP: &str = "hangup";
const CMD_DIAL: &str = "dial";
const CMD_CHAT: &str = "chat";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("empty command line")]
    Empty,
    #[error("unknown command")]
    UnknownCommand,
}

/// One client request. Requests arrive one per CRLF-terminated line; the
/// keywords are case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pickup,
    Hangup,
    /// `dial <ext>`. A missing or malformed extension parses to `None`,
    /// which the switch treats like a vacant extension.
    Dial(Option<u16>),
    /// `chat [<text>]` where text is everything after the single space
    /// following the keyword. May be empty.
    Chat(String),
}

impl Command {
    /// Parses a complete input line. Trailing CR/LF is tolerated so callers
    /// can hand over lines straight from a buffered reader.
    pub fn parse(line: &str) -> Result<Command, CommandParseError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return Err(CommandParseError::Empty);
        }
        match line {
            CMD_PICKUP => return Ok(Command::Pickup),
            CMD_HANGUP => return Ok(Command::Hangup),
            CMD_DIAL => return Ok(Command::Dial(None)),
            CMD_CHAT => return Ok(Command::Chat(String::new())),
            _ => {}
        }
        if let Some(arg) = line.strip_prefix(CMD_DIAL).and_then(|r| r.strip_prefix(' ')) {
            return Ok(Command::Dial(arg.parse().ok()));
        }
        if let Some(text) = line.strip_prefix(CMD_CHAT).and_then(|r| r.strip_prefix(' ')) {
            return Ok(Command::Chat(text.to_owned()));
        }
        Err(CommandParseError::UnknownCommand)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum NotificationParseError {
    #[error("empty notification line")]
    Empty,
    #[error("bad extension number")]
    BadExtension,
    #[error("unknown notification")]
    UnknownNotification,
}

/// One server-to-client line, LF-terminated on the wire. All but `Chat` are
/// state notifications; `Chat` carries a peer's chat payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    OnHook(u16),
    Ringing,
    DialTone,
    RingBack,
    BusySignal,
    Connected(u16),
    Error,
    Chat(String),
}

impl Notification {
    /// Appends the full wire line, including the trailing newline.
    pub fn serialize(&self, buf: &mut String) {
        use std::fmt::Write;
        // Writing to a String cannot fail.
        let _ = match self {
            Notification::OnHook(ext) => writeln!(buf, "ON HOOK {ext}"),
            Notification::Ringing => writeln!(buf, "RINGING"),
            Notification::DialTone => writeln!(buf, "DIAL TONE"),
            Notification::RingBack => writeln!(buf, "RING BACK"),
            Notification::BusySignal => writeln!(buf, "BUSY SIGNAL"),
            Notification::Connected(ext) => writeln!(buf, "CONNECTED {ext}"),
            Notification::Error => writeln!(buf, "ERROR"),
            Notification::Chat(text) => writeln!(buf, "CHAT {text}"),
        };
    }

    /// Parses a line as written by [`Notification::serialize`], without the
    /// newline. The inverse direction is what clients (and the tests) use.
    pub fn parse(line: &str) -> Result<Notification, NotificationParseError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return Err(NotificationParseError::Empty);
        }
        let parse_ext = |arg: &str| {
            arg.parse::<u16>()
                .map_err(|_| NotificationParseError::BadExtension)
        };
        match line {
            "RINGING" => return Ok(Notification::Ringing),
            "DIAL TONE" => return Ok(Notification::DialTone),
            "RING BACK" => return Ok(Notification::RingBack),
            "BUSY SIGNAL" => return Ok(Notification::BusySignal),
            "ERROR" => return Ok(Notification::Error),
            "CHAT" => return Ok(Notification::Chat(String::new())),
            _ => {}
        }
        if let Some(arg) = line.strip_prefix("ON HOOK ") {
            return Ok(Notification::OnHook(parse_ext(arg)?));
        }
        if let Some(arg) = line.strip_prefix("CONNECTED ") {
            return Ok(Notification::Connected(parse_ext(arg)?));
        }
        if let Some(text) = line.strip_prefix("CHAT ") {
            return Ok(Notification::Chat(text.to_owned()));
        }
        Err(NotificationParseError::UnknownNotification)
    }
}
