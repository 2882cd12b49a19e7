//! Server error/info code table.
//!
//! Error and info frames carry a numeric `code`. [`classify`] maps each known
//! code to a [`CodeAction`]: either a lifecycle command to run, or a signal
//! that is recoverable (log and keep going) or fatal (stop the client).

use serde_json::Value;

use crate::command::Command;

/// Conditions the server can report through an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSignal {
    InvalidEvent,
    InvalidPair,
    InvalidBookPrecision,
    InvalidBookLength,
    AuthFailed,
    SubscriptionFailed,
    AlreadySubscribed,
    InvalidChannel,
    ChannelLimit,
    UnsubscribeFailed,
    NotSubscribed,
}

/// Outcome of looking a code up in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeAction {
    /// Run a lifecycle command.
    Action(Command),
    /// Log and continue.
    Recoverable(ServerSignal),
    /// Client and server disagree on the protocol; stop.
    Fatal(ServerSignal),
}

pub const RECONNECT_REQUESTED: u32 = 20051;
pub const MAINTENANCE_START: u32 = 20060;
pub const MAINTENANCE_END: u32 = 20061;

/// Look up a server code.
///
/// Returns `None` for codes the table does not know.
pub fn classify(code: u32) -> Option<CodeAction> {
    use CodeAction::*;
    use ServerSignal::*;

    let action = match code {
        RECONNECT_REQUESTED => Action(Command::Restart { soft: true }),
        MAINTENANCE_START => Action(Command::Pause),
        MAINTENANCE_END => Action(Command::Unpause),
        10000 => Fatal(InvalidEvent),
        10001 => Recoverable(InvalidPair),
        10011 => Recoverable(InvalidBookPrecision),
        10012 => Recoverable(InvalidBookLength),
        10100 => Recoverable(AuthFailed),
        10300 => Recoverable(SubscriptionFailed),
        10301 => Recoverable(AlreadySubscribed),
        10302 => Recoverable(InvalidChannel),
        10305 => Recoverable(ChannelLimit),
        10400 => Recoverable(UnsubscribeFailed),
        10401 => Recoverable(NotSubscribed),
        _ => return None,
    };
    Some(action)
}

/// Read a code that may be encoded as a JSON number or a numeric string.
pub fn parse_code(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => n.as_u64().and_then(|c| u32::try_from(c).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_codes_map_to_commands() {
        assert_eq!(classify(20051), Some(CodeAction::Action(Command::Restart { soft: true })));
        assert_eq!(classify(20060), Some(CodeAction::Action(Command::Pause)));
        assert_eq!(classify(20061), Some(CodeAction::Action(Command::Unpause)));
    }

    #[test]
    fn invalid_event_is_the_only_fatal_signal() {
        assert_eq!(classify(10000), Some(CodeAction::Fatal(ServerSignal::InvalidEvent)));
        for code in [10001, 10011, 10012, 10100, 10300, 10301, 10302, 10305, 10400, 10401] {
            assert!(matches!(classify(code), Some(CodeAction::Recoverable(_))), "code {code}");
        }
    }

    #[test]
    fn unknown_code_is_none() {
        assert_eq!(classify(99999), None);
    }

    #[test]
    fn parses_number_and_string_codes() {
        assert_eq!(parse_code(&json!(10301)), Some(10301));
        assert_eq!(parse_code(&json!("99999")), Some(99999));
        assert_eq!(parse_code(&json!("abc")), None);
        assert_eq!(parse_code(&json!(null)), None);
    }
}
