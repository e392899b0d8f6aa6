use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandType {
    RemoteStart,
    RemoteStop,
}

impl CommandType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemoteStart => "RemoteStart",
            Self::RemoteStop => "RemoteStop",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RemoteStart" => Some(Self::RemoteStart),
            "RemoteStop" => Some(Self::RemoteStop),
            _ => None,
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// pending -> sent -> accepted|rejected, accepted -> completed.
/// `completed` and `rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Accepted,
    Rejected,
    Completed,
}

impl CommandStatus {
    pub const OPEN: [CommandStatus; 3] = [Self::Pending, Self::Sent, Self::Accepted];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }

    /// A completion event from the station may overtake the dispatch
    /// acknowledgement, so any open status may move straight to `completed`.
    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Sent) => true,
            (Self::Sent, Self::Accepted | Self::Rejected) => true,
            (from, Self::Completed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// SQL list literal of the open statuses, e.g. `('pending','sent','accepted')`.
    pub fn open_sql_list() -> String {
        let quoted: Vec<String> = Self::OPEN
            .iter()
            .map(|status| format!("'{}'", status.as_str()))
            .collect();
        format!("({})", quoted.join(","))
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of trying to take an open command for completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired,
    AlreadyHandled,
}

pub fn remote_start_key(charge_box_id: &str, id_tag: &str, connector_id: Option<i64>) -> String {
    format!(
        "{}|cb:{charge_box_id}|tag:{id_tag}|conn:{}",
        CommandType::RemoteStart,
        connector_id.unwrap_or(0)
    )
}

pub fn remote_stop_key(transaction_id: i64) -> String {
    format!("{}|tx:{transaction_id}", CommandType::RemoteStop)
}

#[cfg(test)]
mod tests {
    use super::{CommandStatus, remote_start_key, remote_stop_key};

    #[test]
    fn follows_dispatch_lifecycle() {
        assert!(CommandStatus::Pending.can_transition_to(CommandStatus::Sent));
        assert!(CommandStatus::Sent.can_transition_to(CommandStatus::Accepted));
        assert!(CommandStatus::Sent.can_transition_to(CommandStatus::Rejected));
        assert!(CommandStatus::Accepted.can_transition_to(CommandStatus::Completed));
        assert!(CommandStatus::Sent.can_transition_to(CommandStatus::Completed));
    }

    #[test]
    fn terminal_statuses_do_not_move() {
        for next in [
            CommandStatus::Pending,
            CommandStatus::Sent,
            CommandStatus::Accepted,
            CommandStatus::Rejected,
            CommandStatus::Completed,
        ] {
            assert!(!CommandStatus::Completed.can_transition_to(next));
            assert!(!CommandStatus::Rejected.can_transition_to(next));
        }
    }

    #[test]
    fn acknowledgement_requires_sent() {
        assert!(!CommandStatus::Pending.can_transition_to(CommandStatus::Accepted));
        assert!(!CommandStatus::Accepted.can_transition_to(CommandStatus::Rejected));
    }

    #[test]
    fn missing_connector_shares_key_with_connector_zero() {
        assert_eq!(
            remote_start_key("CB-01", "TAG", None),
            remote_start_key("CB-01", "TAG", Some(0))
        );
        assert_ne!(
            remote_start_key("CB-01", "TAG", None),
            remote_start_key("CB-01", "TAG", Some(1))
        );
        assert_eq!(remote_stop_key(42), "RemoteStop|tx:42");
    }

    #[test]
    fn open_list_matches_non_terminal_statuses() {
        assert_eq!(
            CommandStatus::open_sql_list(),
            "('pending','sent','accepted')"
        );
    }
}
