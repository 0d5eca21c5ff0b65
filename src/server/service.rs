use std::fmt::{Debug, Formatter};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::message::{Command, MessageCode, ResultShape, ResultWord};
use crate::status::BtStatus;

/// Identifies one client connection of a [Server](crate::server::Server) for its lifetime
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ClientId(pub u64);

impl Debug for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// What the service sends back for a command: the `result` word, and optionally the command
///  with its output fields filled in, which replaces the reply's payload
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandReply {
    pub result: ResultWord,
    pub payload: Option<Command>,
}

impl CommandReply {
    pub fn status(status: BtStatus) -> CommandReply {
        CommandReply {
            result: ResultWord::from_status(status),
            payload: None,
        }
    }

    pub fn success() -> CommandReply {
        CommandReply::status(BtStatus::Success)
    }

    pub fn value(value: u64) -> CommandReply {
        CommandReply {
            result: ResultWord::from_u64(value),
            payload: None,
        }
    }

    /// a successful reply that returns data in the payload
    pub fn with_payload(command: Command) -> CommandReply {
        CommandReply {
            result: ResultWord::from_status(BtStatus::Success),
            payload: Some(command),
        }
    }

    /// The failure reply for a command, in the shape its caller expects: the status itself,
    ///  or `0` for commands that return a value
    pub fn reject(command: &Command, status: BtStatus) -> CommandReply {
        CommandReply::reject_code(command.code(), status)
    }

    /// [CommandReply::reject] for a command that is known only by its code
    pub fn reject_code(code: MessageCode, status: BtStatus) -> CommandReply {
        match ResultShape::of(code) {
            ResultShape::Status => CommandReply::status(status),
            ResultShape::Value => CommandReply::value(0),
        }
    }

    pub fn is_success_for(&self, command: &Command) -> bool {
        match command.result_shape() {
            ResultShape::Status => self.result.status().is_success(),
            ResultShape::Value => self.result.as_u64() != 0,
        }
    }
}

/// A profile's implementation on the service side. Commands of one connection are handled one
///  at a time and in order; commands of different connections may be handled concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProfileService: Send + Sync + 'static {
    async fn on_command(&self, client: ClientId, command: Command) -> CommandReply;

    /// The connection is gone. Registrations of this client were already removed.
    async fn on_client_closed(&self, client: ClientId);
}
