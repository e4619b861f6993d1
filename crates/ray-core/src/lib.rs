pub mod channel;
pub mod commands;
pub mod errors;
pub mod events;
pub mod session;
pub mod turn;

pub use channel::{RemoteChannel, StopAck, StopRequest};
pub use commands::{BatchExecutionResult, CommandError, CommandExecutionResult, CommandHandler};
pub use errors::ChannelError;
pub use events::UiEvent;
pub use session::{ChatId, ProjectId, SessionContext, SessionHandle, TaskId, UserId};
pub use turn::{AgentTurn, CommandCall, CommandResultPayload, OutboundTurn, ResultStatus, TurnStatus};
