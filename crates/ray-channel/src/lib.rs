mod client;
mod mock;

pub use client::{ChannelConfig, HttpRemoteChannel};
pub use mock::{MockChannel, MockReply};
