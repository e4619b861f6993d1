use ray_core::ChannelError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("run stopped")]
    Stopped,

    #[error("max turn hops exceeded: {0}")]
    MaxHopsExceeded(u32),
}
