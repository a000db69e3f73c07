use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    /// The plug could not be reached or returned an unusable reply.
    #[error("device read failed: {0}")]
    DeviceRead(String),
    #[error("cannot compute the mean of an empty window")]
    EmptyWindow,
    #[error("sink write failed: {0}")]
    SinkWrite(String),
}

impl Error {
    pub fn device_read(err: anyhow::Error) -> Self {
        Error::DeviceRead(format!("{:#}", err))
    }

    pub fn sink_write(err: anyhow::Error) -> Self {
        Error::SinkWrite(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
