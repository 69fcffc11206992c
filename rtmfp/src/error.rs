/// The error kinds of the transport. They travel inside `anyhow::Error` and can be recovered
///  with `downcast_ref::<RtmfpError>()` where a caller needs to distinguish them.
#[derive(Debug, thiserror::Error)]
pub enum RtmfpError {
    /// malformed numeric or text field
    #[error("malformed data: {0}")]
    Formatting(String),
    /// checksum or decryption failure - the packet is dropped without further effect
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl RtmfpError {
    pub fn formatting(reason: impl Into<String>) -> anyhow::Error {
        RtmfpError::Formatting(reason.into()).into()
    }

    pub fn crypto(reason: impl Into<String>) -> anyhow::Error {
        RtmfpError::Crypto(reason.into()).into()
    }

    pub fn network(reason: impl Into<String>) -> anyhow::Error {
        RtmfpError::Network(reason.into()).into()
    }

    pub fn protocol(reason: impl Into<String>) -> anyhow::Error {
        RtmfpError::Protocol(reason.into()).into()
    }

    /// Returns the transport error kind wrapped in an `anyhow::Error`, if any
    pub fn of(e: &anyhow::Error) -> Option<&RtmfpError> {
        e.downcast_ref::<RtmfpError>()
    }
}
