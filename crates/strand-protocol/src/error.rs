#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("inconsistent pixel layout: {0}")]
    InconsistentLayout(String),

    #[error("row alignment must be a non-zero power of two, got {0}")]
    InvalidAlignment(u8),

    #[error("pixel buffer too small: {required} bytes required, {actual} supplied")]
    BufferTooSmall { required: usize, actual: usize },
}
