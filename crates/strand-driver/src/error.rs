use ash::vk;

/// Failure creating or submitting native objects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("device lost")]
    DeviceLost,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("native API error {code}: {message}")]
    Native { code: i32, message: String },
}

impl From<vk::Result> for BackendError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED | vk::Result::ERROR_FEATURE_NOT_PRESENT => {
                Self::Unsupported(format!("{:?}", result))
            }
            other => Self::Native {
                code: other.as_raw(),
                message: format!("{:?}", other),
            },
        }
    }
}

/// Failure acquiring a presentable image. Expected and transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("swap chain is out of date")]
    OutOfDate,

    #[error("timed out waiting for a presentable image")]
    Timeout,

    #[error("surface lost")]
    SurfaceLost,
}

/// Errors surfaced to the engine's client.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("device lost")]
    DeviceLost,

    #[error("backend failed to start: {0}")]
    Startup(#[from] BackendError),

    #[error("execution thread terminated")]
    ExecutionThreadGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
