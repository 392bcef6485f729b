/// Result alias that carries the custom [`LedWallError`] type.
pub type Result<T> = std::result::Result<T, LedWallError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum LedWallError {
    /// A stage, device or canvas was described with values that cannot produce
    /// a valid render target or addressing table (zero sizes, empty rectangles).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Render target storage could not be allocated.
    #[error("resource allocation failed: {0}")]
    ResourceAllocation(String),
    /// The image program failed to compile.
    #[error("program build failed at offset {position}: {message}")]
    ProgramBuild { position: usize, message: String },
    /// Handing a frame to a device transport failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The render thread has stopped and no longer accepts requests.
    #[error("renderer has shut down")]
    Shutdown,
    /// Free-form message for failures without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around configuration parse errors.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl LedWallError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn invalid<T: Into<String>>(msg: T) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub(crate) fn build<T: Into<String>>(position: usize, msg: T) -> Self {
        Self::ProgramBuild {
            position,
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_pick_their_variant() {
        assert!(matches!(LedWallError::msg("x"), LedWallError::Message(_)));
        assert!(matches!(
            LedWallError::invalid("zero width"),
            LedWallError::InvalidConfiguration(_)
        ));
        let err = LedWallError::build(7, "unexpected `)`");
        assert_eq!(err.to_string(), "program build failed at offset 7: unexpected `)`");
    }
}
