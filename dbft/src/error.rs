use crate::config::ConfigError;

/// Error type returned by host callbacks.
pub type HostError = Box<dyn std::error::Error + Send + Sync>;

/// Conditions that stop the engine. Everything else (peer misbehaviour,
/// missing transactions, insufficient pre-commit data) is logged and absorbed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("host returned no validators for height {height}")]
    NoValidators { height: u32 },

    #[error("failed to process accepted block at height {height}: {source}")]
    BlockProcessing {
        height: u32,
        #[source]
        source: HostError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NoValidators { height: 3 };
        assert_eq!(err.to_string(), "host returned no validators for height 3");

        let err = Error::BlockProcessing {
            height: 8,
            source: "state root mismatch".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to process accepted block at height 8: state root mismatch"
        );

        let err = Error::from(ConfigError::InvalidTimePerBlock);
        assert_eq!(err.to_string(), "time_per_block must be > 0");
    }
}
