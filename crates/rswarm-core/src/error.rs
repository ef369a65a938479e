use serde::Serialize;

/// Errors produced by the worker runtime.
///
/// Mirrors the error-kind taxonomy the runtime is built around: transient
/// transport failures are recoverable, `TransportFatal` is not, and
/// `Config` is always fatal at startup (see [`crate::config::WorkerConfig::validate`]).
#[derive(Debug, thiserror::Error)]
pub enum RswarmError {
    /// A single send/recv failure expected to recover on the next cycle.
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport socket was closed unexpectedly; not recoverable.
    #[error("fatal transport error: {0}")]
    TransportFatal(String),

    /// A decode failure or other malformed-message condition.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration; refuse to start.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Serialize for RswarmError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display() {
        let err = RswarmError::Transport("send would block".to_string());
        assert_eq!(err.to_string(), "transport error: send would block");
    }

    #[test]
    fn transport_fatal_error_display() {
        let err = RswarmError::TransportFatal("socket closed".to_string());
        assert_eq!(err.to_string(), "fatal transport error: socket closed");
    }

    #[test]
    fn protocol_error_display() {
        let err = RswarmError::Protocol("unknown message type".to_string());
        assert_eq!(err.to_string(), "protocol error: unknown message type");
    }

    #[test]
    fn config_error_display() {
        let err = RswarmError::Config("master_port must be nonzero".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: master_port must be nonzero"
        );
    }

    #[test]
    fn io_error_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RswarmError = io_err.into();
        let msg = err.to_string();
        assert!(msg.contains("IO error"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn serde_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: RswarmError = json_err.into();
        assert!(err.to_string().contains("serialization error"));
    }

    #[test]
    fn serialize_produces_string() {
        let err = RswarmError::Config("test error".to_string());
        let json = serde_json::to_string(&err).expect("serialize should succeed");
        assert_eq!(json, "\"configuration error: test error\"");
    }

    #[test]
    fn error_is_debug() {
        let err = RswarmError::Config("test".to_string());
        let debug = format!("{:?}", err);
        assert!(debug.contains("Config"));
    }
}
