//! Error taxonomy for the retrieval and orchestration core.
//!
//! Component-local failures (one index down, reflection or clarification
//! model unavailable) are degraded in place by the component that hit them.
//! Only failures that leave a run without usable SQL reach the caller, and
//! even then they are folded into a well-formed response by
//! [`crate::service`].
//!
//! Application edges (config loading, CLI, server startup) use `anyhow`.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Text2SqlError {
    /// Startup/build time problem: empty corpus, missing setting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An index was queried before `build` completed.
    #[error("{0} index queried before it was built")]
    NotReady(&'static str),

    /// A single index failed at query time.
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// The model answered, but nothing in the answer looks like SQL.
    #[error("no SQL statement found in model output")]
    Generation { raw: String },

    /// The execution collaborator could not be reached.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Rendered with `Duration`'s debug form, so `250ms` stays `250ms`.
    #[error("{operation} timed out after {limit:?}")]
    Timeout { operation: String, limit: Duration },

    /// Transport or protocol failure talking to a model endpoint.
    #[error("model call failed: {0}")]
    Model(String),
}

impl Text2SqlError {
    /// Whether the orchestrator may spend another iteration after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Text2SqlError::Retrieval(_)
                | Text2SqlError::Generation { .. }
                | Text2SqlError::Timeout { .. }
                | Text2SqlError::Model(_)
        )
    }

    /// Raw model text attached to a [`Text2SqlError::Generation`].
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            Text2SqlError::Generation { raw } => Some(raw),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Text2SqlError>;

/// Run `fut` with a deadline, mapping expiry to [`Text2SqlError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(Text2SqlError::Timeout {
            operation: operation.to_string(),
            limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let v = with_timeout("noop", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let err = with_timeout("sleepy call", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Text2SqlError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Text2SqlError::Timeout { .. }));
        assert!(err.to_string().contains("sleepy call timed out"));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_sub_second_timeout_message_keeps_millis() {
        let err = with_timeout("clarification", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Text2SqlError>(())
        })
        .await
        .unwrap_err();
        let msg = err.to_string();
        assert_eq!(msg, "clarification timed out after 50ms");
        assert!(!msg.contains("0s"));

        let whole = Text2SqlError::Timeout {
            operation: "sql generation".into(),
            limit: Duration::from_secs(30),
        };
        assert_eq!(whole.to_string(), "sql generation timed out after 30s");
    }

    #[test]
    fn test_generation_error_keeps_raw_text() {
        let err = Text2SqlError::Generation {
            raw: "I cannot help".to_string(),
        };
        assert_eq!(err.raw_output(), Some("I cannot help"));
        assert!(!Text2SqlError::Execution("down".into()).is_recoverable());
    }
}
