use thiserror::Error;

/// Failure of a single provider call. Cancellation is not represented here: a cancelled stream
/// simply ends.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Missing credential or invalid options, detected before any network I/O.
    #[error("{provider} is not configured: {message}")]
    Configuration { provider: String, message: String },

    /// The provider rejected the credential.
    #[error("{provider} rejected the credentials (HTTP {status}): {body}")]
    Auth {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} transport error: {message}")]
    Transport {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("{provider} sent a malformed stream payload: {message}")]
    MalformedResponse { provider: String, message: String },
}

impl LlmError {
    pub fn configuration(provider: &str, message: impl Into<String>) -> Self {
        LlmError::Configuration {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn transport(provider: &str, message: impl Into<String>) -> Self {
        LlmError::Transport {
            provider: provider.to_string(),
            message: message.into(),
            status: None,
        }
    }

    pub fn malformed(provider: &str, message: impl Into<String>) -> Self {
        LlmError::MalformedResponse {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn from_status(provider: &str, status: u16, body: String) -> Self {
        if status == 401 || status == 403 {
            LlmError::Auth {
                provider: provider.to_string(),
                status,
                body,
            }
        } else {
            LlmError::Transport {
                provider: provider.to_string(),
                message: format!("HTTP {}: {}", status, body),
                status: Some(status),
            }
        }
    }

    /// Whether opening the stream again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transport { status: None, .. } => true,
            LlmError::Transport {
                status: Some(code), ..
            } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_distinct_kinds() {
        assert!(matches!(
            LlmError::from_status("openai", 401, String::new()),
            LlmError::Auth { status: 401, .. }
        ));
        assert!(matches!(
            LlmError::from_status("openai", 503, String::new()),
            LlmError::Transport {
                status: Some(503),
                ..
            }
        ));
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(LlmError::transport("groq", "connection reset").is_retryable());
        assert!(LlmError::from_status("groq", 429, String::new()).is_retryable());
        assert!(LlmError::from_status("groq", 502, String::new()).is_retryable());
        assert!(!LlmError::from_status("groq", 400, String::new()).is_retryable());
        assert!(!LlmError::from_status("groq", 403, String::new()).is_retryable());
        assert!(!LlmError::configuration("groq", "no key").is_retryable());
        assert!(!LlmError::malformed("groq", "garbage").is_retryable());
    }
}
