//! Unified error handling for the proxy core
//!
//! A single error type covers parsing, transport, resource and call-state
//! failures so that handler code can propagate with `?` and map the result
//! onto a SIP status code at the edge.

use std::error::Error as StdError;
use std::fmt;

/// Unified error type for proxy operations
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Parsing errors (SIP message, headers, SDP)
    ParseError {
        message: String,
        position: Option<(usize, usize)>, // (line, column)
        context: Option<String>,
    },

    /// Network and transport errors
    TransportError {
        endpoint: String,
        reason: String,
        recoverable: bool,
    },

    /// Resource exhaustion (RTP ports, concurrent calls)
    ResourceError {
        resource_type: ResourceType,
        current_usage: u64,
        limit: u64,
    },

    /// Call-state and forwarding errors
    StateError {
        operation: String,
        reason: String,
        context: Option<String>,
    },

    /// Digest verification failed or credentials missing; answered with a
    /// 401 challenge rather than treated as a fault
    AuthFailed { username: String },

    /// No active binding for the target AOR
    NoRoute { aor: String },

    /// Next hop resolves back to this server with no alternative
    LoopDetected { target: String },

    /// Max-Forwards reached zero before this hop
    MaxForwardsExceeded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceType {
    RtpPorts,
    ConcurrentCalls,
    Memory,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::ParseError {
                message,
                position,
                context,
            } => {
                write!(f, "Parse error: {}", message)?;
                if let Some((line, col)) = position {
                    write!(f, " at {}:{}", line, col)?;
                }
                if let Some(ctx) = context {
                    write!(f, " ({})", ctx)?;
                }
                Ok(())
            }
            RelayError::TransportError {
                endpoint,
                reason,
                recoverable,
            } => {
                write!(
                    f,
                    "Transport error to {}: {} (recoverable: {})",
                    endpoint, reason, recoverable
                )
            }
            RelayError::ResourceError {
                resource_type,
                current_usage,
                limit,
            } => {
                write!(
                    f,
                    "Resource exhaustion: {:?} usage {} exceeds limit {}",
                    resource_type, current_usage, limit
                )
            }
            RelayError::StateError {
                operation,
                reason,
                context,
            } => {
                write!(f, "State error: {} failed - {}", operation, reason)?;
                if let Some(ctx) = context {
                    write!(f, " ({})", ctx)?;
                }
                Ok(())
            }
            RelayError::AuthFailed { username } => {
                write!(f, "Authentication failed for {}", username)
            }
            RelayError::NoRoute { aor } => write!(f, "No active binding for {}", aor),
            RelayError::LoopDetected { target } => {
                write!(f, "Next hop {} loops back to this server", target)
            }
            RelayError::MaxForwardsExceeded => write!(f, "Max-Forwards exceeded"),
        }
    }
}

impl StdError for RelayError {}

impl RelayError {
    /// Create a parse error with optional position
    pub fn parse_error(
        message: impl Into<String>,
        position: Option<(usize, usize)>,
        context: Option<String>,
    ) -> Self {
        RelayError::ParseError {
            message: message.into(),
            position,
            context,
        }
    }

    /// Create a transport error
    pub fn transport_error(
        endpoint: impl Into<String>,
        reason: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        RelayError::TransportError {
            endpoint: endpoint.into(),
            reason: reason.into(),
            recoverable,
        }
    }

    /// Create a resource exhaustion error
    pub fn resource_error(resource_type: ResourceType, current: u64, limit: u64) -> Self {
        RelayError::ResourceError {
            resource_type,
            current_usage: current,
            limit,
        }
    }

    /// Create a state error
    pub fn state_error(
        operation: impl Into<String>,
        reason: impl Into<String>,
        context: Option<String>,
    ) -> Self {
        RelayError::StateError {
            operation: operation.into(),
            reason: reason.into(),
            context,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            RelayError::ParseError { .. } => true,
            RelayError::TransportError { recoverable, .. } => *recoverable,
            RelayError::ResourceError { .. } => true,
            RelayError::StateError { .. } => false,
            RelayError::AuthFailed { .. } => true,
            RelayError::NoRoute { .. } => true,
            RelayError::LoopDetected { .. } => true,
            RelayError::MaxForwardsExceeded => true,
        }
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::ParseError { .. } => "parsing",
            RelayError::TransportError { .. } => "transport",
            RelayError::ResourceError { .. } => "resource",
            RelayError::StateError { .. } => "state",
            RelayError::AuthFailed { .. } => "auth",
            RelayError::NoRoute { .. } => "routing",
            RelayError::LoopDetected { .. } => "routing",
            RelayError::MaxForwardsExceeded => "routing",
        }
    }
}

/// Result type for proxy operations
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let parse_error = RelayError::parse_error("Invalid header", Some((10, 5)), None);
        assert!(parse_error.to_string().contains("Parse error"));
        assert!(parse_error.to_string().contains("10:5"));

        let transport_error =
            RelayError::transport_error("192.168.1.1:5060", "Connection refused", true);
        assert!(transport_error.is_recoverable());
    }

    #[test]
    fn test_error_categories() {
        let parse_error = RelayError::parse_error("test", None, None);
        assert_eq!(parse_error.category(), "parsing");

        let resource_error = RelayError::resource_error(ResourceType::RtpPorts, 5000, 5000);
        assert_eq!(resource_error.category(), "resource");

        let no_route = RelayError::NoRoute {
            aor: "sip:1002@sip.local".to_string(),
        };
        assert_eq!(no_route.category(), "routing");
        assert!(no_route.to_string().contains("sip:1002@sip.local"));
    }
}
