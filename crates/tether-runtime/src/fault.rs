//! Managed-side faults

/// A fault raised while executing a managed member.
///
/// Faults propagate out of method bodies as `Err` and cross the bridge
/// either unhandled (unsafe call path) or captured into a `core.SafeReturn`
/// object (safe call path).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct Fault {
    message: String,
}

impl Fault {
    /// Create a fault with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Fault message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Fault for a member that does not exist on the receiver.
    pub fn member_not_found(name: &str) -> Self {
        Self::new(format!("member '{name}' not found"))
    }

    /// Fault for an argument that does not have the expected shape.
    pub fn bad_argument(detail: impl Into<String>) -> Self {
        Self::new(format!("invalid argument: {}", detail.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_message() {
        let fault = Fault::new("boom");
        assert_eq!(fault.message(), "boom");
        assert_eq!(fault.to_string(), "boom");
    }
}
