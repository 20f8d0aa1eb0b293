#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid priority: {0} (must be between 0 and 10)")]
    InvalidPriority(u8),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Subscription not found: {0}")]
    NotFound(u64),

    #[error("No subscribers for topic: {0}")]
    NoSubscribers(String),

    #[error("All subscribers failed: {0}")]
    AllFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        assert!(BusError::InvalidPriority(11).to_string().contains("11"));
        assert!(BusError::NotFound(7).to_string().contains("7"));
        assert!(BusError::NoSubscribers("a.b".into()).to_string().contains("a.b"));
    }
}
