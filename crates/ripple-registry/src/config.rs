use ripple_common::FeedLimits;

/// Registry tuning knobs.
///
/// ```
/// use ripple_registry::RegistryConfig;
///
/// let config = RegistryConfig::default();
/// assert_eq!(config.subscriber_queue_capacity, 1024);
/// ```
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Bound of each local subscriber queue. A subscriber that falls this far behind is
    /// cut off with `FeedError::QueueOverflow`.
    pub subscriber_queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&FeedLimits::default())
    }
}

impl From<&FeedLimits> for RegistryConfig {
    fn from(limits: &FeedLimits) -> Self {
        Self {
            subscriber_queue_capacity: limits.subscriber_queue_capacity.max(1),
        }
    }
}
