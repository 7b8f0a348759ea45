//! Shared provider traits for dependency injection.
//!
//! External dependencies that make behavior non-deterministic are hidden
//! behind traits here so that modules can be tested with fixed values.

/// Trait for providing timestamps.
///
/// The run lock records when it was taken; tests inject a fixed clock.
///
/// # Example
///
/// ```
/// use infraheal::providers::{TimeProvider, SystemTimeProvider};
///
/// let provider = SystemTimeProvider;
/// let timestamp = provider.now();
/// assert!(timestamp > 0);
/// ```
pub trait TimeProvider: Send + Sync {
    /// Returns the current Unix timestamp in seconds.
    fn now(&self) -> u64;
}

/// Default time provider using system time.
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Clock that always returns the same instant.
pub struct FixedTimeProvider(pub u64);

impl TimeProvider for FixedTimeProvider {
    fn now(&self) -> u64 {
        self.0
    }
}
