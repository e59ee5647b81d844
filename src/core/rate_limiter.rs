//! Per-user message rate limiting

use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::UserId;

/// Maximum number of users tracked before the stalest one is evicted
const MAX_TRACKED_USERS: usize = 10_000;

/// Sliding-window limiter for room and direct messages
pub struct MessageRateLimiter {
    user_message_times: RwLock<HashMap<UserId, Vec<Instant>>>,
    max_messages_per_minute: u32,
    window_duration: Duration,
}

impl MessageRateLimiter {
    /// A limit of 0 disables rate limiting
    pub fn new(max_messages_per_minute: u32) -> Self {
        Self::with_window(max_messages_per_minute, Duration::from_secs(60))
    }

    pub fn with_window(max_messages_per_minute: u32, window_duration: Duration) -> Self {
        Self {
            user_message_times: RwLock::new(HashMap::new()),
            max_messages_per_minute,
            window_duration,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_messages_per_minute > 0
    }

    /// Record a message attempt, returning false if the user is over the limit
    pub async fn allow_message(&self, user_id: UserId) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let now = Instant::now();
        let mut times = self.user_message_times.write().await;

        if times.len() >= MAX_TRACKED_USERS && !times.contains_key(&user_id) {
            let stalest = times
                .iter()
                .min_by_key(|(_, user_times)| user_times.last().copied().unwrap_or(now))
                .map(|(user, _)| *user);

            if let Some(stalest) = stalest {
                times.remove(&stalest);
                debug!("Evicted user {} from rate limiter", stalest);
            }
        }

        let user_times = times.entry(user_id).or_default();
        user_times.retain(|&time| now.duration_since(time) < self.window_duration);

        if user_times.len() < self.max_messages_per_minute as usize {
            user_times.push(now);
            true
        } else {
            false
        }
    }

    /// Messages counted for the user in the current window
    pub async fn get_message_count(&self, user_id: UserId) -> usize {
        let now = Instant::now();
        self.user_message_times
            .read()
            .await
            .get(&user_id)
            .map(|user_times| {
                user_times
                    .iter()
                    .filter(|&&time| now.duration_since(time) < self.window_duration)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop users whose window has fully expired
    pub async fn cleanup_old_entries(&self) {
        let now = Instant::now();
        let mut times = self.user_message_times.write().await;
        times.retain(|_, user_times| {
            user_times.retain(|&time| now.duration_since(time) < self.window_duration);
            !user_times.is_empty()
        });
    }

    pub async fn get_tracked_users_count(&self) -> usize {
        self.user_message_times.read().await.len()
    }

    /// Periodically purge expired windows
    pub fn start_cleanup_task(self: Arc<Self>) {
        if !self.is_enabled() {
            return;
        }
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                self.cleanup_old_entries().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_is_per_user() {
        let limiter = MessageRateLimiter::new(2);
        assert!(limiter.allow_message(1).await);
        assert!(limiter.allow_message(1).await);
        assert!(!limiter.allow_message(1).await);

        assert!(limiter.allow_message(2).await);
        assert_eq!(limiter.get_message_count(1).await, 2);
    }

    #[tokio::test]
    async fn test_zero_disables() {
        let limiter = MessageRateLimiter::new(0);
        for _ in 0..500 {
            assert!(limiter.allow_message(1).await);
        }
        assert_eq!(limiter.get_tracked_users_count().await, 0);
    }

    #[tokio::test]
    async fn test_window_expires() {
        let limiter = MessageRateLimiter::with_window(1, Duration::from_millis(20));
        assert!(limiter.allow_message(1).await);
        assert!(!limiter.allow_message(1).await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        limiter.cleanup_old_entries().await;
        assert_eq!(limiter.get_tracked_users_count().await, 0);
        assert!(limiter.allow_message(1).await);
    }
}
