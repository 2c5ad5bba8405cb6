use crate::config::RateLimitSettings;
use std::collections::HashMap;
use std::sync::Mutex;

const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    index: u64,
    used: usize,
}

/// Fixed-window request limiter keyed by client.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window_millis: u64,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            max_requests: settings.max_requests,
            window_millis: (settings.window.as_millis() as u64).max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one request for `client`. On rejection returns the
    /// milliseconds until the client's window resets.
    pub fn try_acquire_at(&self, client: &str, now_millis: u64) -> Result<(), u64> {
        let current = now_millis / self.window_millis;
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        if windows.len() > PRUNE_THRESHOLD {
            windows.retain(|_, window| window.index == current);
        }

        let window = windows
            .entry(client.to_string())
            .or_insert(Window { index: current, used: 0 });
        if window.index != current {
            window.index = current;
            window.used = 0;
        }
        if window.used >= self.max_requests {
            return Err((current + 1) * self.window_millis - now_millis);
        }
        window.used += 1;
        Ok(())
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// First `x-forwarded-for` hop, or a shared bucket when absent.
pub fn client_id(forwarded_for: Option<&str>) -> String {
    forwarded_for
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}
