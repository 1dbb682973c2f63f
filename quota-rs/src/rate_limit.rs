//! Burst rate limiting for calls to the downstream AI service
//!
//! A per-user sliding window caps how *often* a user may call an endpoint
//! class, independently of how much daily budget they have left:
//! - Sliding window of request timestamps per (user, endpoint class)
//! - Lazy purge of timestamps older than the window
//! - Anonymous callers are neither counted nor limited here
//! - Periodic cleanup of idle windows
//!
//! State is process-local and volatile. A restart forgets burst history,
//! which is fine: the durable daily quota is the real backstop.
//!
//! # Example
//! ```no_run
//! use quota_rs::clock::SystemClock;
//! use quota_rs::quota::UserId;
//! use quota_rs::rate_limit::{BurstRateLimiter, EndpointClass};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = BurstRateLimiter::new(Arc::new(SystemClock));
//! let user = UserId::parse("42")?;
//!
//! if limiter.allow(Some(&user), EndpointClass::GeneralChat).await {
//!     // ... call the downstream service, then:
//!     limiter.record(Some(&user), EndpointClass::GeneralChat).await;
//! } else {
//!     println!("Too many requests, slow down");
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{RateLimitConfig, WindowConfig};
use crate::error::{QuotaError, Result};
use crate::quota::UserId;

/// Endpoint classes with separate burst budgets
#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// General chatbot, including image and PDF analysis
    #[default]
    GeneralChat,
    /// Weather assistant (more expensive model, tighter limit)
    WeatherChat,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 2] = [EndpointClass::GeneralChat, EndpointClass::WeatherChat];

    /// Default maximum requests per window
    pub fn max_requests(&self) -> usize {
        match self {
            EndpointClass::GeneralChat => 50, // 50 requests per hour
            EndpointClass::WeatherChat => 10, // 10 requests per hour
        }
    }

    /// Default window length
    pub fn window_duration(&self) -> Duration {
        Duration::hours(1)
    }

    pub fn description(&self) -> &'static str {
        match self {
            EndpointClass::GeneralChat => "general chat requests per hour",
            EndpointClass::WeatherChat => "weather chat requests per hour",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointClass::GeneralChat => f.write_str("general_chat"),
            EndpointClass::WeatherChat => f.write_str("weather_chat"),
        }
    }
}

/// Limit applied to one endpoint class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: usize,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_requests: usize, window: Duration) -> Result<Self> {
        if max_requests == 0 {
            return Err(QuotaError::invalid("max_requests must be positive"));
        }
        if window <= Duration::zero() {
            return Err(QuotaError::invalid("window must be positive"));
        }
        Ok(Self {
            max_requests,
            window,
        })
    }

    pub fn default_for(class: EndpointClass) -> Self {
        Self {
            max_requests: class.max_requests(),
            window: class.window_duration(),
        }
    }

    fn from_window_config(window: &WindowConfig) -> Result<Self> {
        let length = Duration::from_std(window.window())
            .map_err(|_| QuotaError::Config(format!("window_secs {} out of range", window.window_secs)))?;
        Self::new(window.max_requests, length)
    }
}

/// Timestamps of recent requests, oldest first
#[derive(Debug, Clone, Default)]
struct SlidingWindow {
    requests: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    /// Drop timestamps that fell out of the window ending at `now`
    fn purge(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while let Some(&oldest) = self.requests.front() {
            if oldest > cutoff {
                break;
            }
            self.requests.pop_front();
        }
    }

    fn count(&mut self, now: DateTime<Utc>, window: Duration) -> usize {
        self.purge(now, window);
        self.requests.len()
    }

    fn push(&mut self, now: DateTime<Utc>, window: Duration) {
        self.purge(now, window);
        self.requests.push_back(now);
    }
}

/// Key for rate limit tracking
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct LimitKey {
    user: UserId,
    class: EndpointClass,
}

/// A request slot taken by [`BurstRateLimiter::try_acquire`].
///
/// Hand it back with [`BurstRateLimiter::release`] if the request did not go
/// through; otherwise just drop it.
#[derive(Debug)]
#[must_use]
pub struct BurstPermit {
    /// `None` for anonymous callers, who hold no slot
    key: Option<LimitKey>,
    at: DateTime<Utc>,
}

/// Per-user sliding-window burst limiter
pub struct BurstRateLimiter {
    /// One independently lockable window per (user, class)
    windows: RwLock<HashMap<LimitKey, Arc<Mutex<SlidingWindow>>>>,
    policies: HashMap<EndpointClass, RateLimitPolicy>,
    clock: Arc<dyn Clock>,
    last_cleanup: Mutex<DateTime<Utc>>,
    cleanup_interval: Duration,
}

impl BurstRateLimiter {
    /// Limiter with the default policy for every endpoint class
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let policies = EndpointClass::ALL
            .iter()
            .map(|class| (*class, RateLimitPolicy::default_for(*class)))
            .collect();
        let now = clock.now();
        Self {
            windows: RwLock::new(HashMap::new()),
            policies,
            clock,
            last_cleanup: Mutex::new(now),
            cleanup_interval: Duration::minutes(5),
        }
    }

    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::new(clock)
            .with_policy(
                EndpointClass::GeneralChat,
                RateLimitPolicy::from_window_config(&config.general_chat)?,
            )
            .with_policy(
                EndpointClass::WeatherChat,
                RateLimitPolicy::from_window_config(&config.weather_chat)?,
            ))
    }

    pub fn with_policy(mut self, class: EndpointClass, policy: RateLimitPolicy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    pub fn policy(&self, class: EndpointClass) -> RateLimitPolicy {
        self.policies
            .get(&class)
            .copied()
            .unwrap_or_else(|| RateLimitPolicy::default_for(class))
    }

    /// Would one more request from `user` fit in the window?
    ///
    /// Does not count the request; call [`record`](Self::record) once it
    /// actually went through. `None` (anonymous) is always allowed.
    pub async fn allow(&self, user: Option<&UserId>, class: EndpointClass) -> bool {
        let Some(user) = user else {
            return true;
        };
        self.maybe_cleanup().await;

        let policy = self.policy(class);
        let Some(window) = self.window(user, class).await else {
            return true;
        };

        let count = window.lock().await.count(self.clock.now(), policy.window);
        let allowed = count < policy.max_requests;

        if !allowed {
            warn!(
                "Rate limit exceeded for user {}: {} ({})",
                user,
                class.description(),
                policy.max_requests
            );
            debug!("Current count: {}", count);
        }

        allowed
    }

    /// Check and take a slot in one step.
    ///
    /// The check and the push happen under the window lock, so concurrent
    /// callers for the same user and class can never overshoot the limit.
    /// Returns `None` when the window is full. Anonymous callers always get
    /// a permit that holds nothing.
    pub async fn try_acquire(&self, user: Option<&UserId>, class: EndpointClass) -> Option<BurstPermit> {
        let now = self.clock.now();
        let Some(user) = user else {
            return Some(BurstPermit { key: None, at: now });
        };
        self.maybe_cleanup().await;

        let policy = self.policy(class);
        let window = self.window_or_insert(user, class).await;
        let mut window = window.lock().await;

        let count = window.count(now, policy.window);
        if count >= policy.max_requests {
            warn!(
                "Rate limit exceeded for user {}: {} ({})",
                user,
                class.description(),
                policy.max_requests
            );
            debug!("Current count: {}", count);
            return None;
        }

        window.push(now, policy.window);
        Some(BurstPermit {
            key: Some(LimitKey {
                user: user.clone(),
                class,
            }),
            at: now,
        })
    }

    /// Give back a slot whose request did not go through
    pub async fn release(&self, permit: BurstPermit) {
        let Some(key) = permit.key else {
            return;
        };
        let window = self.windows.read().await.get(&key).cloned();
        if let Some(window) = window {
            let mut window = window.lock().await;
            if let Some(pos) = window.requests.iter().rposition(|ts| *ts == permit.at) {
                window.requests.remove(pos);
            }
        }
    }

    /// Count a request that went through. `None` (anonymous) is ignored.
    pub async fn record(&self, user: Option<&UserId>, class: EndpointClass) {
        let Some(user) = user else {
            return;
        };

        let policy = self.policy(class);
        let window = self.window_or_insert(user, class).await;
        window.lock().await.push(self.clock.now(), policy.window);
    }

    /// Requests from `user` currently inside the window
    pub async fn count(&self, user: &UserId, class: EndpointClass) -> usize {
        let policy = self.policy(class);
        match self.window(user, class).await {
            Some(window) => window.lock().await.count(self.clock.now(), policy.window),
            None => 0,
        }
    }

    /// Forget a user's burst history in every class
    pub async fn reset_user(&self, user: &UserId) {
        let mut windows = self.windows.write().await;
        windows.retain(|key, _| &key.user != user);
        debug!("Reset rate limits for user {}", user);
    }

    /// Forget everything
    pub async fn clear(&self) {
        self.windows.write().await.clear();
    }

    /// Number of tracked (user, class) windows
    pub async fn tracked(&self) -> usize {
        self.windows.read().await.len()
    }

    /// Drop windows with no request left inside them
    pub async fn purge_idle(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.write().await;
        let before = windows.len();

        let mut idle = Vec::new();
        for (key, window) in windows.iter() {
            // another task holds this window and may be about to push into it
            if Arc::strong_count(window) > 1 {
                continue;
            }
            let policy = self.policy(key.class);
            if let Ok(mut window) = window.try_lock() {
                if window.count(now, policy.window) == 0 {
                    idle.push(key.clone());
                }
            }
        }
        for key in idle {
            windows.remove(&key);
        }

        before - windows.len()
    }

    async fn window(&self, user: &UserId, class: EndpointClass) -> Option<Arc<Mutex<SlidingWindow>>> {
        let key = LimitKey {
            user: user.clone(),
            class,
        };
        self.windows.read().await.get(&key).cloned()
    }

    async fn window_or_insert(&self, user: &UserId, class: EndpointClass) -> Arc<Mutex<SlidingWindow>> {
        if let Some(window) = self.window(user, class).await {
            return window;
        }
        let key = LimitKey {
            user: user.clone(),
            class,
        };
        let mut windows = self.windows.write().await;
        windows.entry(key).or_default().clone()
    }

    /// Cleanup idle windows if the interval elapsed
    async fn maybe_cleanup(&self) {
        let now = self.clock.now();
        let mut last_cleanup = self.last_cleanup.lock().await;

        if now - *last_cleanup > self.cleanup_interval {
            *last_cleanup = now;
            drop(last_cleanup);

            let removed = self.purge_idle().await;
            debug!("Rate limiter cleanup removed {} idle windows", removed);
        }
    }
}
