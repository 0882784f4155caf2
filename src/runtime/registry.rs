use super::OrchestrationHandler;
use crate::_typed_codec::Codec;
use crate::OrchestrationContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn OrchestrationHandler>>>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

pub struct OrchestrationRegistryBuilder {
    map: HashMap<String, Arc<dyn OrchestrationHandler>>,
    errors: Vec<String>,
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        use super::FnOrchestration;
        let name = name.into();
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate orchestration registration: {name}"));
            return self;
        }
        self.map.insert(name, Arc::new(FnOrchestration(f)));
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Like `build`, but reports duplicate registrations instead of keeping the first.
    pub fn build_result(self) -> Result<OrchestrationRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

// ---------------- Activity registry

/// Failure reported by an activity attempt. Retryable failures are retried
/// under the activity's `RetryPolicy`; fatal ones fail the activity at once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivityError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
}

impl ActivityError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivityError::Retryable(_))
    }
}

impl From<String> for ActivityError {
    fn from(s: String) -> Self {
        ActivityError::Retryable(s)
    }
}

/// Bounded exponential backoff between activity attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; at least 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_coefficient: f64,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_coefficient.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Execution limits the worker applies to every invocation of an activity.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    /// Budget for a single attempt; `None` means unbounded.
    pub start_to_close: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close: Some(Duration::from_secs(600)),
            retry: RetryPolicy::default(),
        }
    }
}

impl ActivityOptions {
    /// One unbounded attempt; what plain `register` uses.
    pub fn single_attempt() -> Self {
        Self {
            start_to_close: None,
            retry: RetryPolicy::no_retry(),
        }
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, ActivityError>;
}

pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, ActivityError> {
        (self.0)(input).await
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredActivity {
    pub(crate) handler: Arc<dyn ActivityHandler>,
    pub(crate) options: ActivityOptions,
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    pub(crate) inner: Arc<HashMap<String, RegisteredActivity>>,
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, RegisteredActivity>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        let b = ActivityRegistryBuilder { map: HashMap::new() };
        // System activities are registered before any user registration
        b.register(crate::SYSTEM_TRACE_ACTIVITY, |input: String| async move {
            let (level, msg) = match input.split_once(':') {
                Some((l, m)) => (crate::logging::LogLevel::parse(l), m.to_string()),
                None => (crate::logging::LogLevel::Info, input),
            };
            match level {
                crate::logging::LogLevel::Error => error!(message=%msg, "orchestration trace"),
                crate::logging::LogLevel::Warn => warn!(message=%msg, "orchestration trace"),
                crate::logging::LogLevel::Debug => debug!(message=%msg, "orchestration trace"),
                crate::logging::LogLevel::Info => info!(message=%msg, "orchestration trace"),
            }
            Ok(format!("{level}:{msg}"))
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).map(|r| r.handler.clone())
    }

    pub fn options(&self, name: &str) -> Option<ActivityOptions> {
        self.inner.get(name).map(|r| r.options.clone())
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<RegisteredActivity> {
        self.inner.get(name).cloned()
    }
}

impl ActivityRegistryBuilder {
    /// Register an activity whose `Err` strings are retryable failures. It
    /// runs once per scheduling with no time budget.
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |input: String| {
            let f_inner = f.clone();
            async move { (f_inner)(input).await.map_err(ActivityError::from) }
        };
        self.register_with_options(name, ActivityOptions::single_attempt(), wrapper)
    }

    /// Register an activity together with its time budget and retry policy.
    pub fn register_with_options<F, Fut>(mut self, name: impl Into<String>, options: ActivityOptions, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.map.insert(
            name.into(),
            RegisteredActivity {
                handler: Arc::new(FnActivity(f)),
                options,
            },
        );
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f_clone = Arc::new(f);
        let wrapper = move |input_s: String| {
            let f_inner = f_clone.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = (f_inner)(input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}
