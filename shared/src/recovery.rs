//! Recovery coordination for classified faults
//!
//! A [`RecoveryCoordinator`] receives a [`TypedError`], admits it if a
//! concurrency permit is free, optionally asks the user what to do, and then
//! walks the registered strategies in descending priority order until one
//! succeeds. The whole strategy chain runs under a single timeout; dropping
//! the coordinator's future (timeout or task cancellation) drops the
//! in-flight strategy future with it, and the permit is released exactly once
//! by the guard that owns it.

use crate::error::{ErrorCategory, ErrorKind, RecoveryStrategyKind, TypedError};
use crate::notify::Listeners;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

pub type RecoveryContext = HashMap<String, String>;
pub type RecoveryFuture = Pin<Box<dyn Future<Output = RecoveryResult> + Send + 'static>>;
pub type OperationFuture = Pin<Box<dyn Future<Output = Result<String, TypedError>> + Send + 'static>>;
pub type RecoveryOperation = Arc<dyn Fn() -> OperationFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryResult {
    Success {
        message: String,
        duration_ms: u64,
    },
    Failure {
        message: String,
        duration_ms: u64,
        cause: Option<TypedError>,
    },
    Retry {
        message: String,
        delay_ms: u64,
    },
    PartialSuccess {
        message: String,
        duration_ms: u64,
        metadata: HashMap<String, String>,
    },
    NotApplicable {
        message: String,
    },
}

impl RecoveryResult {
    pub fn success(message: impl Into<String>, duration_ms: u64) -> Self {
        RecoveryResult::Success {
            message: message.into(),
            duration_ms,
        }
    }

    pub fn failure(message: impl Into<String>, duration_ms: u64) -> Self {
        RecoveryResult::Failure {
            message: message.into(),
            duration_ms,
            cause: None,
        }
    }

    pub fn not_applicable(message: impl Into<String>) -> Self {
        RecoveryResult::NotApplicable {
            message: message.into(),
        }
    }

    /// Full or degraded success both end a recovery session.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RecoveryResult::Success { .. } | RecoveryResult::PartialSuccess { .. }
        )
    }

    pub fn message(&self) -> &str {
        match self {
            RecoveryResult::Success { message, .. }
            | RecoveryResult::Failure { message, .. }
            | RecoveryResult::Retry { message, .. }
            | RecoveryResult::PartialSuccess { message, .. }
            | RecoveryResult::NotApplicable { message } => message,
        }
    }
}

pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> RecoveryStrategyKind;
    fn priority(&self) -> i32;
    fn can_recover(&self, error: &TypedError) -> bool;
    fn attempt_recovery(&self, error: &TypedError, context: &RecoveryContext) -> RecoveryFuture;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserChoice {
    Retry,
    Skip,
    Abort,
}

#[derive(Debug, Clone)]
pub struct ChoicePrompt {
    pub error: TypedError,
    pub options: Vec<UserChoice>,
    pub timeout: Duration,
    pub default: UserChoice,
}

/// Implemented by the presentation layer to ask the user how to proceed.
pub trait UserChoiceProvider: Send + Sync {
    fn choose(&self, prompt: ChoicePrompt) -> Pin<Box<dyn Future<Output = UserChoice> + Send>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryEvent {
    Started { kind: ErrorKind, message: String },
    Progress { percent: u8, message: String },
    Busy { kind: ErrorKind },
    NotRecoverable { error: TypedError },
    ChoiceRequested { error: TypedError, options: Vec<UserChoice> },
    Finished { success: bool, message: String, duration_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Recovery sessions allowed at once. Default: 3.
    pub max_concurrent: usize,
    /// Budget for the whole strategy chain. Default: 5 s.
    pub timeout: Duration,
    /// Re-attempts of one strategy when it answers `Retry`. Default: 2.
    pub max_retries_per_strategy: u32,
    /// Categories for which the user is asked before strategies run. Default: Security.
    pub user_choice_categories: Vec<ErrorCategory>,
    /// How long to wait for the user. Default: 30 s.
    pub user_choice_timeout: Duration,
    /// Decision applied when the user does not answer. Default: Abort.
    pub default_choice: UserChoice,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            timeout: Duration::from_secs(5),
            max_retries_per_strategy: 2,
            user_choice_categories: vec![ErrorCategory::Security],
            user_choice_timeout: Duration::from_secs(30),
            default_choice: UserChoice::Abort,
        }
    }
}

#[derive(Debug, Default)]
struct RecoveryMetrics {
    attempted: AtomicU64,
    successful: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    total_duration_ms: AtomicU64,
    active: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub attempted: u64,
    pub successful: u64,
    pub rejected: u64,
    pub average_duration_ms: f64,
    pub current_concurrency: usize,
}

/// Holds the permit for one admitted session and keeps the gauge honest.
struct ActiveSession<'a> {
    metrics: &'a RecoveryMetrics,
    _permit: OwnedSemaphorePermit,
}

impl<'a> ActiveSession<'a> {
    fn admit(metrics: &'a RecoveryMetrics, permit: OwnedSemaphorePermit) -> Self {
        metrics.attempted.fetch_add(1, Ordering::SeqCst);
        metrics.active.fetch_add(1, Ordering::SeqCst);
        Self {
            metrics,
            _permit: permit,
        }
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    pub result: RecoveryResult,
    /// Strategy names in the order they were tried
    pub attempts: Vec<String>,
    pub elapsed: Duration,
}

impl RecoveryOutcome {
    fn immediate(result: RecoveryResult) -> Self {
        Self {
            result,
            attempts: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }
}

pub struct RecoveryHandle {
    inner: JoinHandle<RecoveryOutcome>,
}

impl RecoveryHandle {
    pub fn cancel(&self) {
        self.inner.abort();
    }

    /// None when the session was cancelled.
    pub async fn outcome(self) -> Option<RecoveryOutcome> {
        self.inner.await.ok()
    }
}

pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    strategies: RwLock<Vec<Arc<dyn RecoveryStrategy>>>,
    permits: Arc<Semaphore>,
    metrics: RecoveryMetrics,
    listeners: Listeners<RecoveryEvent>,
    choice_provider: RwLock<Option<Arc<dyn UserChoiceProvider>>>,
}

impl RecoveryCoordinator {
    pub fn new(config: RecoveryConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            strategies: RwLock::new(Vec::new()),
            permits,
            metrics: RecoveryMetrics::default(),
            listeners: Listeners::new(),
            choice_provider: RwLock::new(None),
        }
    }

    pub fn register_strategy(&self, strategy: Arc<dyn RecoveryStrategy>) {
        info!(
            "Registered recovery strategy {} ({:?}, priority {})",
            strategy.name(),
            strategy.kind(),
            strategy.priority()
        );
        self.strategies.write().push(strategy);
    }

    pub fn unregister_strategy(&self, name: &str) -> bool {
        let mut strategies = self.strategies.write();
        let before = strategies.len();
        strategies.retain(|strategy| strategy.name() != name);
        strategies.len() != before
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.read().len()
    }

    pub fn set_choice_provider(&self, provider: Arc<dyn UserChoiceProvider>) {
        *self.choice_provider.write() = Some(provider);
    }

    pub fn listeners(&self) -> &Listeners<RecoveryEvent> {
        &self.listeners
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let completed = self.metrics.completed.load(Ordering::SeqCst);
        let total = self.metrics.total_duration_ms.load(Ordering::SeqCst);
        MetricsSnapshot {
            attempted: self.metrics.attempted.load(Ordering::SeqCst),
            successful: self.metrics.successful.load(Ordering::SeqCst),
            rejected: self.metrics.rejected.load(Ordering::SeqCst),
            average_duration_ms: if completed == 0 {
                0.0
            } else {
                total as f64 / completed as f64
            },
            current_concurrency: self.metrics.active.load(Ordering::SeqCst),
        }
    }

    /// Runs a recovery session on the runtime and returns a cancellable handle.
    pub fn spawn_recover(
        self: &Arc<Self>,
        error: TypedError,
        context: RecoveryContext,
    ) -> RecoveryHandle {
        let coordinator = Arc::clone(self);
        RecoveryHandle {
            inner: tokio::spawn(async move { coordinator.recover(error, context).await }),
        }
    }

    pub async fn recover(&self, error: TypedError, context: RecoveryContext) -> RecoveryOutcome {
        if !error.recoverable {
            info!("No recovery possible for {}", error);
            self.listeners.notify(&RecoveryEvent::NotRecoverable {
                error: error.clone(),
            });
            return RecoveryOutcome::immediate(RecoveryResult::not_applicable(format!(
                "no recovery possible: {}",
                error.message
            )));
        }

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.metrics.rejected.fetch_add(1, Ordering::SeqCst);
                warn!("Recovery for {} rejected: system busy", error.kind);
                self.listeners
                    .notify(&RecoveryEvent::Busy { kind: error.kind });
                return RecoveryOutcome::immediate(RecoveryResult::failure("system busy", 0));
            }
        };
        let _session = ActiveSession::admit(&self.metrics, permit);

        let started = Instant::now();
        self.listeners.notify(&RecoveryEvent::Started {
            kind: error.kind,
            message: error.message.clone(),
        });

        let mut attempts = Vec::new();
        let result = match self.ask_user(&error).await {
            Some(result) => result,
            None => {
                let chain = self.run_chain(&error, &context, &mut attempts);
                match tokio::time::timeout(self.config.timeout, chain).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            "Recovery for {} timed out after {:?}",
                            error.kind, self.config.timeout
                        );
                        RecoveryResult::Failure {
                            message: format!("recovery timed out after {:?}", self.config.timeout),
                            duration_ms: elapsed_ms(started),
                            cause: None,
                        }
                    }
                }
            }
        };

        let elapsed = started.elapsed();
        self.metrics.completed.fetch_add(1, Ordering::SeqCst);
        self.metrics
            .total_duration_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::SeqCst);
        if result.is_success() {
            self.metrics.successful.fetch_add(1, Ordering::SeqCst);
        }

        info!(
            "Recovery for {} finished in {:?} after {} strategies: {}",
            error.kind,
            elapsed,
            attempts.len(),
            result.message()
        );
        self.listeners.notify(&RecoveryEvent::Finished {
            success: result.is_success(),
            message: result.message().to_string(),
            duration_ms: elapsed.as_millis() as u64,
        });

        RecoveryOutcome {
            result,
            attempts,
            elapsed,
        }
    }

    /// Returns a final result when the user's answer ends the session.
    async fn ask_user(&self, error: &TypedError) -> Option<RecoveryResult> {
        if !self.config.user_choice_categories.contains(&error.category) {
            return None;
        }
        let provider = self.choice_provider.read().clone()?;

        let options = vec![UserChoice::Retry, UserChoice::Skip, UserChoice::Abort];
        self.listeners.notify(&RecoveryEvent::ChoiceRequested {
            error: error.clone(),
            options: options.clone(),
        });

        let prompt = ChoicePrompt {
            error: error.clone(),
            options,
            timeout: self.config.user_choice_timeout,
            default: self.config.default_choice,
        };
        let choice = tokio::time::timeout(self.config.user_choice_timeout, provider.choose(prompt))
            .await
            .unwrap_or_else(|_| {
                debug!("User did not answer in time, using {:?}", self.config.default_choice);
                self.config.default_choice
            });

        match choice {
            UserChoice::Retry => None,
            UserChoice::Skip => Some(RecoveryResult::not_applicable("skipped by user")),
            UserChoice::Abort => Some(RecoveryResult::failure("aborted by user", 0)),
        }
    }

    async fn run_chain(
        &self,
        error: &TypedError,
        context: &RecoveryContext,
        attempts: &mut Vec<String>,
    ) -> RecoveryResult {
        let started = Instant::now();
        let mut candidates: Vec<Arc<dyn RecoveryStrategy>> = self
            .strategies
            .read()
            .iter()
            .filter(|strategy| strategy.can_recover(error))
            .cloned()
            .collect();
        // Stable sort keeps registration order among equal priorities.
        candidates.sort_by_key(|strategy| std::cmp::Reverse(strategy.priority()));

        if candidates.is_empty() {
            return RecoveryResult::not_applicable(format!("no strategy can recover {}", error.kind));
        }

        let total = candidates.len();
        let mut last_failure = None;

        for (index, strategy) in candidates.iter().enumerate() {
            attempts.push(strategy.name().to_string());
            self.listeners.notify(&RecoveryEvent::Progress {
                percent: (index * 100 / total) as u8,
                message: format!("attempting {}", strategy.name()),
            });

            let mut retries = 0;
            loop {
                let result = strategy.attempt_recovery(error, context).await;
                debug!("Strategy {} answered {:?}", strategy.name(), result);

                match result {
                    RecoveryResult::Success { .. } | RecoveryResult::PartialSuccess { .. } => {
                        return result;
                    }
                    RecoveryResult::Retry { delay_ms, .. }
                        if retries < self.config.max_retries_per_strategy =>
                    {
                        retries += 1;
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    RecoveryResult::Retry { message, .. } => {
                        last_failure = Some((message, None));
                        break;
                    }
                    RecoveryResult::Failure {
                        message,
                        cause: Some(cause),
                        duration_ms,
                    } if !cause.recoverable => {
                        return RecoveryResult::Failure {
                            message,
                            duration_ms,
                            cause: Some(cause),
                        };
                    }
                    RecoveryResult::Failure { message, cause, .. } => {
                        last_failure = Some((message, cause));
                        break;
                    }
                    RecoveryResult::NotApplicable { message } => {
                        last_failure = Some((message, None));
                        break;
                    }
                }
            }
        }

        let (last_message, cause) = last_failure.unwrap_or_default();
        RecoveryResult::Failure {
            message: format!("all {} recovery strategies failed; last: {}", total, last_message),
            duration_ms: elapsed_ms(started),
            cause,
        }
    }

    /// Closes admission and drops registered strategies and listeners.
    pub fn shutdown(&self) {
        self.permits.close();
        self.strategies.write().clear();
        self.listeners.clear();
        *self.choice_provider.write() = None;
        info!("Recovery coordinator shut down");
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Re-runs an operation a fixed number of times with a fixed delay.
pub struct RetryStrategy {
    name: String,
    priority: i32,
    max_attempts: u32,
    delay: Duration,
    operation: RecoveryOperation,
}

impl RetryStrategy {
    pub fn new(
        name: &str,
        priority: i32,
        max_attempts: u32,
        delay: Duration,
        operation: RecoveryOperation,
    ) -> Self {
        Self {
            name: name.to_string(),
            priority,
            max_attempts: max_attempts.max(1),
            delay,
            operation,
        }
    }
}

impl RecoveryStrategy for RetryStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::Retry
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn can_recover(&self, error: &TypedError) -> bool {
        error.strategy == RecoveryStrategyKind::Retry
    }

    fn attempt_recovery(&self, _error: &TypedError, _context: &RecoveryContext) -> RecoveryFuture {
        let operation = Arc::clone(&self.operation);
        let max_attempts = self.max_attempts;
        let delay = self.delay;
        Box::pin(async move {
            let started = Instant::now();
            let mut attempt = 1;
            loop {
                match operation().await {
                    Ok(message) => return RecoveryResult::success(message, elapsed_ms(started)),
                    Err(cause) if attempt >= max_attempts => {
                        return RecoveryResult::Failure {
                            message: format!("retry gave up after {} attempts", attempt),
                            duration_ms: elapsed_ms(started),
                            cause: Some(cause),
                        };
                    }
                    Err(cause) => {
                        debug!("Retry attempt {} failed: {}", attempt, cause);
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        })
    }
}

/// Degraded-mode recovery. Success is always reported as `PartialSuccess`.
pub struct FallbackStrategy {
    name: String,
    priority: i32,
    operation: RecoveryOperation,
}

impl FallbackStrategy {
    pub fn new(name: &str, priority: i32, operation: RecoveryOperation) -> Self {
        Self {
            name: name.to_string(),
            priority,
            operation,
        }
    }
}

impl RecoveryStrategy for FallbackStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::Fallback
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn can_recover(&self, error: &TypedError) -> bool {
        error.recoverable
    }

    fn attempt_recovery(&self, _error: &TypedError, _context: &RecoveryContext) -> RecoveryFuture {
        let operation = Arc::clone(&self.operation);
        let name = self.name.clone();
        Box::pin(async move {
            let started = Instant::now();
            match operation().await {
                Ok(message) => RecoveryResult::PartialSuccess {
                    message,
                    duration_ms: elapsed_ms(started),
                    metadata: HashMap::from([
                        ("strategy".to_string(), name),
                        ("degraded".to_string(), "true".to_string()),
                    ]),
                },
                Err(cause) => RecoveryResult::Failure {
                    message: format!("fallback failed: {}", cause.message),
                    duration_ms: elapsed_ms(started),
                    cause: Some(cause),
                },
            }
        })
    }
}
