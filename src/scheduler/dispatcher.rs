//! Bounded fan-out of probes across many targets.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::model::{ProbeFailure, ValidationError};

pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_TARGET_CEILING: usize = 254;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Limits applied to one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Upper bound on probes running at once; the pool is never larger than
    /// the number of targets.
    pub max_workers: usize,
    /// Budget for each probe, counted from the moment it gets a worker slot.
    pub timeout: Duration,
    /// Budget for the whole run. Targets still pending when it passes are
    /// reported as timed out.
    pub deadline: Option<Duration>,
    /// Most targets accepted in a single dispatch.
    pub ceiling: usize,
    /// Each probe waits a random delay below this before taking a slot.
    pub stagger: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            timeout: DEFAULT_PROBE_TIMEOUT,
            deadline: None,
            ceiling: DEFAULT_TARGET_CEILING,
            stagger: Duration::ZERO,
        }
    }
}

impl DispatchOptions {
    pub fn new(max_workers: usize, timeout: Duration) -> Self {
        Self {
            max_workers,
            timeout,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    /// Check the options against a target count.
    pub fn validate(&self, targets: usize) -> Result<(), ValidationError> {
        if self.max_workers == 0 {
            return Err(ValidationError::InvalidWorkerLimit);
        }
        if self.timeout.is_zero() {
            return Err(ValidationError::InvalidTimeout(self.timeout));
        }
        if targets == 0 {
            return Err(ValidationError::NoTargets);
        }
        if targets > self.ceiling {
            return Err(ValidationError::TooManyTargets {
                count: targets,
                ceiling: self.ceiling,
            });
        }
        Ok(())
    }

    /// Pool size actually used for `targets` targets.
    pub fn workers_for(&self, targets: usize) -> usize {
        self.max_workers.min(targets).max(1)
    }
}

/// Aborts the wrapped task when dropped, so an abandoned probe stops too.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `probe` once per distinct target under a bounded worker pool.
///
/// The returned map has exactly one entry per distinct input target. A probe
/// that times out, panics, or is still pending at the deadline is recorded
/// as a failure for its own target and never affects the others.
pub async fn dispatch<K, T, E, F, Fut>(
    targets: impl IntoIterator<Item = K>,
    probe: F,
    options: &DispatchOptions,
) -> Result<HashMap<K, Result<T, E>>, ValidationError>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
    E: From<ProbeFailure> + Send + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let mut seen = HashSet::new();
    let targets: Vec<K> = targets
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect();
    options.validate(targets.len())?;

    let workers = options.workers_for(targets.len());
    let semaphore = Arc::new(Semaphore::new(workers));
    let probe = Arc::new(probe);
    let deadline = options.deadline.map(|d| Instant::now() + d);

    tracing::debug!(
        "Dispatcher: {} targets, {} workers, {:?} per probe",
        targets.len(),
        workers,
        options.timeout
    );

    let mut tasks = JoinSet::new();
    for target in targets.iter().cloned() {
        let semaphore = semaphore.clone();
        let probe = probe.clone();
        let timeout = options.timeout;
        let stagger = options.stagger;

        tasks.spawn(async move {
            let result = run_slot(target.clone(), semaphore, probe, timeout, stagger).await;
            (target, result)
        });
    }

    let mut results = HashMap::with_capacity(targets.len());
    let mut expired = false;

    loop {
        let next = match deadline {
            Some(at) => match tokio::time::timeout_at(at, tasks.join_next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!(
                        "Dispatcher: deadline passed with {} probes unfinished",
                        tasks.len()
                    );
                    tasks.abort_all();
                    expired = true;
                    break;
                }
            },
            None => tasks.join_next().await,
        };

        match next {
            Some(Ok((target, result))) => {
                results.insert(target, result);
            }
            Some(Err(e)) => {
                tracing::error!("Dispatcher: worker task failed: {}", e);
            }
            None => break,
        }
    }

    for target in targets {
        results.entry(target).or_insert_with(|| {
            let failure = match (expired, options.deadline) {
                (true, Some(d)) => ProbeFailure::timeout(d),
                _ => ProbeFailure::unreachable("worker task failed"),
            };
            Err(E::from(failure))
        });
    }

    Ok(results)
}

async fn run_slot<K, T, E, F, Fut>(
    target: K,
    semaphore: Arc<Semaphore>,
    probe: Arc<F>,
    timeout: Duration,
    stagger: Duration,
) -> Result<T, E>
where
    K: fmt::Display + Send + 'static,
    T: Send + 'static,
    E: From<ProbeFailure> + Send + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let stagger_ms = stagger.as_millis() as u64;
    if stagger_ms > 0 {
        let delay = rand::thread_rng().gen_range(0..stagger_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    // Held until this function returns, whatever the path.
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| E::from(ProbeFailure::unreachable("worker pool closed")))?;

    let label = target.to_string();
    let started = Instant::now();
    // The probe fn itself runs inside the task so a panic while building
    // the future is charged to this target.
    let mut handle = AbortOnDrop(tokio::spawn(async move { probe(target).await }));

    match tokio::time::timeout(timeout, &mut handle.0).await {
        Ok(Ok(result)) => {
            tracing::debug!(
                host = %label,
                ok = result.is_ok(),
                duration_ms = started.elapsed().as_millis() as u64,
                "probe finished"
            );
            result
        }
        Ok(Err(e)) => {
            tracing::error!("Dispatcher: probe for {} failed: {}", label, e);
            Err(E::from(ProbeFailure::unreachable(format!(
                "probe task failed: {}",
                e
            ))))
        }
        Err(_) => {
            tracing::warn!("Dispatcher: probe for {} timed out after {:?}", label, timeout);
            Err(E::from(ProbeFailure::timeout(timeout)))
        }
    }
}
