use {
    rand::Rng,
    retry::delay::Exponential,
    std::{error::Error, future::Future, time::Duration},
    tokio::time::Instant,
    tracing::trace,
};

pub fn is_transient(err: &etcd_client::Error) -> bool {
    match err {
        etcd_client::Error::GRpcStatus(status) => match status.code() {
            tonic::Code::Ok => false,
            tonic::Code::Cancelled => false,
            tonic::Code::Unknown => status.source().is_none(),
            tonic::Code::InvalidArgument => false,
            tonic::Code::DeadlineExceeded => true,
            tonic::Code::NotFound => false,
            tonic::Code::AlreadyExists => false,
            tonic::Code::PermissionDenied => false,
            tonic::Code::ResourceExhausted => true,
            tonic::Code::FailedPrecondition => false,
            tonic::Code::Aborted => false,
            tonic::Code::OutOfRange => false,
            tonic::Code::Unimplemented => false,
            tonic::Code::Internal => true,
            tonic::Code::Unavailable => true,
            tonic::Code::DataLoss => true,
            tonic::Code::Unauthenticated => false,
        },
        etcd_client::Error::TransportError(_) => true,
        etcd_client::Error::IoError(_) => true,
        _ => false,
    }
}

///
/// Exponential backoff with a bounded total elapsed time.
///
/// Each delay is `initial_interval * growth_factor^n`, capped at `max_interval`,
/// then randomized by `randomization_factor` (a delay `d` becomes a uniform pick in `[d - d*rf, d + d*rf]`).
///
/// Once the next delay would push the total elapsed time past `max_elapsed_time`, retrying stops.
/// `None` means retry forever.
///
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed_time: Option<Duration>,
    pub growth_factor: f64,
    pub randomization_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(20),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Some(Duration::from_secs(15)),
            growth_factor: 1.5,
            randomization_factor: 0.5,
        }
    }
}

impl BackoffPolicy {
    ///
    /// Infinite sequence of delays to sleep between attempts.
    ///
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + 'static {
        let max_interval = self.max_interval;
        // NaN would make the jitter range empty.
        let randomization_factor = if self.randomization_factor.is_nan() {
            0.0
        } else {
            self.randomization_factor.clamp(0.0, 1.0)
        };
        let initial_ms = u64::try_from(self.initial_interval.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        Exponential::from_millis_with_factor(initial_ms, self.growth_factor.max(1.0))
            .map(move |delay| delay.min(max_interval))
            .map(move |delay| randomize(delay, randomization_factor))
    }
}

fn randomize(delay: Duration, randomization_factor: f64) -> Duration {
    if randomization_factor == 0.0 || delay.is_zero() {
        return delay;
    }
    let secs = delay.as_secs_f64();
    let delta = secs * randomization_factor;
    let picked = rand::thread_rng().gen_range((secs - delta)..=(secs + delta));
    Duration::from_secs_f64(picked)
}

///
/// Outcome of a single attempt that failed.
///
/// `Permanent` aborts retrying immediately, regardless of the remaining budget.
///
#[derive(Debug)]
pub enum Backoff<E> {
    Transient(E),
    Permanent(E),
}

impl<E> Backoff<E> {
    pub fn transient(err: E) -> Self {
        Self::Transient(err)
    }

    pub fn permanent(err: E) -> Self {
        Self::Permanent(err)
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Transient(e) | Self::Permanent(e) => e,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("retry budget exhausted after {attempts} attempts in {elapsed:?}: {last}")]
    Exhausted {
        last: E,
        attempts: u32,
        elapsed: Duration,
    },
    #[error("permanent failure: {0}")]
    Permanent(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Permanent(e) => e,
        }
    }
}

///
/// Retries `f` under `policy` until it succeeds, fails permanently, or the elapsed budget is exhausted.
///
/// Examples
///
/// ```
/// use rust_kv_lock::retry::{retry_with_backoff, Backoff, BackoffPolicy};
///
/// # tokio_test_block_on(async {
/// let mut calls = 0;
/// let result = retry_with_backoff(&BackoffPolicy::default(), || {
///     calls += 1;
///     let attempt = calls;
///     async move {
///         if attempt < 3 {
///             Err(Backoff::transient("not yet"))
///         } else {
///             Ok(attempt)
///         }
///     }
/// })
/// .await;
/// assert_eq!(result.ok(), Some(3));
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(f)
/// # }
/// ```
///
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Backoff<E>>>,
{
    let started_at = Instant::now();
    let mut delays = policy.delays();
    let mut attempts = 0;
    loop {
        attempts += 1;
        let last = match f().await {
            Ok(o) => return Ok(o),
            Err(Backoff::Permanent(e)) => return Err(RetryError::Permanent(e)),
            Err(Backoff::Transient(e)) => e,
        };
        let elapsed = started_at.elapsed();
        let delay = delays.next().unwrap_or(policy.max_interval);
        let within_budget = policy
            .max_elapsed_time
            .map_or(true, |budget| elapsed + delay <= budget);
        if !within_budget {
            return Err(RetryError::Exhausted {
                last,
                attempts,
                elapsed,
            });
        }
        trace!("attempt {attempts} failed, retrying in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}
