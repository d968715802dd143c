use {
    std::sync::{Mutex, MutexGuard, PoisonError},
    tracing_subscriber::{
        fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
    },
};

static LOGGING: Mutex<Option<LoggingHandle>> = Mutex::new(None);

fn installed() -> MutexGuard<'static, Option<LoggingHandle>> {
    LOGGING.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),
    #[error("failed to install the global subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
    #[error("failed to replace the log filter: {0}")]
    Reload(#[from] reload::Error),
}

///
/// Handle over the process-wide subscriber installed by [`init`].
///
/// The subscriber itself is installed once; only its level filter can be replaced afterwards.
///
#[derive(Clone)]
pub struct LoggingHandle {
    filter: reload::Handle<EnvFilter, Registry>,
}

impl LoggingHandle {
    ///
    /// Replaces the level filter of the installed subscriber, e.g. `"rust_kv_lock=debug"`.
    ///
    pub fn set_filter(&self, directives: &str) -> Result<(), LoggingError> {
        let filter = EnvFilter::try_new(directives)?;
        self.filter.reload(filter)?;
        Ok(())
    }

    ///
    /// Current filter directives.
    ///
    pub fn filter(&self) -> Option<String> {
        self.filter.with_current(|filter| filter.to_string()).ok()
    }
}

///
/// Installs the process-wide `tracing` subscriber with the given filter directives.
///
/// Must be called once at startup. Later calls return the handle of the already installed subscriber
/// and leave its filter untouched: use [`LoggingHandle::set_filter`] to change it.
///
pub fn init(directives: &str) -> Result<LoggingHandle, LoggingError> {
    // Held across the install so concurrent first calls all get the same handle.
    let mut slot = installed();
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }
    let filter = EnvFilter::try_new(directives)?;
    let (filter, reload_handle) = reload::Layer::new(filter);
    let handle = LoggingHandle {
        filter: reload_handle,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()?;
    *slot = Some(handle.clone());
    Ok(handle)
}

///
/// Installs the subscriber using `RUST_LOG`, defaulting to `info`.
///
pub fn init_from_env() -> Result<LoggingHandle, LoggingError> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_string());
    init(&directives)
}

///
/// Handle of the installed subscriber, if [`init`] was called.
///
pub fn handle() -> Option<LoggingHandle> {
    installed().clone()
}
