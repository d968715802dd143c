use {
    crate::{error::LockError, retry::BackoffPolicy},
    ::config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File},
    serde::Deserialize,
    std::{path::Path, time::Duration},
};

///
/// Backoff settings of the bounded acquire, in milliseconds.
///
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// `0` disables the budget and retries forever.
    pub max_elapsed_time_ms: u64,
    pub growth_factor: f64,
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 20,
            max_interval_ms: 60_000,
            max_elapsed_time_ms: 15_000,
            growth_factor: 1.5,
            randomization_factor: 0.5,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), LockError> {
        let invalid = |msg: &str| Err(LockError::InvalidConfig(msg.to_string()));
        if self.max_interval_ms == 0 {
            return invalid("backoff max interval must be strictly positive");
        }
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return invalid("backoff growth factor must be a finite number, at least 1");
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return invalid("backoff randomization factor must be within [0, 1]");
        }
        Ok(())
    }

    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            max_elapsed_time: (self.max_elapsed_time_ms > 0)
                .then(|| Duration::from_millis(self.max_elapsed_time_ms)),
            growth_factor: self.growth_factor,
            randomization_factor: self.randomization_factor,
        }
    }
}

///
/// Lock settings. Every duration is in milliseconds so the struct loads from env vars and config files as-is.
///
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease duration of the lock key.
    pub ttl_ms: u64,
    /// Renewal fires `ttl - renewal_margin` after the last successful refresh.
    pub renewal_margin_ms: u64,
    /// Sleep between attempts of the blocking acquire while the lock is held elsewhere.
    pub retry_interval_ms: u64,
    /// Sleep between attempts of the blocking acquire after a store error.
    pub error_wait_ms: u64,
    pub set_timeout_ms: u64,
    pub refresh_timeout_ms: u64,
    pub release_timeout_ms: u64,
    pub token_len: usize,
    pub backoff: BackoffConfig,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            renewal_margin_ms: 1_000,
            retry_interval_ms: 100,
            error_wait_ms: 200,
            set_timeout_ms: 3_000,
            refresh_timeout_ms: 1_000,
            release_timeout_ms: 1_000,
            token_len: crate::token::TOKEN_LEN,
            backoff: BackoffConfig::default(),
        }
    }
}

impl LockConfig {
    ///
    /// Loads the configuration from `<PREFIX>_*` environment variables, falling back to defaults.
    ///
    /// Nested keys use a double underscore: `<PREFIX>_BACKOFF__INITIAL_INTERVAL_MS`.
    ///
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::build(Config::builder(), prefix)
    }

    ///
    /// Same as [`LockConfig::from_env`], with a config file layered under the environment.
    ///
    pub fn load(path: impl AsRef<Path>, prefix: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(File::from(path.as_ref()).required(false));
        Self::build(builder, prefix)
    }

    fn build(
        builder: ConfigBuilder<DefaultState>,
        prefix: &str,
    ) -> Result<Self, ConfigError> {
        builder
            .add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), LockError> {
        let invalid = |msg: &str| Err(LockError::InvalidConfig(msg.to_string()));
        if self.ttl_ms == 0 {
            return invalid("ttl must be strictly positive");
        }
        if self.renewal_margin_ms == 0 || self.renewal_margin_ms >= self.ttl_ms {
            return invalid("renewal margin must be positive and strictly less than the ttl");
        }
        if self.set_timeout_ms == 0 || self.refresh_timeout_ms == 0 || self.release_timeout_ms == 0
        {
            return invalid("store call timeouts must be strictly positive");
        }
        // A refresh issued `ttl - margin` after the previous one must land before the lease ends.
        if self.refresh_timeout_ms > self.renewal_margin_ms {
            return invalid("refresh timeout must not exceed the renewal margin");
        }
        if self.refresh_timeout_ms >= self.ttl_ms - self.renewal_margin_ms {
            return invalid("refresh timeout must be shorter than the renewal interval");
        }
        if self.token_len == 0 {
            return invalid("token length must be strictly positive");
        }
        self.backoff.validate()
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn renewal_margin(&self) -> Duration {
        Duration::from_millis(self.renewal_margin_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn error_wait(&self) -> Duration {
        Duration::from_millis(self.error_wait_ms)
    }

    pub fn set_timeout(&self) -> Duration {
        Duration::from_millis(self.set_timeout_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_should_be_valid() {
        let config = LockConfig::default();
        config.validate().expect("default config is valid");
        assert_eq!(config.ttl(), Duration::from_secs(30));
        assert_eq!(config.ttl() - config.renewal_margin(), Duration::from_secs(29));
        assert_eq!(
            config.backoff.policy().max_elapsed_time,
            Some(Duration::from_secs(15))
        );
    }

    #[test]
    fn renewal_margin_must_be_less_than_ttl() {
        let config = LockConfig {
            ttl_ms: 1_000,
            renewal_margin_ms: 1_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LockError::InvalidConfig(_))));

        let config = LockConfig {
            ttl_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn refresh_timeout_must_fit_in_renewal_margin() {
        let config = LockConfig {
            refresh_timeout_ms: 5_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LockError::InvalidConfig(_))));

        let config = LockConfig {
            refresh_timeout_ms: 1_000,
            renewal_margin_ms: 1_000,
            ..Default::default()
        };
        config.validate().expect("timeout equal to the margin is valid");
    }

    #[test]
    fn backoff_must_be_well_formed() {
        let with_backoff = |backoff| LockConfig {
            backoff,
            ..Default::default()
        };
        for randomization_factor in [f64::NAN, f64::INFINITY, -0.1, 1.5] {
            let config = with_backoff(BackoffConfig {
                randomization_factor,
                ..Default::default()
            });
            assert!(
                config.validate().is_err(),
                "randomization factor {randomization_factor} accepted"
            );
        }
        for growth_factor in [f64::NAN, f64::INFINITY, 0.5] {
            let config = with_backoff(BackoffConfig {
                growth_factor,
                ..Default::default()
            });
            assert!(config.validate().is_err(), "growth factor {growth_factor} accepted");
        }
        let config = with_backoff(BackoffConfig {
            max_interval_ms: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());

        let config = with_backoff(BackoffConfig {
            randomization_factor: 0.0,
            ..Default::default()
        });
        config.validate().expect("no jitter is valid");
    }

    #[test]
    fn nan_jitter_from_env_should_fail_validation() {
        std::env::set_var("KVLOCKNAN_BACKOFF__RANDOMIZATION_FACTOR", "NaN");

        let config = LockConfig::from_env("KVLOCKNAN").expect("config loads");

        assert!(config.backoff.randomization_factor.is_nan());
        assert!(matches!(config.validate(), Err(LockError::InvalidConfig(_))));
    }

    #[test]
    fn zero_budget_means_unbounded() {
        let backoff = BackoffConfig {
            max_elapsed_time_ms: 0,
            ..Default::default()
        };
        assert_eq!(backoff.policy().max_elapsed_time, None);
    }

    #[test]
    fn it_should_load_overrides_from_env() {
        std::env::set_var("KVLOCKTEST_TTL_MS", "5000");
        std::env::set_var("KVLOCKTEST_BACKOFF__INITIAL_INTERVAL_MS", "50");

        let config = LockConfig::from_env("KVLOCKTEST").expect("config loads");

        assert_eq!(config.ttl_ms, 5_000);
        assert_eq!(config.backoff.initial_interval_ms, 50);
        assert_eq!(config.renewal_margin_ms, 1_000);
        assert_eq!(config.backoff.max_elapsed_time_ms, 15_000);
    }
}
