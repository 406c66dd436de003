//! Environment-driven settings shared by the API and worker binaries.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::{DEFAULT_JOB_TTL, QueueConfig};
use crate::rate_limit::RateLimitPolicy;
use crate::sandbox::SandboxConfig;
use crate::store::KeySpace;
use crate::worker::WorkerConfig;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_API_PORT: u16 = 8080;
pub const DEFAULT_WORKER_PORT: u16 = 3001;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: String,
    pub api_addr: SocketAddr,
    pub worker_addr: SocketAddr,
    pub queue: QueueConfig,
    pub rate_limit: RateLimitPolicy,
    pub worker: WorkerConfig,
    pub sandbox: SandboxConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let namespace = env.string("TEXFORGE_NAMESPACE", crate::store::keys::DEFAULT_NAMESPACE);
        let queue = QueueConfig {
            keys: KeySpace::new(namespace),
            job_ttl: env.secs("JOB_TTL_SECS", DEFAULT_JOB_TTL)?,
        };

        let rate_limit = RateLimitPolicy::new(
            env.parse("RATE_LIMIT_MAX_REQUESTS", crate::rate_limit::DEFAULT_MAX_REQUESTS)?,
            env.secs("RATE_LIMIT_WINDOW_SECS", crate::rate_limit::DEFAULT_WINDOW)?,
        );

        let defaults = WorkerConfig::default();
        let compile_timeout = env.millis("COMPILE_TIMEOUT_MS", defaults.compile.timeout)?;
        let worker = WorkerConfig {
            pop_timeout: env.secs("WORKER_POP_TIMEOUT_SECS", defaults.pop_timeout)?,
            processing_timeout: env.secs("WORKER_PROCESSING_TIMEOUT_SECS", defaults.processing_timeout)?,
            compile: defaults
                .compile
                .with_timeout(compile_timeout),
            ..defaults
        };

        let base = SandboxConfig::default();
        let sandbox = SandboxConfig {
            docker_bin: PathBuf::from(env.string("SANDBOX_DOCKER_BIN", "docker")),
            image: env.string("SANDBOX_IMAGE", &base.image),
            work_root: env
                .get("SANDBOX_WORK_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| base.work_root.clone()),
            network: env.string("SANDBOX_NETWORK", &base.network),
            memory: env.string("SANDBOX_MEMORY", &base.memory),
            cpus: env.string("SANDBOX_CPUS", &base.cpus),
            pids_limit: env.parse("SANDBOX_PIDS_LIMIT", base.pids_limit)?,
        };

        Ok(Self {
            redis_url: env.string("REDIS_URL", DEFAULT_REDIS_URL),
            api_addr: env.parse("API_ADDR", SocketAddr::from(([0, 0, 0, 0], DEFAULT_API_PORT)))?,
            worker_addr: env.parse(
                "WORKER_ADDR",
                SocketAddr::from(([0, 0, 0, 0], DEFAULT_WORKER_PORT)),
            )?,
            queue,
            rate_limit,
            worker,
            sandbox,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank variables both mean "use the default".
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let secs = self.parse(key, default.as_secs())?;
        if secs == 0 {
            return Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
                reason: "must be at least 1 second".to_string(),
            });
        }
        Ok(Duration::from_secs(secs))
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        let ms = self.parse(key, default_ms)?;
        if ms == 0 {
            return Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
                reason: "must be at least 1 millisecond".to_string(),
            });
        }
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(s.api_addr.port(), 8080);
        assert_eq!(s.worker_addr.port(), 3001);
        assert_eq!(s.queue.keys.namespace(), "latex");
        assert_eq!(s.queue.job_ttl, Duration::from_secs(86_400));
        assert_eq!(s.rate_limit, RateLimitPolicy::new(10, Duration::from_secs(60)));
        assert_eq!(s.worker.pop_timeout, Duration::from_secs(5));
        assert_eq!(s.worker.processing_timeout, Duration::from_secs(300));
        assert_eq!(s.worker.compile.timeout, Duration::from_millis(90_000));
        assert_eq!(s.sandbox.image, "dxjoke/tectonic-docker:latest");
        assert_eq!(s.sandbox.pids_limit, 256);
    }

    #[test]
    fn overrides_are_parsed() {
        let s = settings(&[
            ("TEXFORGE_NAMESPACE", "staging"),
            ("RATE_LIMIT_MAX_REQUESTS", "3"),
            ("RATE_LIMIT_WINDOW_SECS", "10"),
            ("COMPILE_TIMEOUT_MS", "1500"),
            ("SANDBOX_NETWORK", "none"),
            ("API_ADDR", "127.0.0.1:9000"),
        ])
        .unwrap();
        assert_eq!(s.queue.keys.queue(), "staging:compilation:queue");
        assert_eq!(s.rate_limit, RateLimitPolicy::new(3, Duration::from_secs(10)));
        assert_eq!(s.worker.compile.timeout, Duration::from_millis(1500));
        assert_eq!(s.sandbox.network, "none");
        assert_eq!(s.api_addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = settings(&[("RATE_LIMIT_MAX_REQUESTS", "ten")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "RATE_LIMIT_MAX_REQUESTS", .. }));

        assert!(settings(&[("JOB_TTL_SECS", "0")]).is_err());
        let err = settings(&[("COMPILE_TIMEOUT_MS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "COMPILE_TIMEOUT_MS", .. }));
        assert!(settings(&[("API_ADDR", "not-an-addr")]).is_err());
    }
}
