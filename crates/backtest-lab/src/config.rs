use std::{
    env, fmt,
    net::{AddrParseError, Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use runtime::{OrchestratorConfig, DEFAULT_CACHE_BYTES};

const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080));
const DEFAULT_JOB_DB_PATH: &str = "artifacts/jobs.sqlite3";
const DEFAULT_CANDLE_DIR: &str = "data/candles";
const DEFAULT_MAX_COMBINATIONS: usize = 1_000;
const DEFAULT_MAX_ACTIVE_RUNS: usize = 1;
const DEFAULT_HEARTBEAT_MS: u64 = 1_000;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_JOB_EXPIRY_SECS: u64 = 24 * 60 * 60;
const DEFAULT_RESUME_INTERRUPTED: bool = true;

/// `LAB_JOB_DB_PATH` value that keeps run records in memory only.
const MEMORY_STORE: &str = "memory";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub job_db_path: Option<PathBuf>,
    pub candle_dir: PathBuf,
    pub max_combinations: usize,
    pub max_active_runs: usize,
    pub heartbeat_interval: Duration,
    pub job_timeout: Option<Duration>,
    pub job_expiry: Duration,
    pub cache_bytes: usize,
    pub resume_interrupted: bool,
    pub trade_journal_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR,
            job_db_path: Some(PathBuf::from(DEFAULT_JOB_DB_PATH)),
            candle_dir: PathBuf::from(DEFAULT_CANDLE_DIR),
            max_combinations: DEFAULT_MAX_COMBINATIONS,
            max_active_runs: DEFAULT_MAX_ACTIVE_RUNS,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            job_timeout: Some(Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS)),
            job_expiry: Duration::from_secs(DEFAULT_JOB_EXPIRY_SECS),
            cache_bytes: DEFAULT_CACHE_BYTES,
            resume_interrupted: DEFAULT_RESUME_INTERRUPTED,
            trade_journal_dir: None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidListenAddr(AddrParseError),
    InvalidJobDbPath,
    InvalidCandleDir,
    InvalidMaxCombinations,
    InvalidMaxActiveRuns,
    InvalidHeartbeatMs,
    InvalidJobTimeoutSecs,
    InvalidJobExpirySecs,
    InvalidCacheBytes,
    InvalidResumeInterrupted,
    InvalidTradeJournalDir,
    NonUnicodeListenAddr,
    NonUnicodeJobDbPath,
    NonUnicodeCandleDir,
    NonUnicodeMaxCombinations,
    NonUnicodeMaxActiveRuns,
    NonUnicodeHeartbeatMs,
    NonUnicodeJobTimeoutSecs,
    NonUnicodeJobExpirySecs,
    NonUnicodeCacheBytes,
    NonUnicodeResumeInterrupted,
    NonUnicodeTradeJournalDir,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidListenAddr(err) => {
                write!(f, "LAB_SERVER_ADDR is not a valid socket address: {err}")
            }
            Self::InvalidJobDbPath => {
                write!(f, "LAB_JOB_DB_PATH must not be empty or whitespace")
            }
            Self::InvalidCandleDir => {
                write!(f, "LAB_CANDLE_DIR must not be empty or whitespace")
            }
            Self::InvalidMaxCombinations => {
                write!(f, "LAB_MAX_COMBINATIONS must be a positive integer")
            }
            Self::InvalidMaxActiveRuns => {
                write!(f, "LAB_MAX_ACTIVE_RUNS must be a positive integer")
            }
            Self::InvalidHeartbeatMs => {
                write!(f, "LAB_HEARTBEAT_MS must be a non-negative integer")
            }
            Self::InvalidJobTimeoutSecs => {
                write!(f, "LAB_JOB_TIMEOUT_SECS must be a non-negative integer (0 disables it)")
            }
            Self::InvalidJobExpirySecs => {
                write!(f, "LAB_JOB_EXPIRY_SECS must be a positive integer")
            }
            Self::InvalidCacheBytes => {
                write!(f, "LAB_CACHE_BYTES must be a positive integer")
            }
            Self::InvalidResumeInterrupted => {
                write!(f, "LAB_RESUME_INTERRUPTED must be true or false")
            }
            Self::InvalidTradeJournalDir => {
                write!(f, "LAB_TRADE_JOURNAL_DIR must not be empty or whitespace")
            }
            Self::NonUnicodeListenAddr => {
                write!(f, "LAB_SERVER_ADDR contains non-unicode data")
            }
            Self::NonUnicodeJobDbPath => {
                write!(f, "LAB_JOB_DB_PATH contains non-unicode data")
            }
            Self::NonUnicodeCandleDir => {
                write!(f, "LAB_CANDLE_DIR contains non-unicode data")
            }
            Self::NonUnicodeMaxCombinations => {
                write!(f, "LAB_MAX_COMBINATIONS contains non-unicode data")
            }
            Self::NonUnicodeMaxActiveRuns => {
                write!(f, "LAB_MAX_ACTIVE_RUNS contains non-unicode data")
            }
            Self::NonUnicodeHeartbeatMs => {
                write!(f, "LAB_HEARTBEAT_MS contains non-unicode data")
            }
            Self::NonUnicodeJobTimeoutSecs => {
                write!(f, "LAB_JOB_TIMEOUT_SECS contains non-unicode data")
            }
            Self::NonUnicodeJobExpirySecs => {
                write!(f, "LAB_JOB_EXPIRY_SECS contains non-unicode data")
            }
            Self::NonUnicodeCacheBytes => {
                write!(f, "LAB_CACHE_BYTES contains non-unicode data")
            }
            Self::NonUnicodeResumeInterrupted => {
                write!(f, "LAB_RESUME_INTERRUPTED contains non-unicode data")
            }
            Self::NonUnicodeTradeJournalDir => {
                write!(f, "LAB_TRADE_JOURNAL_DIR contains non-unicode data")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidListenAddr(err) => Some(err),
            _ => None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_addr = match env::var("LAB_SERVER_ADDR") {
            Ok(value) => value.parse().map_err(ConfigError::InvalidListenAddr)?,
            Err(env::VarError::NotPresent) => DEFAULT_LISTEN_ADDR,
            Err(env::VarError::NotUnicode(_)) => {
                return Err(ConfigError::NonUnicodeListenAddr);
            }
        };

        let job_db_path = match env::var("LAB_JOB_DB_PATH") {
            Ok(value) if value.trim().is_empty() => {
                return Err(ConfigError::InvalidJobDbPath);
            }
            Ok(value) if value == MEMORY_STORE => None,
            Ok(value) => Some(PathBuf::from(value)),
            Err(env::VarError::NotPresent) => Some(PathBuf::from(DEFAULT_JOB_DB_PATH)),
            Err(env::VarError::NotUnicode(_)) => {
                return Err(ConfigError::NonUnicodeJobDbPath);
            }
        };

        let candle_dir = match env::var("LAB_CANDLE_DIR") {
            Ok(value) => {
                if value.trim().is_empty() {
                    return Err(ConfigError::InvalidCandleDir);
                }
                PathBuf::from(value)
            }
            Err(env::VarError::NotPresent) => PathBuf::from(DEFAULT_CANDLE_DIR),
            Err(env::VarError::NotUnicode(_)) => {
                return Err(ConfigError::NonUnicodeCandleDir);
            }
        };

        let max_combinations = parse_positive_env(
            "LAB_MAX_COMBINATIONS",
            DEFAULT_MAX_COMBINATIONS,
            ConfigError::InvalidMaxCombinations,
            ConfigError::NonUnicodeMaxCombinations,
        )?;

        let max_active_runs = parse_positive_env(
            "LAB_MAX_ACTIVE_RUNS",
            DEFAULT_MAX_ACTIVE_RUNS,
            ConfigError::InvalidMaxActiveRuns,
            ConfigError::NonUnicodeMaxActiveRuns,
        )?;

        let heartbeat_ms = parse_env(
            "LAB_HEARTBEAT_MS",
            DEFAULT_HEARTBEAT_MS,
            ConfigError::InvalidHeartbeatMs,
            ConfigError::NonUnicodeHeartbeatMs,
        )?;

        let job_timeout_secs = parse_env(
            "LAB_JOB_TIMEOUT_SECS",
            DEFAULT_JOB_TIMEOUT_SECS,
            ConfigError::InvalidJobTimeoutSecs,
            ConfigError::NonUnicodeJobTimeoutSecs,
        )?;

        let job_expiry_secs = parse_positive_env(
            "LAB_JOB_EXPIRY_SECS",
            DEFAULT_JOB_EXPIRY_SECS,
            ConfigError::InvalidJobExpirySecs,
            ConfigError::NonUnicodeJobExpirySecs,
        )?;

        let cache_bytes = parse_positive_env(
            "LAB_CACHE_BYTES",
            DEFAULT_CACHE_BYTES,
            ConfigError::InvalidCacheBytes,
            ConfigError::NonUnicodeCacheBytes,
        )?;

        let resume_interrupted = match env::var("LAB_RESUME_INTERRUPTED") {
            Ok(value) => parse_bool(value.as_str()).ok_or(ConfigError::InvalidResumeInterrupted)?,
            Err(env::VarError::NotPresent) => DEFAULT_RESUME_INTERRUPTED,
            Err(env::VarError::NotUnicode(_)) => {
                return Err(ConfigError::NonUnicodeResumeInterrupted);
            }
        };

        let trade_journal_dir = match env::var("LAB_TRADE_JOURNAL_DIR") {
            Ok(value) => {
                if value.trim().is_empty() {
                    return Err(ConfigError::InvalidTradeJournalDir);
                }
                Some(PathBuf::from(value))
            }
            Err(env::VarError::NotPresent) => None,
            Err(env::VarError::NotUnicode(_)) => {
                return Err(ConfigError::NonUnicodeTradeJournalDir);
            }
        };

        Ok(Self {
            listen_addr,
            job_db_path,
            candle_dir,
            max_combinations,
            max_active_runs,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            job_timeout: (job_timeout_secs > 0).then(|| Duration::from_secs(job_timeout_secs)),
            job_expiry: Duration::from_secs(job_expiry_secs),
            cache_bytes,
            resume_interrupted,
            trade_journal_dir,
        })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_combinations: self.max_combinations,
            max_active_runs: self.max_active_runs,
            heartbeat_interval: self.heartbeat_interval,
            execution_timeout: self.job_timeout,
            expiration: self.job_expiry,
            resume_interrupted: self.resume_interrupted,
            journal_dir: self.trade_journal_dir.clone(),
            ..OrchestratorConfig::default()
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn parse_env<T: FromStr>(
    key: &str,
    default_value: T,
    invalid_error: ConfigError,
    non_unicode_error: ConfigError,
) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.trim().parse::<T>().map_err(|_| invalid_error),
        Err(env::VarError::NotPresent) => Ok(default_value),
        Err(env::VarError::NotUnicode(_)) => Err(non_unicode_error),
    }
}

fn parse_positive_env<T: FromStr + PartialOrd + Default>(
    key: &str,
    default_value: T,
    invalid_error: ConfigError,
    non_unicode_error: ConfigError,
) -> Result<T, ConfigError> {
    let zero = T::default();
    match env::var(key) {
        Ok(value) => match value.trim().parse::<T>() {
            Ok(parsed) if parsed > zero => Ok(parsed),
            _ => Err(invalid_error),
        },
        Err(env::VarError::NotPresent) => Ok(default_value),
        Err(env::VarError::NotUnicode(_)) => Err(non_unicode_error),
    }
}

#[cfg(test)]
mod tests {
    use std::{env, path::PathBuf, sync::Mutex, time::Duration};

    use super::{Config, ConfigError};

    static ENV_LOCK: Mutex<()> = Mutex::new(());
    const ENV_ADDR_KEY: &str = "LAB_SERVER_ADDR";
    const ENV_DB_KEY: &str = "LAB_JOB_DB_PATH";
    const ENV_CANDLE_KEY: &str = "LAB_CANDLE_DIR";
    const ENV_COMBINATIONS_KEY: &str = "LAB_MAX_COMBINATIONS";
    const ENV_ACTIVE_KEY: &str = "LAB_MAX_ACTIVE_RUNS";
    const ENV_HEARTBEAT_KEY: &str = "LAB_HEARTBEAT_MS";
    const ENV_TIMEOUT_KEY: &str = "LAB_JOB_TIMEOUT_SECS";
    const ENV_EXPIRY_KEY: &str = "LAB_JOB_EXPIRY_SECS";
    const ENV_CACHE_KEY: &str = "LAB_CACHE_BYTES";
    const ENV_RESUME_KEY: &str = "LAB_RESUME_INTERRUPTED";
    const ENV_JOURNAL_KEY: &str = "LAB_TRADE_JOURNAL_DIR";

    struct EnvVarGuard {
        key: &'static str,
        previous: Option<std::ffi::OsString>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = env::var_os(key);
            env::set_var(key, value);
            Self { key, previous }
        }

        fn unset(key: &'static str) -> Self {
            let previous = env::var_os(key);
            env::remove_var(key);
            Self { key, previous }
        }

        #[cfg(unix)]
        fn set_os(key: &'static str, value: std::ffi::OsString) -> Self {
            let previous = env::var_os(key);
            env::set_var(key, value);
            Self { key, previous }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.previous.take() {
                Some(value) => env::set_var(self.key, value),
                None => env::remove_var(self.key),
            }
        }
    }

    fn reset_config_env_baseline() -> [EnvVarGuard; 11] {
        [
            EnvVarGuard::unset(ENV_ADDR_KEY),
            EnvVarGuard::unset(ENV_DB_KEY),
            EnvVarGuard::unset(ENV_CANDLE_KEY),
            EnvVarGuard::unset(ENV_COMBINATIONS_KEY),
            EnvVarGuard::unset(ENV_ACTIVE_KEY),
            EnvVarGuard::unset(ENV_HEARTBEAT_KEY),
            EnvVarGuard::unset(ENV_TIMEOUT_KEY),
            EnvVarGuard::unset(ENV_EXPIRY_KEY),
            EnvVarGuard::unset(ENV_CACHE_KEY),
            EnvVarGuard::unset(ENV_RESUME_KEY),
            EnvVarGuard::unset(ENV_JOURNAL_KEY),
        ]
    }

    #[test]
    fn defaults_when_env_is_unset() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _baseline = reset_config_env_baseline();

        let config = Config::from_env().unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.job_db_path, Some(PathBuf::from("artifacts/jobs.sqlite3")));
        assert_eq!(config.max_combinations, 1_000);
        assert_eq!(config.max_active_runs, 1);
        assert_eq!(config.job_timeout, Some(Duration::from_secs(1_800)));
        assert!(config.resume_interrupted);
        assert_eq!(config.trade_journal_dir, None);
    }

    #[test]
    fn uses_listen_address_override_from_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _baseline = reset_config_env_baseline();
        let _guard = EnvVarGuard::set(ENV_ADDR_KEY, "127.0.0.1:9090");

        let config = Config::from_env().unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9090".parse().unwrap());
    }

    #[test]
    fn returns_error_for_invalid_listen_address_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _baseline = reset_config_env_baseline();
        let _guard = EnvVarGuard::set(ENV_ADDR_KEY, "not-an-addr");

        let err = Config::from_env().unwrap_err();

        assert!(matches!(err, ConfigError::InvalidListenAddr(_)));
    }

    #[test]
    fn memory_keyword_disables_the_job_database() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _baseline = reset_config_env_baseline();
        let _guard = EnvVarGuard::set(ENV_DB_KEY, "memory");

        let config = Config::from_env().unwrap();

        assert_eq!(config.job_db_path, None);
    }

    #[test]
    fn returns_error_for_whitespace_paths() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _baseline = reset_config_env_baseline();

        {
            let _guard = EnvVarGuard::set(ENV_DB_KEY, "  ");
            assert!(matches!(Config::from_env().unwrap_err(), ConfigError::InvalidJobDbPath));
        }
        {
            let _guard = EnvVarGuard::set(ENV_CANDLE_KEY, "");
            assert!(matches!(Config::from_env().unwrap_err(), ConfigError::InvalidCandleDir));
        }
        {
            let _guard = EnvVarGuard::set(ENV_JOURNAL_KEY, " ");
            assert!(matches!(
                Config::from_env().unwrap_err(),
                ConfigError::InvalidTradeJournalDir
            ));
        }
    }

    #[test]
    fn uses_numeric_overrides_from_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _baseline = reset_config_env_baseline();
        let _combinations = EnvVarGuard::set(ENV_COMBINATIONS_KEY, "50");
        let _active = EnvVarGuard::set(ENV_ACTIVE_KEY, "4");
        let _heartbeat = EnvVarGuard::set(ENV_HEARTBEAT_KEY, "250");
        let _expiry = EnvVarGuard::set(ENV_EXPIRY_KEY, "60");
        let _cache = EnvVarGuard::set(ENV_CACHE_KEY, "1048576");

        let config = Config::from_env().unwrap();

        assert_eq!(config.max_combinations, 50);
        assert_eq!(config.max_active_runs, 4);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.job_expiry, Duration::from_secs(60));
        assert_eq!(config.cache_bytes, 1_048_576);

        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.max_combinations, 50);
        assert_eq!(orchestrator.max_active_runs, 4);
        assert_eq!(orchestrator.expiration, Duration::from_secs(60));
    }

    #[test]
    fn zero_timeout_disables_the_wall_clock_limit() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _baseline = reset_config_env_baseline();
        let _guard = EnvVarGuard::set(ENV_TIMEOUT_KEY, "0");

        let config = Config::from_env().unwrap();

        assert_eq!(config.job_timeout, None);
        assert_eq!(config.orchestrator_config().execution_timeout, None);
    }

    #[test]
    fn returns_error_for_zero_or_garbage_counts() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _baseline = reset_config_env_baseline();

        {
            let _guard = EnvVarGuard::set(ENV_ACTIVE_KEY, "0");
            assert!(matches!(Config::from_env().unwrap_err(), ConfigError::InvalidMaxActiveRuns));
        }
        {
            let _guard = EnvVarGuard::set(ENV_COMBINATIONS_KEY, "-3");
            assert!(matches!(
                Config::from_env().unwrap_err(),
                ConfigError::InvalidMaxCombinations
            ));
        }
        {
            let _guard = EnvVarGuard::set(ENV_HEARTBEAT_KEY, "soon");
            assert!(matches!(Config::from_env().unwrap_err(), ConfigError::InvalidHeartbeatMs));
        }
    }

    #[test]
    fn parses_resume_flag() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _baseline = reset_config_env_baseline();

        {
            let _guard = EnvVarGuard::set(ENV_RESUME_KEY, "false");
            assert!(!Config::from_env().unwrap().resume_interrupted);
        }
        {
            let _guard = EnvVarGuard::set(ENV_RESUME_KEY, "yes");
            assert!(matches!(
                Config::from_env().unwrap_err(),
                ConfigError::InvalidResumeInterrupted
            ));
        }
    }

    #[test]
    fn uses_trade_journal_override_from_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _baseline = reset_config_env_baseline();
        let _guard = EnvVarGuard::set(ENV_JOURNAL_KEY, "artifacts/journals");

        let config = Config::from_env().unwrap();

        assert_eq!(config.trade_journal_dir, Some(PathBuf::from("artifacts/journals")));
        assert_eq!(
            config.orchestrator_config().journal_dir,
            Some(PathBuf::from("artifacts/journals"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn returns_error_for_non_unicode_env_vars() {
        use std::os::unix::ffi::OsStringExt;

        let _lock = ENV_LOCK.lock().unwrap();
        let _baseline = reset_config_env_baseline();

        {
            let _guard = EnvVarGuard::set_os(
                ENV_ADDR_KEY,
                std::ffi::OsString::from_vec(vec![0x66, 0x6f, 0x80]),
            );
            assert!(matches!(Config::from_env().unwrap_err(), ConfigError::NonUnicodeListenAddr));
        }
        {
            let _guard = EnvVarGuard::set_os(
                ENV_CANDLE_KEY,
                std::ffi::OsString::from_vec(vec![0x66, 0x6f, 0x80]),
            );
            assert!(matches!(Config::from_env().unwrap_err(), ConfigError::NonUnicodeCandleDir));
        }
        {
            let _guard = EnvVarGuard::set_os(
                ENV_CACHE_KEY,
                std::ffi::OsString::from_vec(vec![0x66, 0x6f, 0x80]),
            );
            assert!(matches!(Config::from_env().unwrap_err(), ConfigError::NonUnicodeCacheBytes));
        }
    }
}
