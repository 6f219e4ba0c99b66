//! System-wide constants and defaults.

use std::time::Duration;

/// Base descriptor file names probed, in order, when none is given.
pub const DEFAULT_DESCRIPTOR_FILES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Override descriptor file names probed, in order, after the base file.
pub const DEFAULT_OVERRIDE_FILES: [&str; 4] = [
    "compose.override.yaml",
    "compose.override.yml",
    "docker-compose.override.yaml",
    "docker-compose.override.yml",
];

/// Environment file read from the project directory when none is given.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Default interval between health probes.
pub const DEFAULT_HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default timeout for a single health probe.
pub const DEFAULT_HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default consecutive failures before a service is marked unhealthy.
pub const DEFAULT_HEALTHCHECK_RETRIES: u32 = 3;

/// Default grace period before health failures count.
pub const DEFAULT_HEALTHCHECK_START_PERIOD: Duration = Duration::ZERO;

/// Default global startup timeout for `up`.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Default time a service is given to stop before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Default pause before a requeued service is started again.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Exit code for success.
pub const EXIT_OK: u8 = 0;

/// Exit code for load, merge, interpolation, or validation failures.
pub const EXIT_VALIDATION: u8 = 1;

/// Exit code for a cyclic dependency graph.
pub const EXIT_CYCLE: u8 = 2;

/// Exit code when services never reached their required state.
pub const EXIT_STARTUP_TIMEOUT: u8 = 3;

/// Environment variable overriding the startup timeout, in seconds.
pub const ENV_STARTUP_TIMEOUT: &str = "STACKSEQ_STARTUP_TIMEOUT";

/// Environment variable overriding the stop grace period, in seconds.
pub const ENV_STOP_GRACE: &str = "STACKSEQ_STOP_GRACE";

/// Application name used in CLI output.
pub const APP_NAME: &str = "stackseq";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "stackseq";
