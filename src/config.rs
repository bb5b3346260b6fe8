//! Store configuration parsed from environment variables.
//!
//! Three knobs control the stream manager: the rotation threshold the front-end
//! compares against [`crate::Db::offset`], the number of consensus log entries kept
//! behind the snapshot taken at rotation, and the physical block width used to frame
//! the event region of each stream file.

/// Default rotation threshold in bytes (512 MiB).
pub const DEFAULT_ROTATE_THRESHOLD: u64 = 536_870_912;

/// Default number of commits retained behind the snapshot index.
pub const DEFAULT_SNAPSHOT_BUFFER: u64 = 500;

/// Default physical block payload width in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Tunable parameters for a [`crate::Db`].
///
/// # Environment Variables
///
/// | Variable                    | Required | Default       | Description                          |
/// |-----------------------------|----------|---------------|--------------------------------------|
/// | `TIDELOG_ROTATE_THRESHOLD`  | No       | `536870912`   | Bytes before a rotate should be cut  |
/// | `TIDELOG_SNAPSHOT_BUFFER`   | No       | `500`         | Commits kept behind the snapshot     |
/// | `TIDELOG_BLOCK_SIZE`        | No       | `4096`        | Block payload width in bytes         |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Byte size past which the front-end should issue a rotate for the live stream.
    pub rotate_threshold: u64,
    /// Commits retained behind the snapshot index taken during rotation.
    pub snapshot_buffer: u64,
    /// Physical block payload width used by the block codec.
    pub block_size: usize,
}

impl Default for DbConfig {
    fn default() -> DbConfig {
        DbConfig {
            rotate_threshold: DEFAULT_ROTATE_THRESHOLD,
            snapshot_buffer: DEFAULT_SNAPSHOT_BUFFER,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl DbConfig {
    /// Parse configuration from environment variables, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` if a variable is set but does not parse as the expected
    /// integer type, or if `TIDELOG_BLOCK_SIZE` is zero.
    pub fn from_env() -> Result<DbConfig, String> {
        let rotate_threshold = match std::env::var("TIDELOG_ROTATE_THRESHOLD") {
            Ok(val) => val
                .parse::<u64>()
                .map_err(|e| format!("TIDELOG_ROTATE_THRESHOLD is not a valid u64: {e}"))?,
            Err(_) => DEFAULT_ROTATE_THRESHOLD,
        };

        let snapshot_buffer = match std::env::var("TIDELOG_SNAPSHOT_BUFFER") {
            Ok(val) => val
                .parse::<u64>()
                .map_err(|e| format!("TIDELOG_SNAPSHOT_BUFFER is not a valid u64: {e}"))?,
            Err(_) => DEFAULT_SNAPSHOT_BUFFER,
        };

        let block_size = match std::env::var("TIDELOG_BLOCK_SIZE") {
            Ok(val) => val
                .parse::<usize>()
                .map_err(|e| format!("TIDELOG_BLOCK_SIZE is not a valid usize: {e}"))?,
            Err(_) => DEFAULT_BLOCK_SIZE,
        };

        if block_size == 0 {
            return Err("TIDELOG_BLOCK_SIZE must be greater than zero".to_string());
        }

        Ok(DbConfig {
            rotate_threshold,
            snapshot_buffer,
            block_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn from_env_defaults_when_nothing_set() {
        // SAFETY: serial test -- no concurrent env mutation.
        unsafe { std::env::remove_var("TIDELOG_ROTATE_THRESHOLD") };
        unsafe { std::env::remove_var("TIDELOG_SNAPSHOT_BUFFER") };
        unsafe { std::env::remove_var("TIDELOG_BLOCK_SIZE") };

        let config = DbConfig::from_env().expect("defaults should parse");
        assert_eq!(config, DbConfig::default());
    }

    #[test]
    #[serial]
    fn from_env_custom_values() {
        // SAFETY: serial test -- no concurrent env mutation.
        unsafe { std::env::set_var("TIDELOG_ROTATE_THRESHOLD", "1024") };
        unsafe { std::env::set_var("TIDELOG_SNAPSHOT_BUFFER", "7") };
        unsafe { std::env::set_var("TIDELOG_BLOCK_SIZE", "64") };

        let config = DbConfig::from_env().expect("custom values should parse");
        assert_eq!(config.rotate_threshold, 1024);
        assert_eq!(config.snapshot_buffer, 7);
        assert_eq!(config.block_size, 64);

        unsafe { std::env::remove_var("TIDELOG_ROTATE_THRESHOLD") };
        unsafe { std::env::remove_var("TIDELOG_SNAPSHOT_BUFFER") };
        unsafe { std::env::remove_var("TIDELOG_BLOCK_SIZE") };
    }

    #[test]
    #[serial]
    fn from_env_invalid_threshold_returns_err() {
        // SAFETY: serial test -- no concurrent env mutation.
        unsafe { std::env::set_var("TIDELOG_ROTATE_THRESHOLD", "not-a-number") };

        let result = DbConfig::from_env();
        assert!(result.is_err(), "expected Err for invalid threshold");
        assert!(result.unwrap_err().contains("TIDELOG_ROTATE_THRESHOLD"));

        unsafe { std::env::remove_var("TIDELOG_ROTATE_THRESHOLD") };
    }

    #[test]
    #[serial]
    fn from_env_zero_block_size_returns_err() {
        // SAFETY: serial test -- no concurrent env mutation.
        unsafe { std::env::set_var("TIDELOG_BLOCK_SIZE", "0") };

        let result = DbConfig::from_env();
        assert!(result.is_err(), "expected Err for zero block size");

        unsafe { std::env::remove_var("TIDELOG_BLOCK_SIZE") };
    }
}
