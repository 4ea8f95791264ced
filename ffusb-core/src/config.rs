use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Bytes per bulk write while streaming a file to printer storage
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Tunables for a printer connection
///
/// All durations are stored as milliseconds so the struct maps directly onto a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConnectionConfig {
    /// Maximum wait for a complete response block
    pub read_timeout_ms: u64,
    /// Maximum wait for a single bulk write
    pub write_timeout_ms: u64,
    /// Period of the keep-alive scheduler
    pub keepalive_tick_ms: u64,
    /// Ticks between keep-alive status polls
    pub status_poll_ticks: u32,
    /// Temperature report period armed while the printer waits on heaters, in seconds
    pub wait_temp_report_secs: u32,
    /// Upload chunk size in bytes
    pub chunk_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            keepalive_tick_ms: 500,
            status_poll_ticks: 6,
            wait_temp_report_secs: 2,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn keepalive_tick(&self) -> Duration {
        Duration::from_millis(self.keepalive_tick_ms.max(1))
    }

    /// Number of keep-alive ticks spanning `secs` seconds, never less than one
    pub fn ticks_for_secs(&self, secs: u32) -> u32 {
        if secs == 0 {
            return 0;
        }
        let ticks = u64::from(secs) * 1000 / self.keepalive_tick_ms.max(1);
        u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
    }

    /// Chunk size clamped to what a single bulk transfer should carry
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.clamp(64, 4096)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tick_conversion() {
        let config = ConnectionConfig::default();
        assert_eq!(config.ticks_for_secs(0), 0);
        assert_eq!(config.ticks_for_secs(2), 4);
        let coarse = ConnectionConfig {
            keepalive_tick_ms: 5000,
            ..Default::default()
        };
        assert_eq!(coarse.ticks_for_secs(1), 1);
    }

    #[test]
    fn chunk_size_is_bounded() {
        let config = ConnectionConfig {
            chunk_size: 1 << 20,
            ..Default::default()
        };
        assert_eq!(config.chunk_size(), 4096);
        assert_eq!(ConnectionConfig::default().chunk_size(), 1024);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn missing_fields_use_defaults() {
        use serde::de::value::{Error as ValueError, MapDeserializer};

        let pairs = vec![("read_timeout_ms", 250u64)];
        let deserializer: MapDeserializer<'_, _, ValueError> =
            MapDeserializer::new(pairs.into_iter());
        let config = ConnectionConfig::deserialize(deserializer).unwrap();
        assert_eq!(config.read_timeout(), Duration::from_millis(250));
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }
}
