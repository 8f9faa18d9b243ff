//! Types for global one-time configuration of the runtime parameters used by
//! the reclamation scheme.

// Brings in `const SCAN_THRESHOLD: u32`, generated by build.rs from the
// `HAZPTR_SCAN_THRESHOLD` environment variable (default 100 if unset).
include!(concat!(env!("OUT_DIR"), "/build_constants.rs"));

const DEFAULT_INIT_CACHE: usize = 128;
const DEFAULT_MIN_REQUIRED_RECORDS: u32 = 0;
const DEFAULT_SCAN_THRESHOLD: u32 = SCAN_THRESHOLD;

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConfigError
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An error produced by [`ConfigBuilder::try_build`] for a combination of
/// parameters that the reclamation scheme cannot run with.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// The scan threshold was explicitly set to `0` outside of a debug build,
    /// which would force a scan on every single retirement.
    #[error("scan threshold must be greater than 0")]
    ZeroScanThreshold,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Runtime configuration parameters.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    init_cache: usize,
    min_required_records: u32,
    scan_threshold: u32,
}

/********** impl Default **************************************************************************/

impl Default for Config {
    #[inline]
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/********** impl inherent *************************************************************************/

impl Config {
    /// Creates a new [`Config`] with the given parameters.
    ///
    /// # Panics
    ///
    /// Panics if `scan_threshold` is 0. See [`ConfigBuilder::try_build`] for
    /// a non-panicking alternative.
    #[inline]
    pub fn with_params(init_cache: usize, min_required_records: u32, scan_threshold: u32) -> Self {
        assert!(scan_threshold > 0, "scan threshold must be greater than 0");
        Self { init_cache, min_required_records, scan_threshold }
    }

    /// Returns the initial cache size for newly spawned threads.
    #[inline]
    pub fn init_cache(&self) -> usize {
        self.init_cache
    }

    /// Returns the minimum amount of retired records that is required, before
    /// an attempt at reclaiming records is initiated.
    #[inline]
    pub fn min_required_records(&self) -> u32 {
        self.min_required_records
    }

    /// Returns the scan threshold.
    ///
    /// Every retired record counts towards this threshold. Once it is
    /// reached, an attempt is made to reclaim records. Debug builds force
    /// this to `0` regardless of the configured value, for eager reclamation
    /// during testing.
    #[inline]
    pub fn scan_threshold(&self) -> u32 {
        if cfg!(debug_assertions) {
            0
        } else {
            self.scan_threshold
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConfigBuilder
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A builder type for gradually initializing a [`Config`].
///
/// This is mainly useful for keeping stability, in case the internal
/// structure of the [`Config`] type changes in the future, e.g. because
/// further parameters are added.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConfigBuilder {
    init_cache: Option<usize>,
    min_required_records: Option<u32>,
    scan_threshold: Option<u32>,
}

impl ConfigBuilder {
    /// Creates a new [`ConfigBuilder`] with default values.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial size of the cache for retired records of each newly
    /// created thread.
    ///
    /// If this is set to e.g. 0, retiring the first record will require the
    /// allocation of memory by the internally used data structure.
    #[inline]
    pub fn init_cache(mut self, init_cache: usize) -> Self {
        self.init_cache = Some(init_cache);
        self
    }

    /// Sets the minimum amount of records that must have been retired by a
    /// thread, before the thread may attempt to reclaim any memory.
    #[inline]
    pub fn min_required_records(mut self, min_required_records: u32) -> Self {
        self.min_required_records = Some(min_required_records);
        self
    }

    /// Sets the scan threshold.
    #[inline]
    pub fn scan_threshold(mut self, scan_threshold: u32) -> Self {
        self.scan_threshold = Some(scan_threshold);
        self
    }

    /// Consumes the [`ConfigBuilder`] and returns an initialized [`Config`].
    ///
    /// Unspecified parameters are initialized with their default values.
    ///
    /// # Panics
    ///
    /// Panics if `scan_threshold` was explicitly set to `0`. Use
    /// [`try_build`](Self::try_build) to handle this without panicking.
    #[inline]
    pub fn build(self) -> Config {
        self.try_build().expect("invalid configuration")
    }

    /// Consumes the [`ConfigBuilder`] and returns an initialized [`Config`],
    /// or a [`ConfigError`] if the requested combination of parameters is
    /// invalid.
    #[inline]
    pub fn try_build(self) -> Result<Config, ConfigError> {
        let scan_threshold = self.scan_threshold.unwrap_or(DEFAULT_SCAN_THRESHOLD);
        if scan_threshold == 0 {
            return Err(ConfigError::ZeroScanThreshold);
        }

        Ok(Config {
            init_cache: self.init_cache.unwrap_or(DEFAULT_INIT_CACHE),
            min_required_records: self.min_required_records.unwrap_or(DEFAULT_MIN_REQUIRED_RECORDS),
            scan_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.init_cache(), DEFAULT_INIT_CACHE);
        assert_eq!(config.min_required_records(), DEFAULT_MIN_REQUIRED_RECORDS);
    }

    #[test]
    fn zero_scan_threshold_is_rejected() {
        let err = ConfigBuilder::new().scan_threshold(0).try_build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroScanThreshold);
    }
}
