//! Database open options.
//!
//! Mirrors the teacher's `DBBuilder`, generalized to every key spec.md §6
//! names. All fields are optional at the API surface; `Options::default()`
//! matches the spec's documented defaults.

/// Default cache capacity, in pages. Must be large enough to hold the
/// maximum simultaneous pin set (tree height * 2, plus overflow chains);
/// 4096 pages comfortably covers that for any tree this store can build in
/// memory.
pub const DEFAULT_CACHE_POOL_PAGE_COUNT: usize = 4096;

/// Default WAL size threshold (bytes) that marks a checkpoint as needed at
/// the next transaction boundary.
pub const DEFAULT_MAX_WAL_SIZE: u64 = 64 * 1024 * 1024;

/// Minimum allowed page size. Below this the slotted-page header and two
/// slots don't fit a single page, which the spec requires the first
/// non-overflow record to fit.
pub const MIN_PAGE_SIZE: u32 = 512;

#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) page_size: u32,
    pub(crate) cache_pool_page_count: usize,
    pub(crate) max_wal_size: u64,
    pub(crate) sync: bool,
    pub(crate) read_only: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: page_size::get() as u32,
            cache_pool_page_count: DEFAULT_CACHE_POOL_PAGE_COUNT,
            max_wal_size: DEFAULT_MAX_WAL_SIZE,
            sync: false,
            read_only: false,
        }
    }
}

impl Options {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder(Options::default())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn sync(&self) -> bool {
        self.sync
    }
}

/// Builder for [`Options`]. Validates `page_size` is a power of two and at
/// least [`MIN_PAGE_SIZE`] when the database is built, not at each setter
/// call, so intermediate states never need to be valid.
#[derive(Debug, Clone)]
pub struct OptionsBuilder(Options);

impl OptionsBuilder {
    pub fn page_size(mut self, size: u32) -> Self {
        self.0.page_size = size;
        self
    }

    pub fn cache_pool_page_count(mut self, count: usize) -> Self {
        self.0.cache_pool_page_count = count;
        self
    }

    pub fn max_wal_size(mut self, size: u64) -> Self {
        self.0.max_wal_size = size;
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.0.sync = sync;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.0.read_only = read_only;
        self
    }

    pub fn build(self) -> crate::error::Result<Options> {
        let page_size = self.0.page_size;
        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(crate::error::RoltError::InvalidArgument(format!(
                "page_size {} must be a power of two >= {}",
                page_size, MIN_PAGE_SIZE
            )));
        }
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoltError;

    #[test]
    fn defaults_match_documented_values() {
        let options = Options::default();
        assert_eq!(options.cache_pool_page_count, DEFAULT_CACHE_POOL_PAGE_COUNT);
        assert_eq!(options.max_wal_size, DEFAULT_MAX_WAL_SIZE);
        assert!(!options.sync());
        assert!(!options.read_only());
    }

    #[test]
    fn builder_overrides_take_effect() {
        let options = Options::builder()
            .page_size(8192)
            .sync(true)
            .read_only(true)
            .max_wal_size(1024)
            .cache_pool_page_count(10)
            .build()
            .unwrap();
        assert_eq!(options.page_size(), 8192);
        assert!(options.sync());
        assert!(options.read_only());
        assert_eq!(options.max_wal_size, 1024);
        assert_eq!(options.cache_pool_page_count, 10);
    }

    #[test]
    fn build_rejects_non_power_of_two_page_size() {
        let err = Options::builder().page_size(4000).build().unwrap_err();
        assert!(matches!(err, RoltError::InvalidArgument(_)));
    }

    #[test]
    fn build_rejects_page_size_below_minimum() {
        let err = Options::builder().page_size(256).build().unwrap_err();
        assert!(matches!(err, RoltError::InvalidArgument(_)));
    }
}
