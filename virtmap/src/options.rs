use std::path::PathBuf;

/// Options when opening a [`crate::VirtualMap`] instance.
pub struct Options {
    /// The path to the directory where the map's record files are stored.
    pub(crate) path: PathBuf,
    /// The number of tree ranks batched into one hash-chunk record.
    pub(crate) chunk_height: u32,
    /// The initial key-index bucket count. Must be a power of two.
    pub(crate) initial_buckets: usize,
    /// Entries per bucket above which the key index doubles its bucket count.
    pub(crate) bucket_split_threshold: usize,
    /// The soft maximum size of one record-store file.
    pub(crate) max_store_file_size: u64,
}

impl Options {
    /// Create a new `Options` instance with the default values.
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("virtmap_db"),
            chunk_height: 3,
            initial_buckets: 256,
            bucket_split_threshold: 32,
            max_store_file_size: 64 << 20,
        }
    }

    /// Set the path to the directory where the map's record files are stored.
    pub fn path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    /// Set the number of tree ranks batched per hash-chunk record.
    ///
    /// May not be zero. Default: 3.
    pub fn chunk_height(&mut self, chunk_height: u32) {
        assert!(chunk_height > 0);
        self.chunk_height = chunk_height;
    }

    /// Set the initial key-index bucket count.
    ///
    /// Must be a power of two. Default: 256.
    pub fn initial_buckets(&mut self, initial_buckets: usize) {
        assert!(initial_buckets.is_power_of_two());
        self.initial_buckets = initial_buckets;
    }

    /// Set the per-bucket entry count that triggers a key-index resize.
    ///
    /// May not be zero. Default: 32.
    pub fn bucket_split_threshold(&mut self, bucket_split_threshold: usize) {
        assert!(bucket_split_threshold > 0);
        self.bucket_split_threshold = bucket_split_threshold;
    }

    /// Set the soft maximum size of one record-store file.
    ///
    /// Default: 64 MiB.
    pub fn max_store_file_size(&mut self, max_store_file_size: u64) {
        self.max_store_file_size = max_store_file_size;
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
