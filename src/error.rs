// ============================================================================
// ERRORS – one taxonomy for cache, compositor and store failures
// ============================================================================

/// Error type for every fallible layer-cache operation.
#[derive(Debug)]
pub enum CacheError {
    /// A tile image is absent from the cache, the spill store and the archive.
    NotFound(String),
    /// An identifier exceeds the store's constraints. Raised before any mutation.
    InvalidName(String),
    /// I/O failure while writing back or saving.
    Persistence(String),
    /// A backing blob exists but could not be decoded into a tile image.
    ImageLoad { name: String, msg: String },
    /// A shift that is not a whole number of Full-level blocks.
    MisalignedShift { dx: i64, dy: i64 },
    /// A shift that would move populated tiles below the grid origin.
    ShiftOutOfBounds { dx: i64, dy: i64 },
    /// A pack file or manifest with a bad header or impossible contents.
    InvalidFormat(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::NotFound(name) => write!(f, "Tile image '{}' not found", name),
            CacheError::InvalidName(name) => write!(f, "Invalid tile name '{}'", name),
            CacheError::Persistence(e) => write!(f, "Persistence error: {}", e),
            CacheError::ImageLoad { name, msg } => {
                write!(f, "Failed to load tile image '{}': {}", name, msg)
            }
            CacheError::MisalignedShift { dx, dy } => write!(
                f,
                "Shift ({}, {}) is not a multiple of the block size",
                dx, dy
            ),
            CacheError::ShiftOutOfBounds { dx, dy } => write!(
                f,
                "Shift ({}, {}) would move tiles to negative block indices",
                dx, dy
            ),
            CacheError::InvalidFormat(e) => write!(f, "Invalid format: {}", e),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Persistence(e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for CacheError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        CacheError::InvalidFormat(e.to_string())
    }
}

impl CacheError {
    /// Wrap a decode failure for the named blob.
    pub fn image_load(name: &str, e: image::ImageError) -> Self {
        CacheError::ImageLoad {
            name: name.to_string(),
            msg: e.to_string(),
        }
    }
}
