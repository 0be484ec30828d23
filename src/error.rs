#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortError {
    ArenaExceedsCeiling {
        requested_bytes: usize,
        ceiling_bytes: usize,
    },
    ArenaSizeOverflow {
        region: &'static str,
    },
    InvalidDistanceMapRange {
        value: u32,
    },
    KeyBufferSizeMismatch {
        expected_bytes: usize,
        actual_bytes: usize,
    },
    SceneIndexCountMismatch {
        expected: usize,
        actual: usize,
    },
    TooManySceneTransforms {
        count: usize,
        max: usize,
    },
    WorkerUnavailable,
}

impl std::fmt::Display for SortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArenaExceedsCeiling {
                requested_bytes,
                ceiling_bytes,
            } => write!(
                f,
                "sort arena of {requested_bytes} bytes exceeds the {ceiling_bytes}-byte ceiling"
            ),
            Self::ArenaSizeOverflow { region } => {
                write!(f, "sort arena size overflow while sizing {region}")
            }
            Self::InvalidDistanceMapRange { value } => write!(
                f,
                "distance map range must be a non-zero power of two, got {value}"
            ),
            Self::KeyBufferSizeMismatch {
                expected_bytes,
                actual_bytes,
            } => write!(
                f,
                "depth key buffer is {actual_bytes} bytes, expected {expected_bytes}"
            ),
            Self::SceneIndexCountMismatch { expected, actual } => write!(
                f,
                "scene index payload has {actual} entries, expected {expected}"
            ),
            Self::TooManySceneTransforms { count, max } => {
                write!(f, "scene payload carries {count} transforms, at most {max} supported")
            }
            Self::WorkerUnavailable => f.write_str("sort worker is no longer running"),
        }
    }
}

impl std::error::Error for SortError {}
