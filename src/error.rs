use std::path::PathBuf;

use crate::cell::CellIndex;
use crate::feature::FeatureKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // User errors
    #[error("The import was canceled")]
    BuildCanceled,
    #[error("Unsupported input format: {0}")]
    InputFormat(String),
    #[error("Syntax error at byte {position}: {message}")]
    QuerySyntax { position: usize, message: String },
    #[error("{0}")]
    QuerySemantics(String),

    // External errors
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    // Index errors, fatal only with `check_feature_validity`
    #[error("Corrupt {kind} record in cell {cell}: {message}")]
    Corrupt {
        kind: FeatureKind,
        cell: CellIndex,
        message: String,
    },
    #[error("Key `{0}` holds more than {max} distinct values", max = crate::dictionary::MAX_VALUES_PER_KEY)]
    ValueIdOverflow(String),
    #[error("{kind} `{id}` does not fit the record layout: {what} count exceeds u16")]
    OversizedRecord {
        kind: FeatureKind,
        id: u64,
        what: &'static str,
    },

    // Internal errors
    #[error("cell `{0:?}` was already cached")]
    AlreadyCached(PathBuf),
    #[error("unexpected tag `{0}={1}` missing from the dictionary")]
    InternalTagMissing(String, String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Error {
        let path = path.into();
        move |source| Error::Io { path, source }
    }
}
