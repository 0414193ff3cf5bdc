use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("CSV error: {source}")]
    Csv {
        #[source]
        source: csv::Error,
    },

    #[error("file has no header row")]
    MissingHeader,

    #[error("file did not contain any data rows")]
    Empty,
}

impl From<csv::Error> for TableError {
    fn from(source: csv::Error) -> Self {
        TableError::Csv { source }
    }
}
