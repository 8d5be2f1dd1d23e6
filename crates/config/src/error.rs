use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A provider could not be read or a value had the wrong type
    #[display("could not load configuration")]
    Load,
    /// Every value was read but the combination is not usable
    #[display("invalid configuration: {_0}")]
    Invalid(#[error(not(source))] String),
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        false
    }
}
