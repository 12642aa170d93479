use std::fmt;

/// Type-erased error used throughout the transport layer.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Opaque error returned by [`crate::Body`] and [`crate::Client`] operations.
#[derive(Debug)]
pub struct Error(BoxError);

impl Error {
    pub(crate) fn new<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self(err.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

impl From<BoxError> for Error {
    fn from(err: BoxError) -> Self {
        Self(err)
    }
}

impl From<hyper_util::client::legacy::Error> for Error {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Self::new(err)
    }
}
