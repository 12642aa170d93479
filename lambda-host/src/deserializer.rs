use std::{error::Error, fmt};

use serde::Deserialize;

/// Event payload deserialization error.
/// Returned when the data sent to the function cannot be deserialized
/// into the type the event parameter declares.
#[derive(Debug)]
pub(crate) struct DeserializeError {
    inner: serde_path_to_error::Error<serde_json::Error>,
}

impl fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.inner.path().to_string();
        if path == "." {
            write!(
                f,
                "failed to deserialize the incoming data into the event's type: {}",
                self.inner
            )
        } else {
            write!(
                f,
                "failed to deserialize the incoming data into the event's type: [{}] {}",
                path, self.inner
            )
        }
    }
}

impl Error for DeserializeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.inner)
    }
}

/// Deserializes raw event bytes into the type an event parameter declares.
pub(crate) fn deserialize<T>(body: &[u8]) -> Result<T, DeserializeError>
where
    T: for<'de> Deserialize<'de>,
{
    let jd = &mut serde_json::Deserializer::from_slice(body);
    serde_path_to_error::deserialize(jd).map_err(|inner| DeserializeError { inner })
}
