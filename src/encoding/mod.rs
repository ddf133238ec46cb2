pub mod bincode;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Trait for encoding values for storage using bincode.
///
/// Backend keys are hand-built byte strings (revision keys, fixed meta
/// names) whose ordering matters; values carry no ordering requirement, so
/// they use plain bincode serialization.
pub trait Value: Serialize + DeserializeOwned {
    /// Encode the value to bytes
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self)
    }

    /// Decode bytes back to the original value type
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}

impl<T> Value for T where T: Serialize + DeserializeOwned {}
