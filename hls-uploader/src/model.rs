//! Job identity and result types shared by every component.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

const HASH_SEED: u64 = 3074457345618258791;
const HASH_MULTIPLIER: u64 = 3074457345618258799;

/// Identifies one episode of one dub that has to be downloaded and published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub my_anime_list_id: i64,
    pub dub: String,
    pub episode: i32,
}

impl JobDescriptor {
    pub fn new(my_anime_list_id: i64, dub: impl Into<String>, episode: i32) -> Self {
        Self {
            my_anime_list_id,
            dub: dub.into(),
            episode,
        }
    }

    /// Short correlation id for logs, stable across processes and restarts.
    pub fn hash(&self) -> String {
        let key = format!("{}{}{}", self.my_anime_list_id, self.dub, self.episode);
        let value = key.encode_utf16().fold(HASH_SEED, |acc, unit| {
            acc.wrapping_add(u64::from(unit))
                .wrapping_mul(HASH_MULTIPLIER)
        });
        format!("{value:X}")
    }

    /// Upload caption: base64 of the JSON encoded descriptor.
    pub fn caption(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }
}

impl fmt::Display for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.my_anime_list_id, self.dub, self.episode)
    }
}

/// Opaque identifier of a published video, handed back to the job directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultToken(String);

impl ResultToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
