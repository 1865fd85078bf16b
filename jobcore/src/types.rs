use serde::{Deserialize, Serialize};
use std::fmt;

pub type Program = String;
pub type Args = Vec<String>;
pub type Envs = Vec<(String, String)>;
pub type Offset = u64;
pub type OutputBlob = bytes::Bytes;

/// Opaque job token. Only `[0-9a-z-]` so it is always a single safe path component.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub const MAX_LEN: usize = 64;

    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= Self::MAX_LEN
            && !raw.starts_with('-')
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase() || b == b'-');
        valid.then(|| Self(raw.to_string()))
    }

    pub(crate) fn from_parts(secs: u64, random: &str) -> Self {
        Self(format!("{secs}-{random}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for JobId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        JobId::parse(&value).ok_or_else(|| format!("invalid job id {value:?}"))
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}
