use uuid::Uuid;

use crate::error::Error;

/// Longest unique id the server accepts, excluding the wire separator.
pub const UNIQUE_MAX_LEN: usize = 64;

/// Deduplication token for a submission.
///
/// The server coalesces in-flight submissions that share a function name and
/// unique id, so callers with natural idempotency keys should supply their
/// own. When the caller omits one, a random UUID in canonical hyphenated
/// form is generated instead; the protocol treats it as opaque text either
/// way.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueId(Vec<u8>);

impl UniqueId {
    /// Use the caller's token verbatim after a length check.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<UniqueId, Error> {
        let bytes = bytes.into();
        if bytes.len() > UNIQUE_MAX_LEN {
            return Err(Error::invalid(format!(
                "unique id of {} bytes exceeds the {}-byte limit",
                bytes.len(),
                UNIQUE_MAX_LEN
            )));
        }
        Ok(UniqueId(bytes))
    }

    /// Generate a random id: 36 ASCII bytes of canonical UUID text.
    pub fn random() -> UniqueId {
        UniqueId(Uuid::new_v4().hyphenated().to_string().into_bytes())
    }

    /// Resolve an optional caller-supplied token: verbatim when non-empty,
    /// generated otherwise.
    pub(crate) fn resolve(unique: Option<&[u8]>) -> Result<UniqueId, Error> {
        match unique {
            Some(bytes) if !bytes.is_empty() => UniqueId::new(bytes),
            _ => Ok(UniqueId::random()),
        }
    }

    /// The token's bytes as placed on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for UniqueId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
