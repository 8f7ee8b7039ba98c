//! Stream set handed to `configure`.

use serde::{Deserialize, Serialize};

use crate::error::{CamError, CamResult};
use crate::types::{StreamId, StreamRole};

/// One configured output or input stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Caller-assigned id
    pub id: StreamId,
    /// What the stream carries
    pub role: StreamRole,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Maximum buffers the caller may have in flight for this stream
    pub max_buffers: usize,
}

impl StreamConfig {
    /// Creates a stream description.
    #[must_use]
    pub fn new(id: u32, role: StreamRole, width: u32, height: u32, max_buffers: usize) -> Self {
        Self {
            id: StreamId(id),
            role,
            width,
            height,
            max_buffers,
        }
    }

    /// Bytes per buffer for this stream's format.
    #[must_use]
    pub fn buffer_bytes(&self) -> usize {
        let pixels = self.width as usize * self.height as usize;
        match self.role {
            StreamRole::Raw | StreamRole::ZslInput => pixels * 2,
            StreamRole::Jpeg => (pixels / 2).max(1),
            _ => pixels * 3 / 2,
        }
    }
}

/// Validated set of streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSet {
    streams: Vec<StreamConfig>,
}

impl StreamSet {
    /// Validates and wraps `streams`.
    ///
    /// Ids must be unique, sizes non-zero, and each role may appear at most once.
    pub fn new(streams: Vec<StreamConfig>) -> CamResult<Self> {
        if streams.is_empty() {
            return Err(CamError::Configuration("stream set is empty".into()));
        }
        for (i, stream) in streams.iter().enumerate() {
            if stream.width == 0 || stream.height == 0 {
                return Err(CamError::Configuration(format!(
                    "{} has an empty size",
                    stream.id
                )));
            }
            if stream.max_buffers == 0 {
                return Err(CamError::Configuration(format!(
                    "{} allows no buffers",
                    stream.id
                )));
            }
            for other in &streams[..i] {
                if other.id == stream.id {
                    return Err(CamError::Configuration(format!(
                        "{} configured twice",
                        stream.id
                    )));
                }
                if other.role == stream.role {
                    return Err(CamError::Configuration(format!(
                        "role {} used by {} and {}",
                        stream.role, other.id, stream.id
                    )));
                }
            }
        }
        if streams.iter().all(|s| s.role.is_input()) {
            return Err(CamError::Configuration("no output stream configured".into()));
        }
        Ok(Self { streams })
    }

    /// Stream by id.
    #[must_use]
    pub fn get(&self, id: StreamId) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.id == id)
    }

    /// Stream by role.
    #[must_use]
    pub fn by_role(&self, role: StreamRole) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.role == role)
    }

    /// Whether any stalling output is configured.
    #[must_use]
    pub fn has_stall(&self) -> bool {
        self.streams.iter().any(|s| s.role.is_stall())
    }

    /// Iterates over all streams.
    pub fn iter(&self) -> impl Iterator<Item = &StreamConfig> {
        self.streams.iter()
    }

    /// Number of streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Always false for a validated set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_ids_and_roles() {
        let dup_id = StreamSet::new(vec![
            StreamConfig::new(1, StreamRole::Preview, 64, 48, 4),
            StreamConfig::new(1, StreamRole::Jpeg, 64, 48, 2),
        ]);
        assert!(dup_id.is_err());

        let dup_role = StreamSet::new(vec![
            StreamConfig::new(1, StreamRole::Preview, 64, 48, 4),
            StreamConfig::new(2, StreamRole::Preview, 32, 24, 4),
        ]);
        assert!(dup_role.is_err());
    }

    #[test]
    fn rejects_input_only() {
        let set = StreamSet::new(vec![StreamConfig::new(7, StreamRole::ZslInput, 64, 48, 2)]);
        assert!(set.is_err());
    }

    #[test]
    fn lookups() {
        let set = StreamSet::new(vec![
            StreamConfig::new(1, StreamRole::Preview, 64, 48, 4),
            StreamConfig::new(2, StreamRole::Jpeg, 64, 48, 2),
        ])
        .unwrap();
        assert!(set.has_stall());
        assert_eq!(set.by_role(StreamRole::Jpeg).map(|s| s.id), Some(StreamId(2)));
        assert_eq!(set.get(StreamId(1)).map(StreamConfig::buffer_bytes), Some(64 * 48 * 3 / 2));
        assert!(set.get(StreamId(3)).is_none());
    }
}
