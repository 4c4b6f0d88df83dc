//! The fixed set of atomic programs the engine runs inside the store.
//!
//! Every program replies with [`REPLY_WIDTH`] integers per key:
//! `allowed, remaining, reset_ms, total_hits, exists, retry_after_ms`.
//! The batched sliding window program concatenates one such group per key.

use std::fmt;

use super::StoreError;

/// Integers per key in a program reply.
pub const REPLY_WIDTH: usize = 6;

/// Names of the registered programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptName {
    SlidingWindow,
    SlidingWindowBatch,
    SlidingWindowPeek,
    TokenBucket,
    TokenBucketPeek,
    FixedWindow,
    FixedWindowPeek,
}

impl ScriptName {
    /// Every program, in registration order.
    pub const ALL: [ScriptName; 7] = [
        ScriptName::SlidingWindow,
        ScriptName::SlidingWindowBatch,
        ScriptName::SlidingWindowPeek,
        ScriptName::TokenBucket,
        ScriptName::TokenBucketPeek,
        ScriptName::FixedWindow,
        ScriptName::FixedWindowPeek,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptName::SlidingWindow => "sliding_window",
            ScriptName::SlidingWindowBatch => "sliding_window_batch",
            ScriptName::SlidingWindowPeek => "sliding_window_peek",
            ScriptName::TokenBucket => "token_bucket",
            ScriptName::TokenBucketPeek => "token_bucket_peek",
            ScriptName::FixedWindow => "fixed_window",
            ScriptName::FixedWindowPeek => "fixed_window_peek",
        }
    }

    /// Lua source of the program.
    pub fn source(&self) -> &'static str {
        match self {
            ScriptName::SlidingWindow => include_str!("lua/sliding_window.lua"),
            ScriptName::SlidingWindowBatch => include_str!("lua/sliding_window_batch.lua"),
            ScriptName::SlidingWindowPeek => include_str!("lua/sliding_window_peek.lua"),
            ScriptName::TokenBucket => include_str!("lua/token_bucket.lua"),
            ScriptName::TokenBucketPeek => include_str!("lua/token_bucket_peek.lua"),
            ScriptName::FixedWindow => include_str!("lua/fixed_window.lua"),
            ScriptName::FixedWindowPeek => include_str!("lua/fixed_window_peek.lua"),
        }
    }
}

impl fmt::Display for ScriptName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A program as registered in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptHandle {
    pub name: ScriptName,
    /// Store-assigned identifier (the source digest for Redis)
    pub sha: String,
}

/// Decoded reply for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptReply {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_ms: i64,
    pub total_hits: i64,
    /// Whether the key held state before the call
    pub exists: bool,
    pub retry_after_ms: i64,
}

impl ScriptReply {
    /// Decode a single-key reply.
    pub fn parse(values: &[i64]) -> Result<Self, StoreError> {
        if values.len() != REPLY_WIDTH {
            return Err(StoreError::Protocol(format!(
                "expected {} values, got {}",
                REPLY_WIDTH,
                values.len()
            )));
        }
        Ok(Self::from_group(values))
    }

    /// Decode a reply covering `count` keys.
    pub fn parse_many(values: &[i64], count: usize) -> Result<Vec<Self>, StoreError> {
        if values.len() != count * REPLY_WIDTH {
            return Err(StoreError::Protocol(format!(
                "expected {} values for {} keys, got {}",
                count * REPLY_WIDTH,
                count,
                values.len()
            )));
        }
        Ok(values.chunks_exact(REPLY_WIDTH).map(Self::from_group).collect())
    }

    fn from_group(values: &[i64]) -> Self {
        Self {
            allowed: values[0] == 1,
            remaining: values[1].max(0) as u64,
            reset_ms: values[2],
            total_hits: values[3],
            exists: values[4] == 1,
            retry_after_ms: values[5].max(0),
        }
    }

    /// Encode in the wire layout.
    pub fn to_values(&self) -> [i64; REPLY_WIDTH] {
        [
            self.allowed as i64,
            self.remaining as i64,
            self.reset_ms,
            self.total_hits,
            self.exists as i64,
            self.retry_after_ms,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_script_has_source() {
        for name in ScriptName::ALL {
            assert!(name.source().contains("KEYS"), "{} has no source", name);
        }
    }

    #[test]
    fn test_parse_reply() {
        let reply = ScriptReply::parse(&[1, 4, 2_000, 6, 1, 0]).unwrap();
        assert!(reply.allowed);
        assert_eq!(reply.remaining, 4);
        assert_eq!(reply.reset_ms, 2_000);
        assert_eq!(reply.total_hits, 6);
        assert!(reply.exists);
        assert_eq!(reply.to_values(), [1, 4, 2_000, 6, 1, 0]);
    }

    #[test]
    fn test_parse_rejects_wrong_width() {
        assert!(matches!(
            ScriptReply::parse(&[1, 2, 3]),
            Err(StoreError::Protocol(_))
        ));
        assert!(ScriptReply::parse_many(&[1, 2, 3, 4, 5, 6, 7], 1).is_err());
    }

    #[test]
    fn test_parse_many() {
        let values = [1, 2, 100, 1, 1, 0, 0, 0, 100, 4, 1, 50];
        let replies = ScriptReply::parse_many(&values, 2).unwrap();
        assert_eq!(replies.len(), 2);
        assert!(replies[0].allowed);
        assert!(!replies[1].allowed);
        assert_eq!(replies[1].retry_after_ms, 50);
    }
}
