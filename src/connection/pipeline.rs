//! Declared per-connection stage order.

use crate::config::ServerConfig;
use crate::framing::Framing;
use std::fmt;
use std::time::Duration;

/// One processing stage of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Split the byte stream into frames and wrap outbound payloads.
    Framing(Framing),
    /// JSON decode of requests and encode of responses.
    Codec,
    /// Inactivity watchdog.
    IdleTimeout(Duration),
    /// Hands requests to the dispatch function.
    Handler,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Framing(framing) => write!(f, "framing({framing})"),
            Stage::Codec => f.write_str("codec"),
            Stage::IdleTimeout(d) => write!(f, "idle-timeout({}ms)", d.as_millis()),
            Stage::Handler => f.write_str("handler"),
        }
    }
}

/// The ordered stage list for one connection.
///
/// Inbound data flows front to back; outbound responses flow back through
/// codec and framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: [Stage; 4],
    max_frame_size: usize,
}

impl Pipeline {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            stages: [
                Stage::Framing(config.framing),
                Stage::Codec,
                Stage::IdleTimeout(config.idle_timeout),
                Stage::Handler,
            ],
            max_frame_size: config.max_frame_size,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn framing(&self) -> Framing {
        self.stages
            .iter()
            .find_map(|s| match s {
                Stage::Framing(f) => Some(*f),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.stages
            .iter()
            .find_map(|s| match s {
                Stage::IdleTimeout(d) => Some(*d),
                _ => None,
            })
            .unwrap_or(crate::config::DEFAULT_IDLE_TIMEOUT)
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{stage}")?;
        }
        Ok(())
    }
}
