use crate::error::ContentionError;
use cache_utils::cache_info::CacheGeometry;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

/// Offset of the first lock word from a page aligned base.
pub const DEFAULT_LOCK_OFFSET: usize = 3;
pub const DEFAULT_LOCK_WORDS: usize = 64;
pub const LOCK_WORD_SIZE: usize = 4;
/// Bytes available to the lock block, offset included.
pub const LOCK_BLOCK_SIZE: usize = 1 << 12;
/// Keeps the lock block within a single page.
pub const MAX_LOCK_OFFSET: usize = 1 << 11;

pub const DEFAULT_PACKET_SIZE: usize = 512;
/// 1 Gbps.
pub const DEFAULT_TARGET_BITRATE: u64 = 1_000_000_000;
/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65507;

const_assert!(DEFAULT_PACKET_SIZE <= MAX_DATAGRAM_PAYLOAD);
const_assert!(DEFAULT_LOCK_OFFSET % LOCK_WORD_SIZE != 0);
const_assert!(DEFAULT_LOCK_OFFSET + DEFAULT_LOCK_WORDS * LOCK_WORD_SIZE <= LOCK_BLOCK_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    Cache,
    MemoryBus,
    Nic,
}

impl Display for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Resource::Cache => "llc",
            Resource::MemoryBus => "membus",
            Resource::Nic => "nic",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceParams {
    Cache {
        buffer_size: usize,
        line_size: usize,
    },
    /// Worker count is `ContentionSpec::concurrency`.
    MemoryBus {
        lock_offset: usize,
        lock_words: usize,
    },
    Nic {
        destination: SocketAddr,
        packet_size: usize,
        target_bitrate: u64,
    },
}

impl ResourceParams {
    pub fn resource(&self) -> Resource {
        match self {
            ResourceParams::Cache { .. } => Resource::Cache,
            ResourceParams::MemoryBus { .. } => Resource::MemoryBus,
            ResourceParams::Nic { .. } => Resource::Nic,
        }
    }
}

/// What to saturate, for how long, and with how many threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentionSpec {
    pub resource: Resource,
    pub duration: Duration,
    pub concurrency: u32,
    pub target: ResourceParams,
}

impl ContentionSpec {
    pub fn new(duration: Duration, concurrency: u32, target: ResourceParams) -> Self {
        Self {
            resource: target.resource(),
            duration,
            concurrency,
            target,
        }
    }

    /// LLC contention with a buffer sized from the detected cache geometry.
    pub fn cache(duration: Duration, concurrency: u32) -> Self {
        let geometry = CacheGeometry::detect();
        Self::new(
            duration,
            concurrency,
            ResourceParams::Cache {
                buffer_size: geometry.eviction_buffer_size(),
                line_size: geometry.line_size,
            },
        )
    }

    pub fn memory_bus(duration: Duration, concurrency: u32) -> Self {
        Self::new(
            duration,
            concurrency,
            ResourceParams::MemoryBus {
                lock_offset: DEFAULT_LOCK_OFFSET,
                lock_words: DEFAULT_LOCK_WORDS,
            },
        )
    }

    pub fn nic(duration: Duration, concurrency: u32, destination: SocketAddr) -> Self {
        Self::new(
            duration,
            concurrency,
            ResourceParams::Nic {
                destination,
                packet_size: DEFAULT_PACKET_SIZE,
                target_bitrate: DEFAULT_TARGET_BITRATE,
            },
        )
    }

    pub fn validate(&self) -> Result<(), ContentionError> {
        if self.duration.is_zero() {
            return Err(ContentionError::invalid("duration", "must be positive"));
        }
        if self.concurrency == 0 {
            return Err(ContentionError::invalid("concurrency", "must be at least 1"));
        }
        if self.resource != self.target.resource() {
            return Err(ContentionError::invalid(
                "resource",
                format!(
                    "{} does not match {} parameters",
                    self.resource,
                    self.target.resource()
                ),
            ));
        }
        match self.target {
            ResourceParams::Cache {
                buffer_size,
                line_size,
            } => {
                if !line_size.is_power_of_two() {
                    return Err(ContentionError::invalid(
                        "line_size",
                        format!("{} is not a power of two", line_size),
                    ));
                }
                if buffer_size < line_size {
                    return Err(ContentionError::invalid(
                        "buffer_size",
                        format!("{} bytes is smaller than one line", buffer_size),
                    ));
                }
            }
            ResourceParams::MemoryBus {
                lock_offset,
                lock_words,
            } => {
                if lock_words == 0 {
                    return Err(ContentionError::invalid("lock_words", "must be at least 1"));
                }
                if lock_offset % LOCK_WORD_SIZE == 0 {
                    return Err(ContentionError::invalid(
                        "lock_offset",
                        format!("{} is word aligned, locks would not split", lock_offset),
                    ));
                }
                if lock_offset >= MAX_LOCK_OFFSET {
                    return Err(ContentionError::invalid(
                        "lock_offset",
                        format!("must be below {}", MAX_LOCK_OFFSET),
                    ));
                }
                let max_words = (LOCK_BLOCK_SIZE - lock_offset) / LOCK_WORD_SIZE;
                if lock_words > max_words {
                    return Err(ContentionError::invalid(
                        "lock_words",
                        format!("at most {} words fit after offset {}", max_words, lock_offset),
                    ));
                }
            }
            ResourceParams::Nic {
                destination,
                packet_size,
                target_bitrate,
            } => {
                if target_bitrate == 0 {
                    return Err(ContentionError::invalid("target_bitrate", "must be positive"));
                }
                if packet_size == 0 || packet_size > MAX_DATAGRAM_PAYLOAD {
                    return Err(ContentionError::invalid(
                        "packet_size",
                        format!("must be within 1..={}", MAX_DATAGRAM_PAYLOAD),
                    ));
                }
                if destination.port() == 0 {
                    return Err(ContentionError::invalid("destination", "port 0"));
                }
            }
        }
        Ok(())
    }
}

impl Display for ContentionSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} x{} for {:?}",
            self.resource, self.concurrency, self.duration
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    fn field_of(spec: &ContentionSpec) -> &'static str {
        match spec.validate() {
            Err(ContentionError::InvalidSpec { field, .. }) => field,
            other => panic!("expected invalid spec, got {:?}", other),
        }
    }

    #[test]
    fn defaults_are_valid() {
        ContentionSpec::cache(SECOND, 1).validate().unwrap();
        ContentionSpec::memory_bus(SECOND, 4).validate().unwrap();
        ContentionSpec::nic(SECOND, 2, "10.247.52.4:8080".parse().unwrap())
            .validate()
            .unwrap();
    }

    #[test]
    fn common_fields() {
        let mut spec = ContentionSpec::memory_bus(Duration::ZERO, 1);
        assert_eq!(field_of(&spec), "duration");
        spec.duration = SECOND;
        spec.concurrency = 0;
        assert_eq!(field_of(&spec), "concurrency");
        spec.concurrency = 1;
        spec.resource = Resource::Nic;
        assert_eq!(field_of(&spec), "resource");
    }

    #[test]
    fn cache_fields() {
        let spec = ContentionSpec::new(
            SECOND,
            1,
            ResourceParams::Cache {
                buffer_size: 1 << 20,
                line_size: 48,
            },
        );
        assert_eq!(field_of(&spec), "line_size");
        let spec = ContentionSpec::new(
            SECOND,
            1,
            ResourceParams::Cache {
                buffer_size: 32,
                line_size: 64,
            },
        );
        assert_eq!(field_of(&spec), "buffer_size");
    }

    #[test]
    fn memory_bus_fields() {
        let aligned = ContentionSpec::new(
            SECOND,
            1,
            ResourceParams::MemoryBus {
                lock_offset: 8,
                lock_words: 64,
            },
        );
        assert_eq!(field_of(&aligned), "lock_offset");
        let empty = ContentionSpec::new(
            SECOND,
            1,
            ResourceParams::MemoryBus {
                lock_offset: 3,
                lock_words: 0,
            },
        );
        assert_eq!(field_of(&empty), "lock_words");
        let huge = ContentionSpec::new(
            SECOND,
            1,
            ResourceParams::MemoryBus {
                lock_offset: 3,
                lock_words: usize::MAX / 2,
            },
        );
        assert_eq!(field_of(&huge), "lock_words");
        let full_page = ContentionSpec::new(
            SECOND,
            1,
            ResourceParams::MemoryBus {
                lock_offset: 3,
                lock_words: (LOCK_BLOCK_SIZE - 3) / LOCK_WORD_SIZE,
            },
        );
        assert!(full_page.validate().is_ok());
    }

    #[test]
    fn nic_fields() {
        let destination = "127.0.0.1:8080".parse().unwrap();
        let mut spec = ContentionSpec::nic(SECOND, 1, destination);
        if let ResourceParams::Nic {
            ref mut target_bitrate,
            ..
        } = spec.target
        {
            *target_bitrate = 0;
        }
        assert_eq!(field_of(&spec), "target_bitrate");

        let spec = ContentionSpec::new(
            SECOND,
            1,
            ResourceParams::Nic {
                destination,
                packet_size: MAX_DATAGRAM_PAYLOAD + 1,
                target_bitrate: 1,
            },
        );
        assert_eq!(field_of(&spec), "packet_size");

        let spec = ContentionSpec::nic(SECOND, 1, "127.0.0.1:0".parse().unwrap());
        assert_eq!(field_of(&spec), "destination");
    }
}
