//! Local tunnel client
//!
//! Accepts local TCP connections and carries each one as a stream of the
//! shared tunnel. Everything runs on one thread driven by a mio poll:
//! - `Reactor` owns the listener, the tunnel and the connection table
//! - `LocalConnection` buffers output for one accepted socket
//! - `ConnectionTable` pairs stream ids with local connections

mod local;
mod reactor;
mod table;

pub use local::{LocalConnection, ReadOutcome};
pub use reactor::{Outcome, Reactor, ReactorOptions, ReactorStats};
pub use table::ConnectionTable;

use mio::event::{Event, Source};
use serde::{Deserialize, Serialize};

/// Default size of one local socket read
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Tunnel outbound queue size above which local sockets are not read
pub const HIGH_WATER_MARK: usize = 1024 * 1024;

/// Cached edge-triggered readiness of one entity
///
/// Set from poll events and cleared when an operation would block, so an
/// entity left readable (say, after one bounded read) is serviced again
/// without waiting for a new edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    /// Readiness of a freshly registered entity; the first operation finds out
    pub fn assume_ready() -> Self {
        Self {
            readable: true,
            writable: true,
        }
    }

    /// Fold a poll event into the cache
    pub fn update(&mut self, event: &Event) {
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.readable = true;
        }
        if event.is_writable() || event.is_write_closed() || event.is_error() {
            self.writable = true;
        }
    }
}

/// Uniform shape of everything the reactor waits on
pub trait Pollable {
    /// Handle registered with the poll
    fn source(&mut self) -> &mut dyn Source;

    /// Whether the entity should be read when readable
    fn wants_read(&self) -> bool;

    /// Whether the entity has output waiting for writability
    fn wants_write(&self) -> bool;

    /// Cached readiness
    fn readiness(&mut self) -> &mut Readiness;

    /// Whether cached readiness allows progress right now
    fn actionable(&mut self) -> bool {
        let ready = *self.readiness();
        (ready.readable && self.wants_read()) || (ready.writable && self.wants_write())
    }
}

/// What to do with inbound packets for streams without a local connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownStreamPolicy {
    /// Count and ignore
    #[default]
    Drop,
    /// Count and log a warning
    Log,
    /// Count and answer data with a single RST per stream
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        ready: Readiness,
        read: bool,
        write: bool,
        source: mio::net::UdpSocket,
    }

    impl Pollable for Dummy {
        fn source(&mut self) -> &mut dyn Source {
            &mut self.source
        }
        fn wants_read(&self) -> bool {
            self.read
        }
        fn wants_write(&self) -> bool {
            self.write
        }
        fn readiness(&mut self) -> &mut Readiness {
            &mut self.ready
        }
    }

    #[test]
    fn test_actionable_requires_interest_and_readiness() {
        let source = mio::net::UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut dummy = Dummy {
            ready: Readiness::default(),
            read: true,
            write: false,
            source,
        };
        assert!(!dummy.actionable());

        dummy.ready.writable = true;
        assert!(!dummy.actionable());

        dummy.write = true;
        assert!(dummy.actionable());

        dummy.ready = Readiness {
            readable: true,
            writable: false,
        };
        assert!(dummy.actionable());
        dummy.read = false;
        assert!(!dummy.actionable());
    }

    #[test]
    fn test_unknown_policy_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: UnknownStreamPolicy,
        }
        let parsed: Wrapper = toml::from_str("policy = \"reset\"").unwrap();
        assert_eq!(parsed.policy, UnknownStreamPolicy::Reset);
        assert_eq!(UnknownStreamPolicy::default(), UnknownStreamPolicy::Drop);
    }
}
