//! Per-port listener settings.
//!
//! # Responsibilities
//! - Derive the bind address and HTTP limits of a port from its sites
//! - Apply header read timeout and header size limit to the hyper builder
//!
//! # Design Decisions
//! - A single-site port takes its limits from that site; a shared port
//!   uses server defaults, since no one site owns the connection
//! - The HTTP/1 buffer limit is floored at hyper's 8 KiB minimum

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto::Builder;

use crate::http::dispatcher::PortGroup;

/// Smallest HTTP/1 read buffer hyper accepts.
pub const MIN_HEADER_BUFFER: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSettings {
    pub addr: SocketAddr,
    pub header_read_timeout: Option<Duration>,
    pub max_header_bytes: Option<usize>,
}

impl ListenerSettings {
    pub fn for_group(group: &PortGroup) -> Self {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port));
        match group.sites.as_slice() {
            [site] => Self {
                addr,
                header_read_timeout: site.header_read_timeout(),
                max_header_bytes: (site.max_header_bytes > 0)
                    .then(|| site.max_header_bytes.max(MIN_HEADER_BUFFER)),
            },
            _ => Self {
                addr,
                header_read_timeout: None,
                max_header_bytes: None,
            },
        }
    }

    pub fn apply(&self, builder: &mut Builder<TokioExecutor>) {
        let mut http1 = builder.http1();
        http1.timer(TokioTimer::new());
        if let Some(timeout) = self.header_read_timeout {
            http1.header_read_timeout(timeout);
        }
        if let Some(limit) = self.max_header_bytes {
            http1.max_buf_size(limit);
        }
    }
}
