//! The read-only, process-lifetime configuration the core runs against.
//!
//! Building a `Config` (parsing a document on disk, applying defaults) is
//! explicitly out of scope for the core: that belongs to the binary crate
//! that embeds it. The core
//! only consumes the finished value.

use std::{collections::HashSet, net::SocketAddr, time::Duration};

use crate::types::Method;

/// Username/password credentials accepted by the `UserPassword` method.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub worker_count: usize,
    /// `None` disables the idle timeout entirely (`timeout = 0`).
    pub idle_timeout: Option<Duration>,
    pub methods: HashSet<Method>,
    pub credentials: Option<Credentials>,
}

impl Config {
    /// `true` when `method` is present in the configured acceptable set.
    pub fn accepts(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }
}
