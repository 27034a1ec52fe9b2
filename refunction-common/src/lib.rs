pub use anyhow;
pub use libc;
pub use nix;
pub use procfs;
pub use serde_json;
pub use syscalls;

pub mod proto;
pub mod transport;

pub mod tracing {
    pub use ::tracing::*;

    use tracing_subscriber::EnvFilter;

    /// Installs the stderr subscriber, filtered by `RUST_LOG`.
    ///
    /// Calling this more than once is harmless, later calls keep the first subscriber.
    pub fn init() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    }
}
