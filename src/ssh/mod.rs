//! SSH connectivity: authenticated sessions and the per-server pool.

pub mod pool;
pub mod session;

pub use pool::{Lease, PoolStatus, SshPool};
pub use session::{ExecOutput, KnownHostsPolicy, SshSession};
