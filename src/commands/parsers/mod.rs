//! Pure parsers mapping raw command output to typed metric records.
//!
//! Parsers never panic and never fail the cycle: malformed input becomes a
//! [`ParseWarning`](crate::types::ParseWarning) on the record and the
//! affected fields stay `missing`. Only byte-precise whitespace-separated
//! token positions are relied on, so locale variance in surrounding text is
//! irrelevant.

pub mod cpu;
pub mod disk;
pub mod memory;
pub mod network;
pub mod sysinfo;

pub use cpu::{parse_loadavg, parse_proc_stat, parse_proc_uptime, CpuTicks};
pub use disk::parse_df_bytes;
pub use memory::parse_meminfo;
pub use network::{parse_proc_net_dev, rate_between};
pub use sysinfo::parse_sysinfo;
