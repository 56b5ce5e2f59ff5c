//! Side-effecting steps of the protocol: processes, git, file trees.

pub mod applier;
pub mod checksum;
pub mod commit;
pub mod config;
pub mod environment;
pub mod git;
pub mod init;
pub mod lock;
pub mod process;
pub mod proposal;
pub mod snapshot;
pub mod sync;
pub mod syntax;
pub mod test_runner;
pub mod tool;
