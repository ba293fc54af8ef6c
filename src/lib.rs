pub mod restore_pb {
    include!(concat!(env!("OUT_DIR"), "/flowlog.restore.rs"));
}

pub mod config;
pub mod connections;
pub mod log;
pub mod partition;
pub mod restore;
pub mod retry;
pub mod snapshot;
pub mod storage;
