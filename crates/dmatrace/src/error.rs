use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid value for {var}: {value:?}")]
    ConfigInvalid { var: &'static str, value: String },

    #[error("backtrace unavailable")]
    UnwindFailed,

    #[error("allocation happened on a thread-exit path")]
    UnwindExit,

    #[error("allocation size {0} exceeds the tracker cap")]
    OutOfBoundSize(usize),

    #[error("dump I/O error: {0}")]
    DumpIo(#[from] std::io::Error),

    #[error("address {0:#x} is not tracked")]
    Untracked(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
