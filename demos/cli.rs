//! Command line pieces shared by the demo binaries

use clap_derive::ValueEnum;
use framelink::config::CodecKind;
use tracing::Level;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum CodecArg {
    Json,
    Binary,
}

impl From<CodecArg> for CodecKind {
    fn from(value: CodecArg) -> Self {
        match value {
            CodecArg::Json => CodecKind::Json,
            CodecArg::Binary => CodecKind::Binary,
        }
    }
}

pub fn init_logging(verbose: bool, very_verbose: bool) {
    let level = match (verbose, very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .try_init()
        .ok();
}
