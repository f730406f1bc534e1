use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use crate::error::{Error, Result};

/// `-q` gives 0, the default 1, each `-v` one more.
pub fn level(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the global subscriber: stderr, plus `log_file` when given. A
/// subscriber already installed (tests, embedding programs) is left alone.
pub fn init(verbosity: usize, log_file: Option<&Path>) -> Result<()> {
    let max = level(verbosity);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(max);
    match log_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| Error::io(path, e))?;
            let _ = builder
                .with_ansi(false)
                .with_writer(std::io::stderr.and(Mutex::new(file)))
                .try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level(0), Level::WARN);
        assert_eq!(level(1), Level::INFO);
        assert_eq!(level(5), Level::TRACE);
    }

    #[test]
    fn log_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        init(1, Some(&path)).unwrap();
        assert!(path.exists());
    }
}
