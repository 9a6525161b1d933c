use chrono::{DateTime, Utc};
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

/// How many suffixed names are tried before giving up on creating a report
/// whose name collides with an existing one.
const MAX_SUFFIX: u32 = 16;

/// The names of the files produced for a single crash.
///
/// Both names share the same stem, `<prefix><YYYYmmddHHMMSS>[-N]`, so the
/// report and the dump of one crash are easy to pair up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// The text report
    pub log: PathBuf,
    /// The minidump, only ever created if a dump was requested
    pub dump: PathBuf,
}

impl ArtifactPaths {
    /// Computes the artifact paths for a crash that happened at `when`.
    ///
    /// A `suffix` of 0 produces the plain stem.
    pub fn new(dir: &Path, prefix: &str, when: DateTime<Utc>, suffix: u32) -> Self {
        let mut stem = format!("{prefix}{}", when.format("%Y%m%d%H%M%S"));
        if suffix > 0 {
            use std::fmt::Write;
            let _ = write!(&mut stem, "-{suffix}");
        }

        Self {
            log: dir.join(format!("{stem}.log")),
            dump: dir.join(format!("{stem}.dmp")),
        }
    }

    /// Creates the report file, never truncating an existing one.
    ///
    /// If a report with the same timestamp already exists, eg. because a
    /// previous crash in the same second did not manage to terminate the
    /// process, a numeric suffix is appended until an unused name is found.
    pub fn create_log(dir: &Path, prefix: &str, when: DateTime<Utc>) -> io::Result<(Self, File)> {
        let mut last_err = None;

        for suffix in 0..=MAX_SUFFIX {
            let paths = Self::new(dir, prefix, when, suffix);

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&paths.log)
            {
                Ok(file) => return Ok((paths, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AlreadyExists)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn when() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 17, 5, 42).unwrap()
    }

    #[test]
    fn deterministic_names() {
        let dir = Path::new("/var/crash");
        let paths = ArtifactPaths::new(dir, "crash", when(), 0);

        assert_eq!(paths.log, dir.join("crash20240309170542.log"));
        assert_eq!(paths.dump, dir.join("crash20240309170542.dmp"));
        assert_eq!(paths, ArtifactPaths::new(dir, "crash", when(), 0));

        let suffixed = ArtifactPaths::new(dir, "crash", when(), 2);
        assert_eq!(suffixed.log, dir.join("crash20240309170542-2.log"));
        assert_eq!(suffixed.dump, dir.join("crash20240309170542-2.dmp"));
    }

    #[test]
    fn never_overwrites() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();

        let (first, mut file) = ArtifactPaths::create_log(dir.path(), "crash", when()).unwrap();
        file.write_all(b"first crash").unwrap();
        drop(file);

        let (second, _file) = ArtifactPaths::create_log(dir.path(), "crash", when()).unwrap();

        assert_ne!(first, second);
        assert_eq!(second.log, dir.path().join("crash20240309170542-1.log"));
        assert_eq!(std::fs::read_to_string(&first.log).unwrap(), "first crash");
    }

    #[test]
    fn gives_up_eventually() {
        let dir = tempfile::tempdir().unwrap();

        for _ in 0..=MAX_SUFFIX {
            ArtifactPaths::create_log(dir.path(), "crash", when()).unwrap();
        }

        let err = ArtifactPaths::create_log(dir.path(), "crash", when()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let err = ArtifactPaths::create_log(&missing, "crash", when()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
