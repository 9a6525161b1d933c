use std::path::PathBuf;

/// The largest number of frames the stack trace section will ever contain.
pub const MAX_FRAMES: usize = 64;

/// Runtime configuration for a [`crate::CrashLog`].
///
/// Everything in here is read from within the signal handler, so it is fixed
/// once the crash log is installed.
#[derive(Clone, Debug)]
pub struct Settings {
    /// The directory the report (and dump) is written to.
    pub output_dir: PathBuf,
    /// Prefix of the artifact file names, followed by the crash timestamp.
    pub file_prefix: String,
    /// Application name shown in the report banner.
    pub app_name: String,
    /// Application version shown in the report header.
    pub app_version: String,
    /// Maximum number of stack frames to capture, clamped to [`MAX_FRAMES`].
    pub max_frames: usize,
    /// Whether the location of the written artifacts is printed to stderr.
    pub announce: bool,
    /// Name of the dump server socket. No dump is requested if `None`.
    pub dump_server: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir(),
            file_prefix: "crash".to_owned(),
            app_name: env!("CARGO_PKG_NAME").to_owned(),
            app_version: env!("CARGO_PKG_VERSION").to_owned(),
            max_frames: MAX_FRAMES,
            announce: true,
            dump_server: None,
        }
    }
}

impl Settings {
    #[inline]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    #[inline]
    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Sets the name and version used in the report header
    #[inline]
    pub fn with_app(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.app_name = name.into();
        self.app_version = version.into();
        self
    }

    #[inline]
    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames.min(MAX_FRAMES);
        self
    }

    #[inline]
    pub fn with_announce(mut self, announce: bool) -> Self {
        self.announce = announce;
        self
    }

    /// Sets the socket name of the dump server that will be asked to write a
    /// minidump of the crashing process.
    ///
    /// This only has an effect if the `minidump` feature is enabled.
    #[inline]
    pub fn with_dump_server(mut self, name: impl Into<String>) -> Self {
        self.dump_server = Some(name.into());
        self
    }

    /// The number of frames that will actually be captured.
    #[inline]
    pub fn frame_limit(&self) -> usize {
        self.max_frames.min(MAX_FRAMES)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clamps_frames() {
        let settings = Settings::default().with_max_frames(1000);
        assert_eq!(settings.frame_limit(), MAX_FRAMES);

        let mut settings = Settings::default().with_max_frames(8);
        assert_eq!(settings.frame_limit(), 8);

        settings.max_frames = 500;
        assert_eq!(settings.frame_limit(), MAX_FRAMES);
    }
}
