use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::enricher::VcsInfo;
use crate::frame::{DEFAULT_MAX_SOURCE_BYTES, DEFAULT_MAX_WINDOW};
use crate::walker::DEFAULT_LIVE_STACK_DEPTH;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Number of frames kept by the stack cache.
pub(crate) const MW_STACK_CACHE_SIZE: &str = "MW_STACK_CACHE_SIZE";
/// Largest function body captured whole.
pub(crate) const MW_SOURCE_WINDOW: &str = "MW_SOURCE_WINDOW";
/// Largest source file read while extracting frames.
pub(crate) const MW_MAX_SOURCE_BYTES: &str = "MW_MAX_SOURCE_BYTES";
/// Frames kept when capturing the live stack at span start.
pub(crate) const MW_PROFILE_STACK_DEPTH: &str = "MW_PROFILE_STACK_DEPTH";
/// Commit the running binary was built from.
pub(crate) const MW_COMMIT_SHA: &str = "MW_COMMIT_SHA";
/// Repository the running binary was built from.
pub(crate) const MW_REPOSITORY_URL: &str = "MW_REPOSITORY_URL";

/// Exception enrichment configuration.
///
/// Use [`ExceptionConfigBuilder`] to configure your own instance.
#[derive(Clone, Debug)]
pub struct ExceptionConfig {
    pub(crate) cache_capacity: usize,
    pub(crate) max_window: usize,
    pub(crate) max_source_bytes: u64,
    pub(crate) live_stack_depth: usize,
    pub(crate) working_directory: Option<PathBuf>,
    pub(crate) vcs: VcsInfo,
}

impl Default for ExceptionConfig {
    fn default() -> Self {
        ExceptionConfigBuilder::default().build()
    }
}

impl ExceptionConfig {
    /// Number of frames kept by the stack cache.
    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }

    /// Largest function body captured whole.
    pub fn max_window(&self) -> usize {
        self.max_window
    }

    /// Largest source file read, in bytes.
    pub fn max_source_bytes(&self) -> u64 {
        self.max_source_bytes
    }

    /// Frames kept when capturing the live stack.
    pub fn live_stack_depth(&self) -> usize {
        self.live_stack_depth
    }

    /// Version control details attached to every exception event.
    pub fn vcs(&self) -> &VcsInfo {
        &self.vcs
    }
}

/// A builder for creating [`ExceptionConfig`] instances.
#[derive(Debug)]
pub struct ExceptionConfigBuilder {
    cache_capacity: usize,
    max_window: usize,
    max_source_bytes: u64,
    live_stack_depth: usize,
    working_directory: Option<PathBuf>,
    vcs: VcsInfo,
}

impl Default for ExceptionConfigBuilder {
    /// Create a new [`ExceptionConfigBuilder`] initialized with default values.
    /// The values are overridden by environment variables if set.
    /// The supported environment variables are:
    /// * `MW_STACK_CACHE_SIZE`
    /// * `MW_SOURCE_WINDOW`
    /// * `MW_MAX_SOURCE_BYTES`
    /// * `MW_PROFILE_STACK_DEPTH`
    /// * `MW_COMMIT_SHA`
    /// * `MW_REPOSITORY_URL`
    fn default() -> Self {
        ExceptionConfigBuilder {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_window: DEFAULT_MAX_WINDOW,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            live_stack_depth: DEFAULT_LIVE_STACK_DEPTH,
            working_directory: None,
            vcs: VcsInfo::default(),
        }
        .init_from_env_vars()
    }
}

impl ExceptionConfigBuilder {
    /// Set the number of frames kept by the stack cache. Zero is raised to
    /// one. The default value is 256.
    pub fn with_cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }

    /// Set the largest function body, in lines, that is captured whole.
    /// Longer bodies are captured as `max_window / 2` lines either side of
    /// the frame's line. The default value is 20.
    pub fn with_max_window(mut self, max_window: usize) -> Self {
        self.max_window = max_window;
        self
    }

    /// Set the largest source file, in bytes, that will be read. The default
    /// value is 1 MiB.
    pub fn with_max_source_bytes(mut self, max_source_bytes: u64) -> Self {
        self.max_source_bytes = max_source_bytes;
        self
    }

    /// Set the number of frames kept when capturing the live stack. The
    /// default value is 5.
    pub fn with_live_stack_depth(mut self, live_stack_depth: usize) -> Self {
        self.live_stack_depth = live_stack_depth;
        self
    }

    /// Resolve relative source paths against `dir` instead of the process's
    /// current directory.
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Set the commit sha attached to exception events.
    pub fn with_commit_sha(mut self, sha: impl Into<String>) -> Self {
        self.vcs.commit_sha = Some(sha.into());
        self
    }

    /// Set the repository url attached to exception events.
    pub fn with_repository_url(mut self, url: impl Into<String>) -> Self {
        self.vcs.repository_url = Some(url.into());
        self
    }

    /// Builds an `ExceptionConfig`.
    pub fn build(self) -> ExceptionConfig {
        ExceptionConfig {
            cache_capacity: self.cache_capacity.max(1),
            max_window: self.max_window,
            max_source_bytes: self.max_source_bytes,
            live_stack_depth: self.live_stack_depth,
            working_directory: self.working_directory,
            vcs: self.vcs,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(cache_capacity) = parse_env::<usize>(MW_STACK_CACHE_SIZE) {
            self.cache_capacity = cache_capacity;
        }

        if let Some(max_window) = parse_env::<usize>(MW_SOURCE_WINDOW) {
            self.max_window = max_window;
        }

        if let Some(max_source_bytes) = parse_env::<u64>(MW_MAX_SOURCE_BYTES) {
            self.max_source_bytes = max_source_bytes;
        }

        if let Some(depth) = parse_env::<usize>(MW_PROFILE_STACK_DEPTH) {
            self.live_stack_depth = depth;
        }

        if let Some(sha) = non_empty_env(MW_COMMIT_SHA) {
            self.vcs.commit_sha = Some(sha);
        }

        if let Some(url) = non_empty_env(MW_REPOSITORY_URL) {
            self.vcs.repository_url = Some(url);
        }

        self
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    env::var(name)
        .ok()
        .and_then(|value| T::from_str(value.trim()).ok())
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_VARS: [&str; 6] = [
        MW_STACK_CACHE_SIZE,
        MW_SOURCE_WINDOW,
        MW_MAX_SOURCE_BYTES,
        MW_PROFILE_STACK_DEPTH,
        MW_COMMIT_SHA,
        MW_REPOSITORY_URL,
    ];

    #[test]
    fn defaults() {
        temp_env::with_vars_unset(ALL_VARS, || {
            let config = ExceptionConfig::default();
            assert_eq!(config.cache_capacity(), 256);
            assert_eq!(config.max_window(), 20);
            assert_eq!(config.max_source_bytes(), 1024 * 1024);
            assert_eq!(config.live_stack_depth(), 5);
            assert_eq!(config.vcs(), &VcsInfo::default());
        });
    }

    #[test]
    fn env_overrides() {
        temp_env::with_vars(
            [
                (MW_STACK_CACHE_SIZE, Some("64")),
                (MW_SOURCE_WINDOW, Some(" 30 ")),
                (MW_MAX_SOURCE_BYTES, Some("4096")),
                (MW_PROFILE_STACK_DEPTH, Some("3")),
                (MW_COMMIT_SHA, Some("4e1f0c2")),
                (MW_REPOSITORY_URL, Some("https://github.com/acme/shop")),
            ],
            || {
                let config = ExceptionConfig::default();
                assert_eq!(config.cache_capacity(), 64);
                assert_eq!(config.max_window(), 30);
                assert_eq!(config.max_source_bytes(), 4096);
                assert_eq!(config.live_stack_depth(), 3);
                assert_eq!(config.vcs().commit_sha.as_deref(), Some("4e1f0c2"));
                assert_eq!(
                    config.vcs().repository_url.as_deref(),
                    Some("https://github.com/acme/shop")
                );
            },
        );
    }

    #[test]
    fn invalid_env_values_keep_defaults() {
        temp_env::with_vars(
            [
                (MW_STACK_CACHE_SIZE, Some("lots")),
                (MW_SOURCE_WINDOW, Some("-1")),
                (MW_COMMIT_SHA, Some("  ")),
            ],
            || {
                let config = ExceptionConfig::default();
                assert_eq!(config.cache_capacity(), 256);
                assert_eq!(config.max_window(), 20);
                assert_eq!(config.vcs().commit_sha, None);
            },
        );
    }

    #[test]
    fn builder_overrides_env() {
        temp_env::with_var(MW_STACK_CACHE_SIZE, Some("64"), || {
            let config = ExceptionConfigBuilder::default()
                .with_cache_capacity(0)
                .with_max_window(10)
                .with_working_directory("/srv/app")
                .build();
            assert_eq!(config.cache_capacity(), 1);
            assert_eq!(config.max_window(), 10);
            assert_eq!(config.working_directory, Some(PathBuf::from("/srv/app")));
        });
    }
}
