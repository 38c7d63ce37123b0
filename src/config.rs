//! Session configuration and default constants.
//!
//! Buffer counts are small on purpose: stateless decoders rarely need more
//! than a handful of requests in flight, and every destination slot is a
//! kernel object that cannot be released until the session ends.

use std::path::PathBuf;
use std::time::Duration;

/// Poll timeout applied to every armed request and controller poll task.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Default video device node (the M2M decoder/encoder).
pub const DEFAULT_VIDEO_PATH: &str = "/dev/video0";

/// Default media controller node (the request allocator).
pub const DEFAULT_MEDIA_PATH: &str = "/dev/media0";

/// Default number of kernel request objects in a [`MediaPool`](crate::media::MediaPool).
pub const DEFAULT_REQUEST_COUNT: usize = 6;

/// Default number of source (bitstream) buffers.
pub const DEFAULT_SRC_BUFFER_COUNT: u32 = 6;

/// Default number of destination (frame) slots.
pub const DEFAULT_DST_SLOT_COUNT: u32 = 6;

/// Configuration for one hardware coding session.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Path of the video device node.
    pub video_path: PathBuf,
    /// Path of the media controller node.
    pub media_path: PathBuf,
    /// Timeout for every poll arm (requests and controller).
    pub poll_timeout: Duration,
    /// Number of request objects to allocate.
    pub request_count: usize,
    /// Number of source buffers to create.
    pub src_buffer_count: u32,
    /// Number of destination slots to create.
    pub dst_slot_count: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_path: PathBuf::from(DEFAULT_VIDEO_PATH),
            media_path: PathBuf::from(DEFAULT_MEDIA_PATH),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            request_count: DEFAULT_REQUEST_COUNT,
            src_buffer_count: DEFAULT_SRC_BUFFER_COUNT,
            dst_slot_count: DEFAULT_DST_SLOT_COUNT,
        }
    }
}

impl MediaConfig {
    /// Set the video device path.
    pub fn with_video_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.video_path = path.into();
        self
    }

    /// Set the media controller path.
    pub fn with_media_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.media_path = path.into();
        self
    }

    /// Set the poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the number of request objects.
    pub fn with_request_count(mut self, count: usize) -> Self {
        self.request_count = count;
        self
    }

    /// Set the number of source buffers.
    pub fn with_src_buffer_count(mut self, count: u32) -> Self {
        self.src_buffer_count = count;
        self
    }

    /// Set the number of destination slots.
    pub fn with_dst_slot_count(mut self, count: u32) -> Self {
        self.dst_slot_count = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MediaConfig::default();
        assert_eq!(config.poll_timeout, Duration::from_secs(2));
        assert_eq!(config.media_path, PathBuf::from("/dev/media0"));
        assert_eq!(config.request_count, DEFAULT_REQUEST_COUNT);
    }

    #[test]
    fn test_builders() {
        let config = MediaConfig::default()
            .with_video_path("/dev/video10")
            .with_poll_timeout(Duration::from_millis(50))
            .with_request_count(4)
            .with_src_buffer_count(3)
            .with_dst_slot_count(8);

        assert_eq!(config.video_path, PathBuf::from("/dev/video10"));
        assert_eq!(config.poll_timeout, Duration::from_millis(50));
        assert_eq!(config.request_count, 4);
        assert_eq!(config.src_buffer_count, 3);
        assert_eq!(config.dst_slot_count, 8);
    }
}
