use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::breaker::CircuitBreaker;
use crate::config::constants;
use crate::settings::Settings;
use crate::transport::HttpTransport;

/// Orientation fixes applied to every captured frame, in this order:
/// horizontal flip, vertical flip, then a 90° counter-clockwise rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageTransform {
    pub flip_h: bool,
    pub flip_v: bool,
    pub rotate: bool,
}

impl From<&Settings> for ImageTransform {
    fn from(settings: &Settings) -> Self {
        Self {
            flip_h: settings.flip_h,
            flip_v: settings.flip_v,
            rotate: settings.rotate,
        }
    }
}

/// Webcam snapshot source guarded by a per-URL circuit breaker.
///
/// After [`constants::SNAPSHOT_FAILURE_LIMIT`] consecutive failures a URL is
/// not contacted again until [`constants::SNAPSHOT_COOLDOWN`] has passed. A
/// successful fetch clears the failure count.
pub struct SnapshotFetcher {
    transport: Arc<dyn HttpTransport>,
    breaker: Mutex<CircuitBreaker<String>>,
}

impl SnapshotFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            breaker: Mutex::new(CircuitBreaker::new(
                constants::SNAPSHOT_FAILURE_LIMIT,
                constants::SNAPSHOT_COOLDOWN,
            )),
        }
    }

    /// Fetch a frame from the configured snapshot URL and return it as a
    /// transformed PNG.
    ///
    /// Returns `None` when the URL is cooling down, the fetch fails, or the
    /// frame cannot be decoded. Failures are logged, never raised.
    pub async fn capture(&self, settings: &Settings) -> Option<Vec<u8>> {
        let url = settings.snapshot_url.clone();
        if url.is_empty() {
            return None;
        }
        if self.breaker.lock().is_open(&url) {
            debug!("Snapshot URL {} is cooling down, skipping capture", url);
            return None;
        }

        let raw = self.fetch(&url).await?;
        match apply_image_transformations(&raw, ImageTransform::from(settings)) {
            Ok(png) => Some(png),
            Err(e) => {
                warn!("Failed to transform snapshot from {}: {}", url, e);
                None
            }
        }
    }

    async fn fetch(&self, url: &str) -> Option<Vec<u8>> {
        let failure = match self
            .transport
            .get(url, None, Some(constants::SHORT_REQUEST_TIMEOUT))
            .await
        {
            Ok(response) if response.is_success() => {
                self.breaker.lock().record_success(&url.to_string());
                return Some(response.body);
            }
            Ok(response) => format!("HTTP {}", response.status),
            Err(e) => e.to_string(),
        };

        let tripped = self.breaker.lock().record_failure(&url.to_string());
        warn!("Failed to fetch snapshot from {}: {}", url, failure);
        if tripped {
            info!(
                "Snapshot URL {} failed repeatedly, pausing captures for {:?}",
                url,
                constants::SNAPSHOT_COOLDOWN
            );
        }
        None
    }
}

/// Decode `image_data`, apply `transform` and re-encode as PNG.
///
/// # Errors
///
/// Returns an error if the bytes are not a supported image format or the
/// PNG encoder fails.
pub fn apply_image_transformations(image_data: &[u8], transform: ImageTransform) -> Result<Vec<u8>> {
    let mut image = image::load_from_memory(image_data)?;

    if transform.flip_h {
        image = image.fliph();
    }
    if transform.flip_v {
        image = image.flipv();
    }
    if transform.rotate {
        image = image.rotate270();
    }

    let mut buffer = Vec::new();
    image.write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::transport::mock::MockTransport;

    const RED: Rgb<u8> = Rgb([255, 0, 0]);
    const BLUE: Rgb<u8> = Rgb([0, 0, 255]);

    /// 2x1 image: red on the left, blue on the right.
    fn two_pixel_png() -> Vec<u8> {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, RED);
        img.put_pixel(1, 0, BLUE);
        let mut buffer = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
            .unwrap();
        buffer
    }

    fn decode(png: &[u8]) -> RgbImage {
        image::load_from_memory(png).unwrap().to_rgb8()
    }

    fn settings() -> Settings {
        Settings {
            snapshot_url: "http://cam.local/snapshot".to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn test_no_transform_keeps_pixels() {
        let out = decode(&apply_image_transformations(&two_pixel_png(), ImageTransform::default()).unwrap());
        assert_eq!(out.dimensions(), (2, 1));
        assert_eq!(*out.get_pixel(0, 0), RED);
    }

    #[test]
    fn test_horizontal_flip() {
        let transform = ImageTransform {
            flip_h: true,
            ..ImageTransform::default()
        };
        let out = decode(&apply_image_transformations(&two_pixel_png(), transform).unwrap());
        assert_eq!(*out.get_pixel(0, 0), BLUE);
        assert_eq!(*out.get_pixel(1, 0), RED);
    }

    #[test]
    fn test_rotate_is_counter_clockwise() {
        let transform = ImageTransform {
            rotate: true,
            ..ImageTransform::default()
        };
        let out = decode(&apply_image_transformations(&two_pixel_png(), transform).unwrap());
        assert_eq!(out.dimensions(), (1, 2));
        // The right-hand pixel ends up on top.
        assert_eq!(*out.get_pixel(0, 0), BLUE);
        assert_eq!(*out.get_pixel(0, 1), RED);
    }

    #[test]
    fn test_flip_happens_before_rotate() {
        let transform = ImageTransform {
            flip_h: true,
            flip_v: false,
            rotate: true,
        };
        let out = decode(&apply_image_transformations(&two_pixel_png(), transform).unwrap());
        assert_eq!(*out.get_pixel(0, 0), RED);
        assert_eq!(*out.get_pixel(0, 1), BLUE);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(apply_image_transformations(b"not an image", ImageTransform::default()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_stops_requests_after_four_failures() {
        let transport = Arc::new(MockTransport::new(500, b""));
        let fetcher = SnapshotFetcher::new(transport.clone());
        let settings = settings();

        for _ in 0..4 {
            assert!(fetcher.capture(&settings).await.is_none());
        }
        assert_eq!(transport.call_count(), 4);

        assert!(fetcher.capture(&settings).await.is_none());
        assert_eq!(transport.call_count(), 4);

        tokio::time::advance(constants::SNAPSHOT_COOLDOWN + Duration::from_millis(1)).await;
        assert!(fetcher.capture(&settings).await.is_none());
        assert_eq!(transport.call_count(), 5);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let transport = Arc::new(MockTransport::new(200, &two_pixel_png()));
        transport.push_status(500, b"");
        transport.push_status(500, b"");
        transport.push_status(500, b"");
        let fetcher = SnapshotFetcher::new(transport.clone());
        let settings = settings();

        for _ in 0..3 {
            assert!(fetcher.capture(&settings).await.is_none());
        }
        assert!(fetcher.capture(&settings).await.is_some());
        assert_eq!(
            fetcher.breaker.lock().failures(&settings.snapshot_url),
            0
        );
    }

    #[tokio::test]
    async fn test_empty_url_makes_no_request() {
        let transport = Arc::new(MockTransport::ok());
        let fetcher = SnapshotFetcher::new(transport.clone());
        let settings = Settings {
            snapshot_url: String::new(),
            ..Settings::default()
        };
        assert!(fetcher.capture(&settings).await.is_none());
        assert_eq!(transport.call_count(), 0);
    }
}
