//! Networked camera capture.
//!
//! Fetches a still frame from an ESP32-CAM-style device over plain
//! HTTP. Every request carries a millisecond timestamp query parameter
//! to defeat device-side caching, and a fixed short timeout so a dead
//! camera can never wedge the service.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera did not respond within {0:?}")]
    Timeout(Duration),
    #[error("camera returned HTTP {0}")]
    Status(u16),
    #[error("capture request failed: {0}")]
    Request(String),
}

/// Fetch one frame from `http://<ip>/capture`, cache-busted with the
/// current timestamp. Returns the raw (typically JPEG) bytes.
pub async fn fetch_frame(ip_address: &str, timeout: Duration) -> Result<Vec<u8>, CaptureError> {
    let url = capture_url(ip_address, chrono::Utc::now().timestamp_millis());

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CaptureError::Request(e.to_string()))?;

    tracing::debug!(url = %url, "fetching camera frame");
    let response = client.get(&url).send().await.map_err(|e| {
        if e.is_timeout() {
            CaptureError::Timeout(timeout)
        } else {
            CaptureError::Request(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(CaptureError::Status(status.as_u16()));
    }

    let bytes = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            CaptureError::Timeout(timeout)
        } else {
            CaptureError::Request(e.to_string())
        }
    })?;
    tracing::debug!(len = bytes.len(), "camera frame received");
    Ok(bytes.to_vec())
}

/// Probe a camera by fetching one frame; returns the frame size in
/// bytes on success.
pub async fn test_connection(ip_address: &str, timeout: Duration) -> Result<usize, CaptureError> {
    let frame = fetch_frame(ip_address, timeout).await?;
    Ok(frame.len())
}

fn capture_url(ip_address: &str, timestamp_ms: i64) -> String {
    format!("http://{ip_address}/capture?t={timestamp_ms}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_url_cache_busted() {
        let url = capture_url("192.168.1.50", 1700000000123);
        assert_eq!(url, "http://192.168.1.50/capture?t=1700000000123");
    }

    #[test]
    fn test_capture_url_distinct_per_timestamp() {
        assert_ne!(capture_url("cam", 1), capture_url("cam", 2));
    }

    #[tokio::test]
    async fn test_unreachable_camera_is_an_error() {
        // Reserved TEST-NET address; nothing listens there.
        let err = fetch_frame("192.0.2.1", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::Timeout(_) | CaptureError::Request(_)
        ));
    }
}
