//! HTTP probes: reachability GET, throughput download and captive portal check.

use std::time::{Duration, Instant};

use reqwest::StatusCode;

use super::{DownloadSample, ProbeError, StepResult};

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ERROR_LEN: usize = 120;

const GENERATE_204_URL: &str = "http://connectivitycheck.gstatic.com/generate_204";
const HOTSPOT_DETECT_URL: &str = "http://captive.apple.com/hotspot-detect.html";

/// GET `url` and time it. 2xx and 3xx count as success.
pub async fn run_http_get(client: &reqwest::Client, url: &str) -> StepResult {
    let start = Instant::now();

    let response = match client.get(url).timeout(HTTP_TIMEOUT).send().await {
        Ok(response) => response,
        Err(e) => {
            let message = if e.is_timeout() {
                ProbeError::Timeout(HTTP_TIMEOUT).to_string()
            } else {
                truncate_error(&e.to_string())
            };
            return StepResult::failure(start.elapsed(), &message);
        }
    };

    let status = response.status();
    let elapsed = start.elapsed();
    if status.is_success() || status.is_redirection() {
        StepResult::success(elapsed)
    } else {
        StepResult::failure(elapsed, &format!("http_status_{}", status.as_u16()))
    }
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut short: String = message.chars().take(MAX_ERROR_LEN).collect();
    short.push_str("...");
    short
}

/// Stream `url` into the void and report bytes and time taken.
pub async fn run_download(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<DownloadSample, ProbeError> {
    let start = Instant::now();
    let transfer = async {
        let mut response = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProbeError::Network(e.to_string()))?;

        let mut bytes = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ProbeError::Network(e.to_string()))?
        {
            bytes += chunk.len() as u64;
        }
        Ok::<u64, ProbeError>(bytes)
    };

    let bytes = tokio::time::timeout(timeout, transfer)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;

    Ok(DownloadSample {
        bytes,
        elapsed: start.elapsed(),
    })
}

/// Verdict of the generate_204 endpoint; `None` means inconclusive.
pub fn classify_generate_204(status: StatusCode) -> Option<bool> {
    match status.as_u16() {
        204 => Some(false),
        200 | 301 | 302 | 307 | 308 => Some(true),
        _ => None,
    }
}

/// Verdict of the hotspot-detect page body; `None` means inconclusive.
pub fn classify_hotspot_body(body: &str) -> Option<bool> {
    if body.contains("Success") {
        Some(false)
    } else if !body.trim().is_empty() {
        Some(true)
    } else {
        None
    }
}

/// Check two well-known connectivity endpoints. Inconclusive checks mean no portal.
///
/// `client` must not follow redirects, since a redirect is the portal signal.
pub async fn run_captive_portal_check(client: &reqwest::Client) -> bool {
    if let Ok(response) = client.get(GENERATE_204_URL).timeout(HTTP_TIMEOUT).send().await {
        if let Some(verdict) = classify_generate_204(response.status()) {
            return verdict;
        }
    }

    if let Ok(response) = client.get(HOTSPOT_DETECT_URL).timeout(HTTP_TIMEOUT).send().await {
        if let Ok(body) = response.text().await {
            if let Some(verdict) = classify_hotspot_body(&body) {
                return verdict;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_get_invalid_url() {
        let client = reqwest::Client::new();
        let result = run_http_get(&client, "http://256.256.256.256").await;
        assert!(!result.ok);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_download_invalid_url() {
        let client = reqwest::Client::new();
        let result = run_download(&client, "http://256.256.256.256/x", Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_classify_generate_204() {
        assert_eq!(classify_generate_204(StatusCode::NO_CONTENT), Some(false));
        assert_eq!(classify_generate_204(StatusCode::FOUND), Some(true));
        assert_eq!(classify_generate_204(StatusCode::OK), Some(true));
        assert_eq!(classify_generate_204(StatusCode::SERVICE_UNAVAILABLE), None);
    }

    #[test]
    fn test_classify_hotspot_body() {
        let apple = "<HTML><HEAD><TITLE>Success</TITLE></HEAD><BODY>Success</BODY></HTML>";
        assert_eq!(classify_hotspot_body(apple), Some(false));
        assert_eq!(classify_hotspot_body("<html>Please log in</html>"), Some(true));
        assert_eq!(classify_hotspot_body("  "), None);
    }

    #[test]
    fn test_truncate_error() {
        assert_eq!(truncate_error("short"), "short");
        let long = "x".repeat(200);
        let short = truncate_error(&long);
        assert_eq!(short.len(), MAX_ERROR_LEN + 3);
        assert!(short.ends_with("..."));
    }
}
