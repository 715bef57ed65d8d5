use std::time::{Duration, Instant};

use color_eyre::Result;
use futures::StreamExt;
use reqwest::StatusCode;
use tracing::{debug, info};

use crate::types::{ErrorCode, RetrievalResult};

/// Timed prefix download of a piece over HTTP(S).
pub struct HttpClient {
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            timeout,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// `GET {base}/piece/{cid}`, reading at most `length` bytes. The
    /// time to first body byte is the ttfb; an early end of body is a
    /// short but successful download.
    pub async fn retrieve_piece(
        &self,
        base: &str,
        piece_cid: &str,
        length: u64,
    ) -> Result<RetrievalResult> {
        let url = format!("{}/piece/{}", base.trim_end_matches('/'), piece_cid);

        info!(%url, "sending request to host");
        let started = Instant::now();
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                return Ok(RetrievalResult::error(ErrorCode::CannotConnect, err));
            }
        };

        let status = response.status();
        debug!(%status, "received response from host");
        if status == StatusCode::NOT_FOUND {
            return Ok(RetrievalResult::error(
                ErrorCode::NotFound,
                format!("status code: {}", status.as_u16()),
            ));
        }
        if status.as_u16() >= 300 {
            return Ok(RetrievalResult::error(
                ErrorCode::RetrievalFailure,
                format!("status code: {}", status.as_u16()),
            ));
        }

        let mut ttfb = None;
        let mut downloaded = 0_u64;
        let mut body = response.bytes_stream();

        let copy = async {
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => return Some(err),
                };
                ttfb.get_or_insert_with(|| started.elapsed());
                downloaded += chunk.len() as u64;
                if downloaded >= length {
                    break;
                }
            }
            None
        };

        match tokio::time::timeout(self.timeout, copy).await {
            Ok(Some(err)) => {
                return Ok(RetrievalResult::error(ErrorCode::RetrievalFailure, err));
            }
            Ok(None) => {}
            Err(_) => {
                return Ok(RetrievalResult::error(
                    ErrorCode::Timeout,
                    format!("timed out after {:?}", self.timeout),
                ));
            }
        }

        if downloaded == 0 {
            return Ok(RetrievalResult::error(
                ErrorCode::RetrievalFailure,
                "empty response body",
            ));
        }

        let duration = started.elapsed();
        Ok(RetrievalResult::success(
            ttfb.unwrap_or(duration),
            downloaded.min(length),
            duration,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PIECE: &str = "baga6ea4seaqao7s73y24kcutaosvacpdjgfe5pw76ooefnyqw4ynr3d2y6x2mpq";

    #[tokio::test]
    async fn successful_download_is_timed_and_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/piece/{PIECE}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7_u8; 4096]))
            .mount(&server)
            .await;

        let client = HttpClient::new(Duration::from_secs(5)).unwrap();
        let result = client
            .retrieve_piece(&server.uri(), PIECE, 1024)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.downloaded, 1024);
        assert!(result.ttfb > Duration::ZERO);
        assert!(result.duration >= result.ttfb);
        assert!(result.speed > 0.0);
    }

    #[tokio::test]
    async fn short_body_is_still_a_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/piece/{PIECE}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7_u8; 100]))
            .mount(&server)
            .await;

        let client = HttpClient::new(Duration::from_secs(5)).unwrap();
        let result = client
            .retrieve_piece(&server.uri(), PIECE, 1_048_576)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.downloaded, 100);
    }

    #[tokio::test]
    async fn missing_piece_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/piece/{PIECE}")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpClient::new(Duration::from_secs(5)).unwrap();
        let result = client
            .retrieve_piece(&server.uri(), PIECE, 1024)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn server_errors_map_to_retrieval_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/piece/{PIECE}")))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpClient::new(Duration::from_secs(5)).unwrap();
        let result = client
            .retrieve_piece(&server.uri(), PIECE, 1024)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::RetrievalFailure));
    }

    #[tokio::test]
    async fn unreachable_host_maps_to_cannot_connect() {
        let client = HttpClient::new(Duration::from_secs(1)).unwrap();
        let result = client
            .retrieve_piece("http://127.0.0.1:1", PIECE, 1024)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::CannotConnect));
    }
}
