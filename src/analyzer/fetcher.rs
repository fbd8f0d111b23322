//! 画像の取得
//!
//! 推論サービスは `ImageFetcher` 越しに画像バイト列を受け取ります。
//! 本番はHTTP、テストはメモリ上のスタブに差し替えます。

use std::future::Future;
use std::time::Duration;

use tracing::debug;
use url::Url;

use crate::error::FetchError;

/// URLから画像バイト列を取得する
pub trait ImageFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &Url) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// reqwestによるHTTP取得
///
/// 2xx以外のステータス、接続失敗、タイムアウトはすべてエラーになります。
/// リトライはしません。
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        debug!("画像を取得中: {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(url, e))?;

        Ok(body.to_vec())
    }
}

fn transport_error(url: &Url, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(url.to_string())
    } else {
        FetchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}
