//! 画像解析サービス
//!
//! 画像参照の解決 → 取得 → 前処理 → 推論 → 閾値判定 を1件ずつ、
//! または複数件を並行に実行します。
//!
//! モデルは `Arc<Mutex<_>>` で共有し、推論は常にロックを取って1件ずつ
//! 実行します。取得と前処理は並行に進みます。

use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::analyzer::fetcher::ImageFetcher;
use crate::analyzer::image_ref::ImageRefResolver;
use crate::error::AnalyzeError;
use crate::ml::inference::ProbabilityModel;
use crate::ml::preprocess::preprocess;
use crate::types::{AnalyzeRequest, AnalyzeResponse, ImageRequest, PredictionResult};

/// 同時に処理する画像数のデフォルト
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// 画像解析サービス
pub struct ImageAnalyzer<M, F> {
    model: Arc<Mutex<M>>,
    fetcher: Arc<F>,
    resolver: ImageRefResolver,
    max_concurrency: usize,
}

impl<M, F> Clone for ImageAnalyzer<M, F> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            fetcher: Arc::clone(&self.fetcher),
            resolver: self.resolver.clone(),
            max_concurrency: self.max_concurrency,
        }
    }
}

impl<M, F> ImageAnalyzer<M, F>
where
    M: ProbabilityModel + Send + 'static,
    F: ImageFetcher,
{
    pub fn new(model: M, fetcher: F, resolver: ImageRefResolver) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            fetcher: Arc::new(fetcher),
            resolver,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// 同時処理数の上限（最低1）
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// 1件を判定
    pub async fn classify(&self, image_ref: &str) -> Result<PredictionResult, AnalyzeError> {
        let url = self.resolver.resolve(image_ref)?;
        let bytes = self.fetcher.fetch(&url).await?;
        debug!("{} bytes 取得: {}", bytes.len(), url);

        let model = Arc::clone(&self.model);
        let prediction = tokio::task::spawn_blocking(move || {
            let pixel = preprocess(&bytes)?;
            drop(bytes);

            let model = model
                .lock()
                .map_err(|_| AnalyzeError::Task("model lock poisoned".to_string()))?;
            Ok::<_, AnalyzeError>(model.predict_pixel(pixel)?)
        })
        .await
        .map_err(|e| AnalyzeError::Task(e.to_string()))??;

        info!("予測値: {:.4} for {}", prediction.probability, url);

        Ok(prediction)
    }

    /// 複数件を並行に判定し、入力順に結果を返す
    pub async fn classify_each(
        &self,
        items: &[ImageRequest],
    ) -> Vec<(String, Result<PredictionResult, AnalyzeError>)> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();

        for (index, item) in items.iter().enumerate() {
            let analyzer = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let image_ref = item.url.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (index, analyzer.classify(&image_ref).await)
            });
        }

        let mut results: Vec<Option<Result<PredictionResult, AnalyzeError>>> =
            items.iter().map(|_| None).collect();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!("解析タスクが異常終了しました: {}", e),
            }
        }

        items
            .iter()
            .zip(results)
            .map(|(item, result)| {
                let result = result
                    .unwrap_or_else(|| Err(AnalyzeError::Task("task did not complete".to_string())));
                (item.id.clone(), result)
            })
            .collect()
    }

    /// 「好み」と判定されたIDを入力順に返す
    ///
    /// 個別の失敗はログに残して除外します。
    pub async fn classify_many(&self, items: &[ImageRequest]) -> Vec<String> {
        let mut preferred = Vec::new();

        for (id, result) in self.classify_each(items).await {
            match result {
                Ok(prediction) if prediction.is_preferred => preferred.push(id),
                Ok(_) => {}
                Err(e) => warn!("画像 {} の解析に失敗しました: {}", id, e),
            }
        }

        info!("{}件中{}件が好みと判定されました", items.len(), preferred.len());
        preferred
    }

    /// `{ images: [...] }` → `{ preferredIds: [...] }`
    pub async fn analyze(&self, request: &AnalyzeRequest) -> AnalyzeResponse {
        AnalyzeResponse {
            preferred_ids: self.classify_many(&request.images).await,
        }
    }
}
