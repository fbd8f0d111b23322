//! 好みの画像を判定する二値分類CNN
//!
//! - `ml`: 前処理・データセット構築・モデル・学習・推論
//! - `model`: 成果物（tar.gz）と設定ファイル
//! - `analyzer`: 画像参照の解決と取得、並行判定サービス

pub mod analyzer;
pub mod error;
pub mod ml;
pub mod model;
pub mod types;

pub use error::{AnalyzeError, DatasetError, FetchError, ModelError, PreprocessError, TrainingError};
pub use types::{
    AnalyzeRequest, AnalyzeResponse, BatchTensor, ImageRequest, LabelVector, PixelTensor,
    PredictionResult, TrainingSet, DECISION_THRESHOLD, IMAGE_SIZE,
};

/// ログ出力を初期化（`RUST_LOG` 未指定時は info）
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 二重初期化はエラーになるだけなので無視する
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
