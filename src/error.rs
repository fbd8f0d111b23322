//! エラー型の定義
//!
//! 前処理・データセット構築・画像取得・モデル・学習・推論の各段階ごとに
//! 型付きのエラーを持ちます。

use std::path::PathBuf;

use thiserror::Error;

/// 画像の前処理で発生するエラー
#[derive(Debug, Error)]
pub enum PreprocessError {
    /// 画像としてデコードできないバイト列
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// 前処理後のテンソル形状が不正
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

impl PreprocessError {
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode(reason.into())
    }

    pub fn shape(expected: &[usize], actual: &[usize]) -> Self {
        Self::Shape {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// 学習データセット構築時のエラー
#[derive(Debug, Error)]
pub enum DatasetError {
    /// 有効な画像が1枚も無い
    #[error("no training data found (positive: {positive_dir:?}, negative: {negative_dir:?})")]
    NoTrainingData {
        positive_dir: PathBuf,
        negative_dir: Option<PathBuf>,
    },

    /// ディレクトリの走査に失敗
    #[error("failed to read directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 画像とラベルの件数が一致しない
    #[error("sample/label count mismatch: {images} images, {labels} labels")]
    LengthMismatch { images: usize, labels: usize },
}

/// 画像取得時のエラー
#[derive(Debug, Error)]
pub enum FetchError {
    /// 画像参照をURLとして解決できない
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidUrl { reference: String, reason: String },

    /// 2xx以外のステータス
    #[error("HTTP error fetching '{url}': {status}")]
    Status { url: String, status: u16 },

    /// タイムアウト
    #[error("timed out fetching '{0}'")]
    Timeout(String),

    /// 接続やボディ読み込みの失敗
    #[error("failed to fetch '{url}': {reason}")]
    Transport { url: String, reason: String },
}

/// モデルの構築・保存・読み込み・推論のエラー
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to load model artifact from {path:?}: {reason}")]
    LoadArtifact { path: PathBuf, reason: String },

    #[error("failed to save model artifact to {path:?}: {reason}")]
    SaveArtifact { path: PathBuf, reason: String },

    /// 重みのシリアライズに失敗
    #[error("failed to save model weights: {0}")]
    SaveWeights(String),

    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    #[error("input shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("inference failed: {0}")]
    Inference(String),
}

impl ModelError {
    pub fn load(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::LoadArtifact {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn save(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::SaveArtifact {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// 学習処理全体のエラー
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("invalid training options: {0}")]
    InvalidOptions(String),

    #[error("numerical instability: {0}")]
    NumericalInstability(String),
}

/// 推論（画像解析）処理のエラー
#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// ブロッキングタスクの異常終了やロックの汚染
    #[error("analysis task failed: {0}")]
    Task(String),
}
