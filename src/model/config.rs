//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、学習データの場所、推論サービスの設定をJSON形式で
//! 保存・読み込みします。

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ml::training::FitOptions;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 学習設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// 好みの画像のディレクトリ（ラベル1）
    pub positive_dir: PathBuf,
    /// その他の画像のディレクトリ（ラベル0、存在する場合のみ使用）
    pub negative_dir: PathBuf,
    /// 学習済みモデルの保存先
    pub model_path: PathBuf,
    pub epochs: usize,
    pub batch_size: usize,
    /// 検証用に取り分ける割合
    pub validation_split: f64,
    /// シャッフル用シード（未指定ならランダム）
    pub seed: Option<u64>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            positive_dir: PathBuf::from("images/preferred"),
            negative_dir: PathBuf::from("images/others"),
            model_path: PathBuf::from("model/preference_classifier.tar.gz"),
            epochs: 50,
            batch_size: 32,
            validation_split: 0.2,
            seed: None,
        }
    }
}

impl TrainingSettings {
    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            epochs: self.epochs,
            batch_size: self.batch_size,
            validation_split: self.validation_split,
            seed: self.seed,
        }
    }
}

/// 推論サービス設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// 読み込むモデルのパス
    pub model_path: PathBuf,
    /// `//host/...` や `/path` を解決する基準オリジン
    pub origin: String,
    /// 画像取得のタイムアウト（秒）
    pub fetch_timeout_secs: u64,
    /// 同時に取得・前処理する画像数の上限
    pub max_concurrent_fetches: usize,
    pub user_agent: String,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model/preference_classifier.tar.gz"),
            origin: "https://with.is".to_string(),
            fetch_timeout_secs: 30,
            max_concurrent_fetches: 4,
            user_agent: format!("face-preference/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl InferenceSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// 学習設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// 推論設定
    #[serde(default)]
    pub inference: InferenceSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                warn!(
                    "設定ファイルの読み込みに失敗しました ({}): {:#}。デフォルト設定を使用します",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定情報をログに表示
    pub fn display(&self) {
        info!("=== アプリケーション設定 ===");
        info!("計算デバイス: {}", self.device_type);
        info!("--- 学習設定 ---");
        info!("好みの画像: {}", self.training.positive_dir.display());
        info!("その他の画像: {}", self.training.negative_dir.display());
        info!("モデル保存先: {}", self.training.model_path.display());
        info!(
            "エポック数: {}, バッチサイズ: {}, 検証割合: {}",
            self.training.epochs, self.training.batch_size, self.training.validation_split
        );
        info!("--- 推論設定 ---");
        info!("モデル: {}", self.inference.model_path.display());
        info!("オリジン: {}", self.inference.origin);
        info!(
            "タイムアウト: {}秒, 同時取得数: {}",
            self.inference.fetch_timeout_secs, self.inference.max_concurrent_fetches
        );
    }
}
