//! モデルメタデータの定義
//!
//! tar.gz形式の成果物に `metadata.json` として同梱されます。
//! アーキテクチャ設定を含むため、読み込み側はこれだけでモデルを再構築できます。

use serde::{Deserialize, Serialize};

use crate::ml::dataset::DatasetSummary;
use crate::ml::ml_model::ModelConfig;
use crate::ml::training::{EpochMetrics, FitOptions};

/// 成果物フォーマットのバージョン
pub const FORMAT_VERSION: u32 = 1;

fn weights_crc32(bytes: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(bytes);
    crc.sum()
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// 成果物フォーマットのバージョン
    pub format_version: u32,

    /// 層構成とハイパーパラメータ
    pub architecture: ModelConfig,

    /// 1サンプルの入力形状 [H, W, C]
    pub input_shape: [usize; 3],

    /// 学習に使った画像の枚数
    pub dataset: DatasetSummary,

    /// 学習エポック数
    pub num_epochs: usize,

    pub batch_size: usize,

    pub validation_split: f64,

    /// 最終エポックの指標
    #[serde(default)]
    pub final_metrics: Option<EpochMetrics>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,

    /// model.bin のバイト数（保存時に記録）
    pub weights_len: u64,

    /// model.bin のCRC32（保存時に記録）
    pub weights_crc32: u32,
}

impl ModelMetadata {
    /// 新しいメタデータを作成（学習時刻は現在時刻）
    pub fn new(
        architecture: ModelConfig,
        dataset: DatasetSummary,
        options: &FitOptions,
        final_metrics: Option<EpochMetrics>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();
        let input_shape = architecture.input_shape();

        Self {
            format_version: FORMAT_VERSION,
            architecture,
            input_shape,
            dataset,
            num_epochs: options.epochs,
            batch_size: options.batch_size,
            validation_split: options.validation_split,
            final_metrics,
            trained_at,
            weights_len: 0,
            weights_crc32: 0,
        }
    }

    /// 重みのバイト数とCRC32を記録
    pub fn with_weights(mut self, model_binary: &[u8]) -> Self {
        self.weights_len = model_binary.len() as u64;
        self.weights_crc32 = weights_crc32(model_binary);
        self
    }

    /// 読み込んだ重みが保存時と同じか確認
    pub fn verify_weights(&self, model_binary: &[u8]) -> Result<(), String> {
        if model_binary.len() as u64 != self.weights_len {
            return Err(format!(
                "model.bin is {} bytes, metadata records {}",
                model_binary.len(),
                self.weights_len
            ));
        }
        let crc = weights_crc32(model_binary);
        if crc != self.weights_crc32 {
            return Err(format!(
                "model.bin checksum {:08x} does not match metadata {:08x}",
                crc, self.weights_crc32
            ));
        }
        Ok(())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_keeps_architecture_and_summary() {
        let metadata = ModelMetadata::new(
            ModelConfig::new(),
            DatasetSummary {
                positive: 12,
                negative: 30,
                skipped: 1,
            },
            &FitOptions::default(),
            None,
        );

        let json = metadata.to_json_string().unwrap();
        let parsed = ModelMetadata::from_json_string(&json).unwrap();

        assert_eq!(parsed.format_version, FORMAT_VERSION);
        assert_eq!(parsed.input_shape, [224, 224, 3]);
        assert!(parsed.architecture.same_architecture(&ModelConfig::new()));
        assert_eq!(parsed.dataset.total(), 42);
        assert_eq!(parsed.num_epochs, 50);
        assert_eq!(parsed.batch_size, 32);
        assert!(parsed.final_metrics.is_none());
    }

    #[test]
    fn weights_digest_detects_changed_bytes() {
        let metadata = ModelMetadata::new(
            ModelConfig::new(),
            DatasetSummary::default(),
            &FitOptions::default(),
            None,
        )
        .with_weights(&[1, 2, 3, 4]);

        assert_eq!(metadata.weights_len, 4);
        assert!(metadata.verify_weights(&[1, 2, 3, 4]).is_ok());
        assert!(metadata.verify_weights(&[1, 2, 3]).is_err());
        assert!(metadata.verify_weights(&[1, 2, 3, 5]).is_err());
    }

    #[test]
    fn trained_at_is_rfc3339() {
        let metadata = ModelMetadata::new(
            ModelConfig::new(),
            DatasetSummary::default(),
            &FitOptions::default(),
            None,
        );
        assert!(chrono::DateTime::parse_from_rfc3339(&metadata.trained_at).is_ok());
    }
}
