//! モデル推論機能

use std::path::Path;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use tracing::{debug, info};

use crate::error::ModelError;
use crate::ml::ml_model::{ModelConfig, PreferenceClassifier};
use crate::model::{
    artifact_path, load_model_with_metadata, print_metadata_info, ModelMetadata, FORMAT_VERSION,
};
use crate::types::{BatchTensor, PixelTensor, PredictionResult};

/// バッチを受け取り、サンプルごとの確率を返すモデル
///
/// 推論サービスはこのトレイト越しにモデルを呼び出します。
pub trait ProbabilityModel {
    /// 確率（0.0〜1.0）をサンプル順に返す
    fn predict(&self, batch: &BatchTensor) -> Result<Vec<f32>, ModelError>;

    /// 1枚を1件のバッチとして推論
    fn predict_pixel(&self, pixel: PixelTensor) -> Result<PredictionResult, ModelError> {
        let probabilities = self.predict(&pixel.into_batch())?;
        let probability = probabilities
            .first()
            .copied()
            .ok_or_else(|| ModelError::Inference("model returned no output".to_string()))?;
        Ok(PredictionResult::from_probability(probability))
    }
}

/// 推論エンジン
///
/// 学習済みモデルを保持し、ドロップアウト無効の状態で推論します。
pub struct InferenceEngine<B: Backend> {
    model: PreferenceClassifier<B>,
    config: ModelConfig,
    metadata: Option<ModelMetadata>,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    ///
    /// 成果物が壊れている・形式が合わない場合はここで失敗します。
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self, ModelError> {
        let path = artifact_path(model_path.as_ref());
        let path = path.as_path();
        info!("モデルを読み込み中: {}", path.display());

        // model.bin のバイト数とCRC32はここで検証済み
        let (metadata, model_binary) = load_model_with_metadata(path)?;

        if metadata.format_version != FORMAT_VERSION {
            return Err(ModelError::load(
                path,
                format!(
                    "unsupported format version {} (expected {})",
                    metadata.format_version, FORMAT_VERSION
                ),
            ));
        }

        let config = metadata.architecture.clone();
        config.validate().map_err(|e| ModelError::load(path, e))?;
        if metadata.input_shape != config.input_shape() {
            return Err(ModelError::load(
                path,
                format!(
                    "input shape {:?} does not match architecture {:?}",
                    metadata.input_shape,
                    config.input_shape()
                ),
            ));
        }

        // 同じ構成で初期化してから重みを復元
        let model = config
            .init::<B>(&device)
            .and_then(|model| model.load_bytes(model_binary, &device))
            .map_err(|e| ModelError::load(path, e))?;

        print_metadata_info(&metadata);

        Ok(Self {
            model,
            config,
            metadata: Some(metadata),
            device,
        })
    }

    /// 学習直後などメモリ上のモデルから作成
    pub fn from_model(model: PreferenceClassifier<B>, config: ModelConfig, device: B::Device) -> Self {
        Self {
            model,
            config,
            metadata: None,
            device,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// 成果物から読み込んだ場合のメタデータ
    pub fn metadata(&self) -> Option<&ModelMetadata> {
        self.metadata.as_ref()
    }
}

impl<B: Backend> ProbabilityModel for InferenceEngine<B> {
    fn predict(&self, batch: &BatchTensor) -> Result<Vec<f32>, ModelError> {
        let dims = batch.dims();
        let expected = self.config.input_shape();
        if dims[1..] != expected[..] {
            return Err(ModelError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: dims[1..].to_vec(),
            });
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        debug!("[Inference] 入力 {:?}", dims);

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(batch.as_slice().to_vec(), dims),
            &self.device,
        );

        // 出力 [N, 1]
        let probabilities = self
            .model
            .predict(images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| ModelError::Inference(format!("failed to read probabilities: {:?}", e)))?;

        Ok(probabilities)
    }
}
