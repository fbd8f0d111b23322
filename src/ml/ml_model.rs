//! 機械学習モデルの共通定義
//!
//! 「好み」判定用の二値分類CNNと関連する設定を提供します。

use std::panic::{self, AssertUnwindSafe};

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::BinaryCrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Initializer, Linear, LinearConfig, Relu,
    },
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{activation::sigmoid, backend::Backend, Int, Tensor},
};

use crate::error::ModelError;
use crate::types::CHANNELS;

/// 重みレコードのエントリ名（エラー表示用）
const MODEL_BINARY: &str = "model.bin";

/// モデル設定
///
/// デフォルト値が本番のアーキテクチャです。学習・保存・読み込み・推論で
/// 重みの互換性を保つため、同じ値を使い続ける必要があります。
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    /// Conv1のフィルタ数
    #[config(default = 32)]
    pub conv1_filters: usize,
    /// Conv2のフィルタ数
    #[config(default = 64)]
    pub conv2_filters: usize,
    /// 全結合層のユニット数
    #[config(default = 128)]
    pub hidden_units: usize,
    /// ドロップアウト率（学習時のみ有効）
    #[config(default = 0.5)]
    pub dropout: f64,
    /// Adamの学習率
    #[config(default = 1e-4)]
    pub learning_rate: f64,
}

impl ModelConfig {
    /// Pool2後の特徴マップの一辺
    ///
    /// - Conv (3x3, no padding): size -> size - 2
    /// - Pool (2x2, stride 2): size -> size / 2 (切り捨て)
    pub fn feature_map_size(&self) -> usize {
        let after_conv1 = self.image_size.saturating_sub(2);
        let after_pool1 = after_conv1 / 2;
        let after_conv2 = after_pool1.saturating_sub(2);
        after_conv2 / 2
    }

    /// Flatten後の特徴次元
    pub fn flatten_dim(&self) -> usize {
        let size = self.feature_map_size();
        self.conv2_filters * size * size
    }

    /// 1サンプルの入力形状 [H, W, C]
    pub fn input_shape(&self) -> [usize; 3] {
        [self.image_size, self.image_size, CHANNELS]
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.feature_map_size() == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "input size too small: {} (at least 10x10 required)",
                self.image_size
            )));
        }
        if self.conv1_filters == 0 || self.conv2_filters == 0 || self.hidden_units == 0 {
            return Err(ModelError::InvalidConfig(
                "layer widths must be greater than zero".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(self.learning_rate > 0.0) {
            return Err(ModelError::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }

    /// 重みの互換性がある（層の形状が同じ）かどうか
    pub fn same_architecture(&self, other: &ModelConfig) -> bool {
        self.image_size == other.image_size
            && self.conv1_filters == other.conv1_filters
            && self.conv2_filters == other.conv2_filters
            && self.hidden_units == other.hidden_units
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<PreferenceClassifier<B>, ModelError> {
        self.validate()?;

        let glorot = Initializer::XavierUniform { gain: 1.0 };
        let d = self.flatten_dim();

        tracing::debug!(
            "[Model] 入力 {}x{}x{} -> 特徴マップ {}x{}x{} -> Flatten {} -> FC {} -> 1",
            self.image_size,
            self.image_size,
            CHANNELS,
            self.conv2_filters,
            self.feature_map_size(),
            self.feature_map_size(),
            d,
            self.hidden_units
        );

        Ok(PreferenceClassifier {
            // Conv1: 3x3 (no padding, stride 1)
            conv1: Conv2dConfig::new([CHANNELS, self.conv1_filters], [3, 3])
                .with_stride([1, 1])
                .with_initializer(glorot.clone())
                .init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            // Conv2: 3x3 (no padding, stride 1)
            conv2: Conv2dConfig::new([self.conv1_filters, self.conv2_filters], [3, 3])
                .with_stride([1, 1])
                .with_initializer(glorot.clone())
                .init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            fc1: LinearConfig::new(d, self.hidden_units)
                .with_initializer(glorot.clone())
                .init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.hidden_units, 1)
                .with_initializer(glorot)
                .init(device),

            activation: Relu::new(),
        })
    }
}

/// 「好み」判定用CNNモデル
///
/// # アーキテクチャ
/// - Conv 3x3 (32) + ReLU + MaxPool 2x2
/// - Conv 3x3 (64) + ReLU + MaxPool 2x2
/// - Flatten
/// - FC: d -> 128 + ReLU + Dropout(0.5)
/// - FC: 128 -> 1
/// - Sigmoid (推論時)
///
/// 入力は [batch, H, W, 3] (NHWC)。内部でNCHWに並べ替えます。
#[derive(Module, Debug)]
pub struct PreferenceClassifier<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,

    // 全結合層
    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> PreferenceClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, size, size, 3]
    ///
    /// # 戻り値
    /// - ロジット [batch_size, 1]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        // NHWC -> NCHW
        let x = images.permute([0, 3, 1, 2]);
        let [batch_size, _, _, _] = x.dims();

        let x = self.conv1.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        // Autodiffバックエンド以外では恒等写像
        let x = self.dropout.forward(x);

        self.fc2.forward(x)
    }

    /// 確率 [batch_size, 1]（0.0〜1.0）
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        sigmoid(self.forward(images))
    }

    /// 順伝播と二値交差エントロピー損失
    ///
    /// # 戻り値
    /// - (損失, ロジット)
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 2, Int>,
    ) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let logits = self.forward(images);
        let loss = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&logits.device())
            .forward(logits.clone(), targets);

        (loss, logits)
    }

    /// 重みをバイト列に変換（f32精度）
    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        Recorder::<B>::record(&recorder, self.clone().into_record(), ())
            .map_err(|e| ModelError::SaveWeights(format!("{:?}", e)))
    }

    /// バイト列から重みを復元
    ///
    /// 壊れたバイト列はレコーダー内部でパニックするため、ここで捕まえて
    /// `LoadArtifact` として返します。
    pub fn load_bytes(self, bytes: Vec<u8>, device: &B::Device) -> Result<Self, ModelError> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let decoded = panic::catch_unwind(AssertUnwindSafe(|| {
            Recorder::<B>::load::<<Self as Module<B>>::Record>(&recorder, bytes, device)
        }));

        let record = match decoded {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => return Err(ModelError::load(MODEL_BINARY, format!("{:?}", e))),
            Err(_) => {
                return Err(ModelError::load(
                    MODEL_BINARY,
                    "weight record could not be decoded",
                ))
            }
        };
        Ok(self.load_record(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    fn small_config() -> ModelConfig {
        ModelConfig::new()
            .with_image_size(16)
            .with_conv1_filters(4)
            .with_conv2_filters(8)
            .with_hidden_units(8)
    }

    fn ramp_batch(n: usize, size: usize) -> Tensor<TestBackend, 4> {
        let len = n * size * size * 3;
        let data: Vec<f32> = (0..len).map(|i| (i % 251) as f32 / 250.0).collect();
        Tensor::from_data(TensorData::new(data, [n, size, size, 3]), &Default::default())
    }

    #[test]
    fn default_config_is_the_fixed_architecture() {
        let config = ModelConfig::new();
        assert_eq!(config.image_size, 224);
        assert_eq!(config.conv1_filters, 32);
        assert_eq!(config.conv2_filters, 64);
        assert_eq!(config.hidden_units, 128);
        assert_eq!(config.dropout, 0.5);
        assert_eq!(config.learning_rate, 1e-4);
        // 224 -> 222 -> 111 -> 109 -> 54
        assert_eq!(config.feature_map_size(), 54);
        assert_eq!(config.flatten_dim(), 64 * 54 * 54);
    }

    #[test]
    fn too_small_input_is_rejected() {
        let config = ModelConfig::new().with_image_size(8);
        assert!(matches!(config.validate(), Err(ModelError::InvalidConfig(_))));
        assert!(config.init::<TestBackend>(&Default::default()).is_err());
    }

    #[test]
    fn predict_outputs_one_probability_per_sample() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();

        let probs = model.predict(ramp_batch(3, 16));
        assert_eq!(probs.dims(), [3, 1]);

        let values = probs.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn forward_is_deterministic_without_autodiff() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();

        let a = model.forward(ramp_batch(2, 16)).into_data().to_vec::<f32>().unwrap();
        let b = model.forward(ramp_batch(2, 16)).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn weight_bytes_round_trip_reproduces_predictions() {
        let device = Default::default();
        let config = small_config();
        let model = config.init::<TestBackend>(&device).unwrap();
        let bytes = model.to_bytes().unwrap();

        let restored = config
            .init::<TestBackend>(&device)
            .unwrap()
            .load_bytes(bytes, &device)
            .unwrap();

        let expected = model.predict(ramp_batch(2, 16)).into_data().to_vec::<f32>().unwrap();
        let actual = restored.predict(ramp_batch(2, 16)).into_data().to_vec::<f32>().unwrap();
        for (e, a) in expected.iter().zip(&actual) {
            assert!((e - a).abs() < 1e-5, "{} != {}", e, a);
        }
    }

    #[test]
    fn corrupted_weight_bytes_fail_to_load() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();
        let err = model.load_bytes(vec![1, 2, 3, 4], &device).unwrap_err();
        assert!(matches!(err, ModelError::LoadArtifact { .. }), "got {:?}", err);
    }

    #[test]
    fn truncated_weight_bytes_fail_to_load() {
        let device = Default::default();
        let config = small_config();
        let mut bytes = config.init::<TestBackend>(&device).unwrap().to_bytes().unwrap();
        bytes.truncate(bytes.len() / 2);

        let err = config
            .init::<TestBackend>(&device)
            .unwrap()
            .load_bytes(bytes, &device)
            .unwrap_err();
        assert!(matches!(err, ModelError::LoadArtifact { .. }), "got {:?}", err);
    }

    #[test]
    fn loss_is_finite_and_positive() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();
        let targets = Tensor::<TestBackend, 2, Int>::from_data(
            TensorData::new(vec![1i64, 0], [2, 1]),
            &device,
        );

        let (loss, logits) = model.forward_loss(ramp_batch(2, 16), targets);
        let loss = loss.into_scalar();
        assert!(loss.is_finite() && loss > 0.0);
        assert_eq!(logits.dims(), [2, 1]);
    }
}
