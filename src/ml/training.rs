//! モデル学習
//!
//! データセット構築 → 学習/検証分割 → エポックごとの学習ループ → 保存
//! までを1回の学習実行としてまとめます。

use std::path::PathBuf;
use std::sync::Arc;

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor, TensorData,
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ModelError, TrainingError};
use crate::ml::dataset::{build_training_set_with_summary, DatasetSummary};
use crate::ml::ml_model::{ModelConfig, PreferenceClassifier};
use crate::model::{save_model_with_metadata, ModelMetadata};
use crate::types::TrainingSet;

/// 学習ループの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    /// 末尾から検証用に取り分ける割合 [0, 1)
    pub validation_split: f64,
    /// エポックごとのシャッフル用シード（Noneならランダム）
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            validation_split: 0.2,
            seed: None,
        }
    }
}

impl FitOptions {
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidOptions(
                "epochs must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidOptions(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(TrainingError::InvalidOptions(format!(
                "validation_split must be in [0, 1), got {}",
                self.validation_split
            )));
        }
        Ok(())
    }

    /// 学習用サンプル数 floor(N * (1 - validation_split))
    pub fn split_point(&self, total: usize) -> usize {
        let point = (total as f64 * (1.0 - self.validation_split)).floor() as usize;
        point.min(total)
    }
}

/// 1エポック分の指標（存在しないものはNone）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1始まり
    pub epoch: usize,
    pub loss: Option<f64>,
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub val_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub val_accuracy: Option<f64>,
}

impl EpochMetrics {
    /// `loss = 0.6931, accuracy = 0.5000, ...` 形式（Noneは省略）
    pub fn summary(&self) -> String {
        [
            ("loss", self.loss),
            ("accuracy", self.accuracy),
            ("val_loss", self.val_loss),
            ("val_accuracy", self.val_accuracy),
        ]
        .iter()
        .filter_map(|(name, value)| value.map(|v| format!("{} = {:.4}", name, v)))
        .collect::<Vec<_>>()
        .join(", ")
    }
}

/// エポック順の指標列
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingLog {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingLog {
    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}

/// 学習セットのうち `[start, end)` の範囲を参照するデータセット
///
/// 学習用と検証用で同じ `TrainingSet` を共有します。
pub struct SampleDataset {
    set: Arc<TrainingSet>,
    start: usize,
    end: usize,
}

impl SampleDataset {
    /// 先頭 `split` 件を学習用、残りを検証用に分ける（順序は保持）
    pub fn split(set: TrainingSet, split: usize) -> (Self, Self) {
        let set = Arc::new(set);
        let total = set.len();
        let split = split.min(total);

        let train = Self {
            set: Arc::clone(&set),
            start: 0,
            end: split,
        };
        let valid = Self {
            set,
            start: split,
            end: total,
        };
        (train, valid)
    }
}

/// データセットアイテム（1枚分の画素とラベル）
#[derive(Clone, Debug)]
pub struct SampleItem {
    pub pixels: Vec<f32>,
    pub label: u8,
}

impl Dataset<SampleItem> for SampleDataset {
    fn get(&self, index: usize) -> Option<SampleItem> {
        // インデックス範囲内のデータのみ返す
        let actual_index = self.start + index;
        if actual_index >= self.end {
            return None;
        }

        Some(SampleItem {
            pixels: self.set.images().sample(actual_index)?.to_vec(),
            label: *self.set.labels().as_slice().get(actual_index)?,
        })
    }

    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// バッチ（画像 [b, H, W, 3] とラベル [b, 1]）
#[derive(Clone, Debug)]
pub struct SampleBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 2, Int>,
}

/// バッチャー
#[derive(Clone, Debug)]
pub struct SampleBatcher {
    input_shape: [usize; 3],
}

impl SampleBatcher {
    pub fn new(input_shape: [usize; 3]) -> Self {
        Self { input_shape }
    }
}

impl<B: Backend> Batcher<B, SampleItem, SampleBatch<B>> for SampleBatcher {
    fn batch(&self, items: Vec<SampleItem>, device: &B::Device) -> SampleBatch<B> {
        let [h, w, c] = self.input_shape;
        let batch_size = items.len();

        let mut pixels = Vec::with_capacity(batch_size * h * w * c);
        let mut targets = Vec::with_capacity(batch_size);
        for item in items {
            pixels.extend_from_slice(&item.pixels);
            targets.push(i64::from(item.label));
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images =
            Tensor::<B, 4>::from_data(TensorData::new(pixels, [batch_size, h, w, c]), device);
        let targets =
            Tensor::<B, 2, Int>::from_data(TensorData::new(targets, [batch_size, 1]), device);

        SampleBatch { images, targets }
    }
}

/// モデルを学習する
///
/// `set` は学習前にシャッフル済みである前提で、末尾の `validation_split`
/// の割合を順序を保ったまま検証用に取り分けます。学習用のデータローダーは
/// 毎エポック並べ替えます。
///
/// モデルと学習セットは値で受け取ります。学習セットはこの関数を抜けた
/// 時点で解放されます。
pub fn fit<B: AutodiffBackend>(
    mut model: PreferenceClassifier<B>,
    config: &ModelConfig,
    set: TrainingSet,
    options: &FitOptions,
    device: &B::Device,
) -> Result<(PreferenceClassifier<B>, TrainingLog), TrainingError> {
    options.validate()?;

    let dims = set.images().dims();
    if dims[1..] != config.input_shape()[..] {
        return Err(ModelError::ShapeMismatch {
            expected: config.input_shape().to_vec(),
            actual: dims[1..].to_vec(),
        }
        .into());
    }
    if set.is_empty() {
        return Err(TrainingError::InvalidOptions(
            "training set is empty".to_string(),
        ));
    }

    let total = set.len();
    let mut split = options.split_point(total);
    if split == 0 {
        warn!(
            "検証用に取り分けると学習データが残らないため、全{}件で学習します（検証なし）",
            total
        );
        split = total;
    }

    let (dataset_train, dataset_val) = SampleDataset::split(set, split);

    info!("学習データ: {} 枚", dataset_train.len());
    info!("検証データ: {} 枚", dataset_val.len());
    info!(
        "エポック数: {}, バッチサイズ: {}, 学習率: {}",
        options.epochs, options.batch_size, config.learning_rate
    );

    // データローダー作成（学習用は iter() のたびに並べ替える）
    let seed = options.seed.unwrap_or_else(rand::random);
    let dataloader_train =
        DataLoaderBuilder::<B, SampleItem, SampleBatch<B>>::new(SampleBatcher::new(
            config.input_shape(),
        ))
        .batch_size(options.batch_size)
        .shuffle(seed)
        .num_workers(0)
        .set_device(device.clone())
        .build(dataset_train);

    let dataloader_val = if dataset_val.is_empty() {
        None
    } else {
        Some(
            DataLoaderBuilder::<B::InnerBackend, SampleItem, SampleBatch<B::InnerBackend>>::new(
                SampleBatcher::new(config.input_shape()),
            )
            .batch_size(options.batch_size)
            .num_workers(0)
            .set_device(device.clone())
            .build(dataset_val),
        )
    };

    let mut optim = AdamConfig::new()
        .with_epsilon(1e-7)
        .init::<B, PreferenceClassifier<B>>();

    let mut log = TrainingLog::default();

    for epoch in 1..=options.epochs {
        let mut loss_sum = 0.0;
        let mut correct = 0;
        let mut seen = 0;

        for batch in dataloader_train.iter() {
            let batch_size = batch.targets.dims()[0];
            let (loss, logits) = model.forward_loss(batch.images, batch.targets.clone());
            let batch_loss = loss.clone().into_scalar().elem::<f64>();
            if !batch_loss.is_finite() {
                return Err(TrainingError::NumericalInstability(format!(
                    "loss became {} in epoch {}",
                    batch_loss, epoch
                )));
            }

            loss_sum += batch_loss * batch_size as f64;
            correct += count_correct(logits, batch.targets);
            seen += batch_size;

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);
        }

        let n = seen as f64;
        let mut metrics = EpochMetrics {
            epoch,
            loss: Some(loss_sum / n),
            accuracy: Some(correct as f64 / n),
            val_loss: None,
            val_accuracy: None,
        };

        if let Some(dataloader_val) = &dataloader_val {
            // ドロップアウト無効の推論用モデルで評価
            let valid_model = model.valid();
            let (val_loss, val_accuracy) = evaluate(&valid_model, dataloader_val.as_ref());
            if !val_loss.is_finite() {
                return Err(TrainingError::NumericalInstability(format!(
                    "val_loss became {} in epoch {}",
                    val_loss, epoch
                )));
            }
            metrics.val_loss = Some(val_loss);
            metrics.val_accuracy = Some(val_accuracy);
        }

        info!("Epoch {}: {}", epoch, metrics.summary());
        log.epochs.push(metrics);
    }

    Ok((model, log))
}

/// 検証データの (平均損失, 正解率)
fn evaluate<B: Backend>(
    model: &PreferenceClassifier<B>,
    dataloader: &dyn DataLoader<B, SampleBatch<B>>,
) -> (f64, f64) {
    let mut loss_sum = 0.0;
    let mut correct = 0;
    let mut seen = 0;

    for batch in dataloader.iter() {
        let batch_size = batch.targets.dims()[0];
        let (loss, logits) = model.forward_loss(batch.images, batch.targets.clone());
        loss_sum += loss.into_scalar().elem::<f64>() * batch_size as f64;
        correct += count_correct(logits, batch.targets);
        seen += batch_size;
    }

    let n = seen as f64;
    (loss_sum / n, correct as f64 / n)
}

/// ロジット > 0 を「好み」として正解数を数える
fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2, Int>) -> usize {
    logits
        .greater_elem(0.0)
        .int()
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

/// 1回の学習実行に必要な入力
#[derive(Debug, Clone)]
pub struct TrainRequest {
    pub positive_dir: PathBuf,
    pub negative_dir: Option<PathBuf>,
    /// 保存先（.tar.gz）
    pub model_path: PathBuf,
    pub options: FitOptions,
    pub model_config: ModelConfig,
}

impl TrainRequest {
    pub fn new(positive_dir: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            positive_dir: positive_dir.into(),
            negative_dir: None,
            model_path: model_path.into(),
            options: FitOptions::default(),
            model_config: ModelConfig::new(),
        }
    }

    pub fn with_negative_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.negative_dir = Some(dir.into());
        self
    }

    pub fn with_options(mut self, options: FitOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_model_config(mut self, config: ModelConfig) -> Self {
        self.model_config = config;
        self
    }
}

/// 学習実行の結果
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub log: TrainingLog,
    pub dataset: DatasetSummary,
    /// 実際に書き込んだ成果物のパス
    pub artifact_path: PathBuf,
}

/// データセット構築から保存までを実行
///
/// 学習データは `fit` が終わった時点で（成功・失敗に関わらず）解放されます。
/// 保存は `fit` が成功した場合のみ行います。
pub fn train_model<B: AutodiffBackend>(
    request: &TrainRequest,
    device: &B::Device,
) -> Result<TrainOutcome, TrainingError> {
    request.options.validate()?;
    request.model_config.validate()?;

    let (set, dataset) = build_training_set_with_summary(
        &request.positive_dir,
        request.negative_dir.as_deref(),
    )?;
    info!(
        "学習データ合計: {} 枚（好み: {}, その他: {}, スキップ: {}）",
        dataset.total(),
        dataset.positive,
        dataset.negative,
        dataset.skipped
    );

    let model = request.model_config.init::<B>(device)?;
    debug!("モデルを初期化しました");

    // 学習データは fit に渡し、fit の終了とともに解放する
    let (model, log) = fit(model, &request.model_config, set, &request.options, device)?;

    let model_binary = model.valid().to_bytes()?;
    let metadata = ModelMetadata::new(
        request.model_config.clone(),
        dataset,
        &request.options,
        log.last().copied(),
    );
    let artifact_path = save_model_with_metadata(&request.model_path, &metadata, &model_binary)?;

    info!("モデルを保存しました: {}", artifact_path.display());

    Ok(TrainOutcome {
        log,
        dataset,
        artifact_path,
    })
}
