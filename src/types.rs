use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, PreprocessError};

/// モデル入力の一辺（ピクセル）
pub const IMAGE_SIZE: usize = 224;

/// チャンネル数（RGB）
pub const CHANNELS: usize = 3;

/// PixelTensorの形状 [height, width, channel]
pub const PIXEL_SHAPE: [usize; 3] = [IMAGE_SIZE, IMAGE_SIZE, CHANNELS];

/// 「好み」と判定する確率の閾値（この値を超えた場合のみtrue）
pub const DECISION_THRESHOLD: f32 = 0.7;

/// 1枚分の正規化済み画像 [224, 224, 3]（HWC、行優先、値は0.0〜1.0）
#[derive(Debug, Clone, PartialEq)]
pub struct PixelTensor {
    data: Vec<f32>,
}

impl PixelTensor {
    pub const LEN: usize = IMAGE_SIZE * IMAGE_SIZE * CHANNELS;

    /// 平坦化済みデータから生成。長さが [224, 224, 3] と一致しない場合はShapeエラー
    pub fn from_vec(data: Vec<f32>) -> Result<Self, PreprocessError> {
        if data.len() != Self::LEN {
            return Err(PreprocessError::shape(&PIXEL_SHAPE, &[data.len()]));
        }
        Ok(Self { data })
    }

    pub fn shape(&self) -> [usize; 3] {
        PIXEL_SHAPE
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// (y, x, c) の値
    pub fn get(&self, y: usize, x: usize, c: usize) -> Option<f32> {
        if y >= IMAGE_SIZE || x >= IMAGE_SIZE || c >= CHANNELS {
            return None;
        }
        self.data.get((y * IMAGE_SIZE + x) * CHANNELS + c).copied()
    }

    /// バッチ次元を追加して [1, 224, 224, 3] にする
    pub fn into_batch(self) -> BatchTensor {
        BatchTensor {
            data: self.data,
            dims: [1, IMAGE_SIZE, IMAGE_SIZE, CHANNELS],
        }
    }
}

/// PixelTensorを積み重ねたバッチ [N, H, W, 3]
///
/// 通常は H = W = 224。縮小モデル用に任意サイズのバッチも生成できます。
#[derive(Debug, Clone, PartialEq)]
pub struct BatchTensor {
    data: Vec<f32>,
    dims: [usize; 4],
}

impl BatchTensor {
    /// 空のバッチ [0, 224, 224, 3]
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            dims: [0, IMAGE_SIZE, IMAGE_SIZE, CHANNELS],
        }
    }

    pub fn from_pixels(pixels: Vec<PixelTensor>) -> Self {
        let mut batch = Self::empty();
        batch.data.reserve(pixels.len() * PixelTensor::LEN);
        for pixel in pixels {
            batch.data.extend_from_slice(pixel.as_slice());
            batch.dims[0] += 1;
        }
        batch
    }

    /// 平坦化データと形状からバッチを生成
    pub fn from_raw(data: Vec<f32>, dims: [usize; 4]) -> Result<Self, PreprocessError> {
        let expected: usize = dims.iter().product();
        if dims[3] != CHANNELS || data.len() != expected {
            return Err(PreprocessError::shape(&dims, &[data.len()]));
        }
        Ok(Self { data, dims })
    }

    /// 1枚追加（224x224のバッチのみ）
    pub fn push(&mut self, pixel: PixelTensor) -> Result<(), PreprocessError> {
        if self.dims[1..] != PIXEL_SHAPE[..] {
            return Err(PreprocessError::shape(&self.dims[1..], &PIXEL_SHAPE));
        }
        self.data.extend_from_slice(pixel.as_slice());
        self.dims[0] += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.dims[0]
    }

    pub fn is_empty(&self) -> bool {
        self.dims[0] == 0
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    /// 1サンプルあたりの要素数
    pub fn sample_len(&self) -> usize {
        self.dims[1] * self.dims[2] * self.dims[3]
    }

    pub fn sample(&self, index: usize) -> Option<&[f32]> {
        let stride = self.sample_len();
        let start = index.checked_mul(stride)?;
        self.data.get(start..start + stride)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// 指定インデックスのサンプルを順に集めた平坦化データ
    pub fn gather(&self, indices: &[usize]) -> Vec<f32> {
        let stride = self.sample_len();
        let mut out = Vec::with_capacity(indices.len() * stride);
        for &i in indices {
            out.extend_from_slice(&self.data[i * stride..(i + 1) * stride]);
        }
        out
    }

    /// 並べ替え: 新しい i 番目 = 元の order[i] 番目
    pub fn permute(&self, order: &[usize]) -> Self {
        Self {
            data: self.gather(order),
            dims: [order.len(), self.dims[1], self.dims[2], self.dims[3]],
        }
    }
}

/// 0/1ラベルの列（BatchTensorと同じ順序）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelVector(Vec<u8>);

impl LabelVector {
    pub fn new(labels: Vec<u8>) -> Self {
        Self(labels)
    }

    /// 同じラベルを n 個並べる
    pub fn filled(label: u8, n: usize) -> Self {
        Self(vec![label; n])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn extend(&mut self, other: LabelVector) {
        self.0.extend(other.0);
    }

    pub fn permute(&self, order: &[usize]) -> Self {
        Self(order.iter().map(|&i| self.0[i]).collect())
    }

    pub fn count(&self, label: u8) -> usize {
        self.0.iter().filter(|&&l| l == label).count()
    }
}

/// 学習用サンプル集合（画像とラベルの件数は常に一致）
#[derive(Debug, Clone)]
pub struct TrainingSet {
    images: BatchTensor,
    labels: LabelVector,
}

impl TrainingSet {
    pub fn new(images: BatchTensor, labels: LabelVector) -> Result<Self, DatasetError> {
        if images.len() != labels.len() {
            return Err(DatasetError::LengthMismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn images(&self) -> &BatchTensor {
        &self.images
    }

    pub fn labels(&self) -> &LabelVector {
        &self.labels
    }

    /// 画像とラベルに同じ並べ替えを適用
    pub fn permute(&self, order: &[usize]) -> Self {
        Self {
            images: self.images.permute(order),
            labels: self.labels.permute(order),
        }
    }
}

/// 1枚分の推論結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionResult {
    pub probability: f32,
    pub is_preferred: bool,
}

impl PredictionResult {
    pub fn from_probability(probability: f32) -> Self {
        Self {
            probability,
            is_preferred: probability > DECISION_THRESHOLD,
        }
    }
}

/// 解析対象の画像1件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub id: String,
    pub url: String,
}

/// 画像解析リクエスト `{ images: [{ id, url }] }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub images: Vec<ImageRequest>,
}

/// 画像解析レスポンス `{ preferredIds: [...] }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub preferred_ids: Vec<String>,
}
