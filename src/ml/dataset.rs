//! 学習データセットの構築
//!
//! 「好み」ディレクトリ（ラベル1）と任意の「その他」ディレクトリ（ラベル0）
//! から画像を読み込み、シャッフル済みのサンプル集合を作ります。

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DatasetError;
use crate::ml::preprocess::preprocess;
use crate::types::{BatchTensor, LabelVector, TrainingSet};

/// 学習対象とする拡張子（大文字小文字は区別しない）
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub const POSITIVE_LABEL: u8 = 1;
pub const NEGATIVE_LABEL: u8 = 0;

/// 読み込み結果の件数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub positive: usize,
    pub negative: usize,
    /// 読み込み・デコードに失敗してスキップした枚数
    pub skipped: usize,
}

impl DatasetSummary {
    pub fn total(&self) -> usize {
        self.positive + self.negative
    }
}

/// ディレクトリから学習データを読み込み、シャッフルして返す
pub fn build_training_set(
    positive_dir: &Path,
    negative_dir: Option<&Path>,
) -> Result<TrainingSet, DatasetError> {
    build_training_set_with_summary(positive_dir, negative_dir).map(|(set, _)| set)
}

/// 件数の集計付きで学習データを構築
pub fn build_training_set_with_summary(
    positive_dir: &Path,
    negative_dir: Option<&Path>,
) -> Result<(TrainingSet, DatasetSummary), DatasetError> {
    let mut summary = DatasetSummary::default();

    let mut images = BatchTensor::empty();

    info!("好みの画像を読み込み中... ({})", positive_dir.display());
    let (loaded, skipped) = load_images_from_directory(positive_dir, &mut images)?;
    summary.positive = loaded;
    summary.skipped += skipped;
    info!("{}枚の好みの画像を読み込みました", loaded);

    let mut labels = LabelVector::filled(POSITIVE_LABEL, loaded);

    match negative_dir {
        Some(dir) if dir.is_dir() => {
            info!("その他の画像を読み込み中... ({})", dir.display());
            let (loaded, skipped) = load_images_from_directory(dir, &mut images)?;
            summary.negative = loaded;
            summary.skipped += skipped;
            info!("{}枚のその他の画像を読み込みました", loaded);

            // その他の画像は好みの画像の後ろに連結される
            labels.extend(LabelVector::filled(NEGATIVE_LABEL, loaded));
        }
        Some(dir) => {
            warn!(
                "その他の画像ディレクトリが存在しないため、好みの画像のみで学習します: {}",
                dir.display()
            );
        }
        None => {}
    }

    if summary.total() == 0 {
        return Err(DatasetError::NoTrainingData {
            positive_dir: positive_dir.to_path_buf(),
            negative_dir: negative_dir.map(Path::to_path_buf),
        });
    }

    let set = TrainingSet::new(images, labels)?;
    let shuffled = shuffle_training_set(&set, &mut rand::thread_rng());

    Ok((shuffled, summary))
}

/// 画像とラベルに同じランダム置換を適用
pub fn shuffle_training_set<R: Rng + ?Sized>(set: &TrainingSet, rng: &mut R) -> TrainingSet {
    let mut order: Vec<usize> = (0..set.len()).collect();
    order.shuffle(rng);
    set.permute(&order)
}

/// ディレクトリ内の画像ファイル一覧（ファイル名順）
pub fn list_image_files(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && has_image_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map_or(false, |ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// ディレクトリ内の画像をすべて前処理して `images` の後ろに積み重ねる
///
/// 読めない画像は警告を出してスキップします。
///
/// # 戻り値
/// - (追加した枚数, スキップした枚数)
fn load_images_from_directory(
    dir: &Path,
    images: &mut BatchTensor,
) -> Result<(usize, usize), DatasetError> {
    let mut loaded = 0;
    let mut skipped = 0;

    for path in list_image_files(dir)? {
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("画像の読み込みエラー ({}): {}", path.display(), e);
                skipped += 1;
                continue;
            }
        };

        match preprocess(&bytes).and_then(|pixel| images.push(pixel)) {
            Ok(()) => loaded += 1,
            Err(e) => {
                warn!("画像の変換エラー ({}): {}", path.display(), e);
                skipped += 1;
            }
        }
    }

    Ok((loaded, skipped))
}
