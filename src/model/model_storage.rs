//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（アーキテクチャ、学習条件など）
//! - model.bin       - モデルの重み（f32のburnレコード）

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tracing::info;

use crate::error::ModelError;
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 保存先のパスを `.tar.gz` に揃える
///
/// 既存の拡張子は置き換えずに残します（`a.v1` → `a.v1.tar.gz`）。
/// 保存と読み込みの両方がこの関数を通るため、同じパスで往復できます。
pub fn artifact_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        let mut name = output_path.as_os_str().to_os_string();
        name.push(".tar.gz");
        PathBuf::from(name)
    }
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// メタデータには `model_binary` のバイト数とCRC32を記録します。
///
/// # 戻り値
/// - 実際に書き込んだパス
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf, ModelError> {
    let tar_gz_path = artifact_path(output_path);
    let metadata = metadata.clone().with_weights(model_binary);
    write_archive(&tar_gz_path, &metadata, model_binary)?;

    info!(
        "成果物を書き込みました: {} (model.bin {:.2} MB)",
        tar_gz_path.display(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );

    Ok(tar_gz_path)
}

fn write_archive(
    tar_gz_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<(), ModelError> {
    let err = |reason: String| ModelError::save(tar_gz_path, reason);

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| err(format!("failed to create {:?}: {}", parent, e)))?;
        }
    }

    let json = metadata
        .to_json_string()
        .map_err(|e| err(format!("failed to serialize metadata: {}", e)))?;

    let tar_gz_file = File::create(tar_gz_path).map_err(|e| err(e.to_string()))?;
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_entry(&mut tar_builder, METADATA_ENTRY, json.as_bytes()).map_err(|e| err(e.to_string()))?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary).map_err(|e| err(e.to_string()))?;

    // tarとgzipの両方を閉じる
    tar_builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| err(format!("failed to finalize archive: {}", e)))?;

    Ok(())
}

fn append_entry<W: std::io::Write>(
    builder: &mut Builder<W>,
    name: &str,
    bytes: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)
}

/// Tar.gzからモデルメタデータだけを読み込む
pub fn load_metadata(model_path: &Path) -> Result<ModelMetadata, ModelError> {
    let tar_gz_path = artifact_path(model_path);
    let (metadata, _) = read_entries(&tar_gz_path, false)?;
    metadata.ok_or_else(|| ModelError::load(&tar_gz_path, "metadata.json not found in archive"))
}

/// メタデータとモデルバイナリを共に読み込む
///
/// model.bin がメタデータに記録したバイト数・CRC32と一致しない場合はエラー
pub fn load_model_with_metadata(model_path: &Path) -> Result<(ModelMetadata, Vec<u8>), ModelError> {
    let tar_gz_path = artifact_path(model_path);
    match read_entries(&tar_gz_path, true)? {
        (Some(metadata), Some(binary)) => {
            metadata
                .verify_weights(&binary)
                .map_err(|reason| ModelError::load(&tar_gz_path, reason))?;
            Ok((metadata, binary))
        }
        (None, _) => Err(ModelError::load(&tar_gz_path, "metadata.json not found in archive")),
        (_, None) => Err(ModelError::load(&tar_gz_path, "model.bin not found in archive")),
    }
}

fn read_entries(
    tar_gz_path: &Path,
    want_binary: bool,
) -> Result<(Option<ModelMetadata>, Option<Vec<u8>>), ModelError> {
    let err = |reason: String| ModelError::load(tar_gz_path, reason);

    let tar_gz_file = File::open(tar_gz_path).map_err(|e| err(e.to_string()))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut metadata = None;
    let mut binary = None;

    for entry in archive.entries().map_err(|e| err(e.to_string()))? {
        let mut entry = entry.map_err(|e| err(e.to_string()))?;
        let path = entry.path().map_err(|e| err(e.to_string()))?.into_owned();

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json = String::new();
                entry
                    .read_to_string(&mut json)
                    .map_err(|e| err(e.to_string()))?;
                let parsed = ModelMetadata::from_json_string(&json)
                    .map_err(|e| err(format!("invalid metadata.json: {}", e)))?;
                metadata = Some(parsed);
                if !want_binary {
                    break;
                }
            }
            Some(MODEL_ENTRY) if want_binary => {
                let mut buffer = Vec::new();
                entry
                    .read_to_end(&mut buffer)
                    .map_err(|e| err(e.to_string()))?;
                binary = Some(buffer);
            }
            _ => {}
        }
    }

    Ok((metadata, binary))
}

/// メタデータをログに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    let arch = &metadata.architecture;
    info!("=== モデルメタデータ ===");
    info!("フォーマット: v{}", metadata.format_version);
    info!(
        "入力形状: {}x{}x{}",
        metadata.input_shape[0], metadata.input_shape[1], metadata.input_shape[2]
    );
    info!(
        "層構成: Conv{} -> Conv{} -> FC{} (dropout={}, lr={})",
        arch.conv1_filters, arch.conv2_filters, arch.hidden_units, arch.dropout, arch.learning_rate
    );
    info!(
        "学習データ: 好み {} 枚, その他 {} 枚 (スキップ {} 枚)",
        metadata.dataset.positive, metadata.dataset.negative, metadata.dataset.skipped
    );
    info!(
        "学習条件: エポック数 {}, バッチサイズ {}, 検証割合 {}",
        metadata.num_epochs, metadata.batch_size, metadata.validation_split
    );
    if let Some(metrics) = &metadata.final_metrics {
        info!("最終エポック: {}", metrics.summary());
    }
    info!("学習日時: {}", metadata.trained_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::DatasetSummary;
    use crate::ml::ml_model::ModelConfig;
    use crate::ml::training::FitOptions;
    use std::io::Write;

    fn sample_metadata() -> ModelMetadata {
        ModelMetadata::new(
            ModelConfig::new().with_image_size(16),
            DatasetSummary {
                positive: 3,
                negative: 2,
                skipped: 0,
            },
            &FitOptions::default(),
            None,
        )
    }

    #[test]
    fn extension_is_normalized_to_tar_gz() {
        assert_eq!(artifact_path(Path::new("model/a")), PathBuf::from("model/a.tar.gz"));
        assert_eq!(
            artifact_path(Path::new("model/a.tar.gz")),
            PathBuf::from("model/a.tar.gz")
        );
    }

    #[test]
    fn existing_extension_is_kept() {
        let v1 = artifact_path(Path::new("model/a.v1"));
        let v2 = artifact_path(Path::new("model/a.v2"));
        assert_eq!(v1, PathBuf::from("model/a.v1.tar.gz"));
        assert_eq!(v2, PathBuf::from("model/a.v2.tar.gz"));
    }

    #[test]
    fn bare_path_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model/classifier");
        let binary = vec![3u8; 16];

        let written = save_model_with_metadata(&path, &sample_metadata(), &binary).unwrap();
        assert_eq!(written, dir.path().join("model/classifier.tar.gz"));

        let metadata = load_metadata(&path).unwrap();
        assert_eq!(metadata.weights_len, 16);
        let (_, loaded) = load_model_with_metadata(&path).unwrap();
        assert_eq!(loaded, binary);
    }

    #[test]
    fn weights_not_matching_metadata_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tampered.tar.gz");
        let metadata = sample_metadata().with_weights(&[1, 2, 3, 4]);
        write_archive(&path, &metadata, &[1, 2, 3, 5]).unwrap();

        // メタデータだけなら読める
        assert!(load_metadata(&path).is_ok());

        let err = load_model_with_metadata(&path).unwrap_err();
        match err {
            ModelError::LoadArtifact { reason, .. } => assert!(reason.contains("checksum"), "{}", reason),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn bundle_round_trips_metadata_and_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/classifier.tar.gz");
        let binary = vec![7u8, 0, 255, 42];

        let written = save_model_with_metadata(&path, &sample_metadata(), &binary).unwrap();
        assert_eq!(written, path);

        let (metadata, loaded) = load_model_with_metadata(&path).unwrap();
        assert_eq!(loaded, binary);
        assert_eq!(metadata.input_shape, [16, 16, 3]);
        assert_eq!(metadata.dataset.total(), 5);

        let only_metadata = load_metadata(&path).unwrap();
        assert_eq!(only_metadata.trained_at, metadata.trained_at);
    }

    #[test]
    fn missing_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_model_with_metadata(&dir.path().join("absent.tar.gz")).unwrap_err();
        assert!(matches!(err, ModelError::LoadArtifact { .. }));
    }

    #[test]
    fn non_archive_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tar.gz");
        File::create(&path)
            .unwrap()
            .write_all(b"this is not gzip")
            .unwrap();

        assert!(load_model_with_metadata(&path).is_err());
    }
}
