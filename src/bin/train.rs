//! 学習用バイナリ
//!
//! 使い方: train [positive_dir] [negative_dir] [model_path]
//!
//! 省略した引数は config.json（無ければデフォルト設定）の値を使います。
//! その他の画像ディレクトリは存在する場合のみ使用します。

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::{Autodiff, NdArray, Wgpu};
use tracing::info;

use face_preference_lib::ml::{train_model, TrainOutcome, TrainRequest};
use face_preference_lib::model::{AppConfig, DeviceType};

fn main() -> Result<()> {
    face_preference_lib::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        eprintln!("Usage: train [positive_dir] [negative_dir] [model_path]");
        return Ok(());
    }

    let config = AppConfig::load_or_default(AppConfig::default_path());
    config.display();
    let training = &config.training;

    let arg_path = |index: usize, default: &PathBuf| {
        args.get(index).map(PathBuf::from).unwrap_or_else(|| default.clone())
    };
    let positive_dir = arg_path(1, &training.positive_dir);
    let negative_dir = arg_path(2, &training.negative_dir);
    let model_path = arg_path(3, &training.model_path);

    let request = TrainRequest::new(positive_dir, model_path)
        .with_negative_dir(negative_dir)
        .with_options(training.fit_options());

    info!(
        "学習データ: {} / {}",
        request.positive_dir.display(),
        request
            .negative_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    );

    let outcome = run(&request, config.device_type).context("学習に失敗しました")?;

    if let Some(last) = outcome.log.last() {
        info!("最終エポック: {}", last.summary());
    }
    println!(
        "Model training completed and saved to {}",
        outcome.artifact_path.display()
    );

    Ok(())
}

fn run(request: &TrainRequest, device_type: DeviceType) -> Result<TrainOutcome> {
    let outcome = match device_type {
        DeviceType::Cpu => train_model::<Autodiff<NdArray>>(request, &Default::default())?,
        DeviceType::Wgpu => train_model::<Autodiff<Wgpu>>(request, &Default::default())?,
    };
    Ok(outcome)
}
