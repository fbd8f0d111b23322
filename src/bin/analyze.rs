//! 推論用バイナリ
//!
//! 使い方:
//!   analyze <request.json | ->      `{ "images": [{ "id", "url" }] }` を判定して
//!                                   `{ "preferredIds": [...] }` を出力
//!   analyze --url <image_ref>       1件を判定して true/false を出力
//!   analyze --info [model_path]     成果物のメタデータを表示

// Wgpuバックエンドで `InferenceEngine<B>: Send` を解決するのに必要
#![recursion_limit = "256"]

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::backend::{NdArray, Wgpu};
use burn::tensor::backend::Backend;

use face_preference_lib::analyzer::{HttpImageFetcher, ImageAnalyzer, ImageRefResolver};
use face_preference_lib::ml::{InferenceEngine, ProbabilityModel};
use face_preference_lib::model::{load_metadata, print_metadata_info, AppConfig, DeviceType};
use face_preference_lib::{AnalyzeRequest, IMAGE_SIZE};

const USAGE: &str = "Usage: analyze <request.json | -> | analyze --url <image_ref> | analyze --info [model_path]";

enum Command {
    Request(String),
    Url(String),
    Info(Option<PathBuf>),
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args.get(1).map(String::as_str) {
        Some("--url") => match args.get(2) {
            Some(image_ref) => Ok(Command::Url(image_ref.clone())),
            None => bail!("--url requires an image reference\n{}", USAGE),
        },
        Some("--info") => Ok(Command::Info(args.get(2).map(PathBuf::from))),
        Some("-h") | Some("--help") | None => bail!("{}", USAGE),
        Some(source) => Ok(Command::Request(source.to_string())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    face_preference_lib::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let command = parse_args(&args)?;
    let config = AppConfig::load_or_default(AppConfig::default_path());
    config.display();

    if let Command::Info(path) = &command {
        let path = path.as_deref().unwrap_or(config.inference.model_path.as_path());
        let metadata = load_metadata(path)
            .with_context(|| format!("メタデータの読み込みに失敗しました: {}", path.display()))?;
        print_metadata_info(&metadata);
        return Ok(());
    }

    match config.device_type {
        DeviceType::Cpu => run::<NdArray>(&config, command).await,
        DeviceType::Wgpu => run::<Wgpu>(&config, command).await,
    }
}

async fn run<B: Backend>(config: &AppConfig, command: Command) -> Result<()>
where
    InferenceEngine<B>: ProbabilityModel + Send + 'static,
{
    let settings = &config.inference;

    let engine = load_engine::<B>(&settings.model_path)?;
    let fetcher = HttpImageFetcher::new(settings.fetch_timeout(), &settings.user_agent)
        .context("HTTPクライアントの作成に失敗しました")?;
    let resolver = ImageRefResolver::new(&settings.origin)?;

    let analyzer = ImageAnalyzer::new(engine, fetcher, resolver)
        .with_max_concurrency(settings.max_concurrent_fetches);

    match command {
        Command::Url(image_ref) => {
            let prediction = analyzer.classify(&image_ref).await?;
            println!("{} ({:.4})", prediction.is_preferred, prediction.probability);
        }
        Command::Request(source) => {
            let request = read_request(&source)?;
            let response = analyzer.analyze(&request).await;
            println!("{}", serde_json::to_string(&response)?);
        }
        Command::Info(_) => {}
    }

    Ok(())
}

fn load_engine<B: Backend>(model_path: &Path) -> Result<InferenceEngine<B>> {
    let engine = InferenceEngine::<B>::load(model_path, Default::default())
        .with_context(|| format!("モデルの読み込みに失敗しました: {}", model_path.display()))?;

    // 前処理の出力は常に224x224
    if engine.config().image_size != IMAGE_SIZE {
        bail!(
            "model expects {}x{} input, but images are preprocessed to {}x{}",
            engine.config().image_size,
            engine.config().image_size,
            IMAGE_SIZE,
            IMAGE_SIZE
        );
    }

    Ok(engine)
}

fn read_request(source: &str) -> Result<AnalyzeRequest> {
    let json = if source == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("標準入力の読み込みに失敗しました")?;
        buffer
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("リクエストファイルの読み込みに失敗しました: {}", source))?
    };

    serde_json::from_str(&json).context("リクエストJSONの形式が不正です")
}
