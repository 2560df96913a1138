use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use ditto_imagegen::{
    CallerIdentity, DispatcherConfig, Dispatcher, Env, ImagegenError, ProviderKind, ReferenceImage,
    deliverable_location, logging,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderArg {
    Chat,
    Images,
}

impl From<ProviderArg> for ProviderKind {
    fn from(value: ProviderArg) -> Self {
        match value {
            ProviderArg::Chat => ProviderKind::ChatCompletions,
            ProviderArg::Images => ProviderKind::ImagesApi,
        }
    }
}

/// Generate an image from a prompt, rotating api keys on quota errors.
#[derive(Debug, Parser)]
#[command(name = "ditto-imagegen", version)]
struct Cli {
    /// TOML config with [chat_completions] and/or [images_api] sections.
    #[arg(long, default_value = "imagegen.toml")]
    config: PathBuf,
    /// .env file consulted before the process environment for api_key_env lookups.
    #[arg(long)]
    dotenv: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "chat")]
    provider: ProviderArg,
    /// Local reference image (repeatable).
    #[arg(long = "image")]
    images: Vec<PathBuf>,
    /// Remote reference image (repeatable).
    #[arg(long = "image-url")]
    image_urls: Vec<String>,
    #[arg(long)]
    group: Option<String>,
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    sender: Option<String>,
    #[arg(long)]
    json_logs: bool,
    #[arg(required = true, trailing_var_arg = true)]
    prompt: Vec<String>,
}

fn media_type_for(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

async fn load_references(cli: &Cli) -> Result<Vec<ReferenceImage>, ImagegenError> {
    let mut references = Vec::with_capacity(cli.images.len() + cli.image_urls.len());
    for path in &cli.images {
        let bytes = tokio::fs::read(path).await?;
        references.push(ReferenceImage::from_bytes(&bytes, media_type_for(path)));
    }
    references.extend(cli.image_urls.iter().map(ReferenceImage::url));
    Ok(references)
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error + Send + Sync>> {
    let env = match &cli.dotenv {
        Some(path) => Env::load_dotenv(path)?,
        None => Env::default(),
    };
    let config = DispatcherConfig::load(&cli.config)?;
    let limiter = config.rate_limiter();
    let dispatcher = Dispatcher::from_config(&config, &env)?;

    let caller = CallerIdentity {
        group_id: cli.group.clone(),
        session_id: cli.session.clone(),
        sender_id: cli.sender.clone(),
    };
    let decision = limiter.try_acquire(&caller.rate_key()).await;
    if !decision.allowed {
        eprintln!("{}", decision.denial_message(limiter.limit()));
        return Ok(ExitCode::from(2));
    }

    let references = load_references(&cli).await?;
    let prompt = cli.prompt.join(" ");
    match dispatcher
        .generate(&prompt, references, cli.provider.into())
        .await
    {
        Ok(image) => {
            println!("{}", deliverable_location(&image, dispatcher.host()).await);
            if image.url.starts_with("http") {
                println!("{}", image.url);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            eprintln!("{}", failure.user_message());
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init_tracing(cli.json_logs) {
        eprintln!("failed to initialise logging: {err}");
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
