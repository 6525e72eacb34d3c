use crate::services::token_verifier::TokenPolicy;
use anyhow::{Context, Result, bail};
use clap::Parser;
use jsonwebtoken::Algorithm;
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub media_root: PathBuf,
    pub temp_dir: PathBuf,
    pub jwt_secret: String,
    pub jwt_algorithm: Algorithm,
    pub token_leeway_secs: u64,
    pub token_policy: TokenPolicy,
    pub allowed_origins: Vec<String>,
    pub watermark: bool,
    pub ffmpeg_path: PathBuf,
    pub watermark_font: Option<PathBuf>,
    pub render_workers: usize,
    pub render_queue: usize,
    pub render_timeout: Duration,
    pub chunk_size: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Watermarked film streaming service")]
pub struct Args {
    /// Host to bind to (overrides FILM_STREAM_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILM_STREAM_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Film metadata database URL (overrides FILM_STREAM_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory relative video paths are resolved against (overrides FILM_STREAM_MEDIA_ROOT)
    #[arg(long)]
    pub media_root: Option<PathBuf>,

    /// Directory for rendered temporaries (overrides FILM_STREAM_TEMP_DIR)
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// `lenient` serves a fallback watermark on bad tokens, `strict` answers 401
    #[arg(long)]
    pub token_policy: Option<TokenPolicy>,

    /// Comma separated list of trusted front-end origins
    #[arg(long)]
    pub allowed_origins: Option<String>,

    /// Burn the viewer watermark into every streamed video
    #[arg(long)]
    pub watermark: bool,

    /// Number of concurrent watermark renders
    #[arg(long)]
    pub render_workers: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge already-parsed CLI args over the environment.
    pub fn from_args(args: Args) -> Result<Self> {
        let env_host = env::var("FILM_STREAM_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("FILM_STREAM_PORT", 8000u16)?;
        let env_db = env::var("FILM_STREAM_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/films.db".into());
        let env_media = env::var("FILM_STREAM_MEDIA_ROOT").unwrap_or_else(|_| "./media".into());
        let env_temp = env::var("FILM_STREAM_TEMP_DIR").unwrap_or_else(|_| "./media/tmp".into());

        let jwt_secret = match env::var("FILM_STREAM_JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            Ok(_) | Err(env::VarError::NotPresent) => {
                bail!("FILM_STREAM_JWT_SECRET must be set to the token signing secret")
            }
            Err(err) => return Err(err).context("reading FILM_STREAM_JWT_SECRET"),
        };
        let jwt_algorithm = match env::var("FILM_STREAM_JWT_ALGORITHM") {
            Ok(value) => parse_algorithm(&value)?,
            Err(_) => Algorithm::HS256,
        };

        let env_policy = env_parse("FILM_STREAM_TOKEN_POLICY", TokenPolicy::Lenient)?;
        let env_origins = env::var("FILM_STREAM_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".into());
        let env_watermark = match env::var("FILM_STREAM_WATERMARK") {
            Ok(value) => parse_bool(&value)
                .with_context(|| format!("parsing FILM_STREAM_WATERMARK value `{}`", value))?,
            Err(_) => false,
        };
        let env_workers = env_parse("FILM_STREAM_RENDER_WORKERS", num_cpus::get().max(1))?;

        let render_workers = args.render_workers.unwrap_or(env_workers).max(1);
        let render_queue = env_parse("FILM_STREAM_RENDER_QUEUE", render_workers * 2)?;
        let render_timeout_secs = env_parse("FILM_STREAM_RENDER_TIMEOUT_SECS", 1800u64)?;
        let chunk_size = env_parse("FILM_STREAM_CHUNK_SIZE", 1024 * 1024usize)?;
        if chunk_size == 0 {
            bail!("FILM_STREAM_CHUNK_SIZE must be greater than zero");
        }

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            media_root: args.media_root.unwrap_or_else(|| env_media.into()),
            temp_dir: args.temp_dir.unwrap_or_else(|| env_temp.into()),
            jwt_secret,
            jwt_algorithm,
            token_leeway_secs: env_parse("FILM_STREAM_TOKEN_LEEWAY_SECS", 0u64)?,
            token_policy: args.token_policy.unwrap_or(env_policy),
            allowed_origins: split_origins(&args.allowed_origins.unwrap_or(env_origins)),
            watermark: args.watermark || env_watermark,
            ffmpeg_path: env::var("FILM_STREAM_FFMPEG")
                .unwrap_or_else(|_| "ffmpeg".into())
                .into(),
            watermark_font: env::var("FILM_STREAM_WATERMARK_FONT").ok().map(PathBuf::from),
            render_workers,
            render_queue,
            render_timeout: Duration::from_secs(render_timeout_secs),
            chunk_size,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Hand-written so the signing secret never reaches the logs.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("media_root", &self.media_root)
            .field("temp_dir", &self.temp_dir)
            .field("jwt_secret", &"<redacted>")
            .field("jwt_algorithm", &self.jwt_algorithm)
            .field("token_leeway_secs", &self.token_leeway_secs)
            .field("token_policy", &self.token_policy)
            .field("allowed_origins", &self.allowed_origins)
            .field("watermark", &self.watermark)
            .field("ffmpeg_path", &self.ffmpeg_path)
            .field("watermark_font", &self.watermark_font)
            .field("render_workers", &self.render_workers)
            .field("render_queue", &self.render_queue)
            .field("render_timeout", &self.render_timeout)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// Read `name` from the environment and parse it, falling back to `default`
/// when the variable is absent.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("parsing {} value `{}`: {}", name, value, err)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("expected a boolean, got `{}`", other),
    }
}

fn parse_algorithm(value: &str) -> Result<Algorithm> {
    match value.trim().to_ascii_uppercase().as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => bail!(
            "FILM_STREAM_JWT_ALGORITHM `{}` is not supported (HS256, HS384, HS512)",
            other
        ),
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
