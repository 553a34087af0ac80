use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use mirage_edit_core::api::server::{serve, AppState};
use mirage_edit_core::pipeline::image_io::encode_png;
use mirage_edit_core::pipeline::runtime::{default_app_root, EditOptions, EditPipeline};
use mirage_edit_core::pipeline::settings_layer::{load_mirage_settings, MirageSettings};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    if matches!(cli_args.first().map(String::as_str), Some("edit")) {
        let args = cli_args.into_iter().skip(1).collect::<Vec<_>>();
        return tokio::task::spawn_blocking(move || run_edit_cli(args)).await?;
    }
    let args = if matches!(cli_args.first().map(String::as_str), Some("serve")) {
        cli_args.into_iter().skip(1).collect::<Vec<_>>()
    } else {
        cli_args
    };
    run_serve_cli(args).await
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SettingsArgs {
    app_root: PathBuf,
    settings_path: Option<String>,
}

impl SettingsArgs {
    fn load(&self) -> CliResult<MirageSettings> {
        Ok(load_mirage_settings(
            self.app_root.as_path(),
            self.settings_path.as_deref(),
        )?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServeCliArgs {
    settings: SettingsArgs,
    bind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EditCliArgs {
    settings: SettingsArgs,
    image: PathBuf,
    prompt: String,
    output: PathBuf,
    options: EditOptions,
}

async fn run_serve_cli(args: Vec<String>) -> CliResult<()> {
    if args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_serve_usage();
        return Ok(());
    }
    let parsed = parse_serve_cli_args(args.as_slice())?;
    let settings = parsed.settings.load()?;
    let bind = parsed.bind.unwrap_or_else(|| settings.bind.clone());
    let addr: SocketAddr = bind.parse()?;

    // Blocking HTTP clients must be built off the async runtime.
    let pipeline =
        tokio::task::spawn_blocking(move || EditPipeline::from_settings(&settings)).await??;
    serve(addr, AppState::new(Arc::new(pipeline))).await?;
    Ok(())
}

fn run_edit_cli(args: Vec<String>) -> CliResult<()> {
    if args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_edit_usage();
        return Ok(());
    }
    let parsed = parse_edit_cli_args(args.as_slice())?;
    let settings = parsed.settings.load()?;
    let pipeline = EditPipeline::from_settings(&settings)?;

    let edited = pipeline.run_prompt_edit(
        parsed.image.as_path(),
        parsed.prompt.as_str(),
        &parsed.options,
    )?;
    std::fs::write(parsed.output.as_path(), encode_png(&edited)?)?;
    info!(output = %parsed.output.display(), "wrote edited image");
    println!("{}", parsed.output.display());
    Ok(())
}

fn parse_serve_cli_args(args: &[String]) -> CliResult<ServeCliArgs> {
    let mut settings = default_settings_args();
    let mut bind = None::<String>;

    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> CliResult<String> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--app-root" => {
                settings.app_root = PathBuf::from(needs_value(i)?);
                i += 2;
            }
            "--settings" => {
                settings.settings_path = Some(needs_value(i)?);
                i += 2;
            }
            "--bind" => {
                bind = Some(needs_value(i)?);
                i += 2;
            }
            unknown => return Err(unknown_argument(unknown)),
        }
    }

    Ok(ServeCliArgs { settings, bind })
}

fn parse_edit_cli_args(args: &[String]) -> CliResult<EditCliArgs> {
    let mut settings = default_settings_args();
    let mut image = None::<PathBuf>;
    let mut prompt = None::<String>;
    let mut output = None::<PathBuf>;
    let mut options = EditOptions::default();

    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> CliResult<String> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--app-root" => {
                settings.app_root = PathBuf::from(needs_value(i)?);
                i += 2;
            }
            "--settings" => {
                settings.settings_path = Some(needs_value(i)?);
                i += 2;
            }
            "--image" => {
                image = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--prompt" => {
                prompt = Some(needs_value(i)?);
                i += 2;
            }
            "--output" => {
                output = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--rounds" => {
                let raw = needs_value(i)?;
                let rounds = raw.parse::<u32>().map_err(|_| {
                    std::io::Error::other(format!("--rounds expects a positive integer, got '{raw}'"))
                })?;
                options.num_rounds = Some(rounds.max(1));
                i += 2;
            }
            "--refine-each-round" => {
                options.refine_each_round = Some(true);
                i += 1;
            }
            "--no-refiner" => {
                options.use_refiner = Some(false);
                i += 1;
            }
            unknown => return Err(unknown_argument(unknown)),
        }
    }

    let image = image.ok_or_else(|| std::io::Error::other("Missing required --image"))?;
    let prompt = prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| std::io::Error::other("Missing required --prompt"))?;
    Ok(EditCliArgs {
        settings,
        image,
        prompt,
        output: output.unwrap_or_else(|| PathBuf::from("edited_image.png")),
        options,
    })
}

fn default_settings_args() -> SettingsArgs {
    SettingsArgs {
        app_root: default_app_root(),
        settings_path: None,
    }
}

fn unknown_argument(arg: &str) -> Box<dyn std::error::Error + Send + Sync> {
    std::io::Error::other(format!("Unknown argument: {arg}\n\nUse --help for usage.")).into()
}

fn print_serve_usage() {
    println!(
        "Usage: mirage-edit-core [serve] [--app-root PATH] [--settings PATH] [--bind ADDR]\n\n\
Starts the HTTP surface (GET /, POST /edit-image/). The bind address defaults to the\n\
settings value (MIRAGE_BIND, 127.0.0.1:8017)."
    );
}

fn print_edit_usage() {
    println!(
        "Usage: mirage-edit-core edit --image PATH --prompt TEXT [--output PATH] [--rounds N]\n\
                         [--refine-each-round] [--no-refiner] [--app-root PATH] [--settings PATH]\n\n\
Runs one prompt edit and writes the result as PNG (default: edited_image.png)."
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn edit_cli_parses_flags() {
        let parsed = parse_edit_cli_args(
            args(&[
                "--image",
                "in.jpg",
                "--prompt",
                "remove tiger",
                "--rounds",
                "5",
                "--refine-each-round",
                "--settings",
                "custom.toml",
            ])
            .as_slice(),
        )
        .expect("edit args should parse");

        assert_eq!(parsed.image, PathBuf::from("in.jpg"));
        assert_eq!(parsed.prompt, "remove tiger");
        assert_eq!(parsed.output, PathBuf::from("edited_image.png"));
        assert_eq!(parsed.options.num_rounds, Some(5));
        assert_eq!(parsed.options.refine_each_round, Some(true));
        assert_eq!(parsed.options.use_refiner, None);
        assert_eq!(parsed.settings.settings_path.as_deref(), Some("custom.toml"));
    }

    #[test]
    fn edit_cli_requires_image_and_prompt() {
        let err = parse_edit_cli_args(args(&["--prompt", "remove tiger"]).as_slice())
            .expect_err("missing image should fail");
        assert!(err.to_string().contains("--image"));

        let err = parse_edit_cli_args(args(&["--image", "a.png", "--prompt"]).as_slice())
            .expect_err("missing value should fail");
        assert!(err.to_string().contains("Missing value for --prompt"));
    }

    #[test]
    fn serve_cli_rejects_unknown_flags() {
        let err = parse_serve_cli_args(args(&["--port", "80"]).as_slice())
            .expect_err("unknown flag should fail");
        assert!(err.to_string().contains("Unknown argument: --port"));

        let parsed = parse_serve_cli_args(args(&["--bind", "0.0.0.0:9000"]).as_slice())
            .expect("bind should parse");
        assert_eq!(parsed.bind.as_deref(), Some("0.0.0.0:9000"));
    }
}
