use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{CommandFactory, Parser};
use deckcore::{
    cli::{parse_env_pairs, styles::AnsiStyles, DeckArgs, DeckSubcommand},
    config::{
        ContainerConfig, DeckConfig, MemorySettings, SettingsStore, ESYNC_KEY,
        GRAPHICS_WRAPPER_KEY, PERFORMANCE_PRESET_KEY, SCREEN_RESOLUTION_KEY,
    },
    management::{DirAssetSource, ProgressCallback},
    DeckEngine, DeckcoreError, DeckcoreResult,
};
use futures::StreamExt;
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under the deck home that holds bundled archives when `init` is not given one.
const ASSETS_SUBDIR: &str = "assets";

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> DeckcoreResult<()> {
    let args = DeckArgs::parse();

    let filter = if args.verbose {
        EnvFilter::new("deckcore=debug,deckutils=debug")
    } else {
        EnvFilter::from_default_env()
    };

    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    let config = match &args.home {
        Some(home) => DeckConfig::load(home).await?,
        None => DeckConfig::load_default().await?,
    };

    match args.subcommand {
        Some(DeckSubcommand::Init { assets }) => {
            tracing::trace!("installing runtime: assets={assets:?}");
            let engine = DeckEngine::new(config, Arc::new(DirAssetSource::new(assets)));
            let progress: ProgressCallback = Arc::new(|fraction: f32, stage: &str| {
                println!("[{:>3.0}%] {stage}", fraction * 100.0);
            });
            engine.initialize(progress).await?;
            println!("{}", "runtime installed".valid());
        }
        Some(DeckSubcommand::Create {
            name,
            resolution,
            graphics,
            preset,
            envs,
            esync,
        }) => {
            tracing::trace!("creating container: name={name}");
            let custom_env = parse_env_pairs(&envs).map_err(DeckcoreError::InvalidConfig)?;

            // Flags are applied as settings over the configured defaults.
            let settings = MemorySettings::new();
            if let Some(resolution) = resolution {
                settings.set(SCREEN_RESOLUTION_KEY, &resolution.to_string());
            }
            if let Some(graphics) = graphics {
                settings.set(GRAPHICS_WRAPPER_KEY, &graphics.to_string());
            }
            if let Some(preset) = preset {
                settings.set(PERFORMANCE_PRESET_KEY, &preset.to_string());
            }
            if esync {
                settings.set(ESYNC_KEY, "true");
            }

            let container_config =
                ContainerConfig::from_settings(&settings, config.get_container_defaults())
                    .with_custom_env(custom_env);

            let engine = engine_with_home_assets(config);
            let container = engine
                .create_container(&name, Some(container_config))
                .await?;
            println!("{} {}", "created".valid(), container.get_id().literal());
        }
        Some(DeckSubcommand::List) => {
            let engine = engine_with_home_assets(config);
            let containers = engine.list_containers().await?;
            if containers.is_empty() {
                println!("no containers");
            }

            for container in containers {
                println!(
                    "{}  {}  {}  {} MiB",
                    container.get_id().literal(),
                    container.get_name(),
                    container.get_created_at().format("%Y-%m-%d %H:%M"),
                    container.get_size_bytes() / (1024 * 1024)
                );
            }
        }
        Some(DeckSubcommand::Status) => {
            let engine = engine_with_home_assets(config);
            let runtime = if engine.is_available().await {
                "installed".valid()
            } else {
                "not installed".error()
            };
            println!("{} {}", "home:".header(), engine.config().get_home().display());
            println!("{} {runtime}", "runtime:".header());
            println!(
                "{} {}",
                "containers:".header(),
                engine.list_containers().await?.len()
            );
        }
        Some(DeckSubcommand::Delete { id }) => {
            let engine = engine_with_home_assets(config);
            engine.delete_container(&id).await?;
            println!("{} {}", "deleted".valid(), id.literal());
        }
        Some(DeckSubcommand::Run {
            container,
            interval,
            executable,
            args,
        }) => {
            tracing::trace!("running executable: container={container:?}, executable={executable:?}, args={args:?}");
            let engine = engine_with_home_assets(config);
            run_executable(&engine, container, executable, args, interval).await?;
        }
        None => {
            DeckArgs::command().print_help()?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: *
//--------------------------------------------------------------------------------------------------

fn engine_with_home_assets(config: DeckConfig) -> DeckEngine {
    let assets = config.get_home().join(ASSETS_SUBDIR);
    DeckEngine::new(config, Arc::new(DirAssetSource::new(assets)))
}

async fn run_executable(
    engine: &DeckEngine,
    container: Option<String>,
    executable: PathBuf,
    args: Vec<String>,
    interval: u64,
) -> DeckcoreResult<()> {
    let container = match container {
        Some(id) => Arc::new(engine.containers().get(&id).await?),
        None => engine.default_container().await?,
    };

    let process = engine
        .launch_foreground(&container, &executable, &args)
        .await?;
    println!(
        "{} {} in {}",
        "launched".valid(),
        process.get_id().literal(),
        container.get_id()
    );

    let mut statuses = Box::pin(engine.monitor_process(process.get_id(), Duration::from_millis(interval)));
    loop {
        tokio::select! {
            status = statuses.next() => match status {
                Some(Ok(status)) => {
                    println!(
                        "{}  cpu {:>5.1}%  mem {:>8} KiB",
                        status.get_state(),
                        status.get_cpu_percent(),
                        status.get_memory_kb()
                    );
                }
                Some(Err(e)) => {
                    eprintln!("{}", e.to_string().error());
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                if let Some(state) = engine.stop_foreground().await? {
                    println!("{}", state.to_string().header());
                }
                break;
            }
        }
    }

    Ok(())
}
