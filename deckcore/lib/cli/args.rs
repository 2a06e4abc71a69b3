use std::path::PathBuf;

use clap::Parser;

use crate::config::{GraphicsWrapper, PerformancePreset, ScreenResolution};

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// deck - prepare Windows compatibility containers and run games inside them
#[derive(Debug, Parser)]
#[command(name = "deck", author, about, version, styles=styles::styles())]
pub struct DeckArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<DeckSubcommand>,

    /// Deck home directory, defaults to $DECK_HOME or ~/.deck
    #[arg(long, global = true, value_name = "PATH")]
    pub home: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum DeckSubcommand {
    /// Install or update the runtime from a directory of bundled archives
    #[command(name = "init")]
    Init {
        /// Directory holding the rootfs, box64 and proot archives
        #[arg(value_name = "ASSETS")]
        assets: PathBuf,
    },

    /// Create and bootstrap a new container
    #[command(name = "create")]
    Create {
        /// Display name of the container
        #[arg(required = true)]
        name: String,

        /// Virtual desktop resolution, e.g. 1280x720
        #[arg(long)]
        resolution: Option<ScreenResolution>,

        /// Direct3D implementation: dxvk or wined3d
        #[arg(long)]
        graphics: Option<GraphicsWrapper>,

        /// Translator tuning: stability, compatibility, intermediate or performance
        #[arg(long)]
        preset: Option<PerformancePreset>,

        /// Extra environment variables as KEY=VALUE
        #[arg(long = "env", value_name = "KEY=VALUE")]
        envs: Vec<String>,

        /// Enable esync
        #[arg(long)]
        esync: bool,
    },

    /// List containers
    #[command(name = "list")]
    List,

    /// Show whether the runtime is installed and how many containers exist
    #[command(name = "status")]
    Status,

    /// Delete a container
    #[command(name = "delete")]
    Delete {
        /// The container id
        #[arg(required = true)]
        id: String,
    },

    /// Run a Windows executable and wait for it to exit
    #[command(name = "run")]
    Run {
        /// Container id, defaults to the shared default container
        #[arg(short, long)]
        container: Option<String>,

        /// Status report interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval: u64,

        /// Path to the executable on the host
        #[arg(required = true)]
        executable: PathBuf,

        /// Arguments passed to the executable
        #[arg(last = true)]
        args: Vec<String>,
    },
}

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Splits `KEY=VALUE` pairs, rejecting entries without a `=` or with an empty key.
pub fn parse_env_pairs(pairs: &[String]) -> Result<Vec<(String, String)>, String> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(format!("invalid environment variable: {pair}")),
        })
        .collect()
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create() {
        let args = DeckArgs::parse_from([
            "deck",
            "create",
            "Steam",
            "--resolution",
            "1920x1080",
            "--preset",
            "performance",
            "--env",
            "DXVK_HUD=fps",
        ]);

        match args.subcommand {
            Some(DeckSubcommand::Create {
                name,
                resolution,
                preset,
                envs,
                ..
            }) => {
                assert_eq!(name, "Steam");
                assert_eq!(resolution, Some(ScreenResolution::new(1920, 1080)));
                assert_eq!(preset, Some(PerformancePreset::Performance));
                assert_eq!(envs, vec!["DXVK_HUD=fps".to_string()]);
            }
            other => panic!("unexpected subcommand: {other:?}"),
        }
    }

    #[test]
    fn test_parse_run_with_trailing_args() {
        let args = DeckArgs::parse_from(["deck", "run", "/games/quake.exe", "--", "-window"]);

        match args.subcommand {
            Some(DeckSubcommand::Run {
                container,
                executable,
                args,
                interval,
            }) => {
                assert_eq!(container, None);
                assert_eq!(executable, PathBuf::from("/games/quake.exe"));
                assert_eq!(args, vec!["-window".to_string()]);
                assert_eq!(interval, 1000);
            }
            other => panic!("unexpected subcommand: {other:?}"),
        }
    }

    #[test]
    fn test_parse_env_pairs() {
        assert_eq!(
            parse_env_pairs(&["A=1".to_string(), "B=x=y".to_string()]).unwrap(),
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
        assert!(parse_env_pairs(&["=1".to_string()]).is_err());
        assert!(parse_env_pairs(&["NOVALUE".to_string()]).is_err());
    }
}
