use boxsyncd::daemon::{DaemonConfig, DaemonRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: boxsyncd");
            println!("Configuration comes from BOXSYNC_* environment variables (or a .env file):");
            println!("  BOXSYNC_TOKEN        API token (required)");
            println!("  BOXSYNC_API_URL      API base URL override");
            println!("  BOXSYNC_CACHE_DIR    local cache directory");
            println!("  BOXSYNC_STATE_FILE   metadata state file");
            println!("  BOXSYNC_NOTIFY_URL   change-notification endpoint");
            return Ok(());
        }
        CliMode::Run => {}
    }
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["boxsyncd".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        let mode = parse_cli_mode(vec!["boxsyncd".to_string(), "--help".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(vec!["boxsyncd".to_string(), "--bogus".to_string()]).is_err());
    }
}
