#![allow(clippy::print_stdout)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use zeus_session::api::ApiError;
use zeus_session::core::{ClientConfig, FileStorage};
use zeus_session::{Session, SessionError};

mod auth_cli;
mod realtime_cli;
mod system_cli;

#[derive(Parser)]
#[command(name = "zeus")]
#[command(about = "Zeus session client")]
pub struct ZeusCli {
    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Sign in and persist the token pair
    Login(auth_cli::LoginArgs),
    /// Revoke the refresh token and forget stored credentials
    Logout,
    /// Show the signed-in user
    Me,
    /// Stored token utilities
    Token(auth_cli::TokenArgs),
    /// Show backend system status
    Status,
    /// Show resolved endpoints and where they came from
    Config,
    /// Stream realtime events until interrupted
    Listen(realtime_cli::ListenArgs),
}

pub async fn run(cli: ZeusCli) -> anyhow::Result<()> {
    let config = ClientConfig::from_env().context("invalid client configuration")?;
    if matches!(cli.command, Commands::Config) {
        return system_cli::show_config(&config, cli.json);
    }

    let store_path = token_store_path(&config)?;
    let session = Session::init(config, Arc::new(FileStorage::new(&store_path)))
        .await
        .with_context(|| format!("failed to open session at {}", store_path.display()))?;

    let result = match cli.command {
        Commands::Login(args) => auth_cli::login(&session, args, cli.json).await,
        Commands::Logout => auth_cli::logout(&session).await,
        Commands::Me => auth_cli::me(&session, cli.json).await,
        Commands::Token(args) => auth_cli::token(&session, args, cli.json),
        Commands::Status => system_cli::status(&session, cli.json).await,
        Commands::Listen(args) => realtime_cli::listen(&session, args).await,
        Commands::Config => Ok(()),
    };
    session.dispose().await;
    result.map_err(|error| {
        if ends_session(&error) {
            error.context("signed out; run `zeus login`")
        } else {
            error
        }
    })
}

/// Whether the failure discarded the stored session.
fn ends_session(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        let api = cause.downcast_ref::<ApiError>().or_else(|| {
            match cause.downcast_ref::<SessionError>() {
                Some(SessionError::Api(api)) => Some(api),
                _ => None,
            }
        });
        api.is_some_and(|api| api.kind.ends_session())
    })
}

/// `ZEUS_TOKEN_STORE_PATH`, else `<config dir>/zeus/session.json`.
pub fn token_store_path(config: &ClientConfig) -> anyhow::Result<PathBuf> {
    if let Some(path) = &config.token_store_path {
        return Ok(path.clone());
    }
    let base = dirs::config_dir()
        .context("no user config directory; set ZEUS_TOKEN_STORE_PATH")?;
    Ok(base.join("zeus").join("session.json"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use clap::error::ErrorKind;
    use zeus_session::SessionError;
    use zeus_session::api::{ApiError, ApiErrorKind};
    use zeus_session::core::ClientConfig;

    use super::{Commands, ZeusCli, ends_session, token_store_path};

    #[test]
    fn cli_requires_subcommand() {
        let err = match ZeusCli::try_parse_from(["zeus"]) {
            Ok(_) => panic!("expected missing subcommand parse error"),
            Err(err) => err,
        };
        assert_eq!(
            err.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn cli_rejects_unknown_subcommand() {
        let err = match ZeusCli::try_parse_from(["zeus", "unknown-subcommand"]) {
            Ok(_) => panic!("expected invalid subcommand parse error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn login_requires_username() {
        let err = match ZeusCli::try_parse_from(["zeus", "login", "--password", "x"]) {
            Ok(_) => panic!("expected missing username"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn login_parses_credentials_and_global_json() {
        let cli = ZeusCli::try_parse_from([
            "zeus", "login", "--username", "zeus", "--password", "olympus", "--json",
        ])
        .expect("parse");
        assert!(cli.json);
        match cli.command {
            Commands::Login(args) => {
                assert_eq!(args.username, "zeus");
                assert_eq!(args.password.as_deref(), Some("olympus"));
            }
            _ => panic!("expected login"),
        }
    }

    #[test]
    fn listen_splits_event_names() {
        let cli = ZeusCli::try_parse_from([
            "zeus",
            "listen",
            "--events",
            "system_status,auth_response",
            "--duration-secs",
            "5",
        ])
        .expect("parse");
        match cli.command {
            Commands::Listen(args) => {
                assert_eq!(args.events, vec!["system_status", "auth_response"]);
                assert_eq!(args.duration_secs, Some(5));
            }
            _ => panic!("expected listen"),
        }
    }

    #[test]
    fn listen_defaults_to_server_frames() {
        let cli = ZeusCli::try_parse_from(["zeus", "listen"]).expect("parse");
        match cli.command {
            Commands::Listen(args) => {
                assert_eq!(args.events, vec!["message", "system_status", "status_update"]);
                assert_eq!(args.duration_secs, None);
            }
            _ => panic!("expected listen"),
        }
    }

    #[test]
    fn token_inspect_parses() {
        let cli = ZeusCli::try_parse_from(["zeus", "token", "inspect"]).expect("parse");
        assert!(matches!(cli.command, Commands::Token(_)));
    }

    #[test]
    fn store_path_prefers_environment_override() {
        let config = ClientConfig::from_lookup(|key| {
            (key == "ZEUS_TOKEN_STORE_PATH").then(|| "/tmp/zeus-test/session.json".to_string())
        })
        .expect("config");
        assert_eq!(
            token_store_path(&config).expect("path"),
            PathBuf::from("/tmp/zeus-test/session.json")
        );
    }

    #[test]
    fn session_ending_failures_are_detected_through_context() {
        let forbidden = anyhow::Error::new(SessionError::Api(ApiError::of_kind(
            ApiErrorKind::Forbidden,
        )))
        .context("failed to load the current user");
        assert!(ends_session(&forbidden));

        let refresh_failed = anyhow::Error::new(ApiError::of_kind(ApiErrorKind::RefreshFailed))
            .context("failed to load system status");
        assert!(ends_session(&refresh_failed));

        let offline = anyhow::Error::new(ApiError::of_kind(ApiErrorKind::Network))
            .context("failed to load system status");
        assert!(!ends_session(&offline));
        assert!(!ends_session(&anyhow::anyhow!("not signed in")));
    }
}
