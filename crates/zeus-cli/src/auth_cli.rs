use std::io::BufRead;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Args, Subcommand};
use serde_json::json;
use tracing::info;
use zeus_session::Session;
use zeus_session::core::token::redact;

#[derive(Args)]
pub struct LoginArgs {
    #[arg(long, short)]
    pub username: String,
    /// Read from stdin when omitted
    #[arg(long)]
    pub password: Option<String>,
}

#[derive(Args)]
pub struct TokenArgs {
    #[command(subcommand)]
    pub command: TokenCommand,
}

#[derive(Subcommand)]
pub enum TokenCommand {
    /// Decode the stored access token and report its expiry
    Inspect,
}

pub async fn login(session: &Session, args: LoginArgs, json: bool) -> Result<()> {
    let password = match args.password {
        Some(password) => password,
        None => read_password()?,
    };
    let pair = session
        .login(&args.username, &password)
        .await
        .context("login failed")?;
    info!(username = %args.username, "signed in");

    if json {
        let out = json!({
            "authenticated": true,
            "username": args.username,
            "access_token": redact(&pair.access_token),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Signed in as {}", args.username);
    }
    Ok(())
}

fn read_password() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("no password given; pass --password or pipe it on stdin");
    }
    Ok(password)
}

pub async fn logout(session: &Session) -> Result<()> {
    session.logout().await;
    println!("Signed out");
    Ok(())
}

pub async fn me(session: &Session, json: bool) -> Result<()> {
    let profile = session
        .api()
        .current_user()
        .await
        .context("failed to load the current user")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
        return Ok(());
    }
    println!("{} (id {})", profile.display_name(), profile.id);
    if let Some(email) = &profile.email {
        println!("  email: {email}");
    }
    println!("  active: {}", profile.is_active);
    println!("  verified: {}", profile.is_verified);
    if profile.is_superuser {
        println!("  superuser: true");
    }
    Ok(())
}

pub fn token(session: &Session, args: TokenArgs, json: bool) -> Result<()> {
    match args.command {
        TokenCommand::Inspect => inspect(session, json),
    }
}

fn inspect(session: &Session, json: bool) -> Result<()> {
    let store = session.store();
    let Some(access) = store.access_token() else {
        bail!("not signed in; run `zeus login`");
    };
    let payload = store.decode_payload(&access);
    let expired = store.is_expired(&access);
    let expires_at = payload
        .as_ref()
        .and_then(|payload| payload.exp)
        .and_then(format_unix);
    let issued_at = payload
        .as_ref()
        .and_then(|payload| payload.iat)
        .and_then(format_unix);
    let subject = payload.as_ref().and_then(|payload| payload.subject());
    let email = payload.as_ref().and_then(|payload| payload.email());
    let roles = payload.as_ref().map(|payload| payload.roles()).unwrap_or_default();

    if json {
        let out = json!({
            "access_token": redact(&access),
            "has_refresh_token": store.refresh_token().is_some(),
            "decodable": payload.is_some(),
            "subject": subject,
            "email": email,
            "roles": roles,
            "issued_at": issued_at,
            "expires_at": expires_at,
            "expired": expired,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("access token: {}", redact(&access));
    if payload.is_none() {
        println!("  payload: not decodable");
    }
    if let Some(subject) = subject {
        println!("  subject: {subject}");
    }
    if let Some(email) = email {
        println!("  email: {email}");
    }
    if !roles.is_empty() {
        println!("  roles: {}", roles.join(", "));
    }
    if let Some(issued_at) = issued_at {
        println!("  issued: {issued_at}");
    }
    match expires_at {
        Some(expires_at) => println!("  expires: {expires_at}"),
        None => println!("  expires: never"),
    }
    println!("  expired: {expired}");
    println!(
        "refresh token: {}",
        if store.refresh_token().is_some() { "stored" } else { "missing" }
    );
    Ok(())
}

fn format_unix(seconds: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
}
