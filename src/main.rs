use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use gemwire::{ClientConnection, Dialer, ResponseHeader, ServerVerification, Status, TofuStore, tls};
use log::info;

/// Fetch a Gemini URL and copy the response body to stdout.
#[derive(Parser, Debug)]
#[command(name = "gemwire", version)]
struct Args {
    /// The URL to fetch; `gemini://` is assumed when no scheme is given.
    url: String,

    /// Accept any server certificate.
    #[arg(long, conflicts_with = "tofu")]
    insecure: bool,

    /// Trust server certificates on first use, remembering them in this
    /// JSON file.
    #[arg(long, value_name = "PATH")]
    tofu: Option<PathBuf>,

    /// Present the certificate chain in this PEM file to servers that ask
    /// for a client certificate.
    #[arg(long, value_name = "PATH", requires = "key")]
    cert: Option<PathBuf>,

    /// The private key for `--cert`.
    #[arg(long, value_name = "PATH", requires = "cert")]
    key: Option<PathBuf>,

    /// How many redirects to follow.
    #[arg(long, default_value_t = 5)]
    max_redirects: usize,
}

fn describe(header: &ResponseHeader) -> String {
    let text = if header.meta.is_empty() {
        header.status.to_string()
    } else {
        header.meta.clone()
    };

    if header.status != Status::SLOW_DOWN {
        return text;
    }
    match header.meta.parse::<u64>() {
        Ok(1) => format!("{text} (1 second)"),
        Ok(seconds) => format!("{text} ({seconds} seconds)"),
        Err(_) => text,
    }
}

async fn copy_body(mut conn: ClientConnection) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    tokio::io::copy(&mut conn, &mut stdout).await.context("reading body")?;
    conn.close().await.context("closing connection")
}

async fn run(args: Args) -> Result<bool> {
    let verification = match (args.insecure, args.tofu) {
        (true, _) => ServerVerification::Insecure,
        (false, Some(path)) => ServerVerification::Tofu(TofuStore::open(path)?),
        (false, None) => ServerVerification::WebPki,
    };
    let config = match (args.cert, args.key) {
        (Some(cert_path), Some(key_path)) => {
            let chain =
                tls::load_certificates(&cert_path).with_context(|| format!("reading {}", cert_path.display()))?;
            let key = tls::load_private_key(&key_path).with_context(|| format!("reading {}", key_path.display()))?;
            tls::client_config_with_identity(verification, chain, key)?
        }
        _ => tls::client_config(verification)?,
    };
    let dialer = Dialer::new(Arc::new(config));

    let mut url = args.url;
    if !url.contains("://") {
        url = format!("gemini://{url}");
    }

    for _ in 0..=args.max_redirects {
        let (conn, header) = dialer.dial(&url).await?;

        if header.status.is_redirect() {
            info!("redirected to {}", header.meta);
            url = header.meta;
            continue;
        }

        if !header.status.is_success() {
            eprintln!("status: {}", describe(&header));
        }
        copy_body(conn).await?;

        return Ok(header.status.is_success());
    }

    bail!("too many redirects")
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match run(Args::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
