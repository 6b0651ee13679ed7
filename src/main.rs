//! Nimbus CLI - log in to a Nimbus deployment and issue authenticated requests.

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::{form_urlencoded, Url};

use nimbus_client::{
    auth::{
        AuthKind, AuthProvider, AuthorizationCode, CodeObtainer, OAuth2Provider, Session,
        SessionStore,
    },
    config::Config,
    Client, Error, RequestData, TraceStage,
};

#[derive(Parser)]
#[command(name = "nimbus", about = "Nimbus cloud storage client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// API base URL, overriding the config file.
    #[arg(long, global = true, env = "NIMBUS_BASE_URL")]
    base_url: Option<String>,

    /// Session profile name.
    #[arg(long, global = true, default_value = "default")]
    profile: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in with email and password.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "NIMBUS_PASSWORD")]
        password: String,
    },
    /// Log in through the OAuth2 authorization-code flow.
    Oauth2 {
        /// Print the authorization URL instead of opening a browser.
        #[arg(long)]
        no_browser: bool,
    },
    /// GET an API path with the saved session and print the response body.
    Get {
        path: String,
        /// Query parameters as key=value.
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
    /// Forget the saved session.
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?
            .with_env_overrides(),
        None => Config::load(),
    };
    if let Some(base_url) = &cli.base_url {
        config.api.base_url = base_url.clone();
    }

    let client = Client::new(&config.api).context("Failed to create client")?;
    client.add_stage(Arc::new(TraceStage)).await;

    match cli.command {
        Commands::Login { email, password } => {
            client
                .authenticate(email, password)
                .await
                .context("Login failed")?;
            save_session(&client, &cli.profile).await?;
            println!("Logged in.");
        }
        Commands::Oauth2 { no_browser } => {
            if !config.oauth2.is_configured() {
                bail!("OAuth2 client_id and client_secret must be configured");
            }
            let obtainer = LoopbackObtainer::new(&config.oauth2.redirect_url, !no_browser)?;
            let mut provider = OAuth2Provider::new(config.oauth2.settings(), Arc::new(obtainer));
            client
                .authenticate_with_provider(&mut provider)
                .await
                .context("OAuth2 login failed")?;
            save_session(&client, &cli.profile).await?;
            println!("Logged in.");
        }
        Commands::Get { path, params } => {
            restore_session(&client, &config, &cli.profile).await?;

            let mut request = RequestData::get(path);
            for param in params {
                let (key, value) = param
                    .split_once('=')
                    .with_context(|| format!("Invalid parameter (expected key=value): {}", param))?;
                request = request.param(key, value);
            }

            let result = print_body(&client, request).await;
            // The credential may have been renewed even if the request failed.
            save_session(&client, &cli.profile).await?;
            result?;
        }
        Commands::Logout => {
            let mut store = SessionStore::load()?;
            if store.remove(&cli.profile).is_some() {
                store.save()?;
                println!("Logged out.");
            } else {
                println!("No saved session for profile '{}'.", cli.profile);
            }
        }
    }

    Ok(())
}

async fn print_body(client: &Client, request: RequestData) -> Result<()> {
    let mut body = client.request_stream(request).await?;
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = body.next().await {
        stdout.write_all(&chunk?).await?;
    }
    stdout.flush().await?;
    Ok(())
}

async fn save_session(client: &Client, profile: &str) -> Result<()> {
    let Some(credential) = client.credential().await else {
        return Ok(());
    };

    let mut store = SessionStore::load()?;
    store.set(profile, Session::new(client.base_url().as_str(), credential));
    store.save()?;
    info!(profile, "session saved");
    Ok(())
}

async fn restore_session(client: &Client, config: &Config, profile: &str) -> Result<()> {
    let store = SessionStore::load()?;
    let Some(credential) = store
        .credential_for(profile, client.base_url().as_str())
        .cloned()
    else {
        bail!("Not logged in; run `nimbus login` or `nimbus oauth2` first");
    };

    match credential.kind() {
        AuthKind::Token => client.set_token(credential.access_token()).await?,
        AuthKind::OAuth2 => {
            if !config.oauth2.is_configured() {
                bail!("OAuth2 session found but no OAuth2 client is configured");
            }
            let mut provider =
                OAuth2Provider::new(config.oauth2.settings(), Arc::new(NoInteraction));
            client.attach_provider(&mut provider)?;
            provider.set_credential(credential).await?;
        }
    }
    Ok(())
}

/// Obtainer for restored sessions, which must never prompt.
struct NoInteraction;

#[async_trait]
impl CodeObtainer for NoInteraction {
    async fn obtain_code(&self, _authorization_url: &str) -> nimbus_client::Result<AuthorizationCode> {
        Err(Error::Authorization(
            "interactive login required; run `nimbus oauth2`".to_string(),
        ))
    }
}

/// Captures the authorization code on a local redirect listener.
struct LoopbackObtainer {
    addr: String,
    open_browser: bool,
}

impl LoopbackObtainer {
    fn new(redirect_url: &str, open_browser: bool) -> Result<Self> {
        let url = Url::parse(redirect_url)
            .with_context(|| format!("Invalid redirect URL: {}", redirect_url))?;
        let host = url.host_str().context("Redirect URL has no host")?;
        let port = url
            .port_or_known_default()
            .context("Redirect URL has no port")?;

        Ok(Self {
            addr: format!("{}:{}", host, port),
            open_browser,
        })
    }
}

#[async_trait]
impl CodeObtainer for LoopbackObtainer {
    async fn obtain_code(&self, authorization_url: &str) -> nimbus_client::Result<AuthorizationCode> {
        let listener = TcpListener::bind(&self.addr).await?;

        println!("Please open {} and confirm access", authorization_url);
        if self.open_browser {
            if let Err(err) = open::that(authorization_url) {
                warn!(error = %err, "failed to open browser");
            }
        }

        let (mut stream, _) = listener.accept().await?;
        let (reader, mut writer) = stream.split();
        let mut request_line = String::new();
        BufReader::new(reader).read_line(&mut request_line).await?;

        let reply = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n\
                     Authorization received. You can close this window.\n";
        writer.write_all(reply.as_bytes()).await?;
        writer.flush().await?;

        parse_callback(&request_line)
    }
}

/// Extract the code and state from a redirect request line like
/// `GET /?code=abc&state=xyz HTTP/1.1`.
fn parse_callback(request_line: &str) -> nimbus_client::Result<AuthorizationCode> {
    let target = request_line.split_whitespace().nth(1).unwrap_or_default();
    let query = target.split_once('?').map(|(_, q)| q).unwrap_or_default();

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        let value = value.into_owned();
        match &*key {
            "code" => code = Some(value),
            "state" => state = Some(value),
            "error" => error = Some(value),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Err(Error::Authorization(error));
    }
    let code = code.ok_or_else(|| Error::Authorization("redirect carried no code".to_string()))?;

    let mut result = AuthorizationCode::new(code);
    if let Some(state) = state {
        result = result.with_state(state);
    }
    Ok(result)
}
