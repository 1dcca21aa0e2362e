use std::time::Duration;

use clap::Parser;
use copycat_core::{ClientConfig, DomainAllowlist, RELAY_USER_AGENT};
use copycat_relay::{AppState, RelayConfig, serve};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "copycat-relay")]
struct RelayArgs {
    #[arg(long, env = "COPYCAT_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: String,

    /// Hostname suffixes the fetch proxy may reach. Pass an empty value to disable the check.
    #[arg(
        long,
        env = "COPYCAT_ALLOWED_DOMAINS",
        value_delimiter = ',',
        default_value = "drive.google.com,docs.google.com"
    )]
    allowed_domains: Vec<String>,

    /// Seconds to wait for upstream response headers; 0 waits indefinitely.
    #[arg(long, env = "COPYCAT_FETCH_TIMEOUT_SECS", default_value_t = 30)]
    fetch_timeout_secs: u64,

    #[arg(long, env = "COPYCAT_USER_AGENT", default_value = RELAY_USER_AGENT)]
    user_agent: String,

    #[arg(long, env = "SUPABASE_URL")]
    supabase_url: Option<String>,

    #[arg(long, env = "SUPABASE_KEY", hide_env_values = true)]
    supabase_key: Option<String>,
}

impl RelayArgs {
    fn into_config(self) -> RelayConfig {
        let storage = match (self.supabase_url, self.supabase_key) {
            (Some(url), Some(key)) => {
                let config = ClientConfig { url, key };
                match config.validate() {
                    Ok(()) => Some(config),
                    Err(err) => {
                        warn!("ignoring storage configuration: {}", err);
                        None
                    }
                }
            }
            _ => {
                warn!("SUPABASE_URL/SUPABASE_KEY not set; /config will answer 500");
                None
            }
        };

        RelayConfig {
            allowlist: DomainAllowlist::new(&self.allowed_domains),
            fetch_timeout: (self.fetch_timeout_secs > 0)
                .then(|| Duration::from_secs(self.fetch_timeout_secs)),
            user_agent: self.user_agent,
            storage,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = RelayArgs::parse();
    let bind_address = args.bind_address.clone();
    let config = args.into_config();
    if config.allowlist.is_enforced() {
        info!("fetch proxy restricted to {:?}", config.allowlist.suffixes());
    } else {
        warn!("fetch proxy domain allowlist disabled");
    }

    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(err) => {
            error!("failed to initialise relay: {}", err);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", bind_address, err);
            std::process::exit(1);
        }
    };

    info!("relay starting on {}", bind_address);
    if let Err(err) = serve(listener, state).await {
        warn!("relay server exited: {}", err);
    }
}
