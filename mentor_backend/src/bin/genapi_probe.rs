use anyhow::{bail, Context, Result};
use mentor_backend::config::BotConfig;
use mentor_backend::genapi::GenApiBackend;
use mentor_backend::http_client::build_http_client;
use mentor_backend::task_client::TaskClient;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Push one prompt through Gen-API and print the answer.
///
/// Usage: `genapi_probe <user text> [system prompt]`, or
/// `genapi_probe --init-config` to write a starter `mentor_config.toml`
/// next to the executable.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mentor_backend=debug")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(user_text) = args.next() else {
        bail!("usage: genapi_probe <user text> [system prompt] | genapi_probe --init-config");
    };
    if user_text == "--init-config" {
        return init_config();
    }

    let config = BotConfig::load();
    let system_prompt = args
        .next()
        .unwrap_or_else(|| config.prompts.goal_refinement.clone());

    if !config.has_api_key() {
        tracing::warn!("GENAPI_KEY is not set; the request will most likely be rejected");
    }

    let http = build_http_client().context("failed to build HTTP client")?;
    let backend = GenApiBackend::from_config(&config.genapi, http);
    let client = TaskClient::new(Arc::new(backend), config.task_client_config());

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    match runtime.block_on(client.run(&system_prompt, &user_text)) {
        Ok(text) => {
            println!("{}", text);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e.user_message());
            Err(e).context("Gen-API request failed")
        }
    }
}

fn init_config() -> Result<()> {
    let path = BotConfig::config_path();
    if path.exists() {
        bail!("{:?} already exists, not overwriting", path);
    }
    BotConfig::default().save()?;
    println!("Wrote {:?}", path);
    Ok(())
}
