//! Zentinel SAML SP command line.
//!
//! Checks provider configuration and resolves SAML responses offline.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use zentinel_saml_sp::saml::{ProviderRegistry, SamlConfig, SamlProvider, UserInfo};
use zentinel_saml_sp::state::StateStore;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "zentinel-saml-sp")]
#[command(about = "SAML 2.0 Service Provider identity pipeline for Zentinel")]
struct Args {
    /// Path to the SAML configuration file (JSON)
    #[arg(long, default_value = "/etc/zentinel/saml.json", env = "SAML_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, env = "SAML_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize every enabled provider and report the result
    Check,

    /// Validate a SAML response and print the resolved user as JSON
    Resolve {
        /// Provider id as configured
        #[arg(long)]
        provider: String,

        /// File holding the base64 SAMLResponse (or the decoded XML)
        #[arg(long)]
        response_file: PathBuf,

        /// Expected Destination, defaults to the provider's ACS URL
        #[arg(long)]
        destination: Option<String>,
    },

    /// Evict expired relay states and replay records from the state store
    Purge,
}

#[derive(Debug, Serialize)]
struct ProviderReport {
    id: String,
    idp_entity_id: String,
    sso_url: String,
    slo_url: Option<String>,
    signing_certificates: usize,
}

#[derive(Debug, Serialize)]
struct ResolveReport<'a> {
    provider: &'a str,
    assertion_id: &'a str,
    user: &'a UserInfo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = SamlConfig::from_file(&args.config)?;
    info!(
        path = ?args.config,
        providers = config.providers.len(),
        enabled = config.enabled,
        "Configuration loaded"
    );

    match args.command {
        Command::Check => check(&config).await,
        Command::Resolve {
            provider,
            response_file,
            destination,
        } => resolve(&config, &provider, &response_file, destination.as_deref()).await,
        Command::Purge => purge(&config),
    }
}

async fn check(config: &SamlConfig) -> Result<()> {
    let registry = ProviderRegistry::initialize(config).await?;

    let reports: Vec<ProviderReport> = registry
        .list()
        .into_iter()
        .filter_map(|id| registry.get(&id))
        .map(|provider| ProviderReport {
            id: provider.id().to_string(),
            idp_entity_id: provider.idp().entity_id.clone(),
            sso_url: provider.idp().sso_url.clone(),
            slo_url: provider.idp().slo_url.clone(),
            signing_certificates: provider.idp().signing_certificates.len(),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

async fn resolve(
    config: &SamlConfig,
    provider_id: &str,
    response_file: &Path,
    destination: Option<&str>,
) -> Result<()> {
    let provider_config = config
        .providers
        .get(provider_id)
        .ok_or_else(|| anyhow!("unknown SAML provider: {}", provider_id))?;
    let provider = SamlProvider::initialize(provider_config.clone()).await?;

    let raw = std::fs::read_to_string(response_file)
        .with_context(|| format!("Failed to read response file: {:?}", response_file))?;
    let raw = encode_if_xml(raw.trim());

    let processed = provider.resolve(&raw, destination)?;
    let report = ResolveReport {
        provider: provider.id(),
        assertion_id: &processed.assertion.id,
        user: &processed.user_info,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn purge(config: &SamlConfig) -> Result<()> {
    let store = StateStore::open(Path::new(&config.state_store_path), config.relay_state_ttl_secs)?;
    let evicted = store.evict_expired()?;
    info!(
        relay_states = evicted.relay_states,
        assertions = evicted.assertions,
        "Expired SAML state evicted"
    );
    Ok(())
}

/// Accept a decoded XML document as well as the posted base64 form.
fn encode_if_xml(raw: &str) -> String {
    if raw.starts_with('<') {
        BASE64.encode(raw)
    } else {
        raw.to_string()
    }
}
