//! `mktsd` — CLI entry point for the market-data pipeline (spec.md §6).
//!
//! Thin by design: argument parsing and exit-code mapping live here, every
//! behavior is implemented in the library crate.

use anyhow::Result;
use clap::{Parser, Subcommand};
use mkts_core::auth::CredentialStore;
use mkts_core::config::{DbAliasName, Settings};
use mkts_core::cycle::run_cycle;
use mkts_core::fit::{self, FitMetadata};
use mkts_core::sde::SqliteSde;
use mkts_core::store::ReplicatedStore;
use mkts_core::watchlist::{self, Target};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mkts")]
#[command(about = "EVE Online market-data ingest and derivation pipeline")]
struct Cli {
    /// Run the optional FETCH_HISTORY stage for this cycle.
    #[arg(long)]
    history: bool,

    /// Print the configured tables for the market store and exit.
    #[arg(long)]
    check_tables: bool,

    /// Validate environment configuration and exit without running a cycle.
    #[arg(long)]
    validate_env: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add type_ids to the watchlist.
    AddWatchlist {
        /// Comma-separated list of type_ids.
        #[arg(long, value_delimiter = ',')]
        type_id: Vec<i64>,
    },

    /// Parse and apply an EFT fit file.
    UpdateFit {
        #[arg(long)]
        fit_file: PathBuf,

        #[arg(long)]
        meta_file: PathBuf,

        /// Write to the remote replica instead of the local file only.
        #[arg(long)]
        remote: bool,

        /// Keep existing fit items instead of clearing them first.
        #[arg(long)]
        no_clear: bool,

        /// Parse and resolve only; perform no writes.
        #[arg(long)]
        dry_run: bool,

        /// Database alias to target (defaults to the fittings store).
        #[arg(long)]
        target: Option<String>,
    },

    /// Sync the local replica against its remote.
    Sync,

    /// Validate that the local replica matches its remote watermark.
    Validate,
}

/// Minimal on-disk shape for `--meta-file`: everything `update_fit` needs
/// beyond the fit text itself.
#[derive(Debug, serde::Deserialize)]
struct FitMetaFile {
    description: String,
    name: String,
    fit_id: i64,
    doctrine_id: i64,
    ship_target: i64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mkts_core=info".parse().unwrap()))
        .init();

    let exit_code = run().await;
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            error!(reason = %e, "configuration invalid");
            return 1;
        }
    };

    if cli.validate_env {
        info!("environment configuration is valid");
        return 0;
    }

    if cli.check_tables {
        return check_tables(&settings).await;
    }

    match cli.command {
        Some(Commands::AddWatchlist { type_id }) => add_watchlist(&settings, type_id).await,
        Some(Commands::UpdateFit {
            fit_file,
            meta_file,
            remote,
            no_clear,
            dry_run,
            target,
        }) => update_fit_command(&settings, fit_file, meta_file, remote, no_clear, dry_run, target).await,
        Some(Commands::Sync) => sync_command(&settings).await,
        Some(Commands::Validate) => validate_command(&settings).await,
        None => run_cycle_command(&settings, cli.history).await,
    }
}

async fn run_cycle_command(settings: &Settings, history: bool) -> i32 {
    let credentials = match build_credential_store(settings) {
        Ok(c) => c,
        Err(e) => {
            error!(reason = %e, "credential configuration invalid");
            return 1;
        }
    };

    let report = run_cycle(settings, &credentials, history).await;
    match &report.failed_at {
        None => info!("cycle complete"),
        Some(stage) => error!(?stage, reason = ?report.reason, "cycle failed"),
    }
    report.exit_code()
}

fn build_credential_store(settings: &Settings) -> Result<CredentialStore> {
    let client_id = std::env::var("ESI_CLIENT_ID")?;
    let secret_key = std::env::var("ESI_SECRET_KEY")?;
    let refresh_token = std::env::var("ESI_REFRESH_TOKEN")?;
    Ok(CredentialStore::new(
        "token.json",
        client_id,
        secret_key,
        refresh_token,
        settings.esi.token_url(),
    ))
}

async fn check_tables(settings: &Settings) -> i32 {
    let alias_name = settings.market_db_alias();
    let alias = match settings.alias(alias_name) {
        Ok(a) => a,
        Err(e) => {
            error!(reason = %e, "config error");
            return 1;
        }
    };
    let store = match ReplicatedStore::open(alias_name.as_str(), alias) {
        Ok(s) => s,
        Err(e) => {
            error!(reason = %e, "failed to open market store");
            return 2;
        }
    };
    match store.table_list().await {
        Ok(tables) => {
            for table in tables {
                println!("{table}");
            }
            0
        }
        Err(e) => {
            error!(reason = %e, "failed to list tables");
            2
        }
    }
}

async fn add_watchlist(settings: &Settings, type_ids: Vec<i64>) -> i32 {
    if type_ids.is_empty() {
        error!("add_watchlist requires at least one --type_id");
        return 1;
    }

    let alias_name = settings.market_db_alias();
    let alias = match settings.alias(alias_name) {
        Ok(a) => a,
        Err(e) => {
            error!(reason = %e, "config error");
            return 1;
        }
    };
    let store = match ReplicatedStore::open(alias_name.as_str(), alias) {
        Ok(s) => s,
        Err(e) => {
            error!(reason = %e, "failed to open market store");
            return 2;
        }
    };

    let sde_alias = match settings.alias(DbAliasName::Sde) {
        Ok(a) => a,
        Err(e) => {
            error!(reason = %e, "config error");
            return 1;
        }
    };
    let catalogue = match SqliteSde::open(&sde_alias.file_name) {
        Ok(c) => c,
        Err(e) => {
            error!(reason = %e, "failed to open static catalogue");
            return 2;
        }
    };

    let ids: HashSet<i64> = type_ids.into_iter().collect();
    let conn_arc = store.engine();
    let mut conn = conn_arc.lock().await;
    match watchlist::add_to_watchlist(&mut conn, &catalogue, &ids, Target::Local).await {
        Ok(report) => {
            info!(
                added = report.added.len(),
                already_present = report.already_present.len(),
                unresolved = report.unresolved.len(),
                "watchlist updated"
            );
            0
        }
        Err(e) => {
            error!(reason = %e, "add_to_watchlist failed");
            2
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn update_fit_command(
    settings: &Settings,
    fit_file: PathBuf,
    meta_file: PathBuf,
    remote: bool,
    no_clear: bool,
    dry_run: bool,
    _target: Option<String>,
) -> i32 {
    let fit_text = match std::fs::read_to_string(&fit_file) {
        Ok(s) => s,
        Err(e) => {
            error!(reason = %e, path = ?fit_file, "failed to read fit file");
            return 1;
        }
    };
    let meta_raw = match std::fs::read_to_string(&meta_file) {
        Ok(s) => s,
        Err(e) => {
            error!(reason = %e, path = ?meta_file, "failed to read meta file");
            return 1;
        }
    };
    let meta: FitMetaFile = match serde_json::from_str(&meta_raw) {
        Ok(m) => m,
        Err(e) => {
            error!(reason = %e, "malformed meta file");
            return 1;
        }
    };
    let metadata = FitMetadata {
        description: meta.description,
        name: meta.name,
        fit_id: meta.fit_id,
        doctrine_id: meta.doctrine_id,
        ship_target: meta.ship_target,
    };

    let sde_alias = match settings.alias(DbAliasName::Sde) {
        Ok(a) => a,
        Err(e) => {
            error!(reason = %e, "config error");
            return 1;
        }
    };
    let catalogue = match SqliteSde::open(&sde_alias.file_name) {
        Ok(c) => c,
        Err(e) => {
            error!(reason = %e, "failed to open static catalogue");
            return 2;
        }
    };

    let fittings_alias_name = DbAliasName::Fittings;
    let fittings_alias = match settings.alias(fittings_alias_name) {
        Ok(a) => a,
        Err(e) => {
            error!(reason = %e, "config error");
            return 1;
        }
    };
    let fittings_store = match ReplicatedStore::open(fittings_alias_name.as_str(), fittings_alias) {
        Ok(s) => s,
        Err(e) => {
            error!(reason = %e, "failed to open fittings store");
            return 2;
        }
    };

    let market_alias_name = if remote {
        settings.market_db_alias()
    } else {
        DbAliasName::WcmktTest
    };
    let market_alias = match settings.alias(market_alias_name) {
        Ok(a) => a,
        Err(e) => {
            error!(reason = %e, "config error");
            return 1;
        }
    };
    let market_store = match ReplicatedStore::open(market_alias_name.as_str(), market_alias) {
        Ok(s) => s,
        Err(e) => {
            error!(reason = %e, "failed to open market store");
            return 2;
        }
    };

    let fittings_conn_arc = fittings_store.engine();
    let market_conn_arc = market_store.engine();
    let mut fittings_conn = fittings_conn_arc.lock().await;
    let mut market_conn = market_conn_arc.lock().await;

    if let Err(e) = fit::create_fit_tables(&fittings_conn, &market_conn) {
        error!(reason = %e, "failed to create fittings tables");
        return 2;
    }

    match fit::update_fit(
        &mut fittings_conn,
        &mut market_conn,
        &catalogue,
        &fit_text,
        &metadata,
        Target::Local,
        !no_clear,
        dry_run,
    )
    .await
    {
        Ok(outcome) => {
            for missing in &outcome.preview.missing_items {
                println!("unresolved: {missing}");
            }
            for item in &outcome.preview.items {
                println!("{}: {} x{}", item.flag, item.type_name, item.quantity);
            }
            info!(
                watchlist_additions = outcome.watchlist_additions.len(),
                dry_run, "fit update complete"
            );
            0
        }
        Err(e) => {
            error!(reason = %e, "update_fit failed");
            2
        }
    }
}

async fn sync_command(settings: &Settings) -> i32 {
    let alias_name = settings.market_db_alias();
    let alias = match settings.alias(alias_name) {
        Ok(a) => a,
        Err(e) => {
            error!(reason = %e, "config error");
            return 1;
        }
    };
    let store = match ReplicatedStore::open(alias_name.as_str(), alias) {
        Ok(s) => s,
        Err(e) => {
            error!(reason = %e, "failed to open market store");
            return 2;
        }
    };
    match store.sync().await {
        Ok(()) => {
            info!("sync complete");
            0
        }
        Err(e) => {
            error!(reason = %e, "sync failed");
            2
        }
    }
}

async fn validate_command(settings: &Settings) -> i32 {
    let alias_name = settings.market_db_alias();
    let alias = match settings.alias(alias_name) {
        Ok(a) => a,
        Err(e) => {
            error!(reason = %e, "config error");
            return 1;
        }
    };
    let store = match ReplicatedStore::open(alias_name.as_str(), alias) {
        Ok(s) => s,
        Err(e) => {
            error!(reason = %e, "failed to open market store");
            return 2;
        }
    };
    match store.validate_sync().await {
        Ok(true) => {
            info!("replica validated");
            0
        }
        Ok(false) => {
            error!("replica is out of sync with remote");
            2
        }
        Err(e) => {
            error!(reason = %e, "validate_sync failed");
            2
        }
    }
}
