use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use log::{debug, error, info, warn};
use serde::Deserialize;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, MessageId};
use tokio::sync::Mutex;

mod callback_handlers;
mod catalog;
mod download;
mod formats;
mod helpers;
mod http_api;
mod library;
mod markup;
mod message_handlers;
mod session;
mod transport;

use callback_handlers::handle_callback;
use catalog::{Catalog, HttpCatalog};
use download::{FileStorage, MAX_FILE_BYTES};
use helpers::load_config;
use library::Library;
use message_handlers::handle_message;
use session::{SessionStore, DEFAULT_PAGE_SIZE};
use transport::ChatTransport;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Deserialize)]
struct ConfigFile {
    token: String,
    catalog_url: String,
    proxy: Option<String>,
    sqlite_path: Option<PathBuf>,
    storage_dir: Option<PathBuf>,
    mini_app_url: Option<String>,
    http_addr: Option<String>,
    request_timeout_secs: Option<u64>,
    max_file_bytes: Option<u64>,
    page_size: Option<usize>,
}

#[derive(Debug, Clone)]
struct Config {
    token: String,
    catalog_url: String,
    proxy: Option<String>,
    sqlite_path: PathBuf,
    storage_dir: PathBuf,
    mini_app_url: Option<url::Url>,
    http_addr: Option<SocketAddr>,
    request_timeout_secs: u64,
    max_file_bytes: u64,
    page_size: usize,
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    config: PathBuf,
}

/// One search hit. `id` is assigned by the catalog and is stable across requests.
#[derive(Clone, Debug, PartialEq, Eq)]
struct CatalogItem {
    id: String,
    title: String,
    author: String,
}

/// A downloadable variant of an item. `path` is the discriminator used in the
/// download URL ("epub", "fb2.zip"); `label` is whatever the catalog showed.
#[derive(Clone, Debug, PartialEq, Eq)]
struct FormatOption {
    path: String,
    label: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct ItemDetails {
    id: String,
    title: String,
    author: String,
    cover_url: Option<String>,
    formats: Vec<FormatOption>,
}

struct AppState {
    config: Config,
    sessions: SessionStore,
    catalog: Arc<dyn Catalog>,
    library: Library,
    storage: FileStorage,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = load_config(&args.config)?;

    let catalog = HttpCatalog::new(
        &config.catalog_url,
        config.proxy.as_deref(),
        Duration::from_secs(config.request_timeout_secs),
    )?;
    let library = Library::open(&config.sqlite_path).await?;
    info!("sqlite: {}", config.sqlite_path.display());
    info!("storage: {}", config.storage_dir.display());

    let state = AppState {
        config: config.clone(),
        sessions: SessionStore::new(config.page_size),
        catalog: Arc::new(catalog),
        library,
        storage: FileStorage::new(config.storage_dir.clone(), config.max_file_bytes),
    };
    let state = Arc::new(state);

    if let Some(addr) = config.http_addr {
        let api_state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = http_api::serve(addr, api_state).await {
                error!("http api stopped: {:#}", err);
            }
        });
    }

    let bot = Bot::new(config.token.clone());

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    info!("bot started, catalog at {}", config.catalog_url);
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
