// MangaShelf - Offline Manga Reader Core
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::Context;
use clap::{Parser, Subcommand};
use mangashelf_core::config::EngineConfig;
use mangashelf_core::content::{ManualCleanupOptions, PageRequest, SaveProgress};
use mangashelf_core::engine::Engine;
use mangashelf_core::image_cache::CacheContext;
use mangashelf_core::settings::DownloadSettingsUpdate;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "mangashelf-cli")]
#[command(about = "MangaShelf CLI - inspect and maintain offline manga storage", long_about = None)]
struct Cli {
    /// Data directory (downloads, image cache and database live below it)
    #[arg(long, env = "MANGASHELF_ROOT")]
    root: Option<PathBuf>,

    /// Log as JSON lines instead of human-readable text
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show storage usage
    Stats,
    /// List downloaded chapters
    List {
        /// Only this manga
        #[arg(short, long)]
        manga: Option<String>,
    },
    /// Download a chapter from explicit page URLs
    Download {
        manga: String,
        chapter: String,
        /// Page image URLs in reading order
        #[arg(required = true)]
        pages: Vec<String>,
    },
    /// Delete a downloaded chapter
    Delete { manga: String, chapter: String },
    /// Remove chapters; without filters runs auto-cleanup and the quota check
    Cleanup {
        /// Chapters not read for this many days
        #[arg(long)]
        older_than_days: Option<u32>,
        /// Chapters of this manga
        #[arg(long)]
        manga: Option<String>,
        /// Evict until usage is at most this many bytes
        #[arg(long)]
        target_size: Option<u64>,
    },
    /// Show or change download settings
    Settings {
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Storage quota in MB
        #[arg(long)]
        max_storage_mb: Option<u64>,
        #[arg(long)]
        auto_cleanup: Option<bool>,
        #[arg(long)]
        auto_cleanup_days: Option<u32>,
        /// Restore defaults
        #[arg(long, conflicts_with_all = ["max_concurrent", "max_storage_mb", "auto_cleanup", "auto_cleanup_days"])]
        reset: bool,
    },
    /// Cache an image and print its local path
    Cache {
        url: String,
        /// manga, search, bookmark or download
        #[arg(short, long, default_value = "manga")]
        context: CacheContext,
        #[arg(short, long)]
        manga: Option<String>,
    },
    /// Show image cache usage
    CacheStats,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = match cli.root {
        Some(root) => EngineConfig::with_root(root),
        None => EngineConfig::from_env(),
    };
    let engine = Engine::builder(config)
        .build()
        .await
        .context("failed to open MangaShelf storage")?;
    let store = engine.store();

    match cli.command {
        Commands::Stats => {
            print_json(&store.get_detailed_storage_stats().await?)?;
        }
        Commands::List { manga } => {
            let all = store.list_all().await?;
            let mut mangas: Vec<_> = all
                .into_iter()
                .filter(|(id, _)| manga.as_ref().map_or(true, |m| m == id))
                .collect();
            mangas.sort_by(|a, b| a.0.cmp(&b.0));
            for (manga_id, _) in mangas {
                let chapters = store.get_downloaded_chapters(&manga_id).await?;
                let size = store.get_manga_download_size(&manga_id).await?;
                println!("{} ({} chapters, {:.1} MB)", manga_id, chapters.len(), size as f64 / 1_000_000.0);
                for chapter in chapters {
                    println!("  chapter {}", chapter);
                }
            }
        }
        Commands::Download { manga, chapter, pages } => {
            let pages: Vec<PageRequest> = pages
                .into_iter()
                .enumerate()
                .map(|(i, url)| PageRequest::new(i as u32 + 1, url))
                .collect();
            let on_progress = |progress: SaveProgress| {
                if let SaveProgress::PageDone { page_number, success } = progress {
                    println!("page {} {}", page_number, if success { "ok" } else { "failed" });
                }
            };
            let metadata = store
                .save_chapter_images_with_progress(&manga, &chapter, &pages, Some(&on_progress))
                .await?;
            println!(
                "saved {} of {} pages ({} bytes)",
                metadata.total_images,
                pages.len(),
                metadata.total_size
            );
        }
        Commands::Delete { manga, chapter } => {
            if store.delete_chapter(&manga, &chapter).await? {
                println!("deleted chapter {} of {}", chapter, manga);
            } else {
                println!("chapter {} of {} is not downloaded", chapter, manga);
            }
        }
        Commands::Cleanup {
            older_than_days,
            manga,
            target_size,
        } => {
            let options = ManualCleanupOptions {
                older_than_days,
                manga_id: manga,
                target_size,
            };
            let report = if options.is_empty() {
                engine.run_maintenance().await?
            } else {
                store.perform_manual_cleanup(options).await?
            };
            println!(
                "deleted {} chapters, freed {:.1} MB",
                report.deleted.len(),
                report.freed_bytes as f64 / 1_000_000.0
            );
        }
        Commands::Settings {
            max_concurrent,
            max_storage_mb,
            auto_cleanup,
            auto_cleanup_days,
            reset,
        } => {
            let settings = if reset {
                engine.reset_settings().await?
            } else {
                let update = DownloadSettingsUpdate {
                    max_concurrent_downloads: max_concurrent,
                    max_storage_size: max_storage_mb.map(|mb| mb * 1024 * 1024),
                    auto_cleanup_enabled: auto_cleanup,
                    auto_cleanup_days,
                    ..Default::default()
                };
                engine.update_settings(update).await?
            };
            print_json(&settings)?;
        }
        Commands::Cache { url, context, manga } => {
            let path = engine
                .image_cache()
                .get_cached_image_path(&url, context, manga.as_deref())
                .await;
            println!("{}", path);
        }
        Commands::CacheStats => {
            print_json(&engine.image_cache().get_cache_stats().await?)?;
        }
    }

    store.flush().await;
    engine.image_cache().flush().await;
    Ok(())
}
