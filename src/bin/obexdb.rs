use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ObexDB::free::FreeList;
use ObexDB::lock::acquire_shared_lock;
use ObexDB::meta::read_meta;
use ObexDB::metrics;
use ObexDB::pager::Pager;
use ObexDB::schema::SchemaCatalog;
use ObexDB::store::{collect_tree_pages, read_catalog_chain, Store};

/// Минимальный CLI для ObexDB (инициализация и диагностика стора)
#[derive(Parser, Debug)]
#[command(name = "obexdb", version, about = "ObexDB CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Initialize a new store (meta v1 + empty free list + schema catalog)
    Init {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = 65536)]
        page_size: u32,
    },
    /// Print store status (meta, catalog, counters)
    Status {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Verify every reachable page (catalog chain, index trees, data pages)
    Check {
        #[arg(long)]
        path: PathBuf,
    },
    /// List declared classes and their schema versions
    Schemas {
        #[arg(long)]
        path: PathBuf,
    },
    /// Print process metrics snapshot
    Metrics,
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Init { path, page_size } => {
            Store::init(&path, page_size)
                .with_context(|| format!("init store at {}", path.display()))?;
            println!("initialized store at {} (page_size={})", path.display(), page_size);
            Ok(())
        }

        Cmd::Status { path, json } => {
            // Статус без захвата LOCK: meta и каталог читаются напрямую,
            // поэтому команда работает и рядом с живым writer-процессом.
            let m = read_meta(&path)?;
            let pager = Pager::open(&path)?;
            let catalog = read_catalog_chain(&pager, m.root_page)?;
            let free_pages = FreeList::open_or_create(&path)?.count()?;

            if json {
                let obj = serde_json::json!({
                    "page_size": m.page_size,
                    "committed_version": m.committed_version,
                    "next_page_id": m.next_page_id,
                    "next_oid": m.next_oid,
                    "clean_shutdown": m.clean_shutdown,
                    "index_count": catalog.indexes.len(),
                    "data_pages_live": catalog.data_live.len(),
                    "free_pages": free_pages,
                });
                println!("{}", serde_json::to_string_pretty(&obj)?);
            } else {
                println!("page_size:         {}", m.page_size);
                println!("committed_version: {}", m.committed_version);
                println!("next_page_id:      {}", m.next_page_id);
                println!("next_oid:          {}", m.next_oid);
                println!("clean_shutdown:    {}", m.clean_shutdown);
                println!("indexes:           {}", catalog.indexes.len());
                for d in &catalog.indexes {
                    println!(
                        "  {} ({}, root={}, epoch={})",
                        d.name,
                        if d.unique { "unique" } else { "non-unique" },
                        d.root,
                        d.epoch
                    );
                }
                println!("data_pages_live:   {}", catalog.data_live.len());
                println!("free_pages:        {}", free_pages);
            }
            Ok(())
        }

        Cmd::Check { path } => {
            // Shared-лок: публикация и реклаймация не идут параллельно
            // проверке; живой writer удерживает ход команды до коммита.
            let _lock =
                acquire_shared_lock(&path).with_context(|| "acquire shared lock".to_string())?;
            let m = read_meta(&path)?;
            let pager = Pager::open(&path)?;
            let catalog = read_catalog_chain(&pager, m.root_page)?;

            let mut pages = collect_tree_pages(&pager, catalog.primary_root)?;
            for d in &catalog.indexes {
                pages.extend(collect_tree_pages(&pager, d.root)?);
            }
            pages.extend(catalog.data_live.keys().copied());

            let mut buf = vec![0u8; pager.page_size()];
            let mut bad = 0usize;
            for pid in &pages {
                if let Err(e) = pager.read_page(*pid, &mut buf) {
                    eprintln!("page {}: {}", pid, e);
                    bad += 1;
                }
            }
            SchemaCatalog::load(&path).with_context(|| "load schema catalog".to_string())?;

            if bad != 0 {
                anyhow::bail!(
                    "{} of {} reachable pages failed verification",
                    bad,
                    pages.len()
                );
            }
            println!(
                "ok: version {}, {} reachable pages verified, {} index(es), {} free entries",
                m.committed_version,
                pages.len(),
                catalog.indexes.len(),
                FreeList::open_or_create(&path)?.count()?
            );
            Ok(())
        }

        Cmd::Schemas { path } => {
            let cat = SchemaCatalog::load(&path)?;
            for c in cat.classes.values() {
                println!(
                    "{} (id={}, parent={}, versions={})",
                    c.name,
                    c.class_id,
                    c.parent.as_deref().unwrap_or("-"),
                    c.versions.len()
                );
                for (v, sv) in c.versions.iter().enumerate() {
                    let fields: Vec<String> = sv
                        .fields
                        .iter()
                        .map(|f| format!("{}:{:?}", f.name, f.kind))
                        .collect();
                    println!("  v{}: [{}]", v, fields.join(", "));
                }
            }
            Ok(())
        }

        Cmd::Metrics => {
            let s = metrics::snapshot();
            println!("{:#?}", s);
            Ok(())
        }
    }
}
