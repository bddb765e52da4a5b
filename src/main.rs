//! Gole CLI - task-local storage probe

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use gole::{
    current_id, reference_id, spawn_with_storage, FixSuggestion, LocalStorage, Reclaimer,
    Result, TaskBuilder, TaskDirectory, TlsConfig,
};

#[derive(Parser)]
#[command(name = "gole")]
#[command(about = "Gole - task-local storage for tokio tasks")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the concurrent set/get scenario, an inheritance check and a sweep
    Probe {
        /// Number of concurrent tasks
        #[arg(short, long, default_value_t = 100)]
        tasks: usize,
    },

    /// Print fast and reference ids for live tasks, then the directory dump
    Ids {
        /// Number of tasks to inspect
        #[arg(short, long, default_value_t = 4)]
        tasks: usize,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match load_config(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Probe { tasks } => probe(tasks, config).await,
            Commands::Ids { tasks } => show_ids(tasks).await.map(|_| true),
            Commands::Config => show_config(&config).map(|_| true),
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if let Some(suggestion) = e.fix_suggestion() {
                eprintln!("  {} {}", "Fix:".yellow(), suggestion);
            }
            std::process::exit(1);
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<TlsConfig> {
    let config = match path {
        Some(p) => TlsConfig::load(p)?,
        None => TlsConfig::default(),
    }
    .with_env()?;
    config.validate()?;
    Ok(config)
}

/// Returns whether every check passed
async fn probe(tasks: usize, config: TlsConfig) -> Result<bool> {
    println!(
        "{} Probing with {} tasks | policy: {}",
        "→".cyan(),
        tasks.to_string().cyan().bold(),
        config.policy.to_string().cyan()
    );

    let slots = LocalStorage::<usize>::named("probe");
    let greeting = LocalStorage::<String>::named("greeting");
    let reclaimer = Reclaimer::new(config);

    // Every task must read back exactly what it wrote.
    let handles: Vec<_> = (0..tasks)
        .map(|i| {
            let slots = slots.clone();
            gole::spawn(async move {
                slots.set(i);
                tokio::task::yield_now().await;
                slots.get() == Some(i)
            })
        })
        .collect();

    let mut matched = 0;
    for handle in handles {
        if matches!(handle.await, Ok(true)) {
            matched += 1;
        }
    }
    let isolation_ok = matched == tasks;
    report(
        isolation_ok,
        &format!("{matched}/{tasks} tasks read back their own value"),
    );

    // The child keeps its copy after the parent deletes its own.
    let parent_greeting = greeting.clone();
    let inherited = gole::spawn(async move {
        parent_greeting.set("hello".to_string());
        let child = spawn_with_storage(&[&parent_greeting], {
            let greeting = parent_greeting.clone();
            async move {
                tokio::task::yield_now().await;
                greeting.get()
            }
        });
        parent_greeting.del();
        let parent_after = parent_greeting.get();
        (parent_after, child.await.ok().flatten())
    })
    .await
    .unwrap_or((None, None));

    let inherit_ok = inherited == (None, Some("hello".to_string()));
    report(
        inherit_ok,
        &format!(
            "parent after del: {:?}, child: {:?}",
            inherited.0, inherited.1
        ),
    );

    let sweep = reclaimer.sweep();
    println!(
        "{} sweep: handles={} scanned={} removed={} pruned={}",
        "→".cyan(),
        sweep.handles,
        sweep.scanned,
        sweep.removed,
        sweep.pruned
    );
    println!(
        "  left in 'probe': {}, in 'greeting': {}",
        slots.len(),
        greeting.len()
    );

    Ok(isolation_ok && inherit_ok)
}

fn report(ok: bool, message: &str) {
    if ok {
        println!("{} {}", "✓".green(), message);
    } else {
        println!("{} {}", "✗".red(), message.red());
    }
}

async fn show_ids(tasks: usize) -> Result<()> {
    let release = CancellationToken::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel(tasks.max(1));

    let handles: Vec<_> = (0..tasks)
        .map(|i| {
            let tx = tx.clone();
            let release = release.clone();
            TaskBuilder::new()
                .name(format!("probe-{i}"))
                .spawn(async move {
                    let ids = reference_id().map(|slow| (current_id(), slow));
                    let _ = tx.send(ids).await;
                    release.cancelled().await;
                })
        })
        .collect();
    drop(tx);

    println!("{:>10} {:>10}", "fast".bold(), "reference".bold());
    while let Some(ids) = rx.recv().await {
        let (fast, slow) = ids?;
        let mark = if fast == slow { "✓".green() } else { "✗".red() };
        println!("{:>10} {:>10} {}", fast, slow, mark);
    }

    let directory: Arc<TaskDirectory> = TaskDirectory::global();
    println!("\n{}", "Directory:".cyan().bold());
    print!("{}", directory.dump());

    release.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

fn show_config(config: &TlsConfig) -> Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}
