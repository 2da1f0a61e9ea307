//! CLI entry point for the `scoped` daemon.
//!
//! Two subcommands:
//! - `daemon`: build the component tree from the configured document and
//!   serve it over TCP until ctrl-c, then tear everything down in order.
//! - `check`: validate a microscope configuration and print the resolved
//!   tree without starting the server (exits non-zero on errors).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_scope::component::Component;
use rust_scope::config::Settings;
use rust_scope::remote::AttributeServer;
use rust_scope::sim::register_sim_classes;
use rust_scope::tree::{ComponentRegistry, ComponentTree, MicroscopeConfig, TreeBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scoped")]
#[command(about = "Reactive microscope control daemon", version)]
struct Cli {
    /// Path to the daemon settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the microscope tree over TCP until ctrl-c
    Daemon,

    /// Validate a microscope configuration and print the resolved tree
    Check {
        /// Tree document to validate (defaults to the one in settings)
        #[arg(long)]
        tree: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings =
        Settings::load(cli.config.as_deref()).context("failed to load daemon settings")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Daemon => daemon(settings).await,
        Commands::Check { tree } => check(settings, tree).await,
    }
}

async fn build_tree(path: &Path) -> Result<ComponentTree> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read tree document {}", path.display()))?;
    let config = MicroscopeConfig::from_toml_str(&text)?;

    let mut registry = ComponentRegistry::new();
    register_sim_classes(&mut registry);
    Ok(TreeBuilder::new(&registry).build(&config)?)
}

async fn daemon(settings: Settings) -> Result<()> {
    let tree = Arc::new(build_tree(Path::new(&settings.microscope.tree)).await?);

    let server = AttributeServer::new(tree.clone()).with_read_timeout(settings.read_timeout());
    let handle = server.serve(settings.bind_addr()?).await?;
    info!(addr = %handle.local_addr(), "scoped daemon running, ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    handle.shutdown().await;
    for (component, error) in tree.shutdown() {
        warn!(%component, %error, "component shutdown failed");
    }
    Ok(())
}

async fn check(settings: Settings, tree_path: Option<PathBuf>) -> Result<()> {
    let path = tree_path.unwrap_or_else(|| PathBuf::from(&settings.microscope.tree));
    let tree = build_tree(&path).await?;

    println!("{}: {} components", path.display(), tree.components().len());
    print_node(tree.root(), 0);

    for (component, error) in tree.shutdown() {
        warn!(%component, %error, "component shutdown failed");
    }
    Ok(())
}

fn print_node(component: &Arc<dyn Component>, depth: usize) {
    let attributes = component.attributes().names().join(", ");
    println!(
        "{:indent$}{} (role: {}) [{}]",
        "",
        component.name(),
        component.role(),
        attributes,
        indent = depth * 2
    );
    let mut children: Vec<_> = component.children().iter().collect();
    children.sort_by(|a, b| a.0.cmp(b.0));
    for (_, child) in children {
        print_node(child, depth + 1);
    }
}
