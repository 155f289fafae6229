use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use sandpit_core::{build_sandbox, ArtifactRegistry, ConfigLoader, Playground, SandpitConfig};
use sandpit_server::{shutdown_signal, PlaygroundServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(
    name = "sandpit-server",
    author,
    version = "0.1.0",
    about = "Compile and run untrusted programs behind a websocket"
)]
struct Cli {
    #[clap(
        long,
        short,
        default_value = "sandpit.yaml",
        help = "Configuration file; defaults are used when it does not exist"
    )]
    config: PathBuf,

    #[clap(long, help = "Address to listen on, e.g. 0.0.0.0:8080")]
    bind_addr: Option<String>,

    #[clap(long, short, help = "Log level (error, warn, info, debug, trace)")]
    log_level: Option<String>,

    #[clap(long, help = "Directory holding compiled artifacts; wiped at startup")]
    scratch_dir: Option<PathBuf>,

    #[clap(long, help = "Compiler executable")]
    compiler: Option<String>,

    #[clap(long, help = "Maximum number of programs running at once")]
    max_concurrent_processes: Option<usize>,

    #[clap(long, help = "Wall-clock limit for a single run, in seconds")]
    run_timeout_secs: Option<u64>,

    #[clap(long, help = "Serve the editor's static files from this directory")]
    static_dir: Option<PathBuf>,

    #[clap(long, help = "Disable the syscall filter and cgroup limits")]
    no_sandbox: bool,
}

impl Cli {
    fn apply(&self, config: &mut SandpitConfig) {
        if let Some(addr) = &self.bind_addr {
            config.server.bind_addr = addr.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(dir) = &self.scratch_dir {
            config.artifacts.scratch_dir = dir.clone();
        }
        if let Some(program) = &self.compiler {
            config.compiler.program = program.clone();
        }
        if let Some(max) = self.max_concurrent_processes {
            config.execution.max_concurrent_processes = max;
        }
        if let Some(secs) = self.run_timeout_secs {
            config.execution.run_timeout_secs = secs;
        }
        if let Some(dir) = &self.static_dir {
            config.server.static_dir = Some(dir.clone());
        }
        if self.no_sandbox {
            config.sandbox.syscall_filter = false;
            config.sandbox.cgroup.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::from_file_or_default(&cli.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let level = config.logging.level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    log::info!("Starting sandpit server");
    log::debug!("Effective configuration: {:?}", config);

    let registry = ArtifactRegistry::open(&config.artifacts.scratch_dir).with_context(|| {
        format!(
            "Failed to prepare scratch directory {}",
            config.artifacts.scratch_dir.display()
        )
    })?;
    log::info!(
        "Artifacts stored in {}",
        registry.scratch_dir().display()
    );

    let playground = {
        let sandbox = build_sandbox(&config.sandbox).context("Failed to set up the sandbox")?;
        log::info!("Using {} sandbox", sandbox.name());
        Playground::new(&config, Arc::new(registry), sandbox)
    };

    let compiler = playground
        .compiler()
        .locate()
        .context("Compiler is not available")?;
    log::info!("Using compiler {}", compiler.display());

    let server_config = ServerConfig::from_section(&config.server)?;
    PlaygroundServer::with_config(Arc::new(playground), server_config)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
