//! Analyze images with a local or already running server.
//!
//! ```text
//! cargo run --example analyze -- --project /data/project part1.png part2.png
//! cargo run --example analyze -- --attach --port 8000 --random 5
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use vision_sdk::{AnalyzeOptions, Instance, InstanceConfig, ResponseType};

#[derive(Parser, Debug)]
#[command(name = "analyze")]
#[command(about = "Send images to an analysis server")]
struct Args {
    /// Project directory for a locally started server
    #[arg(long)]
    project: Option<PathBuf>,

    /// Server installation directory (searched for when omitted)
    #[arg(long)]
    dist: Option<PathBuf>,

    /// Attach to a running server instead of starting one
    #[arg(long)]
    attach: bool,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long)]
    port: Option<u16>,

    /// context, image, annotated_image or heatmap
    #[arg(short, long, default_value = "context")]
    response_type: String,

    /// Send this many random images instead of files
    #[arg(long, default_value = "0")]
    random: u32,

    /// Write returned images next to the inputs
    #[arg(long)]
    save_images: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    images: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let response_type: ResponseType = args.response_type.parse()?;

    let config = if args.attach {
        let Some(port) = args.port else {
            bail!("--attach needs --port");
        };
        InstanceConfig::attach(&args.host, port).with_ping(true)
    } else {
        let Some(project) = &args.project else {
            bail!("either --project or --attach is required");
        };
        let mut config = InstanceConfig::local(project).with_host(&args.host);
        if let Some(port) = args.port {
            config = config.with_port(port);
        }
        if let Some(dist) = &args.dist {
            config = config.with_dist_path(dist);
        }
        config
    };

    let mut instance = Instance::new(config).await?;
    info!("Connected to {}", instance.base_url());

    for n in 0..args.random {
        let started = Instant::now();
        let result = instance.send_random(response_type).await?;
        info!(
            "random #{}: {:?} in {:?}",
            n + 1,
            result.get("result"),
            started.elapsed()
        );
    }

    for path in &args.images {
        let started = Instant::now();
        let options = AnalyzeOptions::new(response_type)
            .with_data(path.to_string_lossy().into_owned());
        let result = instance.analyze(path.as_path(), options).await?;
        info!(
            "{}: {:?} in {:?}",
            path.display(),
            result.get("result"),
            started.elapsed()
        );

        if let (true, Some(image)) = (args.save_images, result.image_bytes()) {
            let out = path.with_extension(format!("{}.png", response_type));
            tokio::fs::write(&out, image).await?;
            info!("Saved {}", out.display());
        }
    }

    instance.stop().await?;
    Ok(())
}
