//! Hub CLI.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use domobus::config::{CommandSpec, Config};
use domobus::http;
use domobus::hub::{BAUD_RATE, Hub};
use domobus::registry::Registry;
use domobus::stk500::{HexFile, Programmer};
use tokio_serial::SerialPortBuilderExt;

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    #[arg(short = 'L', long = "loop", help = "Run the hub loop")]
    run_loop: bool,

    #[arg(short = 'S', long, help = "Scan the net: MEM to every node")]
    scan: bool,

    #[arg(short = 'C', long, help = "Upload configuration blocks to nodes")]
    config: bool,

    #[arg(
        short = 'I',
        long,
        value_parser = clap::value_parser!(u16).range(2..255),
        help = "Assign a new id to --node"
    )]
    setid: Option<u16>,

    #[arg(short = 'X', long, help = "Execute an ad-hoc command spec (YAML)")]
    execute: Option<String>,

    #[arg(short = 'P', long, help = "Flash firmware to a node over the bus")]
    program: bool,

    #[arg(long, help = "Read hardware/bootloader identity over the bus")]
    info: bool,

    #[arg(long, help = "Firmware HEX file for --program")]
    hexfile: Option<PathBuf>,

    #[arg(long, help = "Read flash back and compare after --program")]
    verify: bool,

    #[arg(
        short = 'p',
        long,
        value_delimiter = ',',
        help = "Serial ports to use, overriding the configuration"
    )]
    ports: Option<Vec<String>>,

    #[arg(short = 'n', long, help = "Destination node id")]
    node: Option<u16>,

    #[arg(long, default_value = "hub.yaml", help = "Configuration file")]
    config_file: PathBuf,

    #[arg(long, help = "Serve the HTTP control plane")]
    serve: bool,

    #[arg(long, default_value = "9090", help = "HTTP port")]
    http_port: u16,

    #[arg(short = 'v', action = clap::ArgAction::Count, help = "Verbosity")]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("domobus")
        .quiet(false)
        .verbosity(usize::from(opt.verbose) + 2)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    // Programming and identity run against a bare port, no engine.
    if opt.program || opt.info {
        let port = opt
            .ports
            .as_ref()
            .and_then(|p| p.first().cloned())
            .context("--ports is required for --program/--info")?;
        let stream = tokio_serial::new(&port, BAUD_RATE).open_native_async()?;
        let (rd, wr) = tokio::io::split(stream);
        let mut programmer = Programmer::new(rd, wr);
        if opt.info {
            let info = programmer.info().await?;
            println!("{info}");
        } else {
            let hexfile = opt.hexfile.context("--hexfile is required for --program")?;
            let hex = HexFile::load(&hexfile)?;
            programmer.program(&hex).await?;
            if opt.verify {
                programmer.verify(&hex).await?;
            }
        }
        return Ok(());
    }

    let config = Config::load(&opt.config_file)
        .with_context(|| format!("loading {}", opt.config_file.display()))?;
    let registry = Arc::new(Registry::new(&config)?);
    let hub = Arc::new(Hub::open_filtered(
        Arc::clone(&registry),
        opt.ports.as_deref(),
    )?);

    if opt.scan {
        hub.scan()?;
    }
    if opt.config {
        hub.push_config()?;
    }
    if let Some(new_id) = opt.setid {
        let node = opt.node.context("--node is required with --setid")?;
        hub.set_id(&node.to_string(), new_id)?;
    }
    if let Some(text) = &opt.execute {
        let node = opt.node.context("--node is required with --execute")?;
        let spec = CommandSpec::parse(text)?;
        hub.send(&node.to_string(), &spec)?;
    }
    if opt.serve {
        let hub = Arc::clone(&hub);
        let port = opt.http_port;
        tokio::spawn(async move {
            if let Err(e) = http::serve(hub, port).await {
                log::error!("HTTP server failed: {e}");
            }
        });
    }

    let anything = opt.run_loop
        || opt.scan
        || opt.config
        || opt.setid.is_some()
        || opt.execute.is_some()
        || opt.serve;
    if !anything {
        anyhow::bail!("nothing to do; try --loop");
    }
    hub.run().await;
    Ok(())
}
