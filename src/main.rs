use anyhow::{anyhow, bail, Context};
use cellwatch::{BleAdapter, BmsMonitor, MonitorConfig, MonitorEvent, PackSnapshot, TcpAdapter};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const USAGE: &str =
    "usage: cellwatch [--config FILE] [--clear-faults] <tcp://HOST:PORT | ble://NAME | scan>";

struct Args {
    config: Option<String>,
    clear_faults: bool,
    target: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config = None;
    let mut clear_faults = false;
    let mut target = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config = Some(args.next().ok_or_else(|| anyhow!("--config needs a path"))?)
            }
            "--clear-faults" => clear_faults = true,
            _ if target.is_none() => target = Some(arg),
            _ => bail!("{USAGE}"),
        }
    }

    Ok(Args {
        config,
        clear_faults,
        target: target.ok_or_else(|| anyhow!("{USAGE}"))?,
    })
}

fn print_snapshot(snapshot: &PackSnapshot) {
    let Some(stats) = &snapshot.stats else { return };
    println!(
        "[{}] {} modules  min {:.3} V  max {:.3} V  spread {:.3} V",
        stats.last_update,
        snapshot.modules.len(),
        stats.min_voltage,
        stats.max_voltage,
        stats.voltage_diff,
    );
    for module in &snapshot.modules {
        let cells: Vec<String> = module
            .cells
            .iter()
            .map(|c| match c.voltage {
                Some(v) => format!("{v:.3}"),
                None if c.is_critical => "FAULT".into(),
                None => "  -  ".into(),
            })
            .collect();
        println!("  module {:>2}: {}", module.id, cells.join("  "));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = parse_args()?;

    if args.target == "scan" {
        let adapter = BleAdapter::new().await?;
        println!("scanning for 10s...");
        for name in adapter.scan_peers(Duration::from_secs(10)).await? {
            println!("  {name}");
        }
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => MonitorConfig::load(path)?,
        None => MonitorConfig::load("cellwatch.toml")?,
    };

    let mut monitor = BmsMonitor::new(config);
    let mut snapshots = monitor.subscribe_snapshots();
    let mut events = monitor.subscribe_events();

    if let Some(address) = args.target.strip_prefix("tcp://") {
        monitor
            .connect(&TcpAdapter, address)
            .await
            .with_context(|| format!("connecting to {address}"))?;
    } else if let Some(name) = args.target.strip_prefix("ble://") {
        let adapter = BleAdapter::new().await?;
        monitor
            .connect(&adapter, name)
            .await
            .with_context(|| format!("connecting to {name}"))?;
    } else {
        bail!("{USAGE}");
    }

    if args.clear_faults {
        match monitor.clear_faults().await {
            Ok(response) => println!("stored faults cleared ({response})"),
            // Not fatal: keep monitoring and let the user retry.
            Err(e) => eprintln!("fault clear failed: {e}"),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                print_snapshot(&snapshot);
            }
            event = events.recv() => match event {
                Ok(MonitorEvent::StateChanged(state)) => println!("-- {state}"),
                Ok(MonitorEvent::Fault(text)) => eprintln!("-- fault: {text}"),
                Err(_) => {}
            },
        }
    }

    monitor.disconnect().await;
    Ok(())
}
