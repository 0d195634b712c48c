#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use cadev_harness::{recovery_scenario, writeback_scenario, Rig};
use std::env;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "writeback" => {
            let report = writeback_scenario()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        "recovery" => {
            let report = recovery_scenario()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        "dump" => {
            // A fresh rig with a started cache, to show the dump surfaces.
            let rig = Rig::new();
            rig.mem_bdev("cache-dev", 512, 8192)?;
            rig.mem_bdev("core-dev", 512, 8192)?;
            rig.start_cache("cache1", Some("cache-dev"), Some("wb"))?;
            rig.add_core("core1", "cache1", "core-dev")?;
            let out = serde_json::json!({
                "bdevs": rig.module.get_bdevs(None),
                "config": rig.module.config_dump(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("cadev-cli\n");
    println!("USAGE:");
    println!("  cadev-cli writeback    run the write-back I/O scenario, print the report");
    println!("  cadev-cli recovery     run the stop/load/rejoin scenario, print the report");
    println!("  cadev-cli dump         print device and configuration dumps of a demo setup");
}
