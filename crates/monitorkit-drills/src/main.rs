use std::process;

use anyhow::Context;
use monitorkit_drills::logging::init_tracing;
use monitorkit_drills::{Drill, DrillConfig, Knob};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    init_tracing();

    let mut config = match DrillConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    let drill = match parse_args(&args, &mut config) {
        Ok(drill) => drill,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: monitorkit-drills <drill> [--threads N] [--stagger-ms MS] [--service-ms MS]"
            );
            eprintln!();
            eprintln!("Drills:");
            eprintln!("  {}", Drill::names());
            eprintln!();
            eprintln!("Options (defaults come from the matching environment variable):");
            for knob in Knob::ALL {
                eprintln!("  {:<14} {}", knob.flag(), knob.env_var());
            }
            process::exit(2);
        }
    };

    if let Err(e) = run(drill, &config) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String], config: &mut DrillConfig) -> Result<Drill, String> {
    let mut drill: Option<Drill> = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => return Err(String::new()),
            flag if flag.starts_with('-') => {
                let knob = Knob::from_flag(flag).ok_or(format!("unknown flag: {flag}"))?;
                i += 1;
                let raw = args.get(i).ok_or(format!("{flag} requires a value"))?;
                config.set(knob, raw).map_err(|e| e.to_string())?;
            }
            arg => {
                if drill.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                drill = Some(arg.parse::<Drill>().map_err(|e| e.to_string())?);
            }
        }
        i += 1;
    }

    drill.ok_or_else(|| "missing required argument: <drill>".to_string())
}

fn run(drill: Drill, config: &DrillConfig) -> anyhow::Result<()> {
    let report = monitorkit_drills::run(drill, config)
        .with_context(|| format!("drill '{}' failed", drill.name()))?;

    let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
    println!("{json}");

    Ok(())
}
