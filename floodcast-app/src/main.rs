/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 07/05/2024
Last Modified: 19/05/2025
License: MIT
*/

/*!
FloodCast is a command-line Lagrangian particle flood simulator. It converts
rainfall over gridded terrain into surface runoff with the SCS-CN model,
transports the runoff as discrete water particles along D8 flow directions,
and writes flood depth and a derived risk index to a NetCDF container.

The following flags are recognized:

| Flag              | Description                                                            |
| ----------------- | ---------------------------------------------------------------------- |
| --config          | Path of the run configuration document (JSON); required.               |
| --restart         | Path of a checkpoint container to resume from.                         |
| --procs           | Number of ranks to run; 0 means one rank per logical processor.        |
| -h, --help        | Prints help information.                                               |
| -v                | Verbose mode; overrides the configuration's verbose flag.              |
| --version         | Prints the version information.                                        |

Exit codes: 0 on success, 1 on a fatal runtime error, 2 on an invalid
configuration, 3 when a restart is incompatible with the loaded domain.
*/

use floodcast_common::utils::get_formatted_elapsed_time;
use floodcast_engine::{run_parallel, EngineError, RunConfig};
use std::env;
use std::process;
use std::time::Instant;

fn main() {
    match run() {
        Ok(()) => {}
        Err(err) => {
            eprintln!("Error: {}", err);
            process::exit(err.exit_code());
        }
    }
}

fn run() -> Result<(), EngineError> {
    let mut config_file = String::new();
    let mut restart_file = String::new();
    let mut procs = 1usize;
    let mut force_verbose = false;
    let args: Vec<String> = env::args().collect();
    if args.len() <= 1 {
        version();
        help();
        return Ok(());
    }
    for i in 1..args.len() {
        let mut arg = args[i].replace("\"", "");
        arg = arg.replace("\'", "");
        let cmd = arg.split("="); // in case an equals sign was used
        let vec = cmd.collect::<Vec<&str>>();
        let mut keyval = false;
        if vec.len() > 1 {
            keyval = true;
        }
        let flag = vec[0].to_lowercase();
        if flag == "-h" || flag == "--help" {
            version();
            help();
            return Ok(());
        } else if flag == "--version" {
            version();
            return Ok(());
        } else if flag == "-v" || flag == "--verbose" {
            force_verbose = true;
        } else if flag == "--config" {
            config_file = if keyval {
                vec[1].to_string()
            } else if i + 1 < args.len() {
                args[i + 1].to_string()
            } else {
                String::new()
            };
        } else if flag == "--restart" {
            restart_file = if keyval {
                vec[1].to_string()
            } else if i + 1 < args.len() {
                args[i + 1].to_string()
            } else {
                String::new()
            };
        } else if flag == "--procs" {
            let value = if keyval {
                vec[1].to_string()
            } else if i + 1 < args.len() {
                args[i + 1].to_string()
            } else {
                String::new()
            };
            procs = value.parse::<usize>().map_err(|_| {
                EngineError::ConfigurationInvalid(format!("--procs expects a number, got '{}'", value))
            })?;
        }
    }

    if config_file.is_empty() {
        return Err(EngineError::ConfigurationInvalid(
            "no configuration document named; use --config <path>".to_string(),
        ));
    }
    let mut config = RunConfig::from_file(&config_file)?;
    if force_verbose {
        config.verbose = true;
    }
    if procs == 0 {
        procs = num_cpus::get();
    }
    let verbose = config.verbose;

    if verbose {
        let welcome_len = "* Welcome to FloodCast *".len();
        println!("{}", "*".repeat(welcome_len));
        println!("* Welcome to FloodCast *");
        println!("{}", "*".repeat(welcome_len));
        println!("Domain: {}", config.domain_file);
        println!("Ranks: {}", procs);
        if !restart_file.is_empty() {
            println!("Restarting from: {}", restart_file);
        }
    }

    let start = Instant::now();
    let restart = if restart_file.is_empty() {
        None
    } else {
        Some(restart_file)
    };
    let summary = run_parallel(config, procs, restart, None)?;

    if verbose {
        println!(
            "Completed {} steps; {} particles in transit.",
            summary.steps, summary.particles_remaining
        );
        println!(
            "Outflow volume: {:.3} m3; boundary loss: {:.3} m3.",
            summary.outflow, summary.boundary_loss
        );
        println!(
            "{}",
            format!("Elapsed Time: {}", get_formatted_elapsed_time(start))
        );
    }
    Ok(())
}

fn help() {
    let help = "floodcast --config <path> [--restart <checkpoint>] [--procs N] [-v]

Runs a FloodCast flood simulation described by a JSON configuration
document. The document names the domain container, the rainfall containers,
the simulation window and step, the SCS-CN and routing parameters, and the
output path.

Example:

>> floodcast --config=./run.json --procs=4 -v
";
    println!("{}", help);
}

fn version() {
    const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");
    println!(
        "floodcast v{} by the FloodCast Developers",
        VERSION.unwrap_or("Unknown version")
    );
}
