//! gpusched-sim - GPU scheduler scenario runner
//!
//! Runs TOML scheduling scenarios on a virtual clock and reports their
//! expectations.
//! Usage: gpusched-sim [OPTIONS] <COMMAND> [ARGS]

use std::process::ExitCode;

use log::LevelFilter;
use nexa_gpusched::logger;
use nexa_gpusched::scenario::Scenario;
use nexa_gpusched::{SchedError, SchedResult, SchedulerConfig};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        return ExitCode::from(1);
    }

    let mut i = 1;
    let mut level = LevelFilter::Warn;
    let mut color = true;

    while i < args.len() && args[i].starts_with('-') {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return ExitCode::SUCCESS;
            }
            "-V" | "--version" => {
                println!("gpusched-sim {}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            "-v" | "--verbose" => {
                level = match level {
                    LevelFilter::Warn => LevelFilter::Info,
                    LevelFilter::Info => LevelFilter::Debug,
                    _ => LevelFilter::Trace,
                };
            }
            "-l" | "--log" => {
                i += 1;
                match args.get(i).and_then(|s| logger::parse_level_directive(&format!("log={}", s))) {
                    Some(parsed) => level = parsed,
                    None => {
                        eprintln!("Invalid log level");
                        return ExitCode::from(1);
                    }
                }
            }
            "--no-color" => color = false,
            _ => {
                eprintln!("Unknown option: {}", args[i]);
                return ExitCode::from(1);
            }
        }
        i += 1;
    }

    if i >= args.len() {
        print_usage();
        return ExitCode::from(1);
    }

    logger::init(level, color);

    let command = &args[i];
    let cmd_args: Vec<&str> = args[i + 1..].iter().map(|s| s.as_str()).collect();

    let result = match command.as_str() {
        "run" => handle_run(&cmd_args),
        "check-config" => handle_check_config(&cmd_args),
        "default-config" => SchedulerConfig::default().to_toml_string().map(|text| {
            print!("{}", text);
            true
        }),
        "help" => {
            print_usage();
            Ok(true)
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            Err(SchedError::Config(format!("Unknown command: {}", command)))
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(1)
        }
    }
}

/// Run each scenario file; false if any expectation failed
fn handle_run(args: &[&str]) -> SchedResult<bool> {
    if args.is_empty() {
        return Err(SchedError::Config("run: no scenario files given".into()));
    }
    let mut all_passed = true;
    for path in args {
        let scenario = Scenario::load(path)?;
        let report = scenario.run()?;
        print!("{}", report);
        all_passed &= report.passed();
    }
    Ok(all_passed)
}

fn handle_check_config(args: &[&str]) -> SchedResult<bool> {
    let path = args
        .first()
        .ok_or_else(|| SchedError::Config("check-config: no file given".into()))?;
    let config = SchedulerConfig::load(path)?;
    println!("{}: ok ({} engines)", path, config.engines.len());
    Ok(true)
}

fn print_usage() {
    println!("gpusched-sim - GPU scheduler scenario runner");
    println!();
    println!("USAGE:");
    println!("    gpusched-sim [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help           Show this help message");
    println!("    -V, --version        Show version information");
    println!("    -v, --verbose        Increase log verbosity (repeatable)");
    println!("    -l, --log <LEVEL>    Log level (error|warn|info|debug|trace)");
    println!("        --no-color       Plain log output");
    println!();
    println!("COMMANDS:");
    println!("    run <FILE>...        Run scenarios and check their expectations");
    println!("    check-config <FILE>  Validate a scheduler configuration");
    println!("    default-config       Print the default configuration");
    println!("    help                 Show this help message");
    println!();
    println!("EXAMPLES:");
    println!("    gpusched-sim run scenarios/promotion.toml");
    println!("    gpusched-sim -v run scenarios/*.toml");
}
