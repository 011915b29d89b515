// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 The Vesper Project Developers

//! Vesper - a class-based scripting language, written in Rust
//!
//! This is the main entry point for the vesper CLI/REPL.
//!
//! ## Features
//!
//! - Interactive REPL with syntax highlighting and history
//! - Script-file execution
//! - Inline expression evaluation with `-e`

mod repl;

use owo_colors::OwoColorize;
use std::env;
use std::path::Path;
use std::process::ExitCode;
use vesper_engine::Engine;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    match args.len() {
        // No arguments - start REPL
        1 => run_repl(),

        // File argument or flags
        _ => {
            let arg = &args[1];

            match arg.as_str() {
                "-h" | "--help" => {
                    print_help();
                    ExitCode::SUCCESS
                }
                "-v" | "--version" => {
                    print_version();
                    ExitCode::SUCCESS
                }
                "-e" | "--eval" => {
                    if args.len() < 3 {
                        eprintln!(
                            "{}: {} requires an argument",
                            "Error".red().bold(),
                            arg.cyan()
                        );
                        ExitCode::FAILURE
                    } else {
                        run_eval(&args[2])
                    }
                }
                _ if arg.starts_with('-') => {
                    eprintln!("{}: unknown option '{}'", "Error".red().bold(), arg.cyan());
                    eprintln!("Use {} for usage information", "--help".cyan());
                    ExitCode::FAILURE
                }
                _ => run_file(arg),
            }
        }
    }
}

/// Start the interactive REPL
fn run_repl() -> ExitCode {
    match repl::Repl::new() {
        Ok(mut repl) => {
            if let Err(e) = repl.run() {
                eprintln!("{}: {:?}", "REPL Error".red().bold(), e);
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!(
                "{}: Failed to initialize REPL: {:?}",
                "Error".red().bold(),
                e
            );
            ExitCode::FAILURE
        }
    }
}

/// Execute a Vesper script file.
fn run_file(path: &str) -> ExitCode {
    let path = Path::new(path);

    if !path.exists() {
        eprintln!(
            "{}: file not found '{}'",
            "Error".red().bold(),
            path.display().cyan()
        );
        return ExitCode::FAILURE;
    }

    let mut engine = Engine::new();

    match engine.eval_file(path) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Evaluate Vesper code from the command line.
fn run_eval(code: &str) -> ExitCode {
    let mut engine = Engine::new();

    match engine.eval(code) {
        Ok(value) => {
            if !value.is_nil() {
                println!("{}", engine.render(&value));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    let version = env!("CARGO_PKG_VERSION");

    println!(
        "{}",
        r#"
 __     __
 \ \   / /__  ___ _ __   ___ _ __
  \ \ / / _ \/ __| '_ \ / _ \ '__|
   \ V /  __/\__ \ |_) |  __/ |
    \_/ \___||___/ .__/ \___|_|
                 |_|
"#
        .bright_magenta()
        .bold()
    );

    println!(
        "  {} v{}\n",
        "Vesper Language".white().bold(),
        version.yellow()
    );

    println!("{}", "USAGE:".white().bold());
    println!("    {} [OPTIONS] [FILE]", "vesper".green());
    println!();

    println!("{}", "OPTIONS:".white().bold());
    println!(
        "    {:20} {}",
        "-h, --help".cyan(),
        "Print this help message"
    );
    println!(
        "    {:20} {}",
        "-v, --version".cyan(),
        "Print version information"
    );
    println!(
        "    {:20} {}",
        "-e, --eval <CODE>".cyan(),
        "Evaluate Vesper code"
    );
    println!();

    println!("{}", "ARGUMENTS:".white().bold());
    println!("    {:20} {}", "[FILE]".cyan(), "Vesper file to execute");
    println!();

    println!("{}", "EXAMPLES:".white().bold());
    println!(
        "    {}                       # Start interactive REPL",
        "vesper".green()
    );
    println!(
        "    {} {}           # Execute a file",
        "vesper".green(),
        "script.vsp".dimmed()
    );
    println!(
        "    {} {} {}  # Evaluate expression",
        "vesper".green(),
        "-e".cyan(),
        "\"1 + 2;\"".dimmed()
    );
    println!();
}

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    println!("{} {}", "vesper".bright_magenta().bold(), version.yellow());
}
