//! Thin wrapper around the message generator: regenerates the typed message
//! definitions for one package, or for every package the generator can
//! discover when no package is named.

use std::process::{exit, Command};

const USAGE: &str = "usage: generate-messages [package]

Runs the message generator over the named package, or over all discovered
packages when no package is given. Exits 0 on success, 1 on failure.";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        println!("{USAGE}");
        return;
    }
    if args.len() > 1 {
        eprintln!("{USAGE}");
        exit(1);
    }

    let mut command = Command::new("rosnative-msggen");
    if let Some(package) = args.first() {
        command.arg(package);
    }
    match command.status() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            eprintln!("message generation failed: {status}");
            exit(1);
        }
        Err(err) => {
            eprintln!("failed to launch rosnative-msggen: {err}");
            exit(1);
        }
    }
}
