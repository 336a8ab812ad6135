// src/bin/bakeplan.rs

//! Command-line entry point: loads definition files, resolves the request and prints JSON.

use anyhow::{Context, Result};
use bakeplan::{
    Document, EntitlementConf,
    cli::Cli,
    core::{loader, resolver},
};
use clap::Parser;
use colored::*;

/// The main entry point of the `bakeplan` application.
/// It sets up logging, parses arguments, runs the resolution and performs centralized error
/// handling.
fn main() {
    env_logger::init();

    if let Err(e) = run_cli(Cli::parse()) {
        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);

    let files = loader::read_local_files(&cli.files)?;
    let raw = loader::parse_files(&files)?;
    let document = Document::from_raw(&raw, &cli.defaults())
        .context("Failed to evaluate the build definition")?;

    if cli.list {
        print_list(&document);
        return Ok(());
    }

    let mut ent = EntitlementConf::default();
    let resolution =
        resolver::read_targets(&document, &cli.requests(), &cli.override_values(), &mut ent)
            .with_context(|| format!("Failed to resolve {}", cli.requests().join(", ")))?;

    let json = serde_json::to_string_pretty(&resolution)
        .context("Failed to serialize the resolved targets")?;
    println!("{}", json);

    print_entitlements(&ent.deduplicated());
    Ok(())
}

fn print_list(document: &Document) {
    for group in document.groups() {
        let members = group.targets.join(", ");
        println!("{} {} {}", "group".cyan(), group.name.bold(), members.dimmed());
    }
    for target in document.targets() {
        match &target.description {
            Some(desc) => println!("{} {} {}", "target".green(), target.name.bold(), desc.dimmed()),
            None => println!("{} {}", "target".green(), target.name.bold()),
        }
    }
}

/// Privileges go to stderr so the JSON on stdout stays machine readable.
fn print_entitlements(ent: &EntitlementConf) {
    if ent.is_empty() {
        return;
    }
    eprintln!("{}", "The resolved build requires:".yellow().bold());
    if ent.network_host {
        eprintln!("  - network.host");
    }
    if ent.security_insecure {
        eprintln!("  - security.insecure");
    }
    for path in &ent.fs_read {
        eprintln!("  - fs.read={}", path);
    }
    for path in &ent.fs_write {
        eprintln!("  - fs.write={}", path);
    }
}
