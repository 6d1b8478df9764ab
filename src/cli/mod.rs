mod outline;
mod providers;
mod run;
mod status;
mod validate;

use anyhow::{Result, anyhow};
use console::style;
use std::path::PathBuf;

use crate::core::terminal::{self, GuideSection};
use run::RunArgs;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Agent")
        .command("run <prompt>", "Stream one prompt and show its execution log")
        .command("providers", "List the supported LLM providers")
        .print();

    GuideSection::new("Tool servers")
        .command("status", "Probe the MCP servers in mcp.json")
        .print();

    GuideSection::new("Logs")
        .command("validate <file>", "Check a serialized execution log")
        .print();

    GuideSection::new("run options")
        .text("--provider, -p <id>      Provider id or alias (default: $AI_PROVIDER, then openai)")
        .text("--model, -m <name>       Model override")
        .text("--temperature, -t <n>    Sampling temperature, 0.0 to 2.0 (default 0.2)")
        .text("--max-retries <n>        Retries when opening the stream (default 2)")
        .text("--system, -s <text>      System prompt")
        .text("--expand                 Show every step's full content")
        .print();

    GuideSection::new("status options")
        .text("--config, -c <path>      mcp.json to use (default: $MF_MCP_CONFIG, then ./mcp.json)")
        .text("--watch, -w              Keep reporting until Ctrl-C")
        .print();

    println!(
        "\n {} {} [--verbose] <command> [options] [-- prompt words]\n",
        style("Usage:").bold(),
        style("mindforge").green()
    );
}

/// Command line with the global `--verbose` flag already removed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Invocation {
    pub verbose: bool,
    pub args: Vec<String>,
}

/// Global flags are only recognised between the program name and the command, so prompt words
/// such as `-v` reach the command untouched.
pub(crate) fn split_global_flags(raw: &[String]) -> Invocation {
    let mut verbose = false;
    let mut args = Vec::with_capacity(raw.len());
    let mut in_command = false;
    for (i, arg) in raw.iter().enumerate() {
        if i > 0 && !in_command && (arg == "--verbose" || arg == "-v") {
            verbose = true;
            continue;
        }
        if i > 0 {
            in_command = true;
        }
        args.push(arg.clone());
    }
    Invocation { verbose, args }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{} needs a value", flag))
}

pub(crate) fn parse_run_args(args: &[String], start: usize) -> Result<RunArgs> {
    let mut parsed = RunArgs::default();
    let mut prompt_words: Vec<&str> = Vec::new();
    let mut i = start;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--provider" | "-p" => {
                parsed.provider = Some(flag_value(args, i, arg)?.to_string());
                i += 2;
            }
            "--model" | "-m" => {
                parsed.model = Some(flag_value(args, i, arg)?.to_string());
                i += 2;
            }
            "--temperature" | "-t" => {
                let value = flag_value(args, i, arg)?;
                parsed.temperature = Some(
                    value
                        .parse()
                        .map_err(|_| anyhow!("--temperature expects a number, got '{}'", value))?,
                );
                i += 2;
            }
            "--max-retries" => {
                let value = flag_value(args, i, arg)?;
                parsed.max_retries = Some(value.parse().map_err(|_| {
                    anyhow!("--max-retries expects a whole number, got '{}'", value)
                })?);
                i += 2;
            }
            "--system" | "-s" => {
                parsed.system = Some(flag_value(args, i, arg)?.to_string());
                i += 2;
            }
            "--expand" => {
                parsed.expand = true;
                i += 1;
            }
            "--prompt" => {
                prompt_words.push(flag_value(args, i, arg)?);
                i += 2;
            }
            "--" => {
                prompt_words.extend(args[i + 1..].iter().map(String::as_str));
                break;
            }
            _ => {
                prompt_words.push(arg);
                i += 1;
            }
        }
    }
    parsed.prompt = prompt_words.join(" ").trim().to_string();
    Ok(parsed)
}

pub(crate) fn parse_status_args(args: &[String], start: usize) -> Result<(Option<PathBuf>, bool)> {
    let mut config = None;
    let mut watch = false;
    let mut i = start;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--config" | "-c" => {
                config = Some(PathBuf::from(flag_value(args, i, arg)?));
                i += 2;
            }
            "--watch" | "-w" => {
                watch = true;
                i += 1;
            }
            other => return Err(anyhow!("Unknown status option '{}'", other)),
        }
    }
    Ok((config, watch))
}

pub async fn run_main() -> Result<()> {
    let raw: Vec<String> = std::env::args().collect();
    let invocation = split_global_flags(&raw);
    crate::logging::init(invocation.verbose);
    let args = invocation.args;

    let cmd = args.get(1).map(String::as_str).unwrap_or("help");
    match cmd {
        "run" => {
            let parsed = parse_run_args(&args, 2)?;
            if parsed.prompt.is_empty() {
                print_help();
                return Err(anyhow!("run needs a prompt"));
            }
            run::run_prompt(parsed).await
        }
        "status" => {
            let (config, watch) = parse_status_args(&args, 2)?;
            status::run_status(config, watch).await
        }
        "validate" => {
            let file = args
                .get(2)
                .ok_or_else(|| anyhow!("validate needs a file path"))?;
            let show_outline = args.iter().skip(3).any(|a| a == "--outline");
            validate::run_validate(&PathBuf::from(file), show_outline)
        }
        "providers" => providers::run_providers(),
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "version" | "--version" => {
            println!("mindforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => {
            print_help();
            Err(anyhow!("Unknown command '{}'", other))
        }
    }
}
