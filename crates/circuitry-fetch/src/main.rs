use std::process;

use anyhow::Context;
use circuitry::config::{parse_count, parse_seconds};
use circuitry::{CancellationToken, Engine, EngineConfig, FetchError, FetchOutcome, Transport};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, PartialEq)]
struct Args {
    urls: Vec<String>,
    config: EngineConfig,
    json: bool,
}

fn usage() {
    eprintln!("Usage: circuitry-fetch <url>... [options]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <url>...            URLs to fetch, each over its own fresh circuit");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --proxy <url>       SOCKS proxy, socks5h://host:port [default: direct]");
    eprintln!("  --attempts <n>      Attempts per URL [default: 3]");
    eprintln!("  --timeout <secs>    Per-attempt timeout [default: 5]");
    eprintln!("  --backoff <secs>    Base retry delay, doubled per attempt [default: 1]");
    eprintln!("  --outer <n>         Transport clients [default: 3]");
    eprintln!("  --inner <n>         Circuits [default: 9]");
    eprintln!("  --json              Print one JSON outcome per URL");
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let parsed = EngineConfig::from_env()
        .map_err(|e| e.to_string())
        .and_then(|config| parse_args(&args, config));
    let parsed = match parsed {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };

    init_tracing();

    match run(parsed).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

/// `RUST_LOG` wins; otherwise `CIRCUITRY_LOG` picks the level for our crates.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CIRCUITRY_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("circuitry={level},circuitry_fetch={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn flag_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args(args: &[String], mut config: EngineConfig) -> Result<Args, String> {
    let mut urls = Vec::new();
    let mut json = false;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--proxy" => {
                let proxy = flag_value(args, &mut i, flag)?;
                config.proxy = (!proxy.is_empty()).then(|| proxy.to_string());
            }
            "--attempts" => {
                let value = flag_value(args, &mut i, flag)?;
                config.fetch.max_attempts = parse_count("--attempts", value).map_err(|e| e.to_string())?;
            }
            "--timeout" => {
                let value = flag_value(args, &mut i, flag)?;
                config.fetch.attempt_timeout =
                    parse_seconds("--timeout", value).map_err(|e| e.to_string())?;
            }
            "--backoff" => {
                let value = flag_value(args, &mut i, flag)?;
                config.fetch.backoff_base = parse_seconds("--backoff", value).map_err(|e| e.to_string())?;
            }
            "--outer" => {
                let value = flag_value(args, &mut i, flag)?;
                config.outer_capacity = parse_count("--outer", value).map_err(|e| e.to_string())?;
            }
            "--inner" => {
                let value = flag_value(args, &mut i, flag)?;
                config.inner_capacity = parse_count("--inner", value).map_err(|e| e.to_string())?;
            }
            "--json" => json = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => urls.push(arg.to_string()),
        }
        i += 1;
    }

    if urls.is_empty() {
        return Err("missing required argument: <url>".to_string());
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(Args { urls, config, json })
}

/// Fetch every URL concurrently, pairing each with its result in input order.
async fn fetch_all<'a, T: Transport>(
    engine: &Engine<T>,
    urls: &'a [String],
    cancel: &CancellationToken,
) -> Vec<(&'a String, Result<String, FetchError>)> {
    let fetches = urls
        .iter()
        .map(|url| async move { (url, engine.fetch(url, cancel).await) });
    futures::future::join_all(fetches).await
}

/// Fetch every URL. Returns whether all of them succeeded.
async fn run(args: Args) -> anyhow::Result<bool> {
    let engine = Engine::from_config(args.config).context("invalid configuration")?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted - cancelling in-flight fetches");
            interrupt.cancel();
        }
    });

    let results = fetch_all(&engine, &args.urls, &cancel).await;
    engine.close();

    let mut all_ok = true;
    for (url, result) in results {
        all_ok &= result.is_ok();
        if args.json {
            let line = serde_json::json!({ "url": url, "outcome": FetchOutcome::from(result) });
            println!("{}", serde_json::to_string(&line).context("failed to encode outcome")?);
        } else {
            match result {
                Ok(body) => println!("{body}"),
                Err(e) => eprintln!("{url}: {e}"),
            }
        }
    }
    Ok(all_ok)
}
