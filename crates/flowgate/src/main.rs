use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flowgate::config::{self, OrchestratorConfig};
use flowgate::fingerprint::{ASYNC_REQUEST_PARAM, NTRIES_PARAM, Params, fingerprint};
use flowgate::result::Outcome;
use flowgate::retry::CancelToken;
use flowgate::{Error, Orchestrator, Result};
use serde_json::Value;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Orchestrator config TOML (supports imports/extends)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate a target and print the result as JSON
    Eval {
        /// Backend hint: localfile, host, or a template name such as odahub
        hint: String,
        target: String,
        /// Positional route args (notebook dir for localfile, base URL for host)
        args: Vec<String>,
        /// Parameter as key=value; values that parse as JSON keep their type
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
        /// Run through the async job path
        #[arg(long = "async")]
        async_request: bool,
        /// Override the remote/async poll budget
        #[arg(long)]
        ntries: Option<u32>,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Decode the named output file instead of printing the result
        #[arg(long, requires = "out")]
        output_file: Option<String>,
        /// Where to write the decoded output file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print where a target would be routed
    Route {
        hint: String,
        target: String,
        args: Vec<String>,
    },
    /// Print the cache/dedup key of a request
    Fingerprint {
        target: String,
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
    },
    /// Result cache administration
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Remove every cached result
    Clear,
    /// Print the number of cached results
    Len,
}

fn main() -> Result<()> {
    let args = Args::parse();
    dotenv::dotenv().ok();
    init_logging(args.log_json);

    let cfg = load_config(args.config.as_deref())?;
    match args.cmd {
        Command::Eval {
            hint,
            target,
            args,
            params,
            async_request,
            ntries,
            timeout,
            output_file,
            out,
        } => {
            let mut params = parse_params(&params)?;
            if async_request {
                params.insert(ASYNC_REQUEST_PARAM.into(), Value::Bool(true));
            }
            if let Some(n) = ntries {
                params.insert(NTRIES_PARAM.into(), Value::from(n));
            }
            let cancel = match timeout {
                Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
                None => CancelToken::new(),
            };
            let orch = Orchestrator::new(cfg)?;
            let result = orch.evaluate_with(&hint, &target, &args, &params, &cancel);
            orch.shutdown();
            let result = result?;

            if let (Some(name), Some(out)) = (output_file, out) {
                let bytes = result.output_file(&name)?;
                std::fs::write(&out, &bytes)
                    .map_err(|e| Error::io(format!("failed to write {}: {e}", out.display())))?;
                eprintln!("wrote {} bytes to {}", bytes.len(), out.display());
                return Ok(());
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
            if let Outcome::PartialFailure(_, exceptions) = result.outcome() {
                eprintln!("{} exception(s) raised by {target}", exceptions.len());
            }
            Ok(())
        }
        Command::Route { hint, target, args } => {
            let orch = Orchestrator::new(cfg)?;
            let route = orch.resolve(&hint, &target, &args)?;
            println!("backend:     {}", route.backend);
            println!("destination: {}", route.destination);
            if let Some(url) = route.endpoint_url(&orch.config().router.api_path, &target) {
                println!("url:         {url}");
            }
            if let Some(nb) = route.notebook_path(&target) {
                println!("notebook:    {}", nb.display());
            }
            if !route.args.is_empty() {
                println!("args:        {}", route.args.join(" "));
            }
            orch.shutdown();
            Ok(())
        }
        Command::Fingerprint { target, params } => {
            println!("{}", fingerprint(&target, &parse_params(&params)?)?);
            Ok(())
        }
        Command::Cache { action } => {
            let cache = flowgate::cache::ResultCache::new(true, cfg.cache_dir());
            match action {
                CacheCommand::Clear => println!("removed {} entries", cache.clear()?),
                CacheCommand::Len => println!("{}", cache.len()?),
            }
            Ok(())
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let mut cfg = match path {
        Some(p) => OrchestratorConfig::from_doc(&config::load(p)?)?,
        None => OrchestratorConfig::default(),
    };
    cfg.router.apply_env(|k| std::env::var(k).ok());
    Ok(cfg)
}

fn parse_params(raw: &[String]) -> Result<Params> {
    let mut params = Params::new();
    for p in raw {
        let (k, v) = p
            .split_once('=')
            .ok_or_else(|| Error::config(format!("parameter '{p}' must look like key=value")))?;
        let value = serde_json::from_str::<Value>(v).unwrap_or_else(|_| Value::String(v.into()));
        params.insert(k.trim().to_string(), value);
    }
    Ok(params)
}
