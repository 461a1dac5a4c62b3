//! Command-line driver for the sender.
//!
//! Sends a single request and reports it, or runs an unattended crawl from
//! a set of seeds until it finishes.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use httpsend::http::{HttpBody, HttpRequest};
use httpsend::listener::{HistoryListener, MemoryHistory};
use httpsend::pool::{PoolConfig, ProxyChain};
use httpsend::redirect::ModeRedirectionValidator;
use httpsend::scope::{Mode, Scope};
use httpsend::spider::{Spider, SpiderConfig, SpiderListener};
use httpsend::{HttpMessage, HttpSender, Initiator, Method, SenderConfig, TransportContext};
use log::LevelFilter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "httpsend", version, about = "Send HTTP requests or crawl a site")]
struct Cli {
    /// Crawl from the seeds until the crawl finishes
    #[arg(long)]
    spider: bool,

    /// Seed URL for the crawl (repeatable)
    #[arg(long = "seed", value_name = "URL", num_args = 1..)]
    seeds: Vec<String>,

    /// Send all traffic through this proxy
    #[arg(long, value_name = "HOST:PORT")]
    proxy_chain: Option<String>,

    /// Hosts reached directly even with a proxy chain (`*.suffix` allowed)
    #[arg(long = "skip-proxy", value_name = "HOST")]
    skip_proxy: Vec<String>,

    /// Operating mode; decides which redirects are followed
    #[arg(long, default_value = "standard")]
    mode: Mode,

    /// Spider worker threads
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Link depth the spider still fetches
    #[arg(long, default_value_t = 5)]
    max_depth: usize,

    /// Connect and read timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Replace the User-Agent of every request
    #[arg(long)]
    user_agent: Option<String>,

    /// Send a single request to this URL
    #[arg(long, value_name = "URL", conflicts_with = "spider")]
    request: Option<String>,

    /// Method of the single request
    #[arg(long, default_value = "GET", requires = "request")]
    method: String,

    /// Form body of the single request
    #[arg(long, requires = "request")]
    data: Option<String>,

    /// Follow redirects of the single request
    #[arg(long, requires = "request")]
    follow: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

/// Accept the single-dash forms `-spider` and `-seed` too.
fn normalize_args(args: impl Iterator<Item = String>) -> Vec<String> {
    args.map(|arg| match arg.as_str() {
        "-spider" | "-seed" => format!("-{}", arg),
        _ => arg,
    })
    .collect()
}

fn init_logger(level: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module("httpsend", level);
    builder.try_init().context("Failed to initialize logger")
}

fn parse_proxy(value: &str) -> Result<ProxyChain> {
    let (host, port) = value
        .rsplit_once(':')
        .with_context(|| format!("proxy chain must be HOST:PORT, got {:?}", value))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid proxy port {:?}", port))?;
    if host.is_empty() {
        bail!("proxy chain host is empty");
    }
    Ok(ProxyChain::new(host.trim_matches(|c| c == '[' || c == ']'), port))
}

fn sender_config(cli: &Cli) -> Result<SenderConfig> {
    let pool = PoolConfig::default().timeout(Duration::from_secs(cli.timeout));
    let mut config = SenderConfig::default().pool(pool);
    if let Some(agent) = &cli.user_agent {
        config = config.user_agent(agent.clone());
    }
    if let Some(value) = &cli.proxy_chain {
        let chain = cli
            .skip_proxy
            .iter()
            .fold(parse_proxy(value)?, |chain, host| chain.skip_host(host.clone()));
        config = config.proxy_chain(chain);
    }
    Ok(config)
}

fn send_one(ctx: &Arc<TransportContext>, cli: &Cli, uri: &str) -> Result<()> {
    let url = Url::parse(uri).with_context(|| format!("invalid URL {:?}", uri))?;
    let method: Method = cli
        .method
        .to_ascii_uppercase()
        .parse()
        .with_context(|| format!("unsupported method {:?}", cli.method))?;

    let mut request = HttpRequest::builder().method(method).uri(url.as_str()).build();
    if let Some(data) = &cli.data {
        request
            .headers_mut()
            .set("Content-Type", "application/x-www-form-urlencoded");
        request.set_body(HttpBody::from(data.as_bytes()));
        request.set_content_length(data.len());
    }
    let mut msg = HttpMessage::new(request);

    let scope = Scope::with_prefix(&format!("{}/", url.origin().ascii_serialization()));
    let validator = ModeRedirectionValidator::new(cli.mode, scope);
    let sender = HttpSender::new(Arc::clone(ctx), Initiator::ManualRequest);
    let outcome = sender
        .send_and_receive_validated(&mut msg, cli.follow, &validator)
        .with_context(|| format!("{} {} failed", method, url))?;

    if let Some(target) = &outcome.invalid_redirection {
        log::warn!("Redirect to {} not followed in {} mode", target, cli.mode);
    }
    let response = msg
        .response()
        .context("exchange completed without a response")?;
    println!("{} {}", msg.request().method(), msg.request().uri());
    println!("{} {}", response.status(), response.reason());
    println!("Elapsed:        {} ms", msg.elapsed_millis());
    println!("Content length: {} bytes", response.body().len());
    println!("Total length:   {} bytes", response.total_length());
    Ok(())
}

#[derive(Default)]
struct CrawlReport {
    found: AtomicUsize,
    skipped: AtomicUsize,
    read: AtomicUsize,
}

impl SpiderListener for CrawlReport {
    fn found_uri(&self, msg: &HttpMessage, skipped: bool) {
        if skipped {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.found.fetch_add(1, Ordering::Relaxed);
        }
        log::debug!("found {} (skipped: {})", msg.request().uri(), skipped);
    }

    fn read_uri(&self, msg: &HttpMessage) {
        self.read.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "{} {} -> {}",
            msg.request().method(),
            msg.request().uri(),
            msg.status_code().unwrap_or_default()
        );
    }
}

fn crawl(ctx: &Arc<TransportContext>, cli: &Cli) -> Result<()> {
    if cli.seeds.is_empty() {
        bail!("--spider needs at least one --seed URL");
    }
    let mut config = SpiderConfig::default()
        .threads(cli.threads)
        .max_depth(cli.max_depth);
    if cli.mode == Mode::Protect {
        let mut scope = Scope::new();
        for seed in &cli.seeds {
            let url = Url::parse(seed).with_context(|| format!("invalid seed {:?}", seed))?;
            let prefix = regex::escape(&url.origin().ascii_serialization());
            scope = scope
                .include(&format!("{}/.*", prefix))
                .context("invalid seed scope")?;
        }
        config = config.scope(scope);
    }

    let spider = Spider::new(Arc::clone(ctx), config);
    let report = Arc::new(CrawlReport::default());
    spider.add_listener(report.clone());
    for seed in &cli.seeds {
        if !spider.add_seed(&HttpMessage::get(seed.as_str())) {
            log::warn!("Seed {} ignored", seed);
        }
    }

    spider.start().context("Failed to start spider threads")?;
    while !spider.is_stop() {
        thread::sleep(Duration::from_secs(1));
    }
    spider.join();

    println!(
        "Crawl finished: {} fetched, {} found, {} out of bounds",
        report.read.load(Ordering::Relaxed),
        report.found.load(Ordering::Relaxed),
        report.skipped.load(Ordering::Relaxed)
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse_from(normalize_args(std::env::args()));
    init_logger(cli.log_level.clone().into())?;

    if !cli.spider && cli.request.is_none() {
        bail!("nothing to do: pass --request URL or --spider with --seed URLs");
    }

    let ctx = TransportContext::new(sender_config(&cli)?).context("Failed to set up TLS")?;
    let history = Arc::new(MemoryHistory::new());
    ctx.listeners()
        .add(Arc::new(HistoryListener::new(history.clone())));

    let result = match &cli.request {
        Some(uri) => send_one(&ctx, &cli, uri),
        None => crawl(&ctx, &cli),
    };
    ctx.shutdown();
    log::debug!("{} exchanges recorded", history.len());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_single_dash_forms() {
        let cli = Cli::parse_from(normalize_args(args(&[
            "httpsend",
            "-spider",
            "-seed",
            "http://a.example/",
            "http://b.example/",
            "--mode",
            "Protect",
        ])));
        assert!(cli.spider);
        assert_eq!(cli.seeds.len(), 2);
        assert_eq!(cli.mode, Mode::Protect);
    }

    #[test]
    fn test_parse_proxy() {
        let chain = parse_proxy("proxy.local:3128").unwrap();
        assert_eq!(chain.authority(), "proxy.local:3128");
        assert!(parse_proxy("proxy.local").is_err());
        assert!(parse_proxy(":8080").is_err());
    }
}
