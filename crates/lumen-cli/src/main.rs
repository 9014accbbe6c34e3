//! lumen: stream one or more prompts through the request manager.
//!
//! Prompts run concurrently against the built-in loopback engine. Text goes to
//! stdout, logs go to stderr.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::Result;
use clap::Parser;
use futures::{stream::select_all, StreamExt};
use itertools::Itertools;
use lumen_core::{FinishReason, PartialResult, RequestId, RequestManager, SamplingParams};
use lumen_host::{launch, load_config, logging, Config};

/// Stream prompts through the lumen request manager.
#[derive(Parser, Debug)]
#[command(name = "lumen")]
#[command(about = "Stream prompts through the lumen request manager")]
#[command(version)]
struct Args {
    /// TOML config file; built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Prompt to run; repeat to run several concurrently
    #[arg(short, long = "prompt", required = true)]
    prompts: Vec<String>,

    /// Override the configured top-k
    #[arg(long)]
    top_k: Option<usize>,

    /// Override the configured temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Override the configured seed
    #[arg(long)]
    seed: Option<u64>,

    /// Seconds to wait for all prompts before cancelling what is left
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Cancel every request this many milliseconds after it starts
    #[arg(long)]
    cancel_after: Option<u64>,

    /// Print every partial result as a JSON line instead of plain text
    #[arg(long)]
    json: bool,
}

impl Args {
    fn sampling(&self, defaults: &SamplingParams) -> SamplingParams {
        SamplingParams {
            top_k: self.top_k.unwrap_or(defaults.top_k),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            seed: self.seed.or(defaults.seed),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path).await?,
        None => Config::default(),
    };
    logging::init(&config.log)?;
    logging::lifecycle::startup("lumen", env!("CARGO_PKG_VERSION"));

    let (_engine, manager) = launch(&config).await?;
    let params = args.sampling(&config.sampling);

    let mut streams = Vec::with_capacity(args.prompts.len());
    let mut order = HashMap::new();
    for (index, prompt) in args.prompts.iter().enumerate() {
        let subscription = manager.subscribe();
        let id = manager.start_request(prompt, &params);
        order.insert(id, index);
        streams.push(Box::pin(subscription.into_request_stream(id)));
        if let Some(delay) = args.cancel_after {
            schedule_cancel(&manager, id, Duration::from_millis(delay));
        }
    }

    let mut printer = Printer::new(args.json, order);
    let mut events = select_all(streams);
    let print = async {
        while let Some(event) = events.next().await {
            printer.print(&event)?;
        }
        anyhow::Ok(())
    };
    match tokio::time::timeout(Duration::from_secs(args.timeout), print).await {
        Ok(printed) => printed?,
        Err(_) => tracing::warn!(
            event = "prompts_timed_out",
            timeout_s = args.timeout,
            "Timed out waiting for prompts"
        ),
    }

    let cancelled = manager.cancel_all();
    logging::lifecycle::shutdown(cancelled);
    manager.shutdown().await?;
    printer.finish();
    Ok(())
}

fn schedule_cancel(manager: &RequestManager, id: RequestId, delay: Duration) {
    let manager = manager.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if manager.is_running(&id) {
            manager.cancel_request(&id);
        }
    });
}

/// Writes results to stdout.
///
/// Plain mode prints each request's text once it ends, labelled when more than
/// one prompt runs. JSON mode prints every partial result as it arrives.
struct Printer {
    json: bool,
    order: HashMap<RequestId, usize>,
    texts: HashMap<RequestId, String>,
}

impl Printer {
    fn new(json: bool, order: HashMap<RequestId, usize>) -> Self {
        Self {
            json,
            order,
            texts: HashMap::new(),
        }
    }

    fn print(&mut self, event: &PartialResult) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(event)?);
            return Ok(());
        }

        let text = self.texts.entry(event.request_id).or_default();
        text.push_str(&event.text);
        if !event.done {
            return Ok(());
        }

        let text = self.texts.remove(&event.request_id).unwrap_or_default();
        match (self.order.len(), self.order.get(&event.request_id)) {
            (1, _) | (_, None) => println!("{text}"),
            (_, Some(index)) => println!("[{index}] {text}"),
        }
        if event.reason != FinishReason::Stop {
            eprintln!("(finished: {})", event.reason.as_str());
        }
        Ok(())
    }

    fn finish(self) {
        // requests still open were cut off by the timeout
        for (index, text) in self.unfinished() {
            match index {
                Some(index) if self.order.len() > 1 => println!("[{index}] {text}"),
                _ => println!("{text}"),
            }
            eprintln!("(finished: timed_out)");
        }
    }

    /// Text of requests without a terminal event, in prompt order.
    fn unfinished(&self) -> Vec<(Option<usize>, &str)> {
        self.texts
            .iter()
            .map(|(id, text)| (self.order.get(id).copied(), text.as_str()))
            .sorted_by_key(|(index, _)| *index)
            .collect()
    }
}
