//! Word frequency counter pipeline
//!
//! Reads lines from stdin, splits into words, cleans them on four parallel
//! instances, and prints the top words once input ends.
//!
//! Usage: cargo run --example word_count --release
//!        (Then type lines of text and press Ctrl-D to finish)
//!        RUST_LOG=pipeline_engine=debug shows stage lifecycle events.

use pipeline_engine::{CancelNode, FlatMapStage, PipelineBuilder, Result as PipelineResult, Stage};
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stage that cleans and normalizes words
struct WordCleanerStage {
    min_len: usize,
}

impl Stage<String, String> for WordCleanerStage {
    fn process(&mut self, word: String) -> PipelineResult<Vec<String>> {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();

        if cleaned.len() >= self.min_len {
            Ok(vec![cleaned])
        } else {
            Ok(vec![])
        }
    }

    fn name(&self) -> &str {
        "word_cleaner"
    }
}

fn top_n(counts: &HashMap<String, usize>, n: usize) -> Vec<(&str, usize)> {
    let mut items: Vec<_> = counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    items.truncate(n);
    items
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "word_count=info,pipeline_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    println!("Word Frequency Counter Pipeline");
    println!("================================");
    println!("Enter lines of text (Ctrl-D to finish):");
    println!();

    let root = CancelNode::new();
    let pipeline = PipelineBuilder::new(128, &root)?
        .stage("reader", 1, |_| {
            FlatMapStage::new("split", |line: String| -> PipelineResult<Vec<String>> {
                Ok(line.split_whitespace().map(str::to_string).collect())
            })
        })?
        .stage("cleaner", 4, |_| WordCleanerStage { min_len: 3 })?
        .build()?;

    // Count on a separate thread so the stages never stall on a full output
    let output = pipeline.output();
    let counter = std::thread::spawn(move || {
        let node = CancelNode::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for word in output.iter(&node) {
            *counts.entry(word).or_insert(0) += 1;
        }
        counts
    });

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        pipeline.send(line?)?;
    }

    let report = pipeline.shutdown(Duration::from_secs(5));
    let counts = counter.join().map_err(|_| "counter thread panicked")?;

    println!("\n=== Top 10 Words ===");
    for (i, (word, count)) in top_n(&counts, 10).iter().enumerate() {
        println!("{:2}. {} ({})", i + 1, word, count);
    }
    println!();
    for (name, snapshot) in &report.stats.stages {
        println!("{}: {}", name, snapshot.format());
    }
    println!("Shutdown: {:?} in {:?}", report.outcome, report.elapsed);

    Ok(())
}
