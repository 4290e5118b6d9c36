// src/main.rs

use anyhow::{bail, Result};
use mediaq::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediaq=info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else {
        bail!("usage: mediaq <url> [destination_dir] [temp_dir]");
    };
    let destination_dir = PathBuf::from(args.next().unwrap_or_else(|| ".".to_string()));
    let temp_dir = args.next().map(PathBuf::from).unwrap_or_else(std::env::temp_dir);

    let manager = Arc::new(DownloadManager::new(Arc::new(HttpEngine::new()), 3));
    let mut events = manager.subscribe();
    let scheduler = tokio::spawn(manager.clone().run());

    let job = manager.submit(
        url,
        JobConfig {
            destination_dir,
            temp_dir,
            ..Default::default()
        },
    );

    let outcome = loop {
        match events.recv().await {
            Event::Title { title, .. } => println!("Title: {title}"),
            Event::Status { text, .. } => println!("Status: {text}"),
            Event::Progress {
                fraction: Some(f), ..
            } => println!("Progress: {:.1}%", f * 100.0),
            Event::Progress { fraction: None, .. } => println!("Progress: size unknown"),
            Event::CollisionPrompt { path, .. } => {
                let answer = tokio::task::spawn_blocking(move || {
                    println!("File already exists: {}", path.display());
                    println!("Overwrite it? (y/n)");
                    let mut line = String::new();
                    let _ = std::io::stdin().read_line(&mut line);
                    line.trim().eq_ignore_ascii_case("y")
                })
                .await?;
                manager.provide_collision_decision(job, answer);
            }
            Event::Terminal { job: id, outcome } if id == job => break outcome,
            Event::Terminal { .. } => {}
        }
    };

    scheduler.abort();
    let _ = scheduler.await;

    match outcome {
        Outcome::Succeeded { final_path } => {
            println!("Done: {}", final_path.display());
            Ok(())
        }
        Outcome::Skipped => {
            println!("Skipped (file exists).");
            Ok(())
        }
        Outcome::Cancelled(reason) => bail!("cancelled: {reason:?}"),
        Outcome::Failed { kind, message } => bail!("failed ({kind:?}): {message}"),
    }
}
