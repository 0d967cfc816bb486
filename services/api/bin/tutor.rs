//! Interactive command-line tutor.
//!
//! Runs one tutoring session in the terminal against the same stack and
//! history store as the API service.

use anyhow::Context;
use clap::Parser;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tutor_api::{config::Config, db::connect_history_store, sessions::HostedSession};
use tutor_core::{
    augment::Segment,
    session::{Intent, Reply, SessionError},
    stack::TutorStack,
};

#[derive(Parser, Debug)]
#[command(version, about = "Learn a topic step by step, with visual aids")]
struct Args {
    /// Topic to learn; asked interactively when omitted.
    #[arg(short, long)]
    topic: Option<String>,

    /// Generation provider, overriding LLM_PROVIDER.
    #[arg(short, long, value_parser = ["openai", "gemini", "mock"])]
    provider: Option<String>,
}

fn prompt(text: &str) -> anyhow::Result<()> {
    print!("{text}");
    std::io::stdout().flush()?;
    Ok(())
}

/// Next line of input, or `None` at end of input.
async fn read_line(lines: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<Option<String>> {
    Ok(lines.next_line().await?)
}

fn render(reply: &Reply) {
    if let Some(plan) = &reply.plan {
        println!("\nHere is your lesson plan:");
        for (i, part) in plan.iter().enumerate() {
            println!("  {}. {}", i + 1, part);
        }
        println!();
    }
    for segment in &reply.segments {
        match segment {
            Segment::Text { content } => print!("{content}"),
            Segment::Image { query, result } => {
                println!("\n[Visual Aid] Searching for: {query}");
                match result {
                    Some(found) => println!("Found: {} (Score: {:.4})", found.path, found.score),
                    None => println!("No suitable image found."),
                }
            }
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.provider {
        Some(provider) => Config::from_env_with_provider(provider),
        None => Config::from_env(),
    }
    .context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let history = connect_history_store(config.database_url.as_deref()).await?;
    let stack = TutorStack::build(&config.stack_settings())
        .await
        .context("Failed to build tutoring stack")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Welcome to the AI Tutor!");

    let mut topic = args.topic.unwrap_or_default();
    while topic.trim().is_empty() {
        prompt("What topic would you like to learn about today? ")?;
        match read_line(&mut lines).await? {
            Some(line) if Intent::parse(&line) == Intent::Stop => return Ok(()),
            Some(line) => topic = line,
            None => return Ok(()),
        }
    }

    let mut hosted = HostedSession::new(stack.new_session(), history);
    println!("\nPlanning a course on '{}'...", topic.trim());
    match hosted.session.start(&topic).await {
        Ok(reply) => {
            render(&reply);
            hosted.record(&reply).await;
        }
        Err(SessionError::Generation(e)) => {
            eprintln!("The tutor could not explain this part right now: {e}");
            hosted.record_progress().await;
        }
        Err(e) => return Err(e.into()),
    }

    while !hosted.session.state().is_terminal() {
        prompt("\nAny questions? (type 'next' to continue, 'stop' to quit): ")?;
        let input = read_line(&mut lines).await?.unwrap_or_else(|| "stop".to_string());
        match hosted.session.handle_input(&input).await {
            Ok(reply) => {
                render(&reply);
                hosted.record(&reply).await;
            }
            Err(SessionError::Generation(e)) => {
                eprintln!("The tutor could not respond right now ({e}). Please try again.");
                hosted.record_progress().await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(id) = hosted.history_id() {
        println!("Lesson saved as {id}.");
    }
    Ok(())
}
