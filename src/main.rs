use std::process::ExitCode;

use sluice::{config::Config, error::Error, queue::sqs::SqsQueue, DeadLetterCommand};

async fn start_worker() -> eyre::Result<()> {
    sluice::run()
        .queue_factory(|config: &Config| {
            let queue_url = config.queue_url.clone();
            async move { Ok::<_, Error>(SqsQueue::from_env(queue_url).await) }
        })
        .start()
        .await
        .map(|_| ())
}

async fn start_dead_letters(command: DeadLetterCommand) -> eyre::Result<()> {
    sluice::dead_letters()
        .command(command)
        .queue_factory(|config: &Config| {
            let dead_letter_url = config.dead_letter_destination.clone();
            async move { Ok::<_, Error>(SqsQueue::from_env(dead_letter_url).await) }
        })
        .start()
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let result = match std::env::args().nth(1) {
        None => start_worker().await,
        Some(arg) => match arg.parse::<DeadLetterCommand>() {
            Ok(command) => start_dead_letters(command).await,
            Err(_) => {
                eprintln!("usage: sluice [summarize|redrive]");
                return ExitCode::FAILURE;
            }
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sluice: {e:?}");
            ExitCode::FAILURE
        }
    }
}
