use anyhow::{bail, Result};

use crate::config::Config;
use crate::pipeline::{PipelineContext, Step};
use crate::runner::{parse_terminal_line, SyncRunner};

/// Run `step` through a local [`SyncRunner`] and print its stream to stdout.
///
/// Ctrl-C requests cancellation; the run then ends with a `cancelled`
/// terminal line. Returns an error unless the run succeeded.
pub async fn run_sync(config: &Config, step: Step) -> Result<()> {
    let ctx = PipelineContext::open(config).await?;
    let runner = SyncRunner::new(ctx);
    let mut session = runner.start(step)?;

    let mut terminal = None;
    let mut interrupted = false;
    loop {
        tokio::select! {
            line = session.next_line() => match line {
                Some(line) => {
                    println!("{}", line);
                    if line.starts_with("done ") {
                        terminal = Some(line);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("interrupt received, cancelling {}", step);
                runner.cancel();
            }
        }
    }

    match terminal.as_deref().and_then(parse_terminal_line) {
        Some((status, _)) if status == "succeeded" => Ok(()),
        Some((status, summary)) => bail!("sync {} {} ({})", step, status, summary),
        None => bail!("sync {} ended without a result", step),
    }
}
