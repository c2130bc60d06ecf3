use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use runpool::config::EngineConfig;
use runpool::engine::Engine;
use runpool::interpreter::{CancelToken, Interpreter, ScriptError};
use runpool::pool::ExecutionContext;
use runpool::stream::{Channel, StreamSink};

/// Demo interpreter for a tiny semicolon-separated command language:
/// `sleep <ms>`, `emit <text>`, `warn <text>`, `fail <text>`.
struct DemoInterpreter;

#[async_trait]
impl Interpreter for DemoInterpreter {
    async fn invoke(
        &self,
        script: &str,
        ctx: &mut ExecutionContext,
        sink: StreamSink,
        cancel: CancelToken,
    ) -> Result<(), ScriptError> {
        for stmt in script.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if cancel.is_cancelled() {
                return Err(ScriptError::Cancelled);
            }
            match stmt.split_once(' ') {
                Some(("sleep", ms)) => {
                    let ms: u64 = ms
                        .parse()
                        .map_err(|_| ScriptError::Failed(format!("bad sleep: {stmt}")))?;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                        _ = cancel.cancelled() => return Err(ScriptError::Cancelled),
                    }
                }
                Some(("emit", text)) => sink.output_text(text).await?,
                Some(("warn", text)) => sink.warning(text).await?,
                Some(("fail", text)) => return Err(ScriptError::Failed(text.to_string())),
                _ => return Err(ScriptError::Failed(format!("unknown statement: {stmt}"))),
            }
        }
        ctx.set_var("last_command", script);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let max: usize = std::env::var("RUNPOOL_MAX_CONCURRENCY")
        .unwrap_or_else(|_| "2".to_string())
        .parse()
        .unwrap_or(2);

    eprintln!("runpool demo v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Pool size: {max}");

    let engine = Engine::open(
        EngineConfig::with_max_concurrency(max),
        Arc::new(DemoInterpreter),
    )?;

    let scripts = [
        "sleep 200; emit first done",
        "sleep 100; warn halfway; emit second done",
        "sleep 50; fail deliberate failure",
    ];
    let mut ids = Vec::new();
    for (i, script) in scripts.iter().enumerate() {
        let name = format!("demo-{i}");
        let id = engine
            .submit(*script, Some(&name), Some("demo"))
            .await?;
        ids.push(id);
    }

    for id in ids {
        let state = engine.wait(id, Some(Duration::from_secs(5))).await?;
        let snap = engine.get(id).await?;
        eprintln!(
            "job {id} ({}): {state}, errors={}",
            snap.name.as_deref().unwrap_or("-"),
            snap.has_errors
        );
        for record in engine.drain(id, Channel::Output).await? {
            eprintln!("   output: {}", record.value);
        }
        for record in engine.drain(id, Channel::Error).await? {
            eprintln!("   error:  {}", record.value);
        }
    }

    engine.shutdown().await;
    Ok(())
}
