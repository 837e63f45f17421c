//! Integration tests for process-backed execution units.
//!
//! The success path drives the real `pixpress unit` binary; the crash path
//! uses a shell script that announces itself and dies on its first request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use pixpress::JobError;
use pixpress::codec::CodecRegistry;
use pixpress::config::{EngineConfig, PoolKind, RetryPolicy};
use pixpress::engine::{AddOptions, Engine, JobStatus, ProcessUnitCommand};
use serde_json::json;

fn process_engine(command: ProcessUnitCommand, concurrency: usize) -> Engine {
    let config = EngineConfig {
        concurrency,
        pool_kind: PoolKind::Process,
        queue_max: 16,
        job_timeout_ms: 30_000,
        retry: RetryPolicy::disabled(),
        process_command: Some(command),
    };
    // Process units build their own registry; this one is unused.
    Engine::start(config, Arc::new(CodecRegistry::new())).expect("engine should start")
}

fn unit_binary() -> ProcessUnitCommand {
    ProcessUnitCommand::new(env!("CARGO_BIN_EXE_pixpress")).arg("unit")
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_unit_binary_compresses_png() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("gradient.png");
    RgbImage::from_fn(48, 24, |x, y| Rgb([(x * 5) as u8, (y * 10) as u8, 200]))
        .save(&input)
        .unwrap();

    let engine = process_engine(unit_binary(), 2);
    wait_until(|| engine.pool().idle_count() == 2).await;

    let admitted = engine
        .submit(
            "png",
            json!({ "input_path": input, "process_options": { "resize_width": 24 } }),
            AddOptions::default(),
        )
        .unwrap();
    let result = admitted.handle.wait().await.expect("png job should succeed");

    assert_eq!(result["width"], 24);
    assert_eq!(result["height"], 12);
    let output = result["output_path"].as_str().unwrap();
    assert!(output.ends_with("gradient.min.png"));
    assert!(std::path::Path::new(output).exists());

    let state = engine.get_state(&admitted.job_id).unwrap();
    assert_eq!(state.status, JobStatus::Succeeded);
    assert_eq!(state.attempts, 1);

    engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_unit_binary_reports_unsupported_kind() {
    let engine = process_engine(unit_binary(), 1);

    let admitted = engine
        .submit("gif", json!({}), AddOptions::default())
        .unwrap();
    assert_eq!(
        admitted.handle.wait().await,
        Err(JobError::Execution("Unsupported task kind: gif".into()))
    );

    let state = engine.get_state(&admitted.job_id).unwrap();
    assert_eq!(state.status, JobStatus::Failed);
    assert_eq!(state.error.as_deref(), Some("Unsupported task kind: gif"));

    engine.shutdown(Duration::from_secs(5)).await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_crashed_unit_fails_job_and_is_replaced() {
    let crashing = ProcessUnitCommand::new("sh")
        .arg("-c")
        .arg(r#"echo '{"type":"ready"}'; read line; exit 3"#);
    let engine = process_engine(crashing, 2);
    wait_until(|| engine.pool().live_count() == 2 && engine.pool().idle_count() == 2).await;

    let admitted = engine
        .submit("png", json!({}), AddOptions::default())
        .unwrap();
    let outcome = admitted.handle.wait().await;
    assert!(matches!(outcome, Err(JobError::UnitCrashed(_))), "{outcome:?}");
    assert_eq!(
        engine.get_state(&admitted.job_id).unwrap().status,
        JobStatus::Failed
    );

    // The pool returns to its configured size.
    wait_until(|| engine.pool().live_count() == 2 && engine.pool().idle_count() == 2).await;

    engine.shutdown(Duration::from_secs(5)).await;
}
