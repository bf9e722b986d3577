use anyhow::{bail, Context as _, Result};
use futures::future::join_all;
use serde_json::json;
use snapvisor_core::{
    ExecutionError, ExecutionService, ExecutionServiceConfig, ProcessBackend,
    ProcessBackendConfig, SnapExecutionData, SnapRpcRequest,
};
use std::time::Instant;
use sysinfo::{Pid, System};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("snapvisor_core=info,xtask=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(());
    };

    match cmd.as_str() {
        "smoke" => cmd_smoke(args.collect()),
        "perf" => cmd_perf(args.collect()),
        "help" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => {
            print_help();
            bail!("unknown xtask command: {other}");
        }
    }
}

fn print_help() {
    eprintln!(
        r#"xtask (snapvisor)

Commands:
  smoke   Execute one snap against the worker, call it, terminate it
  perf    Start many snaps concurrently and print lifecycle timings

Options (both commands):
  --worker PATH   Worker binary (default: cargo run -q -p snapvisor-worker)
  --init-timeout-ms N

Examples:
  cargo run -p xtask -- smoke
  cargo run -p xtask -- perf --snaps 32 --iterations 20 --worker target/debug/snapvisor-worker
"#
    );
}

struct CommonArgs {
    worker: Option<String>,
    init_timeout_ms: u64,
}

impl CommonArgs {
    fn backend(&self) -> ProcessBackend {
        let config = match &self.worker {
            Some(path) => ProcessBackendConfig::new(path.clone(), Vec::new()),
            None => ProcessBackendConfig::new(
                "cargo",
                ["run", "-q", "-p", "snapvisor-worker", "--"]
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            ),
        };
        ProcessBackend::new(config)
    }

    fn service_config(&self) -> ExecutionServiceConfig {
        ExecutionServiceConfig {
            init_timeout_ms: self.init_timeout_ms,
            ..ExecutionServiceConfig::default()
        }
    }

    /// Consumes a shared option. Returns `false` for args it does not know.
    fn accept(
        &mut self,
        arg: &str,
        it: &mut impl Iterator<Item = String>,
    ) -> Result<bool> {
        match arg {
            "--worker" => self.worker = Some(it.next().context("--worker requires a value")?),
            "--init-timeout-ms" => {
                let raw = it.next().context("--init-timeout-ms requires a value")?;
                self.init_timeout_ms = raw
                    .parse::<u64>()
                    .with_context(|| format!("invalid --init-timeout-ms: {raw}"))?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl Default for CommonArgs {
    fn default() -> Self {
        Self {
            worker: None,
            init_timeout_ms: ExecutionServiceConfig::default().init_timeout_ms,
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}

fn rpc(method: &str) -> SnapRpcRequest {
    SnapRpcRequest {
        origin: "xtask".to_string(),
        handler: "onRpcRequest".to_string(),
        request: json!({ "method": method }),
    }
}

fn cmd_smoke(args: Vec<String>) -> Result<()> {
    let mut common = CommonArgs::default();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        if !common.accept(&arg, &mut it)? {
            bail!("unknown smoke arg: {arg}");
        }
    }

    runtime()?.block_on(async {
        let service = ExecutionService::new(common.backend(), common.service_config());

        let started = Instant::now();
        let result = service
            .execute_snap(SnapExecutionData::new("A", "module.exports = {}", Vec::new()))
            .await
            .context("execute snap A")?;
        if result != json!("OK") {
            bail!("executeSnap returned {result}");
        }
        let execute_ms = started.elapsed().as_millis();

        let pong = service
            .handle_rpc_request("A", rpc("ping"))
            .await
            .context("rpc ping")?;
        if pong != json!("pong") {
            bail!("rpc ping returned {pong}");
        }

        service.terminate_snap("A").await;
        match service.handle_rpc_request("A", rpc("ping")).await {
            Err(ExecutionError::NotRunning { .. }) => {}
            Err(other) => bail!("unexpected error after terminate: {other}"),
            Ok(value) => bail!("rpc after terminate returned {value}"),
        }

        println!("smoke:");
        println!("  execute_ms: {execute_ms}");
        println!("  rpc_ping: {pong}");
        println!("  terminated: true");
        Ok::<(), anyhow::Error>(())
    })
}

struct PerfArgs {
    common: CommonArgs,
    snaps: usize,
    iterations: usize,
}

fn parse_perf_args(args: Vec<String>) -> Result<PerfArgs> {
    let mut common = CommonArgs::default();
    let mut snaps: usize = 8;
    let mut iterations: usize = 20;
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        if common.accept(&arg, &mut it)? {
            continue;
        }
        match arg.as_str() {
            "--snaps" => {
                let raw = it.next().context("--snaps requires a value")?;
                snaps = raw
                    .parse::<usize>()
                    .with_context(|| format!("invalid --snaps: {raw}"))?;
            }
            "--iterations" => {
                let raw = it.next().context("--iterations requires a value")?;
                iterations = raw
                    .parse::<usize>()
                    .with_context(|| format!("invalid --iterations: {raw}"))?;
            }
            other => bail!("unknown perf arg: {other}"),
        }
    }
    if snaps == 0 {
        bail!("--snaps must be at least 1");
    }
    Ok(PerfArgs {
        common,
        snaps,
        iterations,
    })
}

fn cmd_perf(args: Vec<String>) -> Result<()> {
    let args = parse_perf_args(args)?;

    runtime()?.block_on(async {
        let service = ExecutionService::new(args.common.backend(), args.common.service_config());
        let snap_ids: Vec<String> = (0..args.snaps).map(|i| format!("perf:{i:04}")).collect();

        let start_all = Instant::now();
        let starts = snap_ids.iter().map(|snap_id| {
            let service = service.clone();
            let data = SnapExecutionData::new(snap_id.clone(), "module.exports = {}", Vec::new());
            tokio::spawn(async move { service.execute_snap(data).await })
        });
        let mut failed = 0usize;
        for outcome in join_all(starts).await {
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    failed += 1;
                    tracing::warn!(error = %err, tag = err.as_tag(), "snap failed to start");
                }
                Err(err) => {
                    failed += 1;
                    tracing::warn!(error = %err, "start task failed");
                }
            }
        }
        let start_all_ms = start_all.elapsed().as_millis();

        let mut rpc_samples = Vec::with_capacity(args.iterations);
        if let Some(first) = service.running_snaps().first() {
            for _ in 0..args.iterations {
                let rpc_start = Instant::now();
                service
                    .handle_rpc_request(first, rpc("ping"))
                    .await
                    .context("rpc ping")?;
                rpc_samples.push(rpc_start.elapsed().as_millis());
            }
        }

        let memory = current_process_memory_kb();
        let running = service.running_snaps().len();

        let terminate_start = Instant::now();
        service.terminate_all_snaps().await;
        let terminate_all_ms = terminate_start.elapsed().as_millis();

        let telemetry = service.telemetry_snapshot();
        println!("perf:");
        println!("  snaps: {}", args.snaps);
        println!("  running: {running}");
        println!("  failed: {failed}");
        println!("  start_all_ms: {start_all_ms}");
        println!("  terminate_all_ms: {terminate_all_ms}");
        if let Some((rss_kb, vmem_kb)) = memory {
            println!("  host_rss_kb: {rss_kb}");
            println!("  host_vmem_kb: {vmem_kb}");
        } else {
            println!("  host_rss_kb: N/A");
            println!("  host_vmem_kb: N/A");
        }
        if !rpc_samples.is_empty() {
            println!("  rpc_samples: {}", rpc_samples.len());
            println!("  rpc_p50_ms: {}", percentile_ms(&rpc_samples, 50.0));
            println!("  rpc_p95_ms: {}", percentile_ms(&rpc_samples, 95.0));
        }
        println!("  spawn_count: {}", telemetry.spawn_count);
        println!("  init_timeout_count: {}", telemetry.init_timeout_count);
        println!(
            "  termination_timeout_count: {}",
            telemetry.termination_timeout_count
        );
        Ok::<(), anyhow::Error>(())
    })
}

fn percentile_ms(samples: &[u128], percentile: f64) -> u128 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();

    let rank = ((percentile / 100.0) * ((sorted.len() - 1) as f64)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn current_process_memory_kb() -> Option<(u64, u64)> {
    let mut system = System::new();
    system.refresh_processes();
    let pid = Pid::from_u32(std::process::id());
    let process = system.process(pid)?;
    Some((process.memory(), process.virtual_memory()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_picks_nearest_rank() {
        let samples = [5, 1, 3, 2, 4];
        assert_eq!(percentile_ms(&samples, 50.0), 3);
        assert_eq!(percentile_ms(&samples, 95.0), 5);
        assert_eq!(percentile_ms(&[], 50.0), 0);
    }

    #[test]
    fn perf_args_parse_shared_and_specific_flags() {
        let args = parse_perf_args(
            ["--snaps", "4", "--worker", "bin/worker", "--iterations", "3"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        )
        .expect("parse perf args");
        assert_eq!(args.snaps, 4);
        assert_eq!(args.iterations, 3);
        assert_eq!(args.common.worker.as_deref(), Some("bin/worker"));
    }

    #[test]
    fn perf_args_reject_unknown_flags() {
        let err = parse_perf_args(vec!["--bogus".to_string()])
            .err()
            .expect("unknown flag rejected");
        assert!(err.to_string().contains("--bogus"));
    }
}
