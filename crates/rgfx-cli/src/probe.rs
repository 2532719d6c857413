use std::time::{Duration, Instant};

use serde::Serialize;

use rgfx_client::{ClientError, RemoteDevice};
use rgfx_core::config::RgfxConfig;
use rgfx_protocol::types::{BufferDesc, BufferUsage};
use rgfx_protocol::{QueueType, CATALOG_VERSION};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_BYTES: u64 = 256;
const PROBE_FILL: u32 = 0x5A5A_5A5A;

// ── Check result types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: &'static str,
    status: CheckStatus,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl CheckResult {
    fn pass(name: &'static str, message: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, message: message.into(), details: Vec::new() }
    }

    fn fail(name: &'static str, message: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, message: message.into(), details: Vec::new() }
    }

    fn skip(name: &'static str, message: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Skip, message: message.into(), details: Vec::new() }
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }
}

// ── Main entry point ────────────────────────────────────────────────────────

/// Returns false if any check failed.
pub async fn run_probe(config: &RgfxConfig, json: bool) -> bool {
    let mut results = Vec::new();

    let device = check_connect(config, &mut results).await;
    match device {
        Some(device) => {
            check_round_trip(&device, &mut results).await;
            check_metrics(&device, &mut results).await;
            if let Err(e) = device.shutdown().await {
                results.push(CheckResult::fail("Shutdown", e.to_string()));
            }
        }
        None => {
            results.push(CheckResult::skip("Bake round trip", "not connected"));
            results.push(CheckResult::skip("Host metrics", "not connected"));
        }
    }

    if json {
        match serde_json::to_string_pretty(&results) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("cannot encode results: {}", e),
        }
    } else {
        print_results_pretty(&config.client.address, &results);
    }

    !results.iter().any(|r| matches!(r.status, CheckStatus::Fail))
}

// ── Checks ──────────────────────────────────────────────────────────────────

async fn check_connect(config: &RgfxConfig, results: &mut Vec<CheckResult>) -> Option<RemoteDevice> {
    let started = Instant::now();
    match RemoteDevice::connect(config, &config.client.client_name).await {
        Ok(device) => {
            let info = device.info();
            let conn = device.connection();
            results.push(
                CheckResult::pass(
                    "Connect",
                    format!("{} on {} in {:?}", info.device_name, info.host_name, started.elapsed()),
                )
                .detail(format!("Server:      {}", conn.server_name()))
                .detail(format!("Session:     {}", conn.session_id()))
                .detail(format!("Channels:    {}", conn.channel_count()))
                .detail(format!("Platform:    {}", info.platform))
                .detail(format!("Frames:      {} in flight", info.max_frames))
                .detail(format!("Batches:     {} pending max", info.max_pending_batches))
                .detail(format!("Timeline:    {}", info.supports_timeline))
                .detail(format!("Upload block {} bytes", info.upload_block_size)),
            );
            Some(device)
        }
        Err(ClientError::CatalogMismatch { host, client }) => {
            results.push(
                CheckResult::fail("Connect", "record catalog mismatch")
                    .detail(format!("host v{}, this build v{}", host, client)),
            );
            None
        }
        Err(e) => {
            results.push(
                CheckResult::fail("Connect", e.to_string())
                    .detail(format!("address {}", config.client.address)),
            );
            None
        }
    }
}

/// Fill a buffer on the host, read it back through staging and compare.
async fn check_round_trip(device: &RemoteDevice, results: &mut Vec<CheckResult>) {
    let started = Instant::now();
    match round_trip(device).await {
        Ok(data) if data.iter().all(|b| *b == PROBE_FILL as u8) => {
            results.push(CheckResult::pass(
                "Bake round trip",
                format!("{} bytes back in {:?}", data.len(), started.elapsed()),
            ));
        }
        Ok(data) => {
            let first_bad = data.iter().position(|b| *b != PROBE_FILL as u8).unwrap_or(data.len());
            results.push(
                CheckResult::fail("Bake round trip", "readback does not match the fill")
                    .detail(format!("{} bytes, first mismatch at {}", data.len(), first_bad)),
            );
        }
        Err(e) => results.push(CheckResult::fail("Bake round trip", e.to_string())),
    }
}

async fn round_trip(device: &RemoteDevice) -> Result<Vec<u8>, ClientError> {
    device.begin_frame().await?;
    let buffer = device
        .create_buffer(
            BufferDesc::new(PROBE_BYTES, BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST),
            "probe",
        )
        .await?;
    let mut batch = device.create_batch(QueueType::Graphics, "probe", Vec::new()).await?;

    let mut rec = device.recorder();
    rec.transfer("probe").fill_buffer(buffer, 0, PROBE_BYTES, PROBE_FILL);
    let token = rec.readback_buffer(buffer, 0, PROBE_BYTES);
    device.bake(&mut batch, rec).await?;
    device.submit_batch(&batch, true).await?;
    if !device.wait_batch(&batch, PROBE_TIMEOUT).await? {
        return Err(rgfx_core::GfxError::Timeout(PROBE_TIMEOUT).into());
    }
    let data = device.readback(token, PROBE_TIMEOUT).await?;

    device.end_frame().await?;
    device.wait_all(PROBE_TIMEOUT).await?;
    device.release(buffer).await?;
    Ok(data)
}

async fn check_metrics(device: &RemoteDevice, results: &mut Vec<CheckResult>) {
    match (device.metrics().await, device.staging_stat().await) {
        (Ok(m), Ok(s)) => results.push(
            CheckResult::pass(
                "Host metrics",
                format!("{} bakes, {} failed, up {}s", m.bakes_total, m.bakes_failed, m.uptime_secs),
            )
            .detail(format!("Sessions:    {} active, {} total", m.connections_active, m.connections_total))
            .detail(format!("Requests:    {} ({} errors)", m.requests_total, m.errors_total))
            .detail(format!("Staging:     {} B written, {} B read", s.dynamic_write, s.dynamic_read)),
        ),
        (Err(e), _) | (_, Err(e)) => results.push(CheckResult::fail("Host metrics", e.to_string())),
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

fn print_results_pretty(address: &str, results: &[CheckResult]) {
    println!();
    println!("rgfx probe: {} (catalog v{})", address, CATALOG_VERSION);
    println!("==============================");
    println!();

    let mut pass_count = 0u32;
    let mut fail_count = 0u32;

    for result in results {
        let (icon, color_start, color_end) = match result.status {
            CheckStatus::Pass => {
                pass_count += 1;
                ("[PASS]", "\x1b[32m", "\x1b[0m")
            }
            CheckStatus::Fail => {
                fail_count += 1;
                ("[FAIL]", "\x1b[31m", "\x1b[0m")
            }
            CheckStatus::Skip => ("[SKIP]", "\x1b[90m", "\x1b[0m"),
        };

        println!("  {}{}{} {} - {}", color_start, icon, color_end, result.name, result.message);
        for detail in &result.details {
            println!("         {}", detail);
        }
        println!();
    }

    println!("-------------------------------");
    println!("  {} passed, {} failed", pass_count, fail_count);
    println!();
}
