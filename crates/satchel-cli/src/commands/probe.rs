use serde::Serialize;

use satchel_core::sync::{ConnectivityProber, NetworkInfo, QualityReport};
use satchel_core::SatchelConfig;

use crate::commands::common::{connect_remote, format_sync_timestamp};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct ProbeItem {
    pub online: bool,
    pub network: NetworkInfo,
    pub quality: Option<QualityReport>,
}

pub async fn run_probe(
    with_quality: bool,
    as_json: bool,
    config: &SatchelConfig,
) -> Result<(), CliError> {
    let remote = connect_remote(config).await?;
    let prober = ConnectivityProber::new(config.prober.clone(), remote);

    let online = prober.check_connectivity().await;
    let network = prober.network_info().await;
    let quality = if with_quality {
        Some(prober.test_connection_quality().await)
    } else {
        None
    };
    prober.cleanup().await;

    let item = ProbeItem {
        online,
        network,
        quality,
    };
    if as_json {
        println!("{}", serde_json::to_string_pretty(&item)?);
        return Ok(());
    }

    for line in format_probe_lines(&item) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_probe_lines(item: &ProbeItem) -> Vec<String> {
    let mut lines = vec![format!("Status:   {}", item.network.status)];
    if let Some(probe) = item.network.answered_by {
        lines.push(format!("Probe:    {probe}"));
    }
    if let Some(latency) = item.network.latency_ms {
        lines.push(format!("Latency:  {latency} ms"));
    }
    if let Some(checked_at) = item.network.last_checked_at {
        lines.push(format!("Checked:  {}", format_sync_timestamp(checked_at)));
    }
    if let Some(quality) = &item.quality {
        lines.push(format!("Quality:  {}", quality.quality));
    }
    lines
}
