use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::client::MinerControl;
use super::MinerFleet;
use crate::domain::MinerHost;

/// Network-wide miner discovery: TCP-probe the configured CIDR on the miner
/// management port and add every host that answers a status query. Known
/// hosts are never removed.
pub struct MinerDiscovery {
    fleet: Arc<MinerFleet>,
    control: Arc<dyn MinerControl>,
    network: String,
    port: u16,
    probe_timeout: Duration,
    concurrent_probes: usize,
}

impl MinerDiscovery {
    pub fn new(
        fleet: Arc<MinerFleet>,
        control: Arc<dyn MinerControl>,
        network: String,
        port: u16,
    ) -> Self {
        Self {
            fleet,
            control,
            network,
            port,
            probe_timeout: Duration::from_millis(200),
            concurrent_probes: 100,
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// One full scan. Returns the number of newly discovered miners.
    pub async fn scan(&self) -> Result<usize> {
        let ips = parse_cidr(&self.network)?;
        debug!(network = %self.network, candidates = ips.len(), "scanning for miners");

        let mut open = Vec::new();
        for chunk in ips.chunks(self.concurrent_probes) {
            let mut probes = Vec::with_capacity(chunk.len());
            for &ip in chunk {
                let addr = SocketAddr::new(ip, self.port);
                let probe_timeout = self.probe_timeout;
                probes.push(tokio::spawn(async move {
                    match timeout(probe_timeout, TcpStream::connect(addr)).await {
                        Ok(Ok(_)) => Some(addr),
                        _ => None,
                    }
                }));
            }
            for probe in futures::future::join_all(probes).await {
                if let Ok(Some(addr)) = probe {
                    open.push(addr);
                }
            }
        }

        let mut added = 0usize;
        for addr in open {
            match self.control.status(addr).await {
                Ok(status) => {
                    let host = MinerHost::new(addr, &status, Utc::now());
                    if self.fleet.insert_if_absent(host).await {
                        info!(%addr, state = %status.state, "discovered miner");
                        added += 1;
                    }
                }
                Err(err) => {
                    debug!(%addr, error = %err, "open port is not a miner");
                }
            }
        }

        if added > 0 {
            let total = self.fleet.len().await;
            info!(added, total, "miner discovery finished");
        }
        Ok(added)
    }
}

/// Expand IPv4 CIDR notation, skipping the network and broadcast addresses.
fn parse_cidr(cidr: &str) -> Result<Vec<IpAddr>> {
    let (base, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("invalid CIDR notation {cidr:?}"))?;
    let base_ip: IpAddr = base.parse()?;
    let prefix_len: u32 = prefix.parse()?;

    match base_ip {
        IpAddr::V4(ipv4) => {
            anyhow::ensure!(
                (1..=32).contains(&prefix_len),
                "prefix length {prefix_len} out of range"
            );
            let base = u32::from(ipv4);
            let mask = if prefix_len == 32 {
                u32::MAX
            } else {
                !((1u32 << (32 - prefix_len)) - 1)
            };
            let network = base & mask;
            let broadcast = network | !mask;

            let mut ips = Vec::new();
            for i in (network + 1)..broadcast {
                ips.push(IpAddr::V4(i.into()));
            }
            Ok(ips)
        }
        IpAddr::V6(_) => anyhow::bail!("IPv6 scan ranges are not supported"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_expansion_skips_network_and_broadcast() {
        let ips = parse_cidr("192.168.1.0/30").unwrap();
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0].to_string(), "192.168.1.1");
        assert_eq!(ips[1].to_string(), "192.168.1.2");
    }

    #[test]
    fn a_24_network_has_254_hosts() {
        assert_eq!(parse_cidr("10.0.0.0/24").unwrap().len(), 254);
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("10.0.0.0/40").is_err());
        assert!(parse_cidr("fe80::/64").is_err());
    }

    #[tokio::test]
    async fn scan_adds_answering_miners_once() {
        use crate::miners::TcpMinerClient;
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

        // Fake miner answering every connection with a status document.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut reader = tokio::io::BufReader::new(stream);
                    let mut line = String::new();
                    let _ = reader.read_line(&mut line).await;
                    let mut stream = reader.into_inner();
                    let _ = stream
                        .write_all(br#"{"state":"mining","mode":"eco","fan_r":55.0}"#)
                        .await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        let fleet = Arc::new(MinerFleet::new());
        let control: Arc<dyn MinerControl> =
            Arc::new(TcpMinerClient::new(Duration::from_secs(2)));
        // 127.0.0.0/30 probes 127.0.0.1 and 127.0.0.2.
        let discovery = MinerDiscovery::new(fleet.clone(), control, "127.0.0.0/30".into(), port)
            .with_probe_timeout(Duration::from_millis(500));

        assert_eq!(discovery.scan().await.unwrap(), 1);
        assert_eq!(fleet.len().await, 1);
        // A rescan finds the same miner and adds nothing.
        assert_eq!(discovery.scan().await.unwrap(), 0);
        assert_eq!(fleet.len().await, 1);
    }
}
