use crate::scanning::env::{DisplayMode, Environment};
use crate::scanning::error::{ScanError, ScanResult};
use crate::scanning::{IdRange, ProberFactory, ProbingProtocol, SeqRange};
use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

pub mod channel;
pub mod ipv4;

pub use channel::{ChannelConfig, ProbeChannel};

/// The port used for local address discovery.
const DISCOVERY_PORT: u16 = 80;

/// Discover the local `Ipv4Addr` that will be used to communicate with the
/// given target.
///
/// Note that no packets are transmitted by this method.
pub fn discover_local_addr(target: Ipv4Addr) -> ScanResult<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((target, DISCOVERY_PORT))?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(addr) => Ok(addr),
        IpAddr::V6(_) => Err(ScanError::Socket(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "local address is not IPv4",
        ))),
    }
}

/// Builds real probing channels from the environment configuration.
pub struct ChannelFactory<'e> {
    env: &'e Environment,
}

impl<'e> ChannelFactory<'e> {
    #[must_use]
    pub const fn new(env: &'e Environment) -> Self {
        Self { env }
    }

    fn channel_config(&self, ids: IdRange, seqs: SeqRange) -> ChannelConfig {
        let config = self.env.config();
        let round_robin_ports = if config.fixed_flow {
            1
        } else {
            channel::DEFAULT_TCP_UDP_ROUND_ROBIN
        };
        ChannelConfig {
            protocol: config.protocol,
            local_addr: config.local_addr,
            attention_message: config.attention_message.clone(),
            round_robin_ports,
            timeout: config.timeout,
            probe_regulating_period: config.probe_regulating_period,
            id_range: ids,
            seq_range: seqs,
            dest_port: config.udp_dest_port,
            verbose: config.display_mode >= DisplayMode::Debug,
        }
    }
}

impl ProberFactory for ChannelFactory<'_> {
    type Prober = ProbeChannel;

    fn make_prober(&self, ids: IdRange, seqs: SeqRange) -> ScanResult<ProbeChannel> {
        ProbeChannel::new(self.channel_config(ids, seqs))
    }

    fn make_alias_prober(&self, ids: IdRange, seqs: SeqRange) -> ScanResult<ProbeChannel> {
        let mut config = self.channel_config(ids, seqs);
        config.protocol = ProbingProtocol::Udp;
        let mut prober = ProbeChannel::new(config)?;
        prober.use_high_port_number();
        Ok(prober)
    }
}
