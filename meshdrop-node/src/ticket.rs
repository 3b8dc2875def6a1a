//! Join tickets: `peerId@host:port`, printed by the coordinator and passed to `join`.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use meshdrop_core::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub peer: PeerId,
    pub addr: SocketAddr,
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer, self.addr)
    }
}

impl FromStr for Ticket {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (peer, host) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| anyhow!("ticket must look like <peer>@<host>:<port>"))?;
        if peer.is_empty() {
            bail!("ticket has an empty peer id");
        }
        let addr = match host.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => host
                .to_socket_addrs()
                .with_context(|| format!("cannot resolve {}", host))?
                .next()
                .ok_or_else(|| anyhow!("no address for {}", host))?,
        };
        Ok(Ticket {
            peer: PeerId::new(peer),
            addr,
        })
    }
}
