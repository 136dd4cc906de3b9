// Copyright 2023 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A `host:port` pair identifying a process on the cluster.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for HostAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for HostAddr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("failed to parse address: {0}")]
pub struct ParseAddrError(String);

impl FromStr for HostAddr {
    type Err = ParseAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseAddrError(s.to_owned()))?;
        if host.is_empty() {
            return Err(ParseAddrError(s.to_owned()));
        }
        let port = port.parse().map_err(|_| ParseAddrError(s.to_owned()))?;
        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

pub fn is_local_address(server_addr: &HostAddr, peer_addr: &HostAddr) -> bool {
    // We only compare client address, which must be specified,
    // so there is no need to consider loopback and unspecified addresses.
    server_addr == peer_addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_addr() {
        let addr: HostAddr = "compute-0:5688".parse().unwrap();
        assert_eq!(addr.host, "compute-0");
        assert_eq!(addr.port, 5688);
        assert_eq!(addr.to_string(), "compute-0:5688");

        assert!("no-port".parse::<HostAddr>().is_err());
        assert!(":5688".parse::<HostAddr>().is_err());
        assert!("host:not-a-port".parse::<HostAddr>().is_err());
    }

    #[test]
    fn test_is_local_address() {
        let check_local = |a: &str, b: &str, result: bool| {
            assert_eq!(
                is_local_address(&a.parse().unwrap(), &b.parse().unwrap()),
                result
            );
        };
        check_local("127.0.0.1:3456", "127.0.0.1:3456", true);
        check_local("10.11.12.13:3456", "10.11.12.13:3456", true);
        check_local("10.11.12.13:3456", "0.0.0.0:3456", false);
        check_local("10.11.12.13:3456", "10.11.12.13:3467", false);
    }
}
