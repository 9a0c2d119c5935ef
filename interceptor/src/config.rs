// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fs;
use std::io;
use std::path::Path;

use pnet_base::MacAddr;
use serde::Deserialize;

use crate::Error;

/// The JSON shape of `config.json`. Converted into [`Config`] after parsing
/// so the rest of the daemon only ever sees validated, typed values.
#[derive(Debug, Deserialize)]
struct RawConfig {
    egress_if: RawEgressIf,
    sniff_if: RawSniffIf,
}

#[derive(Debug, Deserialize)]
struct RawEgressIf {
    ifname: String,
    dst_mac: String,
}

#[derive(Debug, Deserialize)]
struct RawSniffIf {
    ifname: String,
}

/// Where forged frames leave the host, and the L2 next hop they are
/// addressed to. The host is off-path for routing, so the next hop (usually
/// the upstream gateway) must be configured rather than discovered.
#[derive(Debug, Clone)]
pub struct EgressConfig {
    pub ifname: String,
    pub dst_mac: MacAddr,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub egress: EgressConfig,
    pub sniff_ifname: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        parse(&read_config_file(path)?)
    }
}

/// Read a configuration file, distinguishing a missing file from other I/O
/// failures so startup can report it as such.
pub(crate) fn read_config_file(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::ConfigMissing(path.to_path_buf())
        } else {
            Error::Io(e)
        }
    })
}

fn parse(text: &str) -> Result<Config, Error> {
    let raw: RawConfig =
        serde_json::from_str(text).map_err(|e| Error::ConfigMalformed(format!("config: {e}")))?;

    let dst_mac = raw.egress_if.dst_mac.parse::<MacAddr>().map_err(|e| {
        Error::ConfigMalformed(format!(
            "config: bad dst_mac '{}': {e}",
            raw.egress_if.dst_mac
        ))
    })?;

    Ok(Config {
        egress: EgressConfig {
            ifname: raw.egress_if.ifname,
            dst_mac,
        },
        sniff_ifname: raw.sniff_if.ifname,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_config() {
        let config = parse(
            r#"{
                "egress_if": {"ifname": "eth1", "dst_mac": "aa:bb:cc:dd:ee:ff"},
                "sniff_if": {"ifname": "eth2"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.egress.ifname, "eth1");
        assert_eq!(
            config.egress.dst_mac,
            MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff)
        );
        assert_eq!(config.sniff_ifname, "eth2");
    }

    #[test]
    fn bad_mac_is_malformed() {
        let res = parse(
            r#"{
                "egress_if": {"ifname": "eth1", "dst_mac": "not-a-mac"},
                "sniff_if": {"ifname": "eth2"}
            }"#,
        );
        assert!(matches!(res, Err(Error::ConfigMalformed(_))));
    }

    #[test]
    fn missing_field_is_malformed() {
        let res = parse(r#"{"sniff_if": {"ifname": "eth2"}}"#);
        assert!(matches!(res, Err(Error::ConfigMalformed(_))));
    }

    #[test]
    fn missing_file_is_reported_as_such() {
        let res = Config::load(Path::new("/nonexistent/interceptor/config.json"));
        assert!(matches!(res, Err(Error::ConfigMissing(_))));
    }
}
